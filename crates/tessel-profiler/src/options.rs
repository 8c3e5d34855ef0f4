//! Profiler configuration.

use serde::{Deserialize, Serialize};

/// Resolved profiling flags and activity buffer geometry.
///
/// Flags arrive already resolved; nothing here reads the environment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilerOptions {
    /// Include device names and peak bandwidth in the rendered report.
    pub verbose: bool,
    /// Correlate hardware kernel records to segments. When off, kernel
    /// time comes from host timers around each launch.
    pub kernel_profiling: bool,
    /// Bytes per activity buffer.
    pub buffer_size: usize,
    /// Alignment of activity records within a buffer.
    pub buffer_alignment: usize,
}

impl Default for ProfilerOptions {
    fn default() -> Self {
        Self {
            verbose: false,
            kernel_profiling: true,
            buffer_size: 8 * 1024 * 1024,
            buffer_alignment: 8,
        }
    }
}

impl ProfilerOptions {
    /// Options with the verbose report enabled.
    #[must_use]
    pub fn verbose() -> Self {
        Self {
            verbose: true,
            ..Self::default()
        }
    }

    /// Rounds `size` up to the record alignment.
    #[must_use]
    pub fn aligned(&self, size: usize) -> usize {
        let align = self.buffer_alignment.max(1);
        size.div_ceil(align) * align
    }
}
