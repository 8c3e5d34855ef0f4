//! Scheduler tunables.

use crate::error::{SchedulerError, SchedulerResult};
use serde::{Deserialize, Serialize};
use tessel_gpu::DeviceInfo;

/// Tunable constants of the persistent heuristics.
///
/// The defaults reproduce the tuned values; deserializing a partial
/// document overrides only the fields it names.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerOptions {
    /// Threads per block held fixed by the outer-grid launch search.
    pub outer_grid_threads_per_block: i64,
    /// Smallest blockDim.x the outer-grid launch search may use.
    pub min_bdimx: i64,
    /// Largest blockDim.x the outer-grid launch search starts from.
    pub max_bdimx: i64,
    /// Share of the full register file a combined inner/outer kernel may
    /// fill when projecting persistent buffers to narrower inputs.
    pub inner_outer_register_relaxation: f64,
    /// Registers per thread reserved for indexing and other bookkeeping.
    pub register_overhead: i64,
    /// Hardware limit of registers per thread.
    pub max_registers_per_thread: i64,
    /// Bytes held by one register.
    pub bytes_per_register: i64,
    /// Widest vector access in bytes.
    pub max_vector_bytes: i64,
    /// A reduction at least this many times the per-SM thread limit is
    /// considered deep.
    pub iter_size_reduction_multiplier: i64,
    /// Deep reductions need at least `SM count / this` iterations.
    pub iter_size_sm_divisor: i64,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            outer_grid_threads_per_block: 256,
            min_bdimx: 8,
            max_bdimx: 16,
            inner_outer_register_relaxation: 1.1,
            register_overhead: 40,
            max_registers_per_thread: 255,
            bytes_per_register: 4,
            max_vector_bytes: 16,
            iter_size_reduction_multiplier: 4,
            iter_size_sm_divisor: 8,
        }
    }
}

impl SchedulerOptions {
    /// Full register file of one multiprocessor, in bytes.
    #[must_use]
    pub fn register_file_size_full(&self, device: &DeviceInfo) -> i64 {
        i64::from(device.registers_per_multiprocessor) * self.bytes_per_register
    }

    /// Register bytes the persistent heuristics may fill with buffers.
    ///
    /// Half of the file stays available for everything else the kernel
    /// keeps in registers.
    #[must_use]
    pub fn register_file_size(&self, device: &DeviceInfo) -> i64 {
        self.register_file_size_full(device) / 2
    }

    /// Register bytes a combined inner/outer kernel may fill when it
    /// projects buffers to inputs.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    pub fn relaxed_register_file_size(&self, device: &DeviceInfo) -> i64 {
        (self.register_file_size_full(device) as f64 * self.inner_outer_register_relaxation) as i64
    }

    /// Registers per thread left for persistent buffers.
    #[must_use]
    pub const fn buffer_registers_per_thread(&self) -> i64 {
        self.max_registers_per_thread - self.register_overhead
    }

    /// Checks every tunable the heuristics divide by or size blocks from.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::InvalidOption` naming the first bad field.
    pub fn validate(&self) -> SchedulerResult<()> {
        let invalid = |field: &'static str, reason: &'static str| -> SchedulerResult<()> {
            Err(SchedulerError::InvalidOption { field, reason })
        };
        if self.outer_grid_threads_per_block <= 0 {
            return invalid("outer_grid_threads_per_block", "must be positive");
        }
        if self.min_bdimx <= 0 || self.min_bdimx > self.max_bdimx {
            return invalid("min_bdimx", "must be positive and at most max_bdimx");
        }
        if self.max_bdimx > self.outer_grid_threads_per_block {
            return invalid("max_bdimx", "must not exceed outer_grid_threads_per_block");
        }
        let relaxation = self.inner_outer_register_relaxation;
        if !(relaxation.is_finite() && relaxation > 0.0) {
            return invalid("inner_outer_register_relaxation", "must be a positive number");
        }
        if self.register_overhead < 0 || self.buffer_registers_per_thread() <= 0 {
            return invalid("register_overhead", "must leave registers for persistent buffers");
        }
        if self.bytes_per_register <= 0 {
            return invalid("bytes_per_register", "must be positive");
        }
        if self.max_vector_bytes <= 0 {
            return invalid("max_vector_bytes", "must be positive");
        }
        if self.iter_size_reduction_multiplier <= 0 {
            return invalid("iter_size_reduction_multiplier", "must be positive");
        }
        if self.iter_size_sm_divisor <= 0 {
            return invalid("iter_size_sm_divisor", "must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_budgets() {
        let opts = SchedulerOptions::default();
        let device = DeviceInfo::mock();
        assert_eq!(opts.register_file_size_full(&device), 256 * 1024);
        assert_eq!(opts.register_file_size(&device), 128 * 1024);
        assert_eq!(opts.relaxed_register_file_size(&device), 288_358);
        assert_eq!(opts.buffer_registers_per_thread(), 215);
    }

    #[test]
    fn test_validate() {
        assert!(SchedulerOptions::default().validate().is_ok());

        let zero_block: SchedulerOptions =
            serde_json::from_str(r#"{ "outer_grid_threads_per_block": 0 }"#).unwrap();
        assert_eq!(
            zero_block.validate(),
            Err(SchedulerError::InvalidOption {
                field: "outer_grid_threads_per_block",
                reason: "must be positive",
            })
        );

        let inverted = SchedulerOptions {
            min_bdimx: 32,
            ..SchedulerOptions::default()
        };
        assert!(matches!(
            inverted.validate(),
            Err(SchedulerError::InvalidOption { field: "min_bdimx", .. })
        ));

        let no_registers = SchedulerOptions {
            register_overhead: 255,
            ..SchedulerOptions::default()
        };
        assert!(no_registers.validate().is_err());
    }

    #[test]
    fn test_partial_override() {
        let opts: SchedulerOptions =
            serde_json::from_str(r#"{ "inner_outer_register_relaxation": 1.0 }"#).unwrap();
        assert!((opts.inner_outer_register_relaxation - 1.0).abs() < f64::EPSILON);
        assert_eq!(opts.max_bdimx, 16);
    }
}
