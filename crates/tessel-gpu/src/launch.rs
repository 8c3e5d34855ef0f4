//! Kernel launch parameters.
//!
//! Heuristics fill in only the dimensions they care about; the rest stay
//! unbound and are inferred by the lowering stage from the parallelized
//! extents of the scheduled tensors.
//!
//! ```rust,ignore
//! let params = LaunchParams::default().with_block(16, 16).with_grid(27, 4);
//! assert_eq!(params.threads_per_block(), Some(256));
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Grid and block dimensions for one kernel launch.
///
/// `None` marks a dimension the scheduler left unbound.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchParams {
    /// Blocks in x.
    pub gdimx: Option<u32>,
    /// Blocks in y.
    pub gdimy: Option<u32>,
    /// Blocks in z.
    pub gdimz: Option<u32>,
    /// Threads per block in x.
    pub bdimx: Option<u32>,
    /// Threads per block in y.
    pub bdimy: Option<u32>,
    /// Threads per block in z.
    pub bdimz: Option<u32>,
    /// Dynamic shared memory size in bytes.
    pub smem: usize,
}

impl LaunchParams {
    /// Bind blockDim.x and blockDim.y.
    #[must_use]
    pub const fn with_block(mut self, bdimx: u32, bdimy: u32) -> Self {
        self.bdimx = Some(bdimx);
        self.bdimy = Some(bdimy);
        self
    }

    /// Bind gridDim.x and gridDim.y.
    #[must_use]
    pub const fn with_grid(mut self, gdimx: u32, gdimy: u32) -> Self {
        self.gdimx = Some(gdimx);
        self.gdimy = Some(gdimy);
        self
    }

    /// Set dynamic shared memory size.
    #[must_use]
    pub const fn with_shared_mem(mut self, bytes: usize) -> Self {
        self.smem = bytes;
        self
    }

    /// Threads per block, if every block dimension that matters is bound.
    ///
    /// Unbound dimensions other than x count as 1.
    #[must_use]
    pub fn threads_per_block(&self) -> Option<u32> {
        let x = self.bdimx?;
        Some(x * self.bdimy.unwrap_or(1) * self.bdimz.unwrap_or(1))
    }

    /// Total number of blocks, if gridDim.x is bound.
    #[must_use]
    pub fn total_blocks(&self) -> Option<u64> {
        let x = u64::from(self.gdimx?);
        Some(x * u64::from(self.gdimy.unwrap_or(1)) * u64::from(self.gdimz.unwrap_or(1)))
    }
}

impl fmt::Display for LaunchParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dim = |d: Option<u32>| d.map_or_else(|| "-".to_string(), |v| v.to_string());
        write!(
            f,
            "grid({}, {}, {}) block({}, {}, {}) smem {}",
            dim(self.gdimx),
            dim(self.gdimy),
            dim(self.gdimz),
            dim(self.bdimx),
            dim(self.bdimy),
            dim(self.bdimz),
            self.smem
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_params_threads() {
        let params = LaunchParams::default().with_block(32, 8).with_grid(10, 20);
        assert_eq!(params.threads_per_block(), Some(256));
        assert_eq!(params.total_blocks(), Some(200));
    }

    #[test]
    fn test_unbound_dims() {
        let params = LaunchParams::default();
        assert_eq!(params.threads_per_block(), None);
        assert_eq!(params.total_blocks(), None);
        assert_eq!(
            params.to_string(),
            "grid(-, -, -) block(-, -, -) smem 0"
        );
    }

    #[test]
    fn test_shared_mem() {
        let params = LaunchParams::default().with_shared_mem(4096);
        assert_eq!(params.smem, 4096);
    }
}
