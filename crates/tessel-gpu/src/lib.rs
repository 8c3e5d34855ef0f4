//! # Tessel GPU Resource Model
//!
//! Static description of the GPU devices that the tessel schedulers size
//! kernels for and the profiler measures kernels on.
//!
//! ## Overview
//!
//! - **Device properties**: SM count, resident threads, register file and
//!   shared memory limits, memory bus geometry
//! - **Peak bandwidth**: derived from memory clock and bus width
//! - **Launch parameters**: grid/block dimensions chosen by heuristics
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tessel_gpu::{DeviceId, DeviceQuery, StaticDevices};
//!
//! let devices = StaticDevices::mock();
//! let dev = devices.device_info(DeviceId(0))?;
//! println!("{dev}: {:.1} GB/s", dev.memory_bandwidth_gbps());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod device;
pub mod launch;

use thiserror::Error;

pub use device::{DeviceId, DeviceInfo, DeviceKind, DeviceQuery, StaticDevices};
pub use launch::LaunchParams;

/// Errors that can occur when querying GPU resources.
#[derive(Debug, Error)]
pub enum GpuError {
    /// Invalid device ID.
    #[error("invalid device ID: {0}")]
    InvalidDevice(DeviceId),
}

/// Result type for GPU operations.
pub type GpuResult<T> = Result<T, GpuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GpuError::InvalidDevice(DeviceId(4));
        assert!(err.to_string().contains("GPU:4"));
    }
}
