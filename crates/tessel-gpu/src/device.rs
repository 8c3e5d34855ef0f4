//! GPU device properties.
//!
//! This module describes the hardware limits that the persistent scheduler
//! sizes its working set against and that the profiler derives peak
//! bandwidth from.
//!
//! # Device Queries
//!
//! ```rust,ignore
//! use tessel_gpu::device::{DeviceId, DeviceInfo};
//!
//! let device = DeviceInfo::mock();
//! println!("{}: {} SMs, {:.0} GB/s peak", device.id, device.multiprocessor_count,
//!     device.memory_bandwidth_gbps());
//! ```

use crate::{GpuError, GpuResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A unique identifier for a GPU device.
///
/// Device IDs are the runtime's device ordinals and are stable within a
/// single program execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GPU:{}", self.0)
    }
}

/// The type of GPU device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    /// NVIDIA GPU (CUDA).
    Cuda,
    /// Simulated device for testing without hardware.
    Mock,
}

impl DeviceKind {
    /// Get the display name for this device kind.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Cuda => "CUDA",
            Self::Mock => "Mock",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Static hardware facts about a GPU device.
///
/// Both the reduction heuristics (occupancy, register and shared memory
/// budgets) and the profiler (peak bandwidth) read from this record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device identifier.
    pub id: DeviceId,

    /// Device type.
    pub kind: DeviceKind,

    /// Human-readable device name.
    pub name: String,

    /// Compute capability (major, minor).
    pub compute_capability: (u32, u32),

    /// Number of streaming multiprocessors.
    pub multiprocessor_count: u32,

    /// Maximum resident threads per multiprocessor.
    pub max_threads_per_multiprocessor: u32,

    /// Maximum threads per block.
    pub max_threads_per_block: u32,

    /// Warp size.
    pub warp_size: u32,

    /// 32-bit registers available per multiprocessor.
    pub registers_per_multiprocessor: u32,

    /// Default shared memory per block in bytes.
    pub shared_memory_per_block: usize,

    /// Shared memory per block available with explicit opt-in, in bytes.
    pub shared_memory_per_block_optin: usize,

    /// Memory clock rate in kHz.
    pub memory_clock_rate: u32,

    /// Memory bus width in bits.
    pub memory_bus_width: u32,
}

impl DeviceInfo {
    /// Create a mock device for testing.
    ///
    /// The numbers follow an Ampere-class data-center part.
    #[must_use]
    pub fn mock() -> Self {
        Self {
            id: DeviceId(0),
            kind: DeviceKind::Mock,
            name: "Mock GPU Device".to_string(),
            compute_capability: (8, 0),
            multiprocessor_count: 108,
            max_threads_per_multiprocessor: 2048,
            max_threads_per_block: 1024,
            warp_size: 32,
            registers_per_multiprocessor: 65536,
            shared_memory_per_block: 48 * 1024,
            shared_memory_per_block_optin: 163 * 1024,
            memory_clock_rate: 1_215_000,
            memory_bus_width: 5120,
        }
    }

    /// Same as [`DeviceInfo::mock`] but with a different id and SM count.
    #[must_use]
    pub fn mock_with(id: DeviceId, multiprocessor_count: u32) -> Self {
        Self {
            id,
            multiprocessor_count,
            ..Self::mock()
        }
    }

    /// Get the memory bandwidth in GB/s (theoretical peak).
    #[must_use]
    pub fn memory_bandwidth_gbps(&self) -> f64 {
        // bandwidth = clock_rate * bus_width / 8 * 2 (for DDR)
        let clock_ghz = f64::from(self.memory_clock_rate) / 1_000_000.0;
        let bus_bytes = f64::from(self.memory_bus_width) / 8.0;
        clock_ghz * bus_bytes * 2.0
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (sm_{}{}, {} SMs)",
            self.name,
            self.compute_capability.0,
            self.compute_capability.1,
            self.multiprocessor_count
        )
    }
}

/// Source of device properties.
///
/// The profiler queries devices lazily, the first time a kernel on that
/// device is observed.
pub trait DeviceQuery: Send + Sync {
    /// Look up the properties of a device.
    ///
    /// # Errors
    ///
    /// Returns `GpuError::InvalidDevice` if no such device exists.
    fn device_info(&self, id: DeviceId) -> GpuResult<DeviceInfo>;
}

/// A fixed set of devices, used when no runtime is linked in.
#[derive(Clone, Debug, Default)]
pub struct StaticDevices {
    devices: Vec<DeviceInfo>,
}

impl StaticDevices {
    /// Create a registry over the given devices.
    #[must_use]
    pub fn new(devices: Vec<DeviceInfo>) -> Self {
        Self { devices }
    }

    /// A registry holding the single mock device.
    #[must_use]
    pub fn mock() -> Self {
        Self::new(vec![DeviceInfo::mock()])
    }
}

impl DeviceQuery for StaticDevices {
    fn device_info(&self, id: DeviceId) -> GpuResult<DeviceInfo> {
        self.devices
            .iter()
            .find(|d| d.id == id)
            .cloned()
            .ok_or(GpuError::InvalidDevice(id))
    }
}
