//! Profile records and the tabular report.

use crate::activity::{demangle, KernelActivity};
use crate::error::ProfilerResult;
use crate::segment::SegmentProfiler;
use serde::Serialize;
use std::fmt;
use tessel_gpu::{DeviceId, DeviceInfo};

/// Effective bandwidth in GB/s for `bytes` moved in `time_ms`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn bandwidth_gbs(bytes: i64, time_ms: f64) -> f64 {
    if time_ms > 0.0 {
        bytes as f64 / time_ms / 1.0e6
    } else {
        0.0
    }
}

fn percentage_of(value: f64, peak: f64) -> f64 {
    if peak > 0.0 {
        value / peak * 100.0
    } else {
        0.0
    }
}

/// Cached hardware facts for one device.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeviceDescriptor {
    /// Device ordinal.
    pub device: DeviceId,
    /// Device name.
    pub name: String,
    /// Memory bus width in bits.
    pub bus_width_bits: u32,
    /// Memory clock in kHz.
    pub memory_clock_khz: u32,
    /// Theoretical peak bandwidth in GB/s.
    pub peak_bandwidth_gbs: f64,
}

impl DeviceDescriptor {
    /// Derives the descriptor from device properties.
    #[must_use]
    pub fn from_info(info: &DeviceInfo) -> Self {
        Self {
            device: info.id,
            name: info.name.clone(),
            bus_width_bits: info.memory_bus_width,
            memory_clock_khz: info.memory_clock_rate,
            peak_bandwidth_gbs: info.memory_bandwidth_gbps(),
        }
    }
}

/// One segment's kernel, enriched with the segment's host-side data.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct KernelProfile {
    /// Demangled kernel name; empty when kernel records are not correlated.
    pub name: String,
    /// Segment position within the run.
    pub segment_index: usize,
    /// Segment id.
    pub segment_id: u32,
    /// Device the kernel ran on.
    pub device: DeviceId,
    /// Stream the kernel ran on.
    pub stream: u32,
    /// Internal correlation id of the launch.
    pub correlation_id: u32,
    /// Host compile time of the segment.
    pub compile_time_ms: f64,
    /// Kernel execution time.
    pub time_ms: f64,
    /// Bytes read.
    pub input_bytes: i64,
    /// Bytes written.
    pub output_bytes: i64,
    /// Achieved bandwidth in GB/s.
    pub effective_bandwidth_gbs: f64,
    /// Achieved bandwidth as a percentage of the device peak.
    pub percentage_peak_bandwidth: f64,
    /// Grid shape.
    pub grid: [u32; 3],
    /// Block shape.
    pub block: [u32; 3],
    /// Cluster shape.
    pub cluster: [u32; 3],
    /// Dynamic shared memory in bytes.
    pub dynamic_shared_memory: u32,
    /// Static shared memory in bytes.
    pub static_shared_memory: u32,
    /// Registers per thread.
    pub registers: u16,
    /// Device name.
    pub device_name: String,
    /// Device peak bandwidth in GB/s.
    pub peak_bandwidth_gbs: f64,
}

impl KernelProfile {
    /// Merges a hardware kernel record with its segment.
    #[must_use]
    pub fn from_activity(
        activity: &KernelActivity,
        segment: &SegmentProfiler,
        descriptor: &DeviceDescriptor,
    ) -> Self {
        let mut profile = Self::from_segment(segment, descriptor, activity.duration_ms());
        profile.name = demangle(&activity.name);
        profile.device = activity.device;
        profile.stream = activity.stream;
        profile.correlation_id = activity.correlation_id;
        profile.grid = activity.grid;
        profile.block = activity.block;
        profile.cluster = activity.cluster;
        profile.dynamic_shared_memory = activity.dynamic_shared_memory;
        profile.static_shared_memory = activity.static_shared_memory;
        profile.registers = activity.registers;
        profile
    }

    /// A profile built from the segment alone, timed by the host.
    #[must_use]
    pub fn from_segment(
        segment: &SegmentProfiler,
        descriptor: &DeviceDescriptor,
        time_ms: f64,
    ) -> Self {
        let bytes = segment.input_bytes() + segment.output_bytes();
        let effective = bandwidth_gbs(bytes, time_ms);
        Self {
            name: String::new(),
            segment_index: segment.index(),
            segment_id: segment.id(),
            device: descriptor.device,
            stream: 0,
            correlation_id: 0,
            compile_time_ms: segment.compile_time_ms(),
            time_ms,
            input_bytes: segment.input_bytes(),
            output_bytes: segment.output_bytes(),
            effective_bandwidth_gbs: effective,
            percentage_peak_bandwidth: percentage_of(effective, descriptor.peak_bandwidth_gbs),
            grid: [0; 3],
            block: [0; 3],
            cluster: [0; 3],
            dynamic_shared_memory: 0,
            static_shared_memory: 0,
            registers: 0,
            device_name: descriptor.name.clone(),
            peak_bandwidth_gbs: descriptor.peak_bandwidth_gbs,
        }
    }
}

/// The reduced report of one fusion run.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct FusionProfile {
    /// Run id.
    pub fusion_id: u32,
    /// Number of segments.
    pub segments: usize,
    /// Host wall-clock time of the whole run.
    pub total_time_ms: f64,
    /// Time not spent compiling or in kernels.
    pub host_time_ms: f64,
    /// Summed segment compile time.
    pub compile_time_ms: f64,
    /// Summed kernel time.
    pub kernel_time_ms: f64,
    /// Bytes read by the fusion.
    pub input_bytes: i64,
    /// Bytes written by the fusion.
    pub output_bytes: i64,
    /// Achieved bandwidth over the kernel time, in GB/s.
    pub effective_bandwidth_gbs: f64,
    /// Achieved bandwidth as a percentage of the device peak.
    pub percentage_peak_bandwidth: f64,
    /// Per-segment kernels, ordered by segment index.
    pub kernel_profiles: Vec<KernelProfile>,
}

impl FusionProfile {
    /// Fills in run-level totals from the per-kernel profiles.
    pub(crate) fn finish(&mut self, total_time_ms: f64, peak_bandwidth_gbs: f64) {
        self.segments = self.kernel_profiles.len().max(self.segments);
        self.compile_time_ms = self.kernel_profiles.iter().map(|k| k.compile_time_ms).sum();
        self.kernel_time_ms = self.kernel_profiles.iter().map(|k| k.time_ms).sum();
        self.total_time_ms = total_time_ms;
        // Simulated kernel times can exceed the host wall clock.
        self.host_time_ms = (total_time_ms - self.compile_time_ms - self.kernel_time_ms).max(0.0);
        self.effective_bandwidth_gbs =
            bandwidth_gbs(self.input_bytes + self.output_bytes, self.kernel_time_ms);
        self.percentage_peak_bandwidth =
            percentage_of(self.effective_bandwidth_gbs, peak_bandwidth_gbs);
    }

    /// The tabular report, optionally with device columns.
    #[must_use]
    pub const fn table(&self, verbose: bool) -> ProfileTable<'_> {
        ProfileTable {
            profile: self,
            verbose,
        }
    }

    /// Renders the profile as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns `ProfilerError::Render` if serialization fails.
    pub fn to_json(&self) -> ProfilerResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl fmt::Display for FusionProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.table(false), f)
    }
}

/// Display adapter for [`FusionProfile`].
#[derive(Clone, Copy, Debug)]
pub struct ProfileTable<'a> {
    profile: &'a FusionProfile,
    verbose: bool,
}

struct Shape([u32; 3]);

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = format!("[{},{},{}]", self.0[0], self.0[1], self.0[2]);
        f.pad(&s)
    }
}

#[allow(clippy::cast_precision_loss)]
fn megabytes(bytes: i64) -> f64 {
    bytes as f64 / 1.0e6
}

impl fmt::Display for ProfileTable<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = self.profile;
        writeln!(
            f,
            "{:>5} {:>5} {:>11} {:>11} {:>11} {:>11} {:>12} {:>8}",
            "Fus#", "NSegs", "TotTm(ms)", "HstTm(ms)", "CmpTm(ms)", "KerTm(ms)", "EffBw(GB/s)", "%PeakBw"
        )?;
        writeln!(
            f,
            "{:>5} {:>5} {:>11.3} {:>11.3} {:>11.3} {:>11.3} {:>12.2} {:>8.2}",
            p.fusion_id,
            p.segments,
            p.total_time_ms,
            p.host_time_ms,
            p.compile_time_ms,
            p.kernel_time_ms,
            p.effective_bandwidth_gbs,
            p.percentage_peak_bandwidth
        )?;
        if p.kernel_profiles.is_empty() {
            return Ok(());
        }

        write!(
            f,
            "  {:>5} {:>11} {:>11} {:>12} {:>8} {:>9} {:>9} {:>15} {:>5} {:>14} {:>14} {:>9} {:>4} {:>4}",
            "Seg#",
            "KerTm(ms)",
            "CmpTm(ms)",
            "EffBw(GB/s)",
            "%PeakBw",
            "In(MB)",
            "Out(MB)",
            "Smem[Dyn,Stat]",
            "Regs",
            "Grid",
            "Block",
            "Cluster",
            "Dev",
            "Stm"
        )?;
        if self.verbose {
            write!(f, " {:>20} {:>14}", "DeviceName", "PeakBw(GB/s)")?;
        }
        writeln!(f, " KerName")?;

        for k in &p.kernel_profiles {
            let smem = format!("[{},{}]", k.dynamic_shared_memory, k.static_shared_memory);
            write!(
                f,
                "  {:>5} {:>11.3} {:>11.3} {:>12.2} {:>8.2} {:>9.3} {:>9.3} {:>15} {:>5} {:>14} {:>14} {:>9} {:>4} {:>4}",
                k.segment_index,
                k.time_ms,
                k.compile_time_ms,
                k.effective_bandwidth_gbs,
                k.percentage_peak_bandwidth,
                megabytes(k.input_bytes),
                megabytes(k.output_bytes),
                smem,
                k.registers,
                Shape(k.grid),
                Shape(k.block),
                Shape(k.cluster),
                k.device.0,
                k.stream
            )?;
            if self.verbose {
                write!(f, " {:>20} {:>14.2}", k.device_name, k.peak_bandwidth_gbs)?;
            }
            writeln!(f, " {}", k.name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::segment_id;

    fn descriptor() -> DeviceDescriptor {
        DeviceDescriptor::from_info(&DeviceInfo::mock())
    }

    fn activity() -> KernelActivity {
        KernelActivity {
            name: "_ZN11CudaCodeGen7kernel3Ev".to_string(),
            device: DeviceId(0),
            stream: 7,
            correlation_id: 11,
            start_ns: 0,
            end_ns: 2_000_000,
            grid: [108, 1, 1],
            block: [256, 1, 1],
            cluster: [1, 1, 1],
            static_shared_memory: 16,
            dynamic_shared_memory: 4096,
            registers: 64,
        }
    }

    fn segment() -> SegmentProfiler {
        let mut seg = SegmentProfiler::new(segment_id(1, 0), 0);
        seg.input_bytes_accessed(2_000_000_000);
        seg.output_bytes_accessed(1_110_400_000);
        seg
    }

    #[test]
    fn test_bandwidth_units() {
        // 1 GB in 1 ms is 1000 GB/s.
        assert_eq!(bandwidth_gbs(1_000_000_000, 1.0), 1000.0);
        assert_eq!(bandwidth_gbs(1_000, 0.0), 0.0);
    }

    #[test]
    fn test_descriptor_peak() {
        let d = descriptor();
        assert!((d.peak_bandwidth_gbs - 1555.2).abs() < 1e-9);
        assert_eq!(d.bus_width_bits, 5120);
    }

    #[test]
    fn test_kernel_profile_from_activity() {
        let k = KernelProfile::from_activity(&activity(), &segment(), &descriptor());
        assert_eq!(k.name, "CudaCodeGen::kernel3");
        assert_eq!(k.time_ms, 2.0);
        // 3.1104 GB over 2 ms.
        assert!((k.effective_bandwidth_gbs - 1555.2).abs() < 1e-6);
        assert!((k.percentage_peak_bandwidth - 100.0).abs() < 1e-6);
        assert_eq!(k.segment_id, 0x8000);
        assert_eq!(k.registers, 64);
    }

    #[test]
    fn test_finish_totals() {
        let mut profile = FusionProfile {
            fusion_id: 1,
            input_bytes: 1_000_000,
            output_bytes: 1_000_000,
            kernel_profiles: vec![
                KernelProfile::from_segment(&segment(), &descriptor(), 1.5),
                KernelProfile::from_segment(&segment(), &descriptor(), 0.5),
            ],
            ..FusionProfile::default()
        };
        profile.finish(10.0, 1000.0);
        assert_eq!(profile.segments, 2);
        assert_eq!(profile.kernel_time_ms, 2.0);
        assert_eq!(profile.host_time_ms, 8.0);
        assert_eq!(profile.effective_bandwidth_gbs, 1.0);
        assert!((profile.percentage_peak_bandwidth - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_table_rendering() {
        let mut profile = FusionProfile {
            fusion_id: 4,
            kernel_profiles: vec![KernelProfile::from_activity(
                &activity(),
                &segment(),
                &descriptor(),
            )],
            ..FusionProfile::default()
        };
        profile.finish(5.0, 1555.2);

        let plain = profile.to_string();
        assert!(plain.starts_with(" Fus# NSegs"));
        assert!(plain.contains("CudaCodeGen::kernel3"));
        assert!(plain.contains("[4096,16]"));
        assert!(plain.contains("[108,1,1]"));
        assert!(!plain.contains("Mock GPU Device"));

        let verbose = profile.table(true).to_string();
        assert!(verbose.contains("DeviceName"));
        assert!(verbose.contains("Mock GPU Device"));
        assert_eq!(verbose.lines().count(), 4);
    }

    #[test]
    fn test_json() {
        let profile = FusionProfile {
            fusion_id: 2,
            ..FusionProfile::default()
        };
        let json = profile.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["fusion_id"], 2);
        assert!(value["kernel_profiles"].as_array().unwrap().is_empty());
    }
}
