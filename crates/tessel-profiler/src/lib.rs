//! # Tessel Fusion Profiler
//!
//! This crate measures compiled fusions at run time and attributes
//! asynchronously reported kernel executions to the segments that launched
//! them.
//!
//! ## Overview
//!
//! One run of a fusion is profiled in four steps:
//!
//! 1. **Start**: a new run id, a host timer, empty per-run state
//! 2. **Segments**: one [`SegmentProfiler`] per kernel-launching segment,
//!    bracketing compilation and the kernel launch
//! 3. **Stop**: the tracer is flushed and kernel records are matched to
//!    segments through their correlation ids
//! 4. **Report**: a [`FusionProfile`] ordered by segment index, with times,
//!    bytes and bandwidth
//!
//! ## Pipeline Position
//!
//! ```text
//! [Scheduler / Codegen]
//!     |
//!     v
//! [Executor]   -- start/stop, compile and kernel brackets --> [Profiler]
//!     |                                                          ^
//!     v                                                          |
//! [Device] -- activity buffers (any thread, any order) ---------+
//! ```
//!
//! ## Main Types
//!
//! - [`FusionProfiler`]: Per-session context; one active run at a time
//! - [`SegmentProfiler`]: Timing state for one segment
//! - [`CorrelationToken`]: Open kernel bracket, consumed when it closes
//! - [`ActivityTracer`]: Seam to the device's activity tracing
//! - [`SimulatedTracer`]: Deterministic in-process tracer
//! - [`FusionProfile`] / [`KernelProfile`]: The reduced report

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod activity;
pub mod error;
pub mod fusion;
pub mod options;
pub mod report;
pub mod segment;
pub mod timer;

use serde::Serialize;
use std::fmt;

pub use activity::{
    demangle, ActivityBuffer, ActivityKind, ActivityRecord, ActivitySink, ActivityTracer,
    KernelActivity, SimulatedLaunch, SimulatedTracer,
};
pub use error::{ProfilerError, ProfilerResult};
pub use fusion::FusionProfiler;
pub use options::ProfilerOptions;
pub use report::{bandwidth_gbs, DeviceDescriptor, FusionProfile, KernelProfile, ProfileTable};
pub use segment::{decode_segment_id, segment_id, CorrelationToken, SegmentProfiler, MAX_SEGMENTS};
pub use timer::HostTimer;

/// Lifecycle of a profiled run or segment bracket.
///
/// Runs go through all four states; segment brackets stop at `Finished`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub enum ProfilerState {
    /// Nothing started.
    #[default]
    Ready,
    /// Between start and stop.
    Running,
    /// Stopped, not yet reduced.
    Finished,
    /// Reduced; the report can be read.
    Processed,
}

impl fmt::Display for ProfilerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ready => "Ready",
            Self::Running => "Running",
            Self::Finished => "Finished",
            Self::Processed => "Processed",
        };
        f.write_str(name)
    }
}
