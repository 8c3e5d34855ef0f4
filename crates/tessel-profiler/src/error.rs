//! Profiler errors.
//!
//! Every variant is an invariant violation: the run that produced it is
//! unusable and the caller should treat it as an internal bug.

use crate::ProfilerState;
use tessel_gpu::{DeviceId, GpuError};
use thiserror::Error;

/// Errors raised by misuse of the profiler state machines.
#[derive(Debug, Error)]
pub enum ProfilerError {
    /// An operation was called in the wrong fusion state.
    #[error("{operation} requires the fusion profiler to be {expected}, but it is {actual}")]
    InvalidFusionState {
        /// The offending operation.
        operation: &'static str,
        /// State the operation needs.
        expected: ProfilerState,
        /// State the profiler was in.
        actual: ProfilerState,
    },

    /// A segment operation was called in the wrong state.
    #[error("segment {segment_id:#x}: {operation} requires {expected}, but it is {actual}")]
    InvalidSegmentState {
        /// The segment's id.
        segment_id: u32,
        /// The offending operation.
        operation: &'static str,
        /// State the operation needs.
        expected: ProfilerState,
        /// State the segment was in.
        actual: ProfilerState,
    },

    /// A segment index past the segments created for this run.
    #[error("segment index {index} out of range for {count} segments")]
    UnknownSegment {
        /// The requested index.
        index: usize,
        /// Segments in this run.
        count: usize,
    },

    /// A correlation token from another run.
    #[error("no segment with id {0:#x} in this run")]
    UnknownSegmentId(u32),

    /// Segment indices must fit in the low 15 bits of a segment id.
    #[error("cannot create {0} segments; at most 32768 per fusion")]
    TooManySegments(usize),

    /// The external correlation id popped on kernel stop differs from the
    /// one pushed on kernel start.
    #[error("external correlation stack corrupted: pushed {pushed:#x}, popped {popped:#x}")]
    CorrelationMismatch {
        /// Id pushed by the segment.
        pushed: u64,
        /// Id the tracer returned.
        popped: u64,
    },

    /// The tracer had nothing to pop.
    #[error("external correlation stack is empty")]
    EmptyCorrelationStack,

    /// A segment produced no kernel record by the end of the run.
    #[error("no kernel profile recorded for segment {index} (id {segment_id:#x})")]
    MissingKernelProfile {
        /// Segment index.
        index: usize,
        /// Segment id.
        segment_id: u32,
    },

    /// Segments of one run launched on more than one device.
    #[error("fusion {fusion_id} ran on multiple devices: {first} and {second}")]
    MixedDevices {
        /// Run id.
        fusion_id: u32,
        /// Device of the first segment.
        first: DeviceId,
        /// A different device seen later.
        second: DeviceId,
    },

    /// A device query failed while building a device descriptor.
    #[error(transparent)]
    Device(#[from] GpuError),

    /// JSON rendering failed.
    #[error("failed to render profile: {0}")]
    Render(#[from] serde_json::Error),
}

/// Result type for profiler operations.
pub type ProfilerResult<T> = Result<T, ProfilerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_error_display() {
        let err = ProfilerError::InvalidFusionState {
            operation: "stop",
            expected: ProfilerState::Running,
            actual: ProfilerState::Ready,
        };
        assert_eq!(
            err.to_string(),
            "stop requires the fusion profiler to be Running, but it is Ready"
        );
    }

    #[test]
    fn test_mismatch_display() {
        let err = ProfilerError::CorrelationMismatch {
            pushed: 0x8001,
            popped: 0x8002,
        };
        assert_eq!(
            err.to_string(),
            "external correlation stack corrupted: pushed 0x8001, popped 0x8002"
        );
    }
}
