//! Per-segment timing.
//!
//! A [`SegmentProfiler`] tracks one kernel-launching segment of one fusion
//! run: host compile time, the kernel launch bracket, and the bytes the
//! segment reads and writes. Segments never outlive their run.

use crate::activity::{ActivityKind, ActivityTracer};
use crate::error::{ProfilerError, ProfilerResult};
use crate::timer::HostTimer;
use crate::ProfilerState;
use tessel_gpu::DeviceId;
use tracing::trace;

/// Bits of a segment id holding the segment index.
pub const SEGMENT_INDEX_BITS: u32 = 15;

/// Most segments one fusion run can have.
pub const MAX_SEGMENTS: usize = 1 << SEGMENT_INDEX_BITS;

/// Packs a run id and a segment index into a segment id.
///
/// The run id takes the high 17 bits, the index the low 15.
#[must_use]
pub const fn segment_id(fusion_id: u32, index: u32) -> u32 {
    (fusion_id << SEGMENT_INDEX_BITS) | (index & (MAX_SEGMENTS as u32 - 1))
}

/// Splits a segment id into `(fusion_id, index)`, where the run id is
/// truncated to 17 bits.
#[must_use]
pub const fn decode_segment_id(id: u32) -> (u32, u32) {
    (id >> SEGMENT_INDEX_BITS, id & (MAX_SEGMENTS as u32 - 1))
}

/// Proof that a segment's kernel bracket is open.
///
/// Returned by kernel start and consumed by kernel stop, so a bracket can
/// be closed at most once.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "the kernel bracket stays open until the token is passed back"]
pub struct CorrelationToken {
    segment_id: u32,
    external_id: u64,
}

impl CorrelationToken {
    /// Id of the segment that opened the bracket.
    #[must_use]
    pub const fn segment_id(&self) -> u32 {
        self.segment_id
    }

    /// External correlation id pushed for the launch.
    #[must_use]
    pub const fn external_id(&self) -> u64 {
        self.external_id
    }
}

/// Timing state for one segment of a fusion run.
#[derive(Clone, Debug)]
pub struct SegmentProfiler {
    id: u32,
    index: usize,
    device: Option<DeviceId>,
    compile_state: ProfilerState,
    compile_timer: HostTimer,
    kernel_state: ProfilerState,
    kernel_timer: HostTimer,
    input_bytes: i64,
    output_bytes: i64,
}

impl SegmentProfiler {
    /// A fresh segment with the given id and position.
    #[must_use]
    pub const fn new(id: u32, index: usize) -> Self {
        Self {
            id,
            index,
            device: None,
            compile_state: ProfilerState::Ready,
            compile_timer: HostTimer::new(),
            kernel_state: ProfilerState::Ready,
            kernel_timer: HostTimer::new(),
            input_bytes: 0,
            output_bytes: 0,
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// The segment id, packing run id and index.
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// Position of the segment within its run.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Device of the most recent compile or launch.
    #[must_use]
    pub const fn device(&self) -> Option<DeviceId> {
        self.device
    }

    /// Compile bracket state.
    #[must_use]
    pub const fn compile_state(&self) -> ProfilerState {
        self.compile_state
    }

    /// Kernel bracket state.
    #[must_use]
    pub const fn kernel_state(&self) -> ProfilerState {
        self.kernel_state
    }

    /// Host compile time; zero until the compile bracket closes.
    #[must_use]
    pub fn compile_time_ms(&self) -> f64 {
        if self.compile_state == ProfilerState::Finished {
            self.compile_timer.elapsed_ms()
        } else {
            0.0
        }
    }

    /// Host time across the kernel bracket; zero until it closes.
    #[must_use]
    pub fn kernel_host_time_ms(&self) -> f64 {
        if self.kernel_state == ProfilerState::Finished {
            self.kernel_timer.elapsed_ms()
        } else {
            0.0
        }
    }

    /// Bytes read by the segment's kernel.
    #[must_use]
    pub const fn input_bytes(&self) -> i64 {
        self.input_bytes
    }

    /// Bytes written by the segment's kernel.
    #[must_use]
    pub const fn output_bytes(&self) -> i64 {
        self.output_bytes
    }

    /// Records the bytes the kernel reads.
    pub fn input_bytes_accessed(&mut self, bytes: i64) {
        self.input_bytes = bytes;
    }

    /// Records the bytes the kernel writes.
    pub fn output_bytes_accessed(&mut self, bytes: i64) {
        self.output_bytes = bytes;
    }

    // ------------------------------------------------------------------
    // Brackets
    // ------------------------------------------------------------------

    /// Opens the compile bracket.
    ///
    /// # Errors
    ///
    /// Returns `ProfilerError::InvalidSegmentState` unless compilation has
    /// not started yet.
    pub fn start_compile(&mut self, device: DeviceId) -> ProfilerResult<()> {
        self.require(self.compile_state, ProfilerState::Ready, "start_compile")?;
        self.device = Some(device);
        self.compile_timer.start();
        self.compile_state = ProfilerState::Running;
        trace!(segment = self.id, "compile started");
        Ok(())
    }

    /// Closes the compile bracket.
    ///
    /// # Errors
    ///
    /// Returns `ProfilerError::InvalidSegmentState` unless the compile
    /// bracket is open.
    pub fn stop_compile(&mut self) -> ProfilerResult<()> {
        self.require(self.compile_state, ProfilerState::Running, "stop_compile")?;
        self.compile_timer.stop();
        self.compile_state = ProfilerState::Finished;
        trace!(segment = self.id, ms = self.compile_timer.elapsed_ms(), "compile finished");
        Ok(())
    }

    /// Opens the kernel bracket. With a tracer, enables the kernel,
    /// driver and external-correlation channels and pushes this segment's
    /// id as the external correlation id.
    ///
    /// # Errors
    ///
    /// Returns `ProfilerError::InvalidSegmentState` if the kernel bracket
    /// was already opened in this run.
    pub fn start_kernel(
        &mut self,
        device: DeviceId,
        tracer: Option<&mut dyn ActivityTracer>,
    ) -> ProfilerResult<CorrelationToken> {
        self.require(self.kernel_state, ProfilerState::Ready, "start_kernel")?;
        let external_id = u64::from(self.id);
        if let Some(tracer) = tracer {
            for kind in ActivityKind::ALL {
                tracer.enable(kind);
            }
            tracer.push_external_correlation_id(external_id);
        }
        self.device = Some(device);
        self.kernel_timer.start();
        self.kernel_state = ProfilerState::Running;
        trace!(segment = self.id, %device, "kernel started");
        Ok(CorrelationToken {
            segment_id: self.id,
            external_id,
        })
    }

    /// Closes the kernel bracket, popping the external correlation id and
    /// disabling the channels again.
    ///
    /// # Errors
    ///
    /// Returns `ProfilerError::InvalidSegmentState` unless the bracket is
    /// open, and `ProfilerError::CorrelationMismatch` if the popped id is
    /// not the one this segment pushed.
    pub fn stop_kernel(
        &mut self,
        token: CorrelationToken,
        tracer: Option<&mut dyn ActivityTracer>,
    ) -> ProfilerResult<()> {
        self.require(self.kernel_state, ProfilerState::Running, "stop_kernel")?;
        if token.segment_id != self.id {
            return Err(ProfilerError::CorrelationMismatch {
                pushed: u64::from(self.id),
                popped: token.external_id,
            });
        }
        if let Some(tracer) = tracer {
            let popped = tracer
                .pop_external_correlation_id()
                .ok_or(ProfilerError::EmptyCorrelationStack)?;
            for kind in ActivityKind::ALL {
                tracer.disable(kind);
            }
            if popped != token.external_id {
                return Err(ProfilerError::CorrelationMismatch {
                    pushed: token.external_id,
                    popped,
                });
            }
        }
        self.kernel_timer.stop();
        self.kernel_state = ProfilerState::Finished;
        trace!(segment = self.id, "kernel finished");
        Ok(())
    }

    fn require(
        &self,
        actual: ProfilerState,
        expected: ProfilerState,
        operation: &'static str,
    ) -> ProfilerResult<()> {
        if actual == expected {
            Ok(())
        } else {
            Err(ProfilerError::InvalidSegmentState {
                segment_id: self.id,
                operation,
                expected,
                actual,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{SimulatedLaunch, SimulatedTracer};
    use crate::options::ProfilerOptions;

    #[test]
    fn test_segment_id_packing() {
        assert_eq!(segment_id(1, 0), 0x8000);
        assert_eq!(segment_id(3, 5), (3 << 15) | 5);
        assert_eq!(decode_segment_id(segment_id(77, 1234)), (77, 1234));
        // Run ids keep only 17 bits.
        assert_eq!(decode_segment_id(segment_id(1 << 17, 2)), (0, 2));
    }

    #[test]
    fn test_compile_bracket() {
        let mut seg = SegmentProfiler::new(segment_id(1, 0), 0);
        assert_eq!(seg.compile_time_ms(), 0.0);
        seg.start_compile(DeviceId(0)).unwrap();
        assert!(matches!(
            seg.start_compile(DeviceId(0)),
            Err(ProfilerError::InvalidSegmentState { operation: "start_compile", .. })
        ));
        seg.stop_compile().unwrap();
        assert_eq!(seg.compile_state(), ProfilerState::Finished);
        assert!(seg.compile_time_ms() >= 0.0);
        assert!(seg.stop_compile().is_err());
    }

    #[test]
    fn test_kernel_bracket_pushes_and_pops() {
        let mut tracer = SimulatedTracer::new(&ProfilerOptions::default());
        let mut handle = tracer.clone();
        let mut seg = SegmentProfiler::new(segment_id(2, 3), 3);

        let token = seg.start_kernel(DeviceId(0), Some(&mut tracer)).unwrap();
        assert_eq!(token.external_id(), u64::from(seg.id()));
        assert_eq!(handle.correlation_depth(), 1);
        assert!(handle.is_enabled(ActivityKind::ExternalCorrelation));
        handle.launch(&SimulatedLaunch::new("k", DeviceId(0), 10));

        seg.stop_kernel(token, Some(&mut tracer)).unwrap();
        assert_eq!(handle.correlation_depth(), 0);
        assert!(!handle.is_enabled(ActivityKind::ConcurrentKernel));
        assert_eq!(seg.kernel_state(), ProfilerState::Finished);
        assert_eq!(handle.flush_all()[0].records.len(), 3);
    }

    #[test]
    fn test_corrupted_stack_detected() {
        let mut tracer = SimulatedTracer::new(&ProfilerOptions::default());
        let mut seg = SegmentProfiler::new(segment_id(1, 0), 0);
        let token = seg.start_kernel(DeviceId(0), Some(&mut tracer)).unwrap();
        tracer.push_external_correlation_id(42);

        let err = seg.stop_kernel(token, Some(&mut tracer)).unwrap_err();
        assert!(matches!(
            err,
            ProfilerError::CorrelationMismatch { pushed: 0x8000, popped: 42 }
        ));
    }

    #[test]
    fn test_foreign_token_rejected() {
        let mut a = SegmentProfiler::new(segment_id(1, 0), 0);
        let mut b = SegmentProfiler::new(segment_id(1, 1), 1);
        let token_a = a.start_kernel(DeviceId(0), None).unwrap();
        let _token_b = b.start_kernel(DeviceId(0), None).unwrap();
        assert!(matches!(
            b.stop_kernel(token_a, None),
            Err(ProfilerError::CorrelationMismatch { .. })
        ));
    }

    #[test]
    fn test_stop_kernel_without_start() {
        let mut tracer = SimulatedTracer::new(&ProfilerOptions::default());
        let mut a = SegmentProfiler::new(segment_id(1, 0), 0);
        let mut b = SegmentProfiler::new(segment_id(1, 0), 0);
        let token = a.start_kernel(DeviceId(0), Some(&mut tracer)).unwrap();
        assert!(matches!(
            b.stop_kernel(token, Some(&mut tracer)),
            Err(ProfilerError::InvalidSegmentState { operation: "stop_kernel", .. })
        ));
    }

    #[test]
    fn test_bytes_recorded() {
        let mut seg = SegmentProfiler::new(segment_id(1, 0), 0);
        seg.input_bytes_accessed(4096);
        seg.output_bytes_accessed(1024);
        assert_eq!((seg.input_bytes(), seg.output_bytes()), (4096, 1024));
    }
}
