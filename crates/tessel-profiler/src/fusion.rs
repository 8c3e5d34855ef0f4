//! Fusion-level profiling context.
//!
//! A [`FusionProfiler`] is owned by one execution session and profiles one
//! run at a time:
//!
//! ```text
//! start -> create_segments(n) -> [per segment: compile, kernel] -> stop -> profile
//! Ready    Running                                                 Finished -> Processed
//! ```
//!
//! Every transition takes the context's lock for its whole duration. The
//! fusion body itself runs unlocked between transitions. Activity buffers
//! may arrive at any time through the [`ActivitySink`]; `stop` flushes the
//! tracer and then reduces kernel records to segments by correlation id.

use crate::activity::{
    ActivityBuffer, ActivityRecord, ActivitySink, ActivityTracer, KernelActivity, SimulatedTracer,
};
use crate::error::{ProfilerError, ProfilerResult};
use crate::options::ProfilerOptions;
use crate::report::{DeviceDescriptor, FusionProfile, KernelProfile};
use crate::segment::{segment_id, CorrelationToken, SegmentProfiler, MAX_SEGMENTS};
use crate::timer::HostTimer;
use crate::ProfilerState;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tessel_gpu::{DeviceId, DeviceQuery, StaticDevices};
use tracing::{debug, trace};

/// Profiler state shared with the activity sink.
pub(crate) struct Inner {
    options: ProfilerOptions,
    state: ProfilerState,
    fusion_id: u32,
    timer: HostTimer,
    segments: Vec<SegmentProfiler>,
    /// Segment id to storage index.
    segment_index: FxHashMap<u32, usize>,
    /// Internal correlation id to segment id.
    correlations: FxHashMap<u32, u32>,
    kernel_records: Vec<KernelActivity>,
    /// Survives across runs.
    devices: FxHashMap<DeviceId, DeviceDescriptor>,
    device_query: Box<dyn DeviceQuery>,
    input_bytes: i64,
    output_bytes: i64,
    profile: FusionProfile,
    tracer: Box<dyn ActivityTracer>,
}

impl Inner {
    pub(crate) fn record_activity(&mut self, buffer: ActivityBuffer) {
        trace!(
            records = buffer.records.len(),
            bytes = buffer.valid_bytes,
            "activity buffer completed"
        );
        for record in buffer.records {
            match record {
                ActivityRecord::Kernel(kernel) => self.kernel_records.push(kernel),
                ActivityRecord::ExternalCorrelation {
                    correlation_id,
                    external_id,
                } => match u32::try_from(external_id) {
                    Ok(segment) => {
                        self.correlations.insert(correlation_id, segment);
                    }
                    Err(_) => trace!(external_id, "external id is not a segment id"),
                },
                ActivityRecord::Driver {
                    correlation_id,
                    name,
                } => trace!(correlation_id, %name, "driver activity"),
            }
        }
    }

    fn expect_state(&self, expected: ProfilerState, operation: &'static str) -> ProfilerResult<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(ProfilerError::InvalidFusionState {
                operation,
                expected,
                actual: self.state,
            })
        }
    }

    fn reset(&mut self) {
        self.segments.clear();
        self.segment_index.clear();
        self.correlations.clear();
        self.kernel_records.clear();
        self.input_bytes = 0;
        self.output_bytes = 0;
        self.profile = FusionProfile::default();
        self.state = ProfilerState::Ready;
    }

    fn segment_mut(&mut self, index: usize) -> ProfilerResult<&mut SegmentProfiler> {
        let count = self.segments.len();
        self.segments
            .get_mut(index)
            .ok_or(ProfilerError::UnknownSegment { index, count })
    }

    fn descriptor(&mut self, device: DeviceId) -> ProfilerResult<DeviceDescriptor> {
        if let Some(descriptor) = self.devices.get(&device) {
            return Ok(descriptor.clone());
        }
        let info = self.device_query.device_info(device)?;
        let descriptor = DeviceDescriptor::from_info(&info);
        debug!(%device, name = %descriptor.name, peak = descriptor.peak_bandwidth_gbs, "device descriptor created");
        self.devices.insert(device, descriptor.clone());
        Ok(descriptor)
    }

    /// Attributes kernel records to segments and computes the report.
    fn reduce(&mut self) -> ProfilerResult<FusionProfile> {
        let mut kernels: Vec<Option<KernelProfile>> = vec![None; self.segments.len()];

        if self.options.kernel_profiling {
            for record in std::mem::take(&mut self.kernel_records) {
                let Some(&segment) = self.correlations.get(&record.correlation_id) else {
                    trace!(correlation_id = record.correlation_id, "skipping unmatched kernel");
                    continue;
                };
                let Some(&index) = self.segment_index.get(&segment) else {
                    trace!(segment, "skipping kernel from another run");
                    continue;
                };
                let descriptor = self.descriptor(record.device)?;
                kernels[index] = Some(KernelProfile::from_activity(
                    &record,
                    &self.segments[index],
                    &descriptor,
                ));
            }
        } else {
            for index in 0..self.segments.len() {
                let Some(device) = self.segments[index].device() else {
                    continue;
                };
                let descriptor = self.descriptor(device)?;
                let segment = &self.segments[index];
                kernels[index] = Some(KernelProfile::from_segment(
                    segment,
                    &descriptor,
                    segment.kernel_host_time_ms(),
                ));
            }
        }

        let kernel_profiles = kernels
            .into_iter()
            .enumerate()
            .map(|(index, kernel)| {
                kernel.ok_or(ProfilerError::MissingKernelProfile {
                    index,
                    segment_id: self.segments[index].id(),
                })
            })
            .collect::<ProfilerResult<Vec<_>>>()?;

        let mut peak = 0.0;
        if let Some(first) = kernel_profiles.first() {
            if let Some(other) = kernel_profiles.iter().find(|k| k.device != first.device) {
                return Err(ProfilerError::MixedDevices {
                    fusion_id: self.fusion_id,
                    first: first.device,
                    second: other.device,
                });
            }
            peak = first.peak_bandwidth_gbs;
        }

        let mut profile = FusionProfile {
            fusion_id: self.fusion_id,
            segments: self.segments.len(),
            input_bytes: self.input_bytes,
            output_bytes: self.output_bytes,
            kernel_profiles,
            ..FusionProfile::default()
        };
        profile.finish(self.timer.elapsed_ms(), peak);
        Ok(profile)
    }
}

/// Profiling context for one execution session.
///
/// Cloning yields another handle to the same context.
#[derive(Clone)]
pub struct FusionProfiler {
    inner: Arc<Mutex<Inner>>,
}

impl FusionProfiler {
    /// Creates a context driving `tracer`, querying `devices` lazily for
    /// peak bandwidth.
    #[must_use]
    pub fn new(
        options: ProfilerOptions,
        tracer: impl ActivityTracer + 'static,
        devices: impl DeviceQuery + 'static,
    ) -> Self {
        let inner = Arc::new(Mutex::new(Inner {
            options,
            state: ProfilerState::Ready,
            fusion_id: 0,
            timer: HostTimer::new(),
            segments: Vec::new(),
            segment_index: FxHashMap::default(),
            correlations: FxHashMap::default(),
            kernel_records: Vec::new(),
            devices: FxHashMap::default(),
            device_query: Box::new(devices),
            input_bytes: 0,
            output_bytes: 0,
            profile: FusionProfile::default(),
            tracer: Box::new(tracer),
        }));
        let sink = ActivitySink::new(&inner);
        inner.lock().tracer.register_sink(sink);
        Self { inner }
    }

    /// A context over a [`SimulatedTracer`] and the mock device. The
    /// returned tracer handle launches simulated kernels.
    #[must_use]
    pub fn simulated(options: ProfilerOptions) -> (Self, SimulatedTracer) {
        let tracer = SimulatedTracer::new(&options);
        let profiler = Self::new(options, tracer.clone(), StaticDevices::mock());
        (profiler, tracer)
    }

    /// Handle for delivering completed activity buffers.
    #[must_use]
    pub fn activity_sink(&self) -> ActivitySink {
        ActivitySink::new(&self.inner)
    }

    /// Current run state.
    #[must_use]
    pub fn state(&self) -> ProfilerState {
        self.inner.lock().state
    }

    /// Id of the current (or last) run.
    #[must_use]
    pub fn fusion_id(&self) -> u32 {
        self.inner.lock().fusion_id
    }

    /// Segments created for the current run.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.inner.lock().segments.len()
    }

    /// Snapshot of one segment.
    ///
    /// # Errors
    ///
    /// Returns `ProfilerError::UnknownSegment` for an index past the
    /// segments of this run.
    pub fn segment(&self, index: usize) -> ProfilerResult<SegmentProfiler> {
        self.inner.lock().segment_mut(index).cloned()
    }

    // ------------------------------------------------------------------
    // Run lifecycle
    // ------------------------------------------------------------------

    /// Begins a new run, discarding everything from the previous one.
    ///
    /// Valid in any state; this is also how a run abandoned mid-way is
    /// recovered.
    pub fn start(&self) {
        let mut inner = self.inner.lock();
        if inner.state == ProfilerState::Running {
            debug!(fusion_id = inner.fusion_id, "restarting a run that never stopped");
        }
        inner.reset();
        inner.fusion_id = inner.fusion_id.wrapping_add(1);
        inner.timer.start();
        inner.state = ProfilerState::Running;
        trace!(fusion_id = inner.fusion_id, "fusion profile started");
    }

    /// Allocates `count` segments for the current run.
    ///
    /// # Errors
    ///
    /// Returns `ProfilerError::InvalidFusionState` outside a run and
    /// `ProfilerError::TooManySegments` if the indices would not fit in a
    /// segment id.
    pub fn create_segments(&self, count: usize) -> ProfilerResult<()> {
        let mut inner = self.inner.lock();
        inner.expect_state(ProfilerState::Running, "create_segments")?;
        if count > MAX_SEGMENTS {
            return Err(ProfilerError::TooManySegments(count));
        }
        let fusion_id = inner.fusion_id;
        inner.segments.clear();
        inner.segment_index.clear();
        for index in 0..count {
            // Bounded by MAX_SEGMENTS above.
            #[allow(clippy::cast_possible_truncation)]
            let id = segment_id(fusion_id, index as u32);
            inner.segments.push(SegmentProfiler::new(id, index));
            inner.segment_index.insert(id, index);
        }
        trace!(fusion_id, count, "segments created");
        Ok(())
    }

    /// Records the bytes the whole fusion reads.
    ///
    /// # Errors
    ///
    /// Returns `ProfilerError::InvalidFusionState` outside a run.
    pub fn input_bytes_accessed(&self, bytes: i64) -> ProfilerResult<()> {
        let mut inner = self.inner.lock();
        inner.expect_state(ProfilerState::Running, "input_bytes_accessed")?;
        inner.input_bytes = bytes;
        Ok(())
    }

    /// Records the bytes the whole fusion writes.
    ///
    /// # Errors
    ///
    /// Returns `ProfilerError::InvalidFusionState` outside a run.
    pub fn output_bytes_accessed(&self, bytes: i64) -> ProfilerResult<()> {
        let mut inner = self.inner.lock();
        inner.expect_state(ProfilerState::Running, "output_bytes_accessed")?;
        inner.output_bytes = bytes;
        Ok(())
    }

    /// Ends the run: stops the host timer, flushes the tracer, attributes
    /// kernel records to segments and computes the report.
    ///
    /// # Errors
    ///
    /// Returns `ProfilerError::InvalidFusionState` outside a run,
    /// `ProfilerError::MissingKernelProfile` if a segment has no kernel,
    /// and `ProfilerError::MixedDevices` if segments ran on different
    /// devices. The run stays `Finished` after an error.
    pub fn stop(&self) -> ProfilerResult<()> {
        let mut inner = self.inner.lock();
        inner.expect_state(ProfilerState::Running, "stop")?;
        inner.timer.stop();
        inner.state = ProfilerState::Finished;

        if inner.options.kernel_profiling {
            let buffers = inner.tracer.flush_all();
            for buffer in buffers {
                inner.record_activity(buffer);
            }
        }
        let profile = inner.reduce()?;
        debug!(
            fusion_id = profile.fusion_id,
            segments = profile.segments,
            kernel_ms = profile.kernel_time_ms,
            "fusion profile processed"
        );
        inner.profile = profile;
        inner.state = ProfilerState::Processed;
        Ok(())
    }

    /// The report of the last run.
    ///
    /// # Errors
    ///
    /// Returns `ProfilerError::InvalidFusionState` unless the run has been
    /// stopped and processed.
    pub fn profile(&self) -> ProfilerResult<FusionProfile> {
        let inner = self.inner.lock();
        inner.expect_state(ProfilerState::Processed, "profile")?;
        Ok(inner.profile.clone())
    }

    /// The rendered report of the last run, verbose per the options.
    ///
    /// # Errors
    ///
    /// Same as [`FusionProfiler::profile`].
    pub fn report(&self) -> ProfilerResult<String> {
        let inner = self.inner.lock();
        inner.expect_state(ProfilerState::Processed, "report")?;
        Ok(inner.profile.table(inner.options.verbose).to_string())
    }

    // ------------------------------------------------------------------
    // Segment brackets
    // ------------------------------------------------------------------

    /// Opens a segment's compile bracket.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown segment or a bracket already opened.
    pub fn start_compile(&self, index: usize, device: DeviceId) -> ProfilerResult<()> {
        self.inner.lock().segment_mut(index)?.start_compile(device)
    }

    /// Closes a segment's compile bracket.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown segment or a bracket not open.
    pub fn stop_compile(&self, index: usize) -> ProfilerResult<()> {
        self.inner.lock().segment_mut(index)?.stop_compile()
    }

    /// Opens a segment's kernel bracket.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown segment or a bracket already opened.
    pub fn start_kernel(&self, index: usize, device: DeviceId) -> ProfilerResult<CorrelationToken> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let tracer: Option<&mut dyn ActivityTracer> = if inner.options.kernel_profiling {
            Some(inner.tracer.as_mut())
        } else {
            None
        };
        let count = inner.segments.len();
        let segment = inner
            .segments
            .get_mut(index)
            .ok_or(ProfilerError::UnknownSegment { index, count })?;
        segment.start_kernel(device, tracer)
    }

    /// Closes the kernel bracket opened with `token`.
    ///
    /// # Errors
    ///
    /// Returns `ProfilerError::UnknownSegmentId` if the token belongs to no
    /// segment of this run, or an error if the tracer's correlation stack
    /// no longer matches.
    pub fn stop_kernel(&self, token: CorrelationToken) -> ProfilerResult<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(&index) = inner.segment_index.get(&token.segment_id()) else {
            return Err(ProfilerError::UnknownSegmentId(token.segment_id()));
        };
        let tracer: Option<&mut dyn ActivityTracer> = if inner.options.kernel_profiling {
            Some(inner.tracer.as_mut())
        } else {
            None
        };
        inner.segments[index].stop_kernel(token, tracer)
    }

    /// Records the bytes a segment's kernel reads.
    ///
    /// # Errors
    ///
    /// Returns `ProfilerError::UnknownSegment` for an unknown segment.
    pub fn segment_input_bytes(&self, index: usize, bytes: i64) -> ProfilerResult<()> {
        self.inner.lock().segment_mut(index)?.input_bytes_accessed(bytes);
        Ok(())
    }

    /// Records the bytes a segment's kernel writes.
    ///
    /// # Errors
    ///
    /// Returns `ProfilerError::UnknownSegment` for an unknown segment.
    pub fn segment_output_bytes(&self, index: usize, bytes: i64) -> ProfilerResult<()> {
        self.inner.lock().segment_mut(index)?.output_bytes_accessed(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::SimulatedLaunch;

    fn run_segment(profiler: &FusionProfiler, tracer: &SimulatedTracer, index: usize, ns: u64) {
        profiler.start_compile(index, DeviceId(0)).unwrap();
        profiler.stop_compile(index).unwrap();
        let token = profiler.start_kernel(index, DeviceId(0)).unwrap();
        tracer.launch(&SimulatedLaunch::new(format!("_Z5kern{index}v"), DeviceId(0), ns));
        profiler.stop_kernel(token).unwrap();
    }

    #[test]
    fn test_fresh_profiler_is_ready() {
        let (profiler, _) = FusionProfiler::simulated(ProfilerOptions::default());
        assert_eq!(profiler.state(), ProfilerState::Ready);
        assert_eq!(profiler.fusion_id(), 0);
    }

    #[test]
    fn test_segment_ids_carry_fusion_id() {
        let (profiler, _) = FusionProfiler::simulated(ProfilerOptions::default());
        profiler.start();
        profiler.start();
        profiler.create_segments(3).unwrap();
        let seg = profiler.segment(2).unwrap();
        assert_eq!(seg.id(), (2 << 15) | 2);
        assert!(matches!(
            profiler.segment(3),
            Err(ProfilerError::UnknownSegment { index: 3, count: 3 })
        ));
    }

    #[test]
    fn test_create_segments_requires_running() {
        let (profiler, _) = FusionProfiler::simulated(ProfilerOptions::default());
        assert!(matches!(
            profiler.create_segments(1),
            Err(ProfilerError::InvalidFusionState { operation: "create_segments", .. })
        ));
        profiler.start();
        assert!(matches!(
            profiler.create_segments(MAX_SEGMENTS + 1),
            Err(ProfilerError::TooManySegments(_))
        ));
    }

    #[test]
    fn test_single_segment_run() {
        let (profiler, tracer) = FusionProfiler::simulated(ProfilerOptions::default());
        profiler.start();
        profiler.create_segments(1).unwrap();
        profiler.input_bytes_accessed(3_000_000).unwrap();
        profiler.output_bytes_accessed(1_000_000).unwrap();
        profiler.segment_input_bytes(0, 3_000_000).unwrap();
        profiler.segment_output_bytes(0, 1_000_000).unwrap();
        run_segment(&profiler, &tracer, 0, 2_000_000);
        profiler.stop().unwrap();

        let profile = profiler.profile().unwrap();
        assert_eq!(profile.fusion_id, 1);
        assert_eq!(profile.kernel_profiles.len(), 1);
        let kernel = &profile.kernel_profiles[0];
        assert_eq!(kernel.name, "kern0");
        assert_eq!(kernel.time_ms, 2.0);
        assert_eq!(kernel.effective_bandwidth_gbs, 2.0);
        assert_eq!(profile.effective_bandwidth_gbs, 2.0);
        assert!(profile.host_time_ms >= 0.0);
        assert!(profiler.report().unwrap().contains("kern0"));
    }

    #[test]
    fn test_host_timed_kernels_without_profiling() {
        let options = ProfilerOptions {
            kernel_profiling: false,
            ..ProfilerOptions::default()
        };
        let (profiler, tracer) = FusionProfiler::simulated(options);
        profiler.start();
        profiler.create_segments(2).unwrap();
        run_segment(&profiler, &tracer, 0, 10);
        run_segment(&profiler, &tracer, 1, 10);
        profiler.stop().unwrap();

        // Channels were never enabled, so nothing was traced.
        assert_eq!(tracer.correlation_depth(), 0);
        let profile = profiler.profile().unwrap();
        assert_eq!(profile.kernel_profiles.len(), 2);
        assert!(profile.kernel_profiles.iter().all(|k| k.name.is_empty()));
        assert_eq!(profile.kernel_profiles[1].segment_index, 1);
    }

    #[test]
    fn test_missing_kernel_is_fatal() {
        let (profiler, tracer) = FusionProfiler::simulated(ProfilerOptions::default());
        profiler.start();
        profiler.create_segments(2).unwrap();
        run_segment(&profiler, &tracer, 0, 10);
        let err = profiler.stop().unwrap_err();
        assert!(matches!(err, ProfilerError::MissingKernelProfile { index: 1, .. }));
        assert_eq!(profiler.state(), ProfilerState::Finished);
        assert!(profiler.profile().is_err());
    }

    #[test]
    fn test_stale_activity_is_skipped() {
        let (profiler, tracer) = FusionProfiler::simulated(ProfilerOptions::default());
        profiler.start();
        profiler.create_segments(1).unwrap();
        run_segment(&profiler, &tracer, 0, 10);
        // Abandon the run; its records are still buffered in the tracer.
        profiler.start();
        profiler.create_segments(1).unwrap();
        run_segment(&profiler, &tracer, 0, 20);
        profiler.stop().unwrap();

        let profile = profiler.profile().unwrap();
        assert_eq!(profile.fusion_id, 2);
        assert_eq!(profile.kernel_profiles.len(), 1);
        assert_eq!(profile.kernel_profiles[0].time_ms, 20.0 / 1.0e6);
    }
}
