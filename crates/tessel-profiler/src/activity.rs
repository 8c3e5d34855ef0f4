//! Hardware activity tracing.
//!
//! The device runtime reports kernel executions asynchronously, in
//! fixed-size buffers that complete when full or when explicitly flushed.
//! Each kernel launch is tagged with an internal correlation id; an
//! external-correlation record ties that id to whatever id the host pushed
//! around the launch. The profiler pushes segment ids, so the pair of
//! records is enough to attribute a kernel to its segment after the fact.
//!
//! ```text
//! host:   push(seg) -> launch -> pop
//!                        |
//! tracer: [Driver c=7] [ExternalCorrelation c=7 -> seg] [Kernel c=7 ...]
//!                        |
//!         buffer full / flush -> ActivitySink::deliver
//! ```
//!
//! [`ActivityTracer`] is the seam to the device runtime.
//! [`SimulatedTracer`] implements it in-process so that telemetry can be
//! produced deterministically without a device.

use crate::fusion::Inner;
use crate::options::ProfilerOptions;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use tessel_gpu::DeviceId;
use tracing::{trace, warn};

/// Kinds of activity a tracer can record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum ActivityKind {
    /// Kernel executions.
    ConcurrentKernel,
    /// Internal-to-external correlation id mappings.
    ExternalCorrelation,
    /// Driver API calls.
    Driver,
}

impl ActivityKind {
    /// All kinds, in the order the profiler enables them.
    pub const ALL: [Self; 3] = [Self::ConcurrentKernel, Self::Driver, Self::ExternalCorrelation];

    const fn bit(self) -> u8 {
        match self {
            Self::ConcurrentKernel => 1,
            Self::ExternalCorrelation => 2,
            Self::Driver => 4,
        }
    }
}

/// One kernel execution as reported by the device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct KernelActivity {
    /// Mangled kernel name.
    pub name: String,
    /// Device the kernel ran on.
    pub device: DeviceId,
    /// Stream the kernel ran on.
    pub stream: u32,
    /// Internal correlation id of the launch.
    pub correlation_id: u32,
    /// Start timestamp in nanoseconds.
    pub start_ns: u64,
    /// End timestamp in nanoseconds.
    pub end_ns: u64,
    /// Grid shape.
    pub grid: [u32; 3],
    /// Block shape.
    pub block: [u32; 3],
    /// Cluster shape.
    pub cluster: [u32; 3],
    /// Statically allocated shared memory in bytes.
    pub static_shared_memory: u32,
    /// Dynamically allocated shared memory in bytes.
    pub dynamic_shared_memory: u32,
    /// Registers per thread.
    pub registers: u16,
}

impl KernelActivity {
    /// Execution time in milliseconds.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn duration_ms(&self) -> f64 {
        self.end_ns.saturating_sub(self.start_ns) as f64 / 1.0e6
    }
}

/// One record in an activity buffer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum ActivityRecord {
    /// A kernel execution.
    Kernel(KernelActivity),
    /// Maps an internal correlation id to the external id pushed at launch.
    ExternalCorrelation {
        /// Internal correlation id.
        correlation_id: u32,
        /// Id on top of the external correlation stack at launch.
        external_id: u64,
    },
    /// A driver API call.
    Driver {
        /// Internal correlation id.
        correlation_id: u32,
        /// API name.
        name: String,
    },
}

impl ActivityRecord {
    /// The record's kind.
    #[must_use]
    pub const fn kind(&self) -> ActivityKind {
        match self {
            Self::Kernel(_) => ActivityKind::ConcurrentKernel,
            Self::ExternalCorrelation { .. } => ActivityKind::ExternalCorrelation,
            Self::Driver { .. } => ActivityKind::Driver,
        }
    }

    /// Bytes the record occupies in a buffer, before alignment.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        let payload = match self {
            Self::Kernel(k) => k.name.len(),
            Self::Driver { name, .. } => name.len(),
            Self::ExternalCorrelation { .. } => 0,
        };
        std::mem::size_of::<Self>() + payload
    }
}

/// A completed activity buffer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ActivityBuffer {
    /// Records, in the order the tracer wrote them.
    pub records: Vec<ActivityRecord>,
    /// Bytes written, including alignment padding.
    pub valid_bytes: usize,
}

impl ActivityBuffer {
    /// A buffer holding `records`, sized with `options`' alignment.
    #[must_use]
    pub fn from_records(records: Vec<ActivityRecord>, options: &ProfilerOptions) -> Self {
        let valid_bytes = records.iter().map(|r| options.aligned(r.size_bytes())).sum();
        Self {
            records,
            valid_bytes,
        }
    }

    /// Returns true if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Receives completed activity buffers for a profiler.
///
/// Buffers may be delivered from any thread at any time; each delivery is
/// applied to the profiler as one batch under its lock. The sink does not
/// keep the profiler alive: buffers delivered after it is dropped are
/// discarded.
#[derive(Clone)]
pub struct ActivitySink {
    target: Weak<Mutex<Inner>>,
}

impl fmt::Debug for ActivitySink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivitySink")
            .field("attached", &(self.target.strong_count() > 0))
            .finish()
    }
}

impl ActivitySink {
    pub(crate) fn new(target: &Arc<Mutex<Inner>>) -> Self {
        Self {
            target: Arc::downgrade(target),
        }
    }

    /// Applies a completed buffer.
    pub fn deliver(&self, buffer: ActivityBuffer) {
        if buffer.is_empty() {
            return;
        }
        match self.target.upgrade() {
            Some(inner) => inner.lock().record_activity(buffer),
            None => warn!(
                records = buffer.records.len(),
                "profiler dropped; discarding activity buffer"
            ),
        }
    }
}

/// The device runtime's activity tracing interface.
pub trait ActivityTracer: Send {
    /// Registers where asynchronously completed buffers go.
    fn register_sink(&mut self, sink: ActivitySink);

    /// Starts recording `kind`.
    fn enable(&mut self, kind: ActivityKind);

    /// Stops recording `kind`.
    fn disable(&mut self, kind: ActivityKind);

    /// Pushes an id that tags every launch from the calling thread until it
    /// is popped. Each thread has its own stack.
    fn push_external_correlation_id(&mut self, id: u64);

    /// Pops the calling thread's most recently pushed id.
    fn pop_external_correlation_id(&mut self) -> Option<u64>;

    /// Completes every partially filled buffer and returns them instead of
    /// routing them through the sink. Blocks until the device has reported
    /// all outstanding activity.
    fn flush_all(&mut self) -> Vec<ActivityBuffer>;
}

/// A kernel launch for [`SimulatedTracer`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimulatedLaunch {
    /// Mangled kernel name.
    pub name: String,
    /// Target device.
    pub device: DeviceId,
    /// Target stream.
    pub stream: u32,
    /// Simulated execution time.
    pub duration_ns: u64,
    /// Grid shape.
    pub grid: [u32; 3],
    /// Block shape.
    pub block: [u32; 3],
    /// Dynamic shared memory in bytes.
    pub dynamic_shared_memory: u32,
    /// Registers per thread.
    pub registers: u16,
}

impl SimulatedLaunch {
    /// A 1-D launch of `name` on `device`.
    #[must_use]
    pub fn new(name: impl Into<String>, device: DeviceId, duration_ns: u64) -> Self {
        Self {
            name: name.into(),
            device,
            stream: 7,
            duration_ns,
            grid: [108, 1, 1],
            block: [128, 1, 1],
            dynamic_shared_memory: 0,
            registers: 32,
        }
    }

    /// Sets the launch shape.
    #[must_use]
    pub fn with_shape(mut self, grid: [u32; 3], block: [u32; 3]) -> Self {
        self.grid = grid;
        self.block = block;
        self
    }
}

#[derive(Debug)]
struct TracerState {
    options: ProfilerOptions,
    sink: Option<ActivitySink>,
    enabled: u8,
    external_ids: FxHashMap<ThreadId, Vec<u64>>,
    pending: ActivityBuffer,
    next_correlation_id: u32,
    clock_ns: u64,
}

impl TracerState {
    /// Appends a record, returning the buffer it completed, if any.
    fn append(&mut self, record: ActivityRecord) -> Option<ActivityBuffer> {
        let size = self.options.aligned(record.size_bytes());
        let completed = if !self.pending.is_empty()
            && self.pending.valid_bytes + size > self.options.buffer_size
        {
            Some(std::mem::take(&mut self.pending))
        } else {
            None
        };
        self.pending.valid_bytes += size;
        self.pending.records.push(record);
        completed
    }

    const fn is_enabled(&self, kind: ActivityKind) -> bool {
        self.enabled & kind.bit() != 0
    }
}

/// In-process tracer producing deterministic activity.
///
/// Clones share state, so a test can keep one handle to launch kernels
/// while the profiler owns another.
#[derive(Clone, Debug)]
pub struct SimulatedTracer {
    state: Arc<Mutex<TracerState>>,
}

impl SimulatedTracer {
    /// A tracer with nothing enabled, using `options`' buffer geometry.
    #[must_use]
    pub fn new(options: &ProfilerOptions) -> Self {
        Self {
            state: Arc::new(Mutex::new(TracerState {
                options: options.clone(),
                sink: None,
                enabled: 0,
                external_ids: FxHashMap::default(),
                pending: ActivityBuffer::default(),
                next_correlation_id: 1,
                clock_ns: 0,
            })),
        }
    }

    /// Simulates a kernel launch and returns its internal correlation id.
    ///
    /// Records are written only for enabled kinds. Buffers that fill up are
    /// delivered to the registered sink on the calling thread.
    pub fn launch(&self, launch: &SimulatedLaunch) -> u32 {
        let mut completed = Vec::new();
        let correlation_id;
        let sink;
        {
            let mut state = self.state.lock();
            correlation_id = state.next_correlation_id;
            state.next_correlation_id += 1;
            let start_ns = state.clock_ns;
            state.clock_ns += launch.duration_ns;

            if state.is_enabled(ActivityKind::Driver) {
                completed.extend(state.append(ActivityRecord::Driver {
                    correlation_id,
                    name: "cuLaunchKernel".to_string(),
                }));
            }
            let external_id = state
                .external_ids
                .get(&thread::current().id())
                .and_then(|ids| ids.last().copied());
            if let (true, Some(external_id)) = (
                state.is_enabled(ActivityKind::ExternalCorrelation),
                external_id,
            ) {
                completed.extend(state.append(ActivityRecord::ExternalCorrelation {
                    correlation_id,
                    external_id,
                }));
            }
            if state.is_enabled(ActivityKind::ConcurrentKernel) {
                completed.extend(state.append(ActivityRecord::Kernel(KernelActivity {
                    name: launch.name.clone(),
                    device: launch.device,
                    stream: launch.stream,
                    correlation_id,
                    start_ns,
                    end_ns: start_ns + launch.duration_ns,
                    grid: launch.grid,
                    block: launch.block,
                    cluster: [1, 1, 1],
                    static_shared_memory: 0,
                    dynamic_shared_memory: launch.dynamic_shared_memory,
                    registers: launch.registers,
                })));
            }
            sink = state.sink.clone();
        }
        trace!(correlation_id, kernel = %launch.name, "simulated launch");

        // Delivered outside the tracer lock; the sink takes the profiler's.
        for buffer in completed {
            match &sink {
                Some(sink) => sink.deliver(buffer),
                None => warn!(records = buffer.records.len(), "no sink registered; dropping buffer"),
            }
        }
        correlation_id
    }

    /// Depth of the calling thread's external correlation stack.
    #[must_use]
    pub fn correlation_depth(&self) -> usize {
        self.state
            .lock()
            .external_ids
            .get(&thread::current().id())
            .map_or(0, Vec::len)
    }

    /// Returns true if `kind` is being recorded.
    #[must_use]
    pub fn is_enabled(&self, kind: ActivityKind) -> bool {
        self.state.lock().is_enabled(kind)
    }
}

impl ActivityTracer for SimulatedTracer {
    fn register_sink(&mut self, sink: ActivitySink) {
        self.state.lock().sink = Some(sink);
    }

    fn enable(&mut self, kind: ActivityKind) {
        self.state.lock().enabled |= kind.bit();
    }

    fn disable(&mut self, kind: ActivityKind) {
        self.state.lock().enabled &= !kind.bit();
    }

    fn push_external_correlation_id(&mut self, id: u64) {
        self.state
            .lock()
            .external_ids
            .entry(thread::current().id())
            .or_default()
            .push(id);
    }

    fn pop_external_correlation_id(&mut self) -> Option<u64> {
        let mut state = self.state.lock();
        let thread = thread::current().id();
        let ids = state.external_ids.get_mut(&thread)?;
        let id = ids.pop();
        if ids.is_empty() {
            state.external_ids.remove(&thread);
        }
        id
    }

    fn flush_all(&mut self) -> Vec<ActivityBuffer> {
        let pending = std::mem::take(&mut self.state.lock().pending);
        if pending.is_empty() {
            Vec::new()
        } else {
            vec![pending]
        }
    }
}

/// Extracts the qualified name from an Itanium-mangled symbol, dropping
/// template and parameter lists. Unmangled names are returned unchanged.
#[must_use]
pub fn demangle(name: &str) -> String {
    let Some(rest) = name.strip_prefix("_Z") else {
        return name.to_string();
    };
    let (nested, mut rest) = match rest.strip_prefix('N') {
        Some(r) => (true, r),
        None => (false, rest),
    };

    let mut parts = Vec::new();
    loop {
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        if digits == 0 {
            break;
        }
        let Ok(len) = rest[..digits].parse::<usize>() else {
            break;
        };
        let Some(end) = digits.checked_add(len) else {
            return name.to_string();
        };
        let Some(ident) = rest.get(digits..end) else {
            return name.to_string();
        };
        parts.push(ident);
        rest = &rest[end..];
        if !nested {
            break;
        }
    }

    if parts.is_empty() {
        name.to_string()
    } else {
        parts.join("::")
    }
}
