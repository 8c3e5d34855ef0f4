//! Eligibility gates and parameter derivation shared by the persistent
//! schedulers.
//!
//! Compile-time eligibility is four ordered gates. Each returns the first
//! problem it finds as a [`RejectReason`]; later gates do not run once one
//! fails.
//!
//! ```rust,ignore
//! let helper = PersistentSchedulerHelper::default();
//! helper.common_compile_time_check(&fusion, ScheduleHeuristic::InnerPersistent)?;
//! let common = helper.common_heuristic_params(&fusion, &runtime, &fusion.reduction_tvs())?;
//! ```

use crate::error::{RejectReason, SchedulerError, SchedulerResult};
use crate::heuristic::{reduction_type, ReductionParams, ScheduleHeuristic};
use crate::normalization::partial_reduction_buffer_size;
use crate::options::SchedulerOptions;
use crate::persistent_buffer::{
    persistent_buffer_size, persistent_buffers, project_persistent_buffers,
};
use crate::properties::{reduction_properties, vectorization_factor, ReductionTvProperties};
use crate::runtime::SchedulerRuntimeInfo;
use crate::topology::{
    has_gather_to_broadcast_before_reduction, has_non_normalize_post_reduction_bcast,
    has_non_unique_bcast, is_inner_reduction, memory_promoting_lookup,
    reduction_interfering_view, requires_forward_view_replay,
};
use tessel_gpu::DeviceInfo;
use tessel_ir::{
    check_pattern_equivalence, ExprKind, Fusion, IterDomain, MemoryType, ParallelType,
    RootDomainMap, TvId,
};
use tracing::debug;

/// Values every persistent heuristic starts from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommonHeuristicParams {
    /// The reduction the kernel is shaped around.
    pub reference: TvId,
    /// Sole producer of `reference`.
    pub reduced_tv: TvId,
    /// Sizes of `reference`.
    pub properties: ReductionTvProperties,
    /// Vector width for `reduced_tv`.
    pub vectorize_factor: i64,
}

/// Whether to project persistent buffers and the resulting resident size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PersistentBufferDecision {
    /// Keep narrower producers resident instead of the buffers.
    pub project_persistent_buffers: bool,
    /// Resident bytes per iteration element.
    pub max_persistent_size: i64,
}

/// Tensors produced while preparing a fusion for scheduling.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScheduleSetup {
    /// Recomputed copies created by projection.
    pub dummy_outputs: Vec<TvId>,
    /// Local caches of the fusion inputs.
    pub cached_inputs: Vec<TvId>,
    /// `(cache, output)` pairs.
    pub cached_outputs: Vec<(TvId, TvId)>,
    /// Reduction tensors after caching.
    pub reduction_tvs: Vec<TvId>,
}

/// Splits reductions into inner and outer ones, keeping order.
pub(crate) fn split_inner_outer(fusion: &Fusion, reduction_tvs: &[TvId]) -> (Vec<TvId>, Vec<TvId>) {
    reduction_tvs
        .iter()
        .partition(|&&tv| is_inner_reduction(fusion, tv))
}

/// Shared logic of the inner, outer and combined persistent schedulers.
#[derive(Clone, Debug, Default)]
pub struct PersistentSchedulerHelper {
    options: SchedulerOptions,
}

impl PersistentSchedulerHelper {
    /// Creates a helper with the given tunables.
    #[must_use]
    pub fn new(options: SchedulerOptions) -> Self {
        Self { options }
    }

    /// The tunables in use.
    #[must_use]
    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    // ------------------------------------------------------------------
    // Compile-time gates
    // ------------------------------------------------------------------

    /// Gate 1: the fusion has reductions and tensor inputs, reads lookups
    /// only from inputs, contains no matrix products and broadcasts every
    /// axis to a single size.
    ///
    /// # Errors
    ///
    /// Returns the first violated condition.
    pub fn leading_common_compile_time_check(
        &self,
        fusion: &Fusion,
        heuristic: ScheduleHeuristic,
    ) -> Result<(), RejectReason> {
        if fusion.reduction_ops().next().is_none() {
            return Err(RejectReason::new(heuristic, "needs a reduction op"));
        }
        if fusion.inputs().is_empty() {
            return Err(RejectReason::new(
                heuristic,
                "Scheduling not supported with no input",
            ));
        }
        if let Some((op, lookup)) = memory_promoting_lookup(fusion) {
            return Err(RejectReason::new(
                heuristic,
                format!("{op} reads {lookup}, which is not a fusion input"),
            ));
        }
        if fusion.mma_ops().next().is_some() {
            return Err(RejectReason::new(heuristic, "no support for mma ops."));
        }
        if has_non_unique_bcast(fusion) {
            return Err(RejectReason::new(
                heuristic,
                "Broadcasting dimension might be broadcasting to multiple sizes.",
            ));
        }
        Ok(())
    }

    /// Gate 2: the reduction pattern matches the one `heuristic` handles.
    ///
    /// # Errors
    ///
    /// Rejects on a mismatch.
    pub fn check_reduction_type(
        &self,
        fusion: &Fusion,
        reduction_tvs: &[TvId],
        heuristic: ScheduleHeuristic,
    ) -> Result<(), RejectReason> {
        if reduction_type(fusion, reduction_tvs) != heuristic.expected_reduction_type() {
            return Err(RejectReason::new(
                heuristic,
                "ReductionType and heuristic doesn't match.",
            ));
        }
        Ok(())
    }

    /// Gate 3: consecutive reductions reduce mapped axes in the same
    /// pattern.
    ///
    /// # Errors
    ///
    /// Names the first unmapped pair.
    pub fn compile_time_check_reduction_axis(
        &self,
        fusion: &Fusion,
        reduction_tvs: &[TvId],
        heuristic: ScheduleHeuristic,
    ) -> Result<(), RejectReason> {
        if reduction_tvs.len() < 2 {
            return Ok(());
        }
        let root_map = RootDomainMap::build(fusion);
        for pair in reduction_tvs.windows(2) {
            if !check_pattern_equivalence(fusion, pair[0], pair[1], &root_map) {
                return Err(RejectReason::new(
                    heuristic,
                    format!("unmapped reduction {} and {}", pair[0], pair[1]),
                ));
            }
        }
        Ok(())
    }

    /// Gate 4: reshapes are harmless, all reductions have the same number
    /// of concrete root axes, a persistent buffer exists, and no
    /// unsupported broadcast or gather surrounds the reductions.
    ///
    /// # Errors
    ///
    /// Returns the first violated condition.
    pub fn trailing_common_compile_time_check(
        &self,
        fusion: &Fusion,
        reduction_tvs: &[TvId],
        heuristic: ScheduleHeuristic,
    ) -> Result<(), RejectReason> {
        let Some(&first) = reduction_tvs.first() else {
            return Err(RejectReason::new(heuristic, "needs a reduction op"));
        };
        let (inner, outer) = split_inner_outer(fusion, reduction_tvs);
        let reference = if !inner.is_empty() && !outer.is_empty() {
            inner[0]
        } else {
            first
        };

        if fusion.has_view_ops() {
            if requires_forward_view_replay(fusion) {
                return Err(RejectReason::new(
                    heuristic,
                    "Fusion requires view being reversible.",
                ));
            }
            if reduction_interfering_view(fusion, reference) {
                return Err(RejectReason::new(
                    heuristic,
                    "View may interfere with normalization scheduling.",
                ));
            }
        }

        let axis_count = fusion.tv(first).non_broadcast_root_count();
        for &red in &reduction_tvs[1..] {
            if fusion.tv(red).non_broadcast_root_count() != axis_count {
                return Err(RejectReason::new(
                    heuristic,
                    format!(
                        "inconsistent reduction root size: {}, expected: {axis_count}",
                        fusion.tv(red)
                    ),
                ));
            }
        }

        if persistent_buffers(fusion).persistent_buffers.is_empty() {
            return Err(RejectReason::new(
                heuristic,
                "no persistent buffer identified",
            ));
        }
        if has_non_normalize_post_reduction_bcast(fusion) {
            return Err(RejectReason::new(
                heuristic,
                "unsupported post reduction normalization",
            ));
        }
        if has_gather_to_broadcast_before_reduction(fusion, reduction_tvs) {
            return Err(RejectReason::new(
                heuristic,
                "has unsupported gather-like ops before normalization",
            ));
        }
        Ok(())
    }

    /// Runs the four gates in order. Combined inner/outer fusions check
    /// axis equivalence within the inner and within the outer reductions.
    ///
    /// # Errors
    ///
    /// Returns the rejection of the first gate that fails.
    pub fn common_compile_time_check(
        &self,
        fusion: &Fusion,
        heuristic: ScheduleHeuristic,
    ) -> Result<(), RejectReason> {
        self.leading_common_compile_time_check(fusion, heuristic)?;
        let reduction_tvs = fusion.reduction_tvs();
        self.check_reduction_type(fusion, &reduction_tvs, heuristic)?;
        if heuristic == ScheduleHeuristic::InnerOuterPersistent {
            // Inner and outer reductions reduce different axes by
            // definition; each kind must agree among itself.
            let (inner, outer) = split_inner_outer(fusion, &reduction_tvs);
            self.compile_time_check_reduction_axis(fusion, &inner, heuristic)?;
            self.compile_time_check_reduction_axis(fusion, &outer, heuristic)?;
        } else {
            self.compile_time_check_reduction_axis(fusion, &reduction_tvs, heuristic)?;
        }
        self.trailing_common_compile_time_check(fusion, &reduction_tvs, heuristic)
    }

    /// Rejects a deep reduction over too few iterations to occupy a useful
    /// fraction of the device.
    ///
    /// # Errors
    ///
    /// Rejects with "not enough blocks" when the reduction has at least
    /// `iter_size_reduction_multiplier` times the threads one SM holds and
    /// the iteration count is below `sm_count / iter_size_sm_divisor`.
    pub fn run_time_check_iter_size(
        &self,
        properties: &ReductionTvProperties,
        device: &DeviceInfo,
        heuristic: ScheduleHeuristic,
    ) -> Result<(), RejectReason> {
        let max_threads = i64::from(device.max_threads_per_multiprocessor);
        let sm_count = i64::from(device.multiprocessor_count);
        let divisor = self.options.iter_size_sm_divisor.max(1);
        if properties.total_reduction_numel >= max_threads * self.options.iter_size_reduction_multiplier
            && properties.total_iteration_numel < sm_count / divisor
        {
            return Err(RejectReason::new(heuristic, "not enough blocks"));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Parameter derivation
    // ------------------------------------------------------------------

    /// Picks the reference reduction and computes its sizes and the vector
    /// width of its producer.
    ///
    /// The reference is the first inner reduction when inner and outer
    /// reductions coexist, otherwise the first reduction.
    ///
    /// # Errors
    ///
    /// Fails if `reduction_tvs` is empty, the reference is not defined by a
    /// single-input reduction, the fusion has no inputs, or an extent is
    /// unbound.
    pub fn common_heuristic_params(
        &self,
        fusion: &Fusion,
        runtime: &SchedulerRuntimeInfo,
        reduction_tvs: &[TvId],
    ) -> SchedulerResult<CommonHeuristicParams> {
        let &first = reduction_tvs
            .first()
            .ok_or(SchedulerError::NoReductionTensor)?;
        let (inner, outer) = split_inner_outer(fusion, reduction_tvs);
        let reference = if !inner.is_empty() && !outer.is_empty() {
            inner[0]
        } else {
            first
        };

        if !fusion.tv(reference).has_reduction() {
            return Err(SchedulerError::NotAReduction(reference));
        }
        let reduced_tv = match fusion.definition(reference).map(|e| &e.kind) {
            Some(ExprKind::Reduction { input, .. }) => *input,
            Some(ExprKind::GroupedReduction { inputs, outputs, .. }) => outputs
                .iter()
                .position(|&out| out == reference)
                .and_then(|pos| inputs.get(pos).copied())
                .ok_or(SchedulerError::NotAReduction(reference))?,
            _ => return Err(SchedulerError::NotAReduction(reference)),
        };
        if fusion.inputs().is_empty() {
            return Err(SchedulerError::NoTensorInputs);
        }

        let properties = reduction_properties(fusion, runtime, reference)?;
        let vectorize_factor = vectorization_factor(
            fusion,
            runtime,
            &self.options,
            reduced_tv,
            properties.inner_most_dimension_ndims,
        )?;
        debug!(
            %reference,
            %reduced_tv,
            vectorize_factor,
            reduction_numel = properties.total_reduction_numel,
            iteration_numel = properties.total_iteration_numel,
            "common heuristic params"
        );
        Ok(CommonHeuristicParams {
            reference,
            reduced_tv,
            properties,
            vectorize_factor,
        })
    }

    /// Decides on buffer projection and computes the resident size.
    ///
    /// Projection is chosen when it strictly shrinks the buffers. Fusions
    /// with reshapes use the raw size since their buffers are never
    /// projected. For combined inner/outer kernels the outer partial
    /// results are added, and projection is also forced when the projected
    /// total fits in the relaxed register file.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::NoPersistentBuffer` if no buffer exists, or
    /// an error for an unbound extent.
    pub fn check_and_set_persistent_buffer_heuristics(
        &self,
        fusion: &Fusion,
        runtime: &SchedulerRuntimeInfo,
        reduction_tvs: &[TvId],
        is_inner_outer: bool,
    ) -> SchedulerResult<PersistentBufferDecision> {
        let info = persistent_buffers(fusion);
        if info.persistent_buffers.is_empty() {
            return Err(SchedulerError::NoPersistentBuffer);
        }
        let sizes = persistent_buffer_size(fusion, runtime, &info)?;

        let mut max_persistent_size = if fusion.has_view_ops() {
            sizes.persistent_buffer_size
        } else {
            sizes
                .persistent_buffer_size
                .min(sizes.projected_persistent_buffer_size)
        };
        let mut project = sizes.projected_persistent_buffer_size < sizes.persistent_buffer_size;

        if is_inner_outer {
            if reduction_tvs.is_empty() {
                return Err(SchedulerError::NoReductionTensor);
            }
            let outer_buffer = partial_reduction_buffer_size(fusion, runtime, reduction_tvs)?;
            if !project {
                let total_projected = sizes.projected_persistent_buffer_size + outer_buffer;
                if total_projected <= self.options.relaxed_register_file_size(runtime.device()) {
                    project = true;
                }
            }
            let resident = if project {
                sizes.projected_persistent_buffer_size
            } else {
                sizes.persistent_buffer_size
            };
            max_persistent_size = resident + outer_buffer;
        }

        debug!(project, max_persistent_size, is_inner_outer, "persistent buffer decision");
        Ok(PersistentBufferDecision {
            project_persistent_buffers: project,
            max_persistent_size,
        })
    }

    // ------------------------------------------------------------------
    // Graph preparation and scheduling
    // ------------------------------------------------------------------

    /// Prepares the fusion for scheduling under `params`.
    ///
    /// Projects buffers if requested and the fusion has no reshapes, caches
    /// inputs and outputs, resets stale memory placements, and moves the
    /// persistent buffers to shared memory when the parameters ask for it.
    ///
    /// # Errors
    ///
    /// Propagates graph transform failures.
    pub fn before_schedule(
        &self,
        fusion: &mut Fusion,
        params: &ReductionParams,
    ) -> SchedulerResult<ScheduleSetup> {
        let project_to_inputs = params.project_persistent_buffers && !fusion.has_view_ops();
        let dummy_outputs = project_persistent_buffers(fusion, project_to_inputs)?;

        // Inputs are cached even without unrolling so an input that is
        // itself the persistent buffer gets a local copy to keep resident.
        let cached_inputs = fusion.cache_inputs();
        let cached_outputs = fusion.cache_and_fork_outputs(params.is_unrolled());
        fusion.clear_memory_space();

        if params.shared_mem_persistent_buffer {
            for tv in persistent_buffers(fusion).persistent_buffers {
                fusion.set_memory_type(tv, MemoryType::Shared)?;
            }
        }

        Ok(ScheduleSetup {
            dummy_outputs,
            cached_inputs,
            cached_outputs,
            reduction_tvs: fusion.reduction_tvs(),
        })
    }

    /// Canonicalizes and schedules the first of `reduction_tvs`, grouping
    /// the reductions first when a grid-persistent outer kernel computes
    /// several. Returns the scheduled reference.
    ///
    /// A reshape produces a fresh tensor whose root already is the reshaped
    /// domain; there is no separate reshaped domain on the reference to
    /// replay transforms onto. With reshapes present this step only resets
    /// the reference's loop nest to its root order, dropping leaf
    /// transforms applied before scheduling.
    ///
    /// # Errors
    ///
    /// Fails if `reduction_tvs` is empty, the reference has no reduction
    /// axis, or it has only reduction axes while the parameters are not
    /// fastest-dim.
    pub fn schedule_reduction_general(
        &self,
        fusion: &mut Fusion,
        params: &ReductionParams,
        reduction_tvs: &[TvId],
    ) -> SchedulerResult<TvId> {
        let &reference = reduction_tvs
            .first()
            .ok_or(SchedulerError::NoReductionTensor)?;

        if fusion.has_view_ops() {
            let view = fusion.tv_mut(reference)?;
            view.leaf = view.root.to_vec();
        }

        if params.persistent_kernel
            && params.cross_grid_inner_reduction
            && !params.fastest_dim
            && reduction_tvs.len() > 1
            && !params.combined_inner_outer
        {
            fusion.group_reductions(reduction_tvs)?;
        }

        let (has_iter_axis, has_red_axis) =
            canonical_dim_reduction(fusion, reference, params.fastest_dim && params.schedule_3d)?;
        if !has_red_axis {
            return Err(SchedulerError::NoReductionAxis(reference));
        }
        if !has_iter_axis && !params.fastest_dim {
            return Err(SchedulerError::NoIterationAxis(reference));
        }
        schedule_reduction_tv(fusion, params, reference, has_iter_axis)?;
        Ok(reference)
    }
}

/// Merges `tv`'s leaf domain into one iteration axis followed by one
/// reduction axis. With `schedule_3d`, contiguous runs are merged in place,
/// giving `[R, I, R]` for a three-run domain.
///
/// Returns whether an iteration axis and a reduction axis exist.
///
/// # Errors
///
/// Propagates leaf transform failures.
pub fn canonical_dim_reduction(
    fusion: &mut Fusion,
    tv: TvId,
    schedule_3d: bool,
) -> SchedulerResult<(bool, bool)> {
    let view = fusion.tv_mut(tv)?;
    if !schedule_3d {
        let n = view.leaf.len();
        let iters: Vec<usize> = (0..n).filter(|&i| !view.leaf[i].is_reduction()).collect();
        let reds: Vec<usize> = (0..n).filter(|&i| view.leaf[i].is_reduction()).collect();
        let old_to_new: Vec<(usize, usize)> = iters
            .iter()
            .chain(&reds)
            .enumerate()
            .map(|(new, &old)| (old, new))
            .collect();
        view.reorder(&old_to_new)?;
    }

    let mut axis = 0;
    while axis + 1 < view.leaf.len() {
        let same_run = view.leaf[axis].is_reduction() == view.leaf[axis + 1].is_reduction();
        if same_run {
            view.merge(axis)?;
        } else {
            axis += 1;
        }
    }

    let has_iter = view.leaf.iter().any(|id| !id.is_reduction());
    let has_red = view.leaf.iter().any(IterDomain::is_reduction);
    Ok((has_iter, has_red))
}

/// Splits and binds the canonical `[I, R]` (or `[R]`) leaf domain of `tv`
/// according to `params`.
///
/// # Errors
///
/// Propagates leaf transform failures.
pub fn schedule_reduction_tv(
    fusion: &mut Fusion,
    params: &ReductionParams,
    tv: TvId,
    has_iter_axis: bool,
) -> SchedulerResult<()> {
    let view = fusion.tv_mut(tv)?;
    let launch = params.launch_params;
    let bdimy = launch.bdimy.map_or(1, i64::from);
    let bdimx = launch.bdimx.map_or(1, i64::from);

    if params.fastest_dim {
        let mut red_axis = usize::from(has_iter_axis);
        if params.vectorize_inner_reduction && params.unroll_factor_inner_reduction > 1 {
            view.split(red_axis, params.unroll_factor_inner_reduction, true)?;
            view.parallelize(red_axis + 1, ParallelType::Vectorize)?;
        }
        if params.persistent_kernel {
            // [batch, R / batch, (vect)]: the fixed batch stays serial.
            view.split(red_axis, params.batches_per_block_inner_reduction, false)?;
            red_axis += 1;
        }
        if params.cross_block_inner_reduction {
            view.parallelize(red_axis, ParallelType::TIDx)?;
        }
        if has_iter_axis {
            if bdimy > 1 {
                view.split(0, bdimy, true)?;
                view.parallelize(1, ParallelType::TIDy)?;
            }
            view.parallelize(0, ParallelType::BIDx)?;
        }
        return Ok(());
    }

    // Outer reduction, canonical [I, R].
    let mut red_axis = 1;
    if params.vectorize_iter_dom && params.unroll_factor_iter_dom > 1 {
        view.split(0, params.unroll_factor_iter_dom, true)?;
        view.parallelize(1, ParallelType::Vectorize)?;
        red_axis += 1;
    }
    view.split(0, bdimx, true)?;
    view.parallelize(1, ParallelType::TIDx)?;
    view.parallelize(0, ParallelType::BIDx)?;
    red_axis += 1;

    if params.persistent_kernel {
        view.split(red_axis, params.batches_per_block_inner_reduction, false)?;
        red_axis += 1;
    }
    if params.cross_grid_inner_reduction {
        view.split(red_axis, bdimy, true)?;
        view.parallelize(red_axis, ParallelType::BIDy)?;
        view.parallelize(red_axis + 1, ParallelType::TIDy)?;
    } else if params.cross_block_inner_reduction {
        view.parallelize(red_axis, ParallelType::TIDy)?;
    }
    Ok(())
}
