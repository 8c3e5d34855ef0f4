//! The persistent scheduler entry points.
//!
//! ```rust,ignore
//! let scheduler = PersistentScheduler::new(ScheduleHeuristic::InnerPersistent)?;
//! scheduler.can_schedule_compile_time(&fusion)?;
//! if scheduler.can_schedule_run_time(&fusion, &runtime)?.is_ok() {
//!     if let Some(params) = scheduler.compute_heuristics(&fusion, &runtime)? {
//!         let reference = scheduler.schedule(&mut fusion, &params)?;
//!     }
//! }
//! ```

use crate::error::{RejectReason, SchedulerError, SchedulerResult};
use crate::heuristic::{ReductionParams, ScheduleHeuristic};
use crate::heuristics::{
    inner_outer_persistent_heuristic, inner_persistent_heuristic, outer_persistent_heuristic,
    PersistentHeuristicArgs,
};
use crate::helper::{canonical_dim_reduction, split_inner_outer, PersistentSchedulerHelper};
use crate::normalization::{available_smem_size, tensor_input_num_and_max_type_size};
use crate::options::SchedulerOptions;
use crate::persistent_buffer::persistent_buffers;
use crate::runtime::SchedulerRuntimeInfo;
use crate::topology::{check_reductions_are_inner_outer, has_shared_input};
use tessel_ir::{Fusion, ParallelType, TvId};
use tracing::debug;

/// One of the three persistent reduction schedulers.
#[derive(Clone, Debug)]
pub struct PersistentScheduler {
    heuristic: ScheduleHeuristic,
    helper: PersistentSchedulerHelper,
}

impl PersistentScheduler {
    /// Creates a scheduler with default options.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::NotPersistent` for a non-persistent kind.
    pub fn new(heuristic: ScheduleHeuristic) -> SchedulerResult<Self> {
        Self::with_options(heuristic, SchedulerOptions::default())
    }

    /// Creates a scheduler with the given options.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::NotPersistent` for a non-persistent kind and
    /// `SchedulerError::InvalidOption` for out-of-range tunables.
    pub fn with_options(
        heuristic: ScheduleHeuristic,
        options: SchedulerOptions,
    ) -> SchedulerResult<Self> {
        if !heuristic.is_persistent() {
            return Err(SchedulerError::NotPersistent(heuristic));
        }
        options.validate()?;
        Ok(Self {
            heuristic,
            helper: PersistentSchedulerHelper::new(options),
        })
    }

    /// The heuristic kind this scheduler implements.
    #[must_use]
    pub fn heuristic(&self) -> ScheduleHeuristic {
        self.heuristic
    }

    /// The shared helper.
    #[must_use]
    pub fn helper(&self) -> &PersistentSchedulerHelper {
        &self.helper
    }

    /// Compile-time eligibility: the common gates, plus the layout and
    /// shared-input requirements of combined inner/outer kernels.
    ///
    /// # Errors
    ///
    /// Returns the first rejection.
    pub fn can_schedule_compile_time(&self, fusion: &Fusion) -> Result<(), RejectReason> {
        self.helper.common_compile_time_check(fusion, self.heuristic)?;
        if self.heuristic != ScheduleHeuristic::InnerOuterPersistent {
            return Ok(());
        }
        let (inner, outer) = split_inner_outer(fusion, &fusion.reduction_tvs());
        if !check_reductions_are_inner_outer(fusion, &inner, &outer) {
            return Err(RejectReason::new(
                self.heuristic,
                "to use combined reduction, inner reduction tensor should be [I,I,...,R,R] \
                 and outer reduction tensor should be [R,R,...,I,I]",
            ));
        }
        if !has_shared_input(fusion, &inner, &outer) {
            return Err(RejectReason::new(
                self.heuristic,
                "to use combined reduction, inner reduction and outer reduction should have \
                 shared input.",
            ));
        }
        Ok(())
    }

    /// Run-time eligibility for the bound sizes in `runtime`.
    ///
    /// The outer `Result` carries invariant violations such as unbound
    /// extents; the inner one is the eligibility decision.
    ///
    /// # Errors
    ///
    /// Fails if the parameters cannot be derived.
    pub fn can_schedule_run_time(
        &self,
        fusion: &Fusion,
        runtime: &SchedulerRuntimeInfo,
    ) -> SchedulerResult<Result<(), RejectReason>> {
        let reduction_tvs = fusion.reduction_tvs();
        let common = self
            .helper
            .common_heuristic_params(fusion, runtime, &reduction_tvs)?;
        if self.heuristic != ScheduleHeuristic::InnerOuterPersistent {
            if let Err(reason) = self.helper.run_time_check_iter_size(
                &common.properties,
                runtime.device(),
                self.heuristic,
            ) {
                return Ok(Err(reason));
            }
        }
        if self.compute_heuristics(fusion, runtime)?.is_none() {
            return Ok(Err(RejectReason::new(
                self.heuristic,
                "not enough registers or shared memory for persistence",
            )));
        }
        Ok(Ok(()))
    }

    /// Derives the parameters for this scheduler's kind, or `None` if no
    /// persistent shape fits.
    ///
    /// # Errors
    ///
    /// Fails if the fusion has no reference reduction or persistent buffer,
    /// or an extent is unbound.
    pub fn compute_heuristics(
        &self,
        fusion: &Fusion,
        runtime: &SchedulerRuntimeInfo,
    ) -> SchedulerResult<Option<ReductionParams>> {
        let reduction_tvs = fusion.reduction_tvs();
        let is_inner_outer = self.heuristic == ScheduleHeuristic::InnerOuterPersistent;
        let common = self
            .helper
            .common_heuristic_params(fusion, runtime, &reduction_tvs)?;
        let decision = self.helper.check_and_set_persistent_buffer_heuristics(
            fusion,
            runtime,
            &reduction_tvs,
            is_inner_outer,
        )?;
        let (n_tensor_inputs, max_input_dtype_size) =
            tensor_input_num_and_max_type_size(fusion, common.reduced_tv);

        let args = PersistentHeuristicArgs {
            inner_most_dimension_numel: common.properties.inner_most_dimension_numel,
            total_reduction_numel: common.properties.total_reduction_numel,
            total_iteration_numel: common.properties.total_iteration_numel,
            max_persistent_buffer_size: decision.max_persistent_size,
            n_tensor_inputs,
            max_input_dtype_size,
            vectorize_factor: common.vectorize_factor,
            project_persistent_buffers: decision.project_persistent_buffers,
        };
        let device = runtime.device();
        let options = self.helper.options();
        let params = match self.heuristic {
            ScheduleHeuristic::InnerPersistent => {
                inner_persistent_heuristic(&args, device, options)
            }
            ScheduleHeuristic::OuterPersistent => {
                outer_persistent_heuristic(&args, device, options)
            }
            ScheduleHeuristic::InnerOuterPersistent => {
                let buffers = persistent_buffers(fusion).persistent_buffers;
                let smem = available_smem_size(fusion, runtime, &buffers);
                inner_outer_persistent_heuristic(&args, smem, device, options)
            }
            other => return Err(SchedulerError::NotPersistent(other)),
        };
        match &params {
            Some(p) => debug!(heuristic = %self.heuristic, "\n{p}"),
            None => debug!(heuristic = %self.heuristic, "no persistent configuration"),
        }
        Ok(params)
    }

    /// Applies `params` to the fusion and returns the scheduled reference.
    ///
    /// # Errors
    ///
    /// Propagates failures of the graph and loop transforms.
    pub fn schedule(&self, fusion: &mut Fusion, params: &ReductionParams) -> SchedulerResult<TvId> {
        schedule_persistent_kernel(fusion, params, &self.helper)
    }
}

/// Prepares the fusion and schedules its reference reduction.
///
/// For combined kernels the inner reductions go through the general path
/// and each outer reduction is laid out across the grid separately.
///
/// # Errors
///
/// Propagates failures of the graph and loop transforms.
pub fn schedule_persistent_kernel(
    fusion: &mut Fusion,
    params: &ReductionParams,
    helper: &PersistentSchedulerHelper,
) -> SchedulerResult<TvId> {
    let setup = helper.before_schedule(fusion, params)?;
    if !params.combined_inner_outer {
        return helper.schedule_reduction_general(fusion, params, &setup.reduction_tvs);
    }

    let (inner, outer) = split_inner_outer(fusion, &setup.reduction_tvs);
    if outer.is_empty() {
        return Err(SchedulerError::NoOuterReduction);
    }
    let reference = helper.schedule_reduction_general(fusion, params, &inner)?;
    for tv in outer {
        schedule_combined_outer(fusion, params, tv)?;
    }
    Ok(reference)
}

/// Lays out one outer reduction of a combined kernel as `[R, I]`: rows
/// across gridDim.y, the inner dimension across blockDim.x in the same
/// batches as the inner reduction.
fn schedule_combined_outer(
    fusion: &mut Fusion,
    params: &ReductionParams,
    tv: TvId,
) -> SchedulerResult<()> {
    let (has_iter, has_red) = canonical_dim_reduction(fusion, tv, false)?;
    if !has_red {
        return Err(SchedulerError::NoReductionAxis(tv));
    }
    if !has_iter {
        return Err(SchedulerError::NoIterationAxis(tv));
    }
    let view = fusion.tv_mut(tv)?;
    // Canonical [I, R]; put the reduction outside.
    view.reorder(&[(1, 0)])?;
    if params.vectorize_inner_reduction && params.unroll_factor_inner_reduction > 1 {
        view.split(1, params.unroll_factor_inner_reduction, true)?;
        view.parallelize(2, ParallelType::Vectorize)?;
    }
    view.split(1, params.batches_per_block_outer_reduction, false)?;
    view.parallelize(2, ParallelType::TIDx)?;
    if params.cross_grid_outer_reduction {
        view.parallelize(0, ParallelType::BIDy)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessel_gpu::DeviceInfo;
    use tessel_ir::{BinaryOpType, DataType, Dim, ExpressionEvaluator};

    fn runtime(n: i64, k: i64) -> SchedulerRuntimeInfo {
        SchedulerRuntimeInfo::new(
            ExpressionEvaluator::new().with("n", n).with("k", k),
            DeviceInfo::mock(),
        )
    }

    #[test]
    fn test_rejects_non_persistent_kind() {
        assert_eq!(
            PersistentScheduler::new(ScheduleHeuristic::PointWise).unwrap_err(),
            SchedulerError::NotPersistent(ScheduleHeuristic::PointWise)
        );
    }

    #[test]
    fn test_rejects_invalid_options() {
        let options = SchedulerOptions {
            outer_grid_threads_per_block: 0,
            ..SchedulerOptions::default()
        };
        assert!(matches!(
            PersistentScheduler::with_options(ScheduleHeuristic::OuterPersistent, options),
            Err(SchedulerError::InvalidOption {
                field: "outer_grid_threads_per_block",
                ..
            })
        ));
    }

    #[test]
    fn test_inner_outer_requires_shared_input() {
        let mut fusion = Fusion::new();
        let a = fusion.add_input(DataType::Float, [Dim::sym("n"), Dim::sym("k")]);
        let b = fusion.add_input(DataType::Float, [Dim::sym("n"), Dim::sym("k")]);
        let ab = fusion.binary(BinaryOpType::Add, a, b).unwrap();
        let inner = fusion.sum(a, &[1]).unwrap();
        let bc = fusion.broadcast(inner, &[false, true]).unwrap();
        let norm = fusion.binary(BinaryOpType::Sub, ab, bc).unwrap();
        let outer = fusion.sum(b, &[0]).unwrap();
        fusion.add_output(norm);
        fusion.add_output(outer);

        let scheduler = PersistentScheduler::new(ScheduleHeuristic::InnerOuterPersistent).unwrap();
        let err = scheduler.can_schedule_compile_time(&fusion).unwrap_err();
        assert!(err.message.ends_with("should have shared input."));
    }

    #[test]
    fn test_run_time_rejects_narrow_deep() {
        let mut fusion = Fusion::new();
        let t0 = fusion.add_input(DataType::Float, [Dim::sym("n"), Dim::sym("k")]);
        let t1 = fusion.sum(t0, &[1]).unwrap();
        let t2 = fusion.broadcast(t1, &[false, true]).unwrap();
        let t3 = fusion.binary(BinaryOpType::Sub, t0, t2).unwrap();
        fusion.add_output(t3);

        let scheduler = PersistentScheduler::new(ScheduleHeuristic::InnerPersistent).unwrap();
        let verdict = scheduler.can_schedule_run_time(&fusion, &runtime(2, 16384)).unwrap();
        assert_eq!(verdict.unwrap_err().message, "not enough blocks");
        assert_eq!(
            scheduler.can_schedule_run_time(&fusion, &runtime(1024, 1024)).unwrap(),
            Ok(())
        );
    }
}
