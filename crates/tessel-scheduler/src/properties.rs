//! Scalar properties of a reduction and its vectorization width.

use crate::error::SchedulerResult;
use crate::options::SchedulerOptions;
use crate::runtime::SchedulerRuntimeInfo;
use serde::Serialize;
use tessel_ir::{Fusion, IterType, RootDomainMap, TvId};

/// Size description of one reduction, computed per scheduling attempt.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReductionTvProperties {
    /// The reduction is over the innermost non-broadcast axis.
    pub fastest_dim_reduction: bool,
    /// Product of all reduced extents.
    pub total_reduction_numel: i64,
    /// Product of all iteration extents.
    pub total_iteration_numel: i64,
    /// Product of the innermost run of axes sharing the innermost axis type.
    pub inner_most_dimension_numel: i64,
    /// Number of axes in that innermost run.
    pub inner_most_dimension_ndims: usize,
}

/// Computes the properties of reduction tensor `tv`.
///
/// Broadcast axes are ignored.
///
/// # Errors
///
/// Returns `SchedulerError::UnboundExtent` if an extent is not bound.
pub fn reduction_properties(
    fusion: &Fusion,
    runtime: &SchedulerRuntimeInfo,
    tv: TvId,
) -> SchedulerResult<ReductionTvProperties> {
    let view = fusion.tv(tv);
    let fastest_dim_reduction = view.is_fastest_dim_reduction();
    let inner_type = if fastest_dim_reduction {
        IterType::Reduction
    } else {
        IterType::Iteration
    };

    let mut props = ReductionTvProperties {
        fastest_dim_reduction,
        total_reduction_numel: 1,
        total_iteration_numel: 1,
        inner_most_dimension_numel: 1,
        inner_most_dimension_ndims: 0,
    };
    let mut in_inner_run = true;
    for id in view.root.iter().rev() {
        if id.is_broadcast() {
            continue;
        }
        let extent = runtime.evaluate(&id.extent)?;
        if id.is_reduction() {
            props.total_reduction_numel *= extent;
        } else {
            props.total_iteration_numel *= extent;
        }
        if in_inner_run && id.iter_type == inner_type {
            props.inner_most_dimension_numel *= extent;
            props.inner_most_dimension_ndims += 1;
        } else {
            in_inner_run = false;
        }
    }
    Ok(props)
}

/// Innermost non-broadcast root position of `tv`.
pub(crate) fn innermost_axis(fusion: &Fusion, tv: TvId) -> Option<usize> {
    fusion
        .tv(tv)
        .root
        .iter()
        .rposition(|id| !id.is_broadcast())
}

/// Fusion inputs and outputs whose innermost axis maps to `reference`'s
/// innermost axis. Outputs that reduce that axis away are excluded.
#[must_use]
pub fn inputs_outputs_with_inner_dim(fusion: &Fusion, reference: TvId) -> Vec<TvId> {
    let Some(ref_axis) = innermost_axis(fusion, reference) else {
        return Vec::new();
    };
    let root_map = RootDomainMap::build(fusion);
    fusion
        .inputs()
        .iter()
        .chain(fusion.outputs())
        .copied()
        .filter(|tv| {
            innermost_axis(fusion, *tv).is_some_and(|axis| {
                !fusion.tv(*tv).root[axis].is_reduction()
                    && root_map.can_map(*tv, axis, reference, ref_axis)
            })
        })
        .collect()
}

/// Widest power-of-two vector factor for the reduction producer `reduced_tv`.
///
/// Limited by the widest vector access over the largest element type among
/// the inputs and outputs sharing the inner dimension, and by the innermost
/// `inner_ndims` extents of `reduced_tv`.
///
/// # Errors
///
/// Returns `SchedulerError::UnboundExtent` if an inner extent is not bound.
pub fn vectorization_factor(
    fusion: &Fusion,
    runtime: &SchedulerRuntimeInfo,
    options: &SchedulerOptions,
    reduced_tv: TvId,
    inner_ndims: usize,
) -> SchedulerResult<i64> {
    let max_dtype = inputs_outputs_with_inner_dim(fusion, reduced_tv)
        .into_iter()
        .map(|tv| fusion.tv(tv).dtype.size_bytes())
        .max()
        .unwrap_or_else(|| fusion.tv(reduced_tv).dtype.size_bytes());
    let max_dtype = i64::try_from(max_dtype).unwrap_or(i64::MAX).max(1);

    let mut inner_numel = 1;
    for id in fusion
        .tv(reduced_tv)
        .root
        .iter()
        .rev()
        .filter(|id| !id.is_broadcast())
        .take(inner_ndims)
    {
        inner_numel *= runtime.evaluate(&id.extent)?;
    }

    let mut factor = (options.max_vector_bytes / max_dtype).max(1);
    while factor > 1 && inner_numel % factor != 0 {
        factor /= 2;
    }
    Ok(factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessel_gpu::DeviceInfo;
    use tessel_ir::{DataType, Dim, ExpressionEvaluator};

    fn runtime(n: i64, k: i64) -> SchedulerRuntimeInfo {
        SchedulerRuntimeInfo::new(
            ExpressionEvaluator::new().with("n", n).with("k", k),
            DeviceInfo::mock(),
        )
    }

    #[test]
    fn test_inner_reduction_properties() {
        let mut fusion = Fusion::new();
        let t0 = fusion.add_input(DataType::Float, [Dim::sym("n"), Dim::sym("k")]);
        let t1 = fusion.sum(t0, &[1]).unwrap();
        fusion.add_output(t1);

        let props = reduction_properties(&fusion, &runtime(128, 1024), t1).unwrap();
        assert!(props.fastest_dim_reduction);
        assert_eq!(props.total_reduction_numel, 1024);
        assert_eq!(props.total_iteration_numel, 128);
        assert_eq!(props.inner_most_dimension_numel, 1024);
        assert_eq!(props.inner_most_dimension_ndims, 1);
    }

    #[test]
    fn test_outer_reduction_properties() {
        let mut fusion = Fusion::new();
        let t0 = fusion.add_input(
            DataType::Float,
            [Dim::Static(4), Dim::sym("n"), Dim::sym("k")],
        );
        let t1 = fusion.sum(t0, &[0, 1]).unwrap();
        fusion.add_output(t1);

        let props = reduction_properties(&fusion, &runtime(32, 64), t1).unwrap();
        assert!(!props.fastest_dim_reduction);
        assert_eq!(props.total_reduction_numel, 128);
        assert_eq!(props.total_iteration_numel, 64);
        assert_eq!(props.inner_most_dimension_numel, 64);
    }

    #[test]
    fn test_unbound_extent() {
        let mut fusion = Fusion::new();
        let t0 = fusion.add_input(DataType::Float, [Dim::sym("n"), Dim::sym("m")]);
        let t1 = fusion.sum(t0, &[1]).unwrap();
        assert!(reduction_properties(&fusion, &runtime(8, 8), t1).is_err());
    }

    #[test]
    fn test_vectorization_factor() {
        let opts = SchedulerOptions::default();
        let mut fusion = Fusion::new();
        let t0 = fusion.add_input(DataType::Half, [Dim::sym("n"), Dim::sym("k")]);
        let t1 = fusion.cast(t0, DataType::Float).unwrap();
        let t2 = fusion.sum(t1, &[1]).unwrap();
        fusion.add_output(t2);

        // Half input: 16 / 2 = 8 lanes, 1024 is divisible by 8.
        assert_eq!(
            vectorization_factor(&fusion, &runtime(8, 1024), &opts, t1, 1).unwrap(),
            8
        );
        // 1026 = 2 * 513 only admits a factor of 2.
        assert_eq!(
            vectorization_factor(&fusion, &runtime(8, 1026), &opts, t1, 1).unwrap(),
            2
        );
    }
}
