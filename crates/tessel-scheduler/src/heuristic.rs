//! Heuristic kinds, reduction classification and the parameter record.

use serde::{Deserialize, Serialize};
use std::fmt;
use tessel_gpu::LaunchParams;
use tessel_ir::{Fusion, TvId};

/// The scheduling strategies a fusion segment can be assigned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScheduleHeuristic {
    /// Nothing to compute.
    NoOp,
    /// Elementwise only.
    PointWise,
    /// Non-persistent reduction.
    Reduction,
    /// Persistent kernel over innermost reductions.
    InnerPersistent,
    /// Persistent kernel over outer reductions.
    OuterPersistent,
    /// Persistent kernel with both inner and outer reductions.
    InnerOuterPersistent,
    /// Transpose.
    Transpose,
    /// Matrix multiply.
    Matmul,
}

impl ScheduleHeuristic {
    /// Stable name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::NoOp => "no-op",
            Self::PointWise => "pointwise",
            Self::Reduction => "reduction",
            Self::InnerPersistent => "inner_persistent",
            Self::OuterPersistent => "outer_persistent",
            Self::InnerOuterPersistent => "inner_outer_persistent",
            Self::Transpose => "transpose",
            Self::Matmul => "matmul",
        }
    }

    /// Returns true for the three persistent kinds.
    #[must_use]
    pub const fn is_persistent(self) -> bool {
        matches!(
            self,
            Self::InnerPersistent | Self::OuterPersistent | Self::InnerOuterPersistent
        )
    }

    /// The reduction pattern a persistent heuristic expects.
    #[must_use]
    pub const fn expected_reduction_type(self) -> ReductionType {
        match self {
            Self::InnerPersistent => ReductionType::Inner,
            Self::OuterPersistent => ReductionType::Outer,
            Self::InnerOuterPersistent => ReductionType::InnerOuter,
            _ => ReductionType::None,
        }
    }
}

impl fmt::Display for ScheduleHeuristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where the reduced axes of a fusion sit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReductionType {
    /// Every reduction reduces its innermost axis.
    Inner,
    /// No reduction reduces its innermost axis.
    Outer,
    /// Both kinds are present.
    InnerOuter,
    /// No reductions.
    None,
}

/// Classifies a set of reduction tensors.
#[must_use]
pub fn reduction_type(fusion: &Fusion, reduction_tvs: &[TvId]) -> ReductionType {
    let inner = reduction_tvs
        .iter()
        .filter(|tv| fusion.tv(**tv).is_fastest_dim_reduction())
        .count();
    let outer = reduction_tvs.len() - inner;
    match (inner, outer) {
        (0, 0) => ReductionType::None,
        (_, 0) => ReductionType::Inner,
        (0, _) => ReductionType::Outer,
        _ => ReductionType::InnerOuter,
    }
}

/// The persistent heuristic matching the fusion's reductions, or `None`
/// when it has none.
#[must_use]
pub fn persistent_heuristic_for(fusion: &Fusion) -> Option<ScheduleHeuristic> {
    match reduction_type(fusion, &fusion.reduction_tvs()) {
        ReductionType::Inner => Some(ScheduleHeuristic::InnerPersistent),
        ReductionType::Outer => Some(ScheduleHeuristic::OuterPersistent),
        ReductionType::InnerOuter => Some(ScheduleHeuristic::InnerOuterPersistent),
        ReductionType::None => None,
    }
}

/// The decision record a reduction heuristic produces.
///
/// "Inner reduction" fields describe the reduction of the reference tensor
/// whether or not it is the fastest dimension; "outer reduction" fields are
/// only used by combined inner/outer kernels.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReductionParams {
    /// The heuristic that produced these parameters.
    pub heuristic: ScheduleHeuristic,
    /// Reduction is over the innermost dimension.
    pub fastest_dim: bool,
    /// Keep the reduction's working set resident for the whole kernel.
    pub persistent_kernel: bool,
    /// Keep narrower producers of the persistent buffers resident instead.
    pub project_persistent_buffers: bool,
    /// Schedule as three axes: outer reduction, iteration, inner reduction.
    pub schedule_3d: bool,
    /// Reduce across threads of a block.
    pub cross_block_inner_reduction: bool,
    /// Reduce across blocks of the grid.
    pub cross_grid_inner_reduction: bool,
    /// Outer reduction across threads of a block.
    pub cross_block_outer_reduction: bool,
    /// Outer reduction across blocks of the grid.
    pub cross_grid_outer_reduction: bool,
    /// Inner and outer reductions are fused into one kernel.
    pub combined_inner_outer: bool,
    /// Persistent buffers live in shared memory rather than registers.
    pub shared_mem_persistent_buffer: bool,
    /// Vectorize the inner reduction axis.
    pub vectorize_inner_reduction: bool,
    /// Vectorize the iteration axis.
    pub vectorize_iter_dom: bool,
    /// Unroll (or vector width) of the inner reduction.
    pub unroll_factor_inner_reduction: i64,
    /// Unroll (or vector width) of the iteration axis.
    pub unroll_factor_iter_dom: i64,
    /// Unroll of the outer reduction.
    pub unroll_factor_outer_reduction: i64,
    /// Persistent batches per thread along the inner reduction.
    pub batches_per_block_inner_reduction: i64,
    /// Persistent batches per thread along the outer reduction.
    pub batches_per_block_outer_reduction: i64,
    /// Launch dimensions; unbound entries are inferred downstream.
    pub launch_params: LaunchParams,
}

impl ReductionParams {
    /// Default parameters for a heuristic.
    #[must_use]
    pub fn new(heuristic: ScheduleHeuristic) -> Self {
        Self {
            heuristic,
            fastest_dim: true,
            persistent_kernel: false,
            project_persistent_buffers: false,
            schedule_3d: false,
            cross_block_inner_reduction: false,
            cross_grid_inner_reduction: false,
            cross_block_outer_reduction: false,
            cross_grid_outer_reduction: false,
            combined_inner_outer: false,
            shared_mem_persistent_buffer: false,
            vectorize_inner_reduction: false,
            vectorize_iter_dom: false,
            unroll_factor_inner_reduction: 1,
            unroll_factor_iter_dom: 1,
            unroll_factor_outer_reduction: 1,
            batches_per_block_inner_reduction: 1,
            batches_per_block_outer_reduction: 1,
            launch_params: LaunchParams::default(),
        }
    }

    /// Returns true if any axis is unrolled or vectorized.
    #[must_use]
    pub const fn is_unrolled(&self) -> bool {
        self.unroll_factor_inner_reduction > 1
            || self.unroll_factor_iter_dom > 1
            || self.unroll_factor_outer_reduction > 1
    }
}

impl fmt::Display for ReductionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "===== {} parameters =====", self.heuristic)?;
        writeln!(
            f,
            "{} {}",
            if self.fastest_dim { "Red On Fastest Dim" } else { "Red On Slow Dim" },
            if self.persistent_kernel { "Persistent Kernel" } else { "" }
        )?;
        if self.project_persistent_buffers {
            writeln!(f, "Project persistent buffers")?;
        }
        if self.shared_mem_persistent_buffer {
            writeln!(f, "Persistent buffers in shared memory")?;
        }
        let mut flags = Vec::new();
        if self.cross_block_inner_reduction {
            flags.push("cross block");
        }
        if self.cross_grid_inner_reduction {
            flags.push("cross grid");
        }
        writeln!(f, "Inner reduction: {}", flags.join(" / "))?;
        if self.combined_inner_outer {
            writeln!(
                f,
                "Outer reduction: {}{}",
                if self.cross_block_outer_reduction { "cross block " } else { "" },
                if self.cross_grid_outer_reduction { "cross grid" } else { "" }
            )?;
        }
        writeln!(
            f,
            "Unroll: inner {} / iter {} / outer {}; vectorize inner {} iter {}",
            self.unroll_factor_inner_reduction,
            self.unroll_factor_iter_dom,
            self.unroll_factor_outer_reduction,
            self.vectorize_inner_reduction,
            self.vectorize_iter_dom
        )?;
        writeln!(
            f,
            "Batches per block: inner {} / outer {}",
            self.batches_per_block_inner_reduction, self.batches_per_block_outer_reduction
        )?;
        write!(f, "Launch: {}", self.launch_params)
    }
}
