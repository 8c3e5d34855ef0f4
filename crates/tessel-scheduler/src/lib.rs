//! # Tessel Persistent Reduction Scheduler
//!
//! This crate decides whether a reduction or normalization fusion can keep
//! its working set resident for the whole kernel, sizes that working set,
//! and picks the launch shape.
//!
//! ## Overview
//!
//! Scheduling one fusion goes through four stages:
//!
//! 1. **Compile-time gates**: structural eligibility, independent of sizes
//! 2. **Run-time gates**: eligibility for the bound input sizes
//! 3. **Heuristics**: a [`ReductionParams`] record, or `None` when no
//!    persistent shape fits
//! 4. **Scheduling**: caching, projection and loop transforms on the fusion
//!
//! ## Pipeline Position
//!
//! ```text
//! [Fusion segmenter]
//!     |
//!     v
//! [Scheduler]   <- This crate: gates, heuristics, loop transforms
//!     |
//!     v
//! [Lowering / Codegen]
//! ```
//!
//! ## Main Types
//!
//! - [`PersistentScheduler`]: Entry point for the three persistent kinds
//! - [`PersistentSchedulerHelper`]: The shared gates and derivations
//! - [`PreferredLaunchConfig`]: Grid/block search for grid-persistent kernels
//! - [`PersistentBufferInfo`]: Tensors that stay resident across a reduction
//! - [`ReductionParams`]: The heuristic decision record
//! - [`RejectReason`]: Why a heuristic declined a fusion

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod helper;
pub mod heuristic;
pub mod heuristics;
pub mod launch_config;
pub mod normalization;
pub mod options;
pub mod persistent_buffer;
pub mod properties;
pub mod runtime;
pub mod scheduler;
pub mod topology;

pub use error::{RejectReason, SchedulerError, SchedulerResult};
pub use helper::{
    canonical_dim_reduction, schedule_reduction_tv, CommonHeuristicParams,
    PersistentBufferDecision, PersistentSchedulerHelper, ScheduleSetup,
};
pub use heuristic::{
    persistent_heuristic_for, reduction_type, ReductionParams, ReductionType, ScheduleHeuristic,
};
pub use heuristics::{
    inner_outer_persistent_heuristic, inner_persistent_heuristic, outer_persistent_heuristic,
    PersistentHeuristicArgs,
};
pub use launch_config::{
    grid_outer_normalization_params, GridOuterNormalizationParams, PreferredLaunchConfig,
};
pub use normalization::{
    available_smem_size, inner_outer_persistent_buffer_batches, outer_reduction_dtype_size,
    partial_reduction_buffer_size, tensor_input_num_and_max_type_size, InnerOuterBatches,
};
pub use options::SchedulerOptions;
pub use persistent_buffer::{
    persistent_buffer_size, persistent_buffers, project_persistent_buffers, PersistentBufferInfo,
    PersistentBufferSize,
};
pub use properties::{reduction_properties, vectorization_factor, ReductionTvProperties};
pub use runtime::SchedulerRuntimeInfo;
pub use scheduler::{schedule_persistent_kernel, PersistentScheduler};
pub use topology::{check_reductions_are_inner_outer, has_shared_input};
