//! Launch shape and per-thread work for the three persistent kernels.
//!
//! Every function returns `None` when no shape keeps the persistent
//! buffers resident; the caller then falls back to a non-persistent
//! strategy.

use crate::heuristic::{ReductionParams, ScheduleHeuristic};
use crate::launch_config::{ceil_div, grid_outer_normalization_params, to_u32};
use crate::normalization::inner_outer_persistent_buffer_batches;
use crate::options::SchedulerOptions;
use serde::Serialize;
use tessel_gpu::{DeviceInfo, LaunchParams};
use tracing::debug;

/// Threads per block the block-persistent kernels aim for.
const TARGET_THREADS_PER_BLOCK: i64 = 128;

/// Sizes and flags the persistent heuristics decide from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PersistentHeuristicArgs {
    /// Product of the innermost run of same-type axes of the reference.
    pub inner_most_dimension_numel: i64,
    /// Product of the reduced extents of the reference.
    pub total_reduction_numel: i64,
    /// Product of the iteration extents of the reference.
    pub total_iteration_numel: i64,
    /// Resident bytes per iteration element.
    pub max_persistent_buffer_size: i64,
    /// Fusion inputs sharing the inner dimension.
    pub n_tensor_inputs: i64,
    /// Largest element size among those inputs.
    pub max_input_dtype_size: i64,
    /// Vector width.
    pub vectorize_factor: i64,
    /// Keep projected buffers resident.
    pub project_persistent_buffers: bool,
}

impl PersistentHeuristicArgs {
    /// Register bytes one thread needs to stage a vectorized load of every
    /// input before it is consumed.
    fn input_staging_bytes(&self) -> i64 {
        self.n_tensor_inputs.max(1) * self.max_input_dtype_size.max(1) * self.vectorize_factor.max(1)
    }

    /// Largest number of vectorized batches a thread may hold in registers
    /// next to its input staging.
    fn batch_max(&self, options: &SchedulerOptions) -> i64 {
        let bytes_per_element = ceil_div(
            self.max_persistent_buffer_size,
            self.total_reduction_numel.max(1),
        );
        let bytes_per_batch = (bytes_per_element * self.vectorize_factor.max(1)).max(1);
        let budget = options.buffer_registers_per_thread() * options.bytes_per_register
            - self.input_staging_bytes();
        (budget / bytes_per_batch).max(1)
    }
}

/// Parameters for a persistent kernel over innermost reductions.
///
/// blockDim.x starts at one warp and doubles until each thread's batch of
/// vectorized elements fits the register budget; blockDim.y fills the block
/// to 128 threads with further rows.
#[must_use]
pub fn inner_persistent_heuristic(
    args: &PersistentHeuristicArgs,
    device: &DeviceInfo,
    options: &SchedulerOptions,
) -> Option<ReductionParams> {
    if args.max_persistent_buffer_size > options.register_file_size(device) {
        debug!(size = args.max_persistent_buffer_size, "inner persistent buffer exceeds registers");
        return None;
    }
    let vectorize_factor = args.vectorize_factor.max(1);
    let after_vectorization = ceil_div(args.total_reduction_numel, vectorize_factor);
    let batch_max = args.batch_max(options);
    let max_threads = i64::from(device.max_threads_per_block);

    let mut bdimx = i64::from(device.warp_size).min(after_vectorization).max(1);
    while ceil_div(after_vectorization, bdimx) > batch_max && bdimx * 2 <= max_threads {
        bdimx *= 2;
    }
    let batches = ceil_div(after_vectorization, bdimx);
    if batches > batch_max {
        return None;
    }
    let bdimy = (TARGET_THREADS_PER_BLOCK / bdimx)
        .min(args.total_iteration_numel)
        .max(1);

    let mut params = ReductionParams::new(ScheduleHeuristic::InnerPersistent);
    params.persistent_kernel = true;
    params.fastest_dim = true;
    params.project_persistent_buffers = args.project_persistent_buffers;
    params.cross_block_inner_reduction = bdimx > 1;
    params.vectorize_inner_reduction = vectorize_factor > 1;
    params.unroll_factor_inner_reduction = vectorize_factor;
    params.batches_per_block_inner_reduction = batches;
    params.launch_params = LaunchParams::default().with_block(to_u32(bdimx), to_u32(bdimy));
    debug!(bdimx, bdimy, batches, "inner persistent heuristic");
    Some(params)
}

/// Parameters for a persistent kernel over outer reductions.
///
/// When the iteration domain cannot fill the device with blocks, the
/// reduction is spread over the grid as well; otherwise each block keeps
/// whole columns resident.
#[must_use]
pub fn outer_persistent_heuristic(
    args: &PersistentHeuristicArgs,
    device: &DeviceInfo,
    options: &SchedulerOptions,
) -> Option<ReductionParams> {
    let vectorize_factor = args.vectorize_factor.max(1);
    let after_vectorization = ceil_div(args.total_iteration_numel, vectorize_factor);
    let sm_count = i64::from(device.multiprocessor_count);

    let mut params = ReductionParams::new(ScheduleHeuristic::OuterPersistent);
    params.persistent_kernel = true;
    params.fastest_dim = false;
    params.project_persistent_buffers = args.project_persistent_buffers;
    params.vectorize_iter_dom = vectorize_factor > 1;
    params.unroll_factor_iter_dom = vectorize_factor;

    if ceil_div(after_vectorization, options.max_bdimx) < sm_count {
        if let Some(grid) = grid_outer_normalization_params(
            args.total_reduction_numel,
            args.total_iteration_numel,
            vectorize_factor,
            args.max_persistent_buffer_size,
            device,
            options,
        ) {
            params.cross_block_inner_reduction = true;
            params.cross_grid_inner_reduction = true;
            params.batches_per_block_inner_reduction = grid.persistent_buffer_factor;
            params.launch_params = grid.launch_params;
            debug!(
                launch = %params.launch_params,
                batches = grid.persistent_buffer_factor,
                unswitch = grid.unswitch_factor,
                "grid outer persistent heuristic"
            );
            return Some(params);
        }
    }

    if args.max_persistent_buffer_size > options.register_file_size(device) {
        debug!(size = args.max_persistent_buffer_size, "outer persistent buffer exceeds registers");
        return None;
    }
    let batch_max = args.batch_max(options);
    let max_threads = i64::from(device.max_threads_per_block);
    let bdimx = after_vectorization.min(i64::from(device.warp_size)).max(1);
    let mut bdimy = 1;
    while ceil_div(args.total_reduction_numel, bdimy) > batch_max
        && bdimx * bdimy * 2 <= max_threads
    {
        bdimy *= 2;
    }
    let batches = ceil_div(args.total_reduction_numel, bdimy);
    if batches > batch_max {
        return None;
    }
    params.cross_block_inner_reduction = bdimy > 1;
    params.batches_per_block_inner_reduction = batches;
    params.launch_params = LaunchParams::default().with_block(to_u32(bdimx), to_u32(bdimy));
    debug!(bdimx, bdimy, batches, "block outer persistent heuristic");
    Some(params)
}

/// Parameters for a kernel computing inner and outer reductions together.
///
/// The inner dimension is split between threads and batches by
/// [`inner_outer_persistent_buffer_batches`]. If the buffers do not fit
/// registers (the relaxed file when projecting), they move to shared memory
/// when it can hold them.
#[must_use]
pub fn inner_outer_persistent_heuristic(
    args: &PersistentHeuristicArgs,
    available_smem: i64,
    device: &DeviceInfo,
    options: &SchedulerOptions,
) -> Option<ReductionParams> {
    let vectorize_factor = args.vectorize_factor.max(1);
    let warp = i64::from(device.warp_size);
    let register_limit = if args.project_persistent_buffers {
        options.relaxed_register_file_size(device)
    } else {
        options.register_file_size_full(device)
    };

    let in_registers = if args.max_persistent_buffer_size <= register_limit {
        inner_outer_persistent_buffer_batches(
            args.inner_most_dimension_numel,
            args.total_iteration_numel,
            args.max_persistent_buffer_size,
            vectorize_factor,
            warp,
            false,
            options,
        )
    } else {
        None
    };
    let (batches, shared_mem) = match in_registers {
        Some(batches) => (batches, false),
        None if args.max_persistent_buffer_size <= available_smem => (
            inner_outer_persistent_buffer_batches(
                args.inner_most_dimension_numel,
                args.total_iteration_numel,
                args.max_persistent_buffer_size,
                vectorize_factor,
                warp,
                true,
                options,
            )?,
            true,
        ),
        None => {
            debug!(
                size = args.max_persistent_buffer_size,
                available_smem, "inner outer buffer fits neither registers nor shared memory"
            );
            return None;
        }
    };

    let gdimy = i64::from(device.multiprocessor_count)
        .min(args.total_iteration_numel)
        .max(1);
    let mut params = ReductionParams::new(ScheduleHeuristic::InnerOuterPersistent);
    params.persistent_kernel = true;
    params.fastest_dim = true;
    params.combined_inner_outer = true;
    params.project_persistent_buffers = args.project_persistent_buffers;
    params.shared_mem_persistent_buffer = shared_mem;
    params.cross_block_inner_reduction = true;
    params.cross_block_outer_reduction = true;
    params.cross_grid_outer_reduction = true;
    params.vectorize_inner_reduction = vectorize_factor > 1;
    params.unroll_factor_inner_reduction = vectorize_factor;
    params.batches_per_block_inner_reduction = batches.persistent_batch;
    // Outer partials span the inner dimension and are split the same way.
    params.batches_per_block_outer_reduction = batches.persistent_batch;
    let mut launch = LaunchParams::default();
    launch.bdimx = Some(to_u32(batches.threads_per_block));
    launch.gdimy = Some(to_u32(gdimy));
    if shared_mem {
        launch.smem = usize::try_from(args.max_persistent_buffer_size).unwrap_or(usize::MAX);
    }
    params.launch_params = launch;
    debug!(
        threads = batches.threads_per_block,
        batch = batches.persistent_batch,
        gdimy,
        shared_mem,
        "inner outer persistent heuristic"
    );
    Some(params)
}
