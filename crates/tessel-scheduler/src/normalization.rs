//! Sizing helpers shared by the persistent normalization heuristics.

use crate::error::{SchedulerError, SchedulerResult};
use crate::launch_config::ceil_div;
use crate::options::SchedulerOptions;
use crate::persistent_buffer::dtype_size;
use crate::properties::inputs_outputs_with_inner_dim;
use crate::runtime::SchedulerRuntimeInfo;
use crate::topology::is_inner_reduction;
use tessel_ir::{Fusion, TvId};
use tracing::trace;

/// Bytes held by the partial results of the outer reductions among
/// `reduction_tvs`.
///
/// Each outer reduction keeps one partial value per iteration element until
/// the grid-wide combine, so its buffer covers the non-reduction,
/// non-broadcast extent of the reduction output. Inner reductions are
/// skipped.
///
/// # Errors
///
/// Returns `SchedulerError::UnboundExtent` for an unbound extent.
pub fn partial_reduction_buffer_size(
    fusion: &Fusion,
    runtime: &SchedulerRuntimeInfo,
    reduction_tvs: &[TvId],
) -> SchedulerResult<i64> {
    let mut total = 0;
    for &tv in reduction_tvs {
        if is_inner_reduction(fusion, tv) {
            continue;
        }
        let view = fusion.tv(tv);
        let numel = runtime.numel_where(fusion, tv, |pos| {
            let id = &view.root[pos];
            !id.is_reduction() && !id.is_broadcast()
        })?;
        total += numel * dtype_size(fusion, tv);
    }
    Ok(total)
}

/// Number of fusion inputs that share `reduced_tv`'s inner dimension, and
/// the largest of their element sizes.
///
/// The count is at least 1 and the size at least 1 byte.
#[must_use]
pub fn tensor_input_num_and_max_type_size(fusion: &Fusion, reduced_tv: TvId) -> (i64, i64) {
    let mut n_tensor_inputs = 0_i64;
    let mut max_dtype_size = 1_i64;
    for tv in inputs_outputs_with_inner_dim(fusion, reduced_tv) {
        if !fusion.is_input(tv) {
            continue;
        }
        max_dtype_size = max_dtype_size.max(dtype_size(fusion, tv));
        n_tensor_inputs += 1;
    }
    (n_tensor_inputs.max(1), max_dtype_size)
}

/// Element size of the first outer reduction.
///
/// # Errors
///
/// Returns `SchedulerError::NoOuterReduction` if every reduction is inner.
pub fn outer_reduction_dtype_size(fusion: &Fusion, reduction_tvs: &[TvId]) -> SchedulerResult<i64> {
    reduction_tvs
        .iter()
        .find(|&&tv| !is_inner_reduction(fusion, tv))
        .map(|&tv| dtype_size(fusion, tv))
        .ok_or(SchedulerError::NoOuterReduction)
}

/// Shared memory a block may spend on persistent buffers.
///
/// The device's opt-in limit minus the workspace the block reduction needs:
/// one slot per thread of the widest buffer element.
#[must_use]
pub fn available_smem_size(
    fusion: &Fusion,
    runtime: &SchedulerRuntimeInfo,
    persistent_buffers: &[TvId],
) -> i64 {
    let device = runtime.device();
    let widest = persistent_buffers
        .iter()
        .map(|&tv| dtype_size(fusion, tv))
        .max()
        .unwrap_or(4);
    let workspace = i64::from(device.max_threads_per_block) * widest;
    let optin = i64::try_from(device.shared_memory_per_block_optin).unwrap_or(i64::MAX);
    (optin - workspace).max(0)
}

/// Per-thread batch and block width for a combined inner/outer kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InnerOuterBatches {
    /// Vectorized inner elements each thread keeps resident.
    pub persistent_batch: i64,
    /// Threads along the inner dimension.
    pub threads_per_block: i64,
}

/// Chooses how the inner dimension of a combined inner/outer kernel is
/// split between threads and per-thread batches.
///
/// Small inner dimensions use a fixed batch. Larger ones start from 128
/// threads and add a warp at a time while the batch exceeds the register
/// ceiling of `max_registers_per_thread - register_overhead` and the next
/// batch would still be at least the minimum batch for that size. Returns
/// `None` when the final batch does not fit, unless
/// `ignore_register_size_limit` is set (buffers in shared memory).
#[must_use]
pub fn inner_outer_persistent_buffer_batches(
    inner_dim_numel: i64,
    outer_dim_numel: i64,
    persistent_buffer_size: i64,
    vectorize_factor: i64,
    warp_size: i64,
    ignore_register_size_limit: bool,
    options: &SchedulerOptions,
) -> Option<InnerOuterBatches> {
    let vectorize_factor = vectorize_factor.max(1);
    let after_vectorization = ceil_div(inner_dim_numel, vectorize_factor);

    if inner_dim_numel <= 1024 {
        let batch = if vectorize_factor == 1 { 4 } else { 1 };
        let persistent_batch = batch.min(after_vectorization.max(1));
        let threads_per_block = ceil_div(inner_dim_numel, persistent_batch * vectorize_factor);
        return Some(InnerOuterBatches {
            persistent_batch,
            threads_per_block,
        });
    }

    let batch_min = if inner_dim_numel >= 3072 {
        if outer_dim_numel <= 2048 && inner_dim_numel == 3072 {
            3
        } else {
            4
        }
    } else if inner_dim_numel >= 2048 {
        2
    } else {
        1
    };

    let registers_per_batch = ceil_div(
        ceil_div(persistent_buffer_size, inner_dim_numel) * vectorize_factor,
        options.bytes_per_register,
    )
    .max(1);
    let batch_max = (options.buffer_registers_per_thread() / registers_per_batch).max(1);

    let threads_max = if after_vectorization >= 1024 { 512 } else { 256 };
    let mut threads_per_block = after_vectorization.min(128);
    let mut persistent_batch = ceil_div(after_vectorization, threads_per_block);
    while persistent_batch > batch_max
        && threads_per_block + warp_size <= threads_max
        && ceil_div(after_vectorization, threads_per_block + warp_size) >= batch_min
    {
        threads_per_block += warp_size;
        persistent_batch = ceil_div(after_vectorization, threads_per_block);
    }
    trace!(
        persistent_batch,
        threads_per_block,
        batch_max,
        batch_min,
        "inner outer batches"
    );

    (persistent_batch <= batch_max || ignore_register_size_limit).then_some(InnerOuterBatches {
        persistent_batch,
        threads_per_block,
    })
}
