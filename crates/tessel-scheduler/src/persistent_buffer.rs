//! Persistent buffer analysis.
//!
//! A tensor is a persistent buffer of a reduction when it feeds the
//! reduction and is also read again by computation that depends on the
//! reduction's result. Such a tensor must stay resident across the whole
//! reduction. In
//!
//! ```text
//! t1 = cast(t0: half -> float)
//! t2 = sum(t1, 1)
//! t3 = broadcast(t2)
//! t4 = t1 - t3
//! ```
//!
//! `t1` is persistent. Keeping `t0` resident instead halves the footprint at
//! the price of recomputing the cast, which is what projection does.

use crate::error::SchedulerResult;
use crate::runtime::SchedulerRuntimeInfo;
use rustc_hash::FxHashSet;
use serde::Serialize;
use tessel_ir::{ExprId, ExprKind, Fusion, RootDomainMap, TvId};
use tracing::{debug, trace};

/// The persistent buffers of a fusion and their projection sources.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PersistentBufferInfo {
    /// Tensors that must stay resident, in discovery order.
    pub persistent_buffers: Vec<TvId>,
    /// For each buffer, the nearest half-precision-or-narrower producer
    /// reachable through casts and copies, if any.
    pub projection_sources: Vec<Option<TvId>>,
    /// For each buffer, the reduction it stays resident across.
    pub reductions: Vec<TvId>,
}

impl PersistentBufferInfo {
    /// Returns true if at least one buffer can be projected.
    #[must_use]
    pub fn has_projection(&self) -> bool {
        self.projection_sources.iter().any(Option::is_some)
    }
}

/// Raw and projected persistent buffer footprints, in bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PersistentBufferSize {
    /// Footprint keeping every buffer in its own type.
    pub persistent_buffer_size: i64,
    /// Footprint keeping projection sources where available. Never larger
    /// than `persistent_buffer_size`.
    pub projected_persistent_buffer_size: i64,
}

/// Finds every persistent buffer of the fusion's reductions.
#[must_use]
pub fn persistent_buffers(fusion: &Fusion) -> PersistentBufferInfo {
    let mut info = PersistentBufferInfo::default();
    let mut seen = FxHashSet::default();

    for red in fusion.reduction_tvs() {
        let after_reduction = fusion.descendants(red);
        let before_reduction = fusion.ancestors(red);

        let mut candidates: Vec<TvId> = before_reduction.iter().copied().collect();
        candidates.sort_unstable();

        for producer in candidates {
            if seen.contains(&producer) {
                continue;
            }
            let is_persistent = fusion.uses(producer).any(|use_expr| {
                use_expr.kind.outputs().iter().any(|&out| {
                    if out == red || before_reduction.contains(&out) {
                        return false;
                    }
                    after_reduction.contains(&out)
                        || fusion
                            .descendants(out)
                            .iter()
                            .any(|d| after_reduction.contains(d))
                })
            });
            if is_persistent {
                trace!(buffer = %producer, reduction = %red, "persistent buffer");
                seen.insert(producer);
                info.persistent_buffers.push(producer);
                info.projection_sources.push(projection_source(fusion, producer));
                info.reductions.push(red);
            }
        }
    }
    info
}

/// Walks back through casts and copies to the first producer of at most
/// two bytes per element that is narrower than `buffer`.
fn projection_source(fusion: &Fusion, buffer: TvId) -> Option<TvId> {
    let width = fusion.tv(buffer).dtype.size_bytes();
    let mut cur = buffer;
    while let Some(def) = fusion.definition(cur) {
        let (ExprKind::Cast { input, .. } | ExprKind::Set { input, .. }) = def.kind else {
            return None;
        };
        let dtype = fusion.tv(input).dtype;
        if dtype.size_bytes() <= 2 && dtype.size_bytes() < width {
            return Some(input);
        }
        cur = input;
    }
    None
}

/// Elements of `buffer` that stay resident: the product of its root
/// extents mapped to a reduced axis of `reduction`.
fn buffer_numel(
    fusion: &Fusion,
    runtime: &SchedulerRuntimeInfo,
    root_map: &RootDomainMap,
    reduction: TvId,
    buffer: TvId,
) -> SchedulerResult<i64> {
    let reduced_axes: Vec<usize> = fusion
        .tv(reduction)
        .root
        .iter()
        .enumerate()
        .filter(|(_, id)| id.is_reduction())
        .map(|(pos, _)| pos)
        .collect();
    runtime.numel_where(fusion, buffer, |pos| {
        reduced_axes
            .iter()
            .any(|&red_pos| root_map.can_map(buffer, pos, reduction, red_pos))
    })
}

/// Computes the raw and projected footprints of `info`'s buffers.
///
/// Each buffer contributes the extents it shares with the reduced axes of
/// its reduction times its element size. Distinct projection sources are
/// counted once.
///
/// # Errors
///
/// Returns `SchedulerError::UnboundExtent` if a mapped extent is unbound.
pub fn persistent_buffer_size(
    fusion: &Fusion,
    runtime: &SchedulerRuntimeInfo,
    info: &PersistentBufferInfo,
) -> SchedulerResult<PersistentBufferSize> {
    let root_map = RootDomainMap::build(fusion);

    let mut raw = 0_i64;
    let mut projected = 0_i64;
    let mut counted = FxHashSet::default();
    let buffers = info
        .persistent_buffers
        .iter()
        .zip(&info.projection_sources)
        .zip(&info.reductions);
    for ((&buffer, source), &reduction) in buffers {
        let numel = buffer_numel(fusion, runtime, &root_map, reduction, buffer)?;
        raw += numel * dtype_size(fusion, buffer);
        let resident = source.unwrap_or(buffer);
        if counted.insert(resident) {
            projected += numel * dtype_size(fusion, resident);
        }
    }
    let sizes = PersistentBufferSize {
        persistent_buffer_size: raw,
        projected_persistent_buffer_size: projected.min(raw),
    };
    debug!(
        raw = sizes.persistent_buffer_size,
        projected = sizes.projected_persistent_buffer_size,
        "persistent buffer size"
    );
    Ok(sizes)
}

pub(crate) fn dtype_size(fusion: &Fusion, tv: TvId) -> i64 {
    i64::try_from(fusion.tv(tv).dtype.size_bytes()).unwrap_or(i64::MAX)
}

/// Rewrites the fusion so the consumers of each projectable buffer that do
/// not feed a reduction recompute the buffer from its narrow source.
///
/// With `project_to_inputs` unset nothing is rewritten. Returns the
/// recomputed tensors.
///
/// # Errors
///
/// Returns an error if a recompute chain cannot be cloned.
pub fn project_persistent_buffers(
    fusion: &mut Fusion,
    project_to_inputs: bool,
) -> SchedulerResult<Vec<TvId>> {
    if !project_to_inputs {
        return Ok(Vec::new());
    }
    let info = persistent_buffers(fusion);
    let reductions = fusion.reduction_tvs();
    let mut recomputed = Vec::new();

    for (&buffer, source) in info.persistent_buffers.iter().zip(&info.projection_sources) {
        let Some(source) = *source else {
            continue;
        };
        let uses: Vec<ExprId> = {
            let graph: &Fusion = fusion;
            graph
                .uses(buffer)
                .filter(|e| {
                    !e.kind
                        .outputs()
                        .iter()
                        .any(|&out| feeds_reduction(graph, &reductions, out))
                })
                .map(|e| e.id)
                .collect()
        };
        for use_id in uses {
            let fresh = fusion.recompute_from(source, buffer)?;
            fusion.replace_use(use_id, buffer, fresh);
            trace!(%buffer, %source, %fresh, "projected persistent buffer");
            recomputed.push(fresh);
        }
    }
    Ok(recomputed)
}

fn feeds_reduction(fusion: &Fusion, reductions: &[TvId], tv: TvId) -> bool {
    reductions
        .iter()
        .any(|&red| red == tv || fusion.depends_on(red, tv))
}
