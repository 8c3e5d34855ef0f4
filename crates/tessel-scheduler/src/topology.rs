//! Structural checks shared by the reduction schedulers.

use crate::properties::innermost_axis;
use rustc_hash::FxHashMap;
use tessel_ir::{Dim, ExprKind, Fusion, RootDomainMap, TvId};

/// Name of the first gather-like op whose lookup tensor is not a fusion
/// input, if any.
///
/// Lookups are read at data-dependent positions, which is only supported
/// straight from global memory.
#[must_use]
pub fn memory_promoting_lookup(fusion: &Fusion) -> Option<(&'static str, TvId)> {
    fusion.exprs().find_map(|expr| match &expr.kind {
        ExprKind::IndexSelect { lookup, .. }
        | ExprKind::Gather { lookup, .. }
        | ExprKind::Select { lookup, .. }
            if !fusion.is_input(*lookup) =>
        {
            Some((expr.kind.name(), *lookup))
        }
        _ => None,
    })
}

/// Returns true if some broadcast axis is expanded to two different
/// concrete extents.
#[must_use]
pub fn has_non_unique_bcast(fusion: &Fusion) -> bool {
    let root_map = RootDomainMap::build(fusion);
    let mut concretized: FxHashMap<(TvId, usize), (usize, Dim)> = FxHashMap::default();
    for expr in fusion.exprs() {
        if !expr.kind.is_pointwise() {
            continue;
        }
        let output = expr.kind.outputs()[0];
        let out_root = &fusion.tv(output).root;
        for input in expr.kind.inputs() {
            let logical: Vec<usize> = fusion
                .tv(input)
                .root
                .iter()
                .enumerate()
                .filter(|(_, id)| !id.is_reduction())
                .map(|(pos, _)| pos)
                .collect();
            for (c_pos, p_pos) in logical.into_iter().enumerate() {
                let p_id = &fusion.tv(input).root[p_pos];
                let Some(c_id) = out_root.get(c_pos) else {
                    continue;
                };
                if !p_id.is_broadcast() || c_id.is_broadcast() {
                    continue;
                }
                let Some(set) = root_map.representative(output, c_pos) else {
                    continue;
                };
                match concretized.get(&(input, p_pos)) {
                    Some((prev_set, prev_extent))
                        if *prev_set != set && *prev_extent != c_id.extent =>
                    {
                        return true;
                    }
                    Some(_) => {}
                    None => {
                        concretized.insert((input, p_pos), (set, c_id.extent.clone()));
                    }
                }
            }
        }
    }
    false
}

/// Returns true if two reshapes of mapped inputs produce different shapes.
///
/// Such a fusion would need one reshape replayed onto the other's
/// consumers.
#[must_use]
pub fn requires_forward_view_replay(fusion: &Fusion) -> bool {
    let root_map = RootDomainMap::build(fusion);
    let views: Vec<(TvId, TvId)> = fusion
        .view_ops()
        .filter_map(|e| match e.kind {
            ExprKind::View { input, output } => Some((input, output)),
            _ => None,
        })
        .collect();
    for (i, &(in_a, out_a)) in views.iter().enumerate() {
        for &(in_b, out_b) in &views[i + 1..] {
            let rank_a = fusion.tv(in_a).root.len();
            let rank_b = fusion.tv(in_b).root.len();
            let mapped = rank_a == rank_b
                && (0..rank_a).all(|pos| root_map.can_map(in_a, pos, in_b, pos));
            let shape = |tv: TvId| -> Vec<Dim> {
                fusion.tv(tv).root.iter().map(|id| id.extent.clone()).collect()
            };
            if mapped && shape(out_a) != shape(out_b) {
                return true;
            }
        }
    }
    false
}

/// Returns true if a reshape mixes axes that `reference` reduces with axes
/// it iterates over in a way that cannot be split apart again.
///
/// The reshape input's axes are classified by whether they map to a reduced
/// axis of `reference`. The reshape is harmless when the two classes form
/// two contiguous groups and the output shape has a split point whose
/// prefix product equals the first group's product. Dynamic extents are
/// treated as interfering.
#[must_use]
pub fn reduction_interfering_view(fusion: &Fusion, reference: TvId) -> bool {
    let root_map = RootDomainMap::build(fusion);
    let reduced: Vec<usize> = fusion
        .tv(reference)
        .root
        .iter()
        .enumerate()
        .filter(|(_, id)| id.is_reduction())
        .map(|(pos, _)| pos)
        .collect();

    fusion.view_ops().any(|expr| {
        let ExprKind::View { input, output } = expr.kind else {
            return false;
        };
        let in_root = &fusion.tv(input).root;
        let classes: Vec<(bool, Option<i64>)> = in_root
            .iter()
            .enumerate()
            .filter(|(_, id)| !id.is_broadcast())
            .map(|(pos, id)| {
                let is_red = reduced
                    .iter()
                    .any(|&r| root_map.can_map(input, pos, reference, r));
                (is_red, id.extent.static_value())
            })
            .collect();
        let has_red = classes.iter().any(|(r, _)| *r);
        let has_iter = classes.iter().any(|(r, _)| !*r);
        if !has_red || !has_iter {
            return false;
        }
        let switches = classes.windows(2).filter(|w| w[0].0 != w[1].0).count();
        if switches != 1 {
            return true;
        }
        let first_class = classes[0].0;
        let Some(first_numel) = classes
            .iter()
            .take_while(|(r, _)| *r == first_class)
            .map(|(_, e)| *e)
            .product::<Option<i64>>()
        else {
            return true;
        };
        let mut prefix = 1_i64;
        for id in &fusion.tv(output).root {
            let Some(extent) = id.extent.static_value() else {
                return true;
            };
            prefix *= extent;
            if prefix == first_numel {
                return false;
            }
            if prefix > first_numel {
                return true;
            }
        }
        true
    })
}

/// Returns true if a broadcast downstream of a reduction does not restore
/// exactly the reduced axes.
///
/// The supported normalization pattern re-broadcasts a reduction result
/// along the axes it reduced before combining it with pre-reduction values.
#[must_use]
pub fn has_non_normalize_post_reduction_bcast(fusion: &Fusion) -> bool {
    let reductions = fusion.reduction_tvs();
    fusion.exprs().any(|expr| {
        let ExprKind::Broadcast { input, .. } = &expr.kind else {
            return false;
        };
        let output = expr.kind.outputs()[0];
        let Some(red) = nearest_reduction(fusion, &reductions, *input) else {
            return false;
        };
        let red_root = &fusion.tv(red).root;
        let out_root = &fusion.tv(output).root;
        out_root.len() != red_root.len()
            || red_root
                .iter()
                .zip(out_root.iter())
                .any(|(r, o)| r.is_reduction() != o.is_broadcast())
    })
}

/// The reduction reached from `tv` by walking up single-input producers.
fn nearest_reduction(fusion: &Fusion, reductions: &[TvId], tv: TvId) -> Option<TvId> {
    let mut cur = tv;
    loop {
        if reductions.contains(&cur) {
            return Some(cur);
        }
        let def = fusion.definition(cur)?;
        if !def.kind.is_pointwise() {
            return None;
        }
        cur = def
            .kind
            .inputs()
            .into_iter()
            .find(|inp| {
                reductions.contains(inp)
                    || reductions.iter().any(|r| fusion.depends_on(*inp, *r))
            })?;
    }
}

/// Returns true if a gather-like op feeding a reduction gathers through a
/// broadcast index.
#[must_use]
pub fn has_gather_to_broadcast_before_reduction(fusion: &Fusion, reduction_tvs: &[TvId]) -> bool {
    fusion.exprs().any(|expr| {
        let index = match &expr.kind {
            ExprKind::IndexSelect { index, .. } | ExprKind::Gather { index, .. } => *index,
            _ => return false,
        };
        let output = expr.kind.outputs()[0];
        let feeds_reduction = reduction_tvs
            .iter()
            .any(|&red| fusion.depends_on(red, output));
        feeds_reduction && fusion.tv(index).root.iter().any(|id| id.is_broadcast())
    })
}

/// Returns true if every inner reduction is `[I.., R..]` and every outer
/// reduction is `[R.., I..]`, ignoring broadcasts.
#[must_use]
pub fn check_reductions_are_inner_outer(
    fusion: &Fusion,
    inner_reduction_tvs: &[TvId],
    outer_reduction_tvs: &[TvId],
) -> bool {
    let pattern = |tv: TvId| -> Vec<bool> {
        fusion
            .tv(tv)
            .root
            .iter()
            .filter(|id| !id.is_broadcast())
            .map(|id| id.is_reduction())
            .collect()
    };
    let two_runs = |flags: &[bool], first: bool| {
        let switch = flags.iter().position(|f| *f != first).unwrap_or(flags.len());
        flags[switch..].iter().all(|f| *f != first) && switch > 0 && switch < flags.len()
    };
    inner_reduction_tvs
        .iter()
        .all(|&tv| two_runs(&pattern(tv), false))
        && outer_reduction_tvs
            .iter()
            .all(|&tv| two_runs(&pattern(tv), true))
}

/// Returns true if some inner reduction and some outer reduction read a
/// common tensor.
#[must_use]
pub fn has_shared_input(
    fusion: &Fusion,
    inner_reduction_tvs: &[TvId],
    outer_reduction_tvs: &[TvId],
) -> bool {
    inner_reduction_tvs.iter().any(|&inner| {
        let mut inner_deps = fusion.ancestors(inner);
        inner_deps.retain(|tv| fusion.is_input(*tv));
        outer_reduction_tvs.iter().any(|&outer| {
            fusion
                .ancestors(outer)
                .iter()
                .any(|tv| inner_deps.contains(tv))
        })
    })
}

/// Returns true if `tv`'s innermost axis is a reduction.
pub(crate) fn is_inner_reduction(fusion: &Fusion, tv: TvId) -> bool {
    innermost_axis(fusion, tv).is_some_and(|axis| fusion.tv(tv).root[axis].is_reduction())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessel_ir::{BinaryOpType, DataType};

    #[test]
    fn test_lookup_from_intermediate() {
        let mut fusion = Fusion::new();
        let t0 = fusion.add_input(DataType::Float, [16_i64, 8]);
        let idx = fusion.add_input(DataType::Int, [4_i64]);
        let ok = fusion.index_select(t0, 0, idx).unwrap();
        assert_eq!(memory_promoting_lookup(&fusion), None);

        let t1 = fusion.unary(tessel_ir::UnaryOpType::Exp, ok).unwrap();
        let bad = fusion.index_select(t1, 0, idx).unwrap();
        fusion.add_output(bad);
        assert_eq!(memory_promoting_lookup(&fusion), Some(("index_select", t1)));
    }

    #[test]
    fn test_unique_broadcast() {
        let mut fusion = Fusion::new();
        let t0 = fusion.add_input(DataType::Float, [Dim::sym("n"), Dim::sym("k")]);
        let t1 = fusion.sum(t0, &[1]).unwrap();
        let t2 = fusion.broadcast(t1, &[false, true]).unwrap();
        let t3 = fusion.binary(BinaryOpType::Sub, t0, t2).unwrap();
        fusion.add_output(t3);
        assert!(!has_non_unique_bcast(&fusion));
    }

    #[test]
    fn test_broadcast_to_two_sizes() {
        let mut fusion = Fusion::new();
        let a = fusion.add_input(DataType::Float, [Dim::sym("n"), Dim::sym("k")]);
        let b = fusion.add_input(DataType::Float, [Dim::sym("n"), Dim::sym("m")]);
        let s = fusion.sum(a, &[1]).unwrap();
        let sb = fusion.broadcast(s, &[false, true]).unwrap();
        let x = fusion.binary(BinaryOpType::Sub, a, sb).unwrap();
        let y = fusion.binary(BinaryOpType::Sub, b, sb).unwrap();
        fusion.add_output(x);
        fusion.add_output(y);
        assert!(has_non_unique_bcast(&fusion));
    }

    #[test]
    fn test_view_replay() {
        let mut fusion = Fusion::new();
        let t0 = fusion.add_input(DataType::Float, [8_i64, 16]);
        let a = fusion.reshape(t0, [128_i64]).unwrap();
        let b = fusion.reshape(t0, [8_i64, 4, 4]).unwrap();
        fusion.add_output(a);
        fusion.add_output(b);
        assert!(requires_forward_view_replay(&fusion));
    }

    #[test]
    fn test_view_keeps_reduction_separable() {
        let mut fusion = Fusion::new();
        let t0 = fusion.add_input(DataType::Float, [8_i64, 4, 4]);
        let t1 = fusion.reshape(t0, [8_i64, 16]).unwrap();
        let t2 = fusion.sum(t1, &[1]).unwrap();
        fusion.add_output(t2);
        // t0 is not mapped through the reshape, so no axis of it is
        // classified as reduced.
        assert!(!reduction_interfering_view(&fusion, t2));
    }

    #[test]
    fn test_view_merging_reduction_and_iteration() {
        let mut fusion = Fusion::new();
        let t0 = fusion.add_input(DataType::Float, [6_i64, 4]);
        let t1 = fusion.sum(t0, &[1]).unwrap();
        let t2 = fusion.reshape(t0, [8_i64, 3]).unwrap();
        fusion.add_output(t1);
        fusion.add_output(t2);
        // 6 (iteration) then 4 (reduced); no prefix of [8, 3] multiplies to 6.
        assert!(reduction_interfering_view(&fusion, t1));
    }

    #[test]
    fn test_post_reduction_broadcast() {
        let mut fusion = Fusion::new();
        let t0 = fusion.add_input(DataType::Float, [Dim::sym("n"), Dim::sym("k")]);
        let t1 = fusion.sum(t0, &[1]).unwrap();
        let good = fusion.broadcast(t1, &[false, true]).unwrap();
        fusion.add_output(good);
        assert!(!has_non_normalize_post_reduction_bcast(&fusion));

        let bad = fusion.broadcast(t1, &[true, false]).unwrap();
        fusion.add_output(bad);
        assert!(has_non_normalize_post_reduction_bcast(&fusion));
    }

    #[test]
    fn test_gather_through_broadcast_index() {
        let mut fusion = Fusion::new();
        let table = fusion.add_input(DataType::Float, [Dim::sym("n"), Dim::sym("k")]);
        let plain = fusion.add_input(DataType::Int, [Dim::sym("n")]);
        let rows = fusion.index_select(table, 0, plain).unwrap();
        let r0 = fusion.sum(rows, &[1]).unwrap();
        assert!(!has_gather_to_broadcast_before_reduction(&fusion, &[r0]));

        let bcast = fusion.add_input_with_root(
            DataType::Int,
            [tessel_ir::IterDomain::broadcast()].into_iter().collect(),
        );
        let picked = fusion.index_select(table, 0, bcast).unwrap();
        // Not upstream of any reduction yet.
        assert!(!has_gather_to_broadcast_before_reduction(&fusion, &[r0]));
        let r1 = fusion.sum(picked, &[1]).unwrap();
        assert!(has_gather_to_broadcast_before_reduction(&fusion, &[r0, r1]));
    }

    #[test]
    fn test_inner_outer_patterns() {
        let mut fusion = Fusion::new();
        let t0 = fusion.add_input(DataType::Float, [Dim::sym("n"), Dim::sym("k")]);
        let inner = fusion.sum(t0, &[1]).unwrap();
        let outer = fusion.sum(t0, &[0]).unwrap();
        assert!(check_reductions_are_inner_outer(&fusion, &[inner], &[outer]));
        assert!(!check_reductions_are_inner_outer(&fusion, &[outer], &[inner]));
        assert!(has_shared_input(&fusion, &[inner], &[outer]));
        assert!(is_inner_reduction(&fusion, inner));
        assert!(!is_inner_reduction(&fusion, outer));
    }
}
