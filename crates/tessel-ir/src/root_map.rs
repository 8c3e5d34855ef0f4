//! Equivalence of root axes across producer/consumer edges.
//!
//! Two root axes are mapped when data flows between them position by
//! position: an elementwise op maps each non-broadcast producer axis to the
//! consumer axis at the same position, a reduction maps its input axes to
//! its output's (reduced) axes, and a broadcast maps the axes it keeps.
//! Reshapes and matrix products break the mapping.
//!
//! The map is the transitive closure of these edges, stored in a
//! union-find over `(tensor, axis)` keys.

use crate::{ExprKind, Fusion, TvId};
use petgraph::unionfind::UnionFind;
use rustc_hash::FxHashMap;

/// Disjoint sets of root axes that index the same data.
pub struct RootDomainMap {
    offsets: FxHashMap<TvId, usize>,
    sets: UnionFind<usize>,
}

impl RootDomainMap {
    /// Builds the map over every live expression of `fusion`.
    #[must_use]
    pub fn build(fusion: &Fusion) -> Self {
        let mut offsets = FxHashMap::default();
        let mut total = 0;
        for tv in fusion.tvs() {
            offsets.insert(tv.id, total);
            total += tv.root.len();
        }
        let mut map = Self {
            offsets,
            sets: UnionFind::new(total),
        };
        for expr in fusion.exprs() {
            map.map_expr(fusion, &expr.kind);
        }
        map
    }

    fn key(&self, tv: TvId, axis: usize) -> Option<usize> {
        self.offsets.get(&tv).map(|base| base + axis)
    }

    fn union(&mut self, a: (TvId, usize), b: (TvId, usize)) {
        if let (Some(ka), Some(kb)) = (self.key(a.0, a.1), self.key(b.0, b.1)) {
            self.sets.union(ka, kb);
        }
    }

    /// Root positions of `tv`'s logical (non-reduction) axes.
    fn logical_positions(fusion: &Fusion, tv: TvId) -> Vec<usize> {
        fusion
            .tv(tv)
            .root
            .iter()
            .enumerate()
            .filter(|(_, id)| !id.is_reduction())
            .map(|(pos, _)| pos)
            .collect()
    }

    /// Maps producer logical axes onto consumer root axes pairwise,
    /// skipping the consumer positions in `skip_consumer`.
    fn map_positional(
        &mut self,
        fusion: &Fusion,
        producer: TvId,
        consumer: TvId,
        skip_consumer: impl Fn(usize) -> bool,
        skip_broadcast: bool,
    ) {
        let producer_axes = Self::logical_positions(fusion, producer);
        let consumer_axes = (0..fusion.tv(consumer).root.len()).filter(|p| !skip_consumer(*p));
        for (p_pos, c_pos) in producer_axes.into_iter().zip(consumer_axes) {
            if skip_broadcast && fusion.tv(producer).root[p_pos].is_broadcast() {
                continue;
            }
            self.union((producer, p_pos), (consumer, c_pos));
        }
    }

    fn map_expr(&mut self, fusion: &Fusion, kind: &ExprKind) {
        match kind {
            ExprKind::Unary { .. }
            | ExprKind::Cast { .. }
            | ExprKind::Binary { .. }
            | ExprKind::Ternary { .. }
            | ExprKind::Set { .. } => {
                let output = kind.outputs()[0];
                for input in kind.inputs() {
                    self.map_positional(fusion, input, output, |_| false, true);
                }
            }
            ExprKind::Reduction { input, output, .. } => {
                self.map_positional(fusion, *input, *output, |_| false, false);
            }
            ExprKind::GroupedReduction {
                inputs, outputs, ..
            } => {
                for (input, output) in inputs.iter().zip(outputs) {
                    self.map_positional(fusion, *input, *output, |_| false, false);
                }
            }
            ExprKind::Broadcast {
                input,
                output,
                flags,
            } => {
                self.map_positional(fusion, *input, *output, |p| flags[p], false);
            }
            ExprKind::IndexSelect {
                lookup,
                dim,
                output,
                ..
            } => {
                let producer_axes = Self::logical_positions(fusion, *lookup);
                for (logical, p_pos) in producer_axes.into_iter().enumerate() {
                    if logical != *dim {
                        self.union((*lookup, p_pos), (*output, logical));
                    }
                }
            }
            ExprKind::Gather { index, output, .. } => {
                self.map_positional(fusion, *index, *output, |_| false, true);
            }
            ExprKind::Select {
                lookup,
                dim,
                output,
            } => {
                let producer_axes = Self::logical_positions(fusion, *lookup);
                let mut c_pos = 0;
                for (logical, p_pos) in producer_axes.into_iter().enumerate() {
                    if logical == *dim {
                        continue;
                    }
                    self.union((*lookup, p_pos), (*output, c_pos));
                    c_pos += 1;
                }
            }
            ExprKind::View { .. } | ExprKind::Mma { .. } => {}
        }
    }

    /// Returns true if root axis `a_axis` of `a` and root axis `b_axis` of
    /// `b` are in the same equivalence set.
    #[must_use]
    pub fn can_map(&self, a: TvId, a_axis: usize, b: TvId, b_axis: usize) -> bool {
        match (self.key(a, a_axis), self.key(b, b_axis)) {
            (Some(ka), Some(kb)) => self.sets.equiv(ka, kb),
            _ => false,
        }
    }

    /// A representative of the set containing root axis `axis` of `tv`.
    #[must_use]
    pub fn representative(&self, tv: TvId, axis: usize) -> Option<usize> {
        self.key(tv, axis).map(|k| self.sets.find(k))
    }
}

/// Returns true if the two reduction tensors reduce mapped axes in the same
/// pattern.
///
/// Broadcast axes are skipped on both sides; every remaining position must
/// agree on being a reduction and the axes must be mapped.
#[must_use]
pub fn check_pattern_equivalence(
    fusion: &Fusion,
    lhs: TvId,
    rhs: TvId,
    root_map: &RootDomainMap,
) -> bool {
    let concrete = |tv: TvId| {
        fusion
            .tv(tv)
            .root
            .iter()
            .enumerate()
            .filter(|(_, id)| !id.is_broadcast())
            .map(|(pos, id)| (pos, id.is_reduction()))
            .collect::<Vec<_>>()
    };
    let lhs_axes = concrete(lhs);
    let rhs_axes = concrete(rhs);
    if lhs_axes.len() != rhs_axes.len() {
        return false;
    }
    lhs_axes
        .iter()
        .zip(&rhs_axes)
        .all(|(&(l_pos, l_red), &(r_pos, r_red))| {
            l_red == r_red && root_map.can_map(lhs, l_pos, rhs, r_pos)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BinaryOpType, DataType, Dim};

    #[test]
    fn test_sibling_reductions_map() {
        let mut fusion = Fusion::new();
        let t0 = fusion.add_input(DataType::Float, [Dim::sym("n"), Dim::sym("k")]);
        let t1 = fusion.sum(t0, &[1]).unwrap();
        let t2 = fusion.unary(crate::UnaryOpType::Exp, t0).unwrap();
        let t3 = fusion.sum(t2, &[1]).unwrap();
        let t4 = fusion.binary(BinaryOpType::Add, t1, t3).unwrap();
        fusion.add_output(t4);

        let map = RootDomainMap::build(&fusion);
        assert!(map.can_map(t1, 1, t3, 1));
        assert!(map.can_map(t1, 0, t4, 0));
        assert!(!map.can_map(t1, 0, t3, 1));
        assert!(check_pattern_equivalence(&fusion, t1, t3, &map));
    }

    #[test]
    fn test_different_reduction_axes() {
        let mut fusion = Fusion::new();
        let t0 = fusion.add_input(DataType::Float, [Dim::sym("n"), Dim::sym("k")]);
        let t1 = fusion.sum(t0, &[1]).unwrap();
        let t2 = fusion.sum(t0, &[0]).unwrap();
        fusion.add_output(t1);
        fusion.add_output(t2);

        let map = RootDomainMap::build(&fusion);
        assert!(!check_pattern_equivalence(&fusion, t1, t2, &map));
    }

    #[test]
    fn test_view_breaks_mapping() {
        let mut fusion = Fusion::new();
        let t0 = fusion.add_input(DataType::Float, [8_i64, 16]);
        let t1 = fusion.reshape(t0, [8_i64, 4, 4]).unwrap();
        let t2 = fusion.sum(t1, &[2]).unwrap();
        fusion.add_output(t2);

        let map = RootDomainMap::build(&fusion);
        assert!(!map.can_map(t0, 0, t1, 0));
        assert!(map.can_map(t1, 0, t2, 0));
    }

    #[test]
    fn test_broadcast_maps_kept_axes() {
        let mut fusion = Fusion::new();
        let t0 = fusion.add_input(DataType::Float, [Dim::sym("n"), Dim::sym("k")]);
        let t1 = fusion.sum(t0, &[1]).unwrap();
        let t2 = fusion.broadcast(t1, &[false, true]).unwrap();
        let t3 = fusion.binary(BinaryOpType::Sub, t0, t2).unwrap();
        fusion.add_output(t3);

        let map = RootDomainMap::build(&fusion);
        assert!(map.can_map(t0, 0, t2, 0));
        assert!(map.can_map(t0, 1, t3, 1));
        assert!(!map.can_map(t2, 1, t3, 1));
        assert_eq!(map.representative(t0, 0), map.representative(t3, 0));
    }
}
