//! Graph and loop-domain transforms applied by schedulers.
//!
//! Graph transforms insert caching copies, regroup reductions and
//! re-materialize producer chains. Loop transforms rewrite a tensor's leaf
//! domain in place: reorder, merge, split and parallelize.

use crate::{
    Dim, ExprId, ExprKind, Fusion, IrError, IrResult, IterDomain, MemoryType,
    ParallelType, ReductionOpType, TensorView, TvId,
};
use smallvec::SmallVec;
use tracing::trace;

impl Fusion {
    /// Inserts a local copy after every fusion input and redirects the
    /// input's consumers to it.
    ///
    /// Inputs that are only read by gather-like lookups stay uncached since
    /// those reads happen at data-dependent positions. Returns the caches.
    pub fn cache_inputs(&mut self) -> Vec<TvId> {
        let mut cached = Vec::new();
        for input in self.inputs().to_vec() {
            let uses: Vec<ExprId> = self
                .uses(input)
                .filter(|e| !is_lookup_of(&e.kind, input))
                .map(|e| e.id)
                .collect();
            if uses.is_empty() {
                continue;
            }
            let cache = self.copy_of(input);
            for use_id in uses {
                self.replace_expr_input(use_id, input, cache);
            }
            self.add_expr(ExprKind::Set {
                input,
                output: cache,
            });
            trace!(%input, %cache, "cached fusion input");
            cached.push(cache);
        }
        cached
    }

    /// Moves each output's computation into a local tensor followed by a
    /// copy to the output.
    ///
    /// Outputs that are also consumed inside the fusion are always forked so
    /// consumers read the local value. Other outputs are cached only when
    /// `unroll` is set. Returns `(cache, output)` pairs.
    pub fn cache_and_fork_outputs(&mut self, unroll: bool) -> Vec<(TvId, TvId)> {
        let mut cached = Vec::new();
        for output in self.outputs().to_vec() {
            if self.is_input(output) {
                continue;
            }
            let Some(def) = self.tv(output).definition else {
                continue;
            };
            let uses: Vec<ExprId> = self.tv(output).uses.to_vec();
            if uses.is_empty() && !unroll {
                continue;
            }
            let cache = self.copy_of(output);
            if let Some(Some(expr)) = self.exprs.get_mut(def.index()) {
                expr.kind.replace_output(output, cache);
            }
            self.tvs[cache.index()].definition = Some(def);
            self.tvs[output.index()].definition = None;
            for use_id in uses {
                self.replace_expr_input(use_id, output, cache);
            }
            // The copy to global memory carries only the logical domain.
            let root: SmallVec<[IterDomain; 4]> = self
                .tv(cache)
                .logical()
                .map(|id| IterDomain::new(id.iter_type, id.extent.clone()))
                .collect();
            let out = &mut self.tvs[output.index()];
            out.leaf = root.to_vec();
            out.root = root;
            self.add_expr(ExprKind::Set {
                input: cache,
                output,
            });
            trace!(%output, %cache, "cached fusion output");
            cached.push((cache, output));
        }
        cached
    }

    /// Resets every intermediate tensor to local memory.
    ///
    /// Segmentation may leave global placements on tensors that are no
    /// longer segment boundaries.
    pub fn clear_memory_space(&mut self) {
        let boundary: Vec<TvId> = self.inputs().iter().chain(self.outputs()).copied().collect();
        for tv in &mut self.tvs {
            if !boundary.contains(&tv.id) {
                tv.memory_type = MemoryType::Local;
            }
        }
    }

    /// Sets the memory placement of one tensor.
    ///
    /// # Errors
    ///
    /// Returns `IrError::UnknownTensor` if `tv` is not part of this fusion.
    pub fn set_memory_type(&mut self, tv: TvId, memory_type: MemoryType) -> IrResult<()> {
        self.tv_mut(tv)?.memory_type = memory_type;
        Ok(())
    }

    /// Replaces several reductions over the same axes with one grouped
    /// reduction.
    ///
    /// # Errors
    ///
    /// Returns `IrError::InvalidGrouping` if fewer than two tensors are given,
    /// a tensor is not defined by a plain reduction, or the reduction axis
    /// patterns differ.
    pub fn group_reductions(&mut self, tvs: &[TvId]) -> IrResult<ExprId> {
        if tvs.len() < 2 {
            return Err(IrError::InvalidGrouping(
                "need at least two reductions".to_string(),
            ));
        }
        let pattern = |tv: &TensorView| -> Vec<bool> {
            tv.root.iter().map(IterDomain::is_reduction).collect()
        };
        let reference = pattern(self.try_tv(tvs[0])?);

        let mut members = Vec::with_capacity(tvs.len());
        for &tv in tvs {
            let view = self.try_tv(tv)?;
            if pattern(view) != reference {
                return Err(IrError::InvalidGrouping(format!(
                    "{tv} reduces different axes than {}",
                    tvs[0]
                )));
            }
            match self.definition(tv).map(|e| (&e.kind, e.id)) {
                Some((ExprKind::Reduction { op, input, .. }, id)) => {
                    members.push((id, *op, *input, tv));
                }
                _ => {
                    return Err(IrError::InvalidGrouping(format!(
                        "{tv} is not defined by a reduction"
                    )))
                }
            }
        }

        let mut ops: Vec<ReductionOpType> = Vec::with_capacity(members.len());
        let mut inputs = Vec::with_capacity(members.len());
        let mut outputs = Vec::with_capacity(members.len());
        for (id, op, input, output) in members {
            self.remove_expr(id);
            ops.push(op);
            inputs.push(input);
            outputs.push(output);
        }
        let grouped = self.add_expr(ExprKind::GroupedReduction {
            ops,
            inputs,
            outputs,
        });
        trace!(count = tvs.len(), "grouped reductions");
        Ok(grouped)
    }

    /// Re-materializes `target` from `source` by cloning the chain of
    /// single-input elementwise ops between them.
    ///
    /// Returns the fresh tensor equivalent to `target`.
    ///
    /// # Errors
    ///
    /// Returns `IrError::UnknownTensor` naming `target` if it is not reachable
    /// from `source` through single-input elementwise ops.
    pub fn recompute_from(&mut self, source: TvId, target: TvId) -> IrResult<TvId> {
        let mut chain = Vec::new();
        let mut cur = target;
        while cur != source {
            let def = self.definition(cur).ok_or(IrError::UnknownTensor(target))?;
            let single_input = matches!(
                def.kind,
                ExprKind::Unary { .. } | ExprKind::Cast { .. } | ExprKind::Set { .. }
            );
            if !single_input {
                return Err(IrError::UnknownTensor(target));
            }
            chain.push(def.kind.clone());
            cur = def.kind.inputs()[0];
        }

        let mut value = source;
        for kind in chain.into_iter().rev() {
            let old_out = kind.outputs()[0];
            let fresh = self.copy_of(old_out);
            let mut kind = kind;
            kind.replace_input(kind.inputs()[0], value);
            kind.replace_output(old_out, fresh);
            self.add_expr(kind);
            value = fresh;
        }
        Ok(value)
    }

    /// Points one consumer of `old` at `new` instead.
    pub fn replace_use(&mut self, expr: ExprId, old: TvId, new: TvId) {
        self.replace_expr_input(expr, old, new);
    }

    /// Allocates a local tensor with the same dtype and domain as `tv`.
    fn copy_of(&mut self, tv: TvId) -> TvId {
        let src = self.tv(tv);
        let dtype = src.dtype;
        let root: SmallVec<[IterDomain; 4]> = src
            .root
            .iter()
            .map(|id| IterDomain::new(id.iter_type, id.extent.clone()))
            .collect();
        self.new_tv(dtype, root)
    }
}

fn is_lookup_of(kind: &ExprKind, tv: TvId) -> bool {
    match kind {
        ExprKind::IndexSelect { lookup, index, .. } | ExprKind::Gather { lookup, index, .. } => {
            *lookup == tv && *index != tv
        }
        ExprKind::Select { lookup, .. } => *lookup == tv,
        _ => false,
    }
}

fn mul_extent(lhs: &Dim, rhs: &Dim) -> Dim {
    match (lhs, rhs) {
        (Dim::Static(a), Dim::Static(b)) => Dim::Static(a * b),
        _ => Dim::Symbolic(format!("{lhs}*{rhs}")),
    }
}

fn ceil_div_extent(extent: &Dim, factor: i64) -> Dim {
    match extent {
        Dim::Static(a) => Dim::Static((a + factor - 1) / factor),
        Dim::Symbolic(_) => Dim::Symbolic(format!("ceilDiv({extent}, {factor})")),
    }
}

impl TensorView {
    fn check_leaf_axis(&self, axis: usize) -> IrResult<()> {
        if axis >= self.leaf.len() {
            return Err(IrError::InvalidAxis {
                tv: self.id,
                axis,
                rank: self.leaf.len(),
            });
        }
        Ok(())
    }

    /// Moves leaf axes; `old_to_new` pairs name the old and new positions.
    /// Unnamed axes keep their relative order.
    ///
    /// # Errors
    ///
    /// Returns `IrError::InvalidAxis` if a position is out of range.
    pub fn reorder(&mut self, old_to_new: &[(usize, usize)]) -> IrResult<()> {
        let n = self.leaf.len();
        let mut slots: Vec<Option<IterDomain>> = vec![None; n];
        let mut moved = vec![false; n];
        for &(old, new) in old_to_new {
            self.check_leaf_axis(old)?;
            self.check_leaf_axis(new)?;
            slots[new] = Some(self.leaf[old].clone());
            moved[old] = true;
        }
        let mut rest = self
            .leaf
            .iter()
            .zip(&moved)
            .filter(|(_, m)| !**m)
            .map(|(id, _)| id.clone());
        let leaf = slots
            .into_iter()
            .map(|slot| slot.or_else(|| rest.next()))
            .collect::<Option<Vec<_>>>()
            .ok_or(IrError::InvalidAxis {
                tv: self.id,
                axis: n,
                rank: n,
            })?;
        self.leaf = leaf;
        Ok(())
    }

    /// Merges leaf axis `axis` with `axis + 1`.
    ///
    /// # Errors
    ///
    /// Returns `IrError::InvalidAxis` if `axis + 1` is out of range.
    pub fn merge(&mut self, axis: usize) -> IrResult<()> {
        self.check_leaf_axis(axis + 1)?;
        let inner = self.leaf.remove(axis + 1);
        let outer = &mut self.leaf[axis];
        outer.extent = mul_extent(&outer.extent, &inner.extent);
        if outer.is_broadcast() {
            outer.iter_type = inner.iter_type;
        }
        Ok(())
    }

    /// Splits leaf axis `axis` by `factor`. With `inner_split` the factor
    /// becomes the inner extent, otherwise the outer one.
    ///
    /// # Errors
    ///
    /// Returns `IrError::InvalidAxis` if `axis` is out of range.
    pub fn split(&mut self, axis: usize, factor: i64, inner_split: bool) -> IrResult<()> {
        self.check_leaf_axis(axis)?;
        let id = self.leaf[axis].clone();
        let divided = IterDomain::new(id.iter_type, ceil_div_extent(&id.extent, factor));
        let fixed = IterDomain::new(id.iter_type, factor);
        let (outer, inner) = if inner_split {
            (divided, fixed)
        } else {
            (fixed, divided)
        };
        self.leaf[axis] = outer;
        self.leaf.insert(axis + 1, inner);
        Ok(())
    }

    /// Binds leaf axis `axis` to a hardware dimension.
    ///
    /// # Errors
    ///
    /// Returns `IrError::InvalidAxis` if `axis` is out of range.
    pub fn parallelize(&mut self, axis: usize, parallel: ParallelType) -> IrResult<()> {
        self.check_leaf_axis(axis)?;
        self.leaf[axis].parallel = parallel;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{BinaryOpType, DataType, Dim, Fusion, MemoryType, ParallelType};

    #[test]
    fn test_cache_inputs_redirects_uses() {
        let mut fusion = Fusion::new();
        let t0 = fusion.add_input(DataType::Float, [4_i64, 8]);
        let t1 = fusion.sum(t0, &[1]).unwrap();
        fusion.add_output(t1);

        let cached = fusion.cache_inputs();
        assert_eq!(cached.len(), 1);
        assert_eq!(fusion.sole_producer(t1), Some(cached[0]));
        assert_eq!(fusion.sole_producer(cached[0]), Some(t0));
        assert_eq!(fusion.tv(cached[0]).memory_type, MemoryType::Local);
    }

    #[test]
    fn test_cache_inputs_skips_lookup() {
        let mut fusion = Fusion::new();
        let lookup = fusion.add_input(DataType::Float, [16_i64, 8]);
        let idx = fusion.add_input(DataType::Int, [4_i64]);
        let out = fusion.index_select(lookup, 0, idx).unwrap();
        fusion.add_output(out);
        let cached = fusion.cache_inputs();
        assert_eq!(cached.len(), 1);
        assert_eq!(fusion.sole_producer(cached[0]), Some(idx));
    }

    #[test]
    fn test_cache_and_fork_outputs() {
        let mut fusion = Fusion::new();
        let t0 = fusion.add_input(DataType::Float, [4_i64, 8]);
        let t1 = fusion.sum(t0, &[1]).unwrap();
        fusion.add_output(t1);

        assert!(fusion.cache_and_fork_outputs(false).is_empty());
        let pairs = fusion.cache_and_fork_outputs(true);
        assert_eq!(pairs.len(), 1);
        let (cache, out) = pairs[0];
        assert_eq!(out, t1);
        assert!(fusion.tv(cache).has_reduction());
        assert!(!fusion.tv(out).has_reduction());
        assert_eq!(fusion.reduction_tvs(), vec![cache]);
    }

    #[test]
    fn test_clear_memory_space() {
        let mut fusion = Fusion::new();
        let t0 = fusion.add_input(DataType::Float, [4_i64]);
        let t1 = fusion.set(t0).unwrap();
        let t2 = fusion.set(t1).unwrap();
        fusion.add_output(t2);
        fusion.set_memory_type(t1, MemoryType::Global).unwrap();
        fusion.clear_memory_space();
        assert_eq!(fusion.tv(t1).memory_type, MemoryType::Local);
        assert_eq!(fusion.tv(t0).memory_type, MemoryType::Global);
        assert_eq!(fusion.tv(t2).memory_type, MemoryType::Global);
    }

    #[test]
    fn test_group_reductions() {
        let mut fusion = Fusion::new();
        let a = fusion.add_input(DataType::Float, [64_i64, 32]);
        let b = fusion.add_input(DataType::Float, [64_i64, 32]);
        let ra = fusion.sum(a, &[0]).unwrap();
        let rb = fusion.sum(b, &[0]).unwrap();
        let grouped = fusion.group_reductions(&[ra, rb]).unwrap();
        assert_eq!(fusion.reduction_ops().count(), 1);
        assert_eq!(fusion.tv(ra).definition, Some(grouped));
        assert_eq!(fusion.tv(rb).definition, Some(grouped));
        assert_eq!(fusion.reduction_tvs(), vec![ra, rb]);
    }

    #[test]
    fn test_group_reductions_rejects_mismatch() {
        let mut fusion = Fusion::new();
        let a = fusion.add_input(DataType::Float, [64_i64, 32]);
        let ra = fusion.sum(a, &[0]).unwrap();
        let rb = fusion.sum(a, &[1]).unwrap();
        assert!(fusion.group_reductions(&[ra, rb]).is_err());
        assert!(fusion.group_reductions(&[ra]).is_err());
    }

    #[test]
    fn test_recompute_from() {
        let mut fusion = Fusion::new();
        let t0 = fusion.add_input(DataType::Half, [4_i64, 8]);
        let t1 = fusion.cast(t0, DataType::Float).unwrap();
        let t2 = fusion.sum(t1, &[1]).unwrap();
        let t3 = fusion.broadcast(t2, &[false, true]).unwrap();
        let t4 = fusion.binary(BinaryOpType::Add, t1, t3).unwrap();
        fusion.add_output(t4);

        let fresh = fusion.recompute_from(t0, t1).unwrap();
        assert_ne!(fresh, t1);
        assert_eq!(fusion.tv(fresh).dtype, DataType::Float);
        assert_eq!(fusion.sole_producer(fresh), Some(t0));
        assert!(fusion.recompute_from(t0, t4).is_err());
    }

    #[test]
    fn test_leaf_transforms() {
        let mut fusion = Fusion::new();
        let t0 = fusion.add_input(DataType::Float, [Dim::sym("n"), Dim::Static(8), Dim::Static(4)]);
        let tv = fusion.tv_mut(t0).unwrap();
        tv.merge(1).unwrap();
        assert_eq!(tv.leaf[1].extent, Dim::Static(32));
        tv.split(1, 4, true).unwrap();
        assert_eq!(tv.leaf.len(), 3);
        assert_eq!(tv.leaf[1].extent, Dim::Static(8));
        assert_eq!(tv.leaf[2].extent, Dim::Static(4));
        tv.reorder(&[(2, 0)]).unwrap();
        assert_eq!(tv.leaf[0].extent, Dim::Static(4));
        assert_eq!(tv.leaf[1].extent, Dim::sym("n"));
        tv.parallelize(0, ParallelType::TIDx).unwrap();
        assert_eq!(tv.leaf[0].parallel, ParallelType::TIDx);
        assert!(tv.merge(2).is_err());
    }
}
