//! The fusion graph arena.
//!
//! A [`Fusion`] owns every tensor view and expression of one compilation
//! unit. Builder methods infer the output root domain of each operator from
//! its operands, so tests and callers construct graphs the same way a
//! front end would:
//!
//! ```rust,ignore
//! let mut fusion = Fusion::new();
//! let t0 = fusion.add_input(DataType::Half, [Dim::sym("n"), Dim::sym("k")]);
//! let t1 = fusion.cast(t0, DataType::Float)?;
//! let t2 = fusion.sum(t1, &[1])?;
//! let t3 = fusion.broadcast(t2, &[false, true])?;
//! let t4 = fusion.binary(BinaryOpType::Sub, t1, t3)?;
//! fusion.add_output(t4);
//! ```

use crate::{
    BinaryOpType, DataType, Dim, Expr, ExprId, ExprKind, IrError, IrResult, IterDomain, IterType,
    MemoryType, ReductionOpType, TensorView, TernaryOpType, TvId, UnaryOpType,
};
use rustc_hash::FxHashSet;
use smallvec::SmallVec;
use std::fmt;

/// A data-flow graph of tensor operations compiled as one unit.
#[derive(Clone, Debug, Default)]
pub struct Fusion {
    pub(crate) tvs: Vec<TensorView>,
    /// Removed expressions leave a hole so ids stay stable.
    pub(crate) exprs: Vec<Option<Expr>>,
    inputs: Vec<TvId>,
    outputs: Vec<TvId>,
}

impl Fusion {
    /// Creates an empty fusion.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Access
    // ------------------------------------------------------------------

    /// Returns the tensor view with the given id.
    ///
    /// # Panics
    ///
    /// Panics if the id was not allocated by this fusion.
    #[must_use]
    pub fn tv(&self, id: TvId) -> &TensorView {
        &self.tvs[id.index()]
    }

    /// Mutable access to a tensor view.
    ///
    /// # Errors
    ///
    /// Returns `IrError::UnknownTensor` if the id is not part of this fusion.
    pub fn tv_mut(&mut self, id: TvId) -> IrResult<&mut TensorView> {
        self.tvs
            .get_mut(id.index())
            .ok_or(IrError::UnknownTensor(id))
    }

    /// Fallible lookup of a tensor view.
    ///
    /// # Errors
    ///
    /// Returns `IrError::UnknownTensor` if the id is not part of this fusion.
    pub fn try_tv(&self, id: TvId) -> IrResult<&TensorView> {
        self.tvs.get(id.index()).ok_or(IrError::UnknownTensor(id))
    }

    /// All tensor views, in creation order.
    pub fn tvs(&self) -> impl Iterator<Item = &TensorView> {
        self.tvs.iter()
    }

    /// Returns a live expression.
    #[must_use]
    pub fn expr(&self, id: ExprId) -> Option<&Expr> {
        self.exprs.get(id.index()).and_then(Option::as_ref)
    }

    /// All live expressions, in creation order.
    pub fn exprs(&self) -> impl Iterator<Item = &Expr> {
        self.exprs.iter().filter_map(Option::as_ref)
    }

    /// Fusion inputs.
    #[must_use]
    pub fn inputs(&self) -> &[TvId] {
        &self.inputs
    }

    /// Fusion outputs.
    #[must_use]
    pub fn outputs(&self) -> &[TvId] {
        &self.outputs
    }

    /// Returns true if `tv` is a fusion input.
    #[must_use]
    pub fn is_input(&self, tv: TvId) -> bool {
        self.inputs.contains(&tv)
    }

    /// Returns true if `tv` is a fusion output.
    #[must_use]
    pub fn is_output(&self, tv: TvId) -> bool {
        self.outputs.contains(&tv)
    }

    /// The expression defining `tv`, if it is live.
    #[must_use]
    pub fn definition(&self, tv: TvId) -> Option<&Expr> {
        self.tv(tv).definition.and_then(|e| self.expr(e))
    }

    /// Live expressions consuming `tv`.
    pub fn uses(&self, tv: TvId) -> impl Iterator<Item = &Expr> {
        self.tv(tv).uses.iter().filter_map(|e| self.expr(*e))
    }

    /// The single tensor input of `tv`'s definition, if it has exactly one.
    #[must_use]
    pub fn sole_producer(&self, tv: TvId) -> Option<TvId> {
        let inputs = self.definition(tv)?.kind.inputs();
        match inputs.as_slice() {
            [only] => Some(*only),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Reduction expressions, grouped or not.
    pub fn reduction_ops(&self) -> impl Iterator<Item = &Expr> {
        self.exprs().filter(|e| e.kind.is_reduction())
    }

    /// Output tensors of every reduction, in expression order.
    #[must_use]
    pub fn reduction_tvs(&self) -> Vec<TvId> {
        self.reduction_ops()
            .flat_map(|e| e.kind.outputs())
            .filter(|tv| self.tv(*tv).has_reduction())
            .collect()
    }

    /// Matrix multiply-accumulate expressions.
    pub fn mma_ops(&self) -> impl Iterator<Item = &Expr> {
        self.exprs()
            .filter(|e| matches!(e.kind, ExprKind::Mma { .. }))
    }

    /// Reshape expressions.
    pub fn view_ops(&self) -> impl Iterator<Item = &Expr> {
        self.exprs()
            .filter(|e| matches!(e.kind, ExprKind::View { .. }))
    }

    /// Returns true if the fusion contains a reshape.
    #[must_use]
    pub fn has_view_ops(&self) -> bool {
        self.view_ops().next().is_some()
    }

    /// Every tensor `tv` transitively depends on, excluding itself.
    #[must_use]
    pub fn ancestors(&self, tv: TvId) -> FxHashSet<TvId> {
        let mut seen = FxHashSet::default();
        let mut stack = vec![tv];
        while let Some(cur) = stack.pop() {
            if let Some(def) = self.definition(cur) {
                for inp in def.kind.inputs() {
                    if seen.insert(inp) {
                        stack.push(inp);
                    }
                }
            }
        }
        seen
    }

    /// Every tensor that transitively depends on `tv`, excluding itself.
    #[must_use]
    pub fn descendants(&self, tv: TvId) -> FxHashSet<TvId> {
        let mut seen = FxHashSet::default();
        let mut stack = vec![tv];
        while let Some(cur) = stack.pop() {
            for use_expr in self.uses(cur) {
                for out in use_expr.kind.outputs() {
                    if seen.insert(out) {
                        stack.push(out);
                    }
                }
            }
        }
        seen
    }

    /// Returns true if `tv` transitively depends on `ancestor`.
    #[must_use]
    pub fn depends_on(&self, tv: TvId, ancestor: TvId) -> bool {
        self.ancestors(tv).contains(&ancestor)
    }

    /// Live expressions in an order where producers precede consumers.
    #[must_use]
    pub fn topological_exprs(&self) -> Vec<ExprId> {
        fn visit(fusion: &Fusion, tv: TvId, done: &mut FxHashSet<ExprId>, order: &mut Vec<ExprId>) {
            let Some(def) = fusion.definition(tv) else {
                return;
            };
            if done.contains(&def.id) {
                return;
            }
            done.insert(def.id);
            for inp in def.kind.inputs() {
                visit(fusion, inp, done, order);
            }
            order.push(def.id);
        }

        let mut done = FxHashSet::default();
        let mut order = Vec::new();
        for tv in &self.tvs {
            visit(self, tv.id, &mut done, &mut order);
        }
        order
    }

    // ------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------

    /// Adds a fusion input with iteration axes of the given extents.
    pub fn add_input<D: Into<Dim>>(
        &mut self,
        dtype: DataType,
        dims: impl IntoIterator<Item = D>,
    ) -> TvId {
        let root = dims.into_iter().map(IterDomain::iteration).collect();
        self.add_input_with_root(dtype, root)
    }

    /// Adds a fusion input with an explicit root domain.
    pub fn add_input_with_root(&mut self, dtype: DataType, root: SmallVec<[IterDomain; 4]>) -> TvId {
        let tv = self.new_tv(dtype, root);
        self.tvs[tv.index()].memory_type = MemoryType::Global;
        self.inputs.push(tv);
        tv
    }

    /// Marks `tv` as a fusion output.
    pub fn add_output(&mut self, tv: TvId) {
        if !self.outputs.contains(&tv) {
            self.outputs.push(tv);
            self.tvs[tv.index()].memory_type = MemoryType::Global;
        }
    }

    pub(crate) fn new_tv(&mut self, dtype: DataType, root: SmallVec<[IterDomain; 4]>) -> TvId {
        let id = TvId::new(self.tvs.len());
        let leaf = root.to_vec();
        self.tvs.push(TensorView {
            id,
            dtype,
            root,
            leaf,
            memory_type: MemoryType::Local,
            definition: None,
            uses: SmallVec::new(),
        });
        id
    }

    /// Registers an expression and wires definition/use links.
    pub(crate) fn add_expr(&mut self, kind: ExprKind) -> ExprId {
        let id = ExprId::new(self.exprs.len());
        for inp in kind.inputs() {
            let uses = &mut self.tvs[inp.index()].uses;
            if !uses.contains(&id) {
                uses.push(id);
            }
        }
        for out in kind.outputs() {
            self.tvs[out.index()].definition = Some(id);
        }
        self.exprs.push(Some(Expr { id, kind }));
        id
    }

    /// Unlinks and drops an expression. Its outputs lose their definition.
    pub(crate) fn remove_expr(&mut self, id: ExprId) -> Option<Expr> {
        let expr = self.exprs.get_mut(id.index())?.take()?;
        for inp in expr.kind.inputs() {
            self.tvs[inp.index()].uses.retain(|e| *e != id);
        }
        for out in expr.kind.outputs() {
            if self.tvs[out.index()].definition == Some(id) {
                self.tvs[out.index()].definition = None;
            }
        }
        Some(expr)
    }

    /// Rewires one input of a live expression.
    pub(crate) fn replace_expr_input(&mut self, id: ExprId, old: TvId, new: TvId) {
        let Some(expr) = self.exprs.get_mut(id.index()).and_then(Option::as_mut) else {
            return;
        };
        expr.kind.replace_input(old, new);
        if !expr.kind.inputs().contains(&old) {
            self.tvs[old.index()].uses.retain(|e| *e != id);
        }
        let uses = &mut self.tvs[new.index()].uses;
        if !uses.contains(&id) {
            uses.push(id);
        }
    }

    fn logical_domain(&self, tv: TvId) -> IrResult<SmallVec<[IterDomain; 4]>> {
        Ok(self
            .try_tv(tv)?
            .logical()
            .map(|id| IterDomain::new(id.iter_type, id.extent.clone()))
            .collect())
    }

    /// Output domain of an elementwise op: per position the first
    /// non-broadcast operand axis wins.
    fn pointwise_domain(&self, inputs: &[TvId]) -> IrResult<SmallVec<[IterDomain; 4]>> {
        let first = inputs[0];
        let mut out = self.logical_domain(first)?;
        for &other in &inputs[1..] {
            let dom = self.logical_domain(other)?;
            if dom.len() != out.len() {
                return Err(IrError::RankMismatch {
                    lhs: first,
                    lhs_rank: out.len(),
                    rhs: other,
                    rhs_rank: dom.len(),
                });
            }
            for (slot, id) in out.iter_mut().zip(dom) {
                if slot.is_broadcast() && !id.is_broadcast() {
                    *slot = id;
                }
            }
        }
        Ok(out)
    }

    fn check_axis(&self, tv: TvId, axis: usize) -> IrResult<usize> {
        let rank = self.try_tv(tv)?.logical_rank();
        if axis >= rank {
            return Err(IrError::InvalidAxis { tv, axis, rank });
        }
        Ok(rank)
    }

    /// Unary elementwise op.
    ///
    /// # Errors
    ///
    /// Returns an error if `input` is unknown.
    pub fn unary(&mut self, op: UnaryOpType, input: TvId) -> IrResult<TvId> {
        let root = self.pointwise_domain(&[input])?;
        let output = self.new_tv(self.tv(input).dtype, root);
        self.add_expr(ExprKind::Unary { op, input, output });
        Ok(output)
    }

    /// Type conversion.
    ///
    /// # Errors
    ///
    /// Returns an error if `input` is unknown.
    pub fn cast(&mut self, input: TvId, dtype: DataType) -> IrResult<TvId> {
        let root = self.pointwise_domain(&[input])?;
        let output = self.new_tv(dtype, root);
        self.add_expr(ExprKind::Cast { input, output });
        Ok(output)
    }

    /// Copy.
    ///
    /// # Errors
    ///
    /// Returns an error if `input` is unknown.
    pub fn set(&mut self, input: TvId) -> IrResult<TvId> {
        let root = self.pointwise_domain(&[input])?;
        let output = self.new_tv(self.tv(input).dtype, root);
        self.add_expr(ExprKind::Set { input, output });
        Ok(output)
    }

    /// Binary elementwise op with broadcasting.
    ///
    /// # Errors
    ///
    /// Returns `IrError::RankMismatch` if the operands disagree in rank.
    pub fn binary(&mut self, op: BinaryOpType, lhs: TvId, rhs: TvId) -> IrResult<TvId> {
        let root = self.pointwise_domain(&[lhs, rhs])?;
        let dtype = promote(self.tv(lhs).dtype, self.tv(rhs).dtype);
        let output = self.new_tv(dtype, root);
        self.add_expr(ExprKind::Binary {
            op,
            lhs,
            rhs,
            output,
        });
        Ok(output)
    }

    /// Ternary elementwise op; the output takes the dtype of the second
    /// operand.
    ///
    /// # Errors
    ///
    /// Returns `IrError::RankMismatch` if the operands disagree in rank.
    pub fn ternary(&mut self, op: TernaryOpType, inputs: [TvId; 3]) -> IrResult<TvId> {
        let root = self.pointwise_domain(&inputs)?;
        let output = self.new_tv(self.tv(inputs[1]).dtype, root);
        self.add_expr(ExprKind::Ternary { op, inputs, output });
        Ok(output)
    }

    /// Reduces `input` over the given logical axes.
    ///
    /// # Errors
    ///
    /// Returns `IrError::InvalidAxis` for an out-of-range axis.
    pub fn reduction(&mut self, op: ReductionOpType, input: TvId, axes: &[usize]) -> IrResult<TvId> {
        for &axis in axes {
            self.check_axis(input, axis)?;
        }
        let mut root = self.logical_domain(input)?;
        for &axis in axes {
            root[axis].iter_type = IterType::Reduction;
        }
        let output = self.new_tv(self.tv(input).dtype, root);
        self.add_expr(ExprKind::Reduction { op, input, output });
        Ok(output)
    }

    /// Sum reduction.
    ///
    /// # Errors
    ///
    /// Returns `IrError::InvalidAxis` for an out-of-range axis.
    pub fn sum(&mut self, input: TvId, axes: &[usize]) -> IrResult<TvId> {
        self.reduction(ReductionOpType::Add, input, axes)
    }

    /// Inserts broadcast axes where `flags` is true.
    ///
    /// # Errors
    ///
    /// Returns `IrError::RankMismatch` if the number of false flags differs
    /// from the input rank.
    pub fn broadcast(&mut self, input: TvId, flags: &[bool]) -> IrResult<TvId> {
        let dom = self.logical_domain(input)?;
        let kept = flags.iter().filter(|f| !**f).count();
        if kept != dom.len() {
            return Err(IrError::RankMismatch {
                lhs: input,
                lhs_rank: dom.len(),
                rhs: input,
                rhs_rank: kept,
            });
        }
        let mut src = dom.into_iter();
        let root = flags
            .iter()
            .map(|&is_new| {
                if is_new {
                    Some(IterDomain::broadcast())
                } else {
                    src.next()
                }
            })
            .collect::<Option<SmallVec<_>>>()
            .ok_or(IrError::UnknownTensor(input))?;
        let output = self.new_tv(self.tv(input).dtype, root);
        self.add_expr(ExprKind::Broadcast {
            input,
            output,
            flags: flags.to_vec(),
        });
        Ok(output)
    }

    /// Reshapes `input` to `shape`.
    ///
    /// # Errors
    ///
    /// Returns `IrError::ReshapeMismatch` if both shapes are static and hold
    /// a different number of elements.
    pub fn reshape<D: Into<Dim>>(
        &mut self,
        input: TvId,
        shape: impl IntoIterator<Item = D>,
    ) -> IrResult<TvId> {
        let shape: Vec<Dim> = shape.into_iter().map(Into::into).collect();
        let from = static_numel(self.try_tv(input)?.logical().map(|id| &id.extent));
        let to = static_numel(shape.iter());
        if let (Some(from), Some(to)) = (from, to) {
            if from != to {
                return Err(IrError::ReshapeMismatch { tv: input, from, to });
            }
        }
        let root = shape.into_iter().map(IterDomain::iteration).collect();
        let output = self.new_tv(self.tv(input).dtype, root);
        self.add_expr(ExprKind::View { input, output });
        Ok(output)
    }

    /// Selects entries of `lookup` along `dim` with a 1-D `index` tensor.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid axis or a non 1-D index.
    pub fn index_select(&mut self, lookup: TvId, dim: usize, index: TvId) -> IrResult<TvId> {
        self.check_axis(lookup, dim)?;
        let idx_dom = self.logical_domain(index)?;
        if idx_dom.len() != 1 {
            return Err(IrError::RankMismatch {
                lhs: index,
                lhs_rank: idx_dom.len(),
                rhs: index,
                rhs_rank: 1,
            });
        }
        let mut root = self.logical_domain(lookup)?;
        root[dim] = idx_dom[0].clone();
        let output = self.new_tv(self.tv(lookup).dtype, root);
        self.add_expr(ExprKind::IndexSelect {
            lookup,
            index,
            dim,
            output,
        });
        Ok(output)
    }

    /// Gathers from `lookup` along `dim`; the output has `index`'s shape.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid axis or mismatched ranks.
    pub fn gather(&mut self, lookup: TvId, dim: usize, index: TvId) -> IrResult<TvId> {
        let rank = self.check_axis(lookup, dim)?;
        let root = self.logical_domain(index)?;
        if root.len() != rank {
            return Err(IrError::RankMismatch {
                lhs: lookup,
                lhs_rank: rank,
                rhs: index,
                rhs_rank: root.len(),
            });
        }
        let output = self.new_tv(self.tv(lookup).dtype, root);
        self.add_expr(ExprKind::Gather {
            lookup,
            index,
            dim,
            output,
        });
        Ok(output)
    }

    /// Selects one slice of `lookup` along `dim`, dropping that axis.
    ///
    /// # Errors
    ///
    /// Returns `IrError::InvalidAxis` for an out-of-range axis.
    pub fn select(&mut self, lookup: TvId, dim: usize) -> IrResult<TvId> {
        self.check_axis(lookup, dim)?;
        let mut root = self.logical_domain(lookup)?;
        root.remove(dim);
        let output = self.new_tv(self.tv(lookup).dtype, root);
        self.add_expr(ExprKind::Select {
            lookup,
            dim,
            output,
        });
        Ok(output)
    }

    /// Matrix product of `[m, k]` and `[k, n]` operands.
    ///
    /// # Errors
    ///
    /// Returns `IrError::RankMismatch` unless both operands are 2-D.
    pub fn mma(&mut self, a: TvId, b: TvId) -> IrResult<TvId> {
        let lhs = self.logical_domain(a)?;
        let rhs = self.logical_domain(b)?;
        if lhs.len() != 2 || rhs.len() != 2 {
            return Err(IrError::RankMismatch {
                lhs: a,
                lhs_rank: lhs.len(),
                rhs: b,
                rhs_rank: rhs.len(),
            });
        }
        let root = SmallVec::from_vec(vec![lhs[0].clone(), rhs[1].clone()]);
        let output = self.new_tv(DataType::Float, root);
        self.add_expr(ExprKind::Mma { a, b, output });
        Ok(output)
    }
}

fn promote(lhs: DataType, rhs: DataType) -> DataType {
    if lhs.size_bytes() >= rhs.size_bytes() {
        lhs
    } else {
        rhs
    }
}

fn static_numel<'a>(dims: impl Iterator<Item = &'a Dim>) -> Option<i64> {
    dims.map(Dim::static_value).product()
}

impl fmt::Display for Fusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Inputs:")?;
        for tv in &self.inputs {
            writeln!(f, "  {}", self.tv(*tv))?;
        }
        writeln!(f, "Exprs:")?;
        for id in self.topological_exprs() {
            let Some(expr) = self.expr(id) else {
                continue;
            };
            let outs: Vec<String> = expr.kind.outputs().iter().map(|t| self.tv(*t).to_string()).collect();
            let ins: Vec<String> = expr.kind.inputs().iter().map(ToString::to_string).collect();
            writeln!(f, "  {} = {}({})", outs.join(", "), expr.kind.name(), ins.join(", "))?;
        }
        writeln!(f, "Outputs:")?;
        for tv in &self.outputs {
            writeln!(f, "  {}", self.tv(*tv))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer_norm_like() -> (Fusion, TvId, TvId, TvId) {
        let mut fusion = Fusion::new();
        let t0 = fusion.add_input(DataType::Half, [Dim::sym("n"), Dim::sym("k")]);
        let t1 = fusion.cast(t0, DataType::Float).unwrap();
        let t2 = fusion.sum(t1, &[1]).unwrap();
        let t3 = fusion.broadcast(t2, &[false, true]).unwrap();
        let t4 = fusion.binary(BinaryOpType::Sub, t1, t3).unwrap();
        fusion.add_output(t4);
        (fusion, t1, t2, t4)
    }

    #[test]
    fn test_builder_links() {
        let (fusion, t1, t2, t4) = layer_norm_like();
        assert_eq!(fusion.tv(t1).uses.len(), 2);
        assert_eq!(fusion.reduction_tvs(), vec![t2]);
        assert!(fusion.tv(t2).is_fastest_dim_reduction());
        assert_eq!(fusion.tv(t4).root.len(), 2);
        assert!(!fusion.tv(t4).root[1].is_broadcast());
        assert!(fusion.depends_on(t4, t2));
        assert!(!fusion.depends_on(t2, t4));
    }

    #[test]
    fn test_sole_producer() {
        let (fusion, t1, t2, t4) = layer_norm_like();
        assert_eq!(fusion.sole_producer(t2), Some(t1));
        assert_eq!(fusion.sole_producer(t4), None);
    }

    #[test]
    fn test_rank_mismatch() {
        let mut fusion = Fusion::new();
        let a = fusion.add_input(DataType::Float, [4_i64, 8]);
        let b = fusion.add_input(DataType::Float, [8_i64]);
        assert!(matches!(
            fusion.binary(BinaryOpType::Add, a, b),
            Err(IrError::RankMismatch { .. })
        ));
    }

    #[test]
    fn test_reduction_axis_check() {
        let mut fusion = Fusion::new();
        let a = fusion.add_input(DataType::Float, [4_i64, 8]);
        assert_eq!(
            fusion.sum(a, &[2]),
            Err(IrError::InvalidAxis {
                tv: a,
                axis: 2,
                rank: 2
            })
        );
    }

    #[test]
    fn test_reshape_mismatch() {
        let mut fusion = Fusion::new();
        let a = fusion.add_input(DataType::Float, [4_i64, 8]);
        assert!(fusion.reshape(a, [32_i64]).is_ok());
        assert!(matches!(
            fusion.reshape(a, [30_i64]),
            Err(IrError::ReshapeMismatch { .. })
        ));
    }

    #[test]
    fn test_topological_order() {
        let (fusion, ..) = layer_norm_like();
        let order = fusion.topological_exprs();
        assert_eq!(order.len(), 4);
        for (pos, id) in order.iter().enumerate() {
            let expr = fusion.expr(*id).unwrap();
            for inp in expr.kind.inputs() {
                if let Some(def) = fusion.tv(inp).definition {
                    let def_pos = order.iter().position(|e| *e == def).unwrap();
                    assert!(def_pos < pos);
                }
            }
        }
    }

    #[test]
    fn test_gather_like_shapes() {
        let mut fusion = Fusion::new();
        let lookup = fusion.add_input(DataType::Float, [16_i64, 32]);
        let idx = fusion.add_input(DataType::Int, [5_i64]);
        let sel = fusion.index_select(lookup, 0, idx).unwrap();
        assert_eq!(fusion.tv(sel).root[0].extent, Dim::Static(5));
        let one = fusion.select(lookup, 1).unwrap();
        assert_eq!(fusion.tv(one).root.len(), 1);
    }

    #[test]
    fn test_display_lists_exprs() {
        let (fusion, ..) = layer_norm_like();
        let text = fusion.to_string();
        assert!(text.contains("reduction(T1)"));
        assert!(text.contains("Outputs:"));
    }
}
