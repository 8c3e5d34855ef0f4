//! # Tessel Fusion IR
//!
//! This crate defines the fusion graph that the tessel schedulers read and
//! annotate. A [`Fusion`] is a data-flow graph of tensor operations compiled
//! as one execution unit; each tensor is a [`TensorView`] whose root domain
//! tags every axis as iteration, reduction, or broadcast.
//!
//! ## Overview
//!
//! The graph captures what reduction scheduling needs:
//!
//! - **Element types**: for persistent buffer sizing and projection
//! - **Root domains**: iteration/reduction/broadcast tags and extents
//! - **Producer/consumer links**: for tracing cast chains and topology checks
//! - **Leaf domains**: the loop structure the scheduler transforms
//! - **Memory types**: register, shared, or global placement
//!
//! ## Main Types
//!
//! - [`Fusion`]: The graph arena
//! - [`TensorView`]: A tensor node
//! - [`IterDomain`]: One axis of a tensor
//! - [`ExprKind`]: The closed set of operator kinds
//! - [`RootDomainMap`]: Equivalence of root axes across the graph
//! - [`ExpressionEvaluator`]: Runtime binding of symbolic extents

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod evaluator;
pub mod fusion;
pub mod root_map;
pub mod transform;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

pub use evaluator::ExpressionEvaluator;
pub use fusion::Fusion;
pub use root_map::{check_pattern_equivalence, RootDomainMap};

/// A unique identifier for tensor views.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TvId(u32);

impl TvId {
    /// Creates an id from an arena index.
    #[must_use]
    pub const fn new(idx: usize) -> Self {
        Self(idx as u32)
    }

    /// Returns the arena index.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// A unique identifier for expressions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExprId(u32);

impl ExprId {
    /// Creates an id from an arena index.
    #[must_use]
    pub const fn new(idx: usize) -> Self {
        Self(idx as u32)
    }

    /// Returns the arena index.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Tensor element types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// Boolean (1 byte).
    Bool,
    /// 32-bit signed integer.
    Int32,
    /// 64-bit signed integer.
    Int,
    /// Index type; 64-bit.
    Index,
    /// 16-bit floating point (half precision).
    Half,
    /// Brain floating point (bfloat16).
    BFloat16,
    /// 32-bit floating point.
    Float,
    /// 64-bit floating point.
    Double,
    /// Complex number (single precision).
    ComplexFloat,
    /// Complex number (double precision).
    ComplexDouble,
}

impl DataType {
    /// Returns the size in bytes of this dtype.
    #[must_use]
    pub const fn size_bytes(self) -> usize {
        match self {
            Self::Bool => 1,
            Self::Half | Self::BFloat16 => 2,
            Self::Int32 | Self::Float => 4,
            Self::Int | Self::Index | Self::Double | Self::ComplexFloat => 8,
            Self::ComplexDouble => 16,
        }
    }

    /// Returns true if this is a floating-point type.
    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(
            self,
            Self::Half | Self::BFloat16 | Self::Float | Self::Double
        )
    }

    /// Returns true for floating-point types of at most 16 bits.
    #[must_use]
    pub const fn is_reduced_precision_float(self) -> bool {
        matches!(self, Self::Half | Self::BFloat16)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bool => "bool",
            Self::Int32 => "int32",
            Self::Int => "int64",
            Self::Index => "index",
            Self::Half => "half",
            Self::BFloat16 => "bfloat16",
            Self::Float => "float",
            Self::Double => "double",
            Self::ComplexFloat => "cfloat",
            Self::ComplexDouble => "cdouble",
        };
        f.write_str(name)
    }
}

/// An axis extent, either statically known or bound at run time.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dim {
    /// A statically known extent.
    Static(i64),
    /// A symbolic extent resolved by an [`ExpressionEvaluator`].
    Symbolic(String),
}

impl Dim {
    /// Returns the static value if known.
    #[must_use]
    pub const fn static_value(&self) -> Option<i64> {
        match self {
            Self::Static(n) => Some(*n),
            Self::Symbolic(_) => None,
        }
    }

    /// Shorthand for a symbolic extent.
    #[must_use]
    pub fn sym(name: impl Into<String>) -> Self {
        Self::Symbolic(name.into())
    }
}

impl From<i64> for Dim {
    fn from(n: i64) -> Self {
        Self::Static(n)
    }
}

impl From<&str> for Dim {
    fn from(name: &str) -> Self {
        Self::Symbolic(name.to_string())
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(n) => write!(f, "{n}"),
            Self::Symbolic(s) => f.write_str(s),
        }
    }
}

/// Role of an axis in a tensor's root domain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IterType {
    /// A regular data-parallel axis.
    Iteration,
    /// An axis reduced away by the defining reduction.
    Reduction,
    /// A size-1 axis that is broadcast against other tensors.
    Broadcast,
}

/// Hardware mapping of a leaf axis.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum ParallelType {
    #[default]
    Serial,
    BIDx,
    BIDy,
    BIDz,
    TIDx,
    TIDy,
    TIDz,
    Vectorize,
    Unroll,
    Unswitch,
    Group,
}

/// One axis of a tensor view.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IterDomain {
    /// Axis role.
    pub iter_type: IterType,
    /// Axis extent.
    pub extent: Dim,
    /// Hardware mapping, for leaf axes.
    pub parallel: ParallelType,
}

impl IterDomain {
    /// Creates an axis of the given type.
    #[must_use]
    pub fn new(iter_type: IterType, extent: impl Into<Dim>) -> Self {
        Self {
            iter_type,
            extent: extent.into(),
            parallel: ParallelType::Serial,
        }
    }

    /// Creates an iteration axis.
    #[must_use]
    pub fn iteration(extent: impl Into<Dim>) -> Self {
        Self::new(IterType::Iteration, extent)
    }

    /// Creates a broadcast axis of extent 1.
    #[must_use]
    pub fn broadcast() -> Self {
        Self::new(IterType::Broadcast, 1)
    }

    /// Returns true for reduction axes.
    #[must_use]
    pub fn is_reduction(&self) -> bool {
        self.iter_type == IterType::Reduction
    }

    /// Returns true for broadcast axes.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.iter_type == IterType::Broadcast
    }
}

/// Where a tensor is held during kernel execution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryType {
    /// Registers / local memory.
    #[default]
    Local,
    /// Block-shared memory.
    Shared,
    /// Device global memory.
    Global,
}

/// A tensor node in the fusion graph.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TensorView {
    /// Identifier.
    pub id: TvId,
    /// Element type.
    pub dtype: DataType,
    /// Root domain, as produced by the defining expression.
    pub root: SmallVec<[IterDomain; 4]>,
    /// Leaf (loop) domain, transformed by schedulers.
    pub leaf: Vec<IterDomain>,
    /// Memory placement.
    pub memory_type: MemoryType,
    /// The expression producing this tensor; `None` for fusion inputs.
    pub definition: Option<ExprId>,
    /// Expressions consuming this tensor.
    pub uses: SmallVec<[ExprId; 2]>,
}

impl TensorView {
    /// Returns true if any root axis is a reduction.
    #[must_use]
    pub fn has_reduction(&self) -> bool {
        self.root.iter().any(IterDomain::is_reduction)
    }

    /// The domain visible to consumers: root axes without reductions.
    pub fn logical(&self) -> impl Iterator<Item = &IterDomain> {
        self.root.iter().filter(|id| !id.is_reduction())
    }

    /// Number of logical axes.
    #[must_use]
    pub fn logical_rank(&self) -> usize {
        self.logical().count()
    }

    /// Number of root axes that are not broadcast.
    #[must_use]
    pub fn non_broadcast_root_count(&self) -> usize {
        self.root.iter().filter(|id| !id.is_broadcast()).count()
    }

    /// Returns true if the innermost non-broadcast root axis is reduced.
    #[must_use]
    pub fn is_fastest_dim_reduction(&self) -> bool {
        self.root
            .iter()
            .rev()
            .find(|id| !id.is_broadcast())
            .is_some_and(IterDomain::is_reduction)
    }
}

impl fmt::Display for TensorView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}[", self.id, self.dtype)?;
        for (i, id) in self.root.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            let tag = match id.iter_type {
                IterType::Iteration => "i",
                IterType::Reduction => "r",
                IterType::Broadcast => "b",
            };
            write!(f, "{tag}{}", id.extent)?;
        }
        f.write_str("]")
    }
}

/// Unary elementwise operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum UnaryOpType {
    Neg,
    Abs,
    Exp,
    Log,
    Sqrt,
    Rsqrt,
    Reciprocal,
    Relu,
    Tanh,
}

/// Binary elementwise operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum BinaryOpType {
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
    Pow,
}

/// Ternary elementwise operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum TernaryOpType {
    Where,
    Lerp,
    Clamp,
}

/// Reduction operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum ReductionOpType {
    Add,
    Mul,
    Max,
    Min,
}

/// The operator kinds a fusion may contain.
///
/// Every pass matches on this exhaustively.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ExprKind {
    /// Unary elementwise op.
    Unary {
        /// Operator.
        op: UnaryOpType,
        /// Input.
        input: TvId,
        /// Output.
        output: TvId,
    },
    /// Type conversion.
    Cast {
        /// Input.
        input: TvId,
        /// Output; its dtype is the target type.
        output: TvId,
    },
    /// Binary elementwise op.
    Binary {
        /// Operator.
        op: BinaryOpType,
        /// Left input.
        lhs: TvId,
        /// Right input.
        rhs: TvId,
        /// Output.
        output: TvId,
    },
    /// Ternary elementwise op.
    Ternary {
        /// Operator.
        op: TernaryOpType,
        /// Inputs.
        inputs: [TvId; 3],
        /// Output.
        output: TvId,
    },
    /// Reduction over the output's reduction axes.
    Reduction {
        /// Operator.
        op: ReductionOpType,
        /// Input.
        input: TvId,
        /// Output.
        output: TvId,
    },
    /// Several reductions over the same axes evaluated together.
    GroupedReduction {
        /// Operators, one per output.
        ops: Vec<ReductionOpType>,
        /// Inputs, one per output.
        inputs: Vec<TvId>,
        /// Outputs.
        outputs: Vec<TvId>,
    },
    /// Insertion of broadcast axes.
    Broadcast {
        /// Input.
        input: TvId,
        /// Output.
        output: TvId,
        /// Per output axis, whether it is a new broadcast axis.
        flags: Vec<bool>,
    },
    /// Copy; also used for caching into a different memory type.
    Set {
        /// Input.
        input: TvId,
        /// Output.
        output: TvId,
    },
    /// Reshape to a new shape with the same element count.
    View {
        /// Input.
        input: TvId,
        /// Output.
        output: TvId,
    },
    /// Select rows of `lookup` along `dim` using a 1-D index tensor.
    IndexSelect {
        /// Tensor read from.
        lookup: TvId,
        /// Indices.
        index: TvId,
        /// Selected axis of `lookup`.
        dim: usize,
        /// Output.
        output: TvId,
    },
    /// Elementwise gather along `dim`; output has the index tensor's shape.
    Gather {
        /// Tensor read from.
        lookup: TvId,
        /// Indices.
        index: TvId,
        /// Gathered axis of `lookup`.
        dim: usize,
        /// Output.
        output: TvId,
    },
    /// Select a single slice along `dim`, removing that axis.
    Select {
        /// Tensor read from.
        lookup: TvId,
        /// Selected axis.
        dim: usize,
        /// Output.
        output: TvId,
    },
    /// Matrix multiply-accumulate.
    Mma {
        /// Left operand.
        a: TvId,
        /// Right operand.
        b: TvId,
        /// Output.
        output: TvId,
    },
}

impl ExprKind {
    /// Input tensors, in operand order.
    #[must_use]
    pub fn inputs(&self) -> SmallVec<[TvId; 3]> {
        match self {
            Self::Unary { input, .. }
            | Self::Cast { input, .. }
            | Self::Reduction { input, .. }
            | Self::Broadcast { input, .. }
            | Self::Set { input, .. }
            | Self::View { input, .. } => SmallVec::from_slice(&[*input]),
            Self::Binary { lhs, rhs, .. } => SmallVec::from_slice(&[*lhs, *rhs]),
            Self::Ternary { inputs, .. } => SmallVec::from_slice(inputs),
            Self::GroupedReduction { inputs, .. } => inputs.iter().copied().collect(),
            Self::IndexSelect { lookup, index, .. } | Self::Gather { lookup, index, .. } => {
                SmallVec::from_slice(&[*lookup, *index])
            }
            Self::Select { lookup, .. } => SmallVec::from_slice(&[*lookup]),
            Self::Mma { a, b, .. } => SmallVec::from_slice(&[*a, *b]),
        }
    }

    /// Output tensors.
    #[must_use]
    pub fn outputs(&self) -> SmallVec<[TvId; 3]> {
        match self {
            Self::Unary { output, .. }
            | Self::Cast { output, .. }
            | Self::Binary { output, .. }
            | Self::Ternary { output, .. }
            | Self::Reduction { output, .. }
            | Self::Broadcast { output, .. }
            | Self::Set { output, .. }
            | Self::View { output, .. }
            | Self::IndexSelect { output, .. }
            | Self::Gather { output, .. }
            | Self::Select { output, .. }
            | Self::Mma { output, .. } => SmallVec::from_slice(&[*output]),
            Self::GroupedReduction { outputs, .. } => outputs.iter().copied().collect(),
        }
    }

    /// Replace every occurrence of `old` among the inputs with `new`.
    pub fn replace_input(&mut self, old: TvId, new: TvId) {
        let swap = |tv: &mut TvId| {
            if *tv == old {
                *tv = new;
            }
        };
        match self {
            Self::Unary { input, .. }
            | Self::Cast { input, .. }
            | Self::Reduction { input, .. }
            | Self::Broadcast { input, .. }
            | Self::Set { input, .. }
            | Self::View { input, .. } => swap(input),
            Self::Binary { lhs, rhs, .. } => {
                swap(lhs);
                swap(rhs);
            }
            Self::Ternary { inputs, .. } => inputs.iter_mut().for_each(swap),
            Self::GroupedReduction { inputs, .. } => inputs.iter_mut().for_each(swap),
            Self::IndexSelect { lookup, index, .. } | Self::Gather { lookup, index, .. } => {
                swap(lookup);
                swap(index);
            }
            Self::Select { lookup, .. } => swap(lookup),
            Self::Mma { a, b, .. } => {
                swap(a);
                swap(b);
            }
        }
    }

    /// Replace the output `old` with `new`.
    pub fn replace_output(&mut self, old: TvId, new: TvId) {
        let swap = |tv: &mut TvId| {
            if *tv == old {
                *tv = new;
            }
        };
        match self {
            Self::Unary { output, .. }
            | Self::Cast { output, .. }
            | Self::Binary { output, .. }
            | Self::Ternary { output, .. }
            | Self::Reduction { output, .. }
            | Self::Broadcast { output, .. }
            | Self::Set { output, .. }
            | Self::View { output, .. }
            | Self::IndexSelect { output, .. }
            | Self::Gather { output, .. }
            | Self::Select { output, .. }
            | Self::Mma { output, .. } => swap(output),
            Self::GroupedReduction { outputs, .. } => outputs.iter_mut().for_each(swap),
        }
    }

    /// Returns true for elementwise operators, where every input axis
    /// lines up with the output axis at the same position.
    #[must_use]
    pub const fn is_pointwise(&self) -> bool {
        matches!(
            self,
            Self::Unary { .. }
                | Self::Cast { .. }
                | Self::Binary { .. }
                | Self::Ternary { .. }
                | Self::Set { .. }
        )
    }

    /// Returns true for reductions, grouped or not.
    #[must_use]
    pub const fn is_reduction(&self) -> bool {
        matches!(self, Self::Reduction { .. } | Self::GroupedReduction { .. })
    }

    /// Returns true for ops that read from a lookup tensor at data-dependent
    /// positions.
    #[must_use]
    pub const fn is_gather_like(&self) -> bool {
        matches!(
            self,
            Self::IndexSelect { .. } | Self::Gather { .. } | Self::Select { .. }
        )
    }

    /// Short operator name, for diagnostics.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Unary { .. } => "unary",
            Self::Cast { .. } => "cast",
            Self::Binary { .. } => "binary",
            Self::Ternary { .. } => "ternary",
            Self::Reduction { .. } => "reduction",
            Self::GroupedReduction { .. } => "grouped_reduction",
            Self::Broadcast { .. } => "broadcast",
            Self::Set { .. } => "set",
            Self::View { .. } => "view",
            Self::IndexSelect { .. } => "index_select",
            Self::Gather { .. } => "gather",
            Self::Select { .. } => "select",
            Self::Mma { .. } => "mma",
        }
    }
}

/// An expression node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Expr {
    /// Identifier.
    pub id: ExprId,
    /// The operator and its operands.
    pub kind: ExprKind,
}

/// Errors raised while building or transforming a fusion.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum IrError {
    /// Operands of an elementwise op disagree in rank.
    #[error("rank mismatch: {lhs} has rank {lhs_rank}, {rhs} has rank {rhs_rank}")]
    RankMismatch {
        /// First operand.
        lhs: TvId,
        /// Its logical rank.
        lhs_rank: usize,
        /// Second operand.
        rhs: TvId,
        /// Its logical rank.
        rhs_rank: usize,
    },

    /// Invalid axis for operation.
    #[error("invalid axis {axis} for {tv} of rank {rank}")]
    InvalidAxis {
        /// Tensor.
        tv: TvId,
        /// The axis specified.
        axis: usize,
        /// The tensor rank.
        rank: usize,
    },

    /// Reshape changes the number of elements.
    #[error("cannot reshape {tv}: {from} elements into {to}")]
    ReshapeMismatch {
        /// Tensor.
        tv: TvId,
        /// Input element count.
        from: i64,
        /// Output element count.
        to: i64,
    },

    /// Id does not name a live node.
    #[error("unknown tensor {0}")]
    UnknownTensor(TvId),

    /// A grouping request mixed reductions over different axes.
    #[error("cannot group reductions: {0}")]
    InvalidGrouping(String),
}

/// Result type for IR operations.
pub type IrResult<T> = Result<T, IrError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_sizes() {
        assert_eq!(DataType::Half.size_bytes(), 2);
        assert_eq!(DataType::Float.size_bytes(), 4);
        assert_eq!(DataType::Double.size_bytes(), 8);
        assert!(DataType::BFloat16.is_reduced_precision_float());
        assert!(!DataType::Float.is_reduced_precision_float());
    }

    #[test]
    fn test_fastest_dim_reduction_skips_broadcast() {
        let tv = TensorView {
            id: TvId::new(0),
            dtype: DataType::Float,
            root: SmallVec::from_vec(vec![
                IterDomain::iteration(8),
                IterDomain::new(IterType::Reduction, 16),
                IterDomain::broadcast(),
            ]),
            leaf: Vec::new(),
            memory_type: MemoryType::Local,
            definition: None,
            uses: SmallVec::new(),
        };
        assert!(tv.is_fastest_dim_reduction());
        assert_eq!(tv.non_broadcast_root_count(), 2);
        assert_eq!(tv.logical_rank(), 2);
        assert_eq!(tv.to_string(), "T0_float[i8, r16, b1]");
    }

    #[test]
    fn test_replace_input() {
        let mut kind = ExprKind::Binary {
            op: BinaryOpType::Add,
            lhs: TvId::new(1),
            rhs: TvId::new(1),
            output: TvId::new(2),
        };
        kind.replace_input(TvId::new(1), TvId::new(5));
        assert_eq!(kind.inputs().as_slice(), &[TvId::new(5), TvId::new(5)]);
    }
}
