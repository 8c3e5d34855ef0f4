//! Runtime binding of symbolic extents.

use crate::Dim;
use rustc_hash::FxHashMap;

/// Resolves extents of a fusion against the sizes of one set of inputs.
#[derive(Clone, Debug, Default)]
pub struct ExpressionEvaluator {
    bindings: FxHashMap<String, i64>,
}

impl ExpressionEvaluator {
    /// Creates an evaluator with no bindings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a symbol to a concrete value.
    pub fn bind(&mut self, symbol: impl Into<String>, value: i64) {
        self.bindings.insert(symbol.into(), value);
    }

    /// Builder-style [`ExpressionEvaluator::bind`].
    #[must_use]
    pub fn with(mut self, symbol: impl Into<String>, value: i64) -> Self {
        self.bind(symbol, value);
        self
    }

    /// Evaluates an extent; `None` if it is symbolic and unbound.
    #[must_use]
    pub fn evaluate(&self, dim: &Dim) -> Option<i64> {
        match dim {
            Dim::Static(n) => Some(*n),
            Dim::Symbolic(s) => self.bindings.get(s).copied(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evaluate() {
        let ee = ExpressionEvaluator::new().with("n", 1024);
        assert_eq!(ee.evaluate(&Dim::Static(3)), Some(3));
        assert_eq!(ee.evaluate(&Dim::sym("n")), Some(1024));
        assert_eq!(ee.evaluate(&Dim::sym("m")), None);
    }
}
