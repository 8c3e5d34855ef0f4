//! Runtime facts a heuristic is evaluated against.

use crate::error::{SchedulerError, SchedulerResult};
use tessel_gpu::DeviceInfo;
use tessel_ir::{Dim, ExpressionEvaluator, Fusion, TvId};

/// Input sizes and the target device for one scheduling attempt.
#[derive(Clone, Debug)]
pub struct SchedulerRuntimeInfo {
    evaluator: ExpressionEvaluator,
    device: DeviceInfo,
}

impl SchedulerRuntimeInfo {
    /// Creates runtime info from bound extents and a device.
    #[must_use]
    pub fn new(evaluator: ExpressionEvaluator, device: DeviceInfo) -> Self {
        Self { evaluator, device }
    }

    /// The target device.
    #[must_use]
    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    /// The extent evaluator.
    #[must_use]
    pub fn evaluator(&self) -> &ExpressionEvaluator {
        &self.evaluator
    }

    /// Evaluates an extent.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::UnboundExtent` if the extent is symbolic and
    /// has no binding.
    pub fn evaluate(&self, dim: &Dim) -> SchedulerResult<i64> {
        self.evaluator
            .evaluate(dim)
            .ok_or_else(|| SchedulerError::UnboundExtent(dim.to_string()))
    }

    /// Product of the extents of `tv`'s root axes selected by `keep`.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::UnboundExtent` for an unbound extent.
    pub fn numel_where(
        &self,
        fusion: &Fusion,
        tv: TvId,
        keep: impl Fn(usize) -> bool,
    ) -> SchedulerResult<i64> {
        let mut numel = 1;
        for (pos, id) in fusion.tv(tv).root.iter().enumerate() {
            if keep(pos) {
                numel *= self.evaluate(&id.extent)?;
            }
        }
        Ok(numel)
    }
}
