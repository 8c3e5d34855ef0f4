//! Scheduler errors and rejection reasons.
//!
//! Two kinds of failure leave this crate:
//!
//! - [`RejectReason`]: an eligibility gate said no. Expected; the caller
//!   tries another heuristic.
//! - [`SchedulerError`]: an internal invariant broke after the gates
//!   passed. The caller must treat it as a bug and abandon the fusion.

use crate::heuristic::ScheduleHeuristic;
use std::fmt;
use tessel_ir::{IrError, TvId};
use thiserror::Error;
use tracing::debug;

/// Errors that can occur while deriving parameters or scheduling.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    /// No reduction tensor was supplied.
    #[error("need reduction tensor views to schedule")]
    NoReductionTensor,

    /// The reference tensor is not the output of a reduction.
    #[error("{0} is not defined by a reduction")]
    NotAReduction(TvId),

    /// The fusion has no tensor inputs.
    #[error("tried to schedule a fusion with no tensor inputs")]
    NoTensorInputs,

    /// The persistent buffer analysis came up empty after the gates passed.
    #[error("persistent scheduler requires persistent buffers")]
    NoPersistentBuffer,

    /// A combined inner/outer request found no outer reduction.
    #[error("no outer reduction tensor in inner-outer persistent fusion")]
    NoOuterReduction,

    /// Canonicalization found no reduction axis on the reference tensor.
    #[error("could not find reduction axis in {0}")]
    NoReductionAxis(TvId),

    /// All axes are reductions but the parameters are not fastest-dim.
    #[error("{0} has only reduction axes and must be scheduled as fastest-dim")]
    NoIterationAxis(TvId),

    /// A symbolic extent has no runtime binding.
    #[error("extent `{0}` is not bound")]
    UnboundExtent(String),

    /// The heuristic kind is not a persistent kind.
    #[error("{0} is not a persistent heuristic")]
    NotPersistent(ScheduleHeuristic),

    /// A tunable is out of its valid range.
    #[error("invalid scheduler option `{field}`: {reason}")]
    InvalidOption {
        /// The offending field.
        field: &'static str,
        /// What the field must satisfy.
        reason: &'static str,
    },

    /// A graph transform failed.
    #[error(transparent)]
    Ir(#[from] IrError),
}

/// Result type for scheduling operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Why a heuristic declined to schedule a fusion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RejectReason {
    /// The heuristic that rejected.
    pub heuristic: ScheduleHeuristic,
    /// What was wrong, naming the offending tensors or values.
    pub message: String,
}

impl RejectReason {
    /// Creates a rejection and logs it.
    #[must_use]
    pub fn new(heuristic: ScheduleHeuristic, message: impl Into<String>) -> Self {
        let reason = Self {
            heuristic,
            message: message.into(),
        };
        debug!(heuristic = %reason.heuristic, "{reason}");
        reason
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "scheduler _{}_ rejected because: {}",
            self.heuristic, self.message
        )
    }
}

impl std::error::Error for RejectReason {}
