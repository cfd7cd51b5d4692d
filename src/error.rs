use thiserror::Error;

use crate::constraint::ConstraintKind;
use crate::tree::NodeId;

/// Fit error types
///
/// Every fallible stage of the engine returns one of these instead of
/// panicking; the caller decides whether to drop a measurement, retry or
/// abandon the decay hypothesis.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    #[error("innovation covariance is singular or not finite")]
    Inversion,

    #[error("projection failed: {0}")]
    Projection(String),

    #[error("bad setup: {0}")]
    BadSetup(String),

    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("{kind} constraint on node {node} failed: {source}")]
    ConstraintFailed {
        kind: ConstraintKind,
        node: NodeId,
        #[source]
        source: Box<FitError>,
    },

    #[error("fit diverging slowly after {passes} passes (chi2 {chi2:.4})")]
    SlowDiverging { passes: usize, chi2: f64 },

    #[error("fit diverging fast after {passes} passes (chi2 {chi2:.4})")]
    FastDiverging { passes: usize, chi2: f64 },

    #[error("fit did not converge within {passes} passes (chi2 {chi2:.4})")]
    NotConverged { passes: usize, chi2: f64 },
}

/// Result type for every fit stage
pub type FitResult<T> = Result<T, FitError>;

impl FitError {
    /// Innermost error, looking through `ConstraintFailed` wrappers.
    pub fn root_cause(&self) -> &FitError {
        match self {
            FitError::ConstraintFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// The failing constraint, if the error came out of a sequencer pass.
    pub fn failed_constraint(&self) -> Option<(ConstraintKind, NodeId)> {
        match self {
            FitError::ConstraintFailed { kind, node, .. } => Some((*kind, *node)),
            _ => None,
        }
    }
}
