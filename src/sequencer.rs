//! One global filtering pass over a tree's constraint list.

use log::{trace, warn};
use serde::Serialize;

use crate::constraint::{Constraint, ConstraintProjector};
use crate::error::{FitError, FitResult};
use crate::fit_params::FitParams;

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct PassSummary {
    pub chi2: f64,
    pub ndf: usize,
    pub applied: usize,
}

/// Owns the constraint list in application order: by kind, then depth, then
/// construction order.
#[derive(Clone, Debug, Default)]
pub struct FitSequencer {
    constraints: Vec<Constraint>,
}

impl FitSequencer {
    pub fn new(mut constraints: Vec<Constraint>) -> Self {
        // stable, so equal keys keep their construction order
        constraints.sort_by_key(|c| c.sort_key());
        Self { constraints }
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    pub fn len(&self) -> usize {
        self.constraints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    /// Total constraint dimension of one pass.
    pub fn dims(&self) -> usize {
        self.constraints.iter().map(|c| c.dim()).sum()
    }

    /// Filter every constraint once, in order. Stops at the first failure;
    /// updates already applied stay in `params`.
    pub fn run_pass<P: ConstraintProjector + ?Sized>(
        &mut self,
        projector: &P,
        params: &mut FitParams,
    ) -> FitResult<PassSummary> {
        let mut summary = PassSummary::default();
        for constraint in self.constraints.iter_mut() {
            constraint.filter(projector, params).map_err(|source| {
                warn!(
                    "{} constraint on node {} failed after {} applied: {}",
                    constraint.kind(),
                    constraint.node(),
                    summary.applied,
                    source
                );
                FitError::ConstraintFailed {
                    kind: constraint.kind(),
                    node: constraint.node(),
                    source: Box::new(source),
                }
            })?;
            summary.chi2 += constraint.chi2();
            summary.ndf += constraint.ndf();
            summary.applied += 1;
        }
        trace!(
            "pass applied {} constraints: chi2 {:.4} over {} dims",
            summary.applied,
            summary.chi2,
            summary.ndf
        );
        Ok(summary)
    }
}
