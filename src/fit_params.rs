//! Global fit state shared by every constraint of one decay tree.
//!
//! Index layout (which slots belong to which particle) is owned by the tree;
//! this type only knows the flat vector, its covariance and the running
//! chi2/ndf accumulators of the current pass.

use log::trace;
use nalgebra::DVector;

use crate::types::{StateVec, SymMatrix};

#[derive(Clone, Debug)]
pub struct FitParams {
    /// State vector [N]
    state: StateVec,

    /// Covariance [N×N], lower triangle packed
    covariance: SymMatrix,

    /// Sum of chi2 contributions applied since the last reset
    chi2: f64,

    /// Sum of constraint dimensions applied since the last reset
    constraint_dims: usize,
}

impl FitParams {
    pub fn new(dim: usize) -> Self {
        Self {
            state: DVector::zeros(dim),
            covariance: SymMatrix::zeros(dim),
            chi2: 0.0,
            constraint_dims: 0,
        }
    }

    pub fn from_parts(state: StateVec, covariance: SymMatrix) -> Self {
        debug_assert_eq!(state.len(), covariance.dim());
        Self {
            state,
            covariance,
            chi2: 0.0,
            constraint_dims: 0,
        }
    }

    pub fn dim(&self) -> usize {
        self.state.len()
    }

    pub fn state(&self) -> &StateVec {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut StateVec {
        &mut self.state
    }

    pub fn covariance(&self) -> &SymMatrix {
        &self.covariance
    }

    pub fn covariance_mut(&mut self) -> &mut SymMatrix {
        &mut self.covariance
    }

    pub fn chi2(&self) -> f64 {
        self.chi2
    }

    pub fn constraint_dims(&self) -> usize {
        self.constraint_dims
    }

    /// Degrees of freedom: applied constraint dimensions minus free parameters.
    pub fn ndf(&self) -> i64 {
        self.constraint_dims as i64 - self.dim() as i64
    }

    pub fn add_chi2(&mut self, chi2: f64, dims: usize) {
        self.chi2 += chi2;
        self.constraint_dims += dims;
    }

    pub fn reset_chi2(&mut self) {
        self.chi2 = 0.0;
        self.constraint_dims = 0;
    }

    /// Replace the covariance with a diagonal prior.
    pub fn reset_covariance(&mut self, diagonal: &[f64]) {
        debug_assert_eq!(diagonal.len(), self.dim());
        self.covariance.fill_zero();
        for (i, value) in diagonal.iter().enumerate() {
            self.covariance.set(i, i, *value);
        }
        trace!("covariance reset, trace {:.4}", self.covariance.trace());
    }

    /// Square root of the diagonal covariance entry, clamped at zero.
    pub fn error(&self, index: usize) -> f64 {
        self.covariance.get(index, index).max(0.0).sqrt()
    }
}
