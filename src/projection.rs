//! Residual/projection bundle for one constraint evaluation.

use nalgebra::{DMatrix, DVector};

use crate::types::SymMatrix;

/// Residual `r` (M), Jacobian `H` (M×N) of the residual with respect to the
/// global state, optional measurement covariance `V` (M×M) and the weight
/// applied to `V` in the innovation covariance.
#[derive(Clone, Debug)]
pub struct Projection {
    pub residual: DVector<f64>,
    pub h: DMatrix<f64>,
    pub v: Option<SymMatrix>,
    pub weight: f64,
}

impl Projection {
    pub fn new(state_dim: usize, dim: usize) -> Self {
        Self {
            residual: DVector::zeros(dim),
            h: DMatrix::zeros(dim, state_dim),
            v: None,
            weight: 1.0,
        }
    }

    pub fn dim(&self) -> usize {
        self.residual.len()
    }

    pub fn state_dim(&self) -> usize {
        self.h.ncols()
    }

    pub fn reset(&mut self) {
        self.residual.fill(0.0);
        self.h.fill(0.0);
        self.v = None;
        self.weight = 1.0;
    }

    /// Set V(row, col) (and its mirror), allocating V on first use.
    pub fn set_v(&mut self, row: usize, col: usize, value: f64) {
        let dim = self.dim();
        self.v
            .get_or_insert_with(|| SymMatrix::zeros(dim))
            .set(row, col, value);
    }

    /// Copy a measurement covariance onto the diagonal block at `offset`.
    pub fn set_v_block(&mut self, offset: usize, block: &SymMatrix) {
        let dim = self.dim();
        self.v
            .get_or_insert_with(|| SymMatrix::zeros(dim))
            .set_block(offset, block);
    }

    /// Whether V enters the innovation covariance: present, weighted, and
    /// with no zero on its diagonal.
    pub fn uses_measurement_covariance(&self) -> bool {
        match &self.v {
            Some(v) => self.weight != 0.0 && (0..v.dim()).all(|i| v.get(i, i) != 0.0),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shapes() {
        let p = Projection::new(10, 3);
        assert_eq!(p.dim(), 3);
        assert_eq!(p.state_dim(), 10);
        assert_eq!(p.h.shape(), (3, 10));
        assert!(p.v.is_none());
    }

    #[test]
    fn test_measurement_covariance_rules() {
        let mut p = Projection::new(2, 2);
        assert!(!p.uses_measurement_covariance());

        p.set_v(0, 0, 1.0);
        // second diagonal entry still zero
        assert!(!p.uses_measurement_covariance());

        p.set_v(1, 1, 2.0);
        assert!(p.uses_measurement_covariance());

        p.weight = 0.0;
        assert!(!p.uses_measurement_covariance());

        p.reset();
        assert!(p.v.is_none());
        assert_eq!(p.weight, 1.0);
    }
}
