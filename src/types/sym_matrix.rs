//! Packed lower-triangular storage for symmetric matrices.
//!
//! Element (i, j) with j <= i lives at `i * (i + 1) / 2 + j`. Reads of the
//! strict upper triangle are served by the mirrored lower element, so there
//! is only one copy of every off-diagonal value.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SymMatrix {
    dim: usize,
    packed: Vec<f64>,
}

#[inline]
fn packed_index(row: usize, col: usize) -> usize {
    let (i, j) = if col > row { (col, row) } else { (row, col) };
    i * (i + 1) / 2 + j
}

impl SymMatrix {
    pub fn zeros(dim: usize) -> Self {
        Self {
            dim,
            packed: vec![0.0; dim * (dim + 1) / 2],
        }
    }

    pub fn from_diagonal(diag: &[f64]) -> Self {
        let mut m = Self::zeros(diag.len());
        for (i, value) in diag.iter().enumerate() {
            m.set(i, i, *value);
        }
        m
    }

    /// Build from the lower triangle of a dense square matrix. The strict
    /// upper triangle of `dense` is never read.
    pub fn from_lower(dense: &DMatrix<f64>) -> Self {
        let dim = dense.nrows().min(dense.ncols());
        let mut m = Self::zeros(dim);
        for i in 0..dim {
            for j in 0..=i {
                m.set(i, j, dense[(i, j)]);
            }
        }
        m
    }

    /// Build from row-major nested arrays (serde input), lower triangle only.
    pub fn from_rows<const D: usize>(rows: &[[f64; D]; D]) -> Self {
        let mut m = Self::zeros(D);
        for (i, row) in rows.iter().enumerate() {
            for (j, value) in row.iter().enumerate().take(i + 1) {
                m.set(i, j, *value);
            }
        }
        m
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.packed[packed_index(row, col)]
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        self.packed[packed_index(row, col)] = value;
    }

    #[inline]
    pub fn add(&mut self, row: usize, col: usize, value: f64) {
        self.packed[packed_index(row, col)] += value;
    }

    pub fn diagonal(&self) -> Vec<f64> {
        (0..self.dim).map(|i| self.get(i, i)).collect()
    }

    pub fn trace(&self) -> f64 {
        (0..self.dim).map(|i| self.get(i, i)).sum()
    }

    pub fn fill_zero(&mut self) {
        self.packed.iter_mut().for_each(|v| *v = 0.0);
    }

    pub fn all_finite(&self) -> bool {
        self.packed.iter().all(|v| v.is_finite())
    }

    /// Dense copy with the upper triangle mirrored from the lower one.
    pub fn to_dense(&self) -> DMatrix<f64> {
        DMatrix::from_fn(self.dim, self.dim, |i, j| self.get(i, j))
    }

    /// `self · gᵗ` for an M×N matrix `g`, reading `self` through its packed
    /// lower triangle.
    pub fn mul_transposed(&self, g: &DMatrix<f64>) -> DMatrix<f64> {
        let n = self.dim;
        let m = g.nrows();
        let mut out = DMatrix::<f64>::zeros(n, m);
        for i in 0..n {
            for k in 0..m {
                let mut sum = 0.0;
                for j in 0..n {
                    let gkj = g[(k, j)];
                    if gkj != 0.0 {
                        sum += self.get(i, j) * gkj;
                    }
                }
                out[(i, k)] = sum;
            }
        }
        out
    }

    /// Copy `block` onto the diagonal block starting at `offset`.
    pub fn set_block(&mut self, offset: usize, block: &SymMatrix) {
        for i in 0..block.dim {
            for j in 0..=i {
                self.set(offset + i, offset + j, block.get(i, j));
            }
        }
    }
}
