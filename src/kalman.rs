//! Kalman measurement update on the global fit state.
//!
//! The gain computation only reads `FitParams`; state and covariance are
//! touched by the separate `update_*` calls, so a failed inversion never
//! leaves a half-applied update behind.

use log::{debug, trace};
use nalgebra::{DMatrix, DVector};

use crate::error::{FitError, FitResult};
use crate::fit_params::FitParams;
use crate::projection::Projection;

#[derive(Clone, Debug)]
pub struct KalmanCalculator {
    /// Residual of the last projection [M]
    residual: DVector<f64>,

    /// Projection matrix G [M×N]
    g: DMatrix<f64>,

    /// C·Gᵗ [N×M]
    cgt: DMatrix<f64>,

    /// Inverse innovation covariance R'⁻¹ [M×M]
    r_inverse: DMatrix<f64>,

    /// Kalman gain K = C·Gᵗ·R'⁻¹ [N×M]
    gain: DMatrix<f64>,

    /// Chi2 of the last state update
    chi2: f64,
}

impl Default for KalmanCalculator {
    fn default() -> Self {
        Self::new()
    }
}

/// Mirror the lower triangle of a square matrix onto its upper triangle.
fn symmetric_from_lower(m: &DMatrix<f64>) -> DMatrix<f64> {
    let n = m.nrows();
    DMatrix::from_fn(n, n, |i, j| if j > i { m[(j, i)] } else { m[(i, j)] })
}

impl KalmanCalculator {
    pub fn new() -> Self {
        Self {
            residual: DVector::zeros(0),
            g: DMatrix::zeros(0, 0),
            cgt: DMatrix::zeros(0, 0),
            r_inverse: DMatrix::zeros(0, 0),
            gain: DMatrix::zeros(0, 0),
            chi2: 0.0,
        }
    }

    pub fn chi2(&self) -> f64 {
        self.chi2
    }

    pub fn gain(&self) -> &DMatrix<f64> {
        &self.gain
    }

    pub fn r_inverse(&self) -> &DMatrix<f64> {
        &self.r_inverse
    }

    fn check_dimensions(projection: &Projection, params: &FitParams) -> FitResult<()> {
        let dim = projection.dim();
        if dim == 0 {
            return Err(FitError::DimensionMismatch(
                "projection has no residual rows".to_string(),
            ));
        }
        if projection.h.nrows() != dim {
            return Err(FitError::DimensionMismatch(format!(
                "projection matrix has {} rows, residual has {}",
                projection.h.nrows(),
                dim
            )));
        }
        if projection.state_dim() != params.dim() {
            return Err(FitError::DimensionMismatch(format!(
                "projection matrix has {} columns, state has {}",
                projection.state_dim(),
                params.dim()
            )));
        }
        if let Some(v) = &projection.v {
            if v.dim() != dim {
                return Err(FitError::DimensionMismatch(format!(
                    "measurement covariance is {}×{}, residual has {} rows",
                    v.dim(),
                    v.dim(),
                    dim
                )));
            }
        }
        Ok(())
    }

    /// Compute innovation covariance, its inverse and the Kalman gain.
    ///
    /// `R = G·C·Gᵗ`, plus `w·V` when the projection carries a usable
    /// measurement covariance. Fails with `FitError::Inversion` if `R'` is
    /// singular or its inverse has a non-finite entry; `params` is only read.
    pub fn calculate_gain_matrix(
        &mut self,
        projection: &Projection,
        params: &FitParams,
    ) -> FitResult<()> {
        Self::check_dimensions(projection, params)?;
        let dim = projection.dim();

        let cgt = params.covariance().mul_transposed(&projection.h);
        let mut r = symmetric_from_lower(&(&projection.h * &cgt));

        if projection.uses_measurement_covariance() {
            if let Some(v) = &projection.v {
                let w = projection.weight;
                for i in 0..dim {
                    for j in 0..dim {
                        r[(i, j)] += w * v.get(i, j);
                    }
                }
            }
        }

        if !r.iter().all(|x| x.is_finite()) {
            debug!("innovation covariance has non-finite entries");
            return Err(FitError::Inversion);
        }

        let inverse = r.try_inverse().ok_or_else(|| {
            debug!("innovation covariance ({}×{}) is singular", dim, dim);
            FitError::Inversion
        })?;
        if !inverse.iter().all(|x| x.is_finite()) {
            debug!("inverse innovation covariance has non-finite entries");
            return Err(FitError::Inversion);
        }
        let r_inverse = symmetric_from_lower(&inverse);
        let gain = &cgt * &r_inverse;

        trace!(
            "gain computed: dim {} state {} |r| {:.4e}",
            dim,
            params.dim(),
            projection.residual.norm()
        );

        self.residual = projection.residual.clone();
        self.g = projection.h.clone();
        self.cgt = cgt;
        self.r_inverse = r_inverse;
        self.gain = gain;
        self.chi2 = 0.0;
        Ok(())
    }

    /// `state ← state − K·r`, chi2 = `rᵗ·R'⁻¹·r`.
    pub fn update_state(&mut self, params: &mut FitParams) {
        let dx = &self.gain * &self.residual;
        *params.state_mut() -= dx;
        self.chi2 = self.residual.dot(&(&self.r_inverse * &self.residual));
    }

    /// Update relative to a reference state, for projections linearised at a
    /// point other than the one being updated.
    ///
    /// `r' = r + G·(reference − state)`, `state ← reference − K·r'`,
    /// chi2 = `r'ᵗ·R'⁻¹·r'`.
    pub fn update_state_with_reference(
        &mut self,
        params: &mut FitParams,
        reference: &DVector<f64>,
    ) -> FitResult<()> {
        if reference.len() != params.dim() {
            return Err(FitError::DimensionMismatch(format!(
                "reference state has {} entries, state has {}",
                reference.len(),
                params.dim()
            )));
        }
        let delta = reference - params.state();
        let r_prime = &self.residual + &self.g * delta;
        *params.state_mut() = reference - &self.gain * &r_prime;
        self.chi2 = r_prime.dot(&(&self.r_inverse * &r_prime));
        Ok(())
    }

    /// `C ← C − C·Gᵗ·R'⁻¹·G·C`, written into the lower triangle only.
    pub fn update_covariance(&self, params: &mut FitParams) {
        let n = params.dim();
        let m = self.gain.ncols();
        let cov = params.covariance_mut();
        for i in 0..n {
            for j in 0..=i {
                let mut delta = 0.0;
                for a in 0..m {
                    delta += self.gain[(i, a)] * self.cgt[(j, a)];
                }
                if delta != 0.0 {
                    cov.add(i, j, -delta);
                }
            }
        }
    }

    /// Full `deltaCov = C·Gᵗ·R'⁻¹·G·C` of the last gain computation.
    pub fn delta_covariance(&self) -> DMatrix<f64> {
        &self.gain * self.cgt.transpose()
    }

    /// Gain, direct state update and covariance update in one step.
    /// Returns the chi2 contribution; on error nothing was modified.
    pub fn apply(&mut self, projection: &Projection, params: &mut FitParams) -> FitResult<f64> {
        self.calculate_gain_matrix(projection, params)?;
        self.update_state(params);
        self.update_covariance(params);
        Ok(self.chi2)
    }
}
