pub mod linalg;
pub mod sym_matrix;

pub use linalg::*;
pub use sym_matrix::SymMatrix;

use serde::{Deserialize, Serialize};

/// Luminous region: beam-spot position and, optionally, the beam four-momentum.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BeamSpec {
    pub position: [f64; 3],
    pub position_covariance: Cov3,
    #[serde(default)]
    pub momentum: Option<[f64; 4]>,
    #[serde(default)]
    pub momentum_covariance: Option<Cov4>,
}

/// Straight-line track: a reference point on the trajectory and the momentum
/// there. Covariance is ordered (x, y, z, px, py, pz).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrackMeasurement {
    pub reference_point: [f64; 3],
    pub momentum: [f64; 3],
    pub covariance: Cov6,
}

/// Calorimeter cluster. Covariance is ordered (x, y, z, E).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PhotonMeasurement {
    pub position: [f64; 3],
    pub energy: f64,
    pub covariance: Cov4,
}

/// Previously vertexed composite. Covariance is ordered (x, y, z, px, py, pz, E).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompositeMeasurement {
    pub vertex: [f64; 3],
    pub momentum: [f64; 4],
    pub covariance: Cov7,
}

/// Measured four-momentum of a resonance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResonanceMeasurement {
    pub momentum: [f64; 4],
    pub covariance: Cov4,
}
