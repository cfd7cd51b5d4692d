//! Linear algebra type system for the tree fitter
//!
//! The global state has a size only known once the decay tree is laid out,
//! so the engine works on dynamically sized nalgebra types. Fixed-size
//! aliases are used for the per-particle blocks.

use nalgebra::{DVector, SMatrix, SVector};

// ===== Parameter block sizes =====
pub const POSITION_DIM: usize = 3; // (x, y, z)
pub const MOMENTUM3_DIM: usize = 3; // (px, py, pz)
pub const MOMENTUM4_DIM: usize = 4; // (px, py, pz, E)
pub const FLIGHT_DIM: usize = 1; // decay length

// ===== Measurement dimensions =====
pub const MEASURE_DIM_TRACK: usize = 5; // 2 transverse offsets + p3
pub const MEASURE_DIM_PHOTON: usize = 3;
pub const MEASURE_DIM_COMPOSITE: usize = POSITION_DIM + MOMENTUM4_DIM;
pub const MEASURE_DIM_CONVERSION: usize = 2; // (dphi, dtheta)

// ===== Global state types =====
pub type StateVec = DVector<f64>;

// ===== Per-particle blocks =====
pub type Vec3 = SVector<f64, 3>;
pub type Vec4 = SVector<f64, 4>;
pub type Mat3 = SMatrix<f64, 3, 3>;

// Measured covariance blocks as they arrive from serde input
pub type Cov3 = [[f64; 3]; 3];
pub type Cov4 = [[f64; 4]; 4];
pub type Cov6 = [[f64; 6]; 6];
pub type Cov7 = [[f64; 7]; 7];
