//! Constrained decay-tree fitting with an iterated Kalman filter.
//!
//! A decay tree is flattened into one global parameter vector. Measurement
//! and physics constraints are then filtered into it one at a time, in a
//! fixed order, and the whole list is re-applied until the total chi2
//! settles.

pub mod config;
pub mod constraint;
pub mod error;
pub mod fit_params;
pub mod fitter;
pub mod kalman;
pub mod projection;
pub mod sequencer;
pub mod tree;
pub mod types;

pub use config::{ConstraintPolicy, FitConfig};
pub use constraint::{Constraint, ConstraintKind, ConstraintProjector};
pub use error::{FitError, FitResult};
pub use fit_params::FitParams;
pub use fitter::{FitSummary, FittedParticle, Fitter};
pub use kalman::KalmanCalculator;
pub use projection::Projection;
pub use sequencer::{FitSequencer, PassSummary};
pub use tree::{DecayTree, NodeId, TreeSpec};
