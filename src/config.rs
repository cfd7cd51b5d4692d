use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::constraint::{Constraint, ConstraintKind, DEFAULT_CHI2_TOLERANCE};
use crate::tree::NodeId;

// ─── Per-kind iteration policy ───────────────────────────────────────────────

/// How a constraint kind is re-linearised: iteration budget and the chi2
/// change below which iterating stops early. `weight` scales the kind's
/// measurement covariance.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConstraintPolicy {
    pub max_iterations: usize,
    #[serde(default = "default_chi2_tolerance")]
    pub chi2_tolerance: f64,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_chi2_tolerance() -> f64 {
    DEFAULT_CHI2_TOLERANCE
}

fn default_weight() -> f64 {
    1.0
}

impl ConstraintPolicy {
    pub fn default_for(kind: ConstraintKind) -> Self {
        Self {
            max_iterations: kind.default_max_iterations(),
            chi2_tolerance: DEFAULT_CHI2_TOLERANCE,
            weight: 1.0,
        }
    }
}

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    // ── Global passes ──
    pub max_passes: usize,
    pub chi2_convergence: f64,
    pub slow_divergence_limit: usize,
    pub fast_divergence_factor: f64,

    // ── Prior covariance (diagonal) ──
    pub initial_position_variance: f64,
    pub initial_momentum_variance: f64,
    pub initial_flight_variance: f64,

    // ── Feature flags ──
    pub merge_constraints: bool,
    pub force_p4_sum: bool,

    // ── Per-kind overrides ──
    pub policies: BTreeMap<ConstraintKind, ConstraintPolicy>,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            max_passes: 10,
            chi2_convergence: 0.01,
            slow_divergence_limit: 3,
            fast_divergence_factor: 100.0,
            initial_position_variance: 400.0,
            initial_momentum_variance: 100.0,
            initial_flight_variance: 400.0,
            merge_constraints: false,
            force_p4_sum: false,
            policies: BTreeMap::new(),
        }
    }
}

impl FitConfig {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn policy(&self, kind: ConstraintKind) -> ConstraintPolicy {
        self.policies
            .get(&kind)
            .copied()
            .unwrap_or_else(|| ConstraintPolicy::default_for(kind))
    }

    /// A constraint carrying this configuration's policy for `kind`.
    pub fn constraint(
        &self,
        node: NodeId,
        kind: ConstraintKind,
        depth: i32,
        dim: usize,
    ) -> Constraint {
        let policy = self.policy(kind);
        Constraint::new(node, kind, depth, dim)
            .with_max_iterations(policy.max_iterations)
            .with_tolerance(policy.chi2_tolerance)
            .with_weight(policy.weight)
    }
}
