//! Typed, tree-scoped constraints and their Kalman filtering protocol.
//!
//! A constraint does not know any physics. It asks a `ConstraintProjector`
//! for the residual and Jacobian of its (kind, node) pair and drives the
//! Kalman update, iterating with re-linearisation when it is non-linear.

use std::fmt;

use log::trace;
use serde::{Deserialize, Serialize};

use crate::error::{FitError, FitResult};
use crate::fit_params::FitParams;
use crate::kalman::KalmanCalculator;
use crate::projection::Projection;
use crate::tree::NodeId;

pub const DEFAULT_CHI2_TOLERANCE: f64 = 1e-3;

/// Constraint families in application order.
///
/// The declaration order is the ordering table: the derived `Ord` is what the
/// sequencer sorts by, so a new kind is placed by inserting it here.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    BeamSpot,
    BeamEnergy,
    Lifetime,
    Resonance,
    Composite,
    Track,
    Photon,
    Conversion,
    Kinematic,
    MassEnergy,
    Geometric,
    Mass,
    Merged,
}

impl ConstraintKind {
    pub const ALL: [ConstraintKind; 13] = [
        ConstraintKind::BeamSpot,
        ConstraintKind::BeamEnergy,
        ConstraintKind::Lifetime,
        ConstraintKind::Resonance,
        ConstraintKind::Composite,
        ConstraintKind::Track,
        ConstraintKind::Photon,
        ConstraintKind::Conversion,
        ConstraintKind::Kinematic,
        ConstraintKind::MassEnergy,
        ConstraintKind::Geometric,
        ConstraintKind::Mass,
        ConstraintKind::Merged,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ConstraintKind::BeamSpot => "beam_spot",
            ConstraintKind::BeamEnergy => "beam_energy",
            ConstraintKind::Lifetime => "lifetime",
            ConstraintKind::Resonance => "resonance",
            ConstraintKind::Composite => "composite",
            ConstraintKind::Track => "track",
            ConstraintKind::Photon => "photon",
            ConstraintKind::Conversion => "conversion",
            ConstraintKind::Kinematic => "kinematic",
            ConstraintKind::MassEnergy => "mass_energy",
            ConstraintKind::Geometric => "geometric",
            ConstraintKind::Mass => "mass",
            ConstraintKind::Merged => "merged",
        }
    }

    /// Iteration budget used when the configuration does not override it.
    pub fn default_max_iterations(self) -> usize {
        match self {
            ConstraintKind::Photon
            | ConstraintKind::Conversion
            | ConstraintKind::Kinematic
            | ConstraintKind::MassEnergy
            | ConstraintKind::Geometric => 3,
            ConstraintKind::Mass => 10,
            _ => 1,
        }
    }
}

impl fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Projection-formula collaborator: fills `projection` (already sized to the
/// constraint dimension and the state size) for one (kind, node) pair.
/// Must not modify the state.
pub trait ConstraintProjector {
    fn project(
        &self,
        kind: ConstraintKind,
        node: NodeId,
        params: &FitParams,
        projection: &mut Projection,
    ) -> FitResult<()>;
}

/// One (kind, node) member of a merged constraint.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MergedComponent {
    pub kind: ConstraintKind,
    pub node: NodeId,
    pub dim: usize,
    /// Weight on this member's measurement covariance block
    pub weight: f64,
}

#[derive(Clone, Debug)]
pub struct Constraint {
    kind: ConstraintKind,
    node: NodeId,

    /// Tie-break inside one kind; the head of the tree is 0, each generation
    /// below it one less, so ascending order visits daughters first.
    depth: i32,

    dim: usize,
    max_iterations: usize,

    /// Stop re-linearising once consecutive iteration chi2 values differ by less
    chi2_tolerance: f64,

    /// Weight on the measurement covariance handed to the Kalman update
    weight: f64,

    /// Diagnostics of the last successful filter
    chi2: f64,
    ndf: usize,

    components: Vec<MergedComponent>,
}

impl Constraint {
    pub fn new(node: NodeId, kind: ConstraintKind, depth: i32, dim: usize) -> Self {
        Self {
            kind,
            node,
            depth,
            dim,
            max_iterations: 1,
            chi2_tolerance: DEFAULT_CHI2_TOLERANCE,
            weight: 1.0,
            chi2: 0.0,
            ndf: 0,
            components: Vec::new(),
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    pub fn with_tolerance(mut self, chi2_tolerance: f64) -> Self {
        self.chi2_tolerance = chi2_tolerance;
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    /// Fold several constraints into one filtered as a single update.
    ///
    /// The merged constraint is attached to the node of its last member
    /// (the shallowest one when members come from a daughters-first list),
    /// iterates as often as its hungriest member and uses the tightest
    /// tolerance. Each member keeps its weight on its own covariance block.
    pub fn merged(members: &[Constraint]) -> FitResult<Self> {
        let last = members.last().ok_or_else(|| {
            FitError::BadSetup("cannot merge an empty constraint list".to_string())
        })?;
        let mut components = Vec::new();
        for member in members {
            if member.kind == ConstraintKind::Merged {
                components.extend(member.components.iter().copied());
            } else {
                components.push(MergedComponent {
                    kind: member.kind,
                    node: member.node,
                    dim: member.dim,
                    weight: member.weight,
                });
            }
        }
        let dim = components.iter().map(|c| c.dim).sum();
        let max_iterations = members.iter().map(|c| c.max_iterations).max().unwrap_or(1);
        let chi2_tolerance = members
            .iter()
            .map(|c| c.chi2_tolerance)
            .fold(f64::INFINITY, f64::min);
        let depth = members.iter().map(|c| c.depth).max().unwrap_or(0);

        Ok(Self {
            components,
            ..Constraint::new(last.node, ConstraintKind::Merged, depth, dim)
                .with_max_iterations(max_iterations)
                .with_tolerance(chi2_tolerance)
        })
    }

    pub fn kind(&self) -> ConstraintKind {
        self.kind
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn depth(&self) -> i32 {
        self.depth
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    pub fn chi2_tolerance(&self) -> f64 {
        self.chi2_tolerance
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn is_linear(&self) -> bool {
        self.max_iterations <= 1
    }

    pub fn chi2(&self) -> f64 {
        self.chi2
    }

    pub fn ndf(&self) -> usize {
        self.ndf
    }

    pub fn components(&self) -> &[MergedComponent] {
        &self.components
    }

    /// Sequencer key; combined with a stable sort, construction order breaks ties.
    pub fn sort_key(&self) -> (ConstraintKind, i32) {
        (self.kind, self.depth)
    }

    /// Residual bundle against the current state. Never mutates `params`.
    pub fn project<P: ConstraintProjector + ?Sized>(
        &self,
        projector: &P,
        params: &FitParams,
    ) -> FitResult<Projection> {
        let mut projection = Projection::new(params.dim(), self.dim);

        if self.kind == ConstraintKind::Merged {
            let mut offset = 0;
            for component in &self.components {
                let mut sub = Projection::new(params.dim(), component.dim);
                projector.project(component.kind, component.node, params, &mut sub)?;
                if sub.dim() != component.dim {
                    return Err(FitError::DimensionMismatch(format!(
                        "{} projection on node {} has {} rows, expected {}",
                        component.kind,
                        component.node,
                        sub.dim(),
                        component.dim
                    )));
                }
                projection
                    .residual
                    .rows_mut(offset, component.dim)
                    .copy_from(&sub.residual);
                projection.h.rows_mut(offset, component.dim).copy_from(&sub.h);
                if let Some(mut v) = sub.v.take() {
                    // the merged projection carries unit weight, members keep theirs
                    let weight = sub.weight * component.weight;
                    if weight != 1.0 {
                        for i in 0..v.dim() {
                            for j in 0..=i {
                                v.set(i, j, v.get(i, j) * weight);
                            }
                        }
                    }
                    projection.set_v_block(offset, &v);
                }
                offset += component.dim;
            }
        } else {
            projector.project(self.kind, self.node, params, &mut projection)?;
        }

        if projection.dim() != self.dim {
            return Err(FitError::DimensionMismatch(format!(
                "{} projection on node {} has {} rows, expected {}",
                self.kind,
                self.node,
                projection.dim(),
                self.dim
            )));
        }
        projection.weight *= self.weight;
        Ok(projection)
    }

    /// Apply this constraint to the state.
    ///
    /// Linear constraints take one Kalman update. Non-linear ones run an
    /// iterated update: each pass re-linearises at the latest iterate, the
    /// state is recomputed relative to the prior state, and the covariance is
    /// updated once at the end. The recorded chi2 is that of the final
    /// iteration. A failing iteration leaves the state of the
    /// previous iterations in place and the covariance untouched.
    pub fn filter<P: ConstraintProjector + ?Sized>(
        &mut self,
        projector: &P,
        params: &mut FitParams,
    ) -> FitResult<()> {
        let mut kalman = KalmanCalculator::new();

        if self.is_linear() {
            let projection = self.project(projector, params)?;
            kalman.calculate_gain_matrix(&projection, params)?;
            kalman.update_state(params);
            kalman.update_covariance(params);
            self.record(params, kalman.chi2());
            trace!(
                "{} on node {}: chi2 {:.4} (linear)",
                self.kind,
                self.node,
                self.chi2
            );
            return Ok(());
        }

        let prior = params.state().clone();
        let mut previous: Option<f64> = None;
        let mut iterations = 0;
        for _ in 0..self.max_iterations {
            let projection = self.project(projector, params)?;
            kalman.calculate_gain_matrix(&projection, params)?;
            kalman.update_state_with_reference(params, &prior)?;
            iterations += 1;

            let chi2 = kalman.chi2();
            if let Some(prev) = previous {
                if (chi2 - prev).abs() < self.chi2_tolerance {
                    break;
                }
            }
            previous = Some(chi2);
        }
        kalman.update_covariance(params);
        // every iteration is measured against the prior state, so the last
        // chi2 is the full contribution of this constraint
        self.record(params, kalman.chi2());
        trace!(
            "{} on node {}: chi2 {:.4} after {} iterations",
            self.kind,
            self.node,
            self.chi2,
            iterations
        );
        Ok(())
    }

    fn record(&mut self, params: &mut FitParams, chi2: f64) {
        self.chi2 = chi2;
        self.ndf = self.dim;
        params.add_chi2(chi2, self.dim);
    }
}
