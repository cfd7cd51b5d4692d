//! Outer convergence loop: repeated sequencer passes over one decay tree.

use log::{debug, info, warn};
use serde::Serialize;

use crate::config::FitConfig;
use crate::constraint::ConstraintKind;
use crate::error::{FitError, FitResult};
use crate::fit_params::FitParams;
use crate::sequencer::{FitSequencer, PassSummary};
use crate::tree::{DecayTree, NodeId};

// ─── Fit output ──────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize)]
pub struct FittedParticle {
    pub node: NodeId,
    pub name: String,
    pub kind: &'static str,
    pub vertex: Option<[f64; 3]>,
    pub vertex_error: Option<[f64; 3]>,
    pub momentum: Option<[f64; 4]>,
    /// Errors of the fitted momentum parameters (3 or 4 entries)
    pub momentum_error: Vec<f64>,
    pub flight_length: Option<f64>,
    pub flight_length_error: Option<f64>,
    pub mass: Option<f64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ConstraintReport {
    pub kind: ConstraintKind,
    pub node: NodeId,
    pub dim: usize,
    pub chi2: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct FitSummary {
    pub converged: bool,
    pub passes: usize,
    pub chi2: f64,
    pub constraint_dims: usize,
    pub ndf: i64,
    pub particles: Vec<FittedParticle>,
    pub constraints: Vec<ConstraintReport>,
}

// ─── Fitter ──────────────────────────────────────────────────────────────────

pub struct Fitter {
    tree: DecayTree,
    config: FitConfig,
    sequencer: FitSequencer,
    params: FitParams,
    prior: Vec<f64>,
    passes: usize,
    converged: bool,
}

impl Fitter {
    /// Lay out the constraints and seed the state; no filtering yet.
    pub fn new(tree: DecayTree, config: FitConfig) -> FitResult<Self> {
        let sequencer = FitSequencer::new(tree.constraints(&config)?);
        let prior = tree.prior_covariance(&config);
        let mut params = FitParams::new(tree.dim());
        tree.initialize(&mut params)?;
        params.reset_covariance(&prior);
        debug!(
            "fitter ready: {} parameters, {} constraints ({} dims)",
            tree.dim(),
            sequencer.len(),
            sequencer.dims()
        );
        Ok(Self {
            tree,
            config,
            sequencer,
            params,
            prior,
            passes: 0,
            converged: false,
        })
    }

    /// Run passes until the total chi2 settles.
    ///
    /// Each pass starts again from the prior covariance but keeps the state
    /// of the previous pass, so non-linear constraints are re-linearised
    /// around an ever better estimate. On error the state of the last pass
    /// stays available through `params()` and `get_summary()`.
    pub fn fit(&mut self) -> FitResult<FitSummary> {
        self.passes = 0;
        self.converged = false;
        let mut previous: Option<f64> = None;
        let mut increases = 0;

        while self.passes < self.config.max_passes {
            let pass = self.run_pass()?;
            self.passes += 1;
            debug!(
                "pass {}: chi2 {:.6} over {} dims",
                self.passes, pass.chi2, pass.ndf
            );

            if let Some(prev) = previous {
                let delta = pass.chi2 - prev;
                if delta.abs() < self.config.chi2_convergence {
                    self.converged = true;
                    break;
                }
                if delta > 0.0 {
                    let jumped = pass.chi2 > self.config.fast_divergence_factor * prev;
                    if prev > self.config.chi2_convergence && jumped {
                        warn!("chi2 jumped from {:.4} to {:.4}", prev, pass.chi2);
                        return Err(FitError::FastDiverging {
                            passes: self.passes,
                            chi2: pass.chi2,
                        });
                    }
                    increases += 1;
                    if increases >= self.config.slow_divergence_limit {
                        warn!("chi2 rose in {} consecutive passes", increases);
                        return Err(FitError::SlowDiverging {
                            passes: self.passes,
                            chi2: pass.chi2,
                        });
                    }
                } else {
                    increases = 0;
                }
            }
            previous = Some(pass.chi2);
        }

        if !self.converged {
            warn!(
                "no convergence after {} passes (chi2 {:.4})",
                self.passes,
                self.params.chi2()
            );
            return Err(FitError::NotConverged {
                passes: self.passes,
                chi2: self.params.chi2(),
            });
        }

        if self.config.force_p4_sum {
            self.tree.force_p4_sum(&mut self.params);
        }
        info!(
            "'{}' converged after {} passes: chi2 {:.4}, ndf {}",
            self.tree.node(self.tree.candidate()).name,
            self.passes,
            self.params.chi2(),
            self.params.ndf()
        );
        Ok(self.get_summary())
    }

    fn run_pass(&mut self) -> FitResult<PassSummary> {
        self.params.reset_covariance(&self.prior);
        self.params.reset_chi2();
        self.sequencer.run_pass(&self.tree, &mut self.params)
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub fn tree(&self) -> &DecayTree {
        &self.tree
    }

    pub fn config(&self) -> &FitConfig {
        &self.config
    }

    pub fn params(&self) -> &FitParams {
        &self.params
    }

    pub fn sequencer(&self) -> &FitSequencer {
        &self.sequencer
    }

    pub fn passes(&self) -> usize {
        self.passes
    }

    pub fn is_converged(&self) -> bool {
        self.converged
    }

    pub fn particle(&self, id: NodeId) -> FittedParticle {
        let tree = &self.tree;
        let params = &self.params;
        let node = tree.node(id);
        let errors = |start: usize, len: usize| -> Vec<f64> {
            (start..start + len).map(|i| params.error(i)).collect()
        };

        FittedParticle {
            node: id,
            name: node.name.clone(),
            kind: node.kind.label(),
            vertex: tree.vertex(id, params).map(|v| [v.x, v.y, v.z]),
            vertex_error: tree.vertex_index(id).map(|i| {
                let e = errors(i, 3);
                [e[0], e[1], e[2]]
            }),
            momentum: tree.momentum(id, params).map(|p| [p[0], p[1], p[2], p[3]]),
            momentum_error: node
                .mom_index
                .map(|i| errors(i, node.momentum_dim()))
                .unwrap_or_default(),
            flight_length: tree.flight_length(id, params),
            flight_length_error: node.flight_index.map(|i| params.error(i)),
            mass: tree.invariant_mass(id, params),
        }
    }

    pub fn get_summary(&self) -> FitSummary {
        FitSummary {
            converged: self.converged,
            passes: self.passes,
            chi2: self.params.chi2(),
            constraint_dims: self.params.constraint_dims(),
            ndf: self.params.ndf(),
            particles: self.tree.node_ids().map(|id| self.particle(id)).collect(),
            constraints: self
                .sequencer
                .constraints()
                .iter()
                .map(|c| ConstraintReport {
                    kind: c.kind(),
                    node: c.node(),
                    dim: c.dim(),
                    chi2: c.chi2(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::test_trees::*;
    use crate::tree::TreeSpec;
    use approx::assert_abs_diff_eq;

    fn fit_d0(mass: Option<f64>, config: FitConfig) -> Fitter {
        let mut fitter = Fitter::new(d0_tree(mass), config).unwrap();
        fitter.fit().unwrap();
        fitter
    }

    #[test]
    fn test_two_track_vertex() {
        let fitter = fit_d0(None, FitConfig::default());
        let summary = fitter.get_summary();

        assert!(summary.converged);
        assert!(summary.passes >= 2);
        assert!(summary.chi2 >= 0.0);
        assert_abs_diff_eq!(summary.chi2, 0.0, epsilon = 1e-6);
        // beam spot 3 + tracks 2·5 + kinematic 4 + geometric 3 − 17 parameters
        assert_eq!(summary.constraint_dims, 20);
        assert_eq!(summary.ndf, 3);

        let d0 = fitter.tree().find("D0").unwrap();
        let vertex = fitter.tree().vertex(d0, fitter.params()).unwrap();
        for k in 0..3 {
            assert_abs_diff_eq!(vertex[k], D0_VERTEX[k], epsilon = 1e-6);
        }
        assert!(fitter.params().covariance().all_finite());

        let particle = summary.particles.iter().find(|p| p.name == "D0").unwrap();
        let err = particle.vertex_error.unwrap();
        assert!(err.iter().all(|e| *e > 0.0 && *e < 0.1));
        assert!(particle.flight_length.unwrap() > 0.0);
    }

    #[test]
    fn test_mass_constrained_vertex() {
        let mut config = FitConfig::default();
        config.policies.insert(
            ConstraintKind::Mass,
            crate::config::ConstraintPolicy {
                max_iterations: 20,
                chi2_tolerance: 1e-10,
                weight: 1.0,
            },
        );
        // unconstrained invariant mass of the two pions is about 0.681
        let fitter = fit_d0(Some(0.7), config);
        let d0 = fitter.tree().find("D0").unwrap();

        let mass = fitter.tree().invariant_mass(d0, fitter.params()).unwrap();
        assert_abs_diff_eq!(mass, 0.7, epsilon = 1e-4);
        assert!(fitter.params().chi2() > 0.0);
        assert_eq!(fitter.get_summary().ndf, 4);

        // tracks were pulled to fit the mass
        let pip = fitter.tree().find("pi+").unwrap();
        let p = fitter.tree().momentum(pip, fitter.params()).unwrap();
        assert!((p[0] - 1.0).abs() > 1e-5);
    }

    #[test]
    fn test_mass_fit_chi2_independent_of_iteration_budget() {
        let fit_with = |max_iterations: usize| {
            let mut config = FitConfig::default();
            config.policies.insert(
                ConstraintKind::Mass,
                crate::config::ConstraintPolicy {
                    max_iterations,
                    chi2_tolerance: 0.0,
                    weight: 1.0,
                },
            );
            fit_d0(Some(0.7), config)
        };

        let short = fit_with(6);
        let long = fit_with(20);
        assert!(short.is_converged() && long.is_converged());
        assert_abs_diff_eq!(short.params().chi2(), long.params().chi2(), epsilon = 1e-6);

        let mass_chi2 = |fitter: &Fitter| {
            fitter
                .sequencer()
                .constraints()
                .iter()
                .find(|c| c.kind() == ConstraintKind::Mass)
                .map(|c| c.chi2())
                .unwrap()
        };
        assert_abs_diff_eq!(mass_chi2(&short), mass_chi2(&long), epsilon = 1e-6);
    }

    #[test]
    fn test_merged_fit_recovers_vertex() {
        let config = FitConfig {
            merge_constraints: true,
            ..FitConfig::default()
        };
        let fitter = fit_d0(None, config);
        assert!(fitter
            .sequencer()
            .constraints()
            .iter()
            .any(|c| c.kind() == ConstraintKind::Merged));

        let d0 = fitter.tree().find("D0").unwrap();
        let vertex = fitter.tree().vertex(d0, fitter.params()).unwrap();
        for k in 0..3 {
            assert_abs_diff_eq!(vertex[k], D0_VERTEX[k], epsilon = 1e-6);
        }
        assert_eq!(fitter.get_summary().ndf, 3);
    }

    #[test]
    fn test_force_p4_sum_after_fit() {
        let config = FitConfig {
            force_p4_sum: true,
            ..FitConfig::default()
        };
        let fitter = fit_d0(Some(0.7), config);
        let tree = fitter.tree();
        let d0 = tree.find("D0").unwrap();
        let sum = tree.node(d0).daughters.iter().fold(nalgebra::Vector4::zeros(), |acc, &d| {
            acc + tree.momentum(d, fitter.params()).unwrap()
        });
        let p4 = tree.momentum(d0, fitter.params()).unwrap();
        for k in 0..4 {
            assert_abs_diff_eq!(p4[k], sum[k], epsilon = 1e-12);
        }
    }

    #[test]
    fn test_pass_budget_exhausted() {
        let config = FitConfig {
            max_passes: 1,
            ..FitConfig::default()
        };
        let mut fitter = Fitter::new(d0_tree(None), config).unwrap();
        let err = fitter.fit().unwrap_err();
        assert!(matches!(err, FitError::NotConverged { passes: 1, .. }));
        assert!(!fitter.get_summary().converged);
    }

    #[test]
    fn test_failing_constraint_aborts_fit() {
        let mut spec: TreeSpec = serde_json::from_value(d0_spec(None)).unwrap();
        // a track with no momentum cannot be expressed in a perpendicular basis
        let pim = &mut spec.head.daughters[1];
        if let crate::tree::CandidateMeasurement::Track(track) = &mut pim.measurement {
            track.momentum = [0.0, 0.0, 0.0];
        }
        let tree = DecayTree::from_spec(&spec).unwrap();
        let mut fitter = Fitter::new(tree, FitConfig::default()).unwrap();

        let err = fitter.fit().unwrap_err();
        let (kind, node) = err.failed_constraint().unwrap();
        assert_eq!(kind, ConstraintKind::Track);
        assert_eq!(fitter.tree().node(node).name, "pi-");
        assert!(matches!(err.root_cause(), FitError::Projection(_)));
    }

    #[test]
    fn test_summary_serializes() {
        let fitter = fit_d0(None, FitConfig::default());
        let json = serde_json::to_value(fitter.get_summary()).unwrap();
        assert_eq!(json["converged"], true);
        assert_eq!(json["constraints"][0]["kind"], "beam_spot");
        assert_eq!(json["particles"].as_array().unwrap().len(), 4);
    }
}
