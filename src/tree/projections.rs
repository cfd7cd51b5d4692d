//! Residuals and Jacobians of every constraint kind against the tree state.
//!
//! Residuals are predicted-minus-measured (`h(x) − m`). Exact constraints
//! leave `V` unset.

use nalgebra::DMatrix;

use super::{vec3_at, DecayTree, NodeId, ParticleKind, ParticleNode};
use crate::constraint::{ConstraintKind, ConstraintProjector};
use crate::error::{FitError, FitResult};
use crate::fit_params::FitParams;
use crate::projection::Projection;
use crate::types::{Mat3, SymMatrix, TrackMeasurement, Vec3};

impl ConstraintProjector for DecayTree {
    fn project(
        &self,
        kind: ConstraintKind,
        node: NodeId,
        params: &FitParams,
        projection: &mut Projection,
    ) -> FitResult<()> {
        let particle = self.node(node);
        match (kind, &particle.kind) {
            (ConstraintKind::BeamSpot, ParticleKind::Origin(beam)) => {
                let pos = index(particle.pos_index, node, "vertex")?;
                let x = params.state();
                for k in 0..3 {
                    projection.residual[k] = x[pos + k] - beam.position[k];
                    projection.h[(k, pos + k)] = 1.0;
                }
                projection.set_v_block(0, &SymMatrix::from_rows(&beam.position_covariance));
                Ok(())
            }
            (ConstraintKind::BeamEnergy, ParticleKind::Origin(beam)) => {
                let measured = beam
                    .momentum
                    .ok_or_else(|| FitError::BadSetup("beam has no four-momentum".to_string()))?;
                let mom = self.energy_momentum_index(self.candidate())?;
                let x = params.state();
                for k in 0..4 {
                    projection.residual[k] = x[mom + k] - measured[k];
                    projection.h[(k, mom + k)] = 1.0;
                }
                if let Some(cov) = &beam.momentum_covariance {
                    projection.set_v_block(0, &SymMatrix::from_rows(cov));
                }
                Ok(())
            }
            (ConstraintKind::Lifetime, _) => {
                let flight = index(particle.flight_index, node, "flight length")?;
                projection.residual[0] = params.state()[flight] - particle.decay_length;
                projection.h[(0, flight)] = 1.0;
                projection.set_v(0, 0, particle.decay_length * particle.decay_length);
                Ok(())
            }
            (ConstraintKind::Resonance, ParticleKind::Resonance(Some(meas))) => {
                let mom = index(particle.mom_index, node, "momentum")?;
                let x = params.state();
                for k in 0..4 {
                    projection.residual[k] = x[mom + k] - meas.momentum[k];
                    projection.h[(k, mom + k)] = 1.0;
                }
                projection.set_v_block(0, &SymMatrix::from_rows(&meas.covariance));
                Ok(())
            }
            (ConstraintKind::Composite, ParticleKind::Composite(meas)) => {
                let pos = index(particle.pos_index, node, "vertex")?;
                let mom = index(particle.mom_index, node, "momentum")?;
                let x = params.state();
                for k in 0..3 {
                    projection.residual[k] = x[pos + k] - meas.vertex[k];
                    projection.h[(k, pos + k)] = 1.0;
                }
                for k in 0..4 {
                    projection.residual[3 + k] = x[mom + k] - meas.momentum[k];
                    projection.h[(3 + k, mom + k)] = 1.0;
                }
                projection.set_v_block(0, &SymMatrix::from_rows(&meas.covariance));
                Ok(())
            }
            (ConstraintKind::Track, ParticleKind::Track(track)) => {
                self.project_track(node, track, params, projection)
            }
            (ConstraintKind::Photon, ParticleKind::Photon(_)) => {
                self.project_photon(node, params, projection)
            }
            (ConstraintKind::Conversion, _) => self.project_conversion(node, params, projection),
            (ConstraintKind::Kinematic, _) => self.project_kinematic(node, params, projection),
            (ConstraintKind::Geometric, _) => self.project_geometric(node, params, projection),
            (ConstraintKind::MassEnergy, _) => {
                let mom = self.energy_momentum_index(node)?;
                let x = params.state();
                let p = vec3_at(params, mom);
                let expected = (p.norm_squared() + particle.mass * particle.mass).sqrt();
                if expected <= 0.0 {
                    return Err(FitError::Projection(format!(
                        "massless particle at rest on node {}",
                        node
                    )));
                }
                projection.residual[0] = x[mom + 3] - expected;
                for k in 0..3 {
                    projection.h[(0, mom + k)] = -p[k] / expected;
                }
                projection.h[(0, mom + 3)] = 1.0;
                Ok(())
            }
            (ConstraintKind::Mass, _) => {
                let mom = self.energy_momentum_index(node)?;
                let x = params.state();
                let p = vec3_at(params, mom);
                let energy = x[mom + 3];
                let mass2 = particle.mass * particle.mass;
                projection.residual[0] = energy * energy - p.norm_squared() - mass2;
                for k in 0..3 {
                    projection.h[(0, mom + k)] = -2.0 * p[k];
                }
                projection.h[(0, mom + 3)] = 2.0 * energy;
                Ok(())
            }
            (ConstraintKind::Merged, _) => Err(FitError::BadSetup(
                "merged constraints are projected through their components".to_string(),
            )),
            (kind, other) => Err(FitError::BadSetup(format!(
                "{} constraint does not apply to {} node {}",
                kind,
                other.label(),
                node
            ))),
        }
    }
}

impl DecayTree {
    fn energy_momentum_index(&self, id: NodeId) -> FitResult<usize> {
        let node = self.node(id);
        if !node.has_energy() {
            return Err(FitError::BadSetup(format!(
                "node {} ('{}') has no fitted energy",
                id, node.name
            )));
        }
        index(node.mom_index, id, "momentum")
    }

    /// Straight line through the production vertex with the fitted momentum,
    /// compared with the measured line. The vertex offset is expressed in
    /// two directions perpendicular to the measured momentum, so the residual
    /// is (u, w, px, py, pz).
    fn project_track(
        &self,
        id: NodeId,
        track: &TrackMeasurement,
        params: &FitParams,
        projection: &mut Projection,
    ) -> FitResult<()> {
        let pv = index(self.production_vertex(id), id, "production vertex")?;
        let mom = index(self.node(id).mom_index, id, "momentum")?;

        let measured_p = Vec3::from(track.momentum);
        let (u, w) = perpendicular_basis(&measured_p)
            .ok_or_else(|| {
                FitError::Projection(format!("track on node {} has zero momentum", id))
            })?;
        let offset = vec3_at(params, pv) - Vec3::from(track.reference_point);
        let p = vec3_at(params, mom);

        projection.residual[0] = u.dot(&offset);
        projection.residual[1] = w.dot(&offset);
        for k in 0..3 {
            projection.residual[2 + k] = p[k] - measured_p[k];
            projection.h[(0, pv + k)] = u[k];
            projection.h[(1, pv + k)] = w[k];
            projection.h[(2 + k, mom + k)] = 1.0;
        }

        // V = J Σ Jᵗ with J the derivative of the residual w.r.t. the measured
        // (reference point, momentum)
        let mut j = DMatrix::<f64>::zeros(5, 6);
        for k in 0..3 {
            j[(0, k)] = -u[k];
            j[(1, k)] = -w[k];
            j[(2 + k, 3 + k)] = -1.0;
        }
        let sigma = SymMatrix::from_rows(&track.covariance).to_dense();
        let v = &j * sigma * j.transpose();
        projection.set_v_block(0, &SymMatrix::from_lower(&v));
        Ok(())
    }

    /// Fitted momentum against the energy times the direction from the
    /// production vertex to the cluster: r = p − E·n.
    fn project_photon(
        &self,
        id: NodeId,
        params: &FitParams,
        projection: &mut Projection,
    ) -> FitResult<()> {
        let node = self.node(id);
        let ParticleKind::Photon(photon) = &node.kind else {
            return Err(FitError::BadSetup(format!("node {} is not a photon", id)));
        };
        let pv = index(self.production_vertex(id), id, "production vertex")?;
        let mom = index(node.mom_index, id, "momentum")?;

        let delta = Vec3::from(photon.position) - vec3_at(params, pv);
        let length = delta.norm();
        if length <= 0.0 {
            return Err(FitError::Projection(format!(
                "photon cluster on node {} coincides with its production vertex",
                id
            )));
        }
        let n = delta / length;
        let energy = photon.energy;
        let p = vec3_at(params, mom);
        let transverse = Mat3::identity() - n * n.transpose();
        let dr_dx = transverse * (energy / length);

        for k in 0..3 {
            projection.residual[k] = p[k] - energy * n[k];
            projection.h[(k, mom + k)] = 1.0;
            for l in 0..3 {
                projection.h[(k, pv + l)] = dr_dx[(k, l)];
            }
        }

        // measured (cluster position, energy)
        let mut j = DMatrix::<f64>::zeros(3, 4);
        for k in 0..3 {
            for l in 0..3 {
                j[(k, l)] = -dr_dx[(k, l)];
            }
            j[(k, 3)] = -n[k];
        }
        let sigma = SymMatrix::from_rows(&photon.covariance).to_dense();
        let v = &j * sigma * j.transpose();
        projection.set_v_block(0, &SymMatrix::from_lower(&v));
        Ok(())
    }

    /// Two daughters leaving the vertex collinear: differences of their
    /// azimuthal and polar angles.
    fn project_conversion(
        &self,
        id: NodeId,
        params: &FitParams,
        projection: &mut Projection,
    ) -> FitResult<()> {
        let daughters = &self.node(id).daughters;
        let [a, b] = daughters.as_slice() else {
            return Err(FitError::BadSetup(format!(
                "conversion on node {} needs two daughters, found {}",
                id,
                daughters.len()
            )));
        };
        let ia = index(self.node(*a).mom_index, *a, "momentum")?;
        let ib = index(self.node(*b).mom_index, *b, "momentum")?;
        let (phi_a, theta_a, grad_phi_a, grad_theta_a) = angles(&vec3_at(params, ia), id)?;
        let (phi_b, theta_b, grad_phi_b, grad_theta_b) = angles(&vec3_at(params, ib), id)?;

        projection.residual[0] = wrap_angle(phi_a - phi_b);
        projection.residual[1] = theta_a - theta_b;
        for k in 0..3 {
            projection.h[(0, ia + k)] = grad_phi_a[k];
            projection.h[(0, ib + k)] = -grad_phi_b[k];
            projection.h[(1, ia + k)] = grad_theta_a[k];
            projection.h[(1, ib + k)] = -grad_theta_b[k];
        }
        Ok(())
    }

    /// Four-momentum conservation: mother minus the sum of its daughters.
    fn project_kinematic(
        &self,
        id: NodeId,
        params: &FitParams,
        projection: &mut Projection,
    ) -> FitResult<()> {
        let mom = self.energy_momentum_index(id)?;
        let x = params.state();
        for k in 0..4 {
            projection.residual[k] = x[mom + k];
            projection.h[(k, mom + k)] = 1.0;
        }

        for &d in &self.node(id).daughters {
            let daughter = self.node(d);
            let dm = index(daughter.mom_index, d, "momentum")?;
            if daughter.has_energy() {
                for k in 0..4 {
                    projection.residual[k] -= x[dm + k];
                    projection.h[(k, dm + k)] -= 1.0;
                }
            } else {
                let p = vec3_at(params, dm);
                let energy = final_state_energy(daughter, &p);
                for k in 0..3 {
                    projection.residual[k] -= p[k];
                    projection.h[(k, dm + k)] -= 1.0;
                    if energy > 0.0 {
                        projection.h[(3, dm + k)] -= p[k] / energy;
                    }
                }
                projection.residual[3] -= energy;
            }
        }
        Ok(())
    }

    /// Decay vertex = production vertex + flight length along the momentum.
    fn project_geometric(
        &self,
        id: NodeId,
        params: &FitParams,
        projection: &mut Projection,
    ) -> FitResult<()> {
        let node = self.node(id);
        let pos = index(node.pos_index, id, "vertex")?;
        let flight = index(node.flight_index, id, "flight length")?;
        let mom = index(node.mom_index, id, "momentum")?;
        let pv = index(self.production_vertex(id), id, "production vertex")?;

        let p = vec3_at(params, mom);
        let norm = p.norm();
        if norm <= 0.0 {
            return Err(FitError::Projection(format!(
                "cannot point node {} with zero momentum",
                id
            )));
        }
        let direction = p / norm;
        let length = params.state()[flight];
        let residual = vec3_at(params, pv) + direction * length - vec3_at(params, pos);
        let d_direction = (Mat3::identity() - direction * direction.transpose()) * (length / norm);

        for k in 0..3 {
            projection.residual[k] = residual[k];
            projection.h[(k, pv + k)] += 1.0;
            projection.h[(k, pos + k)] -= 1.0;
            projection.h[(k, flight)] = direction[k];
            for l in 0..3 {
                projection.h[(k, mom + l)] = d_direction[(k, l)];
            }
        }
        Ok(())
    }
}

fn index(slot: Option<usize>, id: NodeId, what: &str) -> FitResult<usize> {
    slot.ok_or_else(|| FitError::BadSetup(format!("node {} has no {}", id, what)))
}

fn final_state_energy(node: &ParticleNode, p: &Vec3) -> f64 {
    (p.norm_squared() + node.mass * node.mass).sqrt()
}

/// Two unit vectors spanning the plane perpendicular to `v`.
fn perpendicular_basis(v: &Vec3) -> Option<(Vec3, Vec3)> {
    let norm = v.norm();
    if norm <= 0.0 {
        return None;
    }
    let d = v / norm;
    // least aligned coordinate axis
    let axis = if d.x.abs() <= d.y.abs() && d.x.abs() <= d.z.abs() {
        Vec3::x()
    } else if d.y.abs() <= d.z.abs() {
        Vec3::y()
    } else {
        Vec3::z()
    };
    let u = d.cross(&axis).normalize();
    let w = d.cross(&u);
    Some((u, w))
}

/// Azimuth, polar angle and their gradients with respect to p.
fn angles(p: &Vec3, id: NodeId) -> FitResult<(f64, f64, Vec3, Vec3)> {
    let pt2 = p.x * p.x + p.y * p.y;
    let p2 = pt2 + p.z * p.z;
    if pt2 <= 0.0 {
        return Err(FitError::Projection(format!(
            "conversion daughter of node {} has no transverse momentum",
            id
        )));
    }
    let pt = pt2.sqrt();
    let phi = p.y.atan2(p.x);
    let theta = pt.atan2(p.z);
    let grad_phi = Vec3::new(-p.y / pt2, p.x / pt2, 0.0);
    let grad_theta = Vec3::new(p.x * p.z / (p2 * pt), p.y * p.z / (p2 * pt), -pt / p2);
    Ok((phi, theta, grad_phi, grad_theta))
}

fn wrap_angle(angle: f64) -> f64 {
    use std::f64::consts::PI;
    let mut a = angle;
    while a > PI {
        a -= 2.0 * PI;
    }
    while a < -PI {
        a += 2.0 * PI;
    }
    a
}
