//! Decay-tree arena: particle nodes, parameter layout, constraint list and
//! initial state.
//!
//! Nodes live in one `Vec` and refer to each other by `NodeId`. Every node
//! owns a contiguous slice of the global state: its decay vertex (3), the
//! flight length from its production vertex (1) and its momentum (4, or 3
//! for final-state particles with a fixed mass). Daughters are laid out
//! before their mother.

pub mod builder;
pub mod projections;

use std::fmt;

use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::config::FitConfig;
use crate::constraint::{Constraint, ConstraintKind};
use crate::error::{FitError, FitResult};
use crate::fit_params::FitParams;
use crate::types::{
    BeamSpec, CompositeMeasurement, PhotonMeasurement, ResonanceMeasurement, TrackMeasurement,
    Vec3, Vec4, FLIGHT_DIM, MEASURE_DIM_COMPOSITE, MEASURE_DIM_CONVERSION, MEASURE_DIM_PHOTON,
    MEASURE_DIM_TRACK, MOMENTUM3_DIM, MOMENTUM4_DIM, POSITION_DIM,
};

pub use builder::{CandidateMeasurement, CandidateSpec, TreeSpec};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug)]
pub enum ParticleKind {
    /// Beam spot the head candidate is produced at
    Origin(BeamSpec),
    /// Unmeasured decaying particle, known only through its daughters
    Internal,
    Composite(CompositeMeasurement),
    /// Decays at its production vertex
    Resonance(Option<ResonanceMeasurement>),
    Track(TrackMeasurement),
    Photon(PhotonMeasurement),
}

impl ParticleKind {
    pub fn label(&self) -> &'static str {
        match self {
            ParticleKind::Origin(_) => "origin",
            ParticleKind::Internal => "internal",
            ParticleKind::Composite(_) => "composite",
            ParticleKind::Resonance(_) => "resonance",
            ParticleKind::Track(_) => "track",
            ParticleKind::Photon(_) => "photon",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ParticleNode {
    pub name: String,
    pub kind: ParticleKind,
    pub mother: Option<NodeId>,
    pub daughters: Vec<NodeId>,

    /// Nominal mass, used by mass constraints and for final-state energies
    pub mass: f64,
    /// Nominal cτ, used by the lifetime constraint
    pub decay_length: f64,

    pub mass_constraint: bool,
    pub mass_energy_constraint: bool,
    pub lifetime_constraint: bool,
    pub conversion: bool,

    // ── State layout, filled by `DecayTree::assign_indices` ──
    pub pos_index: Option<usize>,
    pub flight_index: Option<usize>,
    pub mom_index: Option<usize>,
}

impl ParticleNode {
    pub(crate) fn new(name: String, kind: ParticleKind, mother: Option<NodeId>) -> Self {
        Self {
            name,
            kind,
            mother,
            daughters: Vec::new(),
            mass: 0.0,
            decay_length: 0.0,
            mass_constraint: false,
            mass_energy_constraint: false,
            lifetime_constraint: false,
            conversion: false,
            pos_index: None,
            flight_index: None,
            mom_index: None,
        }
    }

    /// Owns a decay vertex of its own.
    pub fn has_position(&self) -> bool {
        matches!(
            self.kind,
            ParticleKind::Origin(_) | ParticleKind::Internal | ParticleKind::Composite(_)
        )
    }

    /// Momentum parameters include the energy.
    pub fn has_energy(&self) -> bool {
        matches!(
            self.kind,
            ParticleKind::Internal | ParticleKind::Composite(_) | ParticleKind::Resonance(_)
        )
    }

    pub fn momentum_dim(&self) -> usize {
        match self.kind {
            ParticleKind::Origin(_) => 0,
            ParticleKind::Track(_) | ParticleKind::Photon(_) => MOMENTUM3_DIM,
            _ => MOMENTUM4_DIM,
        }
    }

    pub fn is_final_state(&self) -> bool {
        matches!(self.kind, ParticleKind::Track(_) | ParticleKind::Photon(_))
    }
}

#[derive(Clone, Debug)]
pub struct DecayTree {
    nodes: Vec<ParticleNode>,
    /// Top of the arena: the origin when a beam is given, else the candidate
    root: NodeId,
    /// Head decay candidate
    candidate: NodeId,
    dim: usize,
}

impl DecayTree {
    pub(crate) fn from_nodes(
        nodes: Vec<ParticleNode>,
        root: NodeId,
        candidate: NodeId,
    ) -> FitResult<Self> {
        let mut tree = Self {
            nodes,
            root,
            candidate,
            dim: 0,
        };
        tree.validate()?;
        tree.assign_indices();
        debug!(
            "decay tree '{}': {} nodes, {} parameters",
            tree.node(candidate).name,
            tree.nodes.len(),
            tree.dim
        );
        Ok(tree)
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn candidate(&self) -> NodeId {
        self.candidate
    }

    pub fn node(&self, id: NodeId) -> &ParticleNode {
        &self.nodes[id.0]
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len()).map(NodeId)
    }

    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.nodes.iter().position(|n| n.name == name).map(NodeId)
    }

    /// Vertex at which the daughters of `id` are produced. A resonance hands
    /// out its own production vertex.
    pub fn vertex_index(&self, id: NodeId) -> Option<usize> {
        let node = self.node(id);
        match node.kind {
            ParticleKind::Resonance(_) => self.production_vertex(id),
            _ => node.pos_index,
        }
    }

    /// Vertex at which `id` is produced.
    pub fn production_vertex(&self, id: NodeId) -> Option<usize> {
        self.node(id).mother.and_then(|m| self.vertex_index(m))
    }

    fn has_production_vertex(&self, id: NodeId) -> bool {
        match self.node(id).mother {
            None => false,
            Some(m) => match self.node(m).kind {
                ParticleKind::Resonance(_) => self.has_production_vertex(m),
                _ => self.node(m).has_position(),
            },
        }
    }

    // ─── Validation ──────────────────────────────────────────────────────────

    fn validate(&self) -> FitResult<()> {
        for id in self.node_ids() {
            let node = self.node(id);
            let bad = |msg: &str| {
                Err(FitError::BadSetup(format!(
                    "{} '{}': {}",
                    node.kind.label(),
                    node.name,
                    msg
                )))
            };

            match &node.kind {
                ParticleKind::Origin(_) if node.mother.is_some() => {
                    return bad("only the root may be a beam spot");
                }
                ParticleKind::Internal if node.daughters.is_empty() => {
                    return bad("unmeasured particle without daughters");
                }
                ParticleKind::Resonance(None) if node.daughters.is_empty() => {
                    return bad("unmeasured resonance without daughters");
                }
                ParticleKind::Track(_) | ParticleKind::Photon(_) if !node.daughters.is_empty() => {
                    return bad("final-state particle with daughters");
                }
                _ => {}
            }

            let needs_production = matches!(
                node.kind,
                ParticleKind::Track(_) | ParticleKind::Photon(_) | ParticleKind::Resonance(_)
            );
            if needs_production && !self.has_production_vertex(id) {
                return bad("no production vertex; add a beam spot or a vertexed mother");
            }
            if (node.mass_constraint || node.mass_energy_constraint) && !node.has_energy() {
                return bad("mass constraints need a particle with a fitted energy");
            }
            if node.lifetime_constraint
                && !(node.has_position() && self.has_production_vertex(id))
            {
                return bad("lifetime constraint needs a flight length");
            }
            if node.lifetime_constraint
                && (node.decay_length <= 0.0 || !node.decay_length.is_finite())
            {
                return bad("lifetime constraint needs a positive decay length");
            }
            let final_state_pair = node.daughters.len() == 2
                && node.daughters.iter().all(|&d| self.node(d).is_final_state());
            if node.conversion && !final_state_pair {
                return bad("conversion needs exactly two three-momentum daughters");
            }
            if node.conversion && !node.has_position() {
                return bad("conversion needs a decay vertex");
            }
        }
        Ok(())
    }

    // ─── Layout ──────────────────────────────────────────────────────────────

    fn assign_indices(&mut self) {
        let mut offset = 0;
        self.assign_node(self.root, &mut offset);
        self.dim = offset;
    }

    fn assign_node(&mut self, id: NodeId, offset: &mut usize) {
        let daughters = self.node(id).daughters.clone();
        for d in daughters {
            self.assign_node(d, offset);
        }

        let with_flight = self.node(id).has_position() && self.has_production_vertex(id);
        let node = &mut self.nodes[id.0];
        if node.has_position() {
            node.pos_index = Some(*offset);
            *offset += POSITION_DIM;
        }
        if with_flight {
            node.flight_index = Some(*offset);
            *offset += FLIGHT_DIM;
        }
        let mom_dim = node.momentum_dim();
        if mom_dim > 0 {
            node.mom_index = Some(*offset);
            *offset += mom_dim;
        }
        trace!(
            "layout {} '{}': pos {:?} flight {:?} mom {:?}",
            id,
            node.name,
            node.pos_index,
            node.flight_index,
            node.mom_index
        );
    }

    /// Diagonal prior covariance matching the layout.
    pub fn prior_covariance(&self, config: &FitConfig) -> Vec<f64> {
        let mut diag = vec![0.0; self.dim];
        for node in &self.nodes {
            if let Some(i) = node.pos_index {
                diag[i..i + POSITION_DIM].fill(config.initial_position_variance);
            }
            if let Some(i) = node.flight_index {
                diag[i] = config.initial_flight_variance;
            }
            if let Some(i) = node.mom_index {
                diag[i..i + node.momentum_dim()].fill(config.initial_momentum_variance);
            }
        }
        diag
    }

    // ─── Constraint list ─────────────────────────────────────────────────────

    /// Constraints of the whole tree, daughters before mothers. With
    /// `merge_constraints` every kind from `Kinematic` on is folded into one
    /// merged constraint.
    pub fn constraints(&self, config: &FitConfig) -> FitResult<Vec<Constraint>> {
        let mut list = Vec::new();
        self.collect_constraints(self.root, 0, config, &mut list);

        if !config.merge_constraints {
            return Ok(list);
        }
        let (mut kept, mergeable): (Vec<_>, Vec<_>) =
            list.into_iter().partition(|c| c.kind() < ConstraintKind::Kinematic);
        if !mergeable.is_empty() {
            kept.push(Constraint::merged(&mergeable)?);
        }
        Ok(kept)
    }

    fn collect_constraints(
        &self,
        id: NodeId,
        depth: i32,
        config: &FitConfig,
        list: &mut Vec<Constraint>,
    ) {
        let node = self.node(id);
        for &d in &node.daughters {
            self.collect_constraints(d, depth - 1, config, list);
        }

        let add = |list: &mut Vec<Constraint>, kind: ConstraintKind, dim: usize| {
            list.push(config.constraint(id, kind, depth, dim))
        };

        match &node.kind {
            ParticleKind::Origin(beam) => {
                add(list, ConstraintKind::BeamSpot, POSITION_DIM);
                if beam.momentum.is_some() && self.node(self.candidate).has_energy() {
                    add(list, ConstraintKind::BeamEnergy, MOMENTUM4_DIM);
                }
            }
            ParticleKind::Track(_) => add(list, ConstraintKind::Track, MEASURE_DIM_TRACK),
            ParticleKind::Photon(_) => add(list, ConstraintKind::Photon, MEASURE_DIM_PHOTON),
            ParticleKind::Internal | ParticleKind::Composite(_) | ParticleKind::Resonance(_) => {
                match &node.kind {
                    ParticleKind::Composite(_) => {
                        add(list, ConstraintKind::Composite, MEASURE_DIM_COMPOSITE)
                    }
                    ParticleKind::Resonance(Some(_)) => {
                        add(list, ConstraintKind::Resonance, MOMENTUM4_DIM)
                    }
                    _ => {}
                }
                if node.lifetime_constraint && node.flight_index.is_some() {
                    add(list, ConstraintKind::Lifetime, FLIGHT_DIM);
                }
                if !node.daughters.is_empty() {
                    let kinematic =
                        config.constraint(id, ConstraintKind::Kinematic, depth, MOMENTUM4_DIM);
                    // energies of four-momentum daughters enter linearly
                    let linear = node.daughters.iter().all(|&d| self.node(d).has_energy());
                    list.push(if linear { kinematic.with_max_iterations(1) } else { kinematic });
                }
                if node.flight_index.is_some() {
                    add(list, ConstraintKind::Geometric, POSITION_DIM);
                }
                if node.conversion {
                    add(list, ConstraintKind::Conversion, MEASURE_DIM_CONVERSION);
                }
                if node.mass_energy_constraint {
                    add(list, ConstraintKind::MassEnergy, 1);
                }
                if node.mass_constraint {
                    add(list, ConstraintKind::Mass, 1);
                }
            }
        }
    }

    // ─── State accessors ─────────────────────────────────────────────────────

    pub fn vertex(&self, id: NodeId, params: &FitParams) -> Option<Vec3> {
        self.vertex_index(id).map(|i| vec3_at(params, i))
    }

    pub fn flight_length(&self, id: NodeId, params: &FitParams) -> Option<f64> {
        self.node(id).flight_index.map(|i| params.state()[i])
    }

    /// Four-momentum (px, py, pz, E); final-state energies come from the
    /// nominal mass.
    pub fn momentum(&self, id: NodeId, params: &FitParams) -> Option<Vec4> {
        let node = self.node(id);
        let i = node.mom_index?;
        let x = params.state();
        if node.has_energy() {
            Some(Vec4::new(x[i], x[i + 1], x[i + 2], x[i + 3]))
        } else {
            let p = vec3_at(params, i);
            Some(Vec4::new(p.x, p.y, p.z, (p.norm_squared() + node.mass * node.mass).sqrt()))
        }
    }

    pub fn invariant_mass(&self, id: NodeId, params: &FitParams) -> Option<f64> {
        self.momentum(id, params).map(|p4| invariant_mass(&p4))
    }

    // ─── Initialisation ──────────────────────────────────────────────────────

    /// Seed the state: vertices top-down, momenta bottom-up, then flight
    /// lengths from the two.
    pub fn initialize(&self, params: &mut FitParams) -> FitResult<()> {
        if params.dim() != self.dim {
            return Err(FitError::DimensionMismatch(format!(
                "state has {} parameters, tree needs {}",
                params.dim(),
                self.dim
            )));
        }
        params.state_mut().fill(0.0);
        self.init_vertex(self.root, params);
        self.init_momentum(self.root, params);
        for id in self.node_ids() {
            self.init_flight(id, params);
        }
        if !params.state().iter().all(|v| v.is_finite()) {
            return Err(FitError::BadSetup("initial state is not finite".to_string()));
        }
        Ok(())
    }

    fn init_vertex(&self, id: NodeId, params: &mut FitParams) {
        let node = self.node(id);
        if let Some(i) = node.pos_index {
            let vertex = match &node.kind {
                ParticleKind::Origin(beam) => Vec3::from(beam.position),
                ParticleKind::Composite(meas) => Vec3::from(meas.vertex),
                _ => self
                    .seed_vertex_from_tracks(id)
                    .or_else(|| self.production_vertex(id).map(|pv| vec3_at(params, pv)))
                    .unwrap_or_else(Vec3::zeros),
            };
            set_vec3(params, i, &vertex);
        }
        for &d in &node.daughters {
            self.init_vertex(d, params);
        }
    }

    /// Point of closest approach of the two highest-pT tracks produced at the
    /// vertex of `id`.
    fn seed_vertex_from_tracks(&self, id: NodeId) -> Option<Vec3> {
        let mut tracks = Vec::new();
        self.collect_vertex_tracks(id, &mut tracks);
        if tracks.len() < 2 {
            return None;
        }
        tracks.sort_by(|a, b| transverse_momentum(b).total_cmp(&transverse_momentum(a)));
        Some(closest_approach(tracks[0], tracks[1]))
    }

    fn collect_vertex_tracks<'a>(&'a self, id: NodeId, out: &mut Vec<&'a TrackMeasurement>) {
        for &d in &self.node(id).daughters {
            match &self.node(d).kind {
                ParticleKind::Track(track) => out.push(track),
                ParticleKind::Resonance(_) => self.collect_vertex_tracks(d, out),
                _ => {}
            }
        }
    }

    fn init_momentum(&self, id: NodeId, params: &mut FitParams) {
        let node = self.node(id);
        for &d in &node.daughters {
            self.init_momentum(d, params);
        }
        let Some(i) = node.mom_index else {
            return;
        };

        match &node.kind {
            ParticleKind::Track(track) => set_vec3(params, i, &Vec3::from(track.momentum)),
            ParticleKind::Photon(photon) => {
                let origin = self
                    .production_vertex(id)
                    .map(|pv| vec3_at(params, pv))
                    .unwrap_or_else(Vec3::zeros);
                let direction = unit_or_z(&(Vec3::from(photon.position) - origin));
                set_vec3(params, i, &(direction * photon.energy));
            }
            ParticleKind::Composite(meas) => set_vec4(params, i, &Vec4::from(meas.momentum)),
            ParticleKind::Resonance(Some(meas)) if node.daughters.is_empty() => {
                set_vec4(params, i, &Vec4::from(meas.momentum))
            }
            _ => {
                let sum = self.daughter_momentum_sum(id, params);
                set_vec4(params, i, &sum);
            }
        }
    }

    fn init_flight(&self, id: NodeId, params: &mut FitParams) {
        let node = self.node(id);
        let (Some(f), Some(pos), Some(pv), Some(mom)) =
            (node.flight_index, node.pos_index, self.production_vertex(id), node.mom_index)
        else {
            return;
        };
        let p = vec3_at(params, mom);
        let norm = p.norm();
        let length = if norm > 0.0 {
            (vec3_at(params, pos) - vec3_at(params, pv)).dot(&p) / norm
        } else {
            0.0
        };
        params.state_mut()[f] = length;
    }

    fn daughter_momentum_sum(&self, id: NodeId, params: &FitParams) -> Vec4 {
        self.node(id)
            .daughters
            .iter()
            .filter_map(|&d| self.momentum(d, params))
            .fold(Vec4::zeros(), |acc, p4| acc + p4)
    }

    /// Overwrite every decaying particle's momentum with the sum of its
    /// daughters', bottom-up.
    pub fn force_p4_sum(&self, params: &mut FitParams) {
        self.force_node_p4_sum(self.root, params);
    }

    fn force_node_p4_sum(&self, id: NodeId, params: &mut FitParams) {
        let node = self.node(id);
        for &d in &node.daughters {
            self.force_node_p4_sum(d, params);
        }
        let decaying = node.has_energy() && !node.daughters.is_empty();
        if let (Some(i), true) = (node.mom_index, decaying) {
            let sum = self.daughter_momentum_sum(id, params);
            set_vec4(params, i, &sum);
        }
    }
}

// ─── Small geometry helpers ──────────────────────────────────────────────────

pub(crate) fn vec3_at(params: &FitParams, index: usize) -> Vec3 {
    let x = params.state();
    Vec3::new(x[index], x[index + 1], x[index + 2])
}

fn set_vec3(params: &mut FitParams, index: usize, v: &Vec3) {
    params.state_mut().rows_mut(index, 3).copy_from(v);
}

fn set_vec4(params: &mut FitParams, index: usize, v: &Vec4) {
    params.state_mut().rows_mut(index, 4).copy_from(v);
}

fn unit_or_z(v: &Vec3) -> Vec3 {
    let norm = v.norm();
    if norm > 0.0 {
        v / norm
    } else {
        Vec3::z()
    }
}

pub fn invariant_mass(p4: &Vec4) -> f64 {
    let m2 = p4[3] * p4[3] - p4.fixed_rows::<3>(0).norm_squared();
    m2.max(0.0).sqrt()
}

fn transverse_momentum(track: &TrackMeasurement) -> f64 {
    track.momentum[0].hypot(track.momentum[1])
}

/// Midpoint of the shortest segment between two straight tracks.
fn closest_approach(a: &TrackMeasurement, b: &TrackMeasurement) -> Vec3 {
    let (p1, d1) = (Vec3::from(a.reference_point), Vec3::from(a.momentum));
    let (p2, d2) = (Vec3::from(b.reference_point), Vec3::from(b.momentum));
    let w0 = p1 - p2;
    let (aa, bb, cc) = (d1.dot(&d1), d1.dot(&d2), d2.dot(&d2));
    let (dd, ee) = (d1.dot(&w0), d2.dot(&w0));
    let denom = aa * cc - bb * bb;

    let (s, t) = if denom.abs() <= 1e-12 * aa * cc || cc == 0.0 {
        // parallel: anchor on the first reference point
        (0.0, if cc > 0.0 { ee / cc } else { 0.0 })
    } else {
        ((bb * ee - cc * dd) / denom, (aa * ee - bb * dd) / denom)
    };
    ((p1 + d1 * s) + (p2 + d2 * t)) * 0.5
}

#[cfg(test)]
pub(crate) mod test_trees {
    use super::*;
    use serde_json::json;

    pub const PION_MASS: f64 = 0.13957;

    pub fn diag6(v: f64) -> serde_json::Value {
        let rows: Vec<Vec<f64>> = (0..6)
            .map(|i| (0..6).map(|j| if i == j { v } else { 0.0 }).collect())
            .collect();
        json!(rows)
    }

    pub fn diag(n: usize, v: f64) -> serde_json::Value {
        let rows: Vec<Vec<f64>> = (0..n)
            .map(|i| (0..n).map(|j| if i == j { v } else { 0.0 }).collect())
            .collect();
        json!(rows)
    }

    pub const D0_VERTEX: [f64; 3] = [0.09, 0.02, 0.03];

    /// D0 → π+ π− from a beam spot at the origin, measurements exactly
    /// consistent with a decay vertex at `D0_VERTEX`.
    pub fn d0_spec(mass_constraint: Option<f64>) -> serde_json::Value {
        json!({
            "beam": {
                "position": [0.0, 0.0, 0.0],
                "position_covariance": diag(3, 1e-3),
            },
            "head": {
                "name": "D0",
                "mass": mass_constraint.unwrap_or(1.86484),
                "decay_length": 0.0123,
                "mass_constraint": mass_constraint.is_some(),
                "measurement": { "type": "internal" },
                "daughters": [
                    {
                        "name": "pi+",
                        "mass": PION_MASS,
                        "measurement": {
                            "type": "track",
                            "reference_point": [0.59, 0.27, 0.13],
                            "momentum": [1.0, 0.5, 0.2],
                            "covariance": diag6(1e-4),
                        }
                    },
                    {
                        "name": "pi-",
                        "mass": PION_MASS,
                        "measurement": {
                            "type": "track",
                            "reference_point": [-0.15, 0.05, -0.09],
                            "momentum": [0.8, -0.1, 0.4],
                            "covariance": diag6(1e-4),
                        }
                    }
                ]
            }
        })
    }

    pub fn d0_tree(mass_constraint: Option<f64>) -> DecayTree {
        let spec: TreeSpec = serde_json::from_value(d0_spec(mass_constraint)).unwrap();
        DecayTree::from_spec(&spec).unwrap()
    }

    fn track(name: &str, point: [f64; 3], momentum: [f64; 3]) -> serde_json::Value {
        json!({
            "name": name,
            "mass": PION_MASS,
            "measurement": {
                "type": "track",
                "reference_point": point,
                "momentum": momentum,
                "covariance": diag6(1e-4),
            }
        })
    }

    /// One node of every kind; measurements are only loosely consistent.
    pub fn kitchen_sink_spec() -> serde_json::Value {
        json!({
            "beam": {
                "position": [0.0, 0.0, 0.0],
                "position_covariance": diag(3, 1e-3),
                "momentum": [2.5, 0.6, 1.4, 7.0],
                "momentum_covariance": diag(4, 1e-2),
            },
            "head": {
                "name": "B",
                "mass": 5.279,
                "decay_length": 0.05,
                "lifetime_constraint": true,
                "mass_energy_constraint": true,
                "measurement": { "type": "internal" },
                "daughters": [
                    {
                        "name": "D0",
                        "mass": 1.86484,
                        "mass_constraint": true,
                        "measurement": { "type": "internal" },
                        "daughters": [
                            track("K", [0.6, 0.3, 0.2], [0.9, 0.4, 0.3]),
                            track("pi", [0.2, 0.35, 0.3], [0.3, 0.5, 0.2]),
                        ]
                    },
                    {
                        "name": "gamma_conv",
                        "conversion": true,
                        "measurement": { "type": "internal" },
                        "daughters": [
                            track("e+", [0.5, -0.2, 0.4], [0.4, -0.1, 0.3]),
                            track("e-", [0.45, -0.18, 0.37], [0.3, -0.09, 0.25]),
                        ]
                    },
                    {
                        "name": "gamma",
                        "measurement": {
                            "type": "photon",
                            "position": [80.0, 30.0, 60.0],
                            "energy": 0.5,
                            "covariance": diag(4, 1e-2),
                        }
                    },
                    {
                        "name": "rho",
                        "mass": 0.775,
                        "measurement": {
                            "type": "resonance",
                            "measurement": {
                                "momentum": [0.5, -0.3, 0.4, 1.0],
                                "covariance": diag(4, 1e-2),
                            }
                        },
                        "daughters": [
                            track("rho_pi+", [0.3, 0.1, 0.2], [0.35, -0.05, 0.2]),
                            track("rho_pi-", [0.32, 0.02, 0.25], [0.15, -0.25, 0.2]),
                        ]
                    },
                    {
                        "name": "Ks",
                        "mass": 0.4976,
                        "measurement": {
                            "type": "composite",
                            "vertex": [1.2, 0.4, 0.6],
                            "momentum": [0.6, 0.2, 0.3, 0.87],
                            "covariance": diag(7, 1e-3),
                        },
                        "daughters": [
                            track("Ks_pi+", [1.5, 0.5, 0.8], [0.35, 0.15, 0.2]),
                            track("Ks_pi-", [1.4, 0.42, 0.6], [0.25, 0.05, 0.1]),
                        ]
                    }
                ]
            }
        })
    }

    pub fn kitchen_sink_tree() -> DecayTree {
        let spec: TreeSpec = serde_json::from_value(kitchen_sink_spec()).unwrap();
        DecayTree::from_spec(&spec).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::test_trees::*;
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_layout_daughters_first() {
        let tree = d0_tree(None);
        // origin 3, D0 3+1+4, two tracks 3 each
        assert_eq!(tree.dim(), 17);

        let d0 = tree.find("D0").unwrap();
        let pip = tree.find("pi+").unwrap();
        let pim = tree.find("pi-").unwrap();
        assert_eq!(tree.node(pip).mom_index, Some(0));
        assert_eq!(tree.node(pim).mom_index, Some(3));
        assert_eq!(tree.node(d0).pos_index, Some(6));
        assert_eq!(tree.node(d0).flight_index, Some(9));
        assert_eq!(tree.node(d0).mom_index, Some(10));
        assert_eq!(tree.node(tree.root()).pos_index, Some(14));

        assert_eq!(tree.production_vertex(pip), Some(6));
        assert_eq!(tree.production_vertex(d0), Some(14));
    }

    #[test]
    fn test_constraint_list() {
        let tree = d0_tree(Some(1.86484));
        let list = tree.constraints(&FitConfig::default()).unwrap();
        let kinds: Vec<_> = list.iter().map(|c| (c.kind(), c.depth())).collect();
        assert_eq!(
            kinds,
            vec![
                (ConstraintKind::Track, -2),
                (ConstraintKind::Track, -2),
                (ConstraintKind::Kinematic, -1),
                (ConstraintKind::Geometric, -1),
                (ConstraintKind::Mass, -1),
                (ConstraintKind::BeamSpot, 0),
            ]
        );
        let dims: usize = list.iter().map(|c| c.dim()).sum();
        assert_eq!(dims, 5 + 5 + 4 + 3 + 1 + 3);
        // track daughters make the energy balance non-linear
        assert!(!list[2].is_linear());
    }

    #[test]
    fn test_merged_constraint_list() {
        let tree = d0_tree(Some(1.86484));
        let config = FitConfig {
            merge_constraints: true,
            ..FitConfig::default()
        };
        let list = tree.constraints(&config).unwrap();
        let kinds: Vec<_> = list.iter().map(|c| c.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                ConstraintKind::Track,
                ConstraintKind::Track,
                ConstraintKind::BeamSpot,
                ConstraintKind::Merged
            ]
        );
        let merged = &list[3];
        assert_eq!(merged.dim(), 4 + 3 + 1);
        assert_eq!(merged.components().len(), 3);
        assert_eq!(merged.max_iterations(), 10);
    }

    #[test]
    fn test_every_kind_is_generated() {
        let tree = kitchen_sink_tree();
        let list = tree.constraints(&FitConfig::default()).unwrap();
        for kind in ConstraintKind::ALL.iter().filter(|k| **k != ConstraintKind::Merged) {
            assert!(list.iter().any(|c| c.kind() == *kind), "missing {}", kind);
        }
    }

    #[test]
    fn test_resonance_shares_production_vertex() {
        let tree = kitchen_sink_tree();
        let b = tree.find("B").unwrap();
        let rho = tree.find("rho").unwrap();
        let pi = tree.find("rho_pi+").unwrap();
        assert_eq!(tree.node(rho).pos_index, None);
        assert_eq!(tree.node(rho).flight_index, None);
        assert_eq!(tree.production_vertex(pi), tree.node(b).pos_index);
    }

    #[test]
    fn test_initialization_recovers_vertex_and_momenta() {
        let tree = d0_tree(None);
        let mut params = FitParams::new(tree.dim());
        tree.initialize(&mut params).unwrap();

        let d0 = tree.find("D0").unwrap();
        let vertex = tree.vertex(d0, &params).unwrap();
        for k in 0..3 {
            assert_abs_diff_eq!(vertex[k], D0_VERTEX[k], epsilon = 1e-9);
        }

        let p4 = tree.momentum(d0, &params).unwrap();
        assert_abs_diff_eq!(p4[0], 1.8, epsilon = 1e-12);
        assert_abs_diff_eq!(p4[1], 0.4, epsilon = 1e-12);
        assert_abs_diff_eq!(p4[2], 0.6, epsilon = 1e-12);
        let e1 = (1.0f64 + 0.25 + 0.04 + PION_MASS * PION_MASS).sqrt();
        let e2 = (0.64f64 + 0.01 + 0.16 + PION_MASS * PION_MASS).sqrt();
        assert_abs_diff_eq!(p4[3], e1 + e2, epsilon = 1e-12);

        // vertex = 0.05 · p, so the flight length is 0.05 · |p|
        let flight = tree.flight_length(d0, &params).unwrap();
        assert_abs_diff_eq!(flight, 0.05 * (1.8f64 * 1.8 + 0.16 + 0.36).sqrt(), epsilon = 1e-9);
    }

    #[test]
    fn test_initialize_rejects_wrong_size() {
        let tree = d0_tree(None);
        let mut params = FitParams::new(tree.dim() + 1);
        assert!(matches!(
            tree.initialize(&mut params),
            Err(FitError::DimensionMismatch(_))
        ));
    }

    #[test]
    fn test_prior_covariance_layout() {
        let tree = d0_tree(None);
        let config = FitConfig::default();
        let prior = tree.prior_covariance(&config);
        assert_eq!(prior.len(), tree.dim());
        assert_eq!(prior[0], config.initial_momentum_variance);
        assert_eq!(prior[6], config.initial_position_variance);
        assert_eq!(prior[9], config.initial_flight_variance);
    }

    #[test]
    fn test_force_p4_sum() {
        let tree = d0_tree(None);
        let mut params = FitParams::new(tree.dim());
        tree.initialize(&mut params).unwrap();
        let d0 = tree.find("D0").unwrap();
        let expected = tree.momentum(d0, &params).unwrap();

        let i = tree.node(d0).mom_index.unwrap();
        params.state_mut()[i] += 0.3;
        params.state_mut()[i + 3] -= 0.1;
        tree.force_p4_sum(&mut params);

        let p4 = tree.momentum(d0, &params).unwrap();
        for k in 0..4 {
            assert_abs_diff_eq!(p4[k], expected[k], epsilon = 1e-12);
        }
    }

    #[test]
    fn test_closest_approach_of_crossing_lines() {
        let a = TrackMeasurement {
            reference_point: [0.0, 0.0, 1.0],
            momentum: [1.0, 0.0, 0.0],
            covariance: [[0.0; 6]; 6],
        };
        let b = TrackMeasurement {
            reference_point: [0.0, 2.0, -1.0],
            momentum: [0.0, 1.0, 0.0],
            covariance: [[0.0; 6]; 6],
        };
        let poca = closest_approach(&a, &b);
        assert_abs_diff_eq!(poca, Vec3::new(0.0, 0.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_invariant_mass() {
        assert_abs_diff_eq!(invariant_mass(&Vec4::new(3.0, 0.0, 4.0, 13.0)), 12.0, epsilon = 1e-12);
        assert_eq!(invariant_mass(&Vec4::new(1.0, 0.0, 0.0, 0.5)), 0.0);
    }
}
