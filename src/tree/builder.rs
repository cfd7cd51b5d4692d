//! Serde input format for decay trees.

use serde::{Deserialize, Serialize};

use super::{DecayTree, NodeId, ParticleKind, ParticleNode};
use crate::error::FitResult;
use crate::types::{
    BeamSpec, CompositeMeasurement, PhotonMeasurement, ResonanceMeasurement, TrackMeasurement,
};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TreeSpec {
    #[serde(default)]
    pub beam: Option<BeamSpec>,
    pub head: CandidateSpec,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CandidateMeasurement {
    Internal,
    Composite(CompositeMeasurement),
    Resonance {
        #[serde(default)]
        measurement: Option<ResonanceMeasurement>,
    },
    Track(TrackMeasurement),
    Photon(PhotonMeasurement),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CandidateSpec {
    pub name: String,
    pub measurement: CandidateMeasurement,
    #[serde(default)]
    pub mass: f64,
    #[serde(default)]
    pub decay_length: f64,
    #[serde(default)]
    pub mass_constraint: bool,
    #[serde(default)]
    pub mass_energy_constraint: bool,
    #[serde(default)]
    pub lifetime_constraint: bool,
    #[serde(default)]
    pub conversion: bool,
    #[serde(default)]
    pub daughters: Vec<CandidateSpec>,
}

impl DecayTree {
    /// Build and validate the arena for one candidate.
    pub fn from_spec(spec: &TreeSpec) -> FitResult<Self> {
        let mut nodes = Vec::new();
        let origin = spec.beam.as_ref().map(|beam| {
            nodes.push(ParticleNode::new(
                "beam_spot".to_string(),
                ParticleKind::Origin(beam.clone()),
                None,
            ));
            NodeId(0)
        });

        let candidate = add_candidate(&mut nodes, &spec.head, origin);
        if let Some(o) = origin {
            nodes[o.0].daughters.push(candidate);
        }
        DecayTree::from_nodes(nodes, origin.unwrap_or(candidate), candidate)
    }

    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        let spec: TreeSpec = serde_json::from_str(text)?;
        Ok(Self::from_spec(&spec)?)
    }
}

fn add_candidate(
    nodes: &mut Vec<ParticleNode>,
    spec: &CandidateSpec,
    mother: Option<NodeId>,
) -> NodeId {
    let kind = match &spec.measurement {
        CandidateMeasurement::Internal => ParticleKind::Internal,
        CandidateMeasurement::Composite(m) => ParticleKind::Composite(m.clone()),
        CandidateMeasurement::Resonance { measurement } => {
            ParticleKind::Resonance(measurement.clone())
        }
        CandidateMeasurement::Track(m) => ParticleKind::Track(m.clone()),
        CandidateMeasurement::Photon(m) => ParticleKind::Photon(m.clone()),
    };
    let id = NodeId(nodes.len());
    let mut node = ParticleNode::new(spec.name.clone(), kind, mother);
    node.mass = spec.mass;
    node.decay_length = spec.decay_length;
    node.mass_constraint = spec.mass_constraint;
    node.mass_energy_constraint = spec.mass_energy_constraint;
    node.lifetime_constraint = spec.lifetime_constraint;
    node.conversion = spec.conversion;
    nodes.push(node);

    for daughter in &spec.daughters {
        let d = add_candidate(nodes, daughter, Some(id));
        nodes[id.0].daughters.push(d);
    }
    id
}
