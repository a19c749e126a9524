//! Job descriptions and the mutations applied to them before submission.
//!
//! A job description is a ComfyUI "API format" workflow: a JSON object
//! mapping node IDs to node definitions, each carrying an `inputs`
//! object. The caller's description is never mutated; every operation
//! here returns a new [`JobDescription`].

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;
use crate::types::NodeId;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Sentinel a workflow author places wherever the user's prompt text goes.
pub const PROMPT_PLACEHOLDER: &str = "114514.1919810";

/// Payload emitted by the upstream content filter for a rejected prompt.
pub const BLOCKED_SENTINEL: &str = "0";

/// Node input names that carry a randomness seed.
pub const SEED_INPUTS: &[&str] = &["seed", "noise_seed"];

/// Exclusive upper bound for generated seeds.
pub const MAX_SEED: u64 = 1_000_000_000_000_000;

// ---------------------------------------------------------------------------
// JobDescription
// ---------------------------------------------------------------------------

/// A workflow graph keyed by node ID.
///
/// Node IDs are unique by construction (they are object keys). Every
/// node value is guaranteed to be a JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value")]
pub struct JobDescription {
    #[serde(flatten)]
    nodes: Map<String, Value>,
}

impl TryFrom<Value> for JobDescription {
    type Error = CoreError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_value(value)
    }
}

impl JobDescription {
    /// Build a description from an already-parsed JSON value.
    ///
    /// Rejects anything that is not an object of objects.
    pub fn from_value(value: Value) -> Result<Self, CoreError> {
        let Value::Object(nodes) = value else {
            return Err(CoreError::InvalidDescription(
                "top-level value must be an object of nodes".to_string(),
            ));
        };
        if let Some((id, _)) = nodes.iter().find(|(_, node)| !node.is_object()) {
            return Err(CoreError::InvalidDescription(format!(
                "node {id} is not an object"
            )));
        }
        Ok(Self { nodes })
    }

    /// Parse a description from its JSON text.
    pub fn from_json(text: &str) -> Result<Self, CoreError> {
        Self::from_value(serde_json::from_str(text)?)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// IDs of every node in the description.
    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn node(&self, node_id: &str) -> Option<&Value> {
        self.nodes.get(node_id)
    }

    /// Look up a single named input of a node.
    pub fn input(&self, node_id: &str, name: &str) -> Option<&Value> {
        self.nodes.get(node_id)?.get("inputs")?.get(name)
    }

    /// Every `(node_id, value)` pair currently assigned to a seed input.
    pub fn seed_values(&self) -> Vec<(NodeId, &Value)> {
        self.nodes
            .iter()
            .filter_map(|(id, node)| Some((id, node.get("inputs")?.as_object()?)))
            .flat_map(|(id, inputs)| {
                SEED_INPUTS
                    .iter()
                    .filter_map(move |name| inputs.get(*name).map(|v| (id.clone(), v)))
            })
            .collect()
    }

    /// Return a copy with every existing seed input set to `seed`.
    ///
    /// Nodes without a seed input are left untouched; no input is added.
    pub fn with_seed(&self, seed: u64) -> Self {
        let mut copy = self.clone();
        for node in copy.nodes.values_mut() {
            let Some(inputs) = node.get_mut("inputs").and_then(Value::as_object_mut) else {
                continue;
            };
            for name in SEED_INPUTS {
                if let Some(slot) = inputs.get_mut(*name) {
                    *slot = Value::from(seed);
                }
            }
        }
        copy
    }

    /// Return a copy whose seed inputs all share one freshly drawn seed,
    /// together with that seed.
    ///
    /// The seed never equals a value already present, so the server
    /// cannot serve the job from its cache.
    pub fn randomize_seeds(&self) -> (Self, u64) {
        let seed = fresh_seed(&mut rand::rng(), &self.seed_values());
        (self.with_seed(seed), seed)
    }

    /// Replace [`PROMPT_PLACEHOLDER`] with `payload`.
    ///
    /// Every occurrence is replaced, not only the first, so a workflow
    /// may feed the prompt to several text encoders.
    pub fn substitute_prompt(&self, payload: &str) -> Result<Self, CoreError> {
        self.replace_text(PROMPT_PLACEHOLDER, payload)
    }

    /// Replace every occurrence of `placeholder` in the serialized
    /// description with `payload`.
    ///
    /// The payload is JSON-string escaped before insertion, so quotes,
    /// backslashes and newlines in user text cannot break the document.
    pub fn replace_text(&self, placeholder: &str, payload: &str) -> Result<Self, CoreError> {
        let serialized = serde_json::to_string(&self.nodes)?;
        let quoted = serde_json::to_string(payload)?;
        let escaped = &quoted[1..quoted.len() - 1];
        Self::from_json(&serialized.replace(placeholder, escaped))
    }

    /// Borrow the description as a JSON object.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.nodes
    }
}

/// Draw a seed in `0..MAX_SEED` that differs from every existing value.
fn fresh_seed<R: Rng>(rng: &mut R, existing: &[(NodeId, &Value)]) -> u64 {
    loop {
        let seed = rng.random_range(0..MAX_SEED);
        if !existing.iter().any(|(_, v)| v.as_u64() == Some(seed)) {
            return seed;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
