//! Retrieval of a finished prompt's artifacts.
//!
//! The history entry for a prompt (the result ledger) lists, per output
//! node, the files the node saved. Every descriptor of type `output` is
//! downloaded through `/view`. Downloads are independent: one failure is
//! recorded and the rest still run.

use std::collections::BTreeMap;

use serde::Deserialize;

use comfyrun_core::types::{NodeId, PromptId};

use crate::api::{ComfyUIApi, ComfyUIApiError};

/// Storage class of files a node saved as final output.
pub const OUTPUT_KIND: &str = "output";

/// Reference to one stored file on the server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ArtifactDescriptor {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    /// `output`, `temp` or `input`.
    #[serde(rename = "type")]
    pub kind: String,
}

impl ArtifactDescriptor {
    pub fn is_output(&self) -> bool {
        self.kind == OUTPUT_KIND
    }
}

/// Files one node produced. Nodes that save nothing have no `images`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeOutput {
    #[serde(default)]
    pub images: Option<Vec<ArtifactDescriptor>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryStatus {
    #[serde(default)]
    pub status_str: Option<String>,
    #[serde(default)]
    pub completed: bool,
}

/// The history entry of a single prompt.
#[derive(Debug, Clone, Deserialize)]
pub struct ResultLedger {
    #[serde(default)]
    pub outputs: BTreeMap<NodeId, NodeOutput>,
    #[serde(default)]
    pub status: Option<HistoryStatus>,
}

/// A downloaded file.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub descriptor: ArtifactDescriptor,
    pub bytes: Vec<u8>,
}

/// A download that did not succeed.
#[derive(Debug, Clone)]
pub struct ArtifactFailure {
    pub node_id: NodeId,
    pub descriptor: ArtifactDescriptor,
    pub error: String,
}

/// Some artifacts of an otherwise finished prompt could not be fetched.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{} artifact download(s) failed", .0.len())]
pub struct PartialArtifactError(pub Vec<ArtifactFailure>);

/// Everything retrieved for one prompt.
#[derive(Debug, Clone)]
pub struct JobOutputs {
    pub prompt_id: PromptId,
    /// Successfully downloaded artifacts grouped by originating node.
    pub outputs: BTreeMap<NodeId, Vec<Artifact>>,
    pub failures: Vec<ArtifactFailure>,
    /// The raw history entry.
    pub history: serde_json::Value,
}

impl JobOutputs {
    /// Artifacts of one node (empty when it produced none).
    pub fn node(&self, node_id: &str) -> &[Artifact] {
        self.outputs.get(node_id).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn artifact_count(&self) -> usize {
        self.outputs.values().map(Vec::len).sum()
    }

    /// The recorded download failures as an error, if there were any.
    pub fn partial_error(&self) -> Option<PartialArtifactError> {
        if self.failures.is_empty() {
            None
        } else {
            Some(PartialArtifactError(self.failures.clone()))
        }
    }
}

/// Pick the entry for `prompt_id` out of a `/history/{prompt_id}` response.
///
/// ComfyUI answers an unknown prompt with `{}`; that is reported as
/// [`ComfyUIApiError::NotFound`].
pub fn extract_ledger(
    history: &serde_json::Value,
    prompt_id: &str,
) -> Result<(ResultLedger, serde_json::Value), ComfyUIApiError> {
    let entry = history
        .get(prompt_id)
        .filter(|entry| !entry.is_null())
        .ok_or_else(|| ComfyUIApiError::NotFound(prompt_id.to_string()))?;
    let ledger = ResultLedger::deserialize(entry)?;
    Ok((ledger, entry.clone()))
}

/// Download one stored file.
pub async fn fetch_artifact(
    api: &ComfyUIApi,
    descriptor: &ArtifactDescriptor,
) -> Result<Artifact, ComfyUIApiError> {
    let bytes = api
        .view(&descriptor.filename, &descriptor.subfolder, &descriptor.kind)
        .await?;
    Ok(Artifact {
        descriptor: descriptor.clone(),
        bytes,
    })
}

/// Look up a finished prompt's history and download its output files.
///
/// History lookup errors (including [`ComfyUIApiError::NotFound`]) are
/// returned; individual download errors are collected in
/// [`JobOutputs::failures`].
pub async fn fetch_results(
    api: &ComfyUIApi,
    prompt_id: &str,
) -> Result<JobOutputs, ComfyUIApiError> {
    let history = api.get_history(prompt_id).await?;
    let (ledger, entry) = extract_ledger(&history, prompt_id)?;

    let mut outputs = BTreeMap::new();
    let mut failures = Vec::new();

    for (node_id, node_output) in &ledger.outputs {
        let Some(images) = &node_output.images else {
            continue;
        };
        let mut artifacts = Vec::new();
        for descriptor in images.iter().filter(|d| d.is_output()) {
            match fetch_artifact(api, descriptor).await {
                Ok(artifact) => artifacts.push(artifact),
                Err(e) => {
                    tracing::warn!(
                        prompt_id = %prompt_id,
                        node_id = %node_id,
                        filename = %descriptor.filename,
                        error = %e,
                        "Artifact download failed",
                    );
                    failures.push(ArtifactFailure {
                        node_id: node_id.clone(),
                        descriptor: descriptor.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
        if !artifacts.is_empty() {
            outputs.insert(node_id.clone(), artifacts);
        }
    }

    let results = JobOutputs {
        prompt_id: prompt_id.to_string(),
        outputs,
        failures,
        history: entry,
    };
    tracing::info!(
        prompt_id = %prompt_id,
        artifacts = results.artifact_count(),
        failures = results.failures.len(),
        "Fetched prompt outputs",
    );
    Ok(results)
}
