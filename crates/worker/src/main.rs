//! Run one ComfyUI job from the command line.
//!
//! ```text
//! comfyrun-worker <workflow.json> <prompt...>
//! ```
//!
//! The workflow is a ComfyUI API-format JSON file; the prompt words are
//! joined with spaces and substituted for the workflow's placeholder.
//! Artifacts are written to `OUTPUT_DIR/<node id>/<filename>` and their
//! paths printed, one per line.
//!
//! | Env Var                | Default          |
//! |------------------------|------------------|
//! | `COMFYUI_ENDPOINT`     | `127.0.0.1:8188` |
//! | `COMFYUI_SECURE`       | `false`          |
//! | `COMFYUI_TIMEOUT_SECS` | `300`            |
//! | `COMFYUI_AVOID_CACHE`  | `true`           |
//! | `COMFYUI_OUTPUT_NODE`  | unset (all)      |
//! | `OUTPUT_DIR`           | `output`         |

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use comfyrun_comfyui::config::{ComfyUIConfig, ConfigError};
use comfyrun_comfyui::fetcher::JobOutputs;
use comfyrun_comfyui::messages::ComfyUIMessage;
use comfyrun_comfyui::runner::{ExecuteOptions, JobRunner, WorkflowError};
use comfyrun_core::error::CoreError;
use comfyrun_core::workflow::JobDescription;

#[derive(Debug, thiserror::Error)]
enum WorkerError {
    #[error("usage: comfyrun-worker <workflow.json> <prompt...>")]
    Usage,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Description(#[from] CoreError),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error("output node {0} produced no artifacts")]
    MissingOutput(String),
}

#[derive(Debug, Clone)]
struct WorkerConfig {
    comfyui: ComfyUIConfig,
    output_dir: PathBuf,
    /// Only save artifacts of this node.
    output_node: Option<String>,
}

impl WorkerConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let comfyui = ComfyUIConfig::from_lookup(&lookup)?;
        let output_dir = lookup("OUTPUT_DIR")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "output".into())
            .into();
        let output_node = lookup("COMFYUI_OUTPUT_NODE")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        Ok(Self {
            comfyui,
            output_dir,
            output_node,
        })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "comfyrun_worker=info,comfyrun_comfyui=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Worker failed");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), WorkerError> {
    let mut args = std::env::args().skip(1);
    let workflow_path = PathBuf::from(args.next().ok_or(WorkerError::Usage)?);
    let prompt = args.collect::<Vec<_>>().join(" ");
    if prompt.trim().is_empty() {
        return Err(WorkerError::Usage);
    }

    let config = WorkerConfig::from_env()?;

    let text = tokio::fs::read_to_string(&workflow_path)
        .await
        .map_err(|source| WorkerError::Read {
            path: workflow_path.clone(),
            source,
        })?;
    let description = JobDescription::from_json(&text)?;
    tracing::info!(
        workflow = %workflow_path.display(),
        nodes = description.len(),
        endpoint = %config.comfyui.endpoint,
        "Starting job",
    );

    let mut runner = JobRunner::from_config(&config.comfyui);
    let observer = spawn_progress_observer(runner.client().demux().subscribe());
    let options = ExecuteOptions {
        avoid_cache: config.comfyui.avoid_cache,
    };
    let result = runner.execute_job(&description, &prompt, options).await;
    observer.abort();
    let outputs = result?;

    if let Some(partial) = outputs.partial_error() {
        tracing::warn!(error = %partial, "Some artifacts were not downloaded");
    }

    let written =
        write_artifacts(&outputs, &config.output_dir, config.output_node.as_deref()).await?;
    tracing::info!(
        prompt_id = %outputs.prompt_id,
        count = written.len(),
        dir = %config.output_dir.display(),
        "Artifacts written",
    );
    for path in written {
        println!("{}", path.display());
    }
    Ok(())
}

/// Log execution progress while a job runs.
fn spawn_progress_observer(mut events: broadcast::Receiver<ComfyUIMessage>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ComfyUIMessage::Progress(data)) => {
                    tracing::info!(
                        step = data.value,
                        steps = data.max,
                        "Sampling {:.0}%",
                        data.percent(),
                    );
                }
                Ok(ComfyUIMessage::Executing(data)) => {
                    if let Some(node) = data.node {
                        tracing::info!(node = %node, "Running node");
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Progress observer lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Write artifacts to `dir/<node id>/<filename>`, optionally restricted
/// to one node. Returns the written paths.
async fn write_artifacts(
    outputs: &JobOutputs,
    dir: &Path,
    only_node: Option<&str>,
) -> Result<Vec<PathBuf>, WorkerError> {
    if let Some(node_id) = only_node {
        if outputs.node(node_id).is_empty() {
            return Err(WorkerError::MissingOutput(node_id.to_string()));
        }
    }

    let mut written = Vec::new();
    for (node_id, artifacts) in &outputs.outputs {
        if only_node.is_some_and(|only| only != node_id.as_str()) {
            continue;
        }
        let node_dir = dir.join(sanitize_file_name(node_id));
        tokio::fs::create_dir_all(&node_dir)
            .await
            .map_err(|source| WorkerError::Write {
                path: node_dir.clone(),
                source,
            })?;

        for artifact in artifacts {
            let path = node_dir.join(sanitize_file_name(&artifact.descriptor.filename));
            tokio::fs::write(&path, &artifact.bytes)
                .await
                .map_err(|source| WorkerError::Write {
                    path: path.clone(),
                    source,
                })?;
            written.push(path);
        }
    }
    Ok(written)
}

/// Reduce a server-supplied name to a single safe path component.
fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.trim_start_matches('.') {
        "" => "artifact".to_string(),
        trimmed => trimmed.to_string(),
    }
}
