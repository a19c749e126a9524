//! End-to-end execution of one job against a ComfyUI instance.
//!
//! [`JobRunner::execute_job`] prepares the description (seed
//! randomization, prompt substitution), connects, submits, waits for the
//! terminal signal, fetches the artifacts and always disconnects before
//! returning.

use std::time::Duration;

use comfyrun_core::error::CoreError;
use comfyrun_core::types::new_prompt_id;
use comfyrun_core::workflow::{JobDescription, BLOCKED_SENTINEL};

use crate::api::{ComfyUIApi, ComfyUIApiError};
use crate::client::{ComfyUIClient, ComfyUIClientError};
use crate::config::ComfyUIConfig;
use crate::fetcher::{fetch_results, JobOutputs, PartialArtifactError};
use crate::waiter::{CompletionWaiter, WaitFailure, WaitOutcome, DEFAULT_COMPLETION_TIMEOUT};

/// Per-job options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// Draw a fresh seed so the server cannot answer from its cache.
    pub avoid_cache: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self { avoid_cache: true }
    }
}

/// Every way a job can fail.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// The upstream content filter rejected the prompt.
    #[error("Prompt was blocked by the content filter")]
    PayloadBlocked,

    #[error(transparent)]
    Description(#[from] CoreError),

    #[error(transparent)]
    Connection(#[from] ComfyUIClientError),

    /// ComfyUI refused the prompt (or could not be reached).
    #[error("Prompt submission failed: {payload}")]
    Submission {
        status: Option<u16>,
        payload: serde_json::Value,
    },

    #[error("Prompt {prompt_id} did not finish within {timeout:?}")]
    Timeout {
        prompt_id: String,
        timeout: Duration,
    },

    /// The server reported an error or interrupt for the prompt.
    #[error("Prompt {prompt_id} failed: {failure}")]
    Execution {
        prompt_id: String,
        failure: WaitFailure,
    },

    #[error("Connection lost while waiting for prompt {prompt_id}")]
    ConnectionLost { prompt_id: String },

    #[error("No history found for prompt {0}")]
    NotFound(String),

    #[error("History lookup failed: {0}")]
    History(ComfyUIApiError),

    #[error(transparent)]
    PartialArtifacts(#[from] PartialArtifactError),
}

/// Runs jobs over one client, one job at a time.
pub struct JobRunner {
    client: ComfyUIClient,
    api: ComfyUIApi,
    completion_timeout: Duration,
}

impl JobRunner {
    /// Create a runner whose REST calls go to the client's API URL.
    pub fn new(client: ComfyUIClient) -> Self {
        let api = ComfyUIApi::new(client.api_url().to_string());
        Self {
            client,
            api,
            completion_timeout: DEFAULT_COMPLETION_TIMEOUT,
        }
    }

    pub fn from_config(config: &ComfyUIConfig) -> Self {
        Self::new(ComfyUIClient::from_endpoint(&config.server_endpoint()))
            .with_completion_timeout(config.completion_timeout)
    }

    pub fn with_completion_timeout(mut self, timeout: Duration) -> Self {
        self.completion_timeout = timeout;
        self
    }

    pub fn client(&self) -> &ComfyUIClient {
        &self.client
    }

    pub fn api(&self) -> &ComfyUIApi {
        &self.api
    }

    pub fn completion_timeout(&self) -> Duration {
        self.completion_timeout
    }

    /// Derive the description actually submitted for `payload`.
    ///
    /// Fails with [`WorkflowError::PayloadBlocked`] for the filter's
    /// sentinel. The caller's description is not modified.
    pub fn prepare_description(
        description: &JobDescription,
        payload: &str,
        options: &ExecuteOptions,
    ) -> Result<JobDescription, WorkflowError> {
        if payload == BLOCKED_SENTINEL {
            return Err(WorkflowError::PayloadBlocked);
        }

        let seeded = if options.avoid_cache {
            let (seeded, seed) = description.randomize_seeds();
            tracing::debug!(seed, "Randomized workflow seeds");
            seeded
        } else {
            description.clone()
        };

        Ok(seeded.substitute_prompt(payload)?)
    }

    /// Execute one job and return its outputs.
    ///
    /// The connection is closed on every path before this returns.
    /// Artifact download failures do not fail the job; they are listed in
    /// [`JobOutputs::failures`].
    pub async fn execute_job(
        &mut self,
        description: &JobDescription,
        payload: &str,
        options: ExecuteOptions,
    ) -> Result<JobOutputs, WorkflowError> {
        let prepared = Self::prepare_description(description, payload, &options)?;
        let result = self.run(&prepared).await;
        self.client.disconnect().await;

        if let Err(e) = &result {
            tracing::error!(client_id = %self.client.client_id(), error = %e, "Job failed");
        }
        result
    }

    async fn run(&self, description: &JobDescription) -> Result<JobOutputs, WorkflowError> {
        self.client.connect().await?;

        // Listen before queueing: a fully cached prompt can finish before
        // the `/prompt` response arrives.
        let proposed = new_prompt_id();
        let early = CompletionWaiter::register(self.client.demux(), proposed.as_str());

        let submitted = self
            .api
            .submit_workflow_as(description, self.client.client_id(), Some(&proposed))
            .await
            .map_err(|e| WorkflowError::Submission {
                status: e.status(),
                payload: e.payload(),
            })?;
        let prompt_id = submitted.prompt_id;
        tracing::info!(
            prompt_id = %prompt_id,
            queue_number = submitted.number,
            "Prompt queued",
        );

        let waiter = if prompt_id == proposed {
            early
        } else {
            tracing::debug!(
                proposed = %proposed,
                assigned = %prompt_id,
                "Server assigned its own prompt id",
            );
            drop(early);
            CompletionWaiter::register(self.client.demux(), prompt_id.as_str())
        };
        match waiter.wait(self.completion_timeout).await {
            WaitOutcome::Completed => {}
            WaitOutcome::TimedOut => {
                return Err(WorkflowError::Timeout {
                    prompt_id,
                    timeout: self.completion_timeout,
                })
            }
            WaitOutcome::Failed(WaitFailure::ConnectionClosed) => {
                return Err(WorkflowError::ConnectionLost { prompt_id })
            }
            WaitOutcome::Failed(failure) => {
                return Err(WorkflowError::Execution { prompt_id, failure })
            }
        }

        fetch_results(&self.api, &prompt_id)
            .await
            .map_err(|e| match e {
                ComfyUIApiError::NotFound(id) => WorkflowError::NotFound(id),
                other => WorkflowError::History(other),
            })
    }
}
