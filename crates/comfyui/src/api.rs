//! ComfyUI REST endpoints.
//!
//! [`ComfyUIApi`] covers the HTTP side of a job: queueing a prompt,
//! uploading inputs, reading history, downloading stored files, and
//! queue control. Every non-2xx answer becomes
//! [`ComfyUIApiError::ApiError`] with the body kept for diagnosis.

use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use comfyrun_core::types::PromptId;
use comfyrun_core::workflow::JobDescription;

/// Answer to `POST /prompt`.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitResponse {
    pub prompt_id: PromptId,
    /// Queue position assigned by the server.
    pub number: i64,
    /// Validation problems on nodes that were not needed for any output.
    #[serde(default)]
    pub node_errors: serde_json::Value,
}

/// Answer to `POST /upload/image`.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadResponse {
    /// Stored name; differs from the upload name when the server
    /// de-duplicated it.
    pub name: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// Transport failure (connect, TLS, timeout, body read).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("ComfyUI API error ({status}): {body}")]
    ApiError { status: u16, body: String },

    #[error("No history found for prompt {0}")]
    NotFound(PromptId),

    #[error("Unexpected response shape: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ComfyUIApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::ApiError { status, .. } => Some(*status),
            Self::Request(e) => e.status().map(|s| s.as_u16()),
            Self::NotFound(_) | Self::Decode(_) => None,
        }
    }

    /// What to show the caller about this failure.
    ///
    /// A rejected prompt comes back as JSON (`{"error": ..,
    /// "node_errors": ..}`) and is returned parsed; other bodies are
    /// returned as a string; errors without a body yield their message.
    pub fn payload(&self) -> serde_json::Value {
        match self {
            Self::ApiError { body, .. } if !body.is_empty() => serde_json::from_str(body)
                .unwrap_or_else(|_| serde_json::Value::String(body.clone())),
            other => serde_json::Value::String(other.to_string()),
        }
    }
}

/// HTTP client for one ComfyUI server.
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
}

impl ComfyUIApi {
    /// * `api_url` - base URL without trailing slash, e.g. `http://host:8188`.
    pub fn new(api_url: String) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    /// Share a connection pool with other users of `client`.
    pub fn with_client(client: reqwest::Client, api_url: String) -> Self {
        Self { client, api_url }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Queue a prompt. Events for it are addressed to `client_id`.
    pub async fn submit_workflow(
        &self,
        workflow: &JobDescription,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        self.submit_workflow_as(workflow, client_id, None).await
    }

    /// Queue a prompt under a proposed `prompt_id`.
    ///
    /// Older servers ignore the proposal and assign their own id; always
    /// use [`SubmitResponse::prompt_id`].
    pub async fn submit_workflow_as(
        &self,
        workflow: &JobDescription,
        client_id: &str,
        prompt_id: Option<&str>,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let body = submit_body(workflow, client_id, prompt_id);
        let request = self
            .client
            .post(self.url("/prompt"))
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&body);
        Self::fetch_json(request).await
    }

    /// Upload an input image as multipart field `image`.
    ///
    /// Without `overwrite` the server renames on collision; use the
    /// returned name in the workflow.
    pub async fn upload_image(
        &self,
        bytes: Vec<u8>,
        filename: &str,
        overwrite: bool,
    ) -> Result<UploadResponse, ComfyUIApiError> {
        let image = reqwest::multipart::Part::bytes(bytes).file_name(filename.to_string());
        let form = reqwest::multipart::Form::new()
            .part("image", image)
            .text("overwrite", overwrite.to_string());
        Self::fetch_json(self.client.post(self.url("/upload/image")).multipart(form)).await
    }

    /// Remove a pending prompt from the queue.
    pub async fn cancel_execution(&self, prompt_id: &str) -> Result<(), ComfyUIApiError> {
        let body = serde_json::json!({ "delete": [prompt_id] });
        Self::execute(self.client.post(self.url("/queue")).json(&body)).await?;
        Ok(())
    }

    /// Stop whatever prompt is running right now, whoever queued it.
    pub async fn interrupt(&self) -> Result<(), ComfyUIApiError> {
        Self::execute(self.client.post(self.url("/interrupt"))).await?;
        Ok(())
    }

    /// Running and pending queue entries.
    pub async fn get_queue_status(&self) -> Result<serde_json::Value, ComfyUIApiError> {
        Self::fetch_json(self.client.get(self.url("/queue"))).await
    }

    /// History keyed by prompt id; `{}` when the server does not know
    /// `prompt_id` (yet).
    pub async fn get_history(&self, prompt_id: &str) -> Result<serde_json::Value, ComfyUIApiError> {
        Self::fetch_json(self.client.get(self.url(&format!("/history/{prompt_id}")))).await
    }

    /// Raw bytes of a stored file.
    pub async fn view(
        &self,
        filename: &str,
        subfolder: &str,
        kind: &str,
    ) -> Result<Vec<u8>, ComfyUIApiError> {
        let request = self.client.get(self.url("/view")).query(&[
            ("filename", filename),
            ("subfolder", subfolder),
            ("type", kind),
        ]);
        let response = Self::execute(request).await?;
        Ok(response.bytes().await?.to_vec())
    }

    // ---- request plumbing ----

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.api_url)
    }

    /// Send `request`, turning non-2xx answers into
    /// [`ComfyUIApiError::ApiError`].
    async fn execute(request: RequestBuilder) -> Result<Response, ComfyUIApiError> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        Err(ComfyUIApiError::ApiError {
            status: status.as_u16(),
            body,
        })
    }

    async fn fetch_json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, ComfyUIApiError> {
        Ok(Self::execute(request).await?.json::<T>().await?)
    }
}

fn submit_body(
    workflow: &JobDescription,
    client_id: &str,
    prompt_id: Option<&str>,
) -> serde_json::Value {
    let mut body = serde_json::json!({ "prompt": workflow, "client_id": client_id });
    if let Some(prompt_id) = prompt_id {
        body["prompt_id"] = prompt_id.into();
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_parses_json_error_body() {
        let err = ComfyUIApiError::ApiError {
            status: 400,
            body: r#"{"error":{"type":"prompt_no_outputs","message":"Prompt has no outputs"},"node_errors":{}}"#
                .to_string(),
        };
        assert_eq!(err.status(), Some(400));
        assert_eq!(err.payload()["error"]["type"], "prompt_no_outputs");
    }

    #[test]
    fn payload_keeps_plain_text_body() {
        let err = ComfyUIApiError::ApiError {
            status: 502,
            body: "Bad Gateway".to_string(),
        };
        assert_eq!(err.payload(), serde_json::json!("Bad Gateway"));
    }

    #[test]
    fn payload_falls_back_to_local_message() {
        let err = ComfyUIApiError::NotFound("p1".to_string());
        assert_eq!(err.status(), None);
        assert_eq!(err.payload(), serde_json::json!("No history found for prompt p1"));
    }

    #[test]
    fn submit_response_tolerates_missing_node_errors() {
        let resp: SubmitResponse =
            serde_json::from_str(r#"{"prompt_id":"job-42","number":7}"#).unwrap();
        assert_eq!(resp.prompt_id, "job-42");
        assert_eq!(resp.number, 7);
        assert!(resp.node_errors.is_null());
    }

    #[test]
    fn submit_body_carries_proposed_prompt_id() {
        let workflow = JobDescription::from_json(r#"{"3": {"inputs": {"seed": 1}}}"#).unwrap();

        let plain = submit_body(&workflow, "c1", None);
        assert_eq!(plain["client_id"], "c1");
        assert_eq!(plain["prompt"]["3"]["inputs"]["seed"], 1);
        assert!(plain.get("prompt_id").is_none());

        let proposed = submit_body(&workflow, "c1", Some("p-local"));
        assert_eq!(proposed["prompt_id"], "p-local");
    }

    #[test]
    fn urls_are_joined_onto_base() {
        let api = ComfyUIApi::new("http://gpu:8188".to_string());
        assert_eq!(api.url("/history/p1"), "http://gpu:8188/history/p1");
    }
}
