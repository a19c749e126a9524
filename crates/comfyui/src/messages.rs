//! Typed view of the frames ComfyUI pushes over its WebSocket.
//!
//! Every text frame is `{"type": "<kind>", "data": {...}}`. Kinds this
//! crate does not model (custom-node telemetry such as
//! `crystools.monitor`) fail to parse; the reader logs and drops them.

use std::str::FromStr;

use serde::Deserialize;

use comfyrun_core::types::{NodeId, PromptId};

/// One event from the server's feed.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ComfyUIMessage {
    /// Queue depth broadcast, sent on connect and whenever the queue moves.
    Status(QueueInfo),
    ExecutionStart(PromptStarted),
    ExecutionCached(CachedNodes),
    /// `node: null` marks the end of the prompt.
    Executing(NodeExecuting),
    Progress(StepProgress),
    Executed(NodeExecuted),
    ExecutionSuccess(PromptSucceeded),
    ExecutionError(ExecutionFailure),
    ExecutionInterrupted(PromptInterrupted),
}

impl ComfyUIMessage {
    /// The `type` tag this message arrived with.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Status(_) => "status",
            Self::ExecutionStart(_) => "execution_start",
            Self::ExecutionCached(_) => "execution_cached",
            Self::Executing(_) => "executing",
            Self::Progress(_) => "progress",
            Self::Executed(_) => "executed",
            Self::ExecutionSuccess(_) => "execution_success",
            Self::ExecutionError(_) => "execution_error",
            Self::ExecutionInterrupted(_) => "execution_interrupted",
        }
    }

    /// Prompt the event belongs to. `None` for queue broadcasts and for
    /// progress frames from servers that do not tag them.
    pub fn prompt_id(&self) -> Option<&str> {
        let id = match self {
            Self::Status(_) => return None,
            Self::Progress(p) => return p.prompt_id.as_deref(),
            Self::ExecutionStart(d) => &d.prompt_id,
            Self::ExecutionCached(d) => &d.prompt_id,
            Self::Executing(d) => &d.prompt_id,
            Self::Executed(d) => &d.prompt_id,
            Self::ExecutionSuccess(d) => &d.prompt_id,
            Self::ExecutionError(d) => &d.prompt_id,
            Self::ExecutionInterrupted(d) => &d.prompt_id,
        };
        Some(id)
    }
}

impl FromStr for ComfyUIMessage {
    type Err = serde_json::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_str(s)
    }
}

/// Parse one text frame.
pub fn parse_message(text: &str) -> Result<ComfyUIMessage, serde_json::Error> {
    text.parse()
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct QueueInfo {
    status: QueueStatus,
}

#[derive(Debug, Clone, Deserialize)]
struct QueueStatus {
    exec_info: ExecInfo,
}

#[derive(Debug, Clone, Deserialize)]
struct ExecInfo {
    queue_remaining: u32,
}

impl QueueInfo {
    /// Prompts still waiting or running on the server.
    pub fn queue_remaining(&self) -> u32 {
        self.status.exec_info.queue_remaining
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PromptStarted {
    pub prompt_id: PromptId,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CachedNodes {
    pub prompt_id: PromptId,
    #[serde(default)]
    pub nodes: Vec<NodeId>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeExecuting {
    pub prompt_id: PromptId,
    pub node: Option<NodeId>,
}

impl NodeExecuting {
    /// No node left to run: the prompt is done.
    pub fn is_finished(&self) -> bool {
        self.node.is_none()
    }
}

/// Step counter of a long-running node such as a sampler.
#[derive(Debug, Clone, Deserialize)]
pub struct StepProgress {
    pub value: u32,
    pub max: u32,
    #[serde(default)]
    pub prompt_id: Option<PromptId>,
    #[serde(default)]
    pub node: Option<NodeId>,
}

impl StepProgress {
    /// 0-100; 0 when the step count is unknown.
    pub fn percent(&self) -> f64 {
        match self.max {
            0 => 0.0,
            max => f64::from(self.value) * 100.0 / f64::from(max),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeExecuted {
    pub prompt_id: PromptId,
    pub node: NodeId,
    /// The node's UI output (`images`, `text`, ...), shape depends on the node.
    #[serde(default)]
    pub output: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PromptSucceeded {
    pub prompt_id: PromptId,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionFailure {
    pub prompt_id: PromptId,
    pub node_id: NodeId,
    #[serde(default)]
    pub node_type: Option<String>,
    pub exception_type: String,
    pub exception_message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PromptInterrupted {
    pub prompt_id: PromptId,
    #[serde(default)]
    pub node_id: Option<NodeId>,
}
