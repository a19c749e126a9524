/// Identifier of a queued prompt, as confirmed by the server.
pub type PromptId = String;

/// Node identifier within a job description (ComfyUI uses stringified integers).
pub type NodeId = String;

/// Generate a fresh client correlation token.
///
/// ComfyUI scopes its WebSocket event feed by this value, so every
/// client instance needs its own.
pub fn new_client_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Generate a prompt id to propose when queueing.
///
/// Servers that accept it use it verbatim, which lets a wait be
/// registered before the prompt is queued.
pub fn new_prompt_id() -> PromptId {
    uuid::Uuid::new_v4().to_string()
}
