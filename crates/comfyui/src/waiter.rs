//! Bounded wait for a prompt to finish.
//!
//! ComfyUI has no dedicated "done" message. A prompt is finished when
//! the server sends `executing` for that prompt with `node: null`
//! ([`is_terminal_signal`]). A [`CompletionWaiter`] registers a listener
//! for that signal (and for the prompt's error/interrupt messages) and
//! settles into exactly one [`WaitOutcome`].

use std::time::Duration;

use tokio::sync::oneshot;

use crate::demux::{Demultiplexer, ListenerId};
use crate::messages::ComfyUIMessage;

/// Default deadline for a prompt to finish.
pub const DEFAULT_COMPLETION_TIMEOUT: Duration = Duration::from_secs(300);

/// The canonical completion condition: `executing` for `prompt_id` with
/// no active node.
pub fn is_terminal_signal(message: &ComfyUIMessage, prompt_id: &str) -> bool {
    matches!(
        message,
        ComfyUIMessage::Executing(data) if data.prompt_id == prompt_id && data.is_finished()
    )
}

/// The server gave up on `prompt_id` (error or interrupt).
pub fn is_failure_signal(message: &ComfyUIMessage, prompt_id: &str) -> bool {
    match message {
        ComfyUIMessage::ExecutionError(data) => data.prompt_id == prompt_id,
        ComfyUIMessage::ExecutionInterrupted(data) => data.prompt_id == prompt_id,
        _ => false,
    }
}

/// Terminal state of one wait.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    Completed,
    TimedOut,
    Failed(WaitFailure),
}

/// Why a wait ended in [`WaitOutcome::Failed`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WaitFailure {
    #[error("node {node_id} raised {exception_type}: {message}")]
    ExecutionError {
        node_id: String,
        exception_type: String,
        message: String,
    },

    #[error("execution was interrupted")]
    Interrupted { node_id: Option<String> },

    /// The connection ended (and dropped the listener) before the
    /// prompt finished.
    #[error("connection closed before the prompt finished")]
    ConnectionClosed,
}

/// A registered, not yet settled wait for one prompt.
///
/// Dropping an unsettled waiter unregisters its listener.
pub struct CompletionWaiter<'a> {
    demux: &'a Demultiplexer,
    prompt_id: String,
    listener: ListenerId,
    rx: oneshot::Receiver<ComfyUIMessage>,
    settled: bool,
}

impl<'a> CompletionWaiter<'a> {
    /// Install the listener for `prompt_id`.
    ///
    /// Registration is synchronous, so messages dispatched after this
    /// returns are never missed. Without a live connection the wait
    /// settles at once as [`WaitFailure::ConnectionClosed`].
    pub fn register(demux: &'a Demultiplexer, prompt_id: impl Into<String>) -> Self {
        let prompt_id = prompt_id.into();
        let target = prompt_id.clone();
        let (listener, rx) = demux.register(move |msg| {
            is_terminal_signal(msg, &target) || is_failure_signal(msg, &target)
        });
        tracing::debug!(prompt_id = %prompt_id, listener, "Waiting for completion");

        Self {
            demux,
            prompt_id,
            listener,
            rx,
            settled: false,
        }
    }

    pub fn prompt_id(&self) -> &str {
        &self.prompt_id
    }

    /// Wait until the prompt settles or `timeout` elapses.
    pub async fn wait(mut self, timeout: Duration) -> WaitOutcome {
        let outcome = match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(message)) => outcome_for(&message),
            Ok(Err(_)) => WaitOutcome::Failed(WaitFailure::ConnectionClosed),
            Err(_) if self.demux.unregister(self.listener) => WaitOutcome::TimedOut,
            // The deadline raced a dispatch that already consumed the
            // listener; the delivered message wins.
            Err(_) => match self.rx.try_recv() {
                Ok(message) => outcome_for(&message),
                Err(_) => WaitOutcome::Failed(WaitFailure::ConnectionClosed),
            },
        };
        self.settled = true;

        match &outcome {
            WaitOutcome::Completed => {
                tracing::info!(prompt_id = %self.prompt_id, "Prompt completed");
            }
            WaitOutcome::TimedOut => {
                tracing::warn!(
                    prompt_id = %self.prompt_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Timed out waiting for prompt",
                );
            }
            WaitOutcome::Failed(failure) => {
                tracing::warn!(prompt_id = %self.prompt_id, error = %failure, "Prompt failed");
            }
        }
        outcome
    }
}

impl Drop for CompletionWaiter<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.demux.unregister(self.listener);
        }
    }
}

/// Map the message that resolved the listener to an outcome.
///
/// Only terminal and failure signals ever reach here (see the predicate
/// installed by [`CompletionWaiter::register`]).
fn outcome_for(message: &ComfyUIMessage) -> WaitOutcome {
    match message {
        ComfyUIMessage::ExecutionError(data) => WaitOutcome::Failed(WaitFailure::ExecutionError {
            node_id: data.node_id.clone(),
            exception_type: data.exception_type.clone(),
            message: data.exception_message.clone(),
        }),
        ComfyUIMessage::ExecutionInterrupted(data) => {
            WaitOutcome::Failed(WaitFailure::Interrupted {
                node_id: data.node_id.clone(),
            })
        }
        _ => WaitOutcome::Completed,
    }
}
