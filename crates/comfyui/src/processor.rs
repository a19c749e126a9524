//! WebSocket message processing loop.
//!
//! Reads raw frames from a ComfyUI WebSocket connection, parses them
//! into typed [`ComfyUIMessage`] variants, logs them, and hands them to
//! the [`Demultiplexer`] for routing.

use futures::{Stream, StreamExt};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;

use crate::demux::Demultiplexer;
use crate::messages::{parse_message, ComfyUIMessage};

/// Process WebSocket messages from a ComfyUI connection.
///
/// Loops until the WebSocket closes, encounters a fatal receive error,
/// the stream is exhausted, or `cancel` fires. Each text frame is parsed
/// via [`parse_message`]; malformed frames are logged and dropped.
///
/// Binary frames (preview images) are ignored.
///
/// On exit every pending listener is dropped so that waits observe the
/// lost connection instead of running into their deadline.
pub async fn process_messages<S>(mut stream: S, demux: &Demultiplexer, cancel: &CancellationToken)
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        let msg_result = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("Message processing cancelled");
                break;
            }
            next = stream.next() => match next {
                Some(result) => result,
                None => {
                    tracing::info!("ComfyUI WebSocket stream exhausted");
                    break;
                }
            },
        };

        match msg_result {
            Ok(Message::Text(text)) => {
                handle_text_message(&text, demux);
            }
            Ok(Message::Binary(data)) => {
                tracing::trace!(len = data.len(), "Ignoring binary message (preview image)");
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => {
                // Handled automatically by tungstenite.
            }
            Ok(Message::Close(frame)) => {
                tracing::info!(?frame, "ComfyUI WebSocket closed");
                break;
            }
            Ok(Message::Frame(_)) => {}
            Err(e) => {
                tracing::error!(error = %e, "WebSocket receive error");
                break;
            }
        }
    }

    demux.close_listeners();
}

/// Parse a single text frame, log it, and route it.
fn handle_text_message(text: &str, demux: &Demultiplexer) {
    match parse_message(text) {
        Ok(msg) => {
            log_message(&msg);
            demux.dispatch(msg);
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                raw_message = %text,
                "Failed to parse ComfyUI message",
            );
        }
    }
}

// ---- per-kind logging ----

fn log_message(msg: &ComfyUIMessage) {
    match msg {
        ComfyUIMessage::Progress(data) => {
            tracing::debug!(
                prompt_id = data.prompt_id.as_deref().unwrap_or("-"),
                value = data.value,
                max = data.max,
                percent = data.percent(),
                "Generation progress",
            );
        }
        ComfyUIMessage::ExecutionStart(data) => {
            tracing::info!(prompt_id = %data.prompt_id, "Execution started");
        }
        ComfyUIMessage::Executing(data) => match &data.node {
            Some(node) => {
                tracing::debug!(prompt_id = %data.prompt_id, node = %node, "Executing node");
            }
            None => {
                // node == None means execution is complete for this prompt.
                tracing::info!(
                    prompt_id = %data.prompt_id,
                    "Execution completed (all nodes done)",
                );
            }
        },
        ComfyUIMessage::Executed(data) => {
            tracing::debug!(
                prompt_id = %data.prompt_id,
                node = %data.node,
                "Node executed with output",
            );
        }
        ComfyUIMessage::ExecutionCached(data) => {
            tracing::debug!(
                prompt_id = %data.prompt_id,
                cached_nodes = data.nodes.len(),
                "Execution used cache",
            );
        }
        ComfyUIMessage::ExecutionSuccess(data) => {
            tracing::debug!(prompt_id = %data.prompt_id, "Execution succeeded");
        }
        ComfyUIMessage::ExecutionError(data) => {
            tracing::error!(
                prompt_id = %data.prompt_id,
                node_id = %data.node_id,
                error_type = %data.exception_type,
                error_message = %data.exception_message,
                "Execution error",
            );
        }
        ComfyUIMessage::ExecutionInterrupted(data) => {
            tracing::warn!(
                prompt_id = %data.prompt_id,
                node_id = data.node_id.as_deref().unwrap_or("-"),
                "Execution interrupted",
            );
        }
        ComfyUIMessage::Status(data) => {
            tracing::debug!(
                queue_remaining = data.queue_remaining(),
                "ComfyUI queue status",
            );
        }
    }
}
