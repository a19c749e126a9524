//! WebSocket client for connecting to a ComfyUI instance.
//!
//! [`ComfyUIClient`] owns at most one live connection to a ComfyUI
//! server, scoped by a client ID (the correlation token ComfyUI uses to
//! address events to this client). Incoming frames are read by a
//! background task and routed through the client's [`Demultiplexer`].

use std::sync::Arc;
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use comfyrun_core::types::new_client_id;

use crate::demux::Demultiplexer;
use crate::processor::process_messages;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long `disconnect` waits for the reader task before aborting it.
const READER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Host/port of a ComfyUI server plus the TLS flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEndpoint {
    address: String,
    secure: bool,
}

impl ServerEndpoint {
    /// * `address` - `host:port`, e.g. `127.0.0.1:8188`.
    /// * `secure`  - use `wss`/`https` instead of `ws`/`http`.
    pub fn new(address: impl Into<String>, secure: bool) -> Self {
        Self {
            address: address.into(),
            secure,
        }
    }

    /// WebSocket base URL (e.g. `ws://host:8188`).
    pub fn ws_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{scheme}://{}", self.address)
    }

    /// HTTP API base URL (e.g. `http://host:8188`).
    pub fn api_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{scheme}://{}", self.address)
    }
}

/// Connection handle for a single ComfyUI instance.
///
/// `connect` is idempotent and `disconnect` is always safe to call, so
/// one client can be reused across jobs. The client never reconnects on
/// its own.
pub struct ComfyUIClient {
    client_id: String,
    ws_url: String,
    api_url: String,
    demux: Arc<Demultiplexer>,
    connection: Mutex<Option<ComfyUIConnection>>,
}

/// A live WebSocket connection.
///
/// The write half stays here; the read half is owned by the reader
/// task, which exits when the server closes the socket or `cancel`
/// fires.
struct ComfyUIConnection {
    sink: SplitSink<WsStream, Message>,
    reader: JoinHandle<()>,
    cancel: CancellationToken,
}

impl ComfyUIConnection {
    fn is_open(&self) -> bool {
        !self.reader.is_finished()
    }
}

impl ComfyUIClient {
    /// Create a new client with a freshly generated client ID.
    ///
    /// * `ws_url`  - WebSocket base URL, e.g. `ws://host:8188`.
    /// * `api_url` - HTTP base URL, e.g. `http://host:8188`.
    pub fn new(ws_url: String, api_url: String) -> Self {
        // No connection yet: waits registered now would never be fed.
        let demux = Demultiplexer::new();
        demux.close_listeners();
        Self {
            client_id: new_client_id(),
            ws_url,
            api_url,
            demux: Arc::new(demux),
            connection: Mutex::new(None),
        }
    }

    pub fn from_endpoint(endpoint: &ServerEndpoint) -> Self {
        Self::new(endpoint.ws_url(), endpoint.api_url())
    }

    /// Replace the generated client ID with an externally supplied one.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    /// Correlation token sent during the WebSocket handshake.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// WebSocket base URL (e.g. `ws://host:8188`).
    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// HTTP API base URL (e.g. `http://host:8188`).
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// The demultiplexer fed by this client's connection.
    ///
    /// It refuses listeners while no connection is open, so a wait
    /// started then fails at once with a closed channel.
    pub fn demux(&self) -> &Demultiplexer {
        &self.demux
    }

    /// Full socket URL including the client ID query parameter.
    pub fn socket_url(&self) -> String {
        format!("{}/ws?clientId={}", self.ws_url, self.client_id)
    }

    pub async fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .await
            .as_ref()
            .is_some_and(ComfyUIConnection::is_open)
    }

    /// Connect to the ComfyUI WebSocket endpoint.
    ///
    /// Returns immediately if a connection is already open. A connection
    /// the server has since closed is discarded and re-established.
    pub async fn connect(&self) -> Result<(), ComfyUIClientError> {
        let mut connection = self.connection.lock().await;
        if connection.as_ref().is_some_and(ComfyUIConnection::is_open) {
            tracing::trace!(client_id = %self.client_id, "Already connected to ComfyUI");
            return Ok(());
        }
        if let Some(stale) = connection.take() {
            stale.cancel.cancel();
        }

        let url = self.socket_url();
        let (ws_stream, _response) = connect_async(&url).await.map_err(|e| {
            ComfyUIClientError::Connection(format!(
                "Failed to connect to ComfyUI at {}: {e}",
                self.ws_url
            ))
        })?;

        let (sink, stream) = ws_stream.split();
        self.demux.reopen();
        let cancel = CancellationToken::new();
        let reader = {
            let demux = Arc::clone(&self.demux);
            let cancel = cancel.clone();
            let client_id = self.client_id.clone();
            tokio::spawn(async move {
                process_messages(stream, &demux, &cancel).await;
                tracing::debug!(client_id = %client_id, "Reader task exited");
            })
        };

        tracing::info!(
            client_id = %self.client_id,
            "Connected to ComfyUI at {}",
            self.ws_url,
        );

        *connection = Some(ComfyUIConnection {
            sink,
            reader,
            cancel,
        });
        Ok(())
    }

    /// Send a text frame over the open connection.
    pub async fn send(&self, text: impl Into<String>) -> Result<(), ComfyUIClientError> {
        let mut connection = self.connection.lock().await;
        let conn = connection
            .as_mut()
            .filter(|c| c.is_open())
            .ok_or(ComfyUIClientError::NotConnected)?;

        conn.sink
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| ComfyUIClientError::Connection(format!("Failed to send frame: {e}")))
    }

    /// Close the connection if one exists.
    ///
    /// Idempotent: calling it on a disconnected client, or after a
    /// connection error, is a no-op.
    pub async fn disconnect(&self) {
        let Some(mut conn) = self.connection.lock().await.take() else {
            return;
        };

        if conn.is_open() {
            if let Err(e) = conn.sink.send(Message::Close(None)).await {
                tracing::debug!(error = %e, "Close frame not delivered");
            }
        }
        conn.cancel.cancel();

        if tokio::time::timeout(READER_SHUTDOWN_TIMEOUT, &mut conn.reader)
            .await
            .is_err()
        {
            tracing::warn!(client_id = %self.client_id, "Reader task did not stop, aborting");
            conn.reader.abort();
        }
        // An aborted reader never got to close the demux itself.
        self.demux.close_listeners();

        tracing::info!(client_id = %self.client_id, "Disconnected from ComfyUI");
    }
}

impl Drop for ComfyUIClient {
    fn drop(&mut self) {
        if let Some(conn) = self.connection.get_mut() {
            conn.cancel.cancel();
        }
    }
}

/// Errors that can occur when working with the WebSocket client.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIClientError {
    /// Failed to open the connection or write to it.
    #[error("Connection error: {0}")]
    Connection(String),

    /// An operation needed an open connection and there was none.
    #[error("Not connected to ComfyUI")]
    NotConnected,
}
