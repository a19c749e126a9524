//! In-process fake ComfyUI server for integration tests.
//!
//! Serves `/ws`, `/prompt`, `/history/{prompt_id}` and `/view` on an
//! ephemeral port. Behaviour is fixed up front with a [`Script`]; what
//! the client did is recorded and can be inspected afterwards.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use comfyrun_comfyui::api::ComfyUIApi;
use comfyrun_comfyui::client::{ComfyUIClient, ServerEndpoint};
use comfyrun_core::workflow::JobDescription;

/// Delay between answering `/prompt` and pushing the scripted frames, so
/// the client has registered its waiter by the time they arrive.
const EVENT_DELAY: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Script
// ---------------------------------------------------------------------------

/// A frame the fake pushes to every connected socket.
#[derive(Debug, Clone)]
pub enum Frame {
    Text(String),
    Close,
}

/// What the fake server answers.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub prompt_id: String,
    /// Pushed over the socket after a successful `/prompt`.
    pub events: Vec<Frame>,
    /// Answer `/prompt` with this status and JSON body instead.
    pub reject: Option<(StatusCode, Value)>,
    /// History entry for `prompt_id`; `None` answers `{}`.
    pub history: Option<Value>,
    /// Files served by `/view`; anything else is a 500.
    pub files: HashMap<String, Vec<u8>>,
    /// Use the client's proposed `prompt_id` instead of `prompt_id`.
    pub accept_proposed_id: bool,
    /// Push events before answering `/prompt`, as a fully cached
    /// prompt does.
    pub instant: bool,
}

impl Script {
    pub fn new(prompt_id: &str) -> Self {
        Self {
            prompt_id: prompt_id.to_string(),
            ..Self::default()
        }
    }

    pub fn event(mut self, text: String) -> Self {
        self.events.push(Frame::Text(text));
        self
    }

    pub fn close(mut self) -> Self {
        self.events.push(Frame::Close);
        self
    }

    /// Behave like a server that honours proposed prompt ids and
    /// finishes the prompt before `/prompt` has answered.
    pub fn cached(mut self) -> Self {
        self.accept_proposed_id = true;
        self.instant = true;
        self
    }

    pub fn reject(mut self, status: StatusCode, body: Value) -> Self {
        self.reject = Some((status, body));
        self
    }

    /// Executing `nodes` in order, then the terminal signal.
    pub fn runs(mut self, nodes: &[&str]) -> Self {
        let prompt_id = self.prompt_id.clone();
        for node in nodes {
            self = self.event(executing(&prompt_id, Some(node)));
        }
        self.event(executing(&prompt_id, None))
    }

    /// List `filename` as an output of `node_id` in the history. With
    /// `bytes` unset the file is listed but `/view` fails for it.
    pub fn output(mut self, node_id: &str, filename: &str, bytes: Option<&[u8]>) -> Self {
        let entry = self.history.get_or_insert_with(|| {
            json!({
                "prompt": [1, self.prompt_id, {}, {}, []],
                "outputs": {},
                "status": {"status_str": "success", "completed": true, "messages": []}
            })
        });
        let node = &mut entry["outputs"][node_id];
        if node.get("images").is_none() {
            *node = json!({"images": []});
        }
        if let Some(images) = node["images"].as_array_mut() {
            images.push(json!({"filename": filename, "subfolder": "", "type": "output"}));
        }
        if let Some(bytes) = bytes {
            self.files.insert(filename.to_string(), bytes.to_vec());
        }
        self
    }
}

/// Poll until `client` has noticed the socket is gone (at most 2 s).
pub async fn wait_for_disconnect(client: &ComfyUIClient) -> bool {
    for _ in 0..100 {
        if !client.is_connected().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

pub fn executing(prompt_id: &str, node: Option<&str>) -> String {
    json!({"type": "executing", "data": {"node": node, "prompt_id": prompt_id}}).to_string()
}

pub fn execution_error(prompt_id: &str, node_id: &str, message: &str) -> String {
    json!({
        "type": "execution_error",
        "data": {
            "prompt_id": prompt_id,
            "node_id": node_id,
            "node_type": "KSampler",
            "exception_message": message,
            "exception_type": "RuntimeError",
            "traceback": []
        }
    })
    .to_string()
}

// ---------------------------------------------------------------------------
// Recorded client behaviour
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct Recorded {
    pub handshakes: usize,
    pub close_frames: usize,
    pub client_ids: Vec<String>,
    pub prompts: Vec<Value>,
    /// Prompt ids handed out by `/prompt`.
    pub issued: Vec<String>,
}

struct FakeState {
    script: Script,
    recorded: Mutex<Recorded>,
    frames: broadcast::Sender<Frame>,
}

type Shared = Arc<FakeState>;

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

pub struct FakeServer {
    pub addr: SocketAddr,
    state: Shared,
    task: JoinHandle<()>,
}

impl FakeServer {
    pub async fn start(script: Script) -> Self {
        let (frames, _) = broadcast::channel(64);
        let state = Arc::new(FakeState {
            script,
            recorded: Mutex::new(Recorded::default()),
            frames,
        });

        let app = Router::new()
            .route("/ws", get(ws_handler))
            .route("/prompt", post(prompt_handler))
            .route("/history/{prompt_id}", get(history_handler))
            .route("/view", get(view_handler))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state, task }
    }

    pub fn endpoint(&self) -> ServerEndpoint {
        ServerEndpoint::new(self.addr.to_string(), false)
    }

    pub fn client(&self) -> ComfyUIClient {
        ComfyUIClient::from_endpoint(&self.endpoint())
    }

    pub fn recorded<R>(&self, f: impl FnOnce(&Recorded) -> R) -> R {
        f(&self.state.recorded.lock().unwrap())
    }

    pub fn handshakes(&self) -> usize {
        self.recorded(|r| r.handshakes)
    }

    pub fn close_frames(&self) -> usize {
        self.recorded(|r| r.close_frames)
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.recorded(|r| r.client_ids.clone())
    }

    pub fn prompts(&self) -> Vec<Value> {
        self.recorded(|r| r.prompts.clone())
    }

    /// Queue a one-node prompt for `client`, which triggers the script.
    pub async fn submit(&self, client: &ComfyUIClient) {
        let api = ComfyUIApi::new(client.api_url().to_string());
        let description = JobDescription::from_json(r#"{"3": {"inputs": {}}}"#).unwrap();
        api.submit_workflow(&description, client.client_id())
            .await
            .unwrap();
    }

    /// Poll until at least `n` close frames arrived (or 2 s passed), then
    /// give stragglers a moment and return the final count.
    pub async fn settle_close_frames(&self, n: usize) -> usize {
        for _ in 0..100 {
            if self.close_frames() >= n {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.close_frames()
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Shared>,
) -> impl IntoResponse {
    {
        let mut recorded = state.recorded.lock().unwrap();
        recorded.handshakes += 1;
        if let Some(client_id) = params.get("clientId") {
            recorded.client_ids.push(client_id.clone());
        }
    }
    let frames = state.frames.subscribe();
    ws.on_upgrade(move |socket| handle_socket(socket, state, frames))
}

async fn handle_socket(socket: WebSocket, state: Shared, mut frames: broadcast::Receiver<Frame>) {
    let (mut sink, mut stream) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Ok(frame) = frames.recv().await {
            let (message, closing) = match frame {
                Frame::Text(text) => (Message::Text(text.into()), false),
                Frame::Close => (Message::Close(None), true),
            };
            if sink.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Close(_)) => {
                state.recorded.lock().unwrap().close_frames += 1;
                break;
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }

    send_task.abort();
}

async fn prompt_handler(State(state): State<Shared>, Json(body): Json<Value>) -> Response {
    let script = &state.script;
    let proposed = body
        .get("prompt_id")
        .and_then(Value::as_str)
        .map(str::to_string);
    state.recorded.lock().unwrap().prompts.push(body);

    if let Some((status, payload)) = &script.reject {
        return (*status, Json(payload.clone())).into_response();
    }

    let prompt_id = match proposed {
        Some(id) if script.accept_proposed_id => id,
        _ => script.prompt_id.clone(),
    };
    state.recorded.lock().unwrap().issued.push(prompt_id.clone());

    let events: Vec<Frame> = script
        .events
        .iter()
        .map(|frame| match frame {
            Frame::Text(text) => Frame::Text(text.replace(&script.prompt_id, &prompt_id)),
            Frame::Close => Frame::Close,
        })
        .collect();

    if script.instant {
        for frame in events {
            let _ = state.frames.send(frame);
        }
        // Let the socket deliver them ahead of this response.
        tokio::time::sleep(Duration::from_millis(50)).await;
    } else {
        let frames = state.frames.clone();
        tokio::spawn(async move {
            tokio::time::sleep(EVENT_DELAY).await;
            for frame in events {
                let _ = frames.send(frame);
            }
        });
    }

    Json(json!({
        "prompt_id": prompt_id,
        "number": 1,
        "node_errors": {}
    }))
    .into_response()
}

async fn history_handler(State(state): State<Shared>, Path(prompt_id): Path<String>) -> Json<Value> {
    let mut history = serde_json::Map::new();
    if let Some(entry) = &state.script.history {
        let issued = state.recorded.lock().unwrap().issued.contains(&prompt_id);
        if prompt_id == state.script.prompt_id || issued {
            history.insert(prompt_id, entry.clone());
        }
    }
    Json(Value::Object(history))
}

async fn view_handler(
    State(state): State<Shared>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let filename = params.get("filename").cloned().unwrap_or_default();
    match state.script.files.get(&filename) {
        Some(bytes) => bytes.clone().into_response(),
        None => (StatusCode::INTERNAL_SERVER_ERROR, "file unavailable").into_response(),
    }
}
