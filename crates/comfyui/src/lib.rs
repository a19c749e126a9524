//! ComfyUI WebSocket and REST client library.
//!
//! Provides typed message parsing, WebSocket connection management,
//! event demultiplexing, HTTP API wrappers, completion waiting, artifact
//! retrieval and the [`runner::JobRunner`] that ties them together to
//! run one job against a ComfyUI image-generation server.

pub mod api;
pub mod client;
pub mod config;
pub mod demux;
pub mod fetcher;
pub mod messages;
pub mod processor;
pub mod runner;
pub mod waiter;
