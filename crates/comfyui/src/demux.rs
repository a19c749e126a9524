//! Routes parsed ComfyUI messages to whichever wait is listening.
//!
//! One connection feeds one [`Demultiplexer`]. Waits register a
//! predicate and receive a one-shot channel; every dispatched message
//! resolves at most one listener (the oldest whose predicate matches),
//! and that listener is removed in the same critical section, so it can
//! never fire twice or after it was unregistered.
//!
//! Once the connection ends the demultiplexer is closed: pending
//! listeners are dropped and new ones are refused (their receiver
//! reports a closed channel at once) until the next connection reopens
//! it.
//!
//! Every parsed message is also fanned out on a
//! [`tokio::sync::broadcast`] channel for observers (progress display).
//! Call [`Demultiplexer::subscribe`] to receive them.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, oneshot};

use crate::messages::{parse_message, ComfyUIMessage};

/// Broadcast channel capacity for observed messages.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Handle returned by [`Demultiplexer::register`].
pub type ListenerId = u64;

type Predicate = Box<dyn Fn(&ComfyUIMessage) -> bool + Send + Sync>;

struct Listener {
    predicate: Predicate,
    tx: oneshot::Sender<ComfyUIMessage>,
}

/// Listeners ordered by registration (ids only ever increase).
#[derive(Default)]
struct Registry {
    next_id: ListenerId,
    listeners: BTreeMap<ListenerId, Listener>,
    closed: bool,
}

pub struct Demultiplexer {
    registry: Mutex<Registry>,
    event_tx: broadcast::Sender<ComfyUIMessage>,
}

impl Default for Demultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

impl Demultiplexer {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            registry: Mutex::new(Registry::default()),
            event_tx,
        }
    }

    /// Register a listener that resolves on the first message matching
    /// `predicate`.
    ///
    /// While closed, the listener is not stored and the returned receiver
    /// is already closed.
    pub fn register<F>(&self, predicate: F) -> (ListenerId, oneshot::Receiver<ComfyUIMessage>)
    where
        F: Fn(&ComfyUIMessage) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let mut registry = self.registry();
        let id = registry.next_id;
        registry.next_id += 1;
        if registry.closed {
            tracing::debug!(listener = id, "No connection, listener refused");
            return (id, rx);
        }
        registry.listeners.insert(
            id,
            Listener {
                predicate: Box::new(predicate),
                tx,
            },
        );
        (id, rx)
    }

    /// Remove a listener.
    ///
    /// Returns `false` when the listener no longer exists, i.e. it was
    /// already resolved by a dispatch or dropped by
    /// [`close_listeners`](Self::close_listeners).
    pub fn unregister(&self, id: ListenerId) -> bool {
        self.registry().listeners.remove(&id).is_some()
    }

    /// Number of listeners still waiting.
    pub fn listener_count(&self) -> usize {
        self.registry().listeners.len()
    }

    /// Subscribe to every message dispatched from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ComfyUIMessage> {
        self.event_tx.subscribe()
    }

    /// Route one message.
    ///
    /// Resolves the oldest live listener whose predicate matches and
    /// returns whether one was resolved. Listeners whose receiver has
    /// been dropped are discarded first.
    pub fn dispatch(&self, message: ComfyUIMessage) -> bool {
        // Zero subscribers is the common case.
        let _ = self.event_tx.send(message.clone());

        let mut registry = self.registry();
        registry.listeners.retain(|_, l| !l.tx.is_closed());

        let matched = registry
            .listeners
            .iter()
            .find(|(_, l)| (l.predicate)(&message))
            .map(|(id, _)| *id);

        match matched.and_then(|id| registry.listeners.remove(&id)) {
            // Sent while the lock is held: an unregister racing this
            // dispatch either removes the listener first or observes the
            // delivered message.
            Some(listener) => listener.tx.send(message).is_ok(),
            None => false,
        }
    }

    /// Parse a raw text frame and route it.
    pub fn dispatch_text(&self, text: &str) -> Result<bool, serde_json::Error> {
        Ok(self.dispatch(parse_message(text)?))
    }

    /// Drop every pending listener and refuse new ones until
    /// [`reopen`](Self::reopen).
    ///
    /// Called when the connection ends; waiting receivers observe a
    /// closed channel instead of hanging until their deadline.
    pub fn close_listeners(&self) {
        let dropped = {
            let mut registry = self.registry();
            registry.closed = true;
            std::mem::take(&mut registry.listeners)
        };
        if !dropped.is_empty() {
            tracing::debug!(count = dropped.len(), "Dropped pending listeners");
        }
    }

    /// Accept listeners again. Called when a new connection is up.
    pub fn reopen(&self) {
        self.registry().closed = false;
    }

    pub fn is_closed(&self) -> bool {
        self.registry().closed
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
