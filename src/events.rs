//! Topic-keyed event dispatch.
//!
//! The hub surfaces everything that happens on a connection as events under
//! string topics: the lifecycle topics `open`, `close` and `error`, plus one
//! message topic per connection derived from the request path (`message`
//! when the path is `/`). Topic names are only known at runtime, so
//! listeners are held in a map keyed by topic string.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::close::CloseReason;

/// Lifecycle topic for accepted connections.
pub const TOPIC_OPEN: &str = "open";
/// Lifecycle topic for terminated connections.
pub const TOPIC_CLOSE: &str = "close";
/// Lifecycle topic for transport failures.
pub const TOPIC_ERROR: &str = "error";
/// Message topic used when the request path is `/`.
pub const TOPIC_DEFAULT: &str = "message";

/// An application message, already decoded according to the connection's
/// text encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Bytes),
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Text(value.to_owned())
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Text(value)
    }
}

impl From<Bytes> for Payload {
    fn from(value: Bytes) -> Self {
        Payload::Binary(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Payload::Binary(value.into())
    }
}

/// An event delivered to topic listeners, always together with the id of
/// the client it concerns.
#[derive(Debug, Clone)]
pub enum Event {
    /// The handshake completed and the client is registered.
    Open,
    /// The connection terminated with the given reason.
    Close(CloseReason),
    /// The transport failed; the close event follows.
    Error(String),
    /// An application message arrived on the connection's topic.
    Message(Payload),
}

type Listener = Arc<dyn Fn(&str, &Event) + Send + Sync + 'static>;

/// Listener registry keyed by topic string.
#[derive(Default)]
pub struct Emitter {
    listeners: Mutex<HashMap<String, Vec<Listener>>>,
}

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener under `topic`. The listener receives the client
    /// id and the event.
    pub fn on<F>(&self, topic: impl Into<String>, listener: F)
    where
        F: Fn(&str, &Event) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.lock().expect("listener map poisoned");
        listeners
            .entry(topic.into())
            .or_default()
            .push(Arc::new(listener));
    }

    /// Dispatches `event` to every listener of `topic`.
    ///
    /// Listeners are cloned out of the map before invocation so a listener
    /// may register further listeners without deadlocking.
    pub(crate) fn emit(&self, topic: &str, id: &str, event: &Event) {
        let snapshot: Vec<Listener> = {
            let listeners = self.listeners.lock().expect("listener map poisoned");
            match listeners.get(topic) {
                Some(list) => list.clone(),
                None => return,
            }
        };

        for listener in snapshot {
            listener(id, event);
        }
    }
}
