//! Client connection abstraction.
//!
//! The channel only ever sees `send(event, data)` / `close()`; the
//! production implementation feeds an HTTP response body, the recording
//! implementation backs the test suite.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value as JsonValue;
use tokio::sync::mpsc;

/// Write failure on a client connection.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    #[error("client disconnected: {0}")]
    Disconnected(String),
}

/// One live client connection.
pub trait RealtimeClient: Send + Sync {
    /// Write one SSE frame. Must not block.
    fn send(&self, event: &str, data: &JsonValue) -> Result<(), ClientError>;

    /// Tear the transport down.
    fn close(&self);
}

/// Wire format: `event: <name>\ndata: <json>\n\n`.
pub fn sse_frame(event: &str, data: &JsonValue) -> String {
    format!("event: {event}\ndata: {data}\n\n")
}

/// Production client: pushes formatted frames into an unbounded channel
/// whose receiver is streamed out as the HTTP response body.
pub struct ChannelClient {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelClient {
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }
}

impl RealtimeClient for ChannelClient {
    fn send(&self, event: &str, data: &JsonValue) -> Result<(), ClientError> {
        self.tx
            .send(sse_frame(event, data))
            .map_err(|_| ClientError::Disconnected("response stream dropped".to_string()))
    }

    fn close(&self) {
        // Dropping the last sender ends the response stream; the registry
        // owns that drop, so there is nothing to tear down here.
    }
}

/// Test client: records every frame, optionally failing on demand.
#[derive(Debug, Default)]
pub struct RecordingClient {
    frames: Mutex<Vec<(String, JsonValue)>>,
    failing: AtomicBool,
    closed: AtomicBool,
}

impl RecordingClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// All frames sent so far, as (event, data) pairs.
    pub fn frames(&self) -> Vec<(String, JsonValue)> {
        self.frames.lock().unwrap().clone()
    }

    /// Frames with the given event name.
    pub fn frames_named(&self, event: &str) -> Vec<JsonValue> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == event)
            .map(|(_, data)| data.clone())
            .collect()
    }

    /// Make every subsequent `send` fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl RealtimeClient for RecordingClient {
    fn send(&self, event: &str, data: &JsonValue) -> Result<(), ClientError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ClientError::Disconnected("induced failure".to_string()));
        }
        self.frames
            .lock()
            .unwrap()
            .push((event.to_string(), data.clone()));
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
