//! Event types for the batch progress channel
//!
//! Provides the wire messages pushed to WebSocket clients and the EventBus that
//! carries batch store mutations to the progress broadcaster.

use crate::batch::{BatchStatus, ProgressCounts};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Batch progress events
///
/// Published by the batch store on every mutation and forwarded verbatim to every
/// connection subscribed to `batch_id`. Serialized with an `event` tag:
/// `{"event": "progress", "batch_id": ..., ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum BatchEvent {
    /// Counters changed after an item result was applied
    Progress {
        batch_id: String,
        processed: u64,
        total: u64,
        valid: u64,
        invalid: u64,
        /// 0.0 - 100.0
        percentage: f64,
        timestamp: DateTime<Utc>,
    },

    /// Batch reached COMPLETE. Sent once, after which the batch is unsubscribed.
    Complete {
        batch_id: String,
        processed: u64,
        total: u64,
        valid: u64,
        invalid: u64,
        percentage: f64,
        status: BatchStatus,
        timestamp: DateTime<Utc>,
    },

    /// Unrecoverable batch-level failure (batch moved to FAILED)
    Error {
        batch_id: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

impl BatchEvent {
    pub fn progress(batch_id: impl Into<String>, counts: ProgressCounts) -> Self {
        BatchEvent::Progress {
            batch_id: batch_id.into(),
            processed: counts.processed,
            total: counts.total,
            valid: counts.valid,
            invalid: counts.invalid,
            percentage: counts.percentage(),
            timestamp: Utc::now(),
        }
    }

    pub fn complete(batch_id: impl Into<String>, counts: ProgressCounts) -> Self {
        BatchEvent::Complete {
            batch_id: batch_id.into(),
            processed: counts.processed,
            total: counts.total,
            valid: counts.valid,
            invalid: counts.invalid,
            percentage: counts.percentage(),
            status: BatchStatus::Complete,
            timestamp: Utc::now(),
        }
    }

    pub fn error(batch_id: impl Into<String>, error: impl Into<String>) -> Self {
        BatchEvent::Error {
            batch_id: batch_id.into(),
            error: error.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn batch_id(&self) -> &str {
        match self {
            BatchEvent::Progress { batch_id, .. }
            | BatchEvent::Complete { batch_id, .. }
            | BatchEvent::Error { batch_id, .. } => batch_id,
        }
    }

    /// Complete and Error end the batch's subscriptions
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchEvent::Complete { .. } | BatchEvent::Error { .. })
    }

    /// Processed count of a progress event; None for terminal events
    pub fn processed(&self) -> Option<u64> {
        match self {
            BatchEvent::Progress { processed, .. } => Some(*processed),
            BatchEvent::Complete { .. } | BatchEvent::Error { .. } => None,
        }
    }

    /// Get event type as string (for logging)
    pub fn event_type(&self) -> &'static str {
        match self {
            BatchEvent::Progress { .. } => "progress",
            BatchEvent::Complete { .. } => "complete",
            BatchEvent::Error { .. } => "error",
        }
    }
}

/// Connection lifecycle notices, tagged with `message`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message", rename_all = "lowercase")]
pub enum ConnectionNotice {
    /// First connection for this client id (or after abandonment)
    Connected { client_id: String },

    /// Same client id reattached; lists subscribed batches still in progress
    Reconnected { recovered_batches: Vec<String> },
}

/// Server-initiated liveness probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum LivenessProbe {
    Ping { timestamp: DateTime<Utc> },
}

/// Everything the server pushes down a client connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Notice(ConnectionNotice),
    Batch(BatchEvent),
    Probe(LivenessProbe),
}

impl ServerMessage {
    pub fn ping() -> Self {
        ServerMessage::Probe(LivenessProbe::Ping {
            timestamp: Utc::now(),
        })
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl From<BatchEvent> for ServerMessage {
    fn from(event: BatchEvent) -> Self {
        ServerMessage::Batch(event)
    }
}

impl From<ConnectionNotice> for ServerMessage {
    fn from(notice: ConnectionNotice) -> Self {
        ServerMessage::Notice(notice)
    }
}

/// Messages a client may send up its connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Answer to a server ping
    Pong,
    /// Explicit keep-alive, accepted any time
    Heartbeat,
    /// Attach this connection to another batch
    Subscribe { batch_id: String },
}

impl ClientMessage {
    /// Parse a text frame. Accepts JSON (`{"event": "pong"}`) or the bare words
    /// `pong` / `heartbeat`.
    pub fn parse(text: &str) -> Option<Self> {
        let trimmed = text.trim();
        match trimmed {
            "pong" => return Some(ClientMessage::Pong),
            "heartbeat" => return Some(ClientMessage::Heartbeat),
            _ => {}
        }
        serde_json::from_str(trimmed).ok()
    }
}

// ========================================
// EventBus Implementation
// ========================================

/// Central distribution bus for batch store mutations
///
/// Uses tokio::broadcast internally:
/// - Non-blocking publish (a slow broadcaster never blocks the dispatcher)
/// - Multiple concurrent subscribers
/// - Lagged message detection for slow subscribers
///
/// Lagging is tolerable because every event carries absolute counters; a
/// subscriber that lags resynchronizes from the store.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BatchEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: BatchEvent,
    ) -> Result<usize, broadcast::error::SendError<BatchEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: BatchEvent) {
        if let Err(e) = self.tx.send(event) {
            tracing::debug!(event = e.0.event_type(), batch_id = %e.0.batch_id(), "No subscribers for batch event");
        }
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
