//! Typed channel for backend egress messages
//!
//! Provides a non-blocking way to hand session snapshots and event log lines
//! to the backend publisher. Uses a bounded mpsc channel so a slow or dead
//! backend can never stall the tracker; when full, messages are dropped and
//! counted.

use crate::domain::cart::Cart;
use crate::domain::types::{SessionStatus, TrackId};
use crate::infra::metrics::Metrics;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Messages that can be sent to the backend publisher
#[derive(Debug, Clone, PartialEq)]
pub enum EgressMessage {
    /// Full session snapshot (`POST /sessions/update`)
    Session(SessionPayload),
    /// Human-readable event line (`POST /events`)
    Event(EventPayload),
}

impl EgressMessage {
    pub fn as_str(&self) -> &'static str {
        match self {
            EgressMessage::Session(_) => "session",
            EgressMessage::Event(_) => "event",
        }
    }
}

/// Session snapshot; the backend replaces cart and status wholesale
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionPayload {
    pub session_id: String,
    pub cart: BTreeMap<String, u32>,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    /// RFC 3339 UTC
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventPayload {
    pub message: String,
    /// RFC 3339 UTC
    pub timestamp: String,
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Sender handle for egress messages
///
/// Clone this to share across multiple producers.
/// Non-blocking - if the channel is full, messages are dropped.
#[derive(Clone)]
pub struct EgressSender {
    tx: mpsc::Sender<EgressMessage>,
    metrics: Arc<Metrics>,
}

impl EgressSender {
    pub fn new(tx: mpsc::Sender<EgressMessage>, metrics: Arc<Metrics>) -> Self {
        Self { tx, metrics }
    }

    fn send(&self, msg: EgressMessage) {
        let kind = msg.as_str();
        if self.tx.try_send(msg).is_err() {
            self.metrics.record_egress_dropped();
            debug!(kind = %kind, "egress_dropped");
        }
    }

    /// Publish the full session state for a track
    pub fn publish_session(
        &self,
        track_id: TrackId,
        cart: &Cart,
        status: SessionStatus,
        customer: Option<(&str, &str)>,
    ) {
        let payload = SessionPayload {
            session_id: track_id.to_string(),
            cart: cart.to_map(),
            status,
            customer_name: customer.map(|(_, name)| name.to_string()),
            customer_id: customer.map(|(id, _)| id.to_string()),
            timestamp: now_rfc3339(),
        };
        self.send(EgressMessage::Session(payload));
    }

    /// Append a line to the backend event log
    pub fn post_event(&self, message: impl Into<String>) {
        let payload = EventPayload { message: message.into(), timestamp: now_rfc3339() };
        self.send(EgressMessage::Event(payload));
    }
}

/// Create a new egress channel pair
///
/// Returns (sender, receiver) where sender can be cloned and shared.
/// Buffer size determines how many messages can be queued.
pub fn create_egress_channel(
    buffer_size: usize,
    metrics: Arc<Metrics>,
) -> (EgressSender, mpsc::Receiver<EgressMessage>) {
    let (tx, rx) = mpsc::channel(buffer_size);
    (EgressSender::new(tx, metrics), rx)
}
