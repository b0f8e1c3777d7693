//! RealtimeHub - WebSocket distribution
//!
//! ## Responsibilities
//!
//! - WebSocket connection management
//! - Event transition broadcasting (opened / extended / closed)
//! - Stream status notifications (started / stopped / errored)
//!
//! Delivery to a client is fire-and-forget; a client whose channel is gone
//! is skipped and removed when its socket task unregisters.

use crate::models::{EventTransition, TransitionKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Hub message types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum HubMessage {
    EventOpened(EventTransition),
    EventExtended(EventTransition),
    EventClosed(EventTransition),
    StreamStatus(StreamStatusMessage),
}

impl HubMessage {
    pub fn from_transition(transition: EventTransition) -> Self {
        match transition.kind {
            TransitionKind::Opened => Self::EventOpened(transition),
            TransitionKind::Extended => Self::EventExtended(transition),
            TransitionKind::Closed => Self::EventClosed(transition),
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Self::EventOpened(_) => "event_opened",
            Self::EventExtended(_) => "event_extended",
            Self::EventClosed(_) => "event_closed",
            Self::StreamStatus(_) => "stream_status",
        }
    }
}

/// Stream lifecycle notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamStatusMessage {
    pub source_id: String,
    /// "running" | "stopped" | "errored"
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: String,
}

/// Client connection
struct ClientConnection {
    peer: String,
    tx: mpsc::UnboundedSender<String>,
}

/// RealtimeHub instance
pub struct RealtimeHub {
    connections: RwLock<HashMap<Uuid, ClientConnection>>,
    connection_count: AtomicU64,
}

impl RealtimeHub {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            connection_count: AtomicU64::new(0),
        }
    }

    /// Register a new client
    pub async fn register(&self, peer: String) -> (Uuid, mpsc::UnboundedReceiver<String>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        {
            let mut connections = self.connections.write().await;
            connections.insert(id, ClientConnection { peer: peer.clone(), tx });
        }

        self.connection_count.fetch_add(1, Ordering::Relaxed);
        tracing::info!(connection_id = %id, peer = %peer, "Client connected");

        (id, rx)
    }

    /// Unregister a client
    pub async fn unregister(&self, id: &Uuid) {
        let mut connections = self.connections.write().await;
        if let Some(conn) = connections.remove(id) {
            self.connection_count.fetch_sub(1, Ordering::Relaxed);
            tracing::info!(connection_id = %id, peer = %conn.peer, "Client disconnected");
        }
    }

    /// Broadcast a message; returns the number of clients it reached
    pub async fn broadcast(&self, message: HubMessage) -> usize {
        let msg_type = message.type_name();

        let json = match serde_json::to_string(&message) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize message");
                return 0;
            }
        };

        let connections = self.connections.read().await;
        tracing::debug!(
            message_type = %msg_type,
            client_count = connections.len(),
            "Broadcasting message to clients"
        );

        let mut delivered = 0;
        for (id, conn) in connections.iter() {
            match conn.tx.send(json.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(connection_id = %id, error = %e, "Failed to send message")
                }
            }
        }
        delivered
    }

    pub fn connection_count(&self) -> u64 {
        self.connection_count.load(Ordering::Relaxed)
    }
}

impl Default for RealtimeHub {
    fn default() -> Self {
        Self::new()
    }
}
