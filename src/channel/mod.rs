//! Control channel abstraction.
//!
//! The agent holds exactly one message-oriented WebSocket session to the
//! control plane. Messages are JSON objects framed one per WebSocket text
//! frame, each carrying a `type` tag, a generated `id`, an ISO-8601
//! `timestamp` and a `data` object.
//!
//! # Architecture
//!
//! ```text
//! ControlChannel
//!     ├── WebSocket connection (tokio-tungstenite, optional mutual TLS)
//!     ├── writer task        (single-writer discipline over an mpsc queue)
//!     ├── reader task        (correlation + handler dispatch)
//!     ├── heartbeat sender   (fixed cadence)
//!     └── heartbeat monitor  (staleness detection, forces reconnect)
//! ```

pub mod client;
pub mod tls;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::RwLock;
use uuid::Uuid;

/// One JSON message on the control stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    /// Creates a message of `msg_type` with the given `data` payload.
    /// `id` and `timestamp` are stamped at send time if still absent.
    pub fn new(msg_type: &str, data: Value) -> Self {
        Self {
            msg_type: msg_type.to_string(),
            id: None,
            timestamp: None,
            data,
        }
    }

    /// Fills in `id` and `timestamp` if the caller left them unset.
    pub fn stamp(&mut self) {
        if self.id.is_none() {
            self.id = Some(Uuid::new_v4());
        }
        if self.timestamp.is_none() {
            self.timestamp = Some(chrono::Utc::now().to_rfc3339());
        }
    }

    /// The `data` payload as an object map, if it is one.
    pub fn data_object(&self) -> Option<&Map<String, Value>> {
        self.data.as_object()
    }
}

/// Connection state for the control channel.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not connected.
    #[default]
    Disconnected,
    /// TCP/TLS/WebSocket handshake in progress.
    Connecting,
    /// Stream open, auth handshake not yet complete.
    Connected,
    /// Authenticated session with zero missed heartbeats.
    Authenticated,
    /// Authenticated but one or more heartbeats have been missed.
    Degraded {
        /// Consecutive misses observed by the monitor.
        missed_heartbeats: u32,
    },
}

/// Shared connection state observable from outside the channel.
#[derive(Debug, Default)]
pub struct SharedConnectionState {
    state: RwLock<ConnectionState>,
}

impl SharedConnectionState {
    pub fn get(&self) -> ConnectionState {
        self.state.read().expect("state lock poisoned").clone()
    }

    pub fn set(&self, new_state: ConnectionState) {
        *self.state.write().expect("state lock poisoned") = new_state;
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(
            self.get(),
            ConnectionState::Authenticated | ConnectionState::Degraded { .. }
        )
    }
}

/// Server-assigned session identity, valid for one authenticated connection.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub auth_token: String,
}

/// Point-in-time channel statistics for the `status` command.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStats {
    pub connected: bool,
    pub authenticated: bool,
    pub session_id: Option<String>,
    pub last_heartbeat_sent: Option<String>,
    pub last_heartbeat_received: Option<String>,
    pub missed_heartbeats: u32,
    pub reconnect_attempts: u32,
}

/// Errors surfaced by channel operations.
#[derive(Debug)]
pub enum ChannelError {
    /// Failed to establish the WebSocket connection.
    ConnectionFailed(String),
    /// The auth handshake was rejected or timed out.
    AuthenticationFailed(String),
    /// Failed to enqueue or write a message.
    SendFailed(String),
    /// A request/response wait expired.
    Timeout,
    /// The channel is closed.
    Closed,
    /// Reconnection attempts exhausted the configured cap.
    ReconnectExhausted(u32),
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionFailed(msg) => write!(f, "Connection failed: {msg}"),
            Self::AuthenticationFailed(msg) => write!(f, "Authentication failed: {msg}"),
            Self::SendFailed(msg) => write!(f, "Send failed: {msg}"),
            Self::Timeout => write!(f, "Operation timed out"),
            Self::Closed => write!(f, "Channel closed"),
            Self::ReconnectExhausted(attempts) => {
                write!(f, "Reconnect attempts exhausted after {attempts} tries")
            }
        }
    }
}

impl std::error::Error for ChannelError {}

// Re-exports
pub use client::{ControlChannel, ControlChannelBuilder, MessageHandler};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_stamp_fills_missing_fields() {
        let mut envelope = Envelope::new("heartbeat", serde_json::json!({"agent_id": "a"}));
        assert!(envelope.id.is_none());
        envelope.stamp();
        assert!(envelope.id.is_some());
        assert!(envelope.timestamp.is_some());

        // Stamping again keeps the original id.
        let id = envelope.id;
        envelope.stamp();
        assert_eq!(envelope.id, id);
    }

    #[test]
    fn test_envelope_wire_round_trip() {
        let mut envelope = Envelope::new("task_assign_response", serde_json::json!({"status": "accepted"}));
        envelope.stamp();

        let wire = serde_json::to_string(&envelope).unwrap();
        assert!(wire.contains("\"type\":\"task_assign_response\""));

        let parsed: Envelope = serde_json::from_str(&wire).unwrap();
        assert_eq!(parsed.msg_type, "task_assign_response");
        assert_eq!(parsed.id, envelope.id);
        assert_eq!(parsed.data["status"], "accepted");
    }

    #[test]
    fn test_shared_state_transitions() {
        let state = SharedConnectionState::default();
        assert_eq!(state.get(), ConnectionState::Disconnected);
        assert!(!state.is_authenticated());

        state.set(ConnectionState::Authenticated);
        assert!(state.is_authenticated());

        state.set(ConnectionState::Degraded { missed_heartbeats: 2 });
        assert!(state.is_authenticated());

        state.set(ConnectionState::Disconnected);
        assert!(!state.is_authenticated());
    }
}
