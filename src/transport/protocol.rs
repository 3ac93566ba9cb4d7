//! Application-level message protocol layered on the duplex connection.
//!
//! ## Inbound
//!
//! | `type`          | Payload                                 |
//! |-----------------|-----------------------------------------|
//! | `subscribe`     | `agentId?: string`, `agentIds?: string[]` |
//! | `unsubscribe`   | `agentId: string`                       |
//! | `subscribe_all` | (none)                                  |
//! | `ping`          | (none)                                  |
//!
//! ## Outbound
//!
//! Replies (`connected`, `subscribed`, `unsubscribed`, `subscribed_all`,
//! `pong`, `error`), flow-control signals (`PAUSE`, `RESUME`, `ACK`,
//! `SLOW_DOWN`) and fanned-out `agent_event` frames. All frames are JSON
//! text.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::AgentEvent;

/// Reply text for frames that are not valid JSON.
pub const INVALID_JSON_MESSAGE: &str = "Invalid JSON message";

/// A client command, one variant per recognised `type`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientCommand {
    /// Add one or many agent ids to the subscription set.
    Subscribe {
        /// Single agent id.
        #[serde(default)]
        agent_id: Option<String>,
        /// Several agent ids.
        #[serde(default)]
        agent_ids: Option<Vec<String>>,
    },
    /// Remove one agent id.
    Unsubscribe {
        /// Agent id to drop.
        agent_id: String,
    },
    /// Clear the set and receive every agent's events.
    SubscribeAll,
    /// Liveness probe.
    Ping,
}

const KNOWN_COMMANDS: [&str; 4] = ["subscribe", "unsubscribe", "subscribe_all", "ping"];

/// Why an inbound frame could not be turned into a [`ClientCommand`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Not UTF-8 or not JSON.
    InvalidJson,
    /// `type` missing or not recognised; carries the offending value.
    UnknownType(String),
    /// Recognised `type` with a malformed payload.
    InvalidPayload {
        /// Command type.
        command: String,
        /// Deserializer detail.
        detail: String,
    },
}

impl ProtocolError {
    /// Text carried by the `error` reply.
    #[must_use]
    pub fn reply_message(&self) -> String {
        match self {
            Self::InvalidJson => INVALID_JSON_MESSAGE.to_owned(),
            Self::UnknownType(kind) => format!("Unknown message type: {kind}"),
            Self::InvalidPayload { command, .. } => format!("Invalid {command} message"),
        }
    }
}

impl ClientCommand {
    /// Decode a raw frame. Byte frames are decoded as UTF-8 first.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] describing why the frame was refused.
    pub fn parse(raw: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(raw).map_err(|_| ProtocolError::InvalidJson)?;
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|_| ProtocolError::InvalidJson)?;

        let kind = match value.get("type") {
            Some(serde_json::Value::String(kind)) => kind.clone(),
            Some(other) => other.to_string(),
            None => "undefined".to_owned(),
        };

        if !KNOWN_COMMANDS.contains(&kind.as_str()) {
            return Err(ProtocolError::UnknownType(kind));
        }

        serde_json::from_value(value).map_err(|err| ProtocolError::InvalidPayload {
            command: kind,
            detail: err.to_string(),
        })
    }
}

/// Optional values attached to flow-control signals.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FlowMetadata {
    /// Outbound queue depth at signal time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_depth: Option<usize>,
    /// Number of commands acknowledged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_count: Option<u64>,
    /// Advisory send rate, messages per second.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_rate: Option<u32>,
}

/// Every frame the server sends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// First frame on every connection.
    Connected {
        /// Identifier allocated for this connection.
        connection_id: String,
        /// Open time.
        timestamp: DateTime<Utc>,
    },
    /// Subscription set after a `subscribe`.
    Subscribed {
        /// Full current set, sorted.
        agent_ids: Vec<String>,
    },
    /// Reply to `unsubscribe`.
    Unsubscribed,
    /// Reply to `subscribe_all`.
    SubscribedAll,
    /// Reply to `ping`.
    Pong,
    /// Protocol error; the connection stays open.
    Error {
        /// Human-readable reason.
        message: String,
    },
    /// Sender should stop until `RESUME`.
    #[serde(rename = "PAUSE")]
    Pause {
        /// Signal metadata.
        metadata: FlowMetadata,
    },
    /// Sender may continue.
    #[serde(rename = "RESUME")]
    Resume {
        /// Signal metadata.
        metadata: FlowMetadata,
    },
    /// Commands processed.
    #[serde(rename = "ACK")]
    Ack {
        /// Signal metadata.
        metadata: FlowMetadata,
    },
    /// Advisory rate reduction.
    #[serde(rename = "SLOW_DOWN")]
    SlowDown {
        /// Signal metadata.
        metadata: FlowMetadata,
    },
    /// Fanned-out agent event.
    AgentEvent {
        /// Agent the event is about.
        agent_id: String,
        /// Event name.
        event: String,
        /// Event payload.
        data: serde_json::Value,
        /// Production time.
        timestamp: DateTime<Utc>,
    },
}

impl ServerMessage {
    /// Build an `error` reply.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Whether this frame is a flow-control signal.
    #[must_use]
    pub fn is_flow_signal(&self) -> bool {
        matches!(
            self,
            Self::Pause { .. } | Self::Resume { .. } | Self::Ack { .. } | Self::SlowDown { .. }
        )
    }

    /// Serialize to a JSON text frame.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"error","message":"serialization failed"}"#.to_owned()
        })
    }
}

impl From<AgentEvent> for ServerMessage {
    fn from(event: AgentEvent) -> Self {
        Self::AgentEvent {
            agent_id: event.agent_id,
            event: event.event,
            data: event.data,
            timestamp: event.timestamp,
        }
    }
}

/// Allocate a connection id of the form `ws_<epoch-millis>_<random-base36>`.
#[must_use]
pub fn new_connection_id() -> String {
    let millis = Utc::now().timestamp_millis();
    let random = Uuid::new_v4().as_u128();
    format!("ws_{millis}_{}", to_base36(random, 9))
}

/// Render the low digits of `value` in base 36, left-padded to `width`.
#[allow(clippy::cast_possible_truncation)] // remainder is always below 36
fn to_base36(mut value: u128, width: usize) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut out = vec![b'0'; width];
    for slot in out.iter_mut().rev() {
        *slot = DIGITS[(value % 36) as usize];
        value /= 36;
    }
    String::from_utf8_lossy(&out).into_owned()
}
