//! Agent events fanned out to subscribed connections.
//!
//! Checkpoint, rotation, and handoff components report progress through
//! [`EventPublisher`]. The [`ConnectionRegistry`](crate::transport::registry::ConnectionRegistry)
//! is the production implementation; it routes each event to connections
//! subscribed to its agent (or in broadcast mode).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A progress or lifecycle event scoped to one agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentEvent {
    /// Agent the event is about; drives subscription routing.
    pub agent_id: String,
    /// Event name, e.g. `auto_checkpoint_created`.
    pub event: String,
    /// Event-specific payload.
    pub data: serde_json::Value,
    /// When the event was produced.
    pub timestamp: DateTime<Utc>,
}

impl AgentEvent {
    /// Build an event stamped now.
    #[must_use]
    pub fn new(agent_id: impl Into<String>, event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            agent_id: agent_id.into(),
            event: event.into(),
            data,
            timestamp: Utc::now(),
        }
    }
}

/// Sink for agent events.
///
/// Implementations must not block; slow consumers are handled downstream
/// by bounded per-connection queues.
pub trait EventPublisher: Send + Sync {
    /// Deliver `event`, returning how many consumers accepted it.
    fn publish(&self, event: AgentEvent) -> usize;
}
