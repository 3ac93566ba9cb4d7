//! Agent launch configuration used by rotation.

use serde::{Deserialize, Serialize};

use super::checkpoint::TokenUsage;

/// Launch configuration handed to [`AgentHandlers::spawn_agent`](crate::orchestrator::rotation::AgentHandlers::spawn_agent).
///
/// Rotation always spawns the replacement from this configuration; restored
/// state is injected afterwards.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct AgentConfig {
    /// Display name.
    pub name: String,
    /// Model identifier the agent runs on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// System prompt applied at boot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Working directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_root: Option<String>,
    /// Driver-specific settings.
    #[serde(default)]
    pub extra: serde_json::Value,
}

/// A running agent and the configuration it was launched with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct AgentDescriptor {
    /// Running agent identifier.
    pub agent_id: String,
    /// Original launch configuration.
    pub config: AgentConfig,
    /// Last token usage reported by the agent.
    #[serde(default)]
    pub token_usage: TokenUsage,
}

impl AgentDescriptor {
    /// Descriptor with zero token usage.
    #[must_use]
    pub fn new(agent_id: impl Into<String>, config: AgentConfig) -> Self {
        Self {
            agent_id: agent_id.into(),
            config,
            token_usage: TokenUsage::default(),
        }
    }
}

/// Result of a successful spawn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SpawnedAgent {
    /// Identifier of the new agent process.
    pub agent_id: String,
}
