//! Checkpoint model for agent state snapshots.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One record of an agent's conversation history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ConversationMessage {
    /// Speaker role (`system`, `user`, `assistant`, `tool`).
    pub role: String,
    /// Message body.
    pub content: String,
    /// When the message was produced, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ConversationMessage {
    /// Construct a message without a timestamp.
    #[must_use]
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            timestamp: None,
        }
    }
}

/// Prompt/completion/total token counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TokenUsage {
    /// Tokens consumed by prompts.
    pub prompt_tokens: u64,
    /// Tokens produced by completions.
    pub completion_tokens: u64,
    /// Cumulative total.
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Build a usage triple whose total is the saturating sum of both parts.
    #[must_use]
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

/// Point-in-time view of everything needed to resume an agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct StateSnapshot {
    /// Ordered conversation history, oldest first.
    pub conversation_history: Vec<ConversationMessage>,
    /// Opaque tool state.
    #[serde(default)]
    pub tool_state: serde_json::Map<String, serde_json::Value>,
    /// Token usage at snapshot time.
    #[serde(default)]
    pub token_usage: TokenUsage,
    /// Auxiliary context artifact such as a rolling summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_artifact: Option<String>,
}

/// Size accounting for a compressed payload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct CompressionStats {
    /// Uncompressed payload size.
    pub bytes_in: u64,
    /// Stored payload size.
    pub bytes_out: u64,
    /// `bytes_out / bytes_in`; lower is better.
    pub ratio: f64,
}

impl CompressionStats {
    /// Compute stats from raw and stored sizes.
    #[must_use]
    #[allow(clippy::cast_precision_loss)] // payload sizes stay far below 2^52
    pub fn from_sizes(bytes_in: usize, bytes_out: usize) -> Self {
        let ratio = if bytes_in == 0 {
            1.0
        } else {
            bytes_out as f64 / bytes_in as f64
        };
        Self {
            bytes_in: bytes_in as u64,
            bytes_out: bytes_out as u64,
            ratio,
        }
    }
}

/// Options accepted by [`CheckpointStore::create_checkpoint`](crate::checkpoint::store::CheckpointStore::create_checkpoint).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CheckpointOptions {
    /// Human-readable description.
    pub description: Option<String>,
    /// Free-form tags such as `["auto", "message_count"]`.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Gzip the serialized snapshot.
    #[serde(default)]
    pub compress: bool,
}

/// Descriptive view of a checkpoint without its snapshot body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct CheckpointMetadata {
    /// Unique checkpoint identifier.
    pub id: String,
    /// Owning agent.
    pub agent_id: String,
    /// Human-readable description.
    pub description: Option<String>,
    /// Tags supplied at creation time.
    pub tags: Vec<String>,
    /// Number of conversation records captured.
    pub message_count: u64,
    /// Token usage captured.
    pub token_usage: TokenUsage,
    /// Present only when the payload was compressed.
    pub compression_stats: Option<CompressionStats>,
    /// SHA-256 hex digest of the stored payload.
    pub checksum: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// An immutable snapshot of an agent taken at `created_at`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct Checkpoint {
    /// Unique checkpoint identifier.
    pub id: String,
    /// Owning agent.
    pub agent_id: String,
    /// Human-readable description.
    pub description: Option<String>,
    /// Tags supplied at creation time.
    pub tags: Vec<String>,
    /// Captured state.
    pub snapshot: StateSnapshot,
    /// Present only when the payload was compressed.
    pub compression_stats: Option<CompressionStats>,
    /// SHA-256 hex digest of the stored payload.
    pub checksum: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Construct a new checkpoint with a generated identifier.
    #[must_use]
    pub fn new(agent_id: String, snapshot: StateSnapshot, options: &CheckpointOptions) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            agent_id,
            description: options.description.clone(),
            tags: options.tags.clone(),
            snapshot,
            compression_stats: None,
            checksum: String::new(),
            // Stored with microsecond precision.
            created_at: Utc::now().trunc_subsecs(6),
        }
    }

    /// Project the descriptive fields.
    #[must_use]
    pub fn metadata(&self) -> CheckpointMetadata {
        CheckpointMetadata {
            id: self.id.clone(),
            agent_id: self.agent_id.clone(),
            description: self.description.clone(),
            tags: self.tags.clone(),
            message_count: self.snapshot.conversation_history.len() as u64,
            token_usage: self.snapshot.token_usage,
            compression_stats: self.compression_stats,
            checksum: self.checksum.clone(),
            created_at: self.created_at,
        }
    }
}
