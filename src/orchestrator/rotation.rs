//! Context-window rotation: replace an agent process without losing its
//! state.
//!
//! `checkpoint_and_restart` runs in a fixed order:
//!
//! 1. gather history and tool state, then create a `rotation` checkpoint;
//! 2. spawn the replacement from the original configuration (cold boot);
//! 3. terminate the old agent (failure is only a warning);
//! 4. restore the checkpoint;
//! 5. inject the restored state into the replacement.
//!
//! A failure at step 1 or 2 leaves the old agent running.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, info_span, warn, Instrument};

use crate::checkpoint::store::CheckpointStore;
use crate::config::RotationConfig;
use crate::events::{AgentEvent, EventPublisher};
use crate::models::agent::{AgentConfig, AgentDescriptor, SpawnedAgent};
use crate::models::checkpoint::{CheckpointOptions, ConversationMessage, StateSnapshot, TokenUsage};
use crate::Result;

/// Agent process operations supplied by the hosting driver.
pub trait AgentHandlers: Send + Sync {
    /// Launch a new agent from `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the agent cannot be started.
    fn spawn_agent(
        &self,
        config: &AgentConfig,
    ) -> Pin<Box<dyn Future<Output = Result<SpawnedAgent>> + Send + '_>>;

    /// Stop a running agent.
    ///
    /// # Errors
    ///
    /// Returns an error if the agent cannot be stopped.
    fn terminate_agent(&self, agent_id: &str)
        -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Deliver a text message to an agent.
    ///
    /// # Errors
    ///
    /// Returns an error if delivery fails.
    fn send_message(
        &self,
        agent_id: &str,
        message: &str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Conversation history of an agent, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the history cannot be read.
    fn get_conversation_history(
        &self,
        agent_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ConversationMessage>>> + Send + '_>>;

    /// Opaque tool state of an agent.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be read.
    fn get_tool_state(
        &self,
        agent_id: &str,
    ) -> Pin<
        Box<dyn Future<Output = Result<serde_json::Map<String, serde_json::Value>>> + Send + '_>,
    >;

    /// Apply a restored snapshot to an agent.
    ///
    /// # Errors
    ///
    /// Returns an error if the agent rejects the state.
    fn inject_state(
        &self,
        agent_id: &str,
        snapshot: StateSnapshot,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// How an agent is replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationStrategy {
    /// Checkpoint, spawn, terminate, restore, inject.
    CheckpointAndRestart,
    /// Spawn and terminate; no state carried over.
    FreshStart,
    /// Summarize context into the running agent. Not supported.
    SummarizeAndContinue,
}

impl RotationStrategy {
    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CheckpointAndRestart => "checkpoint_and_restart",
            Self::FreshStart => "fresh_start",
            Self::SummarizeAndContinue => "summarize_and_continue",
        }
    }
}

impl fmt::Display for RotationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of [`RotationController::execute_rotation`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationResult {
    /// Whether the replacement is running with its state.
    pub success: bool,
    /// Strategy executed.
    pub strategy: RotationStrategy,
    /// Agent being replaced.
    pub old_agent_id: String,
    /// Replacement agent, once spawned.
    pub new_agent_id: Option<String>,
    /// Checkpoint carrying the state, once created.
    pub checkpoint_id: Option<String>,
    /// Failure reason.
    pub error: Option<String>,
    /// Non-fatal problems such as a failed termination.
    pub warnings: Vec<String>,
}

impl RotationResult {
    fn new(strategy: RotationStrategy, old_agent_id: &str) -> Self {
        Self {
            success: false,
            strategy,
            old_agent_id: old_agent_id.to_owned(),
            new_agent_id: None,
            checkpoint_id: None,
            error: None,
            warnings: Vec::new(),
        }
    }

    fn fail(mut self, error: String) -> Self {
        self.success = false;
        self.error = Some(error);
        self
    }
}

/// Executes rotations against a [`CheckpointStore`].
pub struct RotationController {
    store: Arc<dyn CheckpointStore>,
    publisher: Option<Arc<dyn EventPublisher>>,
}

impl RotationController {
    /// Create a controller over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            store,
            publisher: None,
        }
    }

    /// Publish `rotation_*` events through `publisher`.
    #[must_use]
    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Replace `agent` using `strategy`.
    ///
    /// Failures are reported in the result, never as `Err`.
    pub async fn execute_rotation(
        &self,
        agent: &AgentDescriptor,
        strategy: RotationStrategy,
        handlers: &dyn AgentHandlers,
    ) -> RotationResult {
        let span = info_span!(
            "execute_rotation",
            agent_id = %agent.agent_id,
            strategy = strategy.as_str()
        );
        async {
            self.emit(
                &agent.agent_id,
                "rotation_started",
                json!({ "strategy": strategy }),
            );

            let result = match strategy {
                RotationStrategy::CheckpointAndRestart => {
                    self.checkpoint_and_restart(agent, handlers).await
                }
                RotationStrategy::FreshStart => fresh_start(agent, handlers).await,
                RotationStrategy::SummarizeAndContinue => RotationResult::new(strategy, &agent.agent_id)
                    .fail(format!("unsupported rotation strategy: {strategy}")),
            };

            if result.success {
                info!(
                    new_agent_id = result.new_agent_id.as_deref(),
                    checkpoint_id = result.checkpoint_id.as_deref(),
                    warnings = result.warnings.len(),
                    "rotation completed"
                );
                self.emit(
                    &agent.agent_id,
                    "rotation_completed",
                    json!({
                        "strategy": strategy,
                        "newAgentId": result.new_agent_id,
                        "checkpointId": result.checkpoint_id,
                        "warnings": result.warnings,
                    }),
                );
            } else {
                warn!(error = result.error.as_deref(), "rotation failed");
                self.emit(
                    &agent.agent_id,
                    "rotation_failed",
                    json!({
                        "strategy": strategy,
                        "error": result.error,
                        "newAgentId": result.new_agent_id,
                        "checkpointId": result.checkpoint_id,
                    }),
                );
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn checkpoint_and_restart(
        &self,
        agent: &AgentDescriptor,
        handlers: &dyn AgentHandlers,
    ) -> RotationResult {
        let old_id = agent.agent_id.as_str();
        let mut result = RotationResult::new(RotationStrategy::CheckpointAndRestart, old_id);

        let history = match handlers.get_conversation_history(old_id).await {
            Ok(history) => history,
            Err(err) => return result.fail(format!("failed to read conversation history: {err}")),
        };
        let tool_state = match handlers.get_tool_state(old_id).await {
            Ok(tool_state) => tool_state,
            Err(err) => return result.fail(format!("failed to read tool state: {err}")),
        };
        let snapshot = StateSnapshot {
            conversation_history: history,
            tool_state,
            token_usage: agent.token_usage,
            context_artifact: None,
        };

        let options = CheckpointOptions {
            description: Some(format!("Rotation of {old_id}")),
            tags: vec!["rotation".to_owned()],
            compress: true,
        };
        let checkpoint_id = match self.store.create_checkpoint(old_id, snapshot, options).await {
            Ok(metadata) => metadata.id,
            Err(err) => return result.fail(format!("failed to create checkpoint: {err}")),
        };
        result.checkpoint_id = Some(checkpoint_id.clone());

        let new_id = match handlers.spawn_agent(&agent.config).await {
            Ok(spawned) => spawned.agent_id,
            Err(err) => return result.fail(format!("failed to spawn replacement: {err}")),
        };
        result.new_agent_id = Some(new_id.clone());

        if let Err(err) = handlers.terminate_agent(old_id).await {
            warn!(%err, "old agent did not terminate cleanly");
            result
                .warnings
                .push(format!("failed to terminate {old_id}: {err}"));
        }

        let restored = match self.store.restore_checkpoint(&checkpoint_id).await {
            Ok(snapshot) => snapshot,
            Err(err) => return result.fail(format!("failed to restore checkpoint: {err}")),
        };
        if let Err(err) = handlers.inject_state(&new_id, restored).await {
            return result.fail(format!("failed to inject state into {new_id}: {err}"));
        }

        result.success = true;
        result
    }

    fn emit(&self, agent_id: &str, event: &str, data: serde_json::Value) {
        if let Some(publisher) = &self.publisher {
            publisher.publish(AgentEvent::new(agent_id, event, data));
        }
    }
}

async fn fresh_start(agent: &AgentDescriptor, handlers: &dyn AgentHandlers) -> RotationResult {
    let old_id = agent.agent_id.as_str();
    let mut result = RotationResult::new(RotationStrategy::FreshStart, old_id);

    let new_id = match handlers.spawn_agent(&agent.config).await {
        Ok(spawned) => spawned.agent_id,
        Err(err) => return result.fail(format!("failed to spawn replacement: {err}")),
    };
    result.new_agent_id = Some(new_id);

    if let Err(err) = handlers.terminate_agent(old_id).await {
        warn!(%err, "old agent did not terminate cleanly");
        result
            .warnings
            .push(format!("failed to terminate {old_id}: {err}"));
    }

    result.success = true;
    result
}

/// Decides when an agent's context window calls for rotation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RotationPolicy {
    /// Context window size in tokens; 0 disables rotation.
    pub context_window_tokens: u64,
    /// Fraction of the window at which rotation is due.
    pub rotate_at_ratio: f64,
}

impl From<&RotationConfig> for RotationPolicy {
    fn from(config: &RotationConfig) -> Self {
        Self {
            context_window_tokens: config.context_window_tokens,
            rotate_at_ratio: config.rotate_at_ratio,
        }
    }
}

impl RotationPolicy {
    /// Fraction of the window consumed by `usage`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)] // token counts stay far below 2^52
    pub fn usage_ratio(&self, usage: &TokenUsage) -> f64 {
        if self.context_window_tokens == 0 {
            return 0.0;
        }
        usage.total_tokens as f64 / self.context_window_tokens as f64
    }

    /// Whether `usage` has reached the rotation threshold.
    #[must_use]
    pub fn needs_rotation(&self, usage: &TokenUsage) -> bool {
        self.context_window_tokens > 0 && self.usage_ratio(usage) >= self.rotate_at_ratio
    }
}
