//! Policy-driven automatic checkpointing.
//!
//! An [`AutoCheckpointEngine`] per agent watches three triggers: a
//! periodic timer, a message counter, and a cumulative token total. Every
//! attempt passes one gate, evaluated under a single lock before any
//! `.await`: an attempt already in flight, the cooldown (skipped for
//! forced attempts), and the presence of a [`StateProvider`]. Two rapid
//! triggers can therefore never both reach the store.
//!
//! [`AutoCheckpointRegistry`] keeps exactly one engine per agent.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::store::CheckpointStore;
use crate::config::AutoCheckpointConfig;
use crate::events::{AgentEvent, EventPublisher};
use crate::models::checkpoint::{CheckpointOptions, CompressionStats, StateSnapshot, TokenUsage};
use crate::Result;

/// Reason text when no provider has been registered.
pub const NO_PROVIDER: &str = "No state provider configured";
/// Reason text when another attempt holds the gate.
pub const IN_PROGRESS: &str = "Checkpoint already in progress";

/// Supplies the current state of an agent on demand.
pub trait StateProvider: Send + Sync {
    /// Capture the agent's current state.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be gathered.
    fn snapshot(
        &self,
        agent_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<StateSnapshot>> + Send + '_>>;
}

/// What caused a checkpoint attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointTrigger {
    /// Periodic timer.
    Interval,
    /// Message counter reached its threshold.
    MessageCount,
    /// Cumulative tokens reached their threshold.
    TokenThreshold,
    /// Explicit `force_checkpoint` call.
    Manual,
}

impl CheckpointTrigger {
    /// Wire name, also used as the second checkpoint tag.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Interval => "interval",
            Self::MessageCount => "message_count",
            Self::TokenThreshold => "token_threshold",
            Self::Manual => "manual",
        }
    }
}

/// Result of one checkpoint attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckpointAttempt {
    /// A checkpoint was stored.
    Created {
        /// New checkpoint id.
        checkpoint_id: String,
        /// What caused it.
        trigger: CheckpointTrigger,
        /// Present when the payload was compressed.
        compression: Option<CompressionStats>,
    },
    /// The gate refused the attempt; nothing was created.
    Skipped {
        /// What caused it.
        trigger: CheckpointTrigger,
        /// Human-readable reason.
        reason: String,
        /// Remaining cooldown in whole seconds, rounded up.
        cooldown_remaining_secs: Option<u64>,
    },
    /// The provider or store failed; engine state is unchanged.
    Failed {
        /// What caused it.
        trigger: CheckpointTrigger,
        /// Underlying error message.
        error: String,
    },
}

impl CheckpointAttempt {
    /// Whether a checkpoint was stored.
    #[must_use]
    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created { .. })
    }

    /// Id of the stored checkpoint, if any.
    #[must_use]
    pub fn checkpoint_id(&self) -> Option<&str> {
        match self {
            Self::Created { checkpoint_id, .. } => Some(checkpoint_id),
            _ => None,
        }
    }

    /// Trigger of this attempt.
    #[must_use]
    pub fn trigger(&self) -> CheckpointTrigger {
        match self {
            Self::Created { trigger, .. }
            | Self::Skipped { trigger, .. }
            | Self::Failed { trigger, .. } => *trigger,
        }
    }
}

/// Mutable engine state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AutoCheckpointState {
    /// Monotonic time of the last stored checkpoint; drives the cooldown.
    pub last_checkpoint_at: Option<Instant>,
    /// Wall-clock time of the last stored checkpoint.
    pub last_checkpoint_time: Option<DateTime<Utc>>,
    /// Id of the last stored checkpoint.
    pub last_checkpoint_id: Option<String>,
    /// Messages since the last `message_count` checkpoint.
    pub message_count: u64,
    /// Latest cumulative token total reported.
    pub token_count: u64,
    /// Checkpoints stored by this engine.
    pub checkpoint_count: u64,
    /// An attempt currently holds the gate.
    pub in_flight: bool,
}

/// Clears `in_flight` even if the attempt future is dropped mid-way.
struct InFlightGuard<'a> {
    state: &'a Mutex<AutoCheckpointState>,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        lock(self.state).in_flight = false;
    }
}

/// Auto-checkpoint policy for one agent.
pub struct AutoCheckpointEngine {
    agent_id: String,
    config: AutoCheckpointConfig,
    store: Arc<dyn CheckpointStore>,
    provider: Mutex<Option<Arc<dyn StateProvider>>>,
    publisher: Option<Arc<dyn EventPublisher>>,
    state: Mutex<AutoCheckpointState>,
    timer: Mutex<Option<CancellationToken>>,
}

impl std::fmt::Debug for AutoCheckpointEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoCheckpointEngine")
            .field("agent_id", &self.agent_id)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl AutoCheckpointEngine {
    /// Create an idle engine; call [`start`](Self::start) to arm the timer.
    #[must_use]
    pub fn new(
        agent_id: impl Into<String>,
        config: AutoCheckpointConfig,
        store: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            config,
            store,
            provider: Mutex::new(None),
            publisher: None,
            state: Mutex::new(AutoCheckpointState::default()),
            timer: Mutex::new(None),
        }
    }

    /// Publish `auto_checkpoint_created` events through `publisher`.
    #[must_use]
    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Agent this engine serves.
    #[must_use]
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Policy in effect.
    #[must_use]
    pub fn config(&self) -> &AutoCheckpointConfig {
        &self.config
    }

    /// Register the snapshot source.
    pub fn set_state_provider(&self, provider: Arc<dyn StateProvider>) {
        *self
            .provider
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(provider);
    }

    /// Copy of the mutable state.
    #[must_use]
    pub fn state(&self) -> AutoCheckpointState {
        lock(&self.state).clone()
    }

    /// Whether the interval timer is armed.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Arm the interval timer when enabled and the interval is non-zero.
    ///
    /// Returns whether a timer was armed; an interval too large to schedule
    /// arms none. The task holds only a weak reference, so dropping the
    /// last engine handle ends it.
    pub fn start(self: &Arc<Self>) -> bool {
        if !self.config.enabled || self.config.interval_minutes == 0 {
            return false;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(agent_id = %self.agent_id, "no tokio runtime; interval checkpoints disabled");
            return false;
        };

        let mut timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if timer.is_some() {
            return false;
        }

        let period = Duration::from_secs(self.config.interval_minutes.saturating_mul(60));
        let Some(first) = Instant::now().checked_add(period) else {
            warn!(
                agent_id = %self.agent_id,
                interval_minutes = self.config.interval_minutes,
                "interval out of range; interval checkpoints disabled"
            );
            return false;
        };

        let cancel = CancellationToken::new();
        let engine = Arc::downgrade(self);
        runtime.spawn(
            interval_loop(engine, first, period, cancel.clone())
                .instrument(info_span!("auto_checkpoint_timer", agent_id = %self.agent_id)),
        );
        *timer = Some(cancel);

        info!(
            agent_id = %self.agent_id,
            interval_minutes = self.config.interval_minutes,
            "auto-checkpoint timer armed"
        );
        true
    }

    /// Cancel the interval timer.
    pub fn stop(&self) {
        if let Some(cancel) = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            cancel.cancel();
            debug!(agent_id = %self.agent_id, "auto-checkpoint timer stopped");
        }
    }

    /// Count one message and attempt a checkpoint at the threshold.
    ///
    /// Returns `None` when no attempt was made.
    pub async fn on_message(&self) -> Option<CheckpointAttempt> {
        let count = {
            let mut state = lock(&self.state);
            state.message_count += 1;
            state.message_count
        };
        let threshold = self.config.message_threshold;
        if !self.config.enabled || threshold == 0 || count < threshold {
            return None;
        }
        Some(self.attempt(CheckpointTrigger::MessageCount, false).await)
    }

    /// Record the cumulative token total and attempt a checkpoint at the
    /// threshold.
    ///
    /// Returns `None` when no attempt was made.
    pub async fn on_token_usage(&self, usage: TokenUsage) -> Option<CheckpointAttempt> {
        lock(&self.state).token_count = usage.total_tokens;
        let threshold = self.config.token_threshold;
        if !self.config.enabled || threshold == 0 || usage.total_tokens < threshold {
            return None;
        }
        Some(self.attempt(CheckpointTrigger::TokenThreshold, false).await)
    }

    /// Attempt a checkpoint now, ignoring the cooldown.
    pub async fn force_checkpoint(&self) -> CheckpointAttempt {
        self.attempt(CheckpointTrigger::Manual, true).await
    }

    /// Run one attempt through the gate.
    pub async fn attempt(&self, trigger: CheckpointTrigger, forced: bool) -> CheckpointAttempt {
        let provider = match self.enter_gate(trigger, forced) {
            Ok(provider) => provider,
            Err(skipped) => {
                debug!(agent_id = %self.agent_id, ?skipped, "checkpoint attempt skipped");
                return skipped;
            }
        };
        let _in_flight = InFlightGuard { state: &self.state };

        let span = info_span!(
            "auto_checkpoint",
            agent_id = %self.agent_id,
            trigger = trigger.as_str()
        );
        let result = async {
            let snapshot = provider.snapshot(&self.agent_id).await?;
            let options = CheckpointOptions {
                description: Some(format!(
                    "{} ({})",
                    self.config.description_prefix,
                    trigger.as_str()
                )),
                tags: vec!["auto".to_owned(), trigger.as_str().to_owned()],
                compress: self.config.compress,
            };
            self.store
                .create_checkpoint(&self.agent_id, snapshot, options)
                .await
        }
        .instrument(span)
        .await;

        match result {
            Ok(metadata) => {
                {
                    let mut state = lock(&self.state);
                    state.last_checkpoint_at = Some(Instant::now());
                    state.last_checkpoint_time = Some(metadata.created_at);
                    state.last_checkpoint_id = Some(metadata.id.clone());
                    state.checkpoint_count += 1;
                    if trigger == CheckpointTrigger::MessageCount {
                        state.message_count = 0;
                    }
                }
                info!(
                    agent_id = %self.agent_id,
                    checkpoint_id = %metadata.id,
                    trigger = trigger.as_str(),
                    "auto-checkpoint created"
                );
                if let Some(publisher) = &self.publisher {
                    publisher.publish(AgentEvent::new(
                        self.agent_id.clone(),
                        "auto_checkpoint_created",
                        json!({
                            "checkpointId": metadata.id,
                            "trigger": trigger,
                            "compression": metadata.compression_stats,
                        }),
                    ));
                }
                CheckpointAttempt::Created {
                    checkpoint_id: metadata.id,
                    trigger,
                    compression: metadata.compression_stats,
                }
            }
            Err(err) => {
                warn!(
                    agent_id = %self.agent_id,
                    trigger = trigger.as_str(),
                    %err,
                    "auto-checkpoint failed"
                );
                CheckpointAttempt::Failed {
                    trigger,
                    error: err.to_string(),
                }
            }
        }
    }

    /// Evaluate the gate and claim `in_flight` under one lock.
    fn enter_gate(
        &self,
        trigger: CheckpointTrigger,
        forced: bool,
    ) -> std::result::Result<Arc<dyn StateProvider>, CheckpointAttempt> {
        let mut state = lock(&self.state);
        let skip = |reason: &str, remaining: Option<u64>| CheckpointAttempt::Skipped {
            trigger,
            reason: reason.to_owned(),
            cooldown_remaining_secs: remaining,
        };

        if state.in_flight {
            return Err(skip(IN_PROGRESS, None));
        }

        if !forced {
            if let Some(last) = state.last_checkpoint_at {
                let cooldown = Duration::from_secs(self.config.cooldown_seconds);
                let elapsed = last.elapsed();
                if elapsed < cooldown {
                    let remaining = cooldown - elapsed;
                    let secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
                    return Err(skip(&format!("Cooldown active ({secs}s remaining)"), Some(secs)));
                }
            }
        }

        let provider = self
            .provider
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(provider) = provider else {
            return Err(skip(NO_PROVIDER, None));
        };

        state.in_flight = true;
        Ok(provider)
    }
}

impl Drop for AutoCheckpointEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn interval_loop(
    engine: Weak<AutoCheckpointEngine>,
    first: Instant,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(first, period);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(engine) = engine.upgrade() else { break };
                engine.attempt(CheckpointTrigger::Interval, false).await;
            }
        }
    }
}

fn lock(state: &Mutex<AutoCheckpointState>) -> MutexGuard<'_, AutoCheckpointState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One [`AutoCheckpointEngine`] per agent, created on first use.
pub struct AutoCheckpointRegistry {
    defaults: AutoCheckpointConfig,
    store: Arc<dyn CheckpointStore>,
    publisher: Option<Arc<dyn EventPublisher>>,
    provider: Option<Arc<dyn StateProvider>>,
    engines: Mutex<HashMap<String, Arc<AutoCheckpointEngine>>>,
}

impl AutoCheckpointRegistry {
    /// Registry creating engines with `defaults`.
    #[must_use]
    pub fn new(defaults: AutoCheckpointConfig, store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            defaults,
            store,
            publisher: None,
            provider: None,
            engines: Mutex::new(HashMap::new()),
        }
    }

    /// Attach `publisher` to every engine created from now on.
    #[must_use]
    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Register `provider` on every engine created from now on.
    #[must_use]
    pub fn with_state_provider(mut self, provider: Arc<dyn StateProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Engine for `agent_id`, creating and starting it with the default
    /// policy if absent.
    pub fn get_or_create(&self, agent_id: &str) -> Arc<AutoCheckpointEngine> {
        self.get_or_create_with(agent_id, self.defaults.clone())
    }

    /// Engine for `agent_id`, creating and starting it with `config` if
    /// absent. An existing engine keeps its original policy.
    pub fn get_or_create_with(
        &self,
        agent_id: &str,
        config: AutoCheckpointConfig,
    ) -> Arc<AutoCheckpointEngine> {
        let mut engines = self.lock();
        if let Some(engine) = engines.get(agent_id) {
            return Arc::clone(engine);
        }

        let mut engine = AutoCheckpointEngine::new(agent_id, config, Arc::clone(&self.store));
        if let Some(publisher) = &self.publisher {
            engine = engine.with_publisher(Arc::clone(publisher));
        }
        if let Some(provider) = &self.provider {
            engine.set_state_provider(Arc::clone(provider));
        }
        let engine = Arc::new(engine);
        engine.start();
        engines.insert(agent_id.to_owned(), Arc::clone(&engine));
        debug!(agent_id, "auto-checkpoint engine created");
        engine
    }

    /// Existing engine for `agent_id`.
    #[must_use]
    pub fn get(&self, agent_id: &str) -> Option<Arc<AutoCheckpointEngine>> {
        self.lock().get(agent_id).cloned()
    }

    /// Stop and forget the engine for `agent_id`. Returns whether one existed.
    pub fn remove(&self, agent_id: &str) -> bool {
        let removed = self.lock().remove(agent_id);
        removed.is_some_and(|engine| {
            engine.stop();
            true
        })
    }

    /// Stop and forget every engine.
    pub fn shutdown(&self) {
        let engines: Vec<_> = self.lock().drain().map(|(_, e)| e).collect();
        for engine in &engines {
            engine.stop();
        }
        info!(stopped = engines.len(), "auto-checkpoint registry shut down");
    }

    /// Number of live engines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no engine exists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<AutoCheckpointEngine>>> {
        self.engines.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
