//! Unit tests for the auto-checkpoint engine and its per-agent registry.
//!
//! Time-sensitive tests run on a paused clock and use an in-memory store so
//! no real I/O races the virtual timer.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

use agent_continuity::checkpoint::auto::{
    AutoCheckpointEngine, AutoCheckpointRegistry, CheckpointAttempt, CheckpointTrigger,
    StateProvider, IN_PROGRESS, NO_PROVIDER,
};
use agent_continuity::checkpoint::store::{checksum, encode_snapshot, CheckpointStore};
use agent_continuity::config::AutoCheckpointConfig;
use agent_continuity::events::{AgentEvent, EventPublisher};
use agent_continuity::models::checkpoint::{
    Checkpoint, CheckpointMetadata, CheckpointOptions, ConversationMessage, StateSnapshot,
    TokenUsage,
};
use agent_continuity::{AppError, Result};

// ── Test doubles ────────────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryStore {
    saved: Mutex<Vec<(CheckpointMetadata, CheckpointOptions, StateSnapshot)>>,
}

impl MemoryStore {
    fn saved(&self) -> Vec<(CheckpointMetadata, CheckpointOptions, StateSnapshot)> {
        self.saved.lock().unwrap().clone()
    }
}

impl CheckpointStore for MemoryStore {
    fn create_checkpoint(
        &self,
        agent_id: &str,
        snapshot: StateSnapshot,
        options: CheckpointOptions,
    ) -> Pin<Box<dyn Future<Output = Result<CheckpointMetadata>> + Send + '_>> {
        let agent_id = agent_id.to_owned();
        Box::pin(async move {
            let (payload, stats) = encode_snapshot(&snapshot, options.compress)?;
            let mut checkpoint = Checkpoint::new(agent_id, snapshot.clone(), &options);
            checkpoint.compression_stats = stats;
            checkpoint.checksum = checksum(&payload);
            let metadata = checkpoint.metadata();
            self.saved
                .lock()
                .unwrap()
                .push((metadata.clone(), options, snapshot));
            Ok(metadata)
        })
    }

    fn restore_checkpoint(
        &self,
        checkpoint_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<StateSnapshot>> + Send + '_>> {
        let checkpoint_id = checkpoint_id.to_owned();
        Box::pin(async move {
            self.saved()
                .into_iter()
                .find(|(meta, _, _)| meta.id == checkpoint_id)
                .map(|(_, _, snapshot)| snapshot)
                .ok_or(AppError::NotFound(checkpoint_id))
        })
    }

    fn get_checkpoint(
        &self,
        checkpoint_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<CheckpointMetadata>>> + Send + '_>> {
        let checkpoint_id = checkpoint_id.to_owned();
        Box::pin(async move {
            Ok(self
                .saved()
                .into_iter()
                .map(|(meta, _, _)| meta)
                .find(|meta| meta.id == checkpoint_id))
        })
    }

    fn list_checkpoints(
        &self,
        agent_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<CheckpointMetadata>>> + Send + '_>> {
        let agent_id = agent_id.to_owned();
        Box::pin(async move {
            Ok(self
                .saved()
                .into_iter()
                .map(|(meta, _, _)| meta)
                .filter(|meta| meta.agent_id == agent_id)
                .collect())
        })
    }

    fn latest_checkpoint(
        &self,
        agent_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<CheckpointMetadata>>> + Send + '_>> {
        let agent_id = agent_id.to_owned();
        Box::pin(async move { Ok(self.list_checkpoints(&agent_id).await?.pop()) })
    }
}

struct FailingStore;

impl CheckpointStore for FailingStore {
    fn create_checkpoint(
        &self,
        _agent_id: &str,
        _snapshot: StateSnapshot,
        _options: CheckpointOptions,
    ) -> Pin<Box<dyn Future<Output = Result<CheckpointMetadata>> + Send + '_>> {
        Box::pin(async { Err(AppError::Db("disk full".into())) })
    }

    fn restore_checkpoint(
        &self,
        checkpoint_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<StateSnapshot>> + Send + '_>> {
        let checkpoint_id = checkpoint_id.to_owned();
        Box::pin(async move { Err(AppError::NotFound(checkpoint_id)) })
    }

    fn get_checkpoint(
        &self,
        _checkpoint_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<CheckpointMetadata>>> + Send + '_>> {
        Box::pin(async { Ok(None) })
    }

    fn list_checkpoints(
        &self,
        _agent_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<CheckpointMetadata>>> + Send + '_>> {
        Box::pin(async { Ok(Vec::new()) })
    }

    fn latest_checkpoint(
        &self,
        _agent_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<CheckpointMetadata>>> + Send + '_>> {
        Box::pin(async { Ok(None) })
    }
}

struct FixedProvider;

impl StateProvider for FixedProvider {
    fn snapshot(
        &self,
        _agent_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<StateSnapshot>> + Send + '_>> {
        Box::pin(async {
            Ok(StateSnapshot {
                conversation_history: vec![ConversationMessage::new("user", "hello")],
                token_usage: TokenUsage::new(10, 5),
                ..StateSnapshot::default()
            })
        })
    }
}

/// Blocks inside `snapshot` until released.
#[derive(Default)]
struct GatedProvider {
    entered: Notify,
    release: Notify,
}

impl StateProvider for GatedProvider {
    fn snapshot(
        &self,
        _agent_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<StateSnapshot>> + Send + '_>> {
        Box::pin(async move {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(StateSnapshot::default())
        })
    }
}

#[derive(Default)]
struct RecordingPublisher {
    events: Mutex<Vec<AgentEvent>>,
}

impl EventPublisher for RecordingPublisher {
    fn publish(&self, event: AgentEvent) -> usize {
        self.events.lock().unwrap().push(event);
        1
    }
}

fn config() -> AutoCheckpointConfig {
    AutoCheckpointConfig {
        enabled: true,
        interval_minutes: 0,
        message_threshold: 3,
        token_threshold: 1000,
        cooldown_seconds: 30,
        compress: true,
        description_prefix: "Auto-checkpoint".into(),
    }
}

fn engine_with(config: AutoCheckpointConfig, store: Arc<dyn CheckpointStore>) -> AutoCheckpointEngine {
    let engine = AutoCheckpointEngine::new("agent-1", config, store);
    engine.set_state_provider(Arc::new(FixedProvider));
    engine
}

fn skip_reason(attempt: &CheckpointAttempt) -> &str {
    match attempt {
        CheckpointAttempt::Skipped { reason, .. } => reason,
        other => panic!("expected skip, got {other:?}"),
    }
}

// ── Gate ────────────────────────────────────────────────────────────────────

/// Without a provider every attempt is skipped with a fixed reason.
#[tokio::test]
async fn missing_provider_skips() {
    let engine = AutoCheckpointEngine::new("agent-1", config(), Arc::new(MemoryStore::default()));
    let attempt = engine.force_checkpoint().await;
    assert_eq!(skip_reason(&attempt), NO_PROVIDER);
    assert_eq!(attempt.trigger(), CheckpointTrigger::Manual);
    assert_eq!(engine.state().checkpoint_count, 0);
}

/// A second non-forced attempt inside the cooldown is skipped with the
/// remaining seconds; after the cooldown it succeeds.
#[tokio::test(start_paused = true)]
async fn cooldown_blocks_until_elapsed() {
    let store = Arc::new(MemoryStore::default());
    let engine = engine_with(config(), store.clone());

    let first = engine.attempt(CheckpointTrigger::Interval, false).await;
    assert!(first.is_created());

    tokio::time::advance(Duration::from_secs(10)).await;
    let second = engine.attempt(CheckpointTrigger::Interval, false).await;
    assert_eq!(skip_reason(&second), "Cooldown active (20s remaining)");
    assert!(matches!(
        second,
        CheckpointAttempt::Skipped { cooldown_remaining_secs: Some(20), .. }
    ));

    tokio::time::advance(Duration::from_secs(21)).await;
    let third = engine.attempt(CheckpointTrigger::Interval, false).await;
    assert!(third.is_created());
    assert_eq!(store.saved().len(), 2);
}

/// Partial seconds of cooldown round up.
#[tokio::test(start_paused = true)]
async fn cooldown_remaining_rounds_up() {
    let engine = engine_with(config(), Arc::new(MemoryStore::default()));
    engine.force_checkpoint().await;

    tokio::time::advance(Duration::from_millis(29_500)).await;
    let attempt = engine.attempt(CheckpointTrigger::Interval, false).await;
    assert_eq!(skip_reason(&attempt), "Cooldown active (1s remaining)");
}

/// Forced attempts ignore the cooldown.
#[tokio::test(start_paused = true)]
async fn forced_attempt_bypasses_cooldown() {
    let engine = engine_with(config(), Arc::new(MemoryStore::default()));
    assert!(engine.force_checkpoint().await.is_created());
    assert!(engine.force_checkpoint().await.is_created());
    assert_eq!(engine.state().checkpoint_count, 2);
}

/// An attempt already running blocks even a forced one.
#[tokio::test]
async fn in_flight_attempt_blocks_others() {
    let provider = Arc::new(GatedProvider::default());
    let engine = Arc::new(AutoCheckpointEngine::new(
        "agent-1",
        config(),
        Arc::new(MemoryStore::default()),
    ));
    engine.set_state_provider(provider.clone());

    let running = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.force_checkpoint().await })
    };
    provider.entered.notified().await;
    assert!(engine.state().in_flight);

    let blocked = engine.force_checkpoint().await;
    assert_eq!(skip_reason(&blocked), IN_PROGRESS);

    provider.release.notify_one();
    let finished = running.await.expect("join");
    assert!(finished.is_created());
    assert!(!engine.state().in_flight);
}

// ── Triggers ────────────────────────────────────────────────────────────────

/// The message trigger fires at the threshold and resets the counter.
#[tokio::test]
async fn message_threshold_fires_and_resets() {
    let store = Arc::new(MemoryStore::default());
    let engine = engine_with(config(), store.clone());

    assert!(engine.on_message().await.is_none());
    assert!(engine.on_message().await.is_none());
    let attempt = engine.on_message().await.expect("threshold reached");
    assert!(attempt.is_created());
    assert_eq!(attempt.trigger(), CheckpointTrigger::MessageCount);
    assert_eq!(engine.state().message_count, 0);

    let (meta, options, _) = store.saved().remove(0);
    assert_eq!(meta.description.as_deref(), Some("Auto-checkpoint (message_count)"));
    assert_eq!(options.tags, vec!["auto".to_owned(), "message_count".to_owned()]);
    assert!(options.compress);
}

/// The token total is cumulative: once over the threshold, later reports
/// fire again as soon as the cooldown allows.
#[tokio::test(start_paused = true)]
async fn token_threshold_refires_after_cooldown() {
    let engine = engine_with(config(), Arc::new(MemoryStore::default()));

    assert!(engine.on_token_usage(TokenUsage::new(400, 100)).await.is_none());
    let first = engine
        .on_token_usage(TokenUsage::new(800, 400))
        .await
        .expect("over threshold");
    assert!(first.is_created());
    assert_eq!(engine.state().token_count, 1200);

    let cooling = engine
        .on_token_usage(TokenUsage::new(900, 400))
        .await
        .expect("still over threshold");
    assert!(matches!(cooling, CheckpointAttempt::Skipped { .. }));

    tokio::time::advance(Duration::from_secs(31)).await;
    let again = engine
        .on_token_usage(TokenUsage::new(1000, 400))
        .await
        .expect("still over threshold");
    assert!(again.is_created());
    assert_eq!(again.trigger(), CheckpointTrigger::TokenThreshold);
}

/// Disabled engines ignore message and token reports.
#[tokio::test]
async fn disabled_engine_ignores_triggers() {
    let engine = engine_with(
        AutoCheckpointConfig {
            enabled: false,
            ..config()
        },
        Arc::new(MemoryStore::default()),
    );
    for _ in 0..5 {
        assert!(engine.on_message().await.is_none());
    }
    assert!(engine.on_token_usage(TokenUsage::new(5000, 0)).await.is_none());
}

/// The interval timer checkpoints once per period after start.
#[tokio::test(start_paused = true)]
async fn interval_timer_checkpoints_periodically() {
    let store = Arc::new(MemoryStore::default());
    let engine = Arc::new(engine_with(
        AutoCheckpointConfig {
            interval_minutes: 1,
            cooldown_seconds: 0,
            ..config()
        },
        store.clone(),
    ));

    assert!(engine.start());
    assert!(!engine.start());
    assert!(engine.is_running());

    tokio::time::sleep(Duration::from_secs(59)).await;
    assert!(store.saved().is_empty());

    tokio::time::sleep(Duration::from_secs(62)).await;
    assert_eq!(store.saved().len(), 2);
    assert!(store
        .saved()
        .iter()
        .all(|(_, options, _)| options.tags.contains(&"interval".to_owned())));

    engine.stop();
    assert!(!engine.is_running());
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(store.saved().len(), 2);
}

/// A zero interval never arms the timer.
#[tokio::test]
async fn zero_interval_does_not_start() {
    let engine = Arc::new(engine_with(config(), Arc::new(MemoryStore::default())));
    assert!(!engine.start());
    assert!(!engine.is_running());
}

/// An interval too large to schedule arms no timer instead of panicking.
#[tokio::test]
async fn unschedulable_interval_does_not_start() {
    let engine = Arc::new(engine_with(
        AutoCheckpointConfig {
            interval_minutes: u64::MAX,
            ..config()
        },
        Arc::new(MemoryStore::default()),
    ));
    assert!(!engine.start());
    assert!(!engine.is_running());

    // Triggers other than the timer keep working.
    let attempt = engine.force_checkpoint().await;
    assert!(attempt.is_created());
}

// ── Outcomes ────────────────────────────────────────────────────────────────

/// A store failure is reported and leaves the state untouched.
#[tokio::test]
async fn store_failure_leaves_state_unchanged() {
    let engine = engine_with(config(), Arc::new(FailingStore));
    engine.on_message().await;
    engine.on_message().await;

    let attempt = engine.on_message().await.expect("threshold reached");
    assert!(matches!(
        attempt,
        CheckpointAttempt::Failed { ref error, .. } if error.contains("disk full")
    ));

    let state = engine.state();
    assert_eq!(state.checkpoint_count, 0);
    assert!(state.last_checkpoint_id.is_none());
    assert!(state.last_checkpoint_at.is_none());
    assert_eq!(state.message_count, 3);
    assert!(!state.in_flight);
}

/// Success updates the state and publishes one event.
#[tokio::test]
async fn success_publishes_event() {
    let publisher = Arc::new(RecordingPublisher::default());
    let engine = engine_with(config(), Arc::new(MemoryStore::default()))
        .with_publisher(publisher.clone());

    let attempt = engine.force_checkpoint().await;
    let id = attempt.checkpoint_id().expect("created").to_owned();

    let state = engine.state();
    assert_eq!(state.last_checkpoint_id.as_deref(), Some(id.as_str()));
    assert!(state.last_checkpoint_time.is_some());
    assert_eq!(state.checkpoint_count, 1);

    let events = publisher.events.lock().unwrap().clone();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].agent_id, "agent-1");
    assert_eq!(events[0].event, "auto_checkpoint_created");
    assert_eq!(events[0].data["checkpointId"], id.as_str());
    assert_eq!(events[0].data["trigger"], "manual");
    assert!(events[0].data["compression"]["ratio"].is_number());
}

// ── Registry ────────────────────────────────────────────────────────────────

/// One engine per agent, with the registry's provider attached.
#[tokio::test]
async fn registry_keeps_one_engine_per_agent() {
    let registry = AutoCheckpointRegistry::new(config(), Arc::new(MemoryStore::default()))
        .with_state_provider(Arc::new(FixedProvider));

    let a = registry.get_or_create("a");
    let again = registry.get_or_create("a");
    let b = registry.get_or_create("b");

    assert!(Arc::ptr_eq(&a, &again));
    assert!(!Arc::ptr_eq(&a, &b));
    assert_eq!(registry.len(), 2);
    assert!(a.force_checkpoint().await.is_created());

    assert!(registry.remove("a"));
    assert!(!registry.remove("a"));
    assert!(registry.get("a").is_none());

    registry.shutdown();
    assert!(registry.is_empty());
}

/// Per-agent overrides apply only when the engine is first created.
#[tokio::test]
async fn registry_override_applies_on_creation() {
    let registry = AutoCheckpointRegistry::new(config(), Arc::new(MemoryStore::default()));
    let custom = registry.get_or_create_with(
        "a",
        AutoCheckpointConfig {
            message_threshold: 7,
            ..config()
        },
    );
    assert_eq!(custom.config().message_threshold, 7);

    let existing = registry.get_or_create("a");
    assert_eq!(existing.config().message_threshold, 7);
    assert_eq!(registry.get_or_create("b").config().message_threshold, 3);
}
