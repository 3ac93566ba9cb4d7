//! Shared application services wired from one [`GlobalConfig`].

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::checkpoint::auto::AutoCheckpointRegistry;
use crate::checkpoint::store::{CheckpointService, CheckpointStore};
use crate::events::EventPublisher;
use crate::orchestrator::handoff::HandoffCoordinator;
use crate::orchestrator::ledger::ResourceLedger;
use crate::orchestrator::rotation::{RotationController, RotationPolicy};
use crate::persistence::db::Database;
use crate::transport::registry::ConnectionRegistry;
use crate::GlobalConfig;

/// Every long-lived component, sharing one registry as event publisher.
pub struct Services {
    /// Loaded configuration.
    pub config: Arc<GlobalConfig>,
    /// Subscriber connections and event fan-out.
    pub registry: Arc<ConnectionRegistry>,
    /// Checkpoint persistence.
    pub checkpoints: Arc<dyn CheckpointStore>,
    /// One auto-checkpoint engine per agent.
    pub auto_checkpoints: Arc<AutoCheckpointRegistry>,
    /// Agent replacement.
    pub rotation: Arc<RotationController>,
    /// Rotation thresholds.
    pub rotation_policy: RotationPolicy,
    /// Resource ownership.
    pub ledger: Arc<ResourceLedger>,
    /// Handoff protocol.
    pub handoffs: Arc<HandoffCoordinator>,
}

impl Services {
    /// Wire every component over `db`.
    #[must_use]
    pub fn build(config: Arc<GlobalConfig>, db: Arc<Database>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(config.transport.clone()));
        let publisher: Arc<dyn EventPublisher> = registry.clone();
        let checkpoints: Arc<dyn CheckpointStore> = Arc::new(CheckpointService::new(db));

        let auto_checkpoints = Arc::new(
            AutoCheckpointRegistry::new(config.auto_checkpoint.clone(), Arc::clone(&checkpoints))
                .with_publisher(Arc::clone(&publisher)),
        );
        let rotation = Arc::new(
            RotationController::new(Arc::clone(&checkpoints))
                .with_publisher(Arc::clone(&publisher)),
        );
        let ledger = Arc::new(ResourceLedger::new());
        let handoffs = Arc::new(
            HandoffCoordinator::new(config.handoff.clone(), ledger.clone())
                .with_publisher(publisher),
        );

        Self {
            rotation_policy: RotationPolicy::from(&config.rotation),
            config,
            registry,
            checkpoints,
            auto_checkpoints,
            rotation,
            ledger,
            handoffs,
        }
    }

    /// Start the handoff expiry sweeper on the configured interval.
    pub fn spawn_background(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let interval = Duration::from_secs(self.config.handoff.sweep_interval_seconds.max(1));
        self.handoffs.spawn_expiry_sweeper(interval, cancel)
    }

    /// Stop every engine and close every connection.
    pub fn shutdown(&self) {
        self.auto_checkpoints.shutdown();
        self.registry.shutdown();
        info!("services shut down");
    }
}
