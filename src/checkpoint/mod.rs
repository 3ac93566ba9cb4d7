//! Checkpoint storage and policy-driven auto-checkpointing.

pub mod auto;
pub mod store;

pub use auto::{AutoCheckpointEngine, AutoCheckpointRegistry, CheckpointAttempt, StateProvider};
pub use store::{CheckpointService, CheckpointStore};
