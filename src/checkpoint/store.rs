//! Checkpoint store contract and the `SQLite`-backed implementation.
//!
//! [`CheckpointService`] serializes a [`StateSnapshot`] to JSON, optionally
//! gzips it, and records a SHA-256 digest of the stored bytes. Restores
//! verify the digest before decoding, so a tampered payload surfaces as
//! [`AppError::Integrity`] rather than as a corrupt snapshot.

use std::future::Future;
use std::io::{Read, Write};
use std::pin::Pin;
use std::sync::Arc;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::models::checkpoint::{
    Checkpoint, CheckpointMetadata, CheckpointOptions, CompressionStats, StateSnapshot,
};
use crate::persistence::checkpoint_repo::{CheckpointRepo, StoredCheckpoint};
use crate::persistence::db::Database;
use crate::{AppError, Result};

/// Persistent checkpoint storage.
///
/// Checkpoints are immutable once created.
pub trait CheckpointStore: Send + Sync {
    /// Persist `snapshot` as a new checkpoint for `agent_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or persistence fails.
    fn create_checkpoint(
        &self,
        agent_id: &str,
        snapshot: StateSnapshot,
        options: CheckpointOptions,
    ) -> Pin<Box<dyn Future<Output = Result<CheckpointMetadata>> + Send + '_>>;

    /// Load the snapshot stored under `checkpoint_id`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] for an unknown id and
    /// [`AppError::Integrity`] when the stored payload fails verification.
    fn restore_checkpoint(
        &self,
        checkpoint_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<StateSnapshot>> + Send + '_>>;

    /// Descriptive fields of one checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    fn get_checkpoint(
        &self,
        checkpoint_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<CheckpointMetadata>>> + Send + '_>>;

    /// All checkpoints of an agent, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    fn list_checkpoints(
        &self,
        agent_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<CheckpointMetadata>>> + Send + '_>>;

    /// Newest checkpoint of an agent.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    fn latest_checkpoint(
        &self,
        agent_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<CheckpointMetadata>>> + Send + '_>>;
}

/// [`CheckpointStore`] backed by [`CheckpointRepo`].
#[derive(Clone)]
pub struct CheckpointService {
    repo: CheckpointRepo,
}

impl CheckpointService {
    /// Create a service over the shared database pool.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            repo: CheckpointRepo::new(db),
        }
    }
}

impl CheckpointStore for CheckpointService {
    fn create_checkpoint(
        &self,
        agent_id: &str,
        snapshot: StateSnapshot,
        options: CheckpointOptions,
    ) -> Pin<Box<dyn Future<Output = Result<CheckpointMetadata>> + Send + '_>> {
        let agent_id = agent_id.to_owned();
        let span = info_span!("create_checkpoint", agent_id = %agent_id);
        Box::pin(
            async move {
                let (payload, compression_stats) = encode_snapshot(&snapshot, options.compress)?;

                let mut checkpoint = Checkpoint::new(agent_id, snapshot, &options);
                checkpoint.compression_stats = compression_stats;
                checkpoint.checksum = checksum(&payload);
                let metadata = checkpoint.metadata();

                self.repo
                    .insert(&StoredCheckpoint {
                        metadata: metadata.clone(),
                        payload,
                        compressed: options.compress,
                    })
                    .await?;

                info!(
                    checkpoint_id = %metadata.id,
                    message_count = metadata.message_count,
                    ratio = metadata.compression_stats.map(|s| s.ratio),
                    "checkpoint created"
                );
                Ok(metadata)
            }
            .instrument(span),
        )
    }

    fn restore_checkpoint(
        &self,
        checkpoint_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<StateSnapshot>> + Send + '_>> {
        let checkpoint_id = checkpoint_id.to_owned();
        let span = info_span!("restore_checkpoint", checkpoint_id = %checkpoint_id);
        Box::pin(
            async move {
                let stored = self
                    .repo
                    .get_by_id(&checkpoint_id)
                    .await?
                    .ok_or_else(|| AppError::NotFound(format!("checkpoint {checkpoint_id}")))?;

                let snapshot = decode_stored(&stored)?;
                info!(
                    agent_id = %stored.metadata.agent_id,
                    message_count = snapshot.conversation_history.len(),
                    "checkpoint restored"
                );
                Ok(snapshot)
            }
            .instrument(span),
        )
    }

    fn get_checkpoint(
        &self,
        checkpoint_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<CheckpointMetadata>>> + Send + '_>> {
        let checkpoint_id = checkpoint_id.to_owned();
        Box::pin(async move {
            let stored = self.repo.get_by_id(&checkpoint_id).await?;
            Ok(stored.map(|s| s.metadata))
        })
    }

    fn list_checkpoints(
        &self,
        agent_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<CheckpointMetadata>>> + Send + '_>> {
        let agent_id = agent_id.to_owned();
        Box::pin(async move {
            let stored = self.repo.list_for_agent(&agent_id).await?;
            debug!(agent_id, count = stored.len(), "listed checkpoints");
            Ok(stored.into_iter().map(|s| s.metadata).collect())
        })
    }

    fn latest_checkpoint(
        &self,
        agent_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<CheckpointMetadata>>> + Send + '_>> {
        let agent_id = agent_id.to_owned();
        Box::pin(async move {
            let stored = self.repo.latest_for_agent(&agent_id).await?;
            Ok(stored.map(|s| s.metadata))
        })
    }
}

/// Serialize a snapshot, gzipping it when `compress` is set.
///
/// Compression stats are returned only for compressed payloads.
///
/// # Errors
///
/// Returns `AppError::Checkpoint` if serialization or compression fails.
pub fn encode_snapshot(
    snapshot: &StateSnapshot,
    compress: bool,
) -> Result<(Vec<u8>, Option<CompressionStats>)> {
    let raw = serde_json::to_vec(snapshot)?;
    if !compress {
        return Ok((raw, None));
    }

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&raw)
        .map_err(|err| AppError::Checkpoint(format!("compression failed: {err}")))?;
    let packed = encoder
        .finish()
        .map_err(|err| AppError::Checkpoint(format!("compression failed: {err}")))?;

    let stats = CompressionStats::from_sizes(raw.len(), packed.len());
    Ok((packed, Some(stats)))
}

/// SHA-256 hex digest of `payload`.
#[must_use]
pub fn checksum(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    format!("{:x}", hasher.finalize())
}

fn decode_stored(stored: &StoredCheckpoint) -> Result<StateSnapshot> {
    let actual = checksum(&stored.payload);
    if actual != stored.metadata.checksum {
        warn!(
            checkpoint_id = %stored.metadata.id,
            expected = %stored.metadata.checksum,
            actual = %actual,
            "checkpoint checksum mismatch"
        );
        return Err(AppError::Integrity(format!(
            "checkpoint {} checksum mismatch",
            stored.metadata.id
        )));
    }

    let raw = if stored.compressed {
        let mut out = Vec::new();
        GzDecoder::new(stored.payload.as_slice())
            .read_to_end(&mut out)
            .map_err(|err| AppError::Checkpoint(format!("decompression failed: {err}")))?;
        out
    } else {
        stored.payload.clone()
    };

    serde_json::from_slice(&raw)
        .map_err(|err| AppError::Checkpoint(format!("invalid snapshot payload: {err}")))
}
