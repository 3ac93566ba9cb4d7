//! Session handoff coordinator.
//!
//! Drives [`HandoffRecord`]s through the phase table on
//! [`HandoffPhase::can_transition_to`]. Records live in memory; the phase
//! field serializes progress, so an in-flight transfer re-reads it before
//! every resource move and stops as soon as it is no longer `transfer`.
//!
//! Expiry honors the table: an overdue `transfer` record moves to
//! `failed`, while an overdue `pending` record (which has no edge to
//! `failed`) moves to `cancelled`. Both carry a recoverable `timeout`
//! error and go through the fallback policy.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::HandoffConfig;
use crate::events::{AgentEvent, EventPublisher};
use crate::models::handoff::{
    AckStatus, FallbackBehavior, HandoffAcknowledgment, HandoffFailure, HandoffPhase,
    HandoffRecord, HandoffRequest, Resource, ResourceManifest, TransferProgress, TransferSummary,
};
use crate::{AppError, Result};

/// Failure reported by a [`ResourceTransfer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferError {
    /// Human-readable reason.
    pub message: String,
    /// Whether a fallback re-issue may succeed.
    pub recoverable: bool,
}

impl TransferError {
    /// Failure worth retrying.
    #[must_use]
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            recoverable: true,
        }
    }

    /// Failure no retry can fix.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            recoverable: false,
        }
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Moves one resource between agents.
pub trait ResourceTransfer: Send + Sync {
    /// Move `resource` from `from` to `to`.
    ///
    /// # Errors
    ///
    /// Returns a [`TransferError`] carrying the recoverable flag.
    fn transfer(
        &self,
        resource: &Resource,
        from: &str,
        to: &str,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<(), TransferError>> + Send + '_>>;
}

/// Fallback applied after a recoverable failure.
#[derive(Debug, Clone, PartialEq)]
pub enum Fallback {
    /// A new record offered to the same target.
    RetriedSameTarget(HandoffRecord),
    /// A new record offered to any agent.
    Broadcast(HandoffRecord),
    /// A human operator was notified.
    Escalated,
    /// The failed record was cancelled.
    Aborted,
}

/// Result of driving a handoff.
#[derive(Debug, Clone, PartialEq)]
pub struct HandoffOutcome {
    /// Record after the operation.
    pub record: HandoffRecord,
    /// Fallback applied, if any.
    pub fallback: Option<Fallback>,
}

impl HandoffOutcome {
    fn settled(record: HandoffRecord) -> Self {
        Self {
            record,
            fallback: None,
        }
    }
}

/// Work decided under the lock in [`HandoffCoordinator::acknowledge`].
enum AckPlan {
    Settled(HandoffRecord),
    Expired,
    Transfer {
        manifest: ResourceManifest,
        skipped: usize,
        source: String,
        target: String,
        snapshot: HandoffRecord,
    },
}

/// Owns every handoff record and drives the protocol.
pub struct HandoffCoordinator {
    config: HandoffConfig,
    transfer: Arc<dyn ResourceTransfer>,
    publisher: Option<Arc<dyn EventPublisher>>,
    records: Mutex<HashMap<String, HandoffRecord>>,
}

impl HandoffCoordinator {
    /// Coordinator moving resources through `transfer`.
    #[must_use]
    pub fn new(config: HandoffConfig, transfer: Arc<dyn ResourceTransfer>) -> Self {
        Self {
            config,
            transfer,
            publisher: None,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Publish `handoff_*` events through `publisher`.
    #[must_use]
    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Create a record and offer it to the target, or to every agent when
    /// the target is absent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Handoff` for a missing source or a target equal
    /// to the source.
    pub fn initiate_handoff(&self, request: HandoffRequest) -> Result<HandoffRecord> {
        if request.source_agent_id.trim().is_empty() {
            return Err(AppError::Handoff("source agent id is required".into()));
        }
        if request.target_agent_id.as_deref() == Some(request.source_agent_id.as_str()) {
            return Err(AppError::Handoff(
                "target agent must differ from the source".into(),
            ));
        }
        self.issue(request, 1, None)
    }

    fn issue(
        &self,
        request: HandoffRequest,
        attempt: u32,
        retry_of: Option<String>,
    ) -> Result<HandoffRecord> {
        let timeout_ms = match request.preferences.timeout_ms {
            0 => self.config.default_timeout_ms,
            ms => ms,
        };
        let now = Utc::now();
        let expires_at = i64::try_from(timeout_ms)
            .ok()
            .and_then(TimeDelta::try_milliseconds)
            .and_then(|delta| now.checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let mut record = HandoffRecord::new(request, expires_at);
        record.attempt = attempt;
        record.retry_of = retry_of;
        record.transition(HandoffPhase::Pending, "handoff_initiated")?;

        let snapshot = record.clone();
        self.lock().insert(record.id.clone(), record);

        info!(
            handoff_id = %snapshot.id,
            source_agent_id = %snapshot.request.source_agent_id,
            target_agent_id = snapshot.request.target_agent_id.as_deref(),
            attempt,
            "handoff initiated"
        );
        match snapshot.request.target_agent_id.as_deref() {
            Some(target) => self.emit(target, "handoff_requested", &snapshot),
            None => self.emit(
                &snapshot.request.source_agent_id,
                "handoff_broadcast",
                &snapshot,
            ),
        }
        Ok(snapshot)
    }

    /// Apply the receiver's reply and, when accepted, drive the transfer
    /// to completion.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown id and `AppError::Handoff`
    /// when the record is not pending or the receiver is not its target.
    pub async fn acknowledge(
        &self,
        handoff_id: &str,
        ack: HandoffAcknowledgment,
    ) -> Result<HandoffOutcome> {
        let span = info_span!("handoff_ack", handoff_id, receiver = %ack.receiver_agent_id);
        self.acknowledge_inner(handoff_id, ack).instrument(span).await
    }

    async fn acknowledge_inner(
        &self,
        handoff_id: &str,
        ack: HandoffAcknowledgment,
    ) -> Result<HandoffOutcome> {
        let plan = {
            let mut records = self.lock();
            let record = records
                .get_mut(handoff_id)
                .ok_or_else(|| AppError::NotFound(format!("handoff {handoff_id}")))?;
            plan_ack(record, ack)?
        };

        match plan {
            AckPlan::Expired => Ok(self.expire(handoff_id, Utc::now())?),
            AckPlan::Settled(record) => {
                self.emit(&record.request.source_agent_id, "handoff_rejected", &record);
                info!(phase = %record.phase, "handoff rejected");
                Ok(HandoffOutcome::settled(record))
            }
            AckPlan::Transfer {
                manifest,
                skipped,
                source,
                target,
                snapshot,
            } => {
                self.emit(&source, "transfer_started", &snapshot);
                self.run_transfer(handoff_id, &manifest, skipped, &source, &target)
                    .await
            }
        }
    }

    async fn run_transfer(
        &self,
        handoff_id: &str,
        manifest: &ResourceManifest,
        skipped: usize,
        source: &str,
        target: &str,
    ) -> Result<HandoffOutcome> {
        let mut summary = TransferSummary {
            skipped,
            ..TransferSummary::default()
        };

        for resource in manifest.resources() {
            let key = resource.key();

            {
                let mut records = self.lock();
                let record = get_mut(&mut records, handoff_id)?;
                if record.phase != HandoffPhase::Transfer {
                    info!(phase = %record.phase, "transfer stopped");
                    return Ok(HandoffOutcome::settled(record.clone()));
                }
                if record.is_expired_at(Utc::now()) {
                    drop(records);
                    return self.expire(handoff_id, Utc::now());
                }
                if let Some(progress) = record.progress.as_mut() {
                    progress.current_resource = Some(key.clone());
                    progress.updated_at = Utc::now();
                }
            }

            let moved = self.transfer.transfer(&resource, source, target).await;

            let snapshot = {
                let mut records = self.lock();
                let record = get_mut(&mut records, handoff_id)?;
                if record.phase != HandoffPhase::Transfer {
                    info!(phase = %record.phase, "transfer stopped");
                    return Ok(HandoffOutcome::settled(record.clone()));
                }
                match moved {
                    Ok(()) => {
                        summary.record(&resource);
                        if let Some(progress) = record.progress.as_mut() {
                            progress.transferred += 1;
                            progress.updated_at = Utc::now();
                        }
                        record.record_event("resource_transferred", Some(key));
                        record.clone()
                    }
                    Err(err) => {
                        warn!(resource = %key, %err, recoverable = err.recoverable, "resource transfer failed");
                        fail(
                            record,
                            "transfer_failed",
                            format!("{key}: {err}"),
                            err.recoverable,
                        )?;
                        let failed = record.clone();
                        drop(records);
                        self.emit(source, "handoff_failed", &failed);
                        return self.after_failure(handoff_id);
                    }
                }
            };
            self.emit(source, "handoff_progress", &snapshot);
        }

        let completed = {
            let mut records = self.lock();
            let record = get_mut(&mut records, handoff_id)?;
            if record.phase != HandoffPhase::Transfer {
                return Ok(HandoffOutcome::settled(record.clone()));
            }
            if let Some(progress) = record.progress.as_mut() {
                progress.current_resource = None;
                progress.updated_at = Utc::now();
            }
            record.summary = Some(summary);
            record.new_owner = Some(target.to_owned());
            record.transition(HandoffPhase::Complete, "handoff_completed")?;
            record.clone()
        };

        info!(new_owner = target, "handoff completed");
        self.emit(source, "handoff_completed", &completed);
        Ok(HandoffOutcome::settled(completed))
    }

    /// Cancel a non-terminal handoff at the initiator's request.
    ///
    /// An in-flight transfer observes the cancellation before its next
    /// resource move.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown id and
    /// `AppError::InvalidTransition` for a terminal record.
    pub fn cancel(&self, handoff_id: &str, reason: Option<String>) -> Result<HandoffRecord> {
        let cancelled = {
            let mut records = self.lock();
            let record = get_mut(&mut records, handoff_id)?;
            record.transition(HandoffPhase::Cancelled, "handoff_cancelled")?;
            if let Some(reason) = reason {
                record.record_event("cancel_reason", Some(reason));
            }
            record.clone()
        };
        info!(handoff_id, "handoff cancelled");
        self.emit(&cancelled.request.source_agent_id, "handoff_cancelled", &cancelled);
        Ok(cancelled)
    }

    /// Time out every pending or transferring record past its deadline.
    pub fn expire_overdue(&self) -> Vec<HandoffOutcome> {
        self.expire_overdue_at(Utc::now())
    }

    /// [`expire_overdue`](Self::expire_overdue) evaluated at `now`.
    pub fn expire_overdue_at(&self, now: DateTime<Utc>) -> Vec<HandoffOutcome> {
        let overdue: Vec<String> = self
            .lock()
            .values()
            .filter(|record| {
                matches!(record.phase, HandoffPhase::Pending | HandoffPhase::Transfer)
                    && record.is_expired_at(now)
            })
            .map(|record| record.id.clone())
            .collect();

        overdue
            .iter()
            .filter_map(|id| match self.expire(id, now) {
                Ok(outcome) => Some(outcome),
                Err(err) => {
                    debug!(handoff_id = %id, %err, "expiry skipped");
                    None
                }
            })
            .collect()
    }

    /// Run [`expire_overdue`](Self::expire_overdue) every `interval` until
    /// `cancel` fires.
    pub fn spawn_expiry_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            let expired = coordinator.expire_overdue();
                            if !expired.is_empty() {
                                info!(count = expired.len(), "expired overdue handoffs");
                            }
                        }
                    }
                }
            }
            .instrument(info_span!("handoff_expiry_sweeper")),
        )
    }

    /// Snapshot of one record.
    #[must_use]
    pub fn get(&self, handoff_id: &str) -> Option<HandoffRecord> {
        self.lock().get(handoff_id).cloned()
    }

    /// All records, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<HandoffRecord> {
        self.collect(|_| true)
    }

    /// Records still in `initiate`, `pending` or `transfer`.
    #[must_use]
    pub fn list_active(&self) -> Vec<HandoffRecord> {
        self.collect(|record| record.phase.is_active())
    }

    /// Records where `agent_id` is the source or the target.
    #[must_use]
    pub fn list_for_agent(&self, agent_id: &str) -> Vec<HandoffRecord> {
        self.collect(|record| {
            record.request.source_agent_id == agent_id
                || record.request.target_agent_id.as_deref() == Some(agent_id)
        })
    }

    /// Mark an overdue record failed (transfer) or cancelled (pending) with
    /// a timeout, then apply the fallback policy.
    fn expire(&self, handoff_id: &str, now: DateTime<Utc>) -> Result<HandoffOutcome> {
        let expired = {
            let mut records = self.lock();
            let record = get_mut(&mut records, handoff_id)?;
            if !record.is_expired_at(now) {
                return Ok(HandoffOutcome::settled(record.clone()));
            }
            let message = format!("handoff expired at {}", record.expires_at.to_rfc3339());
            match record.phase {
                HandoffPhase::Transfer => fail(record, "timeout", message, true)?,
                _ => {
                    record.error = Some(failure("timeout", message, true));
                    record.transition(HandoffPhase::Cancelled, "handoff_cancelled")?;
                }
            }
            record.clone()
        };

        warn!(handoff_id, phase = %expired.phase, "handoff timed out");
        let event = match expired.phase {
            HandoffPhase::Failed => "handoff_failed",
            _ => "handoff_cancelled",
        };
        self.emit(&expired.request.source_agent_id, event, &expired);
        self.after_failure(handoff_id)
    }

    /// Apply the fallback policy to a record carrying a failure.
    fn after_failure(&self, handoff_id: &str) -> Result<HandoffOutcome> {
        let record = self
            .get(handoff_id)
            .ok_or_else(|| AppError::NotFound(format!("handoff {handoff_id}")))?;

        let Some(error) = record.error.as_ref() else {
            return Ok(HandoffOutcome::settled(record));
        };
        if !error.recoverable {
            debug!(handoff_id, "failure not recoverable; no fallback");
            return Ok(HandoffOutcome::settled(record));
        }

        let max_retries = match record.request.preferences.max_retries {
            0 => self.config.max_retries,
            n => n,
        };
        let behavior = record.request.preferences.fallback_behavior;
        let reissues = matches!(
            behavior,
            FallbackBehavior::RetrySameTarget | FallbackBehavior::Broadcast
        );
        if reissues && record.attempt > max_retries {
            info!(handoff_id, attempt = record.attempt, max_retries, "handoff retries exhausted");
            let record = self.note(handoff_id, "fallback_exhausted", None)?;
            return Ok(HandoffOutcome::settled(record));
        }

        let fallback = match behavior {
            FallbackBehavior::RetrySameTarget => {
                let retry = self.issue(
                    record.request.clone(),
                    record.attempt + 1,
                    Some(record.id.clone()),
                )?;
                self.note(handoff_id, "fallback_retry", Some(retry.id.clone()))?;
                Fallback::RetriedSameTarget(retry)
            }
            FallbackBehavior::Broadcast => {
                let mut request = record.request.clone();
                request.target_agent_id = None;
                let retry = self.issue(request, record.attempt + 1, Some(record.id.clone()))?;
                self.note(handoff_id, "fallback_broadcast", Some(retry.id.clone()))?;
                Fallback::Broadcast(retry)
            }
            FallbackBehavior::Escalate => {
                let escalated = self.note(handoff_id, "fallback_escalated", None)?;
                self.emit(
                    &escalated.request.source_agent_id,
                    "handoff_escalated",
                    &escalated,
                );
                Fallback::Escalated
            }
            FallbackBehavior::Abort => {
                let mut records = self.lock();
                let current = get_mut(&mut records, handoff_id)?;
                if current.phase == HandoffPhase::Failed {
                    current.transition(HandoffPhase::Cancelled, "handoff_cancelled")?;
                }
                current.record_event("fallback_aborted", None);
                Fallback::Aborted
            }
        };

        let record = self
            .get(handoff_id)
            .ok_or_else(|| AppError::NotFound(format!("handoff {handoff_id}")))?;
        info!(handoff_id, ?behavior, "handoff fallback applied");
        Ok(HandoffOutcome {
            record,
            fallback: Some(fallback),
        })
    }

    fn note(&self, handoff_id: &str, event: &str, detail: Option<String>) -> Result<HandoffRecord> {
        let mut records = self.lock();
        let record = get_mut(&mut records, handoff_id)?;
        record.record_event(event, detail);
        Ok(record.clone())
    }

    fn collect(&self, keep: impl Fn(&HandoffRecord) -> bool) -> Vec<HandoffRecord> {
        let mut records: Vec<HandoffRecord> =
            self.lock().values().filter(|r| keep(r)).cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        records
    }

    fn emit(&self, agent_id: &str, event: &str, record: &HandoffRecord) {
        let Some(publisher) = &self.publisher else {
            return;
        };
        publisher.publish(AgentEvent::new(
            agent_id,
            event,
            json!({
                "handoffId": record.id,
                "phase": record.phase,
                "sourceAgentId": record.request.source_agent_id,
                "targetAgentId": record.request.target_agent_id,
                "reason": record.request.reason,
                "urgency": record.request.urgency,
                "attempt": record.attempt,
                "expiresAt": record.expires_at,
                "progress": record.progress,
                "summary": record.summary,
                "error": record.error,
            }),
        ));
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, HandoffRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Decide what an acknowledgment does to a pending record.
fn plan_ack(record: &mut HandoffRecord, ack: HandoffAcknowledgment) -> Result<AckPlan> {
    if record.phase != HandoffPhase::Pending {
        return Err(AppError::Handoff(format!(
            "handoff {} is {}, not pending",
            record.id, record.phase
        )));
    }
    if let Some(target) = record.request.target_agent_id.as_deref() {
        if target != ack.receiver_agent_id {
            return Err(AppError::Handoff(format!(
                "{} is not the target of handoff {}",
                ack.receiver_agent_id, record.id
            )));
        }
    }
    if record.is_expired_at(Utc::now()) {
        return Ok(AckPlan::Expired);
    }

    let receiver = ack.receiver_agent_id.clone();
    let status = ack.status;
    let accepted = ack.accepted_resources.clone();
    record.acknowledgment = Some(ack);
    record.record_event("acknowledged", Some(format!("{receiver}: {status:?}")));
    if record.request.target_agent_id.is_none() {
        record.request.target_agent_id = Some(receiver.clone());
    }

    let full = record.request.resources.clone();
    let manifest = match status {
        AckStatus::Rejected => {
            record.transition(HandoffPhase::Rejected, "handoff_rejected")?;
            return Ok(AckPlan::Settled(record.clone()));
        }
        AckStatus::Partial if !record.request.preferences.allow_partial_transfer => {
            record.error = Some(failure(
                "partial_not_allowed",
                format!("{receiver} offered a partial acknowledgment"),
                false,
            ));
            record.transition(HandoffPhase::Rejected, "handoff_rejected")?;
            return Ok(AckPlan::Settled(record.clone()));
        }
        AckStatus::Partial => full.intersect(&accepted.unwrap_or_default()),
        AckStatus::Accepted => full.clone(),
    };

    let skipped = full.len() - manifest.len();
    let now = Utc::now();
    record.transition(HandoffPhase::Transfer, "transfer_started")?;
    record.progress = Some(TransferProgress {
        total: manifest.len(),
        transferred: 0,
        current_resource: None,
        started_at: now,
        updated_at: now,
    });

    Ok(AckPlan::Transfer {
        manifest,
        skipped,
        source: record.request.source_agent_id.clone(),
        target: receiver,
        snapshot: record.clone(),
    })
}

fn failure(code: &str, message: String, recoverable: bool) -> HandoffFailure {
    HandoffFailure {
        code: code.to_owned(),
        message,
        recoverable,
        timestamp: Utc::now(),
    }
}

fn fail(record: &mut HandoffRecord, code: &str, message: String, recoverable: bool) -> Result<()> {
    record.transition(HandoffPhase::Failed, "handoff_failed")?;
    record.error = Some(failure(code, message, recoverable));
    Ok(())
}

fn get_mut<'a>(
    records: &'a mut HashMap<String, HandoffRecord>,
    handoff_id: &str,
) -> Result<&'a mut HandoffRecord> {
    records
        .get_mut(handoff_id)
        .ok_or_else(|| AppError::NotFound(format!("handoff {handoff_id}")))
}
