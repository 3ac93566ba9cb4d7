//! Handoff record, request, and resource manifest types.
//!
//! The phase table lives on [`HandoffPhase::can_transition_to`]; every
//! mutation of a [`HandoffRecord`] phase goes through
//! [`HandoffRecord::transition`], which enforces it and appends the audit
//! entry.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{AppError, Result};

/// Lifecycle phase of a handoff.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HandoffPhase {
    /// Record created, not yet offered.
    Initiate,
    /// Offered to the receiver, awaiting acknowledgment.
    Pending,
    /// Resources are being moved.
    Transfer,
    /// Ownership moved to the receiver.
    Complete,
    /// Receiver declined.
    Rejected,
    /// Transfer or timeout failure.
    Failed,
    /// Stopped at the initiator's request.
    Cancelled,
}

impl HandoffPhase {
    /// Wire name of the phase.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initiate => "initiate",
            Self::Pending => "pending",
            Self::Transfer => "transfer",
            Self::Complete => "complete",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// No outbound transitions exist from a terminal phase.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Cancelled)
    }

    /// Phases in which the record is still making progress and can expire.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Initiate | Self::Pending | Self::Transfer)
    }

    /// Determine whether a phase transition is permitted.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Initiate, Self::Pending | Self::Cancelled)
                | (Self::Pending, Self::Transfer | Self::Rejected | Self::Cancelled)
                | (Self::Transfer, Self::Complete | Self::Failed | Self::Cancelled)
                | (Self::Rejected | Self::Failed, Self::Cancelled)
        )
    }
}

impl fmt::Display for HandoffPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the source agent is handing off.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HandoffReason {
    /// Source is close to its context window.
    ContextLimit,
    /// Target is better suited for the remaining work.
    Specialization,
    /// Spreading load across agents.
    LoadBalance,
    /// Source is shutting down.
    Shutdown,
    /// Operator-requested.
    Manual,
}

/// Handoff urgency hint for receivers.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    /// Can wait.
    Low,
    /// Default.
    #[default]
    Normal,
    /// Should be picked up soon.
    High,
    /// Source is about to lose state.
    Critical,
}

/// What to do after a recoverable failure.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FallbackBehavior {
    /// Re-offer to the same target.
    #[default]
    RetrySameTarget,
    /// Re-offer to any available agent.
    Broadcast,
    /// Notify a human operator and stop.
    Escalate,
    /// Cancel the handoff.
    Abort,
}

/// Access mode of a file reservation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReservationMode {
    /// Only the owner may edit matching files.
    #[default]
    Exclusive,
    /// Other agents may hold shared reservations on the same patterns.
    Shared,
}

/// A reservation over a set of file patterns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct FileReservation {
    /// Reservation identifier.
    pub id: String,
    /// Glob-style path patterns covered.
    pub patterns: Vec<String>,
    /// Access mode.
    #[serde(default)]
    pub mode: ReservationMode,
    /// Reservation expiry, if bounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Everything a receiving agent must acquire to resume the work.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ResourceManifest {
    /// File reservations.
    #[serde(default)]
    pub file_reservations: Vec<FileReservation>,
    /// Checkpoint identifiers.
    #[serde(default)]
    pub checkpoints: Vec<String>,
    /// Pending message identifiers.
    #[serde(default)]
    pub pending_messages: Vec<String>,
    /// Active subscription identifiers.
    #[serde(default)]
    pub subscriptions: Vec<String>,
}

impl ResourceManifest {
    /// Flatten the manifest into transfer order: reservations, checkpoints,
    /// messages, subscriptions.
    #[must_use]
    pub fn resources(&self) -> Vec<Resource> {
        self.file_reservations
            .iter()
            .cloned()
            .map(Resource::FileReservation)
            .chain(self.checkpoints.iter().cloned().map(Resource::Checkpoint))
            .chain(
                self.pending_messages
                    .iter()
                    .cloned()
                    .map(Resource::PendingMessage),
            )
            .chain(self.subscriptions.iter().cloned().map(Resource::Subscription))
            .collect()
    }

    /// Total number of transferable resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.file_reservations.len()
            + self.checkpoints.len()
            + self.pending_messages.len()
            + self.subscriptions.len()
    }

    /// Whether the manifest lists nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keep only entries also present in `accepted` (matched by identifier).
    #[must_use]
    pub fn intersect(&self, accepted: &Self) -> Self {
        Self {
            file_reservations: self
                .file_reservations
                .iter()
                .filter(|r| accepted.file_reservations.iter().any(|a| a.id == r.id))
                .cloned()
                .collect(),
            checkpoints: retain_listed(&self.checkpoints, &accepted.checkpoints),
            pending_messages: retain_listed(&self.pending_messages, &accepted.pending_messages),
            subscriptions: retain_listed(&self.subscriptions, &accepted.subscriptions),
        }
    }
}

fn retain_listed(items: &[String], accepted: &[String]) -> Vec<String> {
    items
        .iter()
        .filter(|item| accepted.contains(item))
        .cloned()
        .collect()
}

/// A single transferable item from a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    /// File reservation.
    FileReservation(FileReservation),
    /// Checkpoint reference.
    Checkpoint(String),
    /// Pending message reference.
    PendingMessage(String),
    /// Subscription reference.
    Subscription(String),
}

impl Resource {
    /// Ledger key, e.g. `reservation:r-1`.
    #[must_use]
    pub fn key(&self) -> String {
        match self {
            Self::FileReservation(r) => format!("reservation:{}", r.id),
            Self::Checkpoint(id) => format!("checkpoint:{id}"),
            Self::PendingMessage(id) => format!("message:{id}"),
            Self::Subscription(id) => format!("subscription:{id}"),
        }
    }
}

/// Context the receiver needs to pick up the work.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct HandoffContext {
    /// What the source was doing.
    pub task_description: String,
    /// Condensed conversation, if available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_summary: Option<String>,
    /// Checkpoint the receiver should restore from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,
    /// Free-form state.
    #[serde(default)]
    pub state: serde_json::Value,
}

/// Receiver-facing preferences for a handoff.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct HandoffPreferences {
    /// Expiry in milliseconds; 0 selects the configured default.
    #[serde(default)]
    pub timeout_ms: u64,
    /// Accept `partial` acknowledgments.
    #[serde(default)]
    pub allow_partial_transfer: bool,
    /// Policy for recoverable failures.
    #[serde(default)]
    pub fallback_behavior: FallbackBehavior,
    /// Retry ceiling; 0 selects the configured default.
    #[serde(default)]
    pub max_retries: u32,
}

impl Default for HandoffPreferences {
    fn default() -> Self {
        Self {
            timeout_ms: 0,
            allow_partial_transfer: false,
            fallback_behavior: FallbackBehavior::RetrySameTarget,
            max_retries: 0,
        }
    }
}

/// A request to move an agent's work to another agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct HandoffRequest {
    /// Agent giving up the work.
    pub source_agent_id: String,
    /// Receiving agent; `None` offers the work to any available agent.
    pub target_agent_id: Option<String>,
    /// Why the handoff is happening.
    pub reason: HandoffReason,
    /// Urgency hint.
    #[serde(default)]
    pub urgency: Urgency,
    /// Context snapshot.
    #[serde(default)]
    pub context: HandoffContext,
    /// Resources to transfer.
    #[serde(default)]
    pub resources: ResourceManifest,
    /// Receiver-facing preferences.
    #[serde(default)]
    pub preferences: HandoffPreferences,
}

impl HandoffRequest {
    /// Minimal request with default context, resources, and preferences.
    #[must_use]
    pub fn new(
        source_agent_id: impl Into<String>,
        target_agent_id: Option<String>,
        reason: HandoffReason,
    ) -> Self {
        Self {
            source_agent_id: source_agent_id.into(),
            target_agent_id,
            reason,
            urgency: Urgency::Normal,
            context: HandoffContext::default(),
            resources: ResourceManifest::default(),
            preferences: HandoffPreferences::default(),
        }
    }
}

/// Receiver verdict.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    /// Take everything.
    Accepted,
    /// Take nothing.
    Rejected,
    /// Take only `accepted_resources`.
    Partial,
}

/// Receiver reply to a pending handoff.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct HandoffAcknowledgment {
    /// Agent replying.
    pub receiver_agent_id: String,
    /// Verdict.
    pub status: AckStatus,
    /// Subset accepted when `status` is `partial`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted_resources: Option<ResourceManifest>,
    /// Free-form reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Reply timestamp.
    pub acknowledged_at: DateTime<Utc>,
}

impl HandoffAcknowledgment {
    /// Build an acknowledgment stamped now.
    #[must_use]
    pub fn new(receiver_agent_id: impl Into<String>, status: AckStatus) -> Self {
        Self {
            receiver_agent_id: receiver_agent_id.into(),
            status,
            accepted_resources: None,
            reason: None,
            acknowledged_at: Utc::now(),
        }
    }
}

/// Resource-transfer counters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TransferProgress {
    /// Resources scheduled for transfer.
    pub total: usize,
    /// Resources moved so far.
    pub transferred: usize,
    /// Resource currently being moved.
    pub current_resource: Option<String>,
    /// Transfer start.
    pub started_at: DateTime<Utc>,
    /// Last counter update.
    pub updated_at: DateTime<Utc>,
}

/// Counts of what moved in a completed handoff.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TransferSummary {
    /// File patterns covered by the moved reservations.
    pub files: usize,
    /// Reservations moved.
    pub reservations: usize,
    /// Checkpoints moved.
    pub checkpoints: usize,
    /// Pending messages moved.
    pub messages: usize,
    /// Subscriptions moved.
    pub subscriptions: usize,
    /// Resources the receiver did not accept.
    pub skipped: usize,
}

impl TransferSummary {
    /// Count one moved resource.
    pub fn record(&mut self, resource: &Resource) {
        match resource {
            Resource::FileReservation(r) => {
                self.reservations += 1;
                self.files += r.patterns.len();
            }
            Resource::Checkpoint(_) => self.checkpoints += 1,
            Resource::PendingMessage(_) => self.messages += 1,
            Resource::Subscription(_) => self.subscriptions += 1,
        }
    }
}

/// Terminal error recorded on a failed handoff.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct HandoffFailure {
    /// Machine-readable code (`timeout`, `transfer_failed`, ...).
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Whether the fallback policy may re-issue the handoff.
    pub recoverable: bool,
    /// When the failure was recorded.
    pub timestamp: DateTime<Utc>,
}

/// Audit entry classification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// Phase change.
    Transition,
    /// Anything else worth recording.
    Event,
}

/// One line of a handoff's append-only audit trail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AuditEntry {
    /// When the entry was appended.
    pub timestamp: DateTime<Utc>,
    /// Transition or event.
    pub kind: AuditKind,
    /// Event name.
    pub event: String,
    /// Phase after the entry.
    pub phase: HandoffPhase,
    /// Optional free-form detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Full state of one handoff.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct HandoffRecord {
    /// Unique record identifier.
    pub id: String,
    /// Current phase.
    pub phase: HandoffPhase,
    /// Originating request.
    pub request: HandoffRequest,
    /// Receiver reply.
    pub acknowledgment: Option<HandoffAcknowledgment>,
    /// Transfer counters.
    pub progress: Option<TransferProgress>,
    /// Failure details.
    pub error: Option<HandoffFailure>,
    /// Moved-resource counts once complete.
    pub summary: Option<TransferSummary>,
    /// Agent owning the work after completion.
    pub new_owner: Option<String>,
    /// 1-based attempt number across fallback re-issues.
    pub attempt: u32,
    /// Record this one re-issues, if any.
    pub retry_of: Option<String>,
    /// Append-only audit trail.
    pub audit_trail: Vec<AuditEntry>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
    /// Deadline for reaching a terminal outcome.
    pub expires_at: DateTime<Utc>,
}

impl HandoffRecord {
    /// Construct a record in [`HandoffPhase::Initiate`] with an empty trail.
    #[must_use]
    pub fn new(request: HandoffRequest, expires_at: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            phase: HandoffPhase::Initiate,
            request,
            acknowledgment: None,
            progress: None,
            error: None,
            summary: None,
            new_owner: None,
            attempt: 1,
            retry_of: None,
            audit_trail: Vec::new(),
            created_at: now,
            updated_at: now,
            expires_at,
        }
    }

    /// Move to `next`, appending a transition entry named `event`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if the table forbids the move;
    /// the record is left unchanged.
    pub fn transition(&mut self, next: HandoffPhase, event: &str) -> Result<()> {
        if !self.phase.can_transition_to(next) {
            return Err(AppError::InvalidTransition(format!(
                "handoff {} cannot move from {} to {next}",
                self.id, self.phase
            )));
        }
        self.phase = next;
        self.push_audit(AuditKind::Transition, event, None);
        Ok(())
    }

    /// Append a non-transition event.
    pub fn record_event(&mut self, event: &str, detail: Option<String>) {
        self.push_audit(AuditKind::Event, event, detail);
    }

    /// Transition entries only, oldest first.
    pub fn transitions(&self) -> impl Iterator<Item = &AuditEntry> {
        self.audit_trail
            .iter()
            .filter(|entry| entry.kind == AuditKind::Transition)
    }

    /// Whether the deadline has passed at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.phase.is_active() && now >= self.expires_at
    }

    fn push_audit(&mut self, kind: AuditKind, event: &str, detail: Option<String>) {
        let now = Utc::now();
        self.updated_at = now;
        self.audit_trail.push(AuditEntry {
            timestamp: now,
            kind,
            event: event.to_owned(),
            phase: self.phase,
            detail,
        });
    }
}
