//! # Stage: External Collaborators
//!
//! ## Responsibility
//! The two outward-facing seams the ledger calls but never depends on for
//! correctness: the hosted review system and the notification sink.
//!
//! ## Guarantees
//! - Fire-and-forget: the ledger logs collaborator failures with
//!   `tracing::warn!` and carries on; they never change proposal status.
//!
//! ## NOT Responsible For
//! - Formatting or delivering notifications to humans.
//! - Review UI.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::self_modify::proposal::{ChangeSet, ProposalMetadata};

// ---------------------------------------------------------------------------
// HostedReviewSystem
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
#[error("review request failed: {0}")]
pub struct ReviewError(pub String);

/// Opens a tracking review (pull request, merge request…) for an approved change.
pub trait HostedReviewSystem: Send + Sync {
    fn create_review_request(
        &self,
        change_set: &ChangeSet,
        metadata: &ProposalMetadata,
    ) -> Result<String, ReviewError>;
}

/// A request the [`RecordingReviewSystem`] received.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedReview {
    pub review_id: String,
    pub target: String,
    pub paths: Vec<String>,
}

/// Review system that records requests in memory and hands out sequential ids.
#[derive(Debug, Default)]
pub struct RecordingReviewSystem {
    requests: Mutex<Vec<RecordedReview>>,
    fail: bool,
}

impl RecordingReviewSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// A review system whose every request fails.
    pub fn failing() -> Self {
        Self { requests: Mutex::new(Vec::new()), fail: true }
    }

    pub fn requests(&self) -> Vec<RecordedReview> {
        match self.requests.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => Vec::new(),
        }
    }
}

impl HostedReviewSystem for RecordingReviewSystem {
    fn create_review_request(
        &self,
        change_set: &ChangeSet,
        metadata: &ProposalMetadata,
    ) -> Result<String, ReviewError> {
        if self.fail {
            return Err(ReviewError("review system offline".into()));
        }
        let mut guard = self
            .requests
            .lock()
            .map_err(|_| ReviewError("internal mutex poisoned".into()))?;
        let review_id = format!("review-{}", guard.len() + 1);
        guard.push(RecordedReview {
            review_id: review_id.clone(),
            target: metadata.target.clone(),
            paths: change_set.paths().cloned().collect(),
        });
        Ok(review_id)
    }
}

// ---------------------------------------------------------------------------
// NotificationSink
// ---------------------------------------------------------------------------

/// Lifecycle events emitted by the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    Proposed { proposal_id: String, action: String },
    Escalated { proposal_id: String, reason: String },
    Rejected { proposal_id: String, reason: String },
    Approved { proposal_id: String, by: String },
    Applied { proposal_id: String, files: usize },
    ApplyFailed { proposal_id: String, error: String },
    RolledBack { proposal_id: String, rollback_point_id: String },
    /// Compensation or rollback could not restore every path; needs a human.
    CompensationFailed { proposal_id: String, paths: Vec<String> },
}

impl PipelineEvent {
    pub fn proposal_id(&self) -> &str {
        match self {
            PipelineEvent::Proposed { proposal_id, .. }
            | PipelineEvent::Escalated { proposal_id, .. }
            | PipelineEvent::Rejected { proposal_id, .. }
            | PipelineEvent::Approved { proposal_id, .. }
            | PipelineEvent::Applied { proposal_id, .. }
            | PipelineEvent::ApplyFailed { proposal_id, .. }
            | PipelineEvent::RolledBack { proposal_id, .. }
            | PipelineEvent::CompensationFailed { proposal_id, .. } => proposal_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PipelineEvent::Proposed { .. } => "proposed",
            PipelineEvent::Escalated { .. } => "escalated",
            PipelineEvent::Rejected { .. } => "rejected",
            PipelineEvent::Approved { .. } => "approved",
            PipelineEvent::Applied { .. } => "applied",
            PipelineEvent::ApplyFailed { .. } => "apply_failed",
            PipelineEvent::RolledBack { .. } => "rolled_back",
            PipelineEvent::CompensationFailed { .. } => "compensation_failed",
        }
    }
}

#[derive(Debug, Error)]
#[error("notification failed: {0}")]
pub struct NotifyError(pub String);

pub trait NotificationSink: Send + Sync {
    fn notify(&self, event: &PipelineEvent) -> Result<(), NotifyError>;
}

/// Emits every event as a structured `tracing` record.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&self, event: &PipelineEvent) -> Result<(), NotifyError> {
        tracing::info!(
            target: "autopatch::events",
            event = event.name(),
            proposal_id = %event.proposal_id(),
            detail = ?event,
            "pipeline event"
        );
        Ok(())
    }
}

/// Collects events in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<PipelineEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PipelineEvent> {
        match self.events.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => Vec::new(),
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(|e| e.name()).collect()
    }
}

impl NotificationSink for MemorySink {
    fn notify(&self, event: &PipelineEvent) -> Result<(), NotifyError> {
        self.events
            .lock()
            .map_err(|_| NotifyError("internal mutex poisoned".into()))?
            .push(event.clone());
        Ok(())
    }
}
