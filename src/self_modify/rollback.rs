//! # Stage: Rollback Manager
//!
//! ## Responsibility
//! Capture the pre-change state of every path an `apply()` touches, and
//! restore it on demand: either as compensation for a failed apply or as an
//! explicit `rollback()`.
//!
//! ## Guarantees
//! - Capture-before-write: an entry exists for a path before its write is
//!   attempted.  The ledger persists a [`RollbackPointBuilder::snapshot`]
//!   after every capture, and the captured entry names the revision the write
//!   will produce, so a write that lands without being marked (process death,
//!   dropped future) is still recognised and restored.
//! - Reverse order: restore walks entries last-written-first.
//! - Idempotent: a path already back at its original state is reported as
//!   [`RestoreOutcome::AlreadyOriginal`] and left untouched; a second restore
//!   of the same point is a no-op.
//! - Conflict-safe: a path modified by someone else after the apply is never
//!   clobbered; it is reported as [`RestoreOutcome::Failed`].
//!
//! ## NOT Responsible For
//! - Persisting points (see `repository`).
//! - Path locking (the ledger holds the lock while restoring).

use serde::{Deserialize, Serialize};

use crate::self_modify::gateway::{GatewayError, RevisionToken, VersionControlGateway};
use crate::self_modify::proposal::now_ms;

// ---------------------------------------------------------------------------
// RollbackPoint
// ---------------------------------------------------------------------------

/// What a path looked like before the apply touched it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum OriginalState {
    Content {
        content: String,
        revision: RevisionToken,
    },
    /// The path did not exist; restoring means deleting it.
    Tombstone,
}

impl OriginalState {
    pub fn revision(&self) -> Option<&RevisionToken> {
        match self {
            OriginalState::Content { revision, .. } => Some(revision),
            OriginalState::Tombstone => None,
        }
    }
}

/// What the apply is about to leave at a path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum IntendedState {
    Content { revision: RevisionToken },
    Deleted,
}

impl IntendedState {
    /// Target state of a write of `content`.  Assumes the gateway's tokens
    /// are content hashes; with any other scheme an unmarked write is
    /// reported as not restored instead of being reverted.
    pub fn write_of(content: &str) -> Self {
        IntendedState::Content { revision: RevisionToken::of_content(content) }
    }

    fn matches(&self, current: Option<&RevisionToken>) -> bool {
        match self {
            IntendedState::Content { revision } => current == Some(revision),
            IntendedState::Deleted => current.is_none(),
        }
    }
}

/// One captured path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackEntry {
    pub path: String,
    pub original: OriginalState,
    /// Whether the apply's write of this path completed.
    pub written: bool,
    /// Revision produced by the apply.  `None` when the apply deleted the path
    /// or never wrote it.
    pub applied_revision: Option<RevisionToken>,
    /// Set at capture time; lets a restore recognise a write that landed
    /// before `written` was recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intended: Option<IntendedState>,
}

/// Snapshot of every path an apply touched, in write order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackPoint {
    pub id: String,
    pub proposal_id: String,
    pub entries: Vec<RollbackEntry>,
    pub created_at_ms: u64,
    /// `false` for the partial point left by a failed apply.
    pub complete: bool,
}

impl RollbackPoint {
    pub fn paths(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.path.clone()).collect()
    }

    pub fn written_count(&self) -> usize {
        self.entries.iter().filter(|e| e.written).count()
    }
}

// ---------------------------------------------------------------------------
// RollbackPointBuilder
// ---------------------------------------------------------------------------

/// Accumulates entries while an apply is in progress.
#[derive(Debug)]
pub struct RollbackPointBuilder {
    id: String,
    proposal_id: String,
    entries: Vec<RollbackEntry>,
    created_at_ms: u64,
}

impl RollbackPointBuilder {
    pub fn new(proposal_id: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            proposal_id: proposal_id.into(),
            entries: Vec::new(),
            created_at_ms: now_ms(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Record the original state of `path`.  Must precede the write.
    pub fn capture(&mut self, path: &str, original: OriginalState) {
        self.entries.push(RollbackEntry {
            path: path.to_string(),
            original,
            written: false,
            applied_revision: None,
            intended: None,
        });
    }

    /// [`capture`](Self::capture), also recording what the write will leave.
    pub fn capture_for(&mut self, path: &str, original: OriginalState, intended: IntendedState) {
        self.capture(path, original);
        if let Some(entry) = self.entries.last_mut() {
            entry.intended = Some(intended);
        }
    }

    /// Mark the most recent capture of `path` as written.
    pub fn mark_written(&mut self, path: &str, applied_revision: Option<RevisionToken>) {
        if let Some(entry) = self.entries.iter_mut().rev().find(|e| e.path == path) {
            entry.written = true;
            entry.applied_revision = applied_revision;
        }
    }

    pub fn written_count(&self) -> usize {
        self.entries.iter().filter(|e| e.written).count()
    }

    /// Partial point reflecting progress so far, for persisting mid-apply.
    pub fn snapshot(&self) -> RollbackPoint {
        RollbackPoint {
            id: self.id.clone(),
            proposal_id: self.proposal_id.clone(),
            entries: self.entries.clone(),
            created_at_ms: self.created_at_ms,
            complete: false,
        }
    }

    /// Point for a fully successful apply.
    pub fn finish(self) -> RollbackPoint {
        self.build(true)
    }

    /// Point for an apply that failed part-way through.
    pub fn partial(self) -> RollbackPoint {
        self.build(false)
    }

    fn build(self, complete: bool) -> RollbackPoint {
        RollbackPoint {
            id: self.id,
            proposal_id: self.proposal_id,
            entries: self.entries,
            created_at_ms: self.created_at_ms,
            complete,
        }
    }
}

// ---------------------------------------------------------------------------
// RestoreReport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RestoreOutcome {
    Restored,
    AlreadyOriginal,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathRestore {
    pub path: String,
    pub outcome: RestoreOutcome,
}

/// Per-path result of a restore, in the order paths were restored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreReport {
    pub outcomes: Vec<PathRestore>,
}

impl RestoreReport {
    /// True when every path is back at its original state.
    pub fn fully_restored(&self) -> bool {
        self.outcomes
            .iter()
            .all(|o| !matches!(o.outcome, RestoreOutcome::Failed { .. }))
    }

    pub fn failures(&self) -> Vec<&PathRestore> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.outcome, RestoreOutcome::Failed { .. }))
            .collect()
    }

    pub fn restored_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.outcome == RestoreOutcome::Restored)
            .count()
    }

    /// One-line summary for error messages.
    pub fn summary(&self) -> String {
        if self.fully_restored() {
            "restored all paths".to_string()
        } else {
            let failed: Vec<&str> = self.failures().iter().map(|f| f.path.as_str()).collect();
            format!("incomplete: {} path(s) not restored [{}]", failed.len(), failed.join(", "))
        }
    }
}

// ---------------------------------------------------------------------------
// RollbackManager
// ---------------------------------------------------------------------------

/// Stateless restorer.  All state lives in the [`RollbackPoint`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RollbackManager;

impl RollbackManager {
    pub fn new() -> Self {
        Self
    }

    /// Restore every entry of `point`, last-written first.
    ///
    /// Never returns early: each path gets its own outcome so the caller can
    /// report exactly what is left to fix by hand.
    pub async fn restore<G: VersionControlGateway>(
        &self,
        gateway: &G,
        point: &RollbackPoint,
    ) -> RestoreReport {
        let mut report = RestoreReport::default();
        for entry in point.entries.iter().rev() {
            let outcome = match restore_entry(gateway, entry).await {
                Ok(outcome) => outcome,
                Err(e) => RestoreOutcome::Failed { reason: e.to_string() },
            };
            match &outcome {
                RestoreOutcome::Failed { reason } => tracing::warn!(
                    target: "autopatch::rollback",
                    point_id = %point.id,
                    path = %entry.path,
                    reason = %reason,
                    "path not restored"
                ),
                other => tracing::debug!(
                    target: "autopatch::rollback",
                    point_id = %point.id,
                    path = %entry.path,
                    outcome = ?other,
                    "path restored"
                ),
            }
            report.outcomes.push(PathRestore { path: entry.path.clone(), outcome });
        }
        report
    }
}

async fn restore_entry<G: VersionControlGateway>(
    gateway: &G,
    entry: &RollbackEntry,
) -> Result<RestoreOutcome, GatewayError> {
    let current = gateway.read(&entry.path).await?;
    let current_rev = current.as_ref().map(|s| &s.revision);

    if current_rev == entry.original.revision() {
        return Ok(RestoreOutcome::AlreadyOriginal);
    }
    let landed = if entry.written {
        current_rev == entry.applied_revision.as_ref()
    } else {
        entry.intended.as_ref().is_some_and(|i| i.matches(current_rev))
    };
    if !landed {
        return Ok(RestoreOutcome::Failed {
            reason: format!(
                "modified since apply (current revision {})",
                current_rev.map(|r| r.to_string()).unwrap_or_else(|| "absent".into())
            ),
        });
    }

    match (&entry.original, current_rev) {
        (OriginalState::Content { content, .. }, expected) => {
            gateway.write(&entry.path, content, expected).await?;
        }
        (OriginalState::Tombstone, Some(expected)) => {
            gateway.delete(&entry.path, expected).await?;
        }
        // Tombstone original with an absent current path was caught above.
        (OriginalState::Tombstone, None) => return Ok(RestoreOutcome::AlreadyOriginal),
    }
    Ok(RestoreOutcome::Restored)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
