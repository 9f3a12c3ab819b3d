//! # Stage: Proposal Repository
//!
//! ## Responsibility
//! Persistence boundary for proposals and rollback points.  The ledger talks
//! only to [`ProposalRepository`], so the backing store can be swapped without
//! touching the state machine.
//!
//! ## Guarantees
//! - Status changes are compare-and-set: [`ProposalRepository::update_status`]
//!   fails with [`StoreError::StaleStatus`] if the record is no longer in the
//!   expected state, and with [`StoreError::IllegalTransition`] if the move is
//!   not in the transition table.
//! - Every implementation shares the same update semantics through
//!   [`apply_status_update`].
//! - At most one proposal is `applying` a given path: `approved → applying`
//!   is refused with [`StoreError::PathBusy`] while an overlapping record is
//!   still `applying`, including one left behind by a process that died.
//!
//! ## NOT Responsible For
//! - Deciding which transition to make (see `ledger`).

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::error::StoreError;
use crate::self_modify::gateway::RevisionToken;
use crate::self_modify::proposal::{ModificationProposal, ProposalStatus};
use crate::self_modify::rollback::RollbackPoint;

// ---------------------------------------------------------------------------
// StatusUpdate
// ---------------------------------------------------------------------------

/// A compare-and-set status change plus the fields that travel with it.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub expected: ProposalStatus,
    pub next: ProposalStatus,
    pub at_ms: u64,
    /// `Some(Some(id))` records a point, `Some(None)` clears it.
    pub rollback_point_id: Option<Option<String>>,
    pub error_note: Option<String>,
    pub reviewer_note: Option<String>,
    pub apply_deadline_ms: Option<u64>,
}

impl StatusUpdate {
    pub fn new(expected: ProposalStatus, next: ProposalStatus, at_ms: u64) -> Self {
        Self {
            expected,
            next,
            at_ms,
            rollback_point_id: None,
            error_note: None,
            reviewer_note: None,
            apply_deadline_ms: None,
        }
    }

    pub fn with_rollback_point(mut self, id: impl Into<String>) -> Self {
        self.rollback_point_id = Some(Some(id.into()));
        self
    }

    pub fn clearing_rollback_point(mut self) -> Self {
        self.rollback_point_id = Some(None);
        self
    }

    pub fn with_error(mut self, note: impl Into<String>) -> Self {
        self.error_note = Some(note.into());
        self
    }

    pub fn with_reviewer_note(mut self, note: impl Into<String>) -> Self {
        self.reviewer_note = Some(note.into());
        self
    }

    pub fn with_apply_deadline(mut self, at_ms: u64) -> Self {
        self.apply_deadline_ms = Some(at_ms);
        self
    }
}

/// Check and apply `update` to `record` in place.
pub fn apply_status_update(
    record: &mut ModificationProposal,
    update: &StatusUpdate,
) -> Result<(), StoreError> {
    if record.status != update.expected {
        return Err(StoreError::StaleStatus {
            id: record.id.clone(),
            expected: update.expected,
            actual: record.status,
        });
    }
    if !record.status.can_transition_to(update.next) {
        return Err(StoreError::IllegalTransition {
            id: record.id.clone(),
            from: record.status,
            to: update.next,
        });
    }
    record.stamp(update.next, update.at_ms);
    record.status = update.next;
    if let Some(point) = &update.rollback_point_id {
        record.rollback_point_id = point.clone();
    }
    if let Some(note) = &update.error_note {
        record.last_error = Some(note.clone());
    }
    if let Some(note) = &update.reviewer_note {
        record.reviewer_note = Some(note.clone());
    }
    if let Some(deadline) = update.apply_deadline_ms {
        record.timestamps.apply_deadline_ms = Some(deadline);
    }
    Ok(())
}

/// Refuse to start applying `record` while another proposal in `active` is
/// `applying` any of the same paths.  Backends call this inside the same
/// critical section as the `approved → applying` update.
pub fn check_apply_overlap<'a>(
    record: &ModificationProposal,
    active: impl IntoIterator<Item = &'a ModificationProposal>,
) -> Result<(), StoreError> {
    for other in active {
        if other.id == record.id || other.status != ProposalStatus::Applying {
            continue;
        }
        if let Some(path) = record.change_set.paths().find(|p| other.change_set.get(p).is_some()) {
            return Err(StoreError::PathBusy { path: path.clone(), holder: other.id.clone() });
        }
    }
    Ok(())
}

/// Stable listing order: oldest first, then by id.
pub(crate) fn sort_listing(list: &mut [ModificationProposal]) {
    list.sort_by(|a, b| {
        a.timestamps
            .proposed_at_ms
            .cmp(&b.timestamps.proposed_at_ms)
            .then_with(|| a.id.cmp(&b.id))
    });
}

pub(crate) fn sort_points(list: &mut [RollbackPoint]) {
    list.sort_by(|a, b| a.created_at_ms.cmp(&b.created_at_ms).then_with(|| a.id.cmp(&b.id)));
}

// ---------------------------------------------------------------------------
// ProposalRepository trait
// ---------------------------------------------------------------------------

/// Storage for proposals and rollback points.
///
/// Calls are synchronous and short; the ledger never holds one across an
/// `.await`.
pub trait ProposalRepository: Send + Sync {
    fn create(&self, proposal: &ModificationProposal) -> Result<(), StoreError>;

    fn get(&self, id: &str) -> Result<Option<ModificationProposal>, StoreError>;

    /// Compare-and-set the status.  Returns the updated record.
    fn update_status(
        &self,
        id: &str,
        update: &StatusUpdate,
    ) -> Result<ModificationProposal, StoreError>;

    /// All proposals, optionally filtered by status, oldest first.
    fn list(&self, status: Option<ProposalStatus>) -> Result<Vec<ModificationProposal>, StoreError>;

    fn list_pending(&self) -> Result<Vec<ModificationProposal>, StoreError> {
        self.list(Some(ProposalStatus::Pending))
    }

    fn attach_review(&self, id: &str, review_id: &str) -> Result<(), StoreError>;

    /// Replace the base revision snapshot (resubmission).
    fn refresh_base_revisions(
        &self,
        id: &str,
        revisions: BTreeMap<String, Option<RevisionToken>>,
    ) -> Result<(), StoreError>;

    /// Insert or replace a rollback point.
    fn save_rollback_point(&self, point: &RollbackPoint) -> Result<(), StoreError>;

    fn get_rollback_point(&self, id: &str) -> Result<Option<RollbackPoint>, StoreError>;

    /// Every rollback point, oldest first.  One exists per apply attempt, so
    /// this doubles as the durable outcome log.
    fn list_rollback_points(&self) -> Result<Vec<RollbackPoint>, StoreError>;
}

// ---------------------------------------------------------------------------
// InMemoryRepository
// ---------------------------------------------------------------------------

/// `HashMap`-backed repository for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    proposals: Mutex<HashMap<String, ModificationProposal>>,
    points: Mutex<HashMap<String, RollbackPoint>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_proposal<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut ModificationProposal) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut map = self.proposals.lock().map_err(|_| StoreError::Poisoned)?;
        let record = map.get_mut(id).ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        f(record)
    }
}

impl ProposalRepository for InMemoryRepository {
    fn create(&self, proposal: &ModificationProposal) -> Result<(), StoreError> {
        let mut map = self.proposals.lock().map_err(|_| StoreError::Poisoned)?;
        if map.contains_key(&proposal.id) {
            return Err(StoreError::Duplicate(proposal.id.clone()));
        }
        map.insert(proposal.id.clone(), proposal.clone());
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<ModificationProposal>, StoreError> {
        let map = self.proposals.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(map.get(id).cloned())
    }

    fn update_status(
        &self,
        id: &str,
        update: &StatusUpdate,
    ) -> Result<ModificationProposal, StoreError> {
        let mut map = self.proposals.lock().map_err(|_| StoreError::Poisoned)?;
        let current = map.get(id).ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        // Work on a copy so a rejected update leaves the record untouched.
        let mut next = current.clone();
        apply_status_update(&mut next, update)?;
        if update.next == ProposalStatus::Applying {
            check_apply_overlap(&next, map.values())?;
        }
        map.insert(id.to_string(), next.clone());
        Ok(next)
    }

    fn list(&self, status: Option<ProposalStatus>) -> Result<Vec<ModificationProposal>, StoreError> {
        let map = self.proposals.lock().map_err(|_| StoreError::Poisoned)?;
        let mut out: Vec<ModificationProposal> = map
            .values()
            .filter(|p| status.map_or(true, |s| p.status == s))
            .cloned()
            .collect();
        sort_listing(&mut out);
        Ok(out)
    }

    fn attach_review(&self, id: &str, review_id: &str) -> Result<(), StoreError> {
        self.with_proposal(id, |record| {
            record.review_id = Some(review_id.to_string());
            Ok(())
        })
    }

    fn refresh_base_revisions(
        &self,
        id: &str,
        revisions: BTreeMap<String, Option<RevisionToken>>,
    ) -> Result<(), StoreError> {
        self.with_proposal(id, |record| {
            record.base_revisions = revisions;
            Ok(())
        })
    }

    fn save_rollback_point(&self, point: &RollbackPoint) -> Result<(), StoreError> {
        let mut map = self.points.lock().map_err(|_| StoreError::Poisoned)?;
        map.insert(point.id.clone(), point.clone());
        Ok(())
    }

    fn get_rollback_point(&self, id: &str) -> Result<Option<RollbackPoint>, StoreError> {
        let map = self.points.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(map.get(id).cloned())
    }

    fn list_rollback_points(&self) -> Result<Vec<RollbackPoint>, StoreError> {
        let map = self.points.lock().map_err(|_| StoreError::Poisoned)?;
        let mut out: Vec<RollbackPoint> = map.values().cloned().collect();
        sort_points(&mut out);
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
