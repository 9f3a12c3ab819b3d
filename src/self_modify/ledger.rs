//! # Stage: Modification Ledger
//!
//! ## Responsibility
//! Owns the proposal state machine and orchestrates every other stage:
//!
//! ```text
//! propose ─► guardrails ─► risk ─► confidence ─► decision ─► persist
//!                                                   │
//!            approve_pending / reject_pending ◄─────┘ (escalated)
//!
//! apply: lock ─► applying ─► verify tokens ─► CAS write per file ─► applied
//!                                   │                │
//!                                   ▼                ▼ (failure / timeout / cancel)
//!                                 failed      compensate ─► failed
//!
//! rollback: lock ─► restore from point ─► rolled_back
//!
//! recover (interrupted apply): lock ─► point complete? ─► applied
//!                                           └─► restore ─► failed
//! ```
//!
//! ## Guarantees
//! - A restricted path never reaches `approved` or `applied`; human approval
//!   re-runs the guardrails.
//! - Every write is a compare-and-swap on the token captured at propose time.
//! - Overlapping applies fail fast with `Conflict`; disjoint ones run in parallel.
//! - A failed apply is always compensated and leaves a persisted partial
//!   rollback point.
//! - Apply progress is persisted before every write, so an apply that never
//!   returns (dropped future, killed process) can be finished or compensated
//!   by `recover()` once its deadline has passed.
//! - Outcome history is replayed from the repository at construction, so
//!   confidence scoring sees every past apply, not just this process's.
//! - Collaborator (review, notification) failures are logged, never propagated.
//!
//! ## NOT Responsible For
//! - Blocking on human input: escalation persists and returns.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult, StoreError};
use crate::self_modify::collaborators::{
    HostedReviewSystem, NotificationSink, PipelineEvent, RecordingReviewSystem, TracingSink,
};
use crate::self_modify::confidence::{
    ConfidenceAssessment, ConfidenceScorer, OutcomeHistory, ScoringContext,
};
use crate::self_modify::decision::{Decision, DecisionAction, DecisionEngine};
use crate::self_modify::gateway::{FileSnapshot, GatewayError, RevisionToken, VersionControlGateway};
use crate::self_modify::guardrails::{SafetyGuardrails, ScanReport};
use crate::self_modify::locks::{LockError, PathLockGuard, PathLockTable};
use crate::self_modify::patterns::PatternTable;
use crate::self_modify::proposal::{
    now_ms, ChangeSet, FileChange, ModificationProposal, ProposalMetadata, ProposalStatus,
    ProposalTimestamps, RiskLevel,
};
use crate::self_modify::repository::{ProposalRepository, StatusUpdate};
use crate::self_modify::risk::{RiskAnalyzer, RiskAssessment};
use crate::self_modify::rollback::{
    IntendedState, OriginalState, RestoreOutcome, RestoreReport, RollbackManager, RollbackPoint,
    RollbackPointBuilder,
};

// ---------------------------------------------------------------------------
// Public result types
// ---------------------------------------------------------------------------

/// Everything the scoring stages produced for one change set.
#[derive(Debug, Clone, Serialize)]
pub struct Evaluation {
    pub scan: ScanReport,
    pub risk: RiskAssessment,
    pub confidence: ConfidenceAssessment,
    pub decision: Decision,
}

/// Result of `propose()`.  A reject is a successful call whose decision is
/// `reject`; use [`ProposalOutcome::rejection_error`] to turn it into an error.
#[derive(Debug, Clone, Serialize)]
pub struct ProposalOutcome {
    pub proposal: ModificationProposal,
    pub evaluation: Evaluation,
}

impl ProposalOutcome {
    pub fn action(&self) -> DecisionAction {
        self.proposal.decision.action
    }

    pub fn rejection_error(&self) -> Option<PipelineError> {
        self.proposal.decision.rejection_error()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApplyReport {
    pub proposal_id: String,
    pub rollback_point_id: String,
    pub files_written: usize,
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RollbackReport {
    pub proposal_id: String,
    pub rollback_point_id: String,
    /// `true` when the proposal was already rolled back and nothing was done.
    pub already_rolled_back: bool,
    pub restore: RestoreReport,
}

/// Result of `recover()` on a proposal left in `applying`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryReport {
    pub proposal_id: String,
    pub rollback_point_id: String,
    /// `applied` when every write had completed, otherwise `failed`.
    pub status: ProposalStatus,
    pub restore: RestoreReport,
}

/// Caller-side handle for one `apply()`: cancellation and an optional
/// per-call time budget.
#[derive(Debug, Clone, Default)]
pub struct ApplyControl {
    cancelled: Arc<AtomicBool>,
    timeout: Option<Duration>,
}

impl ApplyControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Request cancellation.  Before the write phase this aborts cleanly;
    /// after it, cancellation takes effect at the next file boundary.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// ModificationLedger
// ---------------------------------------------------------------------------

/// The orchestrator.  Share it as `Arc<ModificationLedger<G, R>>`.
pub struct ModificationLedger<G, R> {
    gateway: G,
    repo: R,
    guardrails: SafetyGuardrails,
    analyzer: RiskAnalyzer,
    scorer: ConfidenceScorer,
    engine: DecisionEngine,
    history: OutcomeHistory,
    rollback: RollbackManager,
    locks: PathLockTable,
    review: Arc<dyn HostedReviewSystem>,
    sink: Arc<dyn NotificationSink>,
    apply_timeout: Duration,
}

impl<G, R> ModificationLedger<G, R>
where
    G: VersionControlGateway,
    R: ProposalRepository,
{
    /// Build a ledger from a validated config and replay the outcome history
    /// recorded in `repo`.
    ///
    /// # Errors
    /// `PipelineError::Config` from validation or pattern compilation, and
    /// `PipelineError::Storage` if the history cannot be read.
    pub fn new(gateway: G, repo: R, config: &PipelineConfig) -> PipelineResult<Self> {
        config.validate()?;
        let table = Arc::new(PatternTable::compile(&config.patterns)?);
        let ledger = Self {
            gateway,
            repo,
            guardrails: SafetyGuardrails::new(Arc::clone(&table)),
            analyzer: RiskAnalyzer::new(table),
            scorer: ConfidenceScorer::new(config.scoring.clone()),
            engine: DecisionEngine::new(config.policy.auto_approve_threshold),
            history: OutcomeHistory::new(config.scoring.ema_alpha),
            rollback: RollbackManager::new(),
            locks: PathLockTable::new(),
            review: Arc::new(RecordingReviewSystem::new()),
            sink: Arc::new(TracingSink),
            apply_timeout: config.policy.apply_timeout(),
        };
        ledger.replay_history()?;
        Ok(ledger)
    }

    pub fn with_review_system(mut self, review: Arc<dyn HostedReviewSystem>) -> Self {
        self.review = review;
        self
    }

    pub fn with_notification_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    pub fn repository(&self) -> &R {
        &self.repo
    }

    pub fn history(&self) -> &OutcomeHistory {
        &self.history
    }

    // -----------------------------------------------------------------------
    // Evaluation
    // -----------------------------------------------------------------------

    /// Run guardrails, risk, confidence and decision without persisting.
    pub fn evaluate(&self, change_set: &ChangeSet, metadata: &ProposalMetadata) -> Evaluation {
        let scan = self.guardrails.scan(change_set);
        let risk = self.analyzer.assess(change_set).merge_scan(&scan);
        let confidence = self.scorer.score(&ScoringContext {
            trigger: metadata.trigger,
            file_count: change_set.len(),
            historical_success: self.history.success_rate(metadata.kind),
        });
        let decision = self.engine.decide(metadata, &risk, &confidence);
        Evaluation { scan, risk, confidence, decision }
    }

    // -----------------------------------------------------------------------
    // propose
    // -----------------------------------------------------------------------

    pub async fn propose(
        &self,
        change_set: ChangeSet,
        metadata: ProposalMetadata,
    ) -> PipelineResult<ProposalOutcome> {
        validate(&change_set, &metadata)?;
        let base_revisions = self.snapshot_revisions(&change_set).await?;

        let evaluation = self.evaluate(&change_set, &metadata);
        let decision = evaluation.decision.clone();
        let status = match decision.action {
            DecisionAction::Approve => ProposalStatus::Approved,
            DecisionAction::Escalate => ProposalStatus::Pending,
            DecisionAction::Reject => ProposalStatus::Rejected,
        };
        let now = now_ms();
        let proposal = ModificationProposal {
            id: uuid::Uuid::new_v4().to_string(),
            metadata,
            change_set,
            base_revisions,
            status,
            required_risk: evaluation.risk.required_risk_level,
            allowed: evaluation.risk.allowed,
            decision,
            review_id: None,
            rollback_point_id: None,
            reviewer_note: None,
            last_error: None,
            timestamps: ProposalTimestamps {
                proposed_at_ms: now,
                decided_at_ms: (status != ProposalStatus::Pending).then_some(now),
                ..ProposalTimestamps::default()
            },
        };
        self.repo.create(&proposal)?;

        tracing::info!(
            target: "autopatch::ledger",
            proposal_id = %proposal.id,
            action = %proposal.decision.action,
            required = %proposal.required_risk,
            declared = %proposal.metadata.declared_risk,
            confidence = proposal.decision.inputs.confidence,
            files = proposal.change_set.len(),
            "proposal recorded"
        );

        self.emit(PipelineEvent::Proposed {
            proposal_id: proposal.id.clone(),
            action: proposal.decision.action.to_string(),
        });
        let mut proposal = proposal;
        match proposal.decision.action {
            DecisionAction::Approve => {
                if let Some(review_id) = self.request_review(&proposal) {
                    proposal.review_id = Some(review_id);
                }
            }
            DecisionAction::Escalate => self.emit(PipelineEvent::Escalated {
                proposal_id: proposal.id.clone(),
                reason: proposal.decision.reasoning.clone(),
            }),
            DecisionAction::Reject => self.emit(PipelineEvent::Rejected {
                proposal_id: proposal.id.clone(),
                reason: proposal.decision.reasoning.clone(),
            }),
        }

        Ok(ProposalOutcome { proposal, evaluation })
    }

    // -----------------------------------------------------------------------
    // Human review
    // -----------------------------------------------------------------------

    /// Out-of-band approval of an escalated proposal.
    ///
    /// Guardrails and the risk check run again; a proposal that fails either
    /// is moved to `rejected` and the corresponding error returned.
    pub fn approve_pending(&self, id: &str, reviewer: &str) -> PipelineResult<ModificationProposal> {
        let proposal = self.require(id)?;
        if proposal.status != ProposalStatus::Pending {
            return Err(PipelineError::InvalidTransition {
                from: proposal.status,
                to: ProposalStatus::Approved,
            });
        }

        if let Err(e) = self.recheck(&proposal) {
            let update = StatusUpdate::new(ProposalStatus::Pending, ProposalStatus::Rejected, now_ms())
                .with_reviewer_note(format!("approval by {} refused: {}", reviewer, e));
            self.transition(id, &update)?;
            self.emit(PipelineEvent::Rejected { proposal_id: id.to_string(), reason: e.to_string() });
            return Err(e);
        }

        let update = StatusUpdate::new(ProposalStatus::Pending, ProposalStatus::Approved, now_ms())
            .with_reviewer_note(format!("approved by {}", reviewer));
        let mut updated = self.transition(id, &update)?;
        tracing::info!(target: "autopatch::ledger", proposal_id = %id, reviewer, "proposal approved by reviewer");
        self.emit(PipelineEvent::Approved { proposal_id: id.to_string(), by: reviewer.to_string() });
        if let Some(review_id) = self.request_review(&updated) {
            updated.review_id = Some(review_id);
        }
        Ok(updated)
    }

    pub fn reject_pending(
        &self,
        id: &str,
        reviewer: &str,
        reason: &str,
    ) -> PipelineResult<ModificationProposal> {
        let proposal = self.require(id)?;
        if proposal.status != ProposalStatus::Pending {
            return Err(PipelineError::InvalidTransition {
                from: proposal.status,
                to: ProposalStatus::Rejected,
            });
        }
        let update = StatusUpdate::new(ProposalStatus::Pending, ProposalStatus::Rejected, now_ms())
            .with_reviewer_note(format!("rejected by {}: {}", reviewer, reason));
        let updated = self.transition(id, &update)?;
        tracing::info!(target: "autopatch::ledger", proposal_id = %id, reviewer, "proposal rejected by reviewer");
        self.emit(PipelineEvent::Rejected { proposal_id: id.to_string(), reason: reason.to_string() });
        Ok(updated)
    }

    // -----------------------------------------------------------------------
    // apply
    // -----------------------------------------------------------------------

    pub async fn apply(&self, id: &str) -> PipelineResult<ApplyReport> {
        self.apply_with(id, &ApplyControl::new()).await
    }

    pub async fn apply_with(&self, id: &str, control: &ApplyControl) -> PipelineResult<ApplyReport> {
        let proposal = self.require(id)?;
        if proposal.status != ProposalStatus::Approved {
            return Err(PipelineError::InvalidTransition {
                from: proposal.status,
                to: ProposalStatus::Applying,
            });
        }
        if !proposal.allowed || proposal.required_risk == RiskLevel::Restricted {
            return Err(PipelineError::GuardrailViolation(proposal.decision.reasoning.clone()));
        }

        let paths = proposal.paths();
        let _lock = self.lock_paths(&paths)?;
        if control.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let budget = control.timeout.unwrap_or(self.apply_timeout);
        let deadline = Instant::now() + budget;
        let budget_ms = budget.as_millis() as u64;
        let mut builder = RollbackPointBuilder::new(id);
        self.transition(
            id,
            &StatusUpdate::new(ProposalStatus::Approved, ProposalStatus::Applying, now_ms())
                .with_rollback_point(builder.id())
                .with_apply_deadline(now_ms().saturating_add(budget_ms)),
        )?;
        tracing::info!(target: "autopatch::ledger", proposal_id = %id, files = paths.len(), budget_ms, "apply started");

        // Verification: nothing has been written yet, so dropping on timeout is safe.
        let snapshots = match tokio::time::timeout_at(deadline, self.verify_base(&proposal)).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => return Err(self.fail_apply(&proposal, builder, e).await),
            Err(_) => {
                let e = PipelineError::Timeout { budget_ms };
                return Err(self.fail_apply(&proposal, builder, e).await);
            }
        };

        for (path, snapshot) in snapshots {
            if control.is_cancelled() {
                if builder.written_count() == 0 {
                    return Err(self.cancel_before_writes(id));
                }
                return Err(self.fail_apply(&proposal, builder, PipelineError::Cancelled).await);
            }
            if Instant::now() >= deadline {
                let e = PipelineError::Timeout { budget_ms };
                return Err(self.fail_apply(&proposal, builder, e).await);
            }

            let original = match &snapshot {
                Some(s) => OriginalState::Content { content: s.content.clone(), revision: s.revision.clone() },
                None => OriginalState::Tombstone,
            };
            let change = proposal.change_set.get(&path);
            let intended = match change {
                Some(FileChange::Write(content)) => IntendedState::write_of(content),
                _ => IntendedState::Deleted,
            };
            builder.capture_for(&path, original, intended);
            // The capture must be durable before the write it describes.
            if let Err(e) = self.repo.save_rollback_point(&builder.snapshot()) {
                return Err(self.fail_apply(&proposal, builder, e.into()).await);
            }

            let expected = snapshot.as_ref().map(|s| &s.revision);
            let result = match change {
                Some(FileChange::Write(content)) => {
                    self.gateway.write(&path, content, expected).await.map(Some)
                }
                Some(FileChange::Delete) => match expected {
                    Some(rev) => self.gateway.delete(&path, rev).await.map(|_| None),
                    None => Ok(None),
                },
                None => Ok(None),
            };
            match result {
                Ok(applied) => {
                    tracing::debug!(target: "autopatch::ledger", proposal_id = %id, path = %path, "file applied");
                    builder.mark_written(&path, applied);
                    // The saved capture already names the intended state, so a
                    // lost progress update is still recoverable.
                    if let Err(e) = self.repo.save_rollback_point(&builder.snapshot()) {
                        tracing::warn!(target: "autopatch::ledger", proposal_id = %id, path = %path, error = %e, "could not persist apply progress");
                    }
                }
                Err(e) => {
                    return Err(self.fail_apply(&proposal, builder, gateway_error(e)).await);
                }
            }
        }

        let files_written = builder.written_count();
        let point = builder.finish();
        self.repo.save_rollback_point(&point)?;
        self.transition(
            id,
            &StatusUpdate::new(ProposalStatus::Applying, ProposalStatus::Applied, now_ms())
                .with_rollback_point(point.id.clone()),
        )?;
        self.history.record(proposal.metadata.kind, true);

        tracing::info!(
            target: "autopatch::ledger",
            proposal_id = %id,
            rollback_point_id = %point.id,
            files_written,
            "apply complete"
        );
        self.emit(PipelineEvent::Applied { proposal_id: id.to_string(), files: files_written });

        Ok(ApplyReport {
            proposal_id: id.to_string(),
            rollback_point_id: point.id,
            files_written,
            paths,
        })
    }

    // -----------------------------------------------------------------------
    // rollback
    // -----------------------------------------------------------------------

    /// Restore every path from `rollback_point_id`.  Idempotent: a second call
    /// on a rolled-back proposal succeeds without touching the store.
    pub async fn rollback(&self, id: &str, rollback_point_id: &str) -> PipelineResult<RollbackReport> {
        let proposal = self.require(id)?;
        if proposal.rollback_point_id.as_deref() != Some(rollback_point_id) {
            return Err(PipelineError::RollbackPointMismatch {
                proposal_id: id.to_string(),
                given: rollback_point_id.to_string(),
                recorded: proposal.rollback_point_id.clone(),
            });
        }
        if proposal.status == ProposalStatus::RolledBack {
            return Ok(RollbackReport {
                proposal_id: id.to_string(),
                rollback_point_id: rollback_point_id.to_string(),
                already_rolled_back: true,
                restore: RestoreReport::default(),
            });
        }
        if !matches!(proposal.status, ProposalStatus::Applied | ProposalStatus::Failed) {
            return Err(PipelineError::InvalidTransition {
                from: proposal.status,
                to: ProposalStatus::RolledBack,
            });
        }

        let point = self.load_point(rollback_point_id)?;
        let _lock = self.lock_paths(&point.paths())?;
        let restore = self.restore_point(id, &point).await?;

        let update = StatusUpdate::new(proposal.status, ProposalStatus::RolledBack, now_ms());
        match self.repo.update_status(id, &update) {
            Ok(_) => {}
            // Lost a race with another rollback of the same proposal.
            Err(StoreError::StaleStatus { actual: ProposalStatus::RolledBack, .. }) => {
                return Ok(RollbackReport {
                    proposal_id: id.to_string(),
                    rollback_point_id: rollback_point_id.to_string(),
                    already_rolled_back: true,
                    restore,
                });
            }
            Err(e) => return Err(map_store(e, ProposalStatus::RolledBack)),
        }

        tracing::info!(
            target: "autopatch::ledger",
            proposal_id = %id,
            rollback_point_id,
            restored = restore.restored_count(),
            "rollback complete"
        );
        self.emit(PipelineEvent::RolledBack {
            proposal_id: id.to_string(),
            rollback_point_id: rollback_point_id.to_string(),
        });
        Ok(RollbackReport {
            proposal_id: id.to_string(),
            rollback_point_id: rollback_point_id.to_string(),
            already_rolled_back: false,
            restore,
        })
    }

    // -----------------------------------------------------------------------
    // recover
    // -----------------------------------------------------------------------

    /// Settle a proposal left in `applying` by an apply that never returned.
    ///
    /// A complete persisted point means every write landed: the proposal moves
    /// to `applied`.  Otherwise the persisted progress is compensated and the
    /// proposal moves to `failed`, where `rollback` and `resubmit` apply.
    ///
    /// # Errors
    /// `Conflict` while an apply in this process holds the paths, or while the
    /// interrupted apply's deadline has not yet passed (it may still be running
    /// in another process).
    pub async fn recover(&self, id: &str) -> PipelineResult<RecoveryReport> {
        let proposal = self.require(id)?;
        if proposal.status != ProposalStatus::Applying {
            return Err(PipelineError::InvalidTransition {
                from: proposal.status,
                to: ProposalStatus::Failed,
            });
        }
        let paths = proposal.paths();
        let _lock = self.lock_paths(&paths)?;
        if let Some(deadline) = proposal.timestamps.apply_deadline_ms {
            if now_ms() < deadline {
                return Err(PipelineError::Conflict {
                    path: paths.first().cloned().unwrap_or_default(),
                    detail: format!("apply may still be running until {}ms; retry after its deadline", deadline),
                });
            }
        }

        let saved = match &proposal.rollback_point_id {
            Some(point_id) => self.repo.get_rollback_point(point_id)?,
            None => None,
        };
        // No saved point means nothing was captured, so nothing was written.
        let point = saved.unwrap_or_else(|| RollbackPointBuilder::new(id).partial());

        if point.complete {
            self.transition(
                id,
                &StatusUpdate::new(ProposalStatus::Applying, ProposalStatus::Applied, now_ms())
                    .with_rollback_point(point.id.clone()),
            )?;
            self.history.record(proposal.metadata.kind, true);
            tracing::info!(target: "autopatch::ledger", proposal_id = %id, rollback_point_id = %point.id, "interrupted apply had completed");
            self.emit(PipelineEvent::Applied { proposal_id: id.to_string(), files: point.written_count() });
            return Ok(RecoveryReport {
                proposal_id: id.to_string(),
                rollback_point_id: point.id,
                status: ProposalStatus::Applied,
                restore: RestoreReport::default(),
            });
        }

        let restore = self.rollback.restore(&self.gateway, &point).await;
        self.repo.save_rollback_point(&point)?;
        let note = format!("apply interrupted; recovery {}", restore.summary());
        self.transition(
            id,
            &StatusUpdate::new(ProposalStatus::Applying, ProposalStatus::Failed, now_ms())
                .with_rollback_point(point.id.clone())
                .with_error(note.clone()),
        )?;
        self.history.record(proposal.metadata.kind, false);

        tracing::warn!(
            target: "autopatch::ledger",
            proposal_id = %id,
            rollback_point_id = %point.id,
            restored = restore.restored_count(),
            compensated = restore.fully_restored(),
            "interrupted apply recovered"
        );
        self.emit(PipelineEvent::ApplyFailed { proposal_id: id.to_string(), error: note });
        if !restore.fully_restored() {
            self.emit(PipelineEvent::CompensationFailed {
                proposal_id: id.to_string(),
                paths: restore.failures().iter().map(|f| f.path.clone()).collect(),
            });
        }
        Ok(RecoveryReport {
            proposal_id: id.to_string(),
            rollback_point_id: point.id,
            status: ProposalStatus::Failed,
            restore,
        })
    }

    // -----------------------------------------------------------------------
    // resubmit
    // -----------------------------------------------------------------------

    /// Move a failed proposal back to `pending` with fresh revision tokens.
    ///
    /// Any leftover partial write is restored first; the guardrail and risk
    /// checks run again against current policy.  A human must re-approve.
    pub async fn resubmit(&self, id: &str) -> PipelineResult<ModificationProposal> {
        let proposal = self.require(id)?;
        if proposal.status != ProposalStatus::Failed {
            return Err(PipelineError::InvalidTransition {
                from: proposal.status,
                to: ProposalStatus::Pending,
            });
        }
        self.recheck(&proposal)?;

        {
            let _lock = self.lock_paths(&proposal.paths())?;
            if let Some(point_id) = &proposal.rollback_point_id {
                let point = self.load_point(point_id)?;
                self.restore_point(id, &point).await?;
            }
        }

        validate(&proposal.change_set, &proposal.metadata)?;
        let revisions = self.snapshot_revisions(&proposal.change_set).await?;
        self.repo.refresh_base_revisions(id, revisions)?;
        let updated = self.transition(
            id,
            &StatusUpdate::new(ProposalStatus::Failed, ProposalStatus::Pending, now_ms())
                .clearing_rollback_point(),
        )?;

        tracing::info!(target: "autopatch::ledger", proposal_id = %id, "proposal resubmitted");
        self.emit(PipelineEvent::Escalated {
            proposal_id: id.to_string(),
            reason: "resubmitted after failed apply".into(),
        });
        Ok(updated)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn get(&self, id: &str) -> PipelineResult<ModificationProposal> {
        self.require(id)
    }

    pub fn list_pending(&self) -> PipelineResult<Vec<ModificationProposal>> {
        Ok(self.repo.list_pending()?)
    }

    pub fn list(&self, status: Option<ProposalStatus>) -> PipelineResult<Vec<ModificationProposal>> {
        Ok(self.repo.list(status)?)
    }

    pub fn rollback_point(&self, id: &str) -> PipelineResult<RollbackPoint> {
        self.load_point(id)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Fold every settled apply attempt into the outcome history, oldest
    /// first.  Each attempt leaves one rollback point: complete on success,
    /// partial on failure.  The point of a proposal still `applying` is an
    /// attempt in progress and is skipped.
    fn replay_history(&self) -> PipelineResult<()> {
        let proposals: HashMap<String, ModificationProposal> =
            self.repo.list(None)?.into_iter().map(|p| (p.id.clone(), p)).collect();
        let mut replayed = 0usize;
        for point in self.repo.list_rollback_points()? {
            let Some(owner) = proposals.get(&point.proposal_id) else { continue };
            if owner.status == ProposalStatus::Applying
                && owner.rollback_point_id.as_deref() == Some(point.id.as_str())
            {
                continue;
            }
            self.history.record(owner.metadata.kind, point.complete);
            replayed += 1;
        }
        if replayed > 0 {
            tracing::debug!(target: "autopatch::ledger", replayed, "outcome history replayed");
        }
        Ok(())
    }

    fn require(&self, id: &str) -> PipelineResult<ModificationProposal> {
        self.repo.get(id)?.ok_or_else(|| PipelineError::NotFound(id.to_string()))
    }

    fn load_point(&self, id: &str) -> PipelineResult<RollbackPoint> {
        self.repo
            .get_rollback_point(id)?
            .ok_or_else(|| PipelineError::NotFound(format!("rollback point {}", id)))
    }

    fn transition(&self, id: &str, update: &StatusUpdate) -> PipelineResult<ModificationProposal> {
        self.repo.update_status(id, update).map_err(|e| map_store(e, update.next))
    }

    fn lock_paths(&self, paths: &[String]) -> PipelineResult<PathLockGuard> {
        self.locks.try_acquire(paths.iter().cloned()).map_err(|e| match e {
            LockError::Contended(path) => PipelineError::Conflict {
                path,
                detail: "another apply or rollback holds an overlapping path".into(),
            },
            LockError::Poisoned => PipelineError::Storage(StoreError::Poisoned),
        })
    }

    /// Guardrails and risk against current policy.
    fn recheck(&self, proposal: &ModificationProposal) -> PipelineResult<()> {
        let scan = self.guardrails.scan(&proposal.change_set);
        let risk = self.analyzer.assess(&proposal.change_set).merge_scan(&scan);
        if !risk.allowed {
            let reason = risk
                .first_violation()
                .map(|v| v.to_string())
                .unwrap_or_else(|| "blocked by guardrails".into());
            return Err(PipelineError::GuardrailViolation(reason));
        }
        if proposal.metadata.declared_risk < risk.required_risk_level {
            return Err(PipelineError::RiskMismatch {
                required: risk.required_risk_level,
                declared: proposal.metadata.declared_risk,
            });
        }
        Ok(())
    }

    async fn snapshot_revisions(
        &self,
        change_set: &ChangeSet,
    ) -> PipelineResult<BTreeMap<String, Option<RevisionToken>>> {
        let mut out = BTreeMap::new();
        for (path, change) in change_set.iter() {
            let current = self.gateway.read(path).await?;
            if change.is_delete() && current.is_none() {
                return Err(PipelineError::Validation(format!(
                    "cannot delete {}: file does not exist",
                    path
                )));
            }
            out.insert(path.clone(), current.map(|s| s.revision));
        }
        Ok(out)
    }

    /// Read every path and compare against the propose-time token.
    async fn verify_base(
        &self,
        proposal: &ModificationProposal,
    ) -> PipelineResult<Vec<(String, Option<FileSnapshot>)>> {
        let mut out = Vec::with_capacity(proposal.change_set.len());
        for path in proposal.change_set.paths() {
            let current = self.gateway.read(path).await?;
            let expected = proposal.base_revisions.get(path).cloned().flatten();
            let actual = current.as_ref().map(|s| s.revision.clone());
            if actual != expected {
                return Err(PipelineError::Conflict {
                    path: path.clone(),
                    detail: format!(
                        "stale revision: expected {}, found {}",
                        token_label(expected.as_ref()),
                        token_label(actual.as_ref())
                    ),
                });
            }
            out.push((path.clone(), current));
        }
        Ok(out)
    }

    fn cancel_before_writes(&self, id: &str) -> PipelineError {
        let update = StatusUpdate::new(ProposalStatus::Applying, ProposalStatus::Approved, now_ms())
            .clearing_rollback_point();
        if let Err(e) = self.transition(id, &update) {
            tracing::error!(target: "autopatch::ledger", proposal_id = %id, error = %e, "could not revert cancelled apply");
            return e;
        }
        tracing::info!(target: "autopatch::ledger", proposal_id = %id, "apply cancelled before writes");
        PipelineError::Cancelled
    }

    /// Compensate, persist the partial point, mark `failed`, and build the
    /// error for the caller.
    async fn fail_apply(
        &self,
        proposal: &ModificationProposal,
        builder: RollbackPointBuilder,
        cause: PipelineError,
    ) -> PipelineError {
        let id = proposal.id.as_str();
        let files_written = builder.written_count();
        let point = builder.partial();
        let compensation = self.rollback.restore(&self.gateway, &point).await;

        tracing::warn!(
            target: "autopatch::ledger",
            proposal_id = %id,
            cause = %cause,
            files_written,
            compensated = compensation.fully_restored(),
            "apply failed"
        );

        if let Err(e) = self.repo.save_rollback_point(&point) {
            tracing::error!(target: "autopatch::ledger", proposal_id = %id, error = %e, "could not persist partial rollback point");
        }
        let update = StatusUpdate::new(ProposalStatus::Applying, ProposalStatus::Failed, now_ms())
            .with_rollback_point(point.id.clone())
            .with_error(cause.to_string());
        if let Err(e) = self.transition(id, &update) {
            tracing::error!(target: "autopatch::ledger", proposal_id = %id, error = %e, "could not mark proposal failed");
        }
        self.history.record(proposal.metadata.kind, false);

        self.emit(PipelineEvent::ApplyFailed { proposal_id: id.to_string(), error: cause.to_string() });
        if !compensation.fully_restored() {
            self.emit(PipelineEvent::CompensationFailed {
                proposal_id: id.to_string(),
                paths: compensation.failures().iter().map(|f| f.path.clone()).collect(),
            });
        }

        if files_written == 0 {
            cause
        } else {
            PipelineError::PartialApplyFailure { cause: Box::new(cause), files_written, compensation }
        }
    }

    /// Restore `point`; an incomplete restore is a conflict the operator must resolve.
    async fn restore_point(&self, id: &str, point: &RollbackPoint) -> PipelineResult<RestoreReport> {
        let report = self.rollback.restore(&self.gateway, point).await;
        if let Some(failed) = report.failures().first() {
            self.emit(PipelineEvent::CompensationFailed {
                proposal_id: id.to_string(),
                paths: report.failures().iter().map(|f| f.path.clone()).collect(),
            });
            let detail = match &failed.outcome {
                RestoreOutcome::Failed { reason } => reason.clone(),
                _ => "not restored".to_string(),
            };
            return Err(PipelineError::Conflict { path: failed.path.clone(), detail });
        }
        Ok(report)
    }

    fn request_review(&self, proposal: &ModificationProposal) -> Option<String> {
        match self.review.create_review_request(&proposal.change_set, &proposal.metadata) {
            Ok(review_id) => {
                if let Err(e) = self.repo.attach_review(&proposal.id, &review_id) {
                    tracing::warn!(target: "autopatch::ledger", proposal_id = %proposal.id, error = %e, "could not record review id");
                }
                Some(review_id)
            }
            Err(e) => {
                tracing::warn!(target: "autopatch::ledger", proposal_id = %proposal.id, error = %e, "review request failed");
                None
            }
        }
    }

    fn emit(&self, event: PipelineEvent) {
        if let Err(e) = self.sink.notify(&event) {
            tracing::warn!(target: "autopatch::ledger", event = event.name(), error = %e, "notification failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Free helpers
// ---------------------------------------------------------------------------

fn validate(change_set: &ChangeSet, metadata: &ProposalMetadata) -> PipelineResult<()> {
    if metadata.target.trim().is_empty() {
        return Err(PipelineError::Validation("target description is required".into()));
    }
    if change_set.is_empty() {
        return Err(PipelineError::Validation("change set is empty".into()));
    }
    change_set.validate_paths().map_err(PipelineError::Validation)?;
    if metadata.declared_risk == RiskLevel::Restricted {
        return Err(PipelineError::Validation(
            "restricted is not a declarable risk level".into(),
        ));
    }
    Ok(())
}

fn token_label(token: Option<&RevisionToken>) -> String {
    token.map(|t| t.to_string()).unwrap_or_else(|| "absent".into())
}

fn gateway_error(e: GatewayError) -> PipelineError {
    match e {
        GatewayError::Conflict { path, expected, actual } => PipelineError::Conflict {
            path,
            detail: format!("stale revision: expected {}, found {}", expected, actual),
        },
        other => PipelineError::Gateway(other),
    }
}

fn map_store(e: StoreError, to: ProposalStatus) -> PipelineError {
    match e {
        StoreError::StaleStatus { actual, .. } => PipelineError::InvalidTransition { from: actual, to },
        StoreError::IllegalTransition { from, to, .. } => PipelineError::InvalidTransition { from, to },
        StoreError::NotFound(id) => PipelineError::NotFound(id),
        StoreError::PathBusy { path, holder } => PipelineError::Conflict {
            detail: format!(
                "proposal {} is applying an overlapping path; recover it if its process died",
                holder
            ),
            path,
        },
        other => PipelineError::Storage(other),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::self_modify::collaborators::MemorySink;
    use crate::self_modify::gateway::InMemoryGateway;
    use crate::self_modify::proposal::{ModificationKind, TriggerType};
    use crate::self_modify::repository::InMemoryRepository;

    type Ledger = ModificationLedger<InMemoryGateway, InMemoryRepository>;

    fn ledger(gw: &InMemoryGateway) -> (Ledger, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let l = ModificationLedger::new(gw.clone(), InMemoryRepository::new(), &PipelineConfig::default())
            .unwrap()
            .with_notification_sink(sink.clone());
        (l, sink)
    }

    fn meta(declared: RiskLevel) -> ProposalMetadata {
        ProposalMetadata {
            target: "tweak".into(),
            kind: ModificationKind::Enhancement,
            declared_risk: declared,
            trigger: TriggerType::UserFix,
            requires_manual_approval: false,
            motivation: None,
        }
    }

    #[tokio::test]
    async fn test_validation_rejects_empty_target_and_set() {
        let gw = InMemoryGateway::new();
        let (l, _) = ledger(&gw);
        let cs = ChangeSet::new().with_write("components/A.tsx", "x").unwrap();
        let mut m = meta(RiskLevel::Low);
        m.target = "  ".into();
        assert!(matches!(l.propose(cs, m).await, Err(PipelineError::Validation(_))));
        assert!(matches!(
            l.propose(ChangeSet::new(), meta(RiskLevel::Low)).await,
            Err(PipelineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_validation_rejects_restricted_declaration_and_missing_delete() {
        let gw = InMemoryGateway::new();
        let (l, _) = ledger(&gw);
        let cs = ChangeSet::new().with_write("components/A.tsx", "x").unwrap();
        assert!(matches!(
            l.propose(cs, meta(RiskLevel::Restricted)).await,
            Err(PipelineError::Validation(_))
        ));
        let cs = ChangeSet::new().with_delete("components/Missing.tsx").unwrap();
        assert!(matches!(
            l.propose(cs, meta(RiskLevel::Low)).await,
            Err(PipelineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_propose_approve_records_review_and_events() {
        let gw = InMemoryGateway::new();
        let (l, sink) = ledger(&gw);
        let cs = ChangeSet::new().with_write("components/Badge.tsx", "x").unwrap();
        let out = l.propose(cs, meta(RiskLevel::Low)).await.unwrap();
        assert_eq!(out.action(), DecisionAction::Approve);
        assert_eq!(out.proposal.review_id.as_deref(), Some("review-1"));
        let stored = l.get(&out.proposal.id).unwrap();
        assert_eq!(stored.status, ProposalStatus::Approved);
        assert_eq!(stored.review_id.as_deref(), Some("review-1"));
        assert_eq!(sink.names(), vec!["proposed"]);
    }

    #[tokio::test]
    async fn test_reject_is_persisted_and_never_applies() {
        let gw = InMemoryGateway::new();
        let (l, sink) = ledger(&gw);
        let cs = ChangeSet::new().with_write("middleware.ts", "x").unwrap();
        let out = l.propose(cs, meta(RiskLevel::High)).await.unwrap();
        assert_eq!(out.action(), DecisionAction::Reject);
        assert!(matches!(out.rejection_error(), Some(PipelineError::GuardrailViolation(_))));
        assert!(matches!(
            l.apply(&out.proposal.id).await,
            Err(PipelineError::InvalidTransition { from: ProposalStatus::Rejected, .. })
        ));
        assert_eq!(sink.names(), vec!["proposed", "rejected"]);
        assert_eq!(gw.write_count(), 0);
    }

    #[tokio::test]
    async fn test_human_approval_then_apply() {
        let gw = InMemoryGateway::new().with_file("src/lib/db.ts", "v1");
        let (l, sink) = ledger(&gw);
        let cs = ChangeSet::new().with_write("src/lib/db.ts", "v2").unwrap();
        let out = l.propose(cs, meta(RiskLevel::High)).await.unwrap();
        assert_eq!(out.action(), DecisionAction::Escalate);
        assert_eq!(l.list_pending().unwrap().len(), 1);

        let approved = l.approve_pending(&out.proposal.id, "alice").unwrap();
        assert_eq!(approved.status, ProposalStatus::Approved);
        assert_eq!(approved.reviewer_note.as_deref(), Some("approved by alice"));
        assert!(l.list_pending().unwrap().is_empty());

        l.apply(&out.proposal.id).await.unwrap();
        assert_eq!(gw.content("src/lib/db.ts").as_deref(), Some("v2"));
        assert!(sink.names().contains(&"approved"));
    }

    #[tokio::test]
    async fn test_reject_pending() {
        let gw = InMemoryGateway::new();
        let (l, _) = ledger(&gw);
        let cs = ChangeSet::new().with_write("app/api/x/route.ts", "x").unwrap();
        let out = l.propose(cs, meta(RiskLevel::Medium)).await.unwrap();
        let r = l.reject_pending(&out.proposal.id, "bob", "not now").unwrap();
        assert_eq!(r.status, ProposalStatus::Rejected);
        assert!(l.approve_pending(&out.proposal.id, "bob").is_err());
    }

    #[tokio::test]
    async fn test_history_recorded_on_success() {
        let gw = InMemoryGateway::new();
        let (l, _) = ledger(&gw);
        let cs = ChangeSet::new().with_write("components/A.tsx", "x").unwrap();
        let out = l.propose(cs, meta(RiskLevel::Low)).await.unwrap();
        assert!(l.history().success_rate(ModificationKind::Enhancement).is_none());
        l.apply(&out.proposal.id).await.unwrap();
        assert!(l.history().success_rate(ModificationKind::Enhancement).unwrap() > 0.5);
    }

    #[tokio::test]
    async fn test_rollback_with_wrong_point_is_mismatch() {
        let gw = InMemoryGateway::new();
        let (l, _) = ledger(&gw);
        let cs = ChangeSet::new().with_write("components/A.tsx", "x").unwrap();
        let out = l.propose(cs, meta(RiskLevel::Low)).await.unwrap();
        l.apply(&out.proposal.id).await.unwrap();
        assert!(matches!(
            l.rollback(&out.proposal.id, "bogus").await,
            Err(PipelineError::RollbackPointMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_rollback_named_none_without_recorded_point_is_mismatch() {
        let gw = InMemoryGateway::new();
        let (l, _) = ledger(&gw);
        let cs = ChangeSet::new().with_write("components/A.tsx", "x").unwrap();
        let id = l.propose(cs, meta(RiskLevel::Low)).await.unwrap().proposal.id;
        for (from, to) in [
            (ProposalStatus::Approved, ProposalStatus::Applying),
            (ProposalStatus::Applying, ProposalStatus::Failed),
        ] {
            l.repository().update_status(&id, &StatusUpdate::new(from, to, 1)).unwrap();
        }
        assert!(l.get(&id).unwrap().rollback_point_id.is_none());
        match l.rollback(&id, "none").await {
            Err(PipelineError::RollbackPointMismatch { given, recorded, .. }) => {
                assert_eq!(given, "none");
                assert_eq!(recorded, None);
            }
            other => panic!("expected mismatch, got {:?}", other),
        }
        assert_eq!(l.get(&id).unwrap().status, ProposalStatus::Failed);
    }

    #[tokio::test]
    async fn test_evaluate_does_not_persist() {
        let gw = InMemoryGateway::new();
        let (l, _) = ledger(&gw);
        let cs = ChangeSet::new().with_write("components/A.tsx", "x").unwrap();
        let ev = l.evaluate(&cs, &meta(RiskLevel::Low));
        assert_eq!(ev.decision.action, DecisionAction::Approve);
        assert!(l.list(None).unwrap().is_empty());
    }
}
