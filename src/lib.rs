//! # autopatch
//!
//! Decision pipeline for autonomous self-modification.  A proposed change to
//! the system's own source passes through a guardrail scan, risk and
//! confidence scoring, and a decision engine that approves, escalates, or
//! rejects it.  Approved changes are applied to a shared file store with
//! per-file compare-and-swap writes and can be rolled back.
//!
//! ```rust,ignore
//! let gateway = InMemoryGateway::new().with_file("components/Badge.tsx", "old");
//! let ledger = ModificationLedger::new(gateway, InMemoryRepository::new(), &PipelineConfig::default())?;
//! let changes = ChangeSet::new().with_write("components/Badge.tsx", "new")?;
//! let outcome = ledger.propose(changes, metadata).await?;
//! if outcome.action() == DecisionAction::Approve {
//!     let report = ledger.apply(&outcome.proposal.id).await?;
//!     ledger.rollback(&outcome.proposal.id, &report.rollback_point_id).await?;
//! }
//! ```
//!
//! The binary in `src/main.rs` drives the same API against a directory tree
//! and a SQLite state file.

pub mod cli;
pub mod config;
pub mod error;
pub mod self_modify;

pub use config::PipelineConfig;
pub use error::{ConfigError, PipelineError, PipelineResult, StoreError};
pub use self_modify::decision::{Decision, DecisionAction, DecisionEngine};
pub use self_modify::gateway::{
    FileSnapshot, FsGateway, GatewayError, InMemoryGateway, RevisionToken, VersionControlGateway,
};
pub use self_modify::ledger::{
    ApplyControl, ApplyReport, Evaluation, ModificationLedger, ProposalOutcome, RecoveryReport,
    RollbackReport,
};
pub use self_modify::proposal::{
    ChangeSet, FileChange, ModificationKind, ModificationProposal, ProposalMetadata,
    ProposalStatus, RiskLevel, TriggerType,
};
pub use self_modify::repository::{InMemoryRepository, ProposalRepository};
pub use self_modify::sqlite_repo::SqliteRepository;
