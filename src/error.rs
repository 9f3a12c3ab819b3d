//! # Crate-level error taxonomy
//!
//! Every fallible pipeline operation returns [`PipelineError`].  The storage
//! and gateway layers have their own enums ([`StoreError`], [`GatewayError`])
//! that convert into it with `?`.
//!
//! Retry semantics: only [`PipelineError::Conflict`] and
//! [`PipelineError::Timeout`] can be retried by straightforward resubmission.
//! Guardrail and validation failures need a materially different proposal.

use thiserror::Error;

use crate::self_modify::gateway::GatewayError;
use crate::self_modify::proposal::{ProposalStatus, RiskLevel};
use crate::self_modify::rollback::RestoreReport;

/// Shorthand used throughout the crate.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Errors surfaced by the self-modification pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A required field is missing or malformed.  Fix and resubmit.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Restricted path or embedded secret.  Never retried with the same change set.
    #[error("guardrail violation: {0}")]
    GuardrailViolation(String),

    /// The declared risk level is lower than the level the touched paths require.
    #[error("risk mismatch: required: {required}, declared: {declared}")]
    RiskMismatch {
        required: RiskLevel,
        declared: RiskLevel,
    },

    /// Stale revision token, or another proposal holds an overlapping path lock.
    #[error("conflict on {path}: {detail}")]
    Conflict { path: String, detail: String },

    /// Some paths were written before a failure.  Compensation was attempted
    /// and its outcome is reported separately from the triggering failure.
    #[error(
        "partial apply failure after {files_written} file(s): {cause}; compensation {}",
        .compensation.summary()
    )]
    PartialApplyFailure {
        cause: Box<PipelineError>,
        files_written: usize,
        compensation: RestoreReport,
    },

    /// `apply()` exceeded its time budget.
    #[error("apply exceeded its {budget_ms}ms budget")]
    Timeout { budget_ms: u64 },

    /// `apply()` was cancelled by its caller.
    #[error("apply cancelled")]
    Cancelled,

    #[error("proposal not found: {0}")]
    NotFound(String),

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: ProposalStatus,
        to: ProposalStatus,
    },

    /// The supplied rollback point does not belong to the proposal.
    #[error(
        "rollback point {given} does not match proposal {proposal_id} (recorded: {})",
        .recorded.as_deref().unwrap_or("none")
    )]
    RollbackPointMismatch {
        proposal_id: String,
        given: String,
        recorded: Option<String>,
    },

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl PipelineError {
    /// Whether resubmitting the same request (after refreshing tokens) may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Conflict { .. } | PipelineError::Timeout { .. } => true,
            PipelineError::PartialApplyFailure { cause, compensation, .. } => {
                compensation.fully_restored() && cause.is_retryable()
            }
            PipelineError::Gateway(GatewayError::Conflict { .. }) => true,
            _ => false,
        }
    }

    /// Short machine-readable kind, used in notifications and CLI output.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Validation(_) => "validation",
            PipelineError::GuardrailViolation(_) => "guardrail_violation",
            PipelineError::RiskMismatch { .. } => "risk_mismatch",
            PipelineError::Conflict { .. } => "conflict",
            PipelineError::PartialApplyFailure { .. } => "partial_apply_failure",
            PipelineError::Timeout { .. } => "timeout",
            PipelineError::Cancelled => "cancelled",
            PipelineError::NotFound(_) => "not_found",
            PipelineError::InvalidTransition { .. } => "invalid_transition",
            PipelineError::RollbackPointMismatch { .. } => "rollback_point_mismatch",
            PipelineError::Gateway(_) => "gateway",
            PipelineError::Storage(_) => "storage",
            PipelineError::Config(_) => "config",
        }
    }
}

/// Errors from a [`ProposalRepository`](crate::self_modify::repository::ProposalRepository).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("record already exists: {0}")]
    Duplicate(String),

    /// Compare-and-set on status failed: someone else moved the proposal first.
    #[error("stale status for {id}: expected {expected}, found {actual}")]
    StaleStatus {
        id: String,
        expected: ProposalStatus,
        actual: ProposalStatus,
    },

    #[error("illegal transition for {id}: {from} -> {to}")]
    IllegalTransition {
        id: String,
        from: ProposalStatus,
        to: ProposalStatus,
    },

    /// Another proposal is already `applying` one of the same paths.
    #[error("{path} is being applied by proposal {holder}")]
    PathBusy { path: String, holder: String },

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("record encoding: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("repository lock poisoned")]
    Poisoned,
}

/// Errors loading or validating [`PipelineConfig`](crate::config::PipelineConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("invalid pattern `{pattern}`: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::self_modify::rollback::{PathRestore, RestoreOutcome};

    fn report(ok: bool) -> RestoreReport {
        RestoreReport {
            outcomes: vec![PathRestore {
                path: "a.ts".into(),
                outcome: if ok {
                    RestoreOutcome::Restored
                } else {
                    RestoreOutcome::Failed { reason: "boom".into() }
                },
            }],
        }
    }

    #[test]
    fn test_conflict_is_retryable() {
        let e = PipelineError::Conflict { path: "a".into(), detail: "stale".into() };
        assert!(e.is_retryable());
    }

    #[test]
    fn test_timeout_is_retryable() {
        assert!(PipelineError::Timeout { budget_ms: 10 }.is_retryable());
    }

    #[test]
    fn test_guardrail_and_validation_not_retryable() {
        assert!(!PipelineError::GuardrailViolation("x".into()).is_retryable());
        assert!(!PipelineError::Validation("x".into()).is_retryable());
        let mismatch = PipelineError::RiskMismatch {
            required: RiskLevel::High,
            declared: RiskLevel::Low,
        };
        assert!(!mismatch.is_retryable());
    }

    #[test]
    fn test_partial_failure_retryable_only_when_compensated() {
        let compensated = PipelineError::PartialApplyFailure {
            cause: Box::new(PipelineError::Timeout { budget_ms: 5 }),
            files_written: 2,
            compensation: report(true),
        };
        assert!(compensated.is_retryable());

        let dirty = PipelineError::PartialApplyFailure {
            cause: Box::new(PipelineError::Timeout { budget_ms: 5 }),
            files_written: 2,
            compensation: report(false),
        };
        assert!(!dirty.is_retryable());
    }

    #[test]
    fn test_risk_mismatch_message_names_both_levels() {
        let e = PipelineError::RiskMismatch {
            required: RiskLevel::Medium,
            declared: RiskLevel::Low,
        };
        assert!(e.to_string().contains("required: medium, declared: low"));
    }

    #[test]
    fn test_partial_failure_display_reports_compensation() {
        let e = PipelineError::PartialApplyFailure {
            cause: Box::new(PipelineError::Cancelled),
            files_written: 1,
            compensation: report(true),
        };
        let s = e.to_string();
        assert!(s.contains("after 1 file(s)"));
        assert!(s.contains("restored all paths"));
    }

    #[test]
    fn test_mismatch_without_recorded_point_says_none() {
        let e = PipelineError::RollbackPointMismatch {
            proposal_id: "p1".into(),
            given: "rp-9".into(),
            recorded: None,
        };
        assert!(e.to_string().ends_with("(recorded: none)"));
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(PipelineError::Cancelled.kind(), "cancelled");
        assert_eq!(PipelineError::NotFound("x".into()).kind(), "not_found");
    }
}
