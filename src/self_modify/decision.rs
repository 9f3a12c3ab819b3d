//! # Stage: Decision Engine
//!
//! ## Responsibility
//! Combine the risk assessment and confidence score into exactly one of
//! approve, escalate, or reject.
//!
//! ## Decision logic (strict order)
//! 1. `allowed == false` → reject (guardrail violation).
//! 2. declared risk below required risk → reject (risk mismatch).
//! 3. required risk is `low`, confidence at or above the threshold, and no
//!    manual review forced → approve.
//! 4. otherwise → escalate.
//!
//! ## Guarantees
//! - Pure and stateless.
//! - Every [`Decision`] carries the full numeric breakdown, whatever the outcome.
//! - A non-reject decision implies `declared >= required`.

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::self_modify::confidence::{ConfidenceAssessment, ConfidenceFactors};
use crate::self_modify::proposal::{ProposalMetadata, RiskLevel};
use crate::self_modify::risk::RiskAssessment;

/// Default auto-approve threshold.
pub const DEFAULT_AUTO_APPROVE_THRESHOLD: f64 = 85.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    Approve,
    Escalate,
    Reject,
}

impl std::fmt::Display for DecisionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecisionAction::Approve => write!(f, "approve"),
            DecisionAction::Escalate => write!(f, "escalate"),
            DecisionAction::Reject => write!(f, "reject"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    GuardrailViolation,
    RiskMismatch,
}

/// Everything the engine looked at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionInputs {
    pub confidence: f64,
    pub threshold: f64,
    pub declared_risk: RiskLevel,
    pub required_risk: RiskLevel,
    pub allowed: bool,
    pub manual_review: bool,
    pub file_count: usize,
    pub factors: ConfidenceFactors,
}

/// An immutable decision record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: DecisionAction,
    pub rejection: Option<RejectionKind>,
    pub reasoning: String,
    pub inputs: DecisionInputs,
}

impl Decision {
    pub fn is_reject(&self) -> bool {
        self.action == DecisionAction::Reject
    }

    /// The error a caller should see for a reject decision.
    pub fn rejection_error(&self) -> Option<PipelineError> {
        match self.rejection? {
            RejectionKind::GuardrailViolation => {
                Some(PipelineError::GuardrailViolation(self.reasoning.clone()))
            }
            RejectionKind::RiskMismatch => Some(PipelineError::RiskMismatch {
                required: self.inputs.required_risk,
                declared: self.inputs.declared_risk,
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DecisionEngine {
    auto_approve_threshold: f64,
}

impl Default for DecisionEngine {
    fn default() -> Self {
        Self::new(DEFAULT_AUTO_APPROVE_THRESHOLD)
    }
}

impl DecisionEngine {
    pub fn new(auto_approve_threshold: f64) -> Self {
        Self { auto_approve_threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.auto_approve_threshold
    }

    pub fn decide(
        &self,
        metadata: &ProposalMetadata,
        risk: &RiskAssessment,
        confidence: &ConfidenceAssessment,
    ) -> Decision {
        let inputs = DecisionInputs {
            confidence: confidence.score,
            threshold: self.auto_approve_threshold,
            declared_risk: metadata.declared_risk,
            required_risk: risk.required_risk_level,
            allowed: risk.allowed,
            manual_review: metadata.requires_manual_approval,
            file_count: risk.per_file.len(),
            factors: confidence.factors.clone(),
        };

        if !risk.allowed {
            let reasoning = match risk.first_violation() {
                Some(v) => v.to_string(),
                None => "blocked by guardrails".to_string(),
            };
            return Decision {
                action: DecisionAction::Reject,
                rejection: Some(RejectionKind::GuardrailViolation),
                reasoning,
                inputs,
            };
        }

        if metadata.declared_risk < risk.required_risk_level {
            return Decision {
                action: DecisionAction::Reject,
                rejection: Some(RejectionKind::RiskMismatch),
                reasoning: format!(
                    "required: {}, declared: {}",
                    risk.required_risk_level, metadata.declared_risk
                ),
                inputs,
            };
        }

        if risk.required_risk_level == RiskLevel::Low
            && confidence.score >= self.auto_approve_threshold
            && !metadata.requires_manual_approval
        {
            return Decision {
                action: DecisionAction::Approve,
                rejection: None,
                reasoning: format!(
                    "low risk, confidence {:.1} >= {:.1}",
                    confidence.score, self.auto_approve_threshold
                ),
                inputs,
            };
        }

        let reasoning = if metadata.requires_manual_approval {
            "manual approval requested".to_string()
        } else if risk.required_risk_level != RiskLevel::Low {
            format!("{} risk requires human review", risk.required_risk_level)
        } else {
            format!(
                "confidence {:.1} below threshold {:.1}",
                confidence.score, self.auto_approve_threshold
            )
        };
        Decision { action: DecisionAction::Escalate, rejection: None, reasoning, inputs }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::self_modify::patterns::PatternTable;
    use crate::self_modify::proposal::{ChangeSet, ModificationKind, TriggerType};
    use crate::self_modify::risk::RiskAnalyzer;
    use std::sync::Arc;

    fn meta(declared: RiskLevel, manual: bool) -> ProposalMetadata {
        ProposalMetadata {
            target: "test".into(),
            kind: ModificationKind::Bugfix,
            declared_risk: declared,
            trigger: TriggerType::UserFix,
            requires_manual_approval: manual,
            motivation: None,
        }
    }

    fn conf(score: f64) -> ConfidenceAssessment {
        ConfidenceAssessment {
            score,
            factors: ConfidenceFactors {
                trigger_weight: score,
                file_count_penalty: 0.0,
                historical_success_rate: 0.5,
                history_adjustment: 0.0,
            },
        }
    }

    fn assess(path: &str) -> RiskAssessment {
        let cs = ChangeSet::new().with_write(path, "...").unwrap();
        RiskAnalyzer::new(Arc::new(PatternTable::default_table().unwrap())).assess(&cs)
    }

    #[test]
    fn test_restricted_rejects_even_at_high_confidence() {
        let d = DecisionEngine::default().decide(
            &meta(RiskLevel::High, false),
            &assess("middleware.ts"),
            &conf(99.0),
        );
        assert_eq!(d.action, DecisionAction::Reject);
        assert_eq!(d.rejection, Some(RejectionKind::GuardrailViolation));
        assert_eq!(d.reasoning, "restricted file: middleware.ts");
    }

    #[test]
    fn test_declared_too_low_is_risk_mismatch() {
        let d = DecisionEngine::default().decide(
            &meta(RiskLevel::Low, false),
            &assess("app/api/widgets/route.ts"),
            &conf(95.0),
        );
        assert_eq!(d.rejection, Some(RejectionKind::RiskMismatch));
        assert_eq!(d.reasoning, "required: medium, declared: low");
        let err = d.rejection_error().unwrap();
        assert!(err.to_string().contains("required: medium, declared: low"));
    }

    #[test]
    fn test_low_risk_high_confidence_approves() {
        let d = DecisionEngine::default().decide(
            &meta(RiskLevel::Low, false),
            &assess("components/Badge.tsx"),
            &conf(90.0),
        );
        assert_eq!(d.action, DecisionAction::Approve);
        assert!(d.rejection_error().is_none());
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let d = DecisionEngine::default().decide(
            &meta(RiskLevel::Low, false),
            &assess("components/Badge.tsx"),
            &conf(85.0),
        );
        assert_eq!(d.action, DecisionAction::Approve);
    }

    #[test]
    fn test_low_confidence_escalates() {
        let d = DecisionEngine::default().decide(
            &meta(RiskLevel::Low, false),
            &assess("components/Badge.tsx"),
            &conf(84.9),
        );
        assert_eq!(d.action, DecisionAction::Escalate);
    }

    #[test]
    fn test_manual_flag_escalates() {
        let d = DecisionEngine::default().decide(
            &meta(RiskLevel::Low, true),
            &assess("components/Badge.tsx"),
            &conf(100.0),
        );
        assert_eq!(d.action, DecisionAction::Escalate);
        assert_eq!(d.reasoning, "manual approval requested");
    }

    #[test]
    fn test_elevated_risk_escalates_when_declared() {
        let d = DecisionEngine::default().decide(
            &meta(RiskLevel::High, false),
            &assess("src/lib/db.ts"),
            &conf(100.0),
        );
        assert_eq!(d.action, DecisionAction::Escalate);
        assert_eq!(d.inputs.required_risk, RiskLevel::High);
    }

    #[test]
    fn test_custom_threshold() {
        let d = DecisionEngine::new(95.0).decide(
            &meta(RiskLevel::Low, false),
            &assess("components/Badge.tsx"),
            &conf(90.0),
        );
        assert_eq!(d.action, DecisionAction::Escalate);
        assert_eq!(d.inputs.threshold, 95.0);
    }

    #[test]
    fn test_breakdown_kept_on_reject() {
        let d = DecisionEngine::default().decide(
            &meta(RiskLevel::Low, false),
            &assess("middleware.ts"),
            &conf(42.0),
        );
        assert_eq!(d.inputs.confidence, 42.0);
        assert_eq!(d.inputs.file_count, 1);
        assert!(!d.inputs.allowed);
    }
}
