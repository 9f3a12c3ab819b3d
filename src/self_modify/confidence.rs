//! # Stage: Confidence Scorer
//!
//! ## Responsibility
//! Estimate, on a 0–100 scale, how likely a proposal is to be safe and
//! correct, from its trigger type, how many files it touches, and how past
//! proposals of the same kind turned out.
//!
//! ## Guarantees
//! - Pure: [`ConfidenceScorer::score`] depends only on its arguments and the
//!   weights it was built with.  No clock, no randomness.
//! - Monotone in file count: more files never raise the score.
//! - Bounded: the result is always within `[0, 100]`.
//!
//! ## Formula
//! ```text
//! score = clamp(0, 100,
//!           trigger_weight
//!         - max_file_penalty * (n - 1) / (n - 1 + file_penalty_half)
//!         + (history - 0.5) * history_span)
//! ```
//! `history` defaults to 0.5 when no outcome of the kind has been recorded.
//!
//! [`OutcomeHistory`] is the only stateful piece: the exponential moving
//! average of outcomes per [`ModificationKind`].

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::self_modify::proposal::{ModificationKind, TriggerType};

/// Neutral midpoint for a kind with no recorded outcomes.
pub const NEUTRAL_HISTORY: f64 = 0.5;

// ---------------------------------------------------------------------------
// ScoringWeights
// ---------------------------------------------------------------------------

/// Tunable scoring policy.  Loaded from `[scoring]` in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub user_fix: f64,
    pub user_request: f64,
    pub self_initiated: f64,
    pub scheduled_review: f64,
    /// Asymptotic penalty as the file count grows without bound.
    pub max_file_penalty: f64,
    /// Extra files at which half of `max_file_penalty` applies.
    pub file_penalty_half: f64,
    /// Score swing between a 0% and 100% historical success rate.
    pub history_span: f64,
    /// EMA smoothing factor, in `(0, 1]`.
    pub ema_alpha: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            user_fix: 92.0,
            user_request: 86.0,
            self_initiated: 72.0,
            scheduled_review: 65.0,
            max_file_penalty: 30.0,
            file_penalty_half: 4.0,
            history_span: 20.0,
            ema_alpha: 0.3,
        }
    }
}

impl ScoringWeights {
    pub fn trigger_weight(&self, trigger: TriggerType) -> f64 {
        match trigger {
            TriggerType::UserFix => self.user_fix,
            TriggerType::UserRequest => self.user_request,
            TriggerType::SelfInitiated => self.self_initiated,
            TriggerType::ScheduledReview => self.scheduled_review,
        }
    }

    /// Validation used by config loading.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.ema_alpha > 0.0 && self.ema_alpha <= 1.0) {
            return Err(format!("scoring.ema_alpha must be in (0, 1], got {}", self.ema_alpha));
        }
        if self.file_penalty_half <= 0.0 {
            return Err("scoring.file_penalty_half must be positive".into());
        }
        if self.max_file_penalty < 0.0 || self.history_span < 0.0 {
            return Err("scoring penalties and spans must be non-negative".into());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Context and result
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoringContext {
    pub trigger: TriggerType,
    pub file_count: usize,
    /// EMA of past outcomes for this kind, or `None` if there are none.
    pub historical_success: Option<f64>,
}

/// How each term contributed to the score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceFactors {
    pub trigger_weight: f64,
    pub file_count_penalty: f64,
    pub historical_success_rate: f64,
    pub history_adjustment: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceAssessment {
    pub score: f64,
    pub factors: ConfidenceFactors,
}

// ---------------------------------------------------------------------------
// ConfidenceScorer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct ConfidenceScorer {
    weights: ScoringWeights,
}

impl ConfidenceScorer {
    pub fn new(weights: ScoringWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &ScoringWeights {
        &self.weights
    }

    pub fn score(&self, ctx: &ScoringContext) -> ConfidenceAssessment {
        let w = &self.weights;
        let trigger_weight = w.trigger_weight(ctx.trigger);

        let extra = ctx.file_count.saturating_sub(1) as f64;
        let file_count_penalty = if extra > 0.0 {
            w.max_file_penalty * extra / (extra + w.file_penalty_half)
        } else {
            0.0
        };

        let history = ctx
            .historical_success
            .map(|h| h.clamp(0.0, 1.0))
            .unwrap_or(NEUTRAL_HISTORY);
        let history_adjustment = (history - NEUTRAL_HISTORY) * w.history_span;

        let score = (trigger_weight - file_count_penalty + history_adjustment).clamp(0.0, 100.0);

        ConfidenceAssessment {
            score,
            factors: ConfidenceFactors {
                trigger_weight,
                file_count_penalty,
                historical_success_rate: history,
                history_adjustment,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// OutcomeHistory
// ---------------------------------------------------------------------------

/// Per-kind exponential moving average of apply outcomes (1.0 = success).
#[derive(Debug)]
pub struct OutcomeHistory {
    alpha: f64,
    averages: Mutex<HashMap<ModificationKind, f64>>,
}

impl OutcomeHistory {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, averages: Mutex::new(HashMap::new()) }
    }

    /// Current average for `kind`, or `None` when nothing has been recorded.
    pub fn success_rate(&self, kind: ModificationKind) -> Option<f64> {
        self.averages.lock().ok().and_then(|m| m.get(&kind).copied())
    }

    /// Fold one outcome in.  The first outcome moves away from the neutral
    /// midpoint rather than jumping straight to 0 or 1.
    pub fn record(&self, kind: ModificationKind, success: bool) {
        let sample = if success { 1.0 } else { 0.0 };
        match self.averages.lock() {
            Ok(mut m) => {
                let prev = m.get(&kind).copied().unwrap_or(NEUTRAL_HISTORY);
                m.insert(kind, prev + self.alpha * (sample - prev));
            }
            Err(_) => {
                tracing::warn!(target: "autopatch::confidence", kind = %kind, "history lock poisoned; outcome dropped");
            }
        }
    }
}

impl Default for OutcomeHistory {
    fn default() -> Self {
        Self::new(ScoringWeights::default().ema_alpha)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
