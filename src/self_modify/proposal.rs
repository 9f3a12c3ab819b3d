//! # Stage: Proposal Data Model
//!
//! ## Responsibility
//! The value types every other stage operates on: risk levels, modification
//! kinds, trigger types, the [`ChangeSet`], and the persisted
//! [`ModificationProposal`] with its status state machine.
//!
//! ## Guarantees
//! - Deterministic: `ChangeSet` is ordered by path, so every stage iterates
//!   paths in the same order.
//! - Closed state machine: [`ProposalStatus::can_transition_to`] is the single
//!   source of truth for legal transitions; repositories enforce it.
//! - Normalised paths: every path in a `ChangeSet` built through
//!   [`ChangeSet::insert`] is relative, `/`-separated and free of `..`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::self_modify::decision::Decision;
use crate::self_modify::gateway::RevisionToken;

/// Current unix time in milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// RiskLevel
// ---------------------------------------------------------------------------

/// Severity tier of a path, and the risk level a proposer declares.
///
/// `Restricted` is never declarable: any restricted path is a hard deny.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low = 0,
    Medium = 1,
    High = 2,
    Restricted = 3,
}

impl RiskLevel {
    /// All tiers, most severe first.  This is the lookup order of the pattern table.
    pub const DESCENDING: [RiskLevel; 4] =
        [RiskLevel::Restricted, RiskLevel::High, RiskLevel::Medium, RiskLevel::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Restricted => "restricted",
        }
    }

    /// Tiers above `low` produce a transparency warning in the risk assessment.
    pub fn is_elevated(&self) -> bool {
        *self > RiskLevel::Low
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            "restricted" => Ok(RiskLevel::Restricted),
            other => Err(format!("unknown risk level: {}", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// ModificationKind / TriggerType
// ---------------------------------------------------------------------------

/// What sort of change the proposal makes.  History is tracked per kind.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum ModificationKind {
    Enhancement,
    Bugfix,
    Optimization,
    Feature,
    Refactor,
}

impl std::fmt::Display for ModificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModificationKind::Enhancement => write!(f, "enhancement"),
            ModificationKind::Bugfix => write!(f, "bugfix"),
            ModificationKind::Optimization => write!(f, "optimization"),
            ModificationKind::Feature => write!(f, "feature"),
            ModificationKind::Refactor => write!(f, "refactor"),
        }
    }
}

/// Who or what caused the proposal to be drafted.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    /// A user reported a defect and asked for a fix.
    UserFix,
    /// A user asked for a feature or change.
    UserRequest,
    /// The system noticed something on its own.
    SelfInitiated,
    /// Periodic self-review.
    ScheduledReview,
}

impl TriggerType {
    pub fn is_user_initiated(&self) -> bool {
        matches!(self, TriggerType::UserFix | TriggerType::UserRequest)
    }
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerType::UserFix => write!(f, "user_fix"),
            TriggerType::UserRequest => write!(f, "user_request"),
            TriggerType::SelfInitiated => write!(f, "self_initiated"),
            TriggerType::ScheduledReview => write!(f, "scheduled_review"),
        }
    }
}

// ---------------------------------------------------------------------------
// ProposalStatus state machine
// ---------------------------------------------------------------------------

/// Lifecycle status of a proposal.  Exactly one at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Pending,
    Approved,
    Rejected,
    Applying,
    Applied,
    Failed,
    RolledBack,
}

impl ProposalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalStatus::Pending => "pending",
            ProposalStatus::Approved => "approved",
            ProposalStatus::Rejected => "rejected",
            ProposalStatus::Applying => "applying",
            ProposalStatus::Applied => "applied",
            ProposalStatus::Failed => "failed",
            ProposalStatus::RolledBack => "rolled_back",
        }
    }

    /// Legal transitions.  Forward-only except `applied|failed → rolled_back`
    /// and the resubmit edge `failed → pending`.  `applying → approved` is
    /// only taken when `apply()` is cancelled before anything was written;
    /// `recover()` leaves `applying` through the same `applied`/`failed` edges
    /// an uninterrupted apply uses.
    pub fn can_transition_to(&self, next: ProposalStatus) -> bool {
        use ProposalStatus::*;
        matches!(
            (self, next),
            (Pending, Approved)
                | (Pending, Rejected)
                | (Approved, Applying)
                | (Applying, Applied)
                | (Applying, Failed)
                | (Applying, Approved)
                | (Applied, RolledBack)
                | (Failed, RolledBack)
                | (Failed, Pending)
        )
    }

    /// No outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProposalStatus::Rejected | ProposalStatus::RolledBack)
    }
}

impl std::fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ProposalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ProposalStatus::Pending),
            "approved" => Ok(ProposalStatus::Approved),
            "rejected" => Ok(ProposalStatus::Rejected),
            "applying" => Ok(ProposalStatus::Applying),
            "applied" => Ok(ProposalStatus::Applied),
            "failed" => Ok(ProposalStatus::Failed),
            "rolled_back" => Ok(ProposalStatus::RolledBack),
            other => Err(format!("unknown status: {}", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// ChangeSet
// ---------------------------------------------------------------------------

/// New content for one path, or the deletion marker.
///
/// Serialises as a plain string, or `null` for a deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FileChange {
    Write(String),
    Delete,
}

impl FileChange {
    pub fn content(&self) -> Option<&str> {
        match self {
            FileChange::Write(c) => Some(c.as_str()),
            FileChange::Delete => None,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, FileChange::Delete)
    }
}

/// Mapping of path → proposed change, ordered by path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeSet {
    files: BTreeMap<String, FileChange>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a change, normalising the path.  Returns an error for absolute
    /// paths, empty paths, and paths containing `..`.
    pub fn insert(&mut self, path: &str, change: FileChange) -> Result<(), String> {
        let normalized = normalize_path(path)?;
        self.files.insert(normalized, change);
        Ok(())
    }

    /// Builder-style write.
    pub fn with_write(mut self, path: &str, content: impl Into<String>) -> Result<Self, String> {
        self.insert(path, FileChange::Write(content.into()))?;
        Ok(self)
    }

    /// Builder-style delete.
    pub fn with_delete(mut self, path: &str) -> Result<Self, String> {
        self.insert(path, FileChange::Delete)?;
        Ok(self)
    }

    pub fn get(&self, path: &str) -> Option<&FileChange> {
        self.files.get(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FileChange)> {
        self.files.iter()
    }

    pub fn paths(&self) -> impl Iterator<Item = &String> {
        self.files.keys()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Re-check every key.  Change sets deserialised from outside bypass
    /// [`insert`](Self::insert), so the ledger calls this during validation.
    pub fn validate_paths(&self) -> Result<(), String> {
        for path in self.files.keys() {
            let normalized = normalize_path(path)?;
            if &normalized != path {
                return Err(format!("path is not normalised: {} (expected {})", path, normalized));
            }
        }
        Ok(())
    }

    /// Rebuild with every key normalised.  Fails on the first invalid path.
    pub fn normalized(self) -> Result<Self, String> {
        let mut out = ChangeSet::new();
        for (path, change) in self.files {
            out.insert(&path, change)?;
        }
        Ok(out)
    }
}

/// Normalise a repository-relative path: `\` → `/`, strip `./`, collapse
/// duplicate separators.  Rejects empty, absolute, and `..` paths.
pub fn normalize_path(path: &str) -> Result<String, String> {
    let unified = path.trim().replace('\\', "/");
    if unified.is_empty() {
        return Err("empty path".into());
    }
    if unified.starts_with('/') || unified.chars().nth(1) == Some(':') {
        return Err(format!("absolute path not allowed: {}", path));
    }
    let mut segments = Vec::new();
    for seg in unified.split('/') {
        match seg {
            "" | "." => continue,
            ".." => return Err(format!("path traversal not allowed: {}", path)),
            s => segments.push(s),
        }
    }
    if segments.is_empty() {
        return Err(format!("path has no file component: {}", path));
    }
    Ok(segments.join("/"))
}

// ---------------------------------------------------------------------------
// ProposalMetadata / ModificationProposal
// ---------------------------------------------------------------------------

/// Everything the proposer supplies alongside the change set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalMetadata {
    /// What the change targets, in a sentence.
    pub target: String,
    pub kind: ModificationKind,
    pub declared_risk: RiskLevel,
    pub trigger: TriggerType,
    /// Force escalation regardless of score.
    #[serde(default)]
    pub requires_manual_approval: bool,
    #[serde(default)]
    pub motivation: Option<String>,
}

/// Timestamps (unix ms) of each lifecycle milestone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalTimestamps {
    pub proposed_at_ms: u64,
    pub decided_at_ms: Option<u64>,
    pub applied_at_ms: Option<u64>,
    pub rolled_back_at_ms: Option<u64>,
    /// Budget end of the current (or last) apply.  A proposal still
    /// `applying` after this point belongs to an interrupted apply.
    #[serde(default)]
    pub apply_deadline_ms: Option<u64>,
}

/// A persisted unit of self-modification work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModificationProposal {
    pub id: String,
    pub metadata: ProposalMetadata,
    pub change_set: ChangeSet,
    /// Revision of every path when the proposal was snapshotted.  `None` means
    /// the path did not exist.
    pub base_revisions: BTreeMap<String, Option<RevisionToken>>,
    pub status: ProposalStatus,
    /// Persisted from the risk assessment for audit.
    pub required_risk: RiskLevel,
    pub allowed: bool,
    pub decision: Decision,
    pub review_id: Option<String>,
    pub rollback_point_id: Option<String>,
    /// Who decided an escalated proposal, and why.
    pub reviewer_note: Option<String>,
    /// Last failure message, kept after a failed apply for the operator.
    pub last_error: Option<String>,
    pub timestamps: ProposalTimestamps,
}

impl ModificationProposal {
    pub fn paths(&self) -> Vec<String> {
        self.change_set.paths().cloned().collect()
    }

    pub fn declared_risk(&self) -> RiskLevel {
        self.metadata.declared_risk
    }

    /// Apply the timestamp side effects of entering `next`.
    pub fn stamp(&mut self, next: ProposalStatus, at_ms: u64) {
        match next {
            ProposalStatus::Approved | ProposalStatus::Rejected => {
                if self.timestamps.decided_at_ms.is_none() || self.status == ProposalStatus::Pending {
                    self.timestamps.decided_at_ms = Some(at_ms);
                }
            }
            ProposalStatus::Applied => self.timestamps.applied_at_ms = Some(at_ms),
            ProposalStatus::RolledBack => self.timestamps.rolled_back_at_ms = Some(at_ms),
            ProposalStatus::Pending => self.timestamps.decided_at_ms = None,
            ProposalStatus::Applying | ProposalStatus::Failed => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_risk_level_ordering() {
        assert!(RiskLevel::Restricted > RiskLevel::High);
        assert!(RiskLevel::High > RiskLevel::Medium);
        assert!(RiskLevel::Medium > RiskLevel::Low);
    }

    #[test]
    fn test_risk_level_display_and_parse() {
        for level in RiskLevel::DESCENDING {
            let parsed: RiskLevel = level.to_string().parse().unwrap();
            assert_eq!(parsed, level);
        }
        assert!("severe".parse::<RiskLevel>().is_err());
    }

    #[test]
    fn test_descending_is_sorted() {
        let d = RiskLevel::DESCENDING;
        assert!(d.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn test_status_transitions_forward_only() {
        use ProposalStatus::*;
        assert!(Pending.can_transition_to(Approved));
        assert!(Pending.can_transition_to(Rejected));
        assert!(Approved.can_transition_to(Applying));
        assert!(Applying.can_transition_to(Applied));
        assert!(Applying.can_transition_to(Failed));
        assert!(Applied.can_transition_to(RolledBack));
        assert!(Failed.can_transition_to(RolledBack));
        assert!(Failed.can_transition_to(Pending));

        assert!(!Applied.can_transition_to(Applying));
        assert!(!Approved.can_transition_to(Pending));
        assert!(!RolledBack.can_transition_to(Applied));
        assert!(!Pending.can_transition_to(Applying));
    }

    #[test]
    fn test_rejected_is_terminal() {
        use ProposalStatus::*;
        for next in [Pending, Approved, Rejected, Applying, Applied, Failed, RolledBack] {
            assert!(!Rejected.can_transition_to(next));
        }
        assert!(Rejected.is_terminal());
    }

    #[test]
    fn test_status_round_trips_through_str() {
        use ProposalStatus::*;
        for s in [Pending, Approved, Rejected, Applying, Applied, Failed, RolledBack] {
            assert_eq!(s.as_str().parse::<ProposalStatus>().unwrap(), s);
        }
    }

    #[test]
    fn test_normalize_strips_dot_and_backslash() {
        assert_eq!(normalize_path("./src\\lib//db.ts").unwrap(), "src/lib/db.ts");
    }

    #[test]
    fn test_normalize_rejects_traversal() {
        assert!(normalize_path("src/../../etc/passwd").is_err());
    }

    #[test]
    fn test_normalize_rejects_absolute() {
        assert!(normalize_path("/etc/passwd").is_err());
        assert!(normalize_path("C:\\Windows\\x").is_err());
    }

    #[test]
    fn test_normalize_rejects_empty() {
        assert!(normalize_path("   ").is_err());
        assert!(normalize_path("./").is_err());
    }

    #[test]
    fn test_change_set_orders_paths() {
        let cs = ChangeSet::new()
            .with_write("b.ts", "b")
            .unwrap()
            .with_write("a.ts", "a")
            .unwrap();
        let paths: Vec<&String> = cs.paths().collect();
        assert_eq!(paths, vec!["a.ts", "b.ts"]);
    }

    #[test]
    fn test_change_set_json_uses_null_for_delete() {
        let cs = ChangeSet::new()
            .with_write("a.ts", "x")
            .unwrap()
            .with_delete("old.ts")
            .unwrap();
        let json = serde_json::to_value(&cs).unwrap();
        assert_eq!(json["a.ts"], "x");
        assert!(json["old.ts"].is_null());

        let back: ChangeSet = serde_json::from_value(json).unwrap();
        assert_eq!(back, cs);
    }

    #[test]
    fn test_validate_paths_catches_raw_keys() {
        let cs: ChangeSet = serde_json::from_str(r#"{"../x.ts": "y"}"#).unwrap();
        assert!(cs.validate_paths().is_err());
        assert!(cs.normalized().is_err());
    }

    #[test]
    fn test_trigger_user_initiated() {
        assert!(TriggerType::UserFix.is_user_initiated());
        assert!(TriggerType::UserRequest.is_user_initiated());
        assert!(!TriggerType::SelfInitiated.is_user_initiated());
        assert!(!TriggerType::ScheduledReview.is_user_initiated());
    }
}
