//! # Stage: Risk Analyzer
//!
//! ## Responsibility
//! Decide which risk tier a change set *requires*, from the paths it touches.
//! The proposer's declared level is compared against this later.
//!
//! ## Guarantees
//! - `required_risk_level` is the maximum tier over every touched path.
//! - One transparency warning per path at `medium` or above.
//! - `allowed` is false iff a restricted path is touched, or (after
//!   [`RiskAssessment::merge_scan`]) the content scan found a violation.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::self_modify::guardrails::{GuardrailViolation, ScanReport};
use crate::self_modify::patterns::PatternTable;
use crate::self_modify::proposal::{ChangeSet, RiskLevel};

/// Tier of one path and the pattern that matched it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRisk {
    pub path: String,
    pub tier: RiskLevel,
    pub pattern: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub per_file: Vec<FileRisk>,
    pub required_risk_level: RiskLevel,
    pub allowed: bool,
    pub violations: Vec<GuardrailViolation>,
    pub warnings: Vec<String>,
}

impl RiskAssessment {
    /// Fold the content scan in, so the decision stage sees one `allowed` flag.
    ///
    /// Restricted-path violations already present are not duplicated.
    pub fn merge_scan(mut self, scan: &ScanReport) -> Self {
        for v in &scan.violations {
            if !self.violations.contains(v) {
                self.violations.push(v.clone());
            }
        }
        self.warnings.extend(scan.warnings.iter().map(|w| w.to_string()));
        self.allowed = self.allowed && scan.allowed && self.violations.is_empty();
        self
    }

    pub fn first_violation(&self) -> Option<&GuardrailViolation> {
        self.violations.first()
    }
}

/// Path-tier classifier.
#[derive(Debug, Clone)]
pub struct RiskAnalyzer {
    table: Arc<PatternTable>,
}

impl RiskAnalyzer {
    pub fn new(table: Arc<PatternTable>) -> Self {
        Self { table }
    }

    pub fn assess(&self, change_set: &ChangeSet) -> RiskAssessment {
        let mut per_file = Vec::with_capacity(change_set.len());
        let mut violations = Vec::new();
        let mut warnings = Vec::new();
        let mut required = RiskLevel::Low;

        for path in change_set.paths() {
            let m = self.table.classify(path);
            required = required.max(m.tier);
            if m.tier.is_elevated() {
                warnings.push(format!("{} touches a {}-risk path", path, m.tier));
            }
            if m.tier == RiskLevel::Restricted {
                violations.push(GuardrailViolation::RestrictedPath {
                    path: path.clone(),
                    pattern: m.pattern.clone().unwrap_or_default(),
                });
            }
            per_file.push(FileRisk { path: path.clone(), tier: m.tier, pattern: m.pattern });
        }

        let allowed = violations.is_empty();
        tracing::debug!(
            target: "autopatch::risk",
            files = per_file.len(),
            required = %required,
            allowed,
            "risk assessed"
        );
        RiskAssessment { per_file, required_risk_level: required, allowed, violations, warnings }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::self_modify::guardrails::SafetyGuardrails;

    fn table() -> Arc<PatternTable> {
        Arc::new(PatternTable::default_table().unwrap())
    }

    fn cs(paths: &[&str]) -> ChangeSet {
        let mut c = ChangeSet::new();
        for p in paths {
            c = c.with_write(p, "x").unwrap();
        }
        c
    }

    #[test]
    fn test_required_is_max_tier() {
        let a = RiskAnalyzer::new(table()).assess(&cs(&["components/A.tsx", "src/lib/db.ts"]));
        assert_eq!(a.required_risk_level, RiskLevel::High);
        assert!(a.allowed);
    }

    #[test]
    fn test_low_only_has_no_warnings() {
        let a = RiskAnalyzer::new(table()).assess(&cs(&["components/A.tsx", "README.md"]));
        assert_eq!(a.required_risk_level, RiskLevel::Low);
        assert!(a.warnings.is_empty());
    }

    #[test]
    fn test_one_warning_per_elevated_path() {
        let a = RiskAnalyzer::new(table())
            .assess(&cs(&["app/api/x/route.ts", "src/lib/db.ts", "components/A.tsx"]));
        assert_eq!(a.warnings.len(), 2);
    }

    #[test]
    fn test_restricted_disallows() {
        let a = RiskAnalyzer::new(table()).assess(&cs(&["middleware.ts"]));
        assert_eq!(a.required_risk_level, RiskLevel::Restricted);
        assert!(!a.allowed);
        assert_eq!(a.first_violation().unwrap().path(), "middleware.ts");
    }

    #[test]
    fn test_merge_scan_folds_secret_and_dedups_paths() {
        let t = table();
        let change = ChangeSet::new()
            .with_write("middleware.ts", "x")
            .unwrap()
            .with_write("components/A.tsx", "password: 'abcdef'")
            .unwrap();
        let scan = SafetyGuardrails::new(Arc::clone(&t)).scan(&change);
        let merged = RiskAnalyzer::new(t).assess(&change).merge_scan(&scan);
        assert!(!merged.allowed);
        // one restricted path + one secret
        assert_eq!(merged.violations.len(), 2);
    }

    #[test]
    fn test_merge_clean_scan_keeps_allowed() {
        let t = table();
        let change = cs(&["components/A.tsx"]);
        let scan = SafetyGuardrails::new(Arc::clone(&t)).scan(&change);
        let merged = RiskAnalyzer::new(t).assess(&change).merge_scan(&scan);
        assert!(merged.allowed);
    }
}
