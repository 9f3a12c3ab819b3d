use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use serde::Deserialize;

use crate::error::PipelineError;
use crate::self_modify::proposal::{
    ChangeSet, ModificationKind, ProposalMetadata, RiskLevel, TriggerType,
};

#[derive(Parser, Debug)]
#[command(name = "autopatch")]
#[command(version)]
#[command(about = "Guardrailed decision pipeline for autonomous self-modification")]
pub struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// SQLite state file (overrides storage.database)
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Directory tree changes are applied to (overrides storage.root)
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    /// Print machine-readable JSON instead of a summary line
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Proposal metadata shared by `scan` and `propose`.
#[derive(clap::Args, Debug, Clone)]
pub struct ProposalArgs {
    /// JSON change set: {"path": "new content" | null, ...} or {"files": {...}}
    #[arg(long, short)]
    pub file: PathBuf,

    /// One-line description of what the change targets
    #[arg(long)]
    pub target: String,

    #[arg(long, value_enum, default_value = "enhancement")]
    pub kind: ModificationKind,

    /// Declared risk level
    #[arg(long, value_enum, default_value = "low")]
    pub risk: RiskLevel,

    #[arg(long, value_enum, default_value = "self-initiated")]
    pub trigger: TriggerType,

    /// Force human review regardless of score
    #[arg(long)]
    pub manual_review: bool,

    #[arg(long)]
    pub motivation: Option<String>,
}

impl ProposalArgs {
    pub fn metadata(&self) -> ProposalMetadata {
        ProposalMetadata {
            target: self.target.clone(),
            kind: self.kind,
            declared_risk: self.risk,
            trigger: self.trigger,
            requires_manual_approval: self.manual_review,
            motivation: self.motivation.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Evaluate a change set without recording it
    Scan(ProposalArgs),
    /// Record a proposal and decide on it
    Propose(ProposalArgs),
    /// List proposals awaiting human review
    ListPending,
    /// Show one proposal
    Show { id: String },
    /// Approve an escalated proposal
    Approve {
        id: String,
        #[arg(long, default_value = "operator")]
        reviewer: String,
    },
    /// Reject an escalated proposal
    Reject {
        id: String,
        #[arg(long, default_value = "operator")]
        reviewer: String,
        #[arg(long, default_value = "rejected by reviewer")]
        reason: String,
    },
    /// Apply an approved proposal
    Apply {
        id: String,
        /// Override policy.apply_timeout_ms for this call
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Restore the files an apply touched
    Rollback { id: String, rollback_point_id: String },
    /// Move a failed proposal back to pending with fresh revision tokens
    Resubmit { id: String },
    /// Settle an apply that was interrupted before it finished
    Recover { id: String },
    /// Print shell completions
    Completions { shell: Shell },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ChangeSetDoc {
    Wrapped { files: ChangeSet },
    Bare(ChangeSet),
}

/// Parse a change set document and normalise its paths.
pub fn parse_change_set(text: &str) -> Result<ChangeSet, PipelineError> {
    let doc: ChangeSetDoc = serde_json::from_str(text)
        .map_err(|e| PipelineError::Validation(format!("invalid change set JSON: {}", e)))?;
    let raw = match doc {
        ChangeSetDoc::Wrapped { files } => files,
        ChangeSetDoc::Bare(files) => files,
    };
    raw.normalized().map_err(PipelineError::Validation)
}

pub fn load_change_set(path: &Path) -> Result<ChangeSet, PipelineError> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        PipelineError::Validation(format!("cannot read change set {}: {}", path.display(), e))
    })?;
    parse_change_set(&text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::self_modify::proposal::FileChange;

    #[test]
    fn test_parse_bare_map() {
        let cs = parse_change_set(r#"{"./components/A.tsx": "x", "old.ts": null}"#).unwrap();
        assert_eq!(cs.len(), 2);
        assert_eq!(cs.get("components/A.tsx"), Some(&FileChange::Write("x".into())));
        assert_eq!(cs.get("old.ts"), Some(&FileChange::Delete));
    }

    #[test]
    fn test_parse_wrapped_map() {
        let cs = parse_change_set(r#"{"files": {"a.md": "hi"}}"#).unwrap();
        assert_eq!(cs.paths().collect::<Vec<_>>(), vec!["a.md"]);
    }

    #[test]
    fn test_parse_rejects_traversal() {
        assert!(matches!(
            parse_change_set(r#"{"../etc/passwd": "x"}"#),
            Err(PipelineError::Validation(_))
        ));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_change_set("[1, 2]").is_err());
    }

    #[test]
    fn test_cli_propose_defaults() {
        let cli = Cli::parse_from(["autopatch", "propose", "--file", "c.json", "--target", "badge"]);
        match cli.command {
            Command::Propose(args) => {
                let m = args.metadata();
                assert_eq!(m.target, "badge");
                assert_eq!(m.declared_risk, RiskLevel::Low);
                assert_eq!(m.trigger, TriggerType::SelfInitiated);
                assert_eq!(m.kind, ModificationKind::Enhancement);
                assert!(!m.requires_manual_approval);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_cli_target_is_required() {
        let err = Cli::try_parse_from(["autopatch", "propose", "--file", "c.json"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
        assert!(Cli::try_parse_from(["autopatch", "scan", "-f", "c.json"]).is_err());
    }

    #[test]
    fn test_cli_recover_takes_id() {
        let cli = Cli::parse_from(["autopatch", "recover", "abc"]);
        assert!(matches!(cli.command, Command::Recover { ref id } if id == "abc"));
    }

    #[test]
    fn test_cli_global_flags_after_subcommand() {
        let cli = Cli::parse_from([
            "autopatch", "apply", "abc", "--timeout-ms", "500", "--db", "state.db", "--json",
        ]);
        assert!(cli.json);
        assert_eq!(cli.db.as_deref(), Some(Path::new("state.db")));
        assert!(matches!(cli.command, Command::Apply { timeout_ms: Some(500), .. }));
    }

    #[test]
    fn test_cli_value_enums() {
        let cli = Cli::parse_from([
            "autopatch", "scan", "-f", "c.json", "--target", "t", "--risk", "high", "--trigger", "user-fix", "--kind", "bugfix",
        ]);
        match cli.command {
            Command::Scan(args) => {
                assert_eq!(args.risk, RiskLevel::High);
                assert_eq!(args.trigger, TriggerType::UserFix);
                assert_eq!(args.kind, ModificationKind::Bugfix);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
