use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{CommandFactory, Parser};
use colored::*;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use autopatch::cli::{load_change_set, Cli, Command};
use autopatch::self_modify::collaborators::TracingSink;
use autopatch::{
    ApplyControl, DecisionAction, FsGateway, ModificationLedger, ModificationProposal,
    PipelineConfig, ProposalStatus, SqliteRepository,
};

type Ledger = ModificationLedger<FsGateway, SqliteRepository>;

// ---------------------------------------------------------------------------
// Output helpers
// ---------------------------------------------------------------------------

fn status_label(status: ProposalStatus) -> ColoredString {
    let label = status.as_str();
    match status {
        ProposalStatus::Pending => label.yellow(),
        ProposalStatus::Approved | ProposalStatus::Applied => label.green(),
        ProposalStatus::Applying => label.cyan(),
        ProposalStatus::Rejected | ProposalStatus::Failed => label.red(),
        ProposalStatus::RolledBack => label.magenta(),
    }
}

fn action_label(action: DecisionAction) -> ColoredString {
    let label = action.to_string();
    match action {
        DecisionAction::Approve => label.green().bold(),
        DecisionAction::Escalate => label.yellow().bold(),
        DecisionAction::Reject => label.red().bold(),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_proposal_line(p: &ModificationProposal) {
    println!(
        "{}  {:<12} {:<8} conf={:>5.1}  files={}  {}",
        p.id.bright_white(),
        status_label(p.status),
        p.required_risk.to_string(),
        p.decision.inputs.confidence,
        p.change_set.len(),
        p.metadata.target,
    );
}

// ---------------------------------------------------------------------------
// Setup
// ---------------------------------------------------------------------------

fn load_config(cli: &Cli) -> Result<PipelineConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(db) = &cli.db {
        config.storage.database = db.display().to_string();
    }
    if let Some(root) = &cli.root {
        config.storage.root = root.display().to_string();
    }
    Ok(config)
}

fn init_tracing(config: &PipelineConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_ledger(config: &PipelineConfig) -> Result<Ledger, Box<dyn std::error::Error>> {
    let repo = SqliteRepository::open(&config.storage.database)?;
    let gateway = FsGateway::new(PathBuf::from(&config.storage.root));
    let ledger = ModificationLedger::new(gateway, repo, config)?
        .with_notification_sink(Arc::new(TracingSink));
    Ok(ledger)
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if let Command::Completions { shell } = &cli.command {
        let mut command = Cli::command();
        clap_complete::generate(*shell, &mut command, "autopatch", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli)?;
    init_tracing(&config);
    let ledger = build_ledger(&config)?;
    let json = cli.json;

    match cli.command {
        Command::Scan(args) => {
            let changes = load_change_set(&args.file)?;
            let evaluation = ledger.evaluate(&changes, &args.metadata());
            if json {
                print_json(&evaluation)?;
            } else {
                println!(
                    "{}  required={}  confidence={:.1}",
                    action_label(evaluation.decision.action),
                    evaluation.risk.required_risk_level,
                    evaluation.confidence.score,
                );
                for v in &evaluation.risk.violations {
                    println!("  {} {}", "violation".red(), v);
                }
                for w in &evaluation.risk.warnings {
                    println!("  {} {}", "warning".yellow(), w);
                }
                println!("  {}", evaluation.decision.reasoning.dimmed());
            }
        }
        Command::Propose(args) => {
            let changes = load_change_set(&args.file)?;
            let outcome = ledger.propose(changes, args.metadata()).await?;
            if json {
                print_json(&outcome)?;
            } else {
                println!(
                    "{} {}  {}",
                    action_label(outcome.action()),
                    outcome.proposal.id.bright_white(),
                    outcome.proposal.decision.reasoning.dimmed(),
                );
            }
            if let Some(err) = outcome.rejection_error() {
                return Err(err.into());
            }
        }
        Command::ListPending => {
            let pending = ledger.list_pending()?;
            if json {
                print_json(&pending)?;
            } else if pending.is_empty() {
                println!("{}", "no proposals awaiting review".dimmed());
            } else {
                pending.iter().for_each(print_proposal_line);
            }
        }
        Command::Show { id } => {
            let proposal = ledger.get(&id)?;
            if json {
                print_json(&proposal)?;
            } else {
                print_proposal_line(&proposal);
                for path in proposal.change_set.paths() {
                    println!("  {}", path);
                }
                if let Some(err) = &proposal.last_error {
                    println!("  {} {}", "last error:".red(), err);
                }
            }
        }
        Command::Approve { id, reviewer } => {
            let proposal = ledger.approve_pending(&id, &reviewer)?;
            if json {
                print_json(&proposal)?;
            } else {
                print_proposal_line(&proposal);
            }
        }
        Command::Reject { id, reviewer, reason } => {
            let proposal = ledger.reject_pending(&id, &reviewer, &reason)?;
            if json {
                print_json(&proposal)?;
            } else {
                print_proposal_line(&proposal);
            }
        }
        Command::Apply { id, timeout_ms } => {
            let mut control = ApplyControl::new();
            if let Some(ms) = timeout_ms {
                control = control.with_timeout(Duration::from_millis(ms));
            }
            let report = ledger.apply_with(&id, &control).await?;
            if json {
                print_json(&report)?;
            } else {
                println!(
                    "{} {} file(s) written  rollback point {}",
                    "applied".green().bold(),
                    report.files_written,
                    report.rollback_point_id.bright_white(),
                );
            }
        }
        Command::Rollback { id, rollback_point_id } => {
            let report = ledger.rollback(&id, &rollback_point_id).await?;
            if json {
                print_json(&report)?;
            } else if report.already_rolled_back {
                println!("{}", "already rolled back".dimmed());
            } else {
                println!("{} {}", "rolled back".magenta().bold(), report.restore.summary());
            }
        }
        Command::Resubmit { id } => {
            let proposal = ledger.resubmit(&id).await?;
            if json {
                print_json(&proposal)?;
            } else {
                print_proposal_line(&proposal);
            }
        }
        Command::Recover { id } => {
            let report = ledger.recover(&id).await?;
            if json {
                print_json(&report)?;
            } else {
                println!(
                    "{} {}  {}",
                    "recovered".bold(),
                    status_label(report.status),
                    report.restore.summary()
                );
            }
        }
        Command::Completions { .. } => {}
    }

    Ok(())
}
