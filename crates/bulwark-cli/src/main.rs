//! Bulwark CLI
//!
//! CI and operator surface of the governance engine.
//!
//! # Usage
//! ```bash
//! bulwark contract validate output_contract.json
//! bulwark health . --json
//! bulwark session replay events.jsonl --repository acme/api --agent builder --role implementer
//! bulwark status --repository acme/api
//! ```
//!
//! Exit codes: 0 pass (WARN included), 1 fail (validation error, ceiling
//! exceeded, inconsistency, halt, unresolved kill switch).

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use bulwark_core::{GovernanceConfig, GovernanceEngine, SqliteStore};

mod checks;
mod governance;
mod replay;

/// Bulwark - governance enforcement for AI coding-agent sessions
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Governance config (TOML); defaults apply when absent
    #[arg(short, long, global = true, env = "BULWARK_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Governance database (audit log, trust, kill switch, break-glass)
    #[arg(long, global = true, env = "BULWARK_DB", default_value = ".governance/bulwark.db")]
    db: PathBuf,

    /// Machine-readable output
    #[arg(long, global = true)]
    json: bool,

    /// Enable verbose debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Output contract checks
    Contract {
        #[command(subcommand)]
        command: ContractCommand,
    },

    /// Score the governance health of a repository
    Health {
        /// Repository root
        #[arg(default_value = ".")]
        root: PathBuf,

        /// Constitution template to check drift against
        #[arg(long)]
        template: Option<PathBuf>,

        /// Fail when the score is below this value
        #[arg(long)]
        min_score: Option<u32>,
    },

    /// Compare a constitution file against its template
    Drift {
        /// Template file
        #[arg(long)]
        template: PathBuf,

        /// File to check
        #[arg(default_value = "CLAUDE.md")]
        target: PathBuf,

        /// Section length ratio tolerance (defaults to health.drift_threshold)
        #[arg(long)]
        threshold: Option<f64>,
    },

    /// Run the quality gate over a set of files
    Scan {
        /// Files to scan
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Hierarchical configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Session replay
    Session {
        #[command(subcommand)]
        command: SessionCommand,
    },

    /// Progressive trust
    Trust {
        #[command(subcommand)]
        command: TrustCommand,
    },

    /// Audit log
    Audit {
        #[command(subcommand)]
        command: AuditCommand,
    },

    /// Kill switch state of a repository; exits 1 while a trigger is open
    Status {
        #[arg(long)]
        repository: Option<String>,
    },

    /// Clear a kill-switch trigger after review
    Resume {
        /// Trigger id from the halt report
        trigger_id: String,

        /// Who reviewed the evidence
        #[arg(long)]
        by: String,

        #[arg(long, default_value = "")]
        note: String,
    },

    /// Break-glass override records
    BreakGlass {
        #[command(subcommand)]
        command: BreakGlassCommand,
    },
}

#[derive(Subcommand)]
enum ContractCommand {
    /// Validate an output contract
    Validate {
        #[arg(default_value = "output_contract.json")]
        file: PathBuf,

        /// Override contract.confidence_ceiling
        #[arg(long)]
        ceiling: Option<u8>,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Merge org → team → repo layers and print the effective config
    Resolve {
        #[arg(long)]
        org: Option<PathBuf>,
        #[arg(long)]
        team: Option<PathBuf>,
        #[arg(long)]
        repo: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum SessionCommand {
    /// Feed a JSON Lines event file through the engine
    Replay(replay::ReplayArgs),
}

#[derive(Subcommand)]
enum TrustCommand {
    /// Current level of every domain
    Show {
        #[arg(long)]
        repository: String,

        /// Include transition history
        #[arg(long)]
        history: bool,
    },

    /// Report a shipped problem; demotes trust
    Incident {
        #[arg(long)]
        repository: String,
        #[arg(long)]
        domain: String,
        /// shipped_logic_error, shipped_security_issue, architectural_drift,
        /// coverage_decrease or governance_file_modified
        #[arg(long)]
        cause: String,
        #[arg(long)]
        detail: String,
    },
}

#[derive(Subcommand)]
enum AuditCommand {
    /// Read-only JSON Lines export
    Export {
        /// Only entries from the last N days
        #[arg(long)]
        since_days: Option<i64>,

        /// Write to a file instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Verify the hash chain
    Verify,
}

#[derive(Subcommand)]
enum BreakGlassCommand {
    /// Open a time-boxed override (at most 24h)
    Add {
        #[arg(long)]
        activator: String,
        #[arg(long)]
        scenario: String,
        /// Rule id, config key or path being overridden
        #[arg(long)]
        rule: String,
        #[arg(long, default_value = "4")]
        hours: i64,
        #[arg(long = "action")]
        actions: Vec<String>,
    },

    /// List records and their review state
    List,

    /// Record the mandatory review
    Review {
        id: String,
        #[arg(long)]
        resolution: String,
    },

    /// Write the registry as JSON (read by the health scorer)
    Export {
        #[arg(long, default_value = ".governance/break_glass.json")]
        out: PathBuf,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> anyhow::Result<GovernanceConfig> {
    match path {
        Some(path) => Ok(GovernanceConfig::from_file(path)?),
        None => Ok(GovernanceConfig::default()),
    }
}

/// Engine backed by the governance database
fn open_engine(cli: &Cli) -> anyhow::Result<GovernanceEngine> {
    let config = load_config(cli.config.as_deref())?;
    let store = Arc::new(SqliteStore::open(&cli.db)?);
    Ok(GovernanceEngine::with_store(config, store)?)
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    match &cli.command {
        Commands::Contract {
            command: ContractCommand::Validate { file, ceiling },
        } => {
            let config = load_config(cli.config.as_deref())?;
            checks::validate_contract(&config, file, *ceiling, cli.json)
        }
        Commands::Health {
            root,
            template,
            min_score,
        } => {
            let config = load_config(cli.config.as_deref())?;
            checks::health(&config, root, template.as_deref(), *min_score, cli.json)
        }
        Commands::Drift {
            template,
            target,
            threshold,
        } => {
            let config = load_config(cli.config.as_deref())?;
            let threshold = threshold.unwrap_or(config.health.drift_threshold);
            checks::drift(template, target, threshold, cli.json)
        }
        Commands::Scan { files } => checks::scan(&open_engine(&cli)?, files, cli.json),
        Commands::Config {
            command: ConfigCommand::Resolve { org, team, repo },
        } => checks::resolve_config(
            &open_engine(&cli)?,
            org.as_deref(),
            team.as_deref(),
            repo.as_deref(),
            cli.json,
        ),
        Commands::Session {
            command: SessionCommand::Replay(args),
        } => replay::run(open_engine(&cli)?, args, cli.json),
        Commands::Trust { command } => {
            let engine = open_engine(&cli)?;
            match command {
                TrustCommand::Show {
                    repository,
                    history,
                } => governance::trust_show(&engine, repository, *history, cli.json),
                TrustCommand::Incident {
                    repository,
                    domain,
                    cause,
                    detail,
                } => governance::trust_incident(&engine, repository, domain, cause, detail, cli.json),
            }
        }
        Commands::Audit { command } => {
            let engine = open_engine(&cli)?;
            match command {
                AuditCommand::Export { since_days, out } => {
                    governance::audit_export(&engine, *since_days, out.as_deref())
                }
                AuditCommand::Verify => governance::audit_verify(&engine),
            }
        }
        Commands::Status { repository } => {
            governance::status(&open_engine(&cli)?, repository.as_deref(), cli.json)
        }
        Commands::Resume {
            trigger_id,
            by,
            note,
        } => governance::resume(&open_engine(&cli)?, trigger_id, by, note),
        Commands::BreakGlass { command } => {
            let engine = open_engine(&cli)?;
            match command {
                BreakGlassCommand::Add {
                    activator,
                    scenario,
                    rule,
                    hours,
                    actions,
                } => governance::break_glass_add(&engine, activator, scenario, rule, *hours, actions),
                BreakGlassCommand::List => governance::break_glass_list(&engine, cli.json),
                BreakGlassCommand::Review { id, resolution } => {
                    governance::break_glass_review(&engine, id, resolution)
                }
                BreakGlassCommand::Export { out } => governance::break_glass_export(&engine, out),
            }
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
