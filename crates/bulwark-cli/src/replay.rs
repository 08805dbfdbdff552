//! Session replay
//!
//! Feeds a JSON Lines event file through the engine in order, then submits
//! the output contract. Rejected tool calls and held file changes are
//! reported and replay continues; a kill switch stops it with exit code 1.

use anyhow::{anyhow, Context};
use clap::Args;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use bulwark_core::{
    AgentIdentity, DeclaredScope, Domain, Event, GovernanceEngine, GovernanceError, RepoSnapshot, SessionRequest,
};

#[derive(Args, Debug)]
pub struct ReplayArgs {
    /// Events, one JSON object per line
    events: PathBuf,

    #[arg(long)]
    repository: String,

    #[arg(long)]
    agent: String,

    /// Agent role; keys the tool allowlist
    #[arg(long)]
    role: String,

    #[arg(long)]
    model: Option<String>,

    #[arg(long, default_value = "code_generation")]
    domain: String,

    /// Output contract submitted at the end
    #[arg(long)]
    contract: Option<PathBuf>,

    /// Repository root used to resolve referenced paths and symbols
    #[arg(long)]
    snapshot: Option<PathBuf>,

    #[arg(long)]
    read_only: bool,

    #[arg(long)]
    production: bool,

    #[arg(long)]
    large_payload: bool,

    /// Confirm HIGH blast radius alerts as this person
    #[arg(long, value_name = "NAME")]
    confirm_scope: Option<String>,
}

fn load_events(args: &ReplayArgs) -> anyhow::Result<Vec<Event>> {
    let file = std::fs::File::open(&args.events).with_context(|| format!("opening {}", args.events.display()))?;
    let mut events = Vec::new();
    for (i, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let event: Event = serde_json::from_str(&line)
            .with_context(|| format!("{} line {}: not a valid event", args.events.display(), i + 1))?;
        events.push(event);
    }
    Ok(events)
}

pub fn run(engine: GovernanceEngine, args: &ReplayArgs, json: bool) -> anyhow::Result<ExitCode> {
    let domain = Domain::parse(&args.domain).ok_or_else(|| anyhow!("unknown domain '{}'", args.domain))?;
    let events = load_events(args)?;
    let contract = args
        .contract
        .as_ref()
        .map(|path| -> anyhow::Result<serde_json::Value> {
            let content = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            Ok(serde_json::from_str(&content)?)
        })
        .transpose()?;

    let engine = match &args.snapshot {
        Some(root) => {
            let snapshot = RepoSnapshot::load(root)?;
            tracing::debug!(files = snapshot.len(), "Replay snapshot loaded");
            engine.with_oracle(Arc::new(snapshot))
        }
        None => engine,
    };

    let mut agent = AgentIdentity::new(&args.agent, &args.role);
    if let Some(model) = &args.model {
        agent = agent.with_model(model);
    }
    let scope = DeclaredScope {
        read_only: args.read_only,
        production_authorized: args.production,
        large_payload_declared: args.large_payload,
        ..DeclaredScope::default()
    };
    let start = engine.start_session(SessionRequest::new(&args.repository, agent, domain).with_scope(scope))?;
    let id = start.session;
    for entry in &start.knowledge {
        eprintln!("knowledge [{:?}] {}", entry.category, entry.content);
    }

    let mut refused = 0usize;
    for event in events {
        match engine.ingest(&id, event) {
            Ok(ingested) => {
                if let Some(reason) = ingested.scope_alert {
                    eprintln!("scope alert at #{}: {reason}", ingested.seq);
                    if let Some(name) = &args.confirm_scope {
                        engine.confirm_scope(&id, name)?;
                    }
                }
            }
            Err(GovernanceError::KillSwitchTriggered(report)) => {
                if json {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                } else {
                    println!("{}", report.render_text());
                }
                return Ok(ExitCode::FAILURE);
            }
            Err(e) if e.is_recoverable() => {
                refused += 1;
                eprintln!("refused: {e}");
            }
            Err(e) => return Err(e.into()),
        }
    }

    let Some(contract) = contract else {
        engine.cancel_session(&id, "replay ended without an output contract")?;
        println!("replayed session {id}; {refused} events refused; no contract submitted");
        return Ok(ExitCode::SUCCESS);
    };

    let outcome = engine.close_session(&id, &contract, Vec::new())?;
    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        println!("{}", outcome.contract.render_text());
        println!();
        println!("{}", outcome.quality.render_text());
        println!();
        println!(
            "trust {} level {} ({} consecutive clean){}",
            outcome.trust.domain.as_str(),
            outcome.trust.level.value(),
            outcome.trust.consecutive_clean,
            outcome
                .transition
                .as_ref()
                .map_or_else(String::new, |t| format!(", promoted from {}", t.from.value()))
        );
        if refused > 0 {
            println!("{refused} events refused during replay");
        }
    }
    Ok(if outcome.exit_code() == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
