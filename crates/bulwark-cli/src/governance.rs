//! Stateful commands over the governance database

use anyhow::{anyhow, Context};
use chrono::Duration;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::process::ExitCode;

use bulwark_core::types::now;
use bulwark_core::{BreakGlassRecord, DemotionCause, Domain, GovernanceEngine};

fn parse_domain(domain: &str) -> anyhow::Result<Domain> {
    Domain::parse(domain).ok_or_else(|| {
        anyhow!(
            "unknown domain '{domain}' (expected one of {})",
            Domain::ALL.iter().map(|d| d.as_str()).collect::<Vec<_>>().join(", ")
        )
    })
}

pub fn trust_show(engine: &GovernanceEngine, repository: &str, history: bool, json: bool) -> anyhow::Result<ExitCode> {
    let states = engine.trust().states_for(repository);
    if json {
        let mut out = serde_json::json!({ "repository": repository, "states": states });
        if history {
            let transitions: Vec<_> = engine
                .trust()
                .history()
                .into_iter()
                .filter(|t| t.repository == repository)
                .collect();
            out["history"] = serde_json::to_value(transitions)?;
        }
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(ExitCode::SUCCESS);
    }

    println!("Trust for {repository}");
    for state in &states {
        let next = engine
            .trust()
            .policy()
            .threshold(state.level)
            .map_or_else(|| "top level".to_string(), |t| format!("{}/{t} clean", state.consecutive_clean));
        println!(
            "  {:<16} level {} ({:<20}) {next}",
            state.domain.as_str(),
            state.level.value(),
            state.level.review_depth()
        );
    }
    if history {
        println!();
        for domain in Domain::ALL {
            for t in engine.trust().history_for(repository, domain) {
                println!(
                    "  {} {:<16} {:?} {} -> {}: {}",
                    t.at.format("%Y-%m-%d %H:%M"),
                    t.domain.as_str(),
                    t.kind,
                    t.from.value(),
                    t.to.value(),
                    t.reason
                );
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

pub fn trust_incident(
    engine: &GovernanceEngine,
    repository: &str,
    domain: &str,
    cause: &str,
    detail: &str,
    json: bool,
) -> anyhow::Result<ExitCode> {
    let domain = parse_domain(domain)?;
    let cause = DemotionCause::parse(cause).ok_or_else(|| anyhow!("unknown demotion cause '{cause}'"))?;
    let transitions = engine.report_incident(repository, domain, cause, detail)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&transitions)?);
    } else {
        for t in &transitions {
            println!("{} {} -> {} ({})", t.domain.as_str(), t.from.value(), t.to.value(), t.reason);
        }
    }
    Ok(ExitCode::SUCCESS)
}

pub fn audit_export(engine: &GovernanceEngine, since_days: Option<i64>, out: Option<&Path>) -> anyhow::Result<ExitCode> {
    let since = since_days.map(|days| now() - Duration::days(days));
    let written = match out {
        Some(path) => {
            let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
            let mut writer = BufWriter::new(file);
            let written = engine.audit().export_jsonl(since, &mut writer)?;
            writer.flush()?;
            written
        }
        None => engine.audit().export_jsonl(since, std::io::stdout().lock())?,
    };
    tracing::info!(entries = written, "Audit log exported");
    Ok(ExitCode::SUCCESS)
}

pub fn audit_verify(engine: &GovernanceEngine) -> anyhow::Result<ExitCode> {
    match engine.audit().verify() {
        Ok(()) => {
            println!("audit chain intact ({} entries)", engine.audit().len());
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            println!("audit chain broken: {e}");
            Ok(ExitCode::FAILURE)
        }
    }
}

pub fn status(engine: &GovernanceEngine, repository: Option<&str>, json: bool) -> anyhow::Result<ExitCode> {
    let open: Vec<_> = engine
        .open_triggers()
        .into_iter()
        .filter(|t| repository.map_or(true, |r| t.repository == r))
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&open)?);
    } else if open.is_empty() {
        println!("no unresolved kill switch");
    } else {
        for t in &open {
            println!(
                "{} {} in {} ({}): {}\n  resume with: bulwark resume {} --by <name>",
                t.id, t.kind, t.repository, t.session, t.detail, t.id
            );
        }
    }
    Ok(if open.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

pub fn resume(engine: &GovernanceEngine, trigger_id: &str, by: &str, note: &str) -> anyhow::Result<ExitCode> {
    let resolution = engine.resume(trigger_id, by, note)?;
    println!("{} cleared by {} at {}", resolution.trigger_id, resolution.resolved_by, resolution.at);
    Ok(ExitCode::SUCCESS)
}

pub fn break_glass_add(
    engine: &GovernanceEngine,
    activator: &str,
    scenario: &str,
    rule: &str,
    hours: i64,
    actions: &[String],
) -> anyhow::Result<ExitCode> {
    let mut record = BreakGlassRecord::new(activator, scenario, rule, now(), Duration::hours(hours))?;
    for action in actions {
        record = record.with_action(action.clone());
    }
    let id = record.id.clone();
    let (ends_at, review_date) = (record.ends_at, record.review_date);
    engine.register_break_glass(record)?;
    println!("{id} active until {ends_at}; review due {review_date}");
    Ok(ExitCode::SUCCESS)
}

pub fn break_glass_list(engine: &GovernanceEngine, json: bool) -> anyhow::Result<ExitCode> {
    let registry = engine.break_glass();
    if json {
        println!("{}", registry.to_json()?);
        return Ok(ExitCode::SUCCESS);
    }

    let at = now();
    let today = at.date_naive();
    for r in registry.records() {
        let state = if r.is_active(at) {
            "active"
        } else if r.reviewed {
            "reviewed"
        } else if r.is_review_overdue(today) {
            "REVIEW OVERDUE"
        } else {
            "review pending"
        };
        println!(
            "{} {:<14} {} by {} ({} -> {}): {}",
            r.id, state, r.rule_overridden, r.activator, r.starts_at, r.ends_at, r.scenario
        );
    }
    Ok(ExitCode::SUCCESS)
}

pub fn break_glass_review(engine: &GovernanceEngine, id: &str, resolution: &str) -> anyhow::Result<ExitCode> {
    let record = engine.review_break_glass(id, resolution)?;
    println!("{} reviewed", record.id);
    Ok(ExitCode::SUCCESS)
}

pub fn break_glass_export(engine: &GovernanceEngine, out: &Path) -> anyhow::Result<ExitCode> {
    if let Some(parent) = out.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(out, engine.break_glass().to_json()?).with_context(|| format!("writing {}", out.display()))?;
    println!("{} records written to {}", engine.break_glass().records().len(), out.display());
    Ok(ExitCode::SUCCESS)
}
