//! Stateless checks: contract, health, drift, scan, config resolution

use anyhow::Context;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use bulwark_core::config::layered;
use bulwark_core::config::{ConfigLayer, LayerLevel};
use bulwark_core::health::detect_drift;
use bulwark_core::types::now;
use bulwark_core::{ContractValidator, GovernanceConfig, GovernanceEngine, HealthScorer, RepoSnapshot, Verdict};

fn exit(code: i32) -> ExitCode {
    if code == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn read(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

pub fn validate_contract(
    config: &GovernanceConfig,
    file: &Path,
    ceiling: Option<u8>,
    json: bool,
) -> anyhow::Result<ExitCode> {
    let content = read(file)?;
    let validator = ContractValidator::new(ceiling.unwrap_or(config.contract.confidence_ceiling));
    let report = validator
        .validate_str(file.display().to_string(), &content)
        .with_context(|| format!("{} is not valid JSON", file.display()))?;

    if json {
        println!("{}", report.render_json()?);
    } else {
        println!("{}", report.render_text());
    }
    Ok(exit(report.exit_code()))
}

pub fn health(
    config: &GovernanceConfig,
    root: &Path,
    template: Option<&Path>,
    min_score: Option<u32>,
    json: bool,
) -> anyhow::Result<ExitCode> {
    let snapshot = RepoSnapshot::load(root)?;
    let mut scorer = HealthScorer::new(&config.health);
    if let Some(template) = template {
        scorer = scorer.with_template(read(template)?);
    }
    let report = scorer.score(&snapshot, now().date_naive());

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.render_text());
    }

    match min_score {
        Some(min) if report.score < min => {
            eprintln!("health score {} is below the required {min}", report.score);
            Ok(ExitCode::FAILURE)
        }
        _ => Ok(ExitCode::SUCCESS),
    }
}

pub fn drift(template: &Path, target: &Path, threshold: f64, json: bool) -> anyhow::Result<ExitCode> {
    let report = detect_drift(&read(template)?, &read(target)?, threshold);
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.render_text());
    }
    Ok(exit(if report.aligned { 0 } else { 1 }))
}

pub fn scan(engine: &GovernanceEngine, files: &[PathBuf], json: bool) -> anyhow::Result<ExitCode> {
    let files = files
        .iter()
        .map(|p| Ok((p.display().to_string(), read(p)?)))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let report = engine.evaluate_on_demand(&files)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.render_text());
    }
    Ok(exit(if report.verdict == Verdict::Reject { 1 } else { 0 }))
}

pub fn resolve_config(
    engine: &GovernanceEngine,
    org: Option<&Path>,
    team: Option<&Path>,
    repo: Option<&Path>,
    json: bool,
) -> anyhow::Result<ExitCode> {
    let mut layers = Vec::new();
    for (level, path) in [(LayerLevel::Org, org), (LayerLevel::Team, team), (LayerLevel::Repo, repo)] {
        if let Some(path) = path {
            layers.push(ConfigLayer::from_file(level, path)?);
        }
    }

    let resolved = layered::resolve(&layers, &engine.break_glass(), now())?;

    if json {
        let provenance: serde_json::Map<String, serde_json::Value> = resolved
            .provenance
            .iter()
            .filter(|(_, level)| **level != LayerLevel::Defaults)
            .map(|(key, level)| (key.clone(), serde_json::Value::String(level.to_string())))
            .collect();
        let out = serde_json::json!({
            "config": resolved.config,
            "provenance": provenance,
            "overrides": resolved.overrides,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("{}", resolved.config.to_toml_string()?);
        for (key, level) in resolved.provenance.iter().filter(|(_, l)| **l != LayerLevel::Defaults) {
            println!("# {key} <- {level}");
        }
        for finding in &resolved.overrides {
            println!(
                "# {} widened at {} ({} -> {}) under break-glass {}",
                finding.key,
                finding.level,
                finding.parent,
                finding.child,
                finding.excused_by.as_deref().unwrap_or("-")
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn code(result: anyhow::Result<ExitCode>) -> String {
        format!("{:?}", result.unwrap())
    }

    fn write_contract(dir: &Path, confidence: u8, status: &str) -> PathBuf {
        let path = dir.join("output_contract.json");
        let contract = json!({
            "status": status,
            "session": "session:replay",
            "date": "2026-05-01",
            "model": "model-x",
            "files_changed": [{"path": "src/lib.rs", "operation": "modified"}],
            "confidence": confidence,
            "not_verified": ["load behaviour under contention"],
            "architectural_impact": "low",
            "requires_review": false,
            "requires_review_reason": null
        });
        std::fs::write(&path, contract.to_string()).unwrap();
        path
    }

    #[test]
    fn test_contract_exit_codes() {
        let dir = tempfile::tempdir().unwrap();
        let config = GovernanceConfig::default();

        let ok = write_contract(dir.path(), 80, "WARN");
        assert_eq!(code(validate_contract(&config, &ok, None, true)), code(Ok(ExitCode::SUCCESS)));

        let over = write_contract(dir.path(), 92, "PASS");
        assert_eq!(code(validate_contract(&config, &over, None, true)), code(Ok(ExitCode::FAILURE)));
        // a raised ceiling accepts the same document
        assert_eq!(code(validate_contract(&config, &over, Some(95), true)), code(Ok(ExitCode::SUCCESS)));

        let failed = write_contract(dir.path(), 40, "FAIL");
        assert_eq!(code(validate_contract(&config, &failed, None, true)), code(Ok(ExitCode::FAILURE)));
    }

    #[test]
    fn test_unparseable_contract_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output_contract.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(validate_contract(&GovernanceConfig::default(), &path, None, false).is_err());
        assert!(validate_contract(&GovernanceConfig::default(), &dir.path().join("missing.json"), None, false).is_err());
    }

    const CONSTITUTION: &str = "\
## Project Context
A service that bills customers monthly.

## Conventions
snake_case everywhere.

## Session Protocol
Read the task graph before editing.

## Security Protocol
Never commit secrets.

## Quality Standards
Every change carries tests.
";

    #[test]
    fn test_drift_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("template.md");
        let target = dir.path().join("CLAUDE.md");
        std::fs::write(&template, CONSTITUTION).unwrap();
        std::fs::write(&target, CONSTITUTION).unwrap();
        assert_eq!(code(drift(&template, &target, 0.5, true)), code(Ok(ExitCode::SUCCESS)));

        let trimmed = CONSTITUTION.replace("## Security Protocol\nNever commit secrets.\n\n", "");
        std::fs::write(&target, trimmed).unwrap();
        assert_eq!(code(drift(&template, &target, 0.5, true)), code(Ok(ExitCode::FAILURE)));
    }
}
