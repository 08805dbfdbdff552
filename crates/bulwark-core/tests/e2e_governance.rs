//! End-to-end governance scenarios through the engine facade

use chrono::NaiveDate;
use serde_json::{json, Value};
use std::sync::Arc;

use bulwark_core::audit::AuditKind;
use bulwark_core::contract::ContractError;
use bulwark_core::events::FileChange;
use bulwark_core::quality::CheckCategory;
use bulwark_core::{
    AgentIdentity, CheckResult, ContractValidator, Domain, Event, GovernanceConfig, GovernanceEngine,
    GovernanceError, HealthScorer, QualityGateScorer, RepoSnapshot, SessionId, SessionRequest, SqliteStore,
    TriggerKind, Verdict,
};

fn config() -> GovernanceConfig {
    GovernanceConfig::new()
        .with_allowed_server("implementer", "github")
        .with_server("github", "api.github.com", Some(10))
}

fn request(repo: &str) -> SessionRequest {
    SessionRequest::new(repo, AgentIdentity::new("builder", "implementer"), Domain::CodeGeneration)
}

fn contract(session: &SessionId, confidence: u8) -> Value {
    json!({
        "status": "PASS",
        "session": session.as_str(),
        "date": "2026-05-01",
        "model": "model-x",
        "files_changed": [{"path": "src/billing.rs", "operation": "modified"}],
        "confidence": confidence,
        "not_verified": [],
        "architectural_impact": "low",
        "requires_review": false,
        "requires_review_reason": null
    })
}

#[test]
fn test_confidence_above_ceiling_fails_the_session() {
    let engine = GovernanceEngine::new(config()).unwrap();
    let id = engine.start_session(request("acme/billing")).unwrap().session;
    engine
        .ingest(&id, FileChange::new("src/billing.rs", 12, 3).into())
        .unwrap();

    let outcome = engine.close_session(&id, &contract(&id, 92), Vec::new()).unwrap();
    assert_eq!(outcome.exit_code(), 1);
    assert!(!outcome.is_clean());
    assert!(outcome
        .contract
        .errors
        .iter()
        .any(|e| matches!(e, ContractError::ConfidenceCeilingExceeded { value: 92, ceiling: 85 })));
    assert_eq!(outcome.trust.consecutive_clean, 0);
    assert!(outcome.quality.failed().any(|c| c.category == CheckCategory::Contract));
}

#[test]
fn test_review_flag_without_reason_is_inconsistent() {
    let mut value = contract(&SessionId::new(), 70);
    value["requires_review"] = json!(true);
    let report = ContractValidator::new(85).validate("output_contract.json", &value);

    assert_eq!(report.exit_code(), 1);
    assert!(matches!(
        report.errors[0].to_governance_error(),
        GovernanceError::ContractInconsistency(_)
    ));
}

#[test]
fn test_quality_score_63_needs_significant_revision() {
    let scorer = QualityGateScorer::new(&config().quality);
    let report = scorer.score(vec![
        CheckResult::fail("security.input_validation", CheckCategory::Security, "unchecked query parameter"),
        CheckResult::fail("tests.coverage", CheckCategory::TestCoverage, "coverage dropped from 81% to 74%"),
        CheckResult::warning("complexity.file_length", CheckCategory::Complexity, "billing.rs has 512 lines"),
        CheckResult::pass("architecture.layering", CheckCategory::Architecture, "handlers stay out of storage"),
        CheckResult::not_applicable("docs.public_api", CheckCategory::Documentation, "no public API change"),
    ]);

    assert_eq!(report.score, 63);
    assert_eq!(report.verdict, Verdict::ReviseSignificant);
    assert_eq!(report.checks.len(), 5);
    assert!(report.override_reason.is_none());
}

#[test]
fn test_health_with_one_critical_and_two_degraded_dimensions() {
    // CHANGELOG.md, MEMORY.md and PROJECT_PLAN.md are absent
    let snapshot = RepoSnapshot::new()
        .with_file(
            "CLAUDE.md",
            "## Project Context\nx\n## Conventions\nx\n## Mandatory Session Protocol\nx\n\
             ## Security Protocol\nx\n## Mandatory Task Reporting\nx\n",
        )
        .with_file("ARCHITECTURE.md", "arch")
        .with_file("docs/adr/0001-record.md", "adr")
        .with_file(".pre-commit-config.yaml", "repos: []")
        .with_file(".github/workflows/review.yml", "uses: anthropics/claude-code-action")
        .with_file(".claude/agents/reviewer.md", "agent")
        .with_file(".claude/commands/ship.md", "command")
        .with_file(".gitignore", ".env\n");

    let today = NaiveDate::from_ymd_opt(2026, 5, 1).unwrap();
    let report = HealthScorer::new(&config().health).score(&snapshot, today);
    assert_eq!(report.score, 64);
    assert_eq!(report.maturity_level, 3);
    assert_eq!(report.remediation.len(), 3);
}

#[test]
fn test_confidence_collapse_halts_with_evidence() {
    let engine = GovernanceEngine::new(config()).unwrap();
    let id = engine.start_session(request("acme/billing")).unwrap().session;
    engine.ingest(&id, Event::confidence("task-1", 25)).unwrap();
    engine.ingest(&id, Event::confidence("task-2", 20)).unwrap();
    let err = engine.ingest(&id, Event::confidence("task-3", 28)).unwrap_err();

    let GovernanceError::KillSwitchTriggered(report) = err else {
        panic!("expected a kill switch");
    };
    assert_eq!(report.trigger.kind, TriggerKind::ConfidenceCollapse);
    assert_eq!(report.trigger.evidence.len(), 3);
    assert!(engine.halt_report(&id).unwrap().is_some());
    assert!(engine
        .audit()
        .entries()
        .iter()
        .any(|e| e.kind == AuditKind::KillSwitch));
}

#[test]
fn test_halt_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("governance.db");

    let trigger_id = {
        let store = Arc::new(SqliteStore::open(&db).unwrap());
        let engine = GovernanceEngine::with_store(config(), store).unwrap();
        let id = engine.start_session(request("acme/billing")).unwrap().session;
        engine.ingest(&id, Event::confidence("task-1", 25)).unwrap();
        engine.ingest(&id, Event::confidence("task-2", 20)).unwrap();
        match engine.ingest(&id, Event::confidence("task-3", 28)) {
            Err(GovernanceError::KillSwitchTriggered(report)) => report.trigger.id.clone(),
            other => panic!("expected a kill switch, got {other:?}"),
        }
    };

    let store = Arc::new(SqliteStore::open(&db).unwrap());
    let engine = GovernanceEngine::with_store(config(), store).unwrap();
    assert_eq!(engine.open_triggers().len(), 1);
    assert!(matches!(
        engine.start_session(request("acme/billing")),
        Err(GovernanceError::UnresolvedTrigger { .. })
    ));
    engine.audit().verify().unwrap();

    engine.resume(&trigger_id, "sam", "evidence reviewed").unwrap();
    drop(engine);

    let store = Arc::new(SqliteStore::open(&db).unwrap());
    let engine = GovernanceEngine::with_store(config(), store).unwrap();
    assert!(engine.open_triggers().is_empty());
    assert!(engine.start_session(request("acme/billing")).is_ok());
}

#[test]
fn test_trust_and_audit_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("governance.db");

    let entries = {
        let store = Arc::new(SqliteStore::open(&db).unwrap());
        let engine = GovernanceEngine::with_store(config(), store).unwrap();
        let id = engine.start_session(request("acme/billing")).unwrap().session;
        engine
            .ingest(&id, FileChange::new("src/billing.rs", 4, 1).into())
            .unwrap();
        let outcome = engine.close_session(&id, &contract(&id, 80), Vec::new()).unwrap();
        assert!(outcome.is_clean());
        engine.audit().len()
    };

    let store = Arc::new(SqliteStore::open(&db).unwrap());
    let engine = GovernanceEngine::with_store(config(), store).unwrap();
    let state = engine.trust().state("acme/billing", Domain::CodeGeneration);
    assert_eq!(state.consecutive_clean, 1);
    assert_eq!(engine.audit().len(), entries);
    engine.audit().verify().unwrap();

    // the chain continues across the restart
    let id = engine.start_session(request("acme/billing")).unwrap().session;
    engine.cancel_session(&id, "operator abort").unwrap();
    assert!(engine.audit().len() > entries);
    engine.audit().verify().unwrap();
}
