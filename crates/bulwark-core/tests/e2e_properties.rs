//! Property tests over scoring, trust and halting

use chrono::NaiveDate;
use proptest::prelude::*;

use bulwark_core::config::{QualitySettings, TrustSettings};
use bulwark_core::events::FileChange;
use bulwark_core::quality::{CheckCategory, CheckStatus};
use bulwark_core::trust::{SessionEvidence, TrustPolicy, TrustState};
use bulwark_core::types::now;
use bulwark_core::{
    AgentIdentity, CheckResult, DemotionCause, Domain, Event, GovernanceConfig, GovernanceEngine, GovernanceError,
    HealthScorer, QualityGateScorer, RepoSnapshot, SessionRequest, TrustLevel, Verdict,
};

const CATEGORIES: [CheckCategory; 7] = [
    CheckCategory::Security,
    CheckCategory::Contract,
    CheckCategory::Architecture,
    CheckCategory::TestCoverage,
    CheckCategory::Documentation,
    CheckCategory::Naming,
    CheckCategory::Complexity,
];

fn check(category: usize, status: u8, forcing: bool) -> CheckResult {
    let category = CATEGORIES[category];
    let id = format!("{category:?}.generated");
    match status {
        0 => CheckResult::pass(id, category, "ok"),
        1 => {
            let failed = CheckResult::fail(id, category, "failed");
            if forcing {
                failed.forcing_reject("exploitable")
            } else {
                failed
            }
        }
        2 => CheckResult::warning(id, category, "warn"),
        _ => CheckResult::not_applicable(id, category, "n/a"),
    }
}

fn checks() -> impl Strategy<Value = Vec<CheckResult>> {
    prop::collection::vec((0..CATEGORIES.len(), 0u8..4, any::<bool>()), 0..40)
        .prop_map(|items| items.into_iter().map(|(c, s, f)| check(c, s, f)).collect())
}

const REPO_FILES: [(&str, &str); 10] = [
    (
        "CLAUDE.md",
        "## Project Context\nx\n## Conventions\nx\n## Mandatory Session Protocol\nx\n## Security Protocol\nx\n",
    ),
    ("PROJECT_PLAN.md", "plan"),
    ("ARCHITECTURE.md", "arch"),
    ("CHANGELOG.md", "## 0.2.0\n## 0.1.0\n"),
    ("MEMORY.md", "memory"),
    ("docs/adr/0001-record.md", "adr"),
    (".pre-commit-config.yaml", "repos: []"),
    (".github/workflows/ci.yml", "run: cargo test"),
    (".claude/agents/reviewer.md", "agent"),
    (".gitignore", ".env\n"),
];

proptest! {
    #[test]
    fn prop_quality_score_is_bounded_and_matches_verdict(checks in checks()) {
        let scorer = QualityGateScorer::new(&QualitySettings::default());
        let report = scorer.score(checks.clone());

        prop_assert!(report.score <= 100);
        prop_assert_eq!(report.score, 100u32.saturating_sub(report.total_deductions));
        prop_assert_eq!(report.score_verdict, Verdict::from_score(report.score));
        prop_assert_eq!(report.checks.len(), checks.len());

        let forced = checks.iter().any(|c| {
            c.category == CheckCategory::Security && c.status == CheckStatus::Fail && c.forces_reject.is_some()
        });
        if forced {
            prop_assert_eq!(report.verdict, Verdict::Reject);
        } else {
            prop_assert_eq!(report.verdict, report.score_verdict);
        }
    }

    #[test]
    fn prop_trust_moves_at_most_one_level_per_session(
        sessions in prop::collection::vec((any::<bool>(), any::<bool>()), 0..80)
    ) {
        let policy = TrustPolicy::new(&TrustSettings::default());
        let mut state = TrustState::new(Domain::Testing, "acme/api");

        for (clean, checks_passing) in sessions {
            let before = state.level;
            let transition = policy.record_session(&mut state, SessionEvidence { clean, checks_passing }, now());
            prop_assert!(state.level >= before);
            prop_assert!(state.level.value() - before.value() <= 1);
            prop_assert_eq!(transition.is_some(), state.level != before);
            if !clean {
                prop_assert_eq!(state.consecutive_clean, 0);
            }
        }

        policy.demote_to_floor(&mut state, DemotionCause::ShippedLogicError, "wrong rounding", now());
        prop_assert_eq!(state.level, TrustLevel::FullReview);
        prop_assert_eq!(state.consecutive_clean, 0);
    }

    #[test]
    fn prop_halted_session_refuses_everything(
        lines in prop::collection::vec(1u32..50, 1..10)
    ) {
        let engine = GovernanceEngine::new(GovernanceConfig::default()).unwrap();
        let request = SessionRequest::new(
            "acme/api",
            AgentIdentity::new("builder", "implementer"),
            Domain::CodeGeneration,
        );
        let id = engine.start_session(request).unwrap().session;
        engine.ingest(&id, Event::confidence("t1", 10)).unwrap();
        engine.ingest(&id, Event::confidence("t2", 15)).unwrap();
        let halted = engine.ingest(&id, Event::confidence("t3", 5));
        prop_assert!(matches!(halted, Err(GovernanceError::KillSwitchTriggered(_))));

        let report = engine.halt_report(&id).unwrap();
        for (i, n) in lines.into_iter().enumerate() {
            let refused = engine.ingest(&id, FileChange::new(format!("src/m{i}.rs"), n, 0).into());
            prop_assert!(refused.is_err());
        }
        prop_assert_eq!(engine.session(&id).unwrap().events.len(), 3);
        prop_assert_eq!(engine.halt_report(&id).unwrap(), report);
        prop_assert_eq!(engine.open_triggers().len(), 1);
    }

    #[test]
    fn prop_health_is_deterministic(mask in prop::collection::vec(any::<bool>(), REPO_FILES.len())) {
        let snapshot = REPO_FILES
            .iter()
            .zip(mask)
            .filter(|(_, keep)| *keep)
            .fold(RepoSnapshot::new(), |s, ((path, content), _)| s.with_file(*path, *content));
        let today = NaiveDate::from_ymd_opt(2026, 5, 1).unwrap();
        let scorer = HealthScorer::new(&GovernanceConfig::default().health);

        let first = scorer.score(&snapshot, today);
        let second = scorer.score(&snapshot, today);
        prop_assert!(first.score <= 100);
        prop_assert_eq!(first, second);
    }
}
