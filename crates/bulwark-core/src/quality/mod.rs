//! Quality Gate - checklist scoring
//!
//! A report starts at 100 and loses a fixed number of points per failed
//! check, by category. Complexity checks deduct per warning. The score never
//! drops below 0. Every check is listed in the report with its status,
//! inapplicable ones included.

pub mod scanner;

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

use crate::blast_radius::{BlastRadiusLevel, BlastRadiusSnapshot};
use crate::config::{Deductions, QualitySettings};
use crate::contract::{ArchitecturalImpact, ContractError, ContractReport};
use crate::types::{now, Timestamp};

pub use scanner::{FileSetScanner, SecurityFinding, Severity};

/// Check category, which decides the deduction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckCategory {
    Security,
    Contract,
    Architecture,
    TestCoverage,
    Documentation,
    Naming,
    Complexity,
}

impl CheckCategory {
    pub fn deduction(self, deductions: &Deductions) -> u32 {
        match self {
            CheckCategory::Security => deductions.security,
            CheckCategory::Contract => deductions.contract,
            CheckCategory::Architecture => deductions.architecture,
            CheckCategory::TestCoverage => deductions.test_coverage,
            CheckCategory::Documentation => deductions.documentation,
            CheckCategory::Naming => deductions.naming,
            CheckCategory::Complexity => deductions.complexity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Fail,
    Warning,
    NotApplicable,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CheckStatus::Pass => "PASS",
            CheckStatus::Fail => "FAIL",
            CheckStatus::Warning => "WARN",
            CheckStatus::NotApplicable => "N/A",
        };
        f.write_str(name)
    }
}

/// One checklist item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub id: String,
    pub category: CheckCategory,
    pub status: CheckStatus,
    pub detail: String,
    /// Set on security failures severe enough to force REJECT
    #[serde(default)]
    pub forces_reject: Option<String>,
}

impl CheckResult {
    fn with_status(id: impl Into<String>, category: CheckCategory, status: CheckStatus, detail: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            category,
            status,
            detail: detail.into(),
            forces_reject: None,
        }
    }

    pub fn pass(id: impl Into<String>, category: CheckCategory, detail: impl Into<String>) -> Self {
        Self::with_status(id, category, CheckStatus::Pass, detail)
    }

    pub fn fail(id: impl Into<String>, category: CheckCategory, detail: impl Into<String>) -> Self {
        Self::with_status(id, category, CheckStatus::Fail, detail)
    }

    pub fn warning(id: impl Into<String>, category: CheckCategory, detail: impl Into<String>) -> Self {
        Self::with_status(id, category, CheckStatus::Warning, detail)
    }

    pub fn not_applicable(id: impl Into<String>, category: CheckCategory, detail: impl Into<String>) -> Self {
        Self::with_status(id, category, CheckStatus::NotApplicable, detail)
    }

    pub fn forcing_reject(mut self, justification: impl Into<String>) -> Self {
        self.forces_reject = Some(justification.into());
        self
    }

    /// Points this check costs under `deductions`
    pub fn deduction(&self, deductions: &Deductions) -> u32 {
        match (self.category, self.status) {
            (_, CheckStatus::Fail) => self.category.deduction(deductions),
            (CheckCategory::Complexity, CheckStatus::Warning) => self.category.deduction(deductions),
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approve,
    Revise,
    ReviseSignificant,
    Reject,
}

impl Verdict {
    pub fn from_score(score: u32) -> Self {
        if score >= 90 {
            Verdict::Approve
        } else if score >= 70 {
            Verdict::Revise
        } else if score >= 50 {
            Verdict::ReviseSignificant
        } else {
            Verdict::Reject
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Approve => "APPROVE",
            Verdict::Revise => "REVISE",
            Verdict::ReviseSignificant => "REVISE (significant)",
            Verdict::Reject => "REJECT",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scored checklist
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityReport {
    /// qr_<uuid>
    pub report_id: String,
    pub score: u32,
    pub total_deductions: u32,
    pub verdict: Verdict,
    /// Verdict the arithmetic alone would give
    pub score_verdict: Verdict,
    /// Justification when a security failure forced REJECT
    pub override_reason: Option<String>,
    pub checks: Vec<CheckResult>,
    pub generated_at: Timestamp,
}

impl QualityReport {
    pub fn failed(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks.iter().filter(|c| c.status == CheckStatus::Fail)
    }

    /// No failed check in `category`
    pub fn category_clean(&self, category: CheckCategory) -> bool {
        !self.failed().any(|c| c.category == category)
    }

    pub fn render_text(&self) -> String {
        let mut lines = vec![
            format!("Quality gate {}", self.report_id),
            format!("  score    {} / 100 (deductions {})", self.score, self.total_deductions),
            format!("  verdict  {}", self.verdict),
        ];
        if let Some(reason) = &self.override_reason {
            lines.push(format!(
                "  override score verdict {} replaced by REJECT: {reason}",
                self.score_verdict
            ));
        }
        lines.push(String::new());
        for check in &self.checks {
            lines.push(format!("  [{:>4}] {:<40} {}", check.status.to_string(), check.id, check.detail));
        }
        lines.join("\n")
    }
}

/// Applies deductions and maps the score to a verdict
#[derive(Debug, Clone, Default)]
pub struct QualityGateScorer {
    settings: QualitySettings,
}

impl QualityGateScorer {
    pub fn new(settings: &QualitySettings) -> Self {
        Self {
            settings: settings.clone(),
        }
    }

    pub fn score(&self, checks: Vec<CheckResult>) -> QualityReport {
        let total_deductions: u32 = checks
            .iter()
            .map(|c| c.deduction(&self.settings.deductions))
            .sum();
        let score = 100u32.saturating_sub(total_deductions);
        let score_verdict = Verdict::from_score(score);

        let forced = if self.settings.security_failure_forces_reject {
            checks
                .iter()
                .find(|c| c.category == CheckCategory::Security && c.status == CheckStatus::Fail)
                .and_then(|c| c.forces_reject.as_ref().map(|j| format!("{}: {j}", c.id)))
        } else {
            None
        };

        let verdict = if forced.is_some() {
            Verdict::Reject
        } else {
            score_verdict
        };

        if let Some(reason) = &forced {
            warn!(score, reason = %reason, "Security failure forced REJECT");
        } else {
            info!(score, verdict = %verdict, "Quality gate scored");
        }

        QualityReport {
            report_id: format!("qr_{}", uuid::Uuid::new_v4()),
            score,
            total_deductions,
            verdict,
            score_verdict,
            override_reason: forced,
            checks,
            generated_at: now(),
        }
    }
}

/// Checks derived from a contract report and the session's blast radius.
///
/// Callers append their own results (tests, docs, naming) before scoring.
pub fn session_checklist(contract: &ContractReport, blast_radius: &BlastRadiusSnapshot) -> Vec<CheckResult> {
    let mut checks = Vec::new();

    let of = |f: fn(&ContractError) -> bool| -> Vec<String> {
        contract
            .errors
            .iter()
            .filter(|e| f(e))
            .map(ToString::to_string)
            .collect()
    };
    let schema = of(|e| matches!(e, ContractError::Validation { .. }));
    let ceiling = of(|e| matches!(e, ContractError::ConfidenceCeilingExceeded { .. }));
    let consistency = of(|e| matches!(e, ContractError::ContractInconsistency { .. }));
    let evaluated = contract.contract.is_some() || !ceiling.is_empty() || !consistency.is_empty();

    checks.push(if schema.is_empty() {
        CheckResult::pass("contract.schema", CheckCategory::Contract, "all fields present and typed")
    } else {
        CheckResult::fail("contract.schema", CheckCategory::Contract, schema.join("; "))
    });

    for (id, errors) in [
        ("contract.confidence_ceiling", ceiling),
        ("contract.review_consistency", consistency),
    ] {
        checks.push(if !errors.is_empty() {
            CheckResult::fail(id, CheckCategory::Contract, errors.join("; "))
        } else if evaluated || schema.is_empty() {
            CheckResult::pass(id, CheckCategory::Contract, "ok")
        } else {
            CheckResult::not_applicable(id, CheckCategory::Contract, "contract invalid, not evaluated")
        });
    }

    checks.push(
        if blast_radius.level == BlastRadiusLevel::High && !blast_radius.confirmed {
            CheckResult::fail(
                "architecture.blast_radius_within_scope",
                CheckCategory::Architecture,
                format!(
                    "blast radius HIGH ({} files, critical: [{}]) was never confirmed",
                    blast_radius.files_touched,
                    blast_radius.critical_files.join(", ")
                ),
            )
        } else {
            CheckResult::pass(
                "architecture.blast_radius_within_scope",
                CheckCategory::Architecture,
                format!("{} ({} files)", blast_radius.level, blast_radius.files_touched),
            )
        },
    );

    checks.push(match &contract.contract {
        None => CheckResult::not_applicable(
            "architecture.impact_reviewed",
            CheckCategory::Architecture,
            "no valid contract",
        ),
        Some(c) if c.architectural_impact <= ArchitecturalImpact::Low => CheckResult::not_applicable(
            "architecture.impact_reviewed",
            CheckCategory::Architecture,
            format!("impact {}", c.architectural_impact.as_str()),
        ),
        Some(c) if c.requires_review => CheckResult::pass(
            "architecture.impact_reviewed",
            CheckCategory::Architecture,
            format!("impact {} flagged for review", c.architectural_impact.as_str()),
        ),
        Some(c) => CheckResult::fail(
            "architecture.impact_reviewed",
            CheckCategory::Architecture,
            format!("impact {} but requires_review is false", c.architectural_impact.as_str()),
        ),
    });

    checks
}
