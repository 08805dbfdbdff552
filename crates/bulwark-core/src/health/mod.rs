//! Repository governance health
//!
//! Scores a [`RepoSnapshot`] across eight independent dimensions. Each
//! dimension is Complete, Degraded or Critical depending on the worst item
//! it reports. Scoring is a pure function of the snapshot and the review
//! date, so two runs over the same snapshot agree exactly.
//!
//! Deductions: 20 per Critical dimension and 8 per Degraded dimension. The
//! first item at the dimension's own severity is covered by that deduction;
//! every further Critical item costs 5 and every further Warning item 2.

pub mod adr;
pub mod drift;
pub mod snapshot;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

use crate::break_glass::BreakGlassRegistry;
use crate::config::HealthSettings;
use crate::quality::scanner::{scan_content, Severity};

pub use adr::{check_coverage, DecisionCoverage};
pub use drift::{detect_drift, DriftReport};
pub use snapshot::RepoSnapshot;

pub const CONSTITUTION_FILE: &str = "CLAUDE.md";
pub const BREAK_GLASS_FILE: &str = ".governance/break_glass.json";

/// Sections the constitution must carry for the health check
pub const CONSTITUTION_SECTIONS: [&str; 5] = [
    "project_context",
    "conventions",
    "mandatory_session_protocol",
    "security_protocol",
    "mandatory_task_reporting",
];

const MATURITY_LEVELS: [(u32, u8, &str); 6] = [
    (95, 5, "Self-optimizing"),
    (80, 4, "Measured"),
    (60, 3, "Enforced"),
    (40, 2, "Structured"),
    (20, 1, "Foundation"),
    (0, 0, "Ad-hoc"),
];

pub fn maturity_level(score: u32) -> (u8, &'static str) {
    MATURITY_LEVELS
        .iter()
        .find(|(floor, _, _)| score >= *floor)
        .map(|(_, level, label)| (*level, *label))
        .unwrap_or((0, "Ad-hoc"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Constitution,
    Planning,
    ChangeHistory,
    Memory,
    DecisionRecords,
    Automation,
    AgentDefinitions,
    SecurityHygiene,
}

impl Dimension {
    pub const ALL: [Dimension; 8] = [
        Dimension::Constitution,
        Dimension::Planning,
        Dimension::ChangeHistory,
        Dimension::Memory,
        Dimension::DecisionRecords,
        Dimension::Automation,
        Dimension::AgentDefinitions,
        Dimension::SecurityHygiene,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Dimension::Constitution => "constitution",
            Dimension::Planning => "planning",
            Dimension::ChangeHistory => "change_history",
            Dimension::Memory => "memory",
            Dimension::DecisionRecords => "decision_records",
            Dimension::Automation => "automation",
            Dimension::AgentDefinitions => "agent_definitions",
            Dimension::SecurityHygiene => "security_hygiene",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered most severe first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemSeverity {
    Critical,
    Warning,
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DimensionStatus {
    Complete,
    Degraded,
    Critical,
}

impl fmt::Display for DimensionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DimensionStatus::Complete => "COMPLETE",
            DimensionStatus::Degraded => "DEGRADED",
            DimensionStatus::Critical => "CRITICAL",
        };
        f.write_str(name)
    }
}

/// A problem together with the concrete change that fixes it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthItem {
    pub dimension: Dimension,
    pub severity: ItemSeverity,
    pub problem: String,
    pub fix: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionReport {
    pub dimension: Dimension,
    pub status: DimensionStatus,
    pub items: Vec<HealthItem>,
}

impl DimensionReport {
    pub fn new(dimension: Dimension, items: Vec<HealthItem>) -> Self {
        let status = if items.iter().any(|i| i.severity == ItemSeverity::Critical) {
            DimensionStatus::Critical
        } else if items.iter().any(|i| i.severity == ItemSeverity::Warning) {
            DimensionStatus::Degraded
        } else {
            DimensionStatus::Complete
        };
        Self {
            dimension,
            status,
            items,
        }
    }

    fn count(&self, severity: ItemSeverity) -> u32 {
        self.items.iter().filter(|i| i.severity == severity).count() as u32
    }

    /// Points this dimension costs
    pub fn deduction(&self) -> u32 {
        let critical = self.count(ItemSeverity::Critical);
        let warnings = self.count(ItemSeverity::Warning);
        match self.status {
            DimensionStatus::Critical => 20 + 5 * critical.saturating_sub(1) + 2 * warnings,
            DimensionStatus::Degraded => 8 + 2 * warnings.saturating_sub(1),
            DimensionStatus::Complete => 0,
        }
    }
}

/// 100 minus every dimension's deduction, floored at 0
pub fn score_dimensions(dimensions: &[DimensionReport]) -> u32 {
    let total: u32 = dimensions.iter().map(DimensionReport::deduction).sum();
    100u32.saturating_sub(total)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub score: u32,
    pub maturity_level: u8,
    pub maturity_label: String,
    pub dimensions: Vec<DimensionReport>,
    /// Every item, Critical first, then Warning, then Info
    pub remediation: Vec<HealthItem>,
}

impl HealthReport {
    pub fn from_dimensions(dimensions: Vec<DimensionReport>) -> Self {
        let score = score_dimensions(&dimensions);
        let (level, label) = maturity_level(score);
        let mut remediation: Vec<HealthItem> = dimensions.iter().flat_map(|d| d.items.iter().cloned()).collect();
        remediation.sort_by_key(|i| i.severity);

        Self {
            score,
            maturity_level: level,
            maturity_label: label.to_string(),
            dimensions,
            remediation,
        }
    }

    pub fn status(&self, dimension: Dimension) -> Option<DimensionStatus> {
        self.dimensions
            .iter()
            .find(|d| d.dimension == dimension)
            .map(|d| d.status)
    }

    pub fn render_text(&self) -> String {
        let mut lines = vec![
            format!(
                "Governance health: {} / 100, level {} ({})",
                self.score, self.maturity_level, self.maturity_label
            ),
            String::new(),
        ];
        for d in &self.dimensions {
            lines.push(format!("  {:<18} {:<9} -{}", d.dimension.as_str(), d.status.to_string(), d.deduction()));
        }
        if !self.remediation.is_empty() {
            lines.push(String::new());
            lines.push("Remediation:".to_string());
            for item in &self.remediation {
                let tag = match item.severity {
                    ItemSeverity::Critical => "CRITICAL",
                    ItemSeverity::Warning => "WARNING",
                    ItemSeverity::Info => "INFO",
                };
                lines.push(format!("  [{tag}] {}: {}", item.dimension, item.problem));
                lines.push(format!("      fix: {}", item.fix));
            }
        }
        lines.join("\n")
    }
}

fn item(dimension: Dimension, severity: ItemSeverity, problem: impl Into<String>, fix: impl Into<String>) -> HealthItem {
    HealthItem {
        dimension,
        severity,
        problem: problem.into(),
        fix: fix.into(),
    }
}

/// Eight-dimension scorer
#[derive(Debug, Clone, Default)]
pub struct HealthScorer {
    settings: HealthSettings,
    template: Option<String>,
}

impl HealthScorer {
    pub fn new(settings: &HealthSettings) -> Self {
        Self {
            settings: settings.clone(),
            template: None,
        }
    }

    /// Compare the constitution against `template` as part of scoring
    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    pub fn score(&self, snapshot: &RepoSnapshot, today: NaiveDate) -> HealthReport {
        let dimensions = vec![
            DimensionReport::new(Dimension::Constitution, self.constitution(snapshot)),
            DimensionReport::new(Dimension::Planning, planning(snapshot)),
            DimensionReport::new(Dimension::ChangeHistory, self.change_history(snapshot)),
            DimensionReport::new(Dimension::Memory, memory(snapshot)),
            DimensionReport::new(Dimension::DecisionRecords, decision_records(snapshot)),
            DimensionReport::new(Dimension::Automation, automation(snapshot)),
            DimensionReport::new(Dimension::AgentDefinitions, agent_definitions(snapshot)),
            DimensionReport::new(Dimension::SecurityHygiene, security_hygiene(snapshot, today)),
        ];
        let report = HealthReport::from_dimensions(dimensions);
        info!(
            score = report.score,
            level = report.maturity_level,
            remediation = report.remediation.len(),
            "Health scored"
        );
        report
    }

    fn constitution(&self, snapshot: &RepoSnapshot) -> Vec<HealthItem> {
        let d = Dimension::Constitution;
        let Some(content) = snapshot.get(CONSTITUTION_FILE) else {
            return vec![item(
                d,
                ItemSeverity::Critical,
                "CLAUDE.md is missing",
                format!(
                    "Create CLAUDE.md at the repository root with the sections: {}",
                    CONSTITUTION_SECTIONS.join(", ")
                ),
            )];
        };

        let sections = drift::extract_sections(content);
        let mut items: Vec<HealthItem> = drift::missing_sections(&sections, &CONSTITUTION_SECTIONS)
            .into_iter()
            .map(|name| {
                item(
                    d,
                    ItemSeverity::Warning,
                    format!("CLAUDE.md has no {name} section"),
                    format!("Add a '## {name}' heading to CLAUDE.md and fill it in"),
                )
            })
            .collect();

        if let Some(template) = &self.template {
            let template_sections = drift::extract_sections(template);
            for s in drift::calculate_drift(&template_sections, &sections, self.settings.drift_threshold) {
                items.push(item(
                    d,
                    ItemSeverity::Warning,
                    format!(
                        "section {} drifted from the template ({} vs {} chars)",
                        s.section, s.target_length, s.template_length
                    ),
                    format!("Re-align the '{}' section of CLAUDE.md with the governance template", s.section),
                ));
            }
        }
        items
    }

    fn change_history(&self, snapshot: &RepoSnapshot) -> Vec<HealthItem> {
        let d = Dimension::ChangeHistory;
        let Some(content) = snapshot.get("CHANGELOG.md") else {
            return vec![item(
                d,
                ItemSeverity::Critical,
                "CHANGELOG.md is missing",
                "Create CHANGELOG.md and add a '## [version] - date' entry for each release",
            )];
        };
        let entries = content
            .lines()
            .filter(|l| {
                let hashes = l.chars().take_while(|c| *c == '#').count();
                (2..=3).contains(&hashes) && l[hashes..].starts_with(char::is_whitespace) && !l[hashes..].trim().is_empty()
            })
            .count();
        if entries < self.settings.min_changelog_entries {
            vec![item(
                d,
                ItemSeverity::Warning,
                format!(
                    "CHANGELOG.md has {entries} entries, fewer than {}",
                    self.settings.min_changelog_entries
                ),
                "Record each merged change under a '## ' or '### ' heading in CHANGELOG.md",
            )]
        } else {
            Vec::new()
        }
    }
}

fn planning(snapshot: &RepoSnapshot) -> Vec<HealthItem> {
    let d = Dimension::Planning;
    let mut items = Vec::new();
    if !snapshot.contains("PROJECT_PLAN.md") {
        items.push(item(
            d,
            ItemSeverity::Warning,
            "PROJECT_PLAN.md is missing",
            "Create PROJECT_PLAN.md listing current goals, milestones and owners",
        ));
    }
    if !snapshot.contains("ARCHITECTURE.md") {
        items.push(item(
            d,
            ItemSeverity::Warning,
            "ARCHITECTURE.md is missing",
            "Create ARCHITECTURE.md describing components and their boundaries",
        ));
    }
    items
}

fn memory(snapshot: &RepoSnapshot) -> Vec<HealthItem> {
    if snapshot.contains("MEMORY.md") {
        return Vec::new();
    }
    vec![item(
        Dimension::Memory,
        ItemSeverity::Warning,
        "MEMORY.md is missing",
        "Create MEMORY.md and record decisions and open threads at the end of each session",
    )]
}

fn decision_records(snapshot: &RepoSnapshot) -> Vec<HealthItem> {
    let d = Dimension::DecisionRecords;
    let mut items = Vec::new();
    if !snapshot.has_files_under(adr::ADR_DIR) {
        items.push(item(
            d,
            ItemSeverity::Warning,
            "docs/adr/ has no decision records",
            "Add docs/adr/0001-record-architecture-decisions.md using the ADR template",
        ));
    }

    let records = adr::adrs(snapshot);
    for uncovered in adr::check_coverage(adr::decisions(snapshot), &records)
        .into_iter()
        .filter(|c| !c.is_covered())
    {
        let decision = uncovered.decision;
        items.push(item(
            d,
            ItemSeverity::Warning,
            format!("{} decision {} has no ADR", decision.source, decision.identifier),
            format!(
                "Create docs/adr/NNNN-{}.md recording '{}', or cite an existing ADR number in the entry",
                adr::slug(&decision.title),
                decision.title
            ),
        ));
    }
    items
}

fn automation(snapshot: &RepoSnapshot) -> Vec<HealthItem> {
    let d = Dimension::Automation;
    let mut items = Vec::new();
    if !snapshot.contains(".pre-commit-config.yaml") {
        items.push(item(
            d,
            ItemSeverity::Warning,
            ".pre-commit-config.yaml is missing",
            "Add .pre-commit-config.yaml with secret scanning and formatting hooks",
        ));
    }

    let workflows: Vec<(&str, &str)> = snapshot.files_under(".github/workflows").collect();
    if workflows.is_empty() {
        items.push(item(
            d,
            ItemSeverity::Critical,
            "no CI workflow under .github/workflows/",
            "Add .github/workflows/governance.yml running contract validation on every pull request",
        ));
    } else if !workflows.iter().any(|(_, c)| {
        let lower = c.to_lowercase();
        lower.contains("anthropic") || lower.contains("claude")
    }) {
        items.push(item(
            d,
            ItemSeverity::Warning,
            "no AI review workflow",
            "Add a workflow step that runs the AI review on pull requests",
        ));
    }
    items
}

fn agent_definitions(snapshot: &RepoSnapshot) -> Vec<HealthItem> {
    let d = Dimension::AgentDefinitions;
    let mut items = Vec::new();
    if !snapshot.has_files_under(".claude/agents") && !snapshot.has_files_under("agents") {
        items.push(item(
            d,
            ItemSeverity::Warning,
            "no agent definitions",
            "Add at least one agent definition under .claude/agents/",
        ));
    }
    if !snapshot.has_files_under(".claude/commands") && !snapshot.has_files_under("commands") {
        items.push(item(
            d,
            ItemSeverity::Warning,
            "no command definitions",
            "Add at least one command definition under .claude/commands/",
        ));
    }
    items
}

fn is_governance_file(path: &str) -> bool {
    path == CONSTITUTION_FILE
        || path.starts_with(".governance/")
        || path.starts_with(".claude/")
        || (!path.contains('/') && path.ends_with(".md"))
}

fn security_hygiene(snapshot: &RepoSnapshot, today: NaiveDate) -> Vec<HealthItem> {
    let d = Dimension::SecurityHygiene;
    let mut items = Vec::new();

    let ignores_env = snapshot.get(".gitignore").is_some_and(|c| {
        c.lines()
            .map(str::trim)
            .any(|l| matches!(l, ".env" | ".env*" | ".env/" | ".env.*"))
    });
    if !ignores_env {
        items.push(item(
            d,
            ItemSeverity::Critical,
            ".gitignore does not exclude .env",
            "Add a '.env' line to .gitignore",
        ));
    }

    if let Some(content) = snapshot.get(BREAK_GLASS_FILE) {
        match BreakGlassRegistry::from_json_str(content) {
            Err(e) => items.push(item(
                d,
                ItemSeverity::Critical,
                format!("{BREAK_GLASS_FILE} is unreadable: {e}"),
                format!("Fix the JSON in {BREAK_GLASS_FILE} so every override stays auditable"),
            )),
            Ok(registry) => {
                for record in registry.overdue_reviews(today) {
                    items.push(item(
                        d,
                        ItemSeverity::Critical,
                        format!(
                            "break-glass {} ({}) missed its review date {}",
                            record.id, record.rule_overridden, record.review_date
                        ),
                        format!("Hold the review for {} and record its resolution", record.id),
                    ));
                }
                for record in registry.records().iter().filter(|r| !r.reviewed && !r.is_review_overdue(today)) {
                    items.push(item(
                        d,
                        ItemSeverity::Info,
                        format!("break-glass {} awaits review by {}", record.id, record.review_date),
                        format!("Review {} before {}", record.id, record.review_date),
                    ));
                }
            }
        }
    }

    for (path, content) in snapshot.files().filter(|(p, _)| is_governance_file(p)) {
        for finding in scan_content(content).into_iter().filter(|f| f.severity == Severity::Critical) {
            items.push(item(
                d,
                ItemSeverity::Critical,
                format!("{} in {path} line {}", finding.description, finding.line),
                format!("Remove the value from {path}, rotate it and load it from the environment"),
            ));
        }
    }
    items
}
