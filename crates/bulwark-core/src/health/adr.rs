//! Decision record coverage
//!
//! Decisions come from `DECISIONS.md` (`## DEC-NNN -- title -- date`) and
//! from the "Decisions made" subsection of each `## Session N -- date` block
//! in `CHANGELOG.md`. A decision is covered when it names an ADR number, or
//! when it shares at least [`KEYWORD_MATCH_THRESHOLD`] significant keywords
//! with an ADR under `docs/adr/`.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::RepoSnapshot;

pub const ADR_DIR: &str = "docs/adr";
pub const DECISIONS_FILE: &str = "DECISIONS.md";
pub const CHANGELOG_FILE: &str = "CHANGELOG.md";

pub const KEYWORD_MATCH_THRESHOLD: usize = 2;
const MIN_KEYWORD_LENGTH: usize = 4;

const STOP_WORDS: &[&str] = &[
    "with", "this", "that", "from", "have", "will", "been", "were", "they", "also", "more", "some", "such", "when",
    "then", "than", "what", "which", "each", "into", "over", "used", "uses", "make", "made", "using", "because",
    "before", "after", "session", "agent", "code", "file", "files", "project", "team", "approach", "pattern",
    "option", "current", "change",
];

lazy_static! {
    static ref DEC_HEADING: Regex =
        Regex::new(r"(?m)^##\s+DEC-(\d+)\s+--\s+(.+?)\s+--\s+\d{4}-\d{2}-\d{2}").expect("static pattern");
    static ref SESSION_HEADING: Regex =
        Regex::new(r"(?m)^##\s+Session\s+(\d+)\s+[-\x{2013}\x{2014}]+\s+\d{4}-\d{2}-\d{2}").expect("static pattern");
    static ref DECISIONS_MADE: Regex = Regex::new(r"(?im)^###\s+Decisions\s+made\s*$").expect("static pattern");
    static ref DECISION_BULLET: Regex =
        Regex::new(r"(?m)^\s*[-*]\s*\*\*([^*]+)\*\*(?:\s*\([^)]*\))?:\s*(.{20,300})").expect("static pattern");
    static ref ADR_REFERENCE: Regex = Regex::new(r"(?i)\bADR[- ](\d+)\b").expect("static pattern");
    static ref ADR_NUMBER: Regex = Regex::new(r"(?i)^(?:ADR-)?(\d+)").expect("static pattern");
    static ref WORD: Regex = Regex::new(r"[a-zA-Z]+").expect("static pattern");
    static ref NON_WORD: Regex = Regex::new(r"\W+").expect("static pattern");
}

/// An architectural decision found in the change history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub source: String,
    pub identifier: String,
    pub title: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Adr {
    pub path: String,
    pub number: u32,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionCoverage {
    pub decision: Decision,
    /// Numbers of the ADRs that cover it
    pub covered_by: Vec<u32>,
}

impl DecisionCoverage {
    pub fn is_covered(&self) -> bool {
        !self.covered_by.is_empty()
    }
}

pub fn keywords(text: &str) -> BTreeSet<String> {
    WORD.find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .filter(|w| w.len() >= MIN_KEYWORD_LENGTH && !STOP_WORDS.contains(&w.as_str()))
        .collect()
}

fn referenced_adrs(text: &str) -> BTreeSet<u32> {
    ADR_REFERENCE
        .captures_iter(text)
        .filter_map(|c| c[1].parse().ok())
        .collect()
}

/// File-name slug for a new record
pub fn slug(title: &str) -> String {
    let slug = NON_WORD.replace_all(&title.to_lowercase(), "-").trim_matches('-').to_string();
    slug.chars().take(40).collect::<String>().trim_end_matches('-').to_string()
}

fn decisions_md(content: &str) -> Vec<Decision> {
    let headings: Vec<_> = DEC_HEADING.captures_iter(content).collect();
    headings
        .iter()
        .enumerate()
        .filter_map(|(i, caps)| {
            let whole = caps.get(0)?;
            let end = headings
                .get(i + 1)
                .and_then(|next| next.get(0))
                .map_or(content.len(), |m| m.start());
            let number: u32 = caps[1].parse().ok()?;
            Some(Decision {
                source: DECISIONS_FILE.to_string(),
                identifier: format!("DEC-{number:03}"),
                title: caps[2].trim().to_string(),
                body: content[whole.start()..end].to_string(),
            })
        })
        .collect()
}

/// Text of the "Decisions made" subsection, up to the next `###` heading
fn decisions_made(session: &str) -> Option<&str> {
    let heading = DECISIONS_MADE.find(session)?;
    let rest = &session[heading.end()..];
    let end = rest
        .match_indices('\n')
        .map(|(i, _)| i + 1)
        .find(|&i| rest[i..].starts_with("###"))
        .unwrap_or(rest.len());
    Some(&rest[..end])
}

fn changelog(content: &str) -> Vec<Decision> {
    let sessions: Vec<_> = SESSION_HEADING.captures_iter(content).collect();
    let mut decisions = Vec::new();
    for (i, caps) in sessions.iter().enumerate() {
        let (Some(whole), Ok(number)) = (caps.get(0), caps[1].parse::<u32>()) else {
            continue;
        };
        let end = sessions
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(content.len(), |m| m.start());
        let Some(section) = decisions_made(&content[whole.start()..end]) else {
            continue;
        };

        for bullet in DECISION_BULLET.captures_iter(section) {
            let (title, body) = (bullet[1].trim(), bullet[2].trim());
            // already points at its record
            if !referenced_adrs(&bullet[0]).is_empty() {
                continue;
            }
            decisions.push(Decision {
                source: CHANGELOG_FILE.to_string(),
                identifier: format!("Session {number:03}: {title}"),
                title: title.to_string(),
                body: body.to_string(),
            });
        }
    }
    decisions
}

/// Every decision recorded in the snapshot, DECISIONS.md first
pub fn decisions(snapshot: &RepoSnapshot) -> Vec<Decision> {
    let mut found = snapshot.get(DECISIONS_FILE).map(decisions_md).unwrap_or_default();
    found.extend(snapshot.get(CHANGELOG_FILE).map(changelog).unwrap_or_default());
    found
}

/// Numbered records under `docs/adr/`; the template (number 0) is skipped
pub fn adrs(snapshot: &RepoSnapshot) -> Vec<Adr> {
    snapshot
        .files_under(ADR_DIR)
        .filter(|(path, _)| path.ends_with(".md"))
        .filter_map(|(path, content)| {
            let name = path.rsplit('/').next()?;
            let number: u32 = ADR_NUMBER.captures(name)?[1].parse().ok()?;
            (number > 0 && !name.to_lowercase().contains("template")).then(|| Adr {
                path: path.to_string(),
                number,
                content: content.to_string(),
            })
        })
        .collect()
}

pub fn check_coverage(decisions: Vec<Decision>, adrs: &[Adr]) -> Vec<DecisionCoverage> {
    let adr_keywords: Vec<BTreeSet<String>> = adrs
        .iter()
        .map(|a| keywords(&format!("{} {}", a.path.replace(['-', '_'], " "), a.content)))
        .collect();

    decisions
        .into_iter()
        .map(|decision| {
            let words = keywords(&format!("{} {}", decision.title, decision.body));
            let named = referenced_adrs(&decision.body);
            let covered_by = adrs
                .iter()
                .zip(&adr_keywords)
                .filter(|(adr, kw)| {
                    named.contains(&adr.number) || words.intersection(kw).count() >= KEYWORD_MATCH_THRESHOLD
                })
                .map(|(adr, _)| adr.number)
                .collect();
            DecisionCoverage { decision, covered_by }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const DECISIONS: &str = "\
# Decisions

## DEC-1 -- Stripe for recurring billing -- 2026-03-02
Chose Stripe subscriptions over an in-house invoicing engine.

## DEC-2 -- Event sourcing for ledger -- 2026-03-09
Ledger rows are derived from an append-only journal. See ADR-0002.
";

    const CHANGELOG: &str = "\
# Changelog

## Session 4 -- 2026-03-12
### Done
- wired webhooks
### Decisions made
- **Retry queue**: Failed webhook deliveries go to a Postgres-backed retry queue
- **Tenant isolation** (ADR-0003): Row level security separates tenant data everywhere
### Next
- **Not a decision**: this bullet lives outside the decisions subsection
";

    fn snapshot() -> RepoSnapshot {
        RepoSnapshot::new()
            .with_file(DECISIONS_FILE, DECISIONS)
            .with_file(CHANGELOG_FILE, CHANGELOG)
            .with_file("docs/adr/0000-template.md", "# ADR template\nstripe billing recurring")
            .with_file(
                "docs/adr/0001-stripe-billing.md",
                "# Use Stripe\nRecurring billing runs on Stripe subscriptions.",
            )
            .with_file("docs/adr/0002-ledger.md", "# Ledger storage")
    }

    #[test]
    fn test_decisions_from_both_sources() {
        let found = decisions(&snapshot());
        let ids: Vec<&str> = found.iter().map(|d| d.identifier.as_str()).collect();
        assert_eq!(ids, ["DEC-001", "DEC-002", "Session 004: Retry queue"]);
        assert_eq!(found[0].title, "Stripe for recurring billing");
    }

    #[test]
    fn test_template_is_not_a_record() {
        let numbers: Vec<u32> = adrs(&snapshot()).iter().map(|a| a.number).collect();
        assert_eq!(numbers, [1, 2]);
    }

    #[test]
    fn test_coverage_by_keywords_and_reference() {
        let snapshot = snapshot();
        let coverage = check_coverage(decisions(&snapshot), &adrs(&snapshot));

        // stripe + billing + recurring + subscriptions
        assert_eq!(coverage[0].covered_by, [1]);
        // named explicitly, one shared keyword
        assert_eq!(coverage[1].covered_by, [2]);
        assert!(!coverage[2].is_covered());
    }

    #[test]
    fn test_keywords_drop_short_and_stop_words() {
        let words = keywords("Use the Session pattern with Postgres for RETRY");
        assert_eq!(words.into_iter().collect::<Vec<_>>(), ["postgres", "retry"]);
    }

    #[test]
    fn test_slug() {
        assert_eq!(slug("Retry queue (v2)!"), "retry-queue-v2");
        assert!(slug(&"long title ".repeat(10)).len() <= 40);
    }
}
