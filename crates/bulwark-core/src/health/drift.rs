//! Constitution drift against a template
//!
//! Sections are the markdown headings of levels 1 to 3, normalized to
//! lowercase snake case. A section drifts when its body length relative to
//! the template falls outside `1 ± threshold`.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

lazy_static! {
    static ref HEADING: Regex = Regex::new(r"^#{1,3}\s+(.+)$").expect("static pattern");
    static ref SEPARATORS: Regex = Regex::new(r"[\s\-]+").expect("static pattern");
}

pub const DEFAULT_DRIFT_THRESHOLD: f64 = 0.5;

/// Sections a constitution must carry
pub const REQUIRED_SECTIONS: [&str; 6] = [
    "project_context",
    "conventions",
    "session_protocol",
    "mandatory_session_protocol",
    "security_protocol",
    "quality_standards",
];

/// Names that satisfy each other
pub const ALIAS_GROUPS: [&[&str]; 1] = [&["mandatory_session_protocol", "session_protocol"]];

pub fn normalize_section_name(name: &str) -> String {
    SEPARATORS
        .replace_all(&name.trim().to_lowercase(), "_")
        .into_owned()
}

/// Section name to trimmed body. A repeated heading keeps its last body.
pub fn extract_sections(content: &str) -> BTreeMap<String, String> {
    let mut sections = BTreeMap::new();
    let mut current: Option<(String, Vec<&str>)> = None;

    for line in content.lines() {
        if let Some(caps) = HEADING.captures(line) {
            if let Some((name, body)) = current.take() {
                sections.insert(name, body.join("\n").trim().to_string());
            }
            current = Some((normalize_section_name(&caps[1]), Vec::new()));
        } else if let Some((_, body)) = current.as_mut() {
            body.push(line);
        }
    }
    if let Some((name, body)) = current {
        sections.insert(name, body.join("\n").trim().to_string());
    }
    sections
}

/// Found names expanded with every alias of a found name
pub fn resolve_aliases<'a>(found: impl IntoIterator<Item = &'a str>) -> BTreeSet<String> {
    let mut resolved: BTreeSet<String> = found.into_iter().map(str::to_string).collect();
    for group in ALIAS_GROUPS {
        if group.iter().any(|n| resolved.contains(*n)) {
            resolved.extend(group.iter().map(|n| n.to_string()));
        }
    }
    resolved
}

/// Required names missing from `sections`, alias groups reported once as
/// `a or b`
pub fn missing_sections(sections: &BTreeMap<String, String>, required: &[&str]) -> Vec<String> {
    let resolved = resolve_aliases(sections.keys().map(String::as_str));
    let mut missing = Vec::new();
    let mut groups_reported = BTreeSet::new();

    for name in required {
        let normalized = normalize_section_name(name);
        if resolved.contains(&normalized) {
            continue;
        }
        match ALIAS_GROUPS.iter().position(|g| g.contains(&normalized.as_str())) {
            Some(i) => {
                if groups_reported.insert(i) {
                    let mut names: Vec<&str> = ALIAS_GROUPS[i].to_vec();
                    names.sort_unstable();
                    missing.push(names.join(" or "));
                }
            }
            None => missing.push(name.to_string()),
        }
    }
    missing
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriftDirection {
    Shorter,
    Longer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftedSection {
    pub section: String,
    pub template_length: usize,
    pub target_length: usize,
    /// target / template, rounded to two decimals
    pub ratio: f64,
    pub direction: DriftDirection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    pub threshold: f64,
    pub aligned: bool,
    pub missing_sections: Vec<String>,
    pub drift_sections: Vec<DriftedSection>,
    pub template_section_count: usize,
    pub target_section_count: usize,
    pub recommendations: Vec<String>,
}

impl DriftReport {
    pub fn render_text(&self) -> String {
        let mut lines = vec![
            format!(
                "Drift check (threshold {:.2}): {}",
                self.threshold,
                if self.aligned { "ALIGNED" } else { "DRIFTED" }
            ),
            format!(
                "  sections: template {}, target {}",
                self.template_section_count, self.target_section_count
            ),
        ];
        for m in &self.missing_sections {
            lines.push(format!("  missing  {m}"));
        }
        for d in &self.drift_sections {
            lines.push(format!(
                "  drifted  {} ({} vs {} chars, ratio {:.2})",
                d.section, d.target_length, d.template_length, d.ratio
            ));
        }
        lines.push(String::new());
        lines.push("Recommendations:".to_string());
        for r in &self.recommendations {
            lines.push(format!("  - {r}"));
        }
        lines.join("\n")
    }
}

pub fn calculate_drift(
    template: &BTreeMap<String, String>,
    target: &BTreeMap<String, String>,
    threshold: f64,
) -> Vec<DriftedSection> {
    let mut drifted = Vec::new();
    for (name, template_body) in template {
        let Some(target_body) = target.get(name) else {
            continue;
        };
        let template_length = template_body.chars().count();
        if template_length == 0 {
            continue;
        }
        let target_length = target_body.chars().count();
        let ratio = target_length as f64 / template_length as f64;

        if ratio < 1.0 - threshold || ratio > 1.0 + threshold {
            drifted.push(DriftedSection {
                section: name.clone(),
                template_length,
                target_length,
                ratio: (ratio * 100.0).round() / 100.0,
                direction: if ratio < 1.0 {
                    DriftDirection::Shorter
                } else {
                    DriftDirection::Longer
                },
            });
        }
    }
    drifted
}

fn recommendations(missing: &[String], drifted: &[DriftedSection]) -> Vec<String> {
    let mut out = Vec::new();
    if !missing.is_empty() {
        out.push(format!(
            "Add {} missing required section(s): {}. Copy the structure from the governance template.",
            missing.len(),
            missing.join(", ")
        ));
    }
    for d in drifted {
        let percent = (d.ratio * 100.0).round();
        out.push(match d.direction {
            DriftDirection::Shorter => format!(
                "Section '{}' is {percent}% of template length. Check whether content was removed or over-simplified.",
                d.section
            ),
            DriftDirection::Longer => format!(
                "Section '{}' is {percent}% of template length. Verify the added content follows governance standards.",
                d.section
            ),
        });
    }
    if out.is_empty() {
        out.push("No drift detected. The constitution matches the governance template.".to_string());
    }
    out
}

/// Compares a target constitution against the template
pub fn detect_drift(template: &str, target: &str, threshold: f64) -> DriftReport {
    let template_sections = extract_sections(template);
    let target_sections = extract_sections(target);

    let missing = missing_sections(&target_sections, &REQUIRED_SECTIONS);
    let drifted = calculate_drift(&template_sections, &target_sections, threshold);

    DriftReport {
        threshold,
        aligned: missing.is_empty() && drifted.is_empty(),
        recommendations: recommendations(&missing, &drifted),
        missing_sections: missing,
        drift_sections: drifted,
        template_section_count: template_sections.len(),
        target_section_count: target_sections.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE: &str = "\
# Constitution
## Project Context
Describe the project in a few sentences here.
## Conventions
Use snake_case everywhere.
## Session Protocol
Read MEMORY.md first.
## Security Protocol
Never commit secrets.
## Quality Standards
Tests for every change.
";

    #[test]
    fn test_extract_sections_normalizes() {
        let sections = extract_sections("intro\n## Project Context\nbody\n\n### Mandatory-Session  Protocol\nx\n");
        assert_eq!(sections.get("project_context").map(String::as_str), Some("body"));
        assert!(sections.contains_key("mandatory_session_protocol"));
        assert_eq!(sections.len(), 2);
    }

    #[test]
    fn test_aligned_copy() {
        let report = detect_drift(TEMPLATE, TEMPLATE, DEFAULT_DRIFT_THRESHOLD);
        assert!(report.aligned);
        assert!(report.missing_sections.is_empty());
        assert_eq!(report.recommendations.len(), 1);
    }

    #[test]
    fn test_alias_satisfies_requirement() {
        let target = TEMPLATE.replace("## Session Protocol", "## Mandatory Session Protocol");
        let report = detect_drift(TEMPLATE, &target, DEFAULT_DRIFT_THRESHOLD);
        assert!(report.missing_sections.is_empty());
    }

    #[test]
    fn test_missing_alias_group_reported_once() {
        let target = "## Project Context\nx\n## Conventions\ny\n## Security Protocol\nz\n## Quality Standards\nq\n";
        let report = detect_drift(TEMPLATE, target, DEFAULT_DRIFT_THRESHOLD);
        assert_eq!(
            report.missing_sections,
            vec!["mandatory_session_protocol or session_protocol".to_string()]
        );
        assert!(!report.aligned);
    }

    #[test]
    fn test_shrunken_section_drifts() {
        let target = TEMPLATE.replace("Describe the project in a few sentences here.", "TBD");
        let report = detect_drift(TEMPLATE, &target, DEFAULT_DRIFT_THRESHOLD);
        assert_eq!(report.drift_sections.len(), 1);
        let d = &report.drift_sections[0];
        assert_eq!(d.section, "project_context");
        assert_eq!(d.direction, DriftDirection::Shorter);
        assert!(report.recommendations[0].contains("project_context"));
    }
}
