//! Blast radius tracking
//!
//! Consumes file changes incrementally and classifies the scope of a session:
//!
//! - LOW: at most `low_max_files` files and no critical file
//! - MEDIUM: at most `medium_max_files` files
//! - HIGH: more files than that, any critical file, a forbidden tag
//!   combination, or more new files than `max_new_files`
//!
//! Crossing into HIGH raises a scope alert. The alert is soft: it blocks
//! further file changes until confirmed but never halts the session. Hard
//! ceilings are enforced by the kill switch, not here.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{info, warn};

use crate::config::{compile_pattern, compile_patterns, BlastRadiusSettings};
use crate::error::Result;
use crate::events::FileChange;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BlastRadiusLevel {
    Low,
    Medium,
    High,
}

impl fmt::Display for BlastRadiusLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BlastRadiusLevel::Low => "LOW",
            BlastRadiusLevel::Medium => "MEDIUM",
            BlastRadiusLevel::High => "HIGH",
        };
        f.write_str(name)
    }
}

/// Per-file running totals
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStats {
    pub lines: u32,
    pub critical: bool,
    pub created: bool,
}

/// Derived view of the session's scope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlastRadiusSnapshot {
    pub level: BlastRadiusLevel,
    pub files_touched: usize,
    pub new_files: usize,
    pub max_lines_in_file: u32,
    pub max_lines_path: Option<String>,
    pub critical_files: Vec<String>,
    pub forbidden_combinations: Vec<(String, String)>,
    /// HIGH was confirmed by a human
    pub confirmed: bool,
}

/// What a single file change did to the classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub previous: BlastRadiusLevel,
    pub current: BlastRadiusLevel,
    /// Set when this change crossed into HIGH
    pub scope_alert: Option<String>,
    /// The change touched a critical file
    pub critical: bool,
}

#[derive(Debug, Clone)]
pub struct BlastRadiusTracker {
    settings: BlastRadiusSettings,
    critical_patterns: Vec<Regex>,
    tag_patterns: Vec<(String, Regex)>,
    files: BTreeMap<String, FileStats>,
    tags_seen: BTreeMap<String, BTreeSet<String>>,
    level: BlastRadiusLevel,
    awaiting_confirmation: bool,
    confirmed: bool,
}

impl BlastRadiusTracker {
    pub fn new(settings: &BlastRadiusSettings) -> Result<Self> {
        let critical_patterns = compile_patterns("blast_radius.critical_paths", &settings.critical_paths)?;
        let tag_patterns = settings
            .path_tags
            .iter()
            .map(|t| Ok((t.tag.clone(), compile_pattern("blast_radius.path_tags", &t.pattern)?)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            settings: settings.clone(),
            critical_patterns,
            tag_patterns,
            files: BTreeMap::new(),
            tags_seen: BTreeMap::new(),
            level: BlastRadiusLevel::Low,
            awaiting_confirmation: false,
            confirmed: false,
        })
    }

    /// Configured critical path, regardless of what the producer flagged
    pub fn is_critical_path(&self, path: &str) -> bool {
        self.critical_patterns.iter().any(|p| p.is_match(path))
    }

    /// A HIGH crossing is waiting for confirmation
    pub fn awaiting_confirmation(&self) -> bool {
        self.awaiting_confirmation
    }

    pub fn confirm(&mut self) {
        if self.awaiting_confirmation {
            info!(level = %self.level, "Scope alert confirmed");
        }
        self.awaiting_confirmation = false;
        self.confirmed = true;
    }

    pub fn level(&self) -> BlastRadiusLevel {
        self.level
    }

    pub fn file(&self, path: &str) -> Option<&FileStats> {
        self.files.get(path)
    }

    pub fn observe(&mut self, change: &FileChange) -> Observation {
        let critical = change.is_critical || self.is_critical_path(&change.path);
        let stats = self.files.entry(change.path.clone()).or_default();
        stats.lines = stats.lines.saturating_add(change.lines_touched());
        stats.critical |= critical;
        stats.created |= change.created;

        for (tag, pattern) in &self.tag_patterns {
            if pattern.is_match(&change.path) {
                self.tags_seen
                    .entry(tag.clone())
                    .or_default()
                    .insert(change.path.clone());
            }
        }

        let previous = self.level;
        let current = self.classify();
        self.level = current;

        let scope_alert = if current == BlastRadiusLevel::High && previous != BlastRadiusLevel::High {
            let reason = self.high_reason();
            warn!(path = %change.path, reason = %reason, "Scope alert: blast radius crossed into HIGH");
            self.awaiting_confirmation = true;
            Some(reason)
        } else {
            None
        };

        Observation {
            previous,
            current,
            scope_alert,
            critical,
        }
    }

    fn new_files(&self) -> usize {
        self.files.values().filter(|s| s.created).count()
    }

    fn forbidden_combinations(&self) -> Vec<(String, String)> {
        self.settings
            .forbidden_combinations
            .iter()
            .filter(|c| self.tags_seen.contains_key(&c.first) && self.tags_seen.contains_key(&c.second))
            .map(|c| (c.first.clone(), c.second.clone()))
            .collect()
    }

    fn critical_files(&self) -> Vec<String> {
        self.files
            .iter()
            .filter(|(_, s)| s.critical)
            .map(|(p, _)| p.clone())
            .collect()
    }

    fn classify(&self) -> BlastRadiusLevel {
        let files = self.files.len();
        if files > self.settings.medium_max_files
            || self.files.values().any(|s| s.critical)
            || self.new_files() > self.settings.max_new_files
            || !self.forbidden_combinations().is_empty()
        {
            BlastRadiusLevel::High
        } else if files > self.settings.low_max_files {
            BlastRadiusLevel::Medium
        } else {
            BlastRadiusLevel::Low
        }
    }

    fn high_reason(&self) -> String {
        let files = self.files.len();
        if files > self.settings.medium_max_files {
            return format!(
                "{files} files touched exceeds the MEDIUM band limit of {}",
                self.settings.medium_max_files
            );
        }
        let critical = self.critical_files();
        if !critical.is_empty() {
            return format!("critical file touched: {}", critical.join(", "));
        }
        let new_files = self.new_files();
        if new_files > self.settings.max_new_files {
            return format!(
                "{new_files} new files exceeds the limit of {}",
                self.settings.max_new_files
            );
        }
        self.forbidden_combinations()
            .first()
            .map(|(a, b)| format!("forbidden combination: {a} and {b} changed in one session"))
            .unwrap_or_else(|| "scope classified HIGH".to_string())
    }

    pub fn snapshot(&self) -> BlastRadiusSnapshot {
        let max = self.files.iter().max_by_key(|(_, s)| s.lines);
        BlastRadiusSnapshot {
            level: self.level,
            files_touched: self.files.len(),
            new_files: self.new_files(),
            max_lines_in_file: max.map_or(0, |(_, s)| s.lines),
            max_lines_path: max.map(|(p, _)| p.clone()),
            critical_files: self.critical_files(),
            forbidden_combinations: self.forbidden_combinations(),
            confirmed: self.confirmed,
        }
    }
}
