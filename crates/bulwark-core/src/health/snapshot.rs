//! Read-only repository snapshot
//!
//! Paths are relative to the repository root and always use `/`. Iteration
//! order is sorted, so anything computed from a snapshot is deterministic.

use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{GovernanceError, Result};
use crate::kill_switch::{FreshnessOracle, RepoIndex};

const SKIPPED_DIRS: [&str; 3] = [".git", "target", "node_modules"];

lazy_static! {
    static ref SYMBOL_DEF: Regex = Regex::new(
        r"\b(?:fn|struct|enum|trait|mod|type|const|static|def|class|interface|func)\s+([A-Za-z_][A-Za-z0-9_]*)"
    )
    .expect("static pattern");
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoSnapshot {
    files: BTreeMap<String, String>,
}

impl RepoSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.files.insert(path.into(), content.into());
        self
    }

    /// Walks `root`, skipping VCS and build directories. Files that are not
    /// UTF-8 are recorded with empty content.
    pub fn load(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(GovernanceError::Validation(format!(
                "repository root {} is not a directory",
                root.display()
            )));
        }

        let mut files = BTreeMap::new();
        for entry in WalkDir::new(root).into_iter().filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            e.depth() == 0 || !SKIPPED_DIRS.contains(&&*name)
        }) {
            let entry = entry.map_err(std::io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(root)
                .map_err(|e| GovernanceError::Validation(e.to_string()))?;
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let content = std::fs::read_to_string(entry.path()).unwrap_or_default();
            files.insert(key, content);
        }

        debug!(root = %root.display(), files = files.len(), "Repository snapshot loaded");
        Ok(Self { files })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(String::as_str)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    pub fn files(&self) -> impl Iterator<Item = (&str, &str)> {
        self.files.iter().map(|(p, c)| (p.as_str(), c.as_str()))
    }

    /// Files anywhere below `dir`
    pub fn files_under<'a>(&'a self, dir: &str) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        self.files
            .iter()
            .filter(move |(p, _)| p.starts_with(&prefix))
            .map(|(p, c)| (p.as_str(), c.as_str()))
    }

    pub fn has_files_under(&self, dir: &str) -> bool {
        self.files_under(dir).next().is_some()
    }

    /// Symbol names defined anywhere in the snapshot
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self
            .files
            .values()
            .flat_map(|content| SYMBOL_DEF.captures_iter(content).map(|c| c[1].to_string()))
            .collect();
        symbols.sort();
        symbols.dedup();
        symbols
    }
}

impl From<&RepoSnapshot> for RepoIndex {
    fn from(snapshot: &RepoSnapshot) -> Self {
        RepoIndex::new()
            .with_paths(snapshot.paths().map(str::to_string))
            .with_symbols(snapshot.symbols())
    }
}

impl FreshnessOracle for RepoSnapshot {
    fn resolves(&self, entity: &str) -> bool {
        self.contains(entity) || self.has_files_under(entity)
    }
}
