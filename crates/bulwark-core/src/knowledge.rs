//! Cross-session knowledge
//!
//! Facts an agent should carry between sessions (decisions, conventions,
//! incidents). Each entry has a category, a creation date and an expiry
//! condition. Expiry is evaluated only at session start by
//! [`KnowledgeStore::checkpoint`]; expired entries are kept, marked, and no
//! longer served.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;
use uuid::Uuid;

use crate::error::{GovernanceError, Result};
use crate::types::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeCategory {
    Decision,
    Convention,
    Incident,
    OpenThread,
    Preference,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Expiry {
    Never,
    At(Timestamp),
    /// After this many session starts following creation
    AfterSessions(u32),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub id: String,
    pub repository: String,
    pub category: KnowledgeCategory,
    pub content: String,
    pub created_at: Timestamp,
    pub expiry: Expiry,
    #[serde(default)]
    pub sessions_seen: u32,
    #[serde(default)]
    pub expired_at: Option<Timestamp>,
}

impl KnowledgeEntry {
    pub fn new(
        repository: impl Into<String>,
        category: KnowledgeCategory,
        content: impl Into<String>,
        created_at: Timestamp,
        expiry: Expiry,
    ) -> Self {
        Self {
            id: format!("kn-{}", Uuid::new_v4()),
            repository: repository.into(),
            category,
            content: content.into(),
            created_at,
            expiry,
            sessions_seen: 0,
            expired_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.expired_at.is_none()
    }
}

/// Whether an entry with `expiry` has expired at `at` after `sessions_seen` session starts
pub fn is_expired(expiry: Expiry, at: Timestamp, sessions_seen: u32) -> bool {
    match expiry {
        Expiry::Never => false,
        Expiry::At(deadline) => at >= deadline,
        Expiry::AfterSessions(n) => sessions_seen >= n,
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KnowledgeStore {
    entries: Vec<KnowledgeEntry>,
}

impl KnowledgeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        Ok(Self {
            entries: serde_json::from_str(content)?,
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::new());
        }
        Self::from_json_str(&std::fs::read_to_string(path)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(&self.entries)?)?;
        Ok(())
    }

    pub fn add(&mut self, entry: KnowledgeEntry) -> Result<&KnowledgeEntry> {
        if entry.content.trim().is_empty() {
            return Err(GovernanceError::Validation(format!(
                "knowledge entry {} has empty content",
                entry.id
            )));
        }
        self.entries.push(entry);
        Ok(&self.entries[self.entries.len() - 1])
    }

    pub fn entries(&self) -> &[KnowledgeEntry] {
        &self.entries
    }

    /// Entries still served for `repository`
    pub fn active(&self, repository: &str) -> Vec<&KnowledgeEntry> {
        self.entries
            .iter()
            .filter(|e| e.repository == repository && e.is_active())
            .collect()
    }

    /// Session-start checkpoint: counts the session against every active
    /// entry of `repository`, then expires what is due. Returns the entries
    /// that expired at this checkpoint.
    pub fn checkpoint(&mut self, repository: &str, at: Timestamp) -> Vec<KnowledgeEntry> {
        let mut expired = Vec::new();
        for entry in self
            .entries
            .iter_mut()
            .filter(|e| e.repository == repository && e.is_active())
        {
            entry.sessions_seen = entry.sessions_seen.saturating_add(1);
            if is_expired(entry.expiry, at, entry.sessions_seen) {
                entry.expired_at = Some(at);
                expired.push(entry.clone());
            }
        }
        if !expired.is_empty() {
            info!(repository, expired = expired.len(), "Knowledge entries expired");
        }
        expired
    }
}
