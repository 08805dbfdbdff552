//! Append-only audit log
//!
//! One entry per tool call and per governance decision. Entries are never
//! mutated or deleted. Each entry stores the blake3 hash of its predecessor,
//! so any rewrite of history breaks [`verify_chain`].
//!
//! Entries are kept in memory and mirrored to every registered [`AuditSink`]
//! on [`AuditLog::flush`].

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error};

use crate::error::{GovernanceError, Result};
use crate::types::{now, Blake3Hash, SessionId, Timestamp};

/// What the entry records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    SessionStarted,
    EventAccepted,
    EventRejected,
    ScopeAlert,
    ScopeConfirmed,
    ToolCall,
    OverrideRecorded,
    KillSwitch,
    Resume,
    ContractValidated,
    QualityScored,
    TrustTransition,
    Incident,
    KnowledgeExpired,
    SessionClosed,
    SessionCancelled,
}

/// Result of the recorded decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Accepted,
    Rejected,
    Alert,
    Halted,
    Failed,
    Info,
}

/// A decision about to be recorded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditDraft {
    pub session: Option<SessionId>,
    pub repository: Option<String>,
    pub kind: AuditKind,
    pub outcome: AuditOutcome,
    /// Rule or threshold that drove the decision
    pub rule: Option<String>,
    pub detail: String,
    pub latency_ms: Option<u64>,
}

impl AuditDraft {
    pub fn new(kind: AuditKind, outcome: AuditOutcome, detail: impl Into<String>) -> Self {
        Self {
            session: None,
            repository: None,
            kind,
            outcome,
            rule: None,
            detail: detail.into(),
            latency_ms: None,
        }
    }

    pub fn session(mut self, session: &SessionId, repository: &str) -> Self {
        self.session = Some(session.clone());
        self.repository = Some(repository.to_string());
        self
    }

    pub fn repository(mut self, repository: &str) -> Self {
        self.repository = Some(repository.to_string());
        self
    }

    pub fn rule(mut self, rule: impl Into<String>) -> Self {
        self.rule = Some(rule.into());
        self
    }

    pub fn latency_ms(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }
}

/// A recorded, hash-chained entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub seq: u64,
    pub at: Timestamp,
    pub session: Option<SessionId>,
    pub repository: Option<String>,
    pub kind: AuditKind,
    pub outcome: AuditOutcome,
    pub rule: Option<String>,
    pub detail: String,
    pub latency_ms: Option<u64>,
    pub prev_hash: String,
    pub hash: String,
}

#[derive(Serialize)]
struct HashInput<'a> {
    seq: u64,
    at: &'a Timestamp,
    session: &'a Option<SessionId>,
    repository: &'a Option<String>,
    kind: AuditKind,
    outcome: AuditOutcome,
    rule: &'a Option<String>,
    detail: &'a str,
    latency_ms: Option<u64>,
    prev_hash: &'a str,
}

impl AuditLogEntry {
    fn compute_hash(&self) -> Result<String> {
        let input = HashInput {
            seq: self.seq,
            at: &self.at,
            session: &self.session,
            repository: &self.repository,
            kind: self.kind,
            outcome: self.outcome,
            rule: &self.rule,
            detail: &self.detail,
            latency_ms: self.latency_ms,
            prev_hash: &self.prev_hash,
        };
        let bytes = serde_json::to_vec(&input)?;
        Ok(Blake3Hash::from(blake3::hash(&bytes)).to_hex())
    }
}

/// Check that every entry hashes correctly and links to its predecessor
pub fn verify_chain(entries: &[AuditLogEntry]) -> Result<()> {
    let mut expected_prev = match entries.first() {
        Some(first) => first.prev_hash.clone(),
        None => return Ok(()),
    };
    for entry in entries {
        if entry.prev_hash != expected_prev {
            return Err(GovernanceError::Storage(format!(
                "audit chain broken at entry {}: predecessor hash mismatch",
                entry.seq
            )));
        }
        if entry.compute_hash()? != entry.hash {
            return Err(GovernanceError::Storage(format!(
                "audit chain broken at entry {}: content does not match its hash",
                entry.seq
            )));
        }
        expected_prev = entry.hash.clone();
    }
    Ok(())
}

/// Oldest timestamp that local retention must still cover
pub fn retention_cutoff(at: Timestamp, retention_days: u32) -> Timestamp {
    at - chrono::Duration::days(i64::from(retention_days))
}

/// Durable destination for audit entries
pub trait AuditSink: Send + Sync {
    fn write_entries(&self, entries: &[AuditLogEntry]) -> Result<()>;
}

/// Appends entries to a JSON Lines file
pub struct JsonlAuditSink {
    file: Mutex<File>,
}

impl JsonlAuditSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl AuditSink for JsonlAuditSink {
    fn write_entries(&self, entries: &[AuditLogEntry]) -> Result<()> {
        let mut file = self.file.lock();
        for entry in entries {
            serde_json::to_writer(&mut *file, entry)?;
            file.write_all(b"\n")?;
        }
        file.flush()?;
        Ok(())
    }
}

struct LogState {
    entries: Vec<AuditLogEntry>,
    flushed: usize,
}

/// Shared, append-only audit log
#[derive(Clone)]
pub struct AuditLog {
    state: Arc<RwLock<LogState>>,
    sinks: Arc<RwLock<Vec<Arc<dyn AuditSink>>>>,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditLog {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(LogState {
                entries: Vec::new(),
                flushed: 0,
            })),
            sinks: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Continue a chain loaded from durable storage; loaded entries count as flushed
    pub fn resume_from(entries: Vec<AuditLogEntry>) -> Result<Self> {
        verify_chain(&entries)?;
        let flushed = entries.len();
        let log = Self::new();
        *log.state.write() = LogState { entries, flushed };
        Ok(log)
    }

    pub fn add_sink(&self, sink: Arc<dyn AuditSink>) {
        self.sinks.write().push(sink);
    }

    /// Append a decision and return the recorded entry
    pub fn record(&self, draft: AuditDraft) -> Result<AuditLogEntry> {
        let mut state = self.state.write();
        let (seq, prev_hash) = match state.entries.last() {
            Some(last) => (last.seq + 1, last.hash.clone()),
            None => (0, Blake3Hash::empty().to_hex()),
        };
        let mut entry = AuditLogEntry {
            seq,
            at: now(),
            session: draft.session,
            repository: draft.repository,
            kind: draft.kind,
            outcome: draft.outcome,
            rule: draft.rule,
            detail: draft.detail,
            latency_ms: draft.latency_ms,
            prev_hash,
            hash: String::new(),
        };
        entry.hash = entry.compute_hash()?;
        debug!(seq, kind = ?entry.kind, outcome = ?entry.outcome, "Audit entry recorded");
        state.entries.push(entry.clone());
        Ok(entry)
    }

    /// Push every entry not yet written to the sinks
    pub fn flush(&self) -> Result<usize> {
        let mut state = self.state.write();
        let pending = &state.entries[state.flushed..];
        if pending.is_empty() {
            return Ok(0);
        }
        for sink in self.sinks.read().iter() {
            if let Err(e) = sink.write_entries(pending) {
                error!(error = %e, pending = pending.len(), "Audit flush failed");
                return Err(e);
            }
        }
        let count = pending.len();
        state.flushed = state.entries.len();
        Ok(count)
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending(&self) -> usize {
        let state = self.state.read();
        state.entries.len() - state.flushed
    }

    pub fn entries(&self) -> Vec<AuditLogEntry> {
        self.state.read().entries.clone()
    }

    pub fn for_session(&self, session: &SessionId) -> Vec<AuditLogEntry> {
        self.state
            .read()
            .entries
            .iter()
            .filter(|e| e.session.as_ref() == Some(session))
            .cloned()
            .collect()
    }

    pub fn verify(&self) -> Result<()> {
        verify_chain(&self.state.read().entries)
    }

    /// Read-only JSON Lines export of entries at or after `since`
    pub fn export_jsonl<W: Write>(&self, since: Option<Timestamp>, mut out: W) -> Result<usize> {
        let state = self.state.read();
        let mut written = 0;
        for entry in state
            .entries
            .iter()
            .filter(|e| since.map_or(true, |s| e.at >= s))
        {
            serde_json::to_writer(&mut out, entry)?;
            out.write_all(b"\n")?;
            written += 1;
        }
        Ok(written)
    }
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("AuditLog")
            .field("entries", &state.entries.len())
            .field("flushed", &state.flushed)
            .finish()
    }
}
