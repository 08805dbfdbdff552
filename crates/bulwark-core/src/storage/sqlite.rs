//! SqliteStore - durable governance state in SQLite WAL mode
//!
//! - audit_log and trust_history are append-only, enforced by triggers
//! - trust_state holds the current level per (repository, domain)
//! - kill switch triggers stay open until a resolution row exists
//! - break-glass records are upserted so reviews can be recorded

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tracing::debug;

use crate::audit::{AuditLogEntry, AuditSink};
use crate::break_glass::{BreakGlassRecord, BreakGlassRegistry};
use crate::kill_switch::{KillSwitchTrigger, Resolution, TriggerBook};
use crate::trust::{TrustRepository, TrustState, TrustTransition};
use crate::types::Timestamp;

/// SQLite store shared by the engine and the CLI
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Opens (or creates) the database in WAL mode.
    ///
    /// ```no_run
    /// use bulwark_core::storage::SqliteStore;
    /// let store = SqliteStore::open(".governance/bulwark.db").unwrap();
    /// ```
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating database directory '{}'", parent.display()))?;
            }
        }

        let conn = Connection::open(path).with_context(|| format!("opening SQLite '{}'", path.display()))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("configuring SQLite pragmas")?;

        let store = Self { conn: Mutex::new(conn) };
        store.migrate()?;
        debug!(path = %path.display(), "Governance store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory SQLite")?;
        let store = Self { conn: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        self.conn
            .lock()
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS audit_log (
                seq          INTEGER PRIMARY KEY,
                at_ms        INTEGER NOT NULL,
                session_id   TEXT,
                repository   TEXT,
                kind         TEXT NOT NULL,
                outcome      TEXT NOT NULL,
                rule         TEXT,
                prev_hash    TEXT NOT NULL,
                hash         TEXT NOT NULL,
                entry_json   TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_session ON audit_log(session_id, seq);
            CREATE INDEX IF NOT EXISTS idx_audit_at ON audit_log(at_ms);

            CREATE TRIGGER IF NOT EXISTS audit_log_no_update
                BEFORE UPDATE ON audit_log
                BEGIN SELECT RAISE(ABORT, 'audit_log is append-only'); END;
            CREATE TRIGGER IF NOT EXISTS audit_log_no_delete
                BEFORE DELETE ON audit_log
                BEGIN SELECT RAISE(ABORT, 'audit_log is append-only'); END;

            CREATE TABLE IF NOT EXISTS trust_state (
                repository         TEXT NOT NULL,
                domain             TEXT NOT NULL,
                level              INTEGER NOT NULL,
                consecutive_clean  INTEGER NOT NULL,
                state_json         TEXT NOT NULL,
                PRIMARY KEY (repository, domain)
            );

            CREATE TABLE IF NOT EXISTS trust_history (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                repository      TEXT NOT NULL,
                domain          TEXT NOT NULL,
                from_level      INTEGER NOT NULL,
                to_level        INTEGER NOT NULL,
                reason          TEXT NOT NULL,
                at_ms           INTEGER NOT NULL,
                transition_json TEXT NOT NULL
            );
            CREATE TRIGGER IF NOT EXISTS trust_history_no_update
                BEFORE UPDATE ON trust_history
                BEGIN SELECT RAISE(ABORT, 'trust_history is append-only'); END;
            CREATE TRIGGER IF NOT EXISTS trust_history_no_delete
                BEFORE DELETE ON trust_history
                BEGIN SELECT RAISE(ABORT, 'trust_history is append-only'); END;

            CREATE TABLE IF NOT EXISTS kill_switch_triggers (
                id            TEXT PRIMARY KEY,
                repository    TEXT NOT NULL,
                session_id    TEXT NOT NULL,
                kind          TEXT NOT NULL,
                at_ms         INTEGER NOT NULL,
                trigger_json  TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS kill_switch_resolutions (
                trigger_id       TEXT PRIMARY KEY REFERENCES kill_switch_triggers(id),
                resolved_by      TEXT NOT NULL,
                at_ms            INTEGER NOT NULL,
                resolution_json  TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS break_glass_records (
                id               TEXT PRIMARY KEY,
                rule_overridden  TEXT NOT NULL,
                starts_at_ms     INTEGER NOT NULL,
                ends_at_ms       INTEGER NOT NULL,
                reviewed         INTEGER NOT NULL,
                record_json      TEXT NOT NULL
            );
            ",
            )
            .context("migrating governance schema")?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Audit log
    // ─────────────────────────────────────────────────────────────────────────

    /// Inserts entries in one transaction; already stored sequence numbers are skipped
    pub fn append_audit(&self, entries: &[AuditLogEntry]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("starting audit transaction")?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO audit_log
                 (seq, at_ms, session_id, repository, kind, outcome, rule, prev_hash, hash, entry_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for entry in entries {
                let kind = serde_json::to_value(entry.kind)?;
                let outcome = serde_json::to_value(entry.outcome)?;
                inserted += stmt
                    .execute(params![
                        entry.seq as i64,
                        entry.at.timestamp_millis(),
                        entry.session.as_ref().map(|s| s.as_str().to_string()),
                        entry.repository,
                        kind.as_str().unwrap_or_default(),
                        outcome.as_str().unwrap_or_default(),
                        entry.rule,
                        entry.prev_hash,
                        entry.hash,
                        serde_json::to_string(entry)?,
                    ])
                    .context("INSERT audit_log")?;
            }
        }
        tx.commit().context("committing audit entries")?;
        Ok(inserted)
    }

    /// Entries in sequence order, optionally from `since` onwards
    pub fn load_audit(&self, since: Option<Timestamp>) -> Result<Vec<AuditLogEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT entry_json FROM audit_log
             WHERE at_ms >= ?1
             ORDER BY seq ASC",
        )?;
        let since_ms = since.map_or(i64::MIN, |t| t.timestamp_millis());
        let rows = stmt
            .query_map(params![since_ms], |row| row.get::<_, String>(0))
            .context("query audit_log")?;

        rows.map(|json| {
            let json = json?;
            serde_json::from_str(&json).context("decoding audit entry")
        })
        .collect()
    }

    pub fn audit_len(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))
            .context("counting audit_log")?;
        Ok(count as usize)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Trust
    // ─────────────────────────────────────────────────────────────────────────

    pub fn save_trust(&self, states: &[TrustState], transitions: &[TrustTransition]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("starting trust transaction")?;
        for state in states {
            tx.execute(
                "INSERT INTO trust_state (repository, domain, level, consecutive_clean, state_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(repository, domain) DO UPDATE SET
                    level = excluded.level,
                    consecutive_clean = excluded.consecutive_clean,
                    state_json = excluded.state_json",
                params![
                    state.repository,
                    state.domain.as_str(),
                    state.level.value(),
                    state.consecutive_clean,
                    serde_json::to_string(state)?,
                ],
            )
            .context("UPSERT trust_state")?;
        }
        for t in transitions {
            tx.execute(
                "INSERT INTO trust_history
                 (repository, domain, from_level, to_level, reason, at_ms, transition_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    t.repository,
                    t.domain.as_str(),
                    t.from.value(),
                    t.to.value(),
                    t.reason,
                    t.at.timestamp_millis(),
                    serde_json::to_string(t)?,
                ],
            )
            .context("INSERT trust_history")?;
        }
        tx.commit().context("committing trust update")?;
        Ok(())
    }

    pub fn load_trust_states(&self) -> Result<Vec<TrustState>> {
        self.load_json("SELECT state_json FROM trust_state ORDER BY repository, domain")
    }

    pub fn load_trust_history(&self) -> Result<Vec<TrustTransition>> {
        self.load_json("SELECT transition_json FROM trust_history ORDER BY id ASC")
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Kill switch
    // ─────────────────────────────────────────────────────────────────────────

    pub fn save_trigger(&self, trigger: &KillSwitchTrigger) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "INSERT OR IGNORE INTO kill_switch_triggers
                 (id, repository, session_id, kind, at_ms, trigger_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    trigger.id,
                    trigger.repository,
                    trigger.session.as_str(),
                    trigger.kind.as_str(),
                    trigger.at.timestamp_millis(),
                    serde_json::to_string(trigger)?,
                ],
            )
            .context("INSERT kill_switch_triggers")?;
        Ok(())
    }

    pub fn save_resolution(&self, resolution: &Resolution) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO kill_switch_resolutions (trigger_id, resolved_by, at_ms, resolution_json)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    resolution.trigger_id,
                    resolution.resolved_by,
                    resolution.at.timestamp_millis(),
                    serde_json::to_string(resolution)?,
                ],
            )
            .context("INSERT kill_switch_resolutions")?;
        Ok(())
    }

    pub fn load_open_triggers(&self) -> Result<Vec<KillSwitchTrigger>> {
        self.load_json(
            "SELECT t.trigger_json FROM kill_switch_triggers t
             LEFT JOIN kill_switch_resolutions r ON r.trigger_id = t.id
             WHERE r.trigger_id IS NULL
             ORDER BY t.at_ms ASC",
        )
    }

    pub fn load_resolutions(&self) -> Result<Vec<Resolution>> {
        self.load_json("SELECT resolution_json FROM kill_switch_resolutions ORDER BY at_ms ASC")
    }

    pub fn load_trigger_book(&self) -> Result<TriggerBook> {
        Ok(TriggerBook::restore(self.load_open_triggers()?, self.load_resolutions()?))
    }

    pub fn load_trigger(&self, id: &str) -> Result<Option<KillSwitchTrigger>> {
        let json: Option<String> = self
            .conn
            .lock()
            .query_row(
                "SELECT trigger_json FROM kill_switch_triggers WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .context("query kill_switch_triggers")?;
        json.map(|j| serde_json::from_str(&j).context("decoding trigger"))
            .transpose()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Break-glass
    // ─────────────────────────────────────────────────────────────────────────

    pub fn save_break_glass(&self, record: &BreakGlassRecord) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO break_glass_records
                 (id, rule_overridden, starts_at_ms, ends_at_ms, reviewed, record_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                    reviewed = excluded.reviewed,
                    record_json = excluded.record_json",
                params![
                    record.id,
                    record.rule_overridden,
                    record.starts_at.timestamp_millis(),
                    record.ends_at.timestamp_millis(),
                    record.reviewed,
                    serde_json::to_string(record)?,
                ],
            )
            .context("UPSERT break_glass_records")?;
        Ok(())
    }

    pub fn load_break_glass(&self) -> Result<BreakGlassRegistry> {
        let records: Vec<BreakGlassRecord> =
            self.load_json("SELECT record_json FROM break_glass_records ORDER BY starts_at_ms ASC")?;
        BreakGlassRegistry::from_records(records).map_err(anyhow::Error::from)
    }

    fn load_json<T: serde::de::DeserializeOwned>(&self, sql: &str) -> Result<Vec<T>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .with_context(|| format!("query: {sql}"))?;
        rows.map(|json| {
            let json = json?;
            serde_json::from_str(&json).context("decoding stored row")
        })
        .collect()
    }
}

impl AuditSink for SqliteStore {
    fn write_entries(&self, entries: &[AuditLogEntry]) -> crate::error::Result<()> {
        self.append_audit(entries)?;
        Ok(())
    }
}

impl TrustRepository for SqliteStore {
    fn load_states(&self) -> crate::error::Result<Vec<TrustState>> {
        Ok(self.load_trust_states()?)
    }

    fn load_history(&self) -> crate::error::Result<Vec<TrustTransition>> {
        Ok(self.load_trust_history()?)
    }

    fn save(&self, states: &[TrustState], transitions: &[TrustTransition]) -> crate::error::Result<()> {
        Ok(self.save_trust(states, transitions)?)
    }
}
