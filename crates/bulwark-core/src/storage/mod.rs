//! Persistent storage - SQLite WAL
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         SqliteStore                          │
//! ├──────────────┬──────────────────────┬────────────────────────┤
//! │  audit_log   │ trust_state          │ kill_switch_triggers   │
//! │ (hash chain, │ trust_history        │ kill_switch_resolutions│
//! │ append-only) │ (append-only)        │ break_glass_records    │
//! └──────────────┴──────────────────────┴────────────────────────┘
//! ```
//!
//! The store is an [`AuditSink`](crate::audit::AuditSink) and a
//! [`TrustRepository`](crate::trust::TrustRepository), so the engine mirrors
//! its in-memory state here without knowing about SQL.

pub mod sqlite;

pub use sqlite::SqliteStore;
