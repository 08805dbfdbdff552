//! Bulwark Core - Governance enforcement for AI coding-agent sessions
//!
//! Bulwark takes the structured record of what an agent session did (files
//! touched, tool calls, confidence declarations, a final output contract)
//! and decides whether the session is compliant, how it scores, and how much
//! the next session in that domain may be trusted. A fixed set of dangerous
//! conditions halts the session on the spot.
//!
//! # Architecture
//!
//! Components, leaf-first:
//!
//! 1. **Event store** (`events`, `session`): ordered, append-only session events
//! 2. **Output contract validator** (`contract`): schema, ceiling and consistency checks
//! 3. **Blast radius tracker** (`blast_radius`): LOW / MEDIUM / HIGH scope of change
//! 4. **Tool governor** (`governor`): allowlist, rate limits, payload ceiling, audit
//! 5. **Kill switch** (`kill_switch`): five unconditional halt triggers
//! 6. **Quality gate** (`quality`): weighted checklist, score and verdict
//! 7. **Progressive trust** (`trust`): per-domain review depth
//! 8. **Health scorer** (`health`): governance file state of a repository
//!
//! Around them: layered org → team → repo configuration (`config`),
//! break-glass overrides (`break_glass`), the hash-chained audit log
//! (`audit`), multi-agent task graphs (`orchestration`), cross-session
//! knowledge (`knowledge`) and SQLite persistence (`storage`). The
//! [`GovernanceEngine`] wires everything together.
//!
//! # Quick Start
//!
//! ```
//! use bulwark_core::{AgentIdentity, Domain, Event, GovernanceConfig, GovernanceEngine, SessionRequest};
//! use bulwark_core::events::FileChange;
//!
//! let engine = GovernanceEngine::new(GovernanceConfig::default()).unwrap();
//! let start = engine
//!     .start_session(SessionRequest::new(
//!         "acme/api",
//!         AgentIdentity::new("builder", "implementer"),
//!         Domain::CodeGeneration,
//!     ))
//!     .unwrap();
//!
//! engine.ingest(&start.session, FileChange::new("src/lib.rs", 12, 3).into()).unwrap();
//! engine.ingest(&start.session, Event::confidence("task-1", 80)).unwrap();
//! ```

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod audit;
pub mod blast_radius;
pub mod break_glass;
pub mod config;
pub mod contract;
pub mod engine;
pub mod error;
pub mod events;
pub mod governor;
pub mod health;
pub mod kill_switch;
pub mod knowledge;
pub mod orchestration;
pub mod quality;
pub mod session;
pub mod storage;
pub mod trust;
pub mod types;

// Re-export commonly used types for convenience
pub use audit::{AuditLog, AuditLogEntry};
pub use blast_radius::{BlastRadiusLevel, BlastRadiusSnapshot, BlastRadiusTracker};
pub use break_glass::{BreakGlassRecord, BreakGlassRegistry};
pub use config::GovernanceConfig;
pub use contract::{ContractReport, ContractStatus, ContractValidator, OutputContract};
pub use engine::{GovernanceEngine, Ingested, SessionOutcome, SessionStart};
pub use error::{GovernanceError, Result};
pub use events::Event;
pub use health::{HealthReport, HealthScorer, RepoSnapshot};
pub use kill_switch::{HaltReport, KillSwitchTrigger, TriggerKind};
pub use quality::{CheckResult, QualityGateScorer, QualityReport, Verdict};
pub use session::{AgentIdentity, DeclaredScope, SessionRequest};
pub use storage::SqliteStore;
pub use trust::{DemotionCause, TrustLedger, TrustLevel};
pub use types::{Domain, SessionId, Timestamp};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
