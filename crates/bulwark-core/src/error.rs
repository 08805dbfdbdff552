//! Error types for Bulwark Core
//!
//! Every governance rejection is a variant of [`GovernanceError`]. Each variant
//! carries the rule or threshold that was violated and the literal value that
//! triggered it, so callers never have to render a generic "blocked" message.
//! We use `thiserror` for the Display/Error implementations.

use thiserror::Error;

use crate::kill_switch::HaltReport;

/// Result type alias for governance operations
pub type Result<T> = std::result::Result<T, GovernanceError>;

/// Main error type for governance operations
#[derive(Error, Debug)]
pub enum GovernanceError {
    /// Schema or field violation. Always surfaced, never auto-corrected.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Self-reported confidence above the configured ceiling
    #[error("ConfidenceCeilingExceeded: confidence {value} exceeds ceiling {ceiling}")]
    ConfidenceCeilingExceeded { value: i64, ceiling: u8 },

    /// Cross-field inconsistency inside an output contract
    #[error("ContractInconsistency: {0}")]
    ContractInconsistency(String),

    /// Soft stop: the session must be confirmed before more file changes
    #[error("ScopeAlert: {0}")]
    ScopeAlert(String),

    /// Hard block on a single tool call
    #[error("RateLimitExceeded: {scope} call count {count} would exceed limit {limit}")]
    RateLimitExceeded {
        scope: String,
        count: u32,
        limit: u32,
    },

    /// Terminal halt of the session
    #[error("KillSwitchTriggered: {}", .0.summary())]
    KillSwitchTriggered(Box<HaltReport>),

    /// A lower config layer tried to widen a safety key
    #[error("InheritanceViolation: {key} widened from {parent} to {child}")]
    InheritanceViolation {
        key: String,
        parent: String,
        child: String,
    },

    /// A tool call was refused by the governor
    #[error("Tool call rejected by rule '{rule}': {detail}")]
    ToolRejected { rule: String, detail: String },

    /// The underlying tool server did not answer in time
    #[error("Tool call to {server}/{tool} timed out after {timeout_ms}ms")]
    ToolTimeout {
        server: String,
        tool: String,
        timeout_ms: u64,
    },

    /// The underlying tool server returned an error
    #[error("Tool call to {server}/{tool} failed: {message}")]
    ToolFailed {
        server: String,
        tool: String,
        message: String,
    },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session {id} is closed ({state}); no further events accepted")]
    SessionClosed { id: String, state: String },

    /// A kill-switch trigger is still waiting for an explicit resume
    #[error("Unresolved kill switch {trigger_id} ({kind}) blocks repository {repository}")]
    UnresolvedTrigger {
        trigger_id: String,
        kind: String,
        repository: String,
    },

    /// A resume instruction that does not name an open trigger
    #[error("Resume instruction references {given}, which is not an open trigger")]
    TriggerMismatch { given: String },

    /// Break-glass record problems
    #[error("Break-glass error: {0}")]
    BreakGlass(String),

    /// Task graph errors
    #[error("Task graph error: {0}")]
    TaskGraph(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Persistence errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        source: Box<GovernanceError>,
    },
}

impl GovernanceError {
    /// Add context to an error
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Innermost error, skipping any context wrappers
    pub fn root(&self) -> &GovernanceError {
        match self {
            Self::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// Kill-switch halts belong to their own severity class
    pub fn is_terminal(&self) -> bool {
        matches!(self.root(), Self::KillSwitchTriggered(_))
    }

    /// Recoverable conditions are reported and the session continues
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.root(),
            Self::ScopeAlert(_)
                | Self::RateLimitExceeded { .. }
                | Self::ToolRejected { .. }
                | Self::ToolTimeout { .. }
                | Self::ToolFailed { .. }
        )
    }
}

impl From<toml::de::Error> for GovernanceError {
    fn from(e: toml::de::Error) -> Self {
        GovernanceError::Config(e.to_string())
    }
}

impl From<rusqlite::Error> for GovernanceError {
    fn from(e: rusqlite::Error) -> Self {
        GovernanceError::Storage(e.to_string())
    }
}

impl From<anyhow::Error> for GovernanceError {
    fn from(e: anyhow::Error) -> Self {
        GovernanceError::Storage(format!("{e:#}"))
    }
}

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to a Result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add lazy context to a Result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.context(f()))
    }
}
