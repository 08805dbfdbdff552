//! Agent sessions
//!
//! A session is created when an agent starts work and closed exactly once:
//! by recording its output contract, by a kill-switch halt, or by external
//! cancellation. A closed session accepts no further events.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{GovernanceError, Result};
use crate::events::{Event, EventStore};
use crate::types::{now, AgentRole, Domain, SessionId, Timestamp};

/// Who is acting in the session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub name: String,
    pub role: AgentRole,
    #[serde(default)]
    pub model: Option<String>,
}

impl AgentIdentity {
    pub fn new(name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: AgentRole::new(role),
            model: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// Scope declared at session start
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeclaredScope {
    pub branches: Vec<String>,
    pub environments: Vec<String>,
    /// Write tools are refused
    pub read_only: bool,
    /// Production hosts may be reached
    pub production_authorized: bool,
    /// Payloads above the ceiling were announced up front
    pub large_payload_declared: bool,
}

impl DeclaredScope {
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Self::default()
        }
    }
}

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Accepting events
    Open,
    /// Output contract recorded
    Closed,
    /// Stopped by the kill switch
    Halted,
    /// Cancelled from outside
    Cancelled,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Open => "open",
            SessionState::Closed => "closed",
            SessionState::Halted => "halted",
            SessionState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Parameters for starting a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRequest {
    pub repository: String,
    pub agent: AgentIdentity,
    pub domain: Domain,
    #[serde(default)]
    pub scope: DeclaredScope,
}

impl SessionRequest {
    pub fn new(repository: impl Into<String>, agent: AgentIdentity, domain: Domain) -> Self {
        Self {
            repository: repository.into(),
            agent,
            domain,
            scope: DeclaredScope::default(),
        }
    }

    pub fn with_scope(mut self, scope: DeclaredScope) -> Self {
        self.scope = scope;
        self
    }
}

/// A governed agent session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub repository: String,
    pub agent: AgentIdentity,
    pub domain: Domain,
    pub scope: DeclaredScope,
    pub started_at: Timestamp,
    pub ended_at: Option<Timestamp>,
    pub state: SessionState,
    pub events: EventStore,
    /// Raw output contract, once recorded
    pub contract: Option<serde_json::Value>,
}

impl Session {
    pub fn new(request: SessionRequest) -> Self {
        Self {
            id: SessionId::new(),
            repository: request.repository,
            agent: request.agent,
            domain: request.domain,
            scope: request.scope,
            started_at: now(),
            ended_at: None,
            state: SessionState::Open,
            events: EventStore::new(),
            contract: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    /// Fails with `SessionClosed` unless the session still accepts events
    pub fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(GovernanceError::SessionClosed {
                id: self.id.to_string(),
                state: self.state.to_string(),
            })
        }
    }

    pub fn append(&mut self, event: Event) -> Result<u64> {
        self.ensure_open()?;
        Ok(self.events.append(event))
    }

    /// Move to a terminal state; the first terminal state sticks
    pub fn finish(&mut self, state: SessionState) {
        if self.is_open() && state != SessionState::Open {
            self.state = state;
            self.ended_at = Some(now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(SessionRequest::new(
            "acme/api",
            AgentIdentity::new("builder", "implementer").with_model("model-x"),
            Domain::CodeGeneration,
        ))
    }

    #[test]
    fn test_closed_session_rejects_events() {
        let mut s = session();
        s.append(Event::confidence("t1", 70)).unwrap();
        s.finish(SessionState::Halted);

        let err = s.append(Event::confidence("t2", 70)).unwrap_err();
        assert!(err.to_string().contains("halted"));
        assert_eq!(s.events.len(), 1);
    }

    #[test]
    fn test_first_terminal_state_sticks() {
        let mut s = session();
        s.finish(SessionState::Halted);
        s.finish(SessionState::Cancelled);
        assert_eq!(s.state, SessionState::Halted);
        assert!(s.ended_at.is_some());
    }
}
