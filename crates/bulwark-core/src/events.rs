//! Session events and the append-only event store
//!
//! Events are immutable once appended. Their order inside a session matters:
//! confidence-collapse, cascade-failure and cascade-write detection all read
//! the sequence as it arrived.

use serde::{Deserialize, Serialize};

use crate::error::{GovernanceError, Result};
use crate::types::{now, Timestamp};

/// Upper bound of a confidence value
pub const MAX_CONFIDENCE: u8 = 100;

/// Error-recovery tag carried by actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryPhase {
    /// The action failed
    Failed,
    /// The action corrects the previous failure
    Corrective,
}

/// A file touched by the session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub lines_added: u32,
    pub lines_removed: u32,
    /// Set by the producer; configured critical paths are matched as well
    #[serde(default)]
    pub is_critical: bool,
    /// The file did not exist before this session
    #[serde(default)]
    pub created: bool,
    #[serde(default)]
    pub recovery: Option<RecoveryPhase>,
    /// Other entities (paths, symbols) this change relies on
    #[serde(default)]
    pub references: Vec<String>,
}

impl FileChange {
    pub fn new(path: impl Into<String>, lines_added: u32, lines_removed: u32) -> Self {
        Self {
            path: path.into(),
            lines_added,
            lines_removed,
            is_critical: false,
            created: false,
            recovery: None,
            references: Vec::new(),
        }
    }

    pub fn critical(mut self) -> Self {
        self.is_critical = true;
        self
    }

    pub fn created(mut self) -> Self {
        self.created = true;
        self
    }

    pub fn with_recovery(mut self, phase: RecoveryPhase) -> Self {
        self.recovery = Some(phase);
        self
    }

    pub fn with_reference(mut self, entity: impl Into<String>) -> Self {
        self.references.push(entity.into());
        self
    }

    pub fn lines_touched(&self) -> u32 {
        self.lines_added.saturating_add(self.lines_removed)
    }
}

/// A call to an MCP tool server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub server: String,
    pub tool: String,
    #[serde(default)]
    pub args: serde_json::Value,
    #[serde(default = "now")]
    pub timestamp: Timestamp,
    /// Size of the returned payload, when the call already happened
    #[serde(default)]
    pub response_bytes: Option<u64>,
    #[serde(default)]
    pub recovery: Option<RecoveryPhase>,
    #[serde(default)]
    pub references: Vec<String>,
}

impl ToolCall {
    pub fn new(server: impl Into<String>, tool: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            server: server.into(),
            tool: tool.into(),
            args,
            timestamp: now(),
            response_bytes: None,
            recovery: None,
            references: Vec::new(),
        }
    }

    pub fn with_response_bytes(mut self, bytes: u64) -> Self {
        self.response_bytes = Some(bytes);
        self
    }

    pub fn with_recovery(mut self, phase: RecoveryPhase) -> Self {
        self.recovery = Some(phase);
        self
    }

    pub fn with_reference(mut self, entity: impl Into<String>) -> Self {
        self.references.push(entity.into());
        self
    }

    /// Resource a call acts on: `resource`, `path` or `target` argument,
    /// falling back to `server/tool`
    pub fn resource(&self) -> String {
        ["resource", "path", "target"]
            .iter()
            .find_map(|key| self.args.get(key).and_then(|v| v.as_str()))
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}/{}", self.server, self.tool))
    }
}

/// A self-reported confidence for one task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfidenceDeclaration {
    pub task_id: String,
    pub value: u8,
}

/// Session event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    FileChange(FileChange),
    ToolCall(ToolCall),
    ConfidenceDeclaration(ConfidenceDeclaration),
}

impl Event {
    pub fn confidence(task_id: impl Into<String>, value: u8) -> Self {
        Event::ConfidenceDeclaration(ConfidenceDeclaration {
            task_id: task_id.into(),
            value,
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::FileChange(_) => "file_change",
            Event::ToolCall(_) => "tool_call",
            Event::ConfidenceDeclaration(_) => "confidence_declaration",
        }
    }

    /// Error-recovery tag; `None` for untagged actions and declarations
    pub fn recovery(&self) -> Option<RecoveryPhase> {
        match self {
            Event::FileChange(c) => c.recovery,
            Event::ToolCall(c) => c.recovery,
            Event::ConfidenceDeclaration(_) => None,
        }
    }

    /// Reject values no agent can legitimately report
    pub fn validate(&self) -> Result<()> {
        match self {
            Event::ConfidenceDeclaration(d) if d.value > MAX_CONFIDENCE => Err(GovernanceError::Validation(format!(
                "confidence {} for task '{}' is outside 0..={MAX_CONFIDENCE}",
                d.value, d.task_id
            ))),
            Event::ConfidenceDeclaration(d) if d.task_id.trim().is_empty() => Err(GovernanceError::Validation(
                "confidence declaration needs a task id".to_string(),
            )),
            _ => Ok(()),
        }
    }

    pub fn is_action(&self) -> bool {
        !matches!(self, Event::ConfidenceDeclaration(_))
    }

    pub fn references(&self) -> &[String] {
        match self {
            Event::FileChange(c) => &c.references,
            Event::ToolCall(c) => &c.references,
            Event::ConfidenceDeclaration(_) => &[],
        }
    }

    /// One-line description used in evidence and audit entries
    pub fn summary(&self) -> String {
        match self {
            Event::FileChange(c) => format!(
                "file_change {} (+{} -{}{}{})",
                c.path,
                c.lines_added,
                c.lines_removed,
                if c.created { ", created" } else { "" },
                if c.is_critical { ", critical" } else { "" }
            ),
            Event::ToolCall(c) => format!("tool_call {}/{} on {}", c.server, c.tool, c.resource()),
            Event::ConfidenceDeclaration(d) => {
                format!("confidence_declaration {}={}", d.task_id, d.value)
            }
        }
    }
}

impl From<FileChange> for Event {
    fn from(change: FileChange) -> Self {
        Event::FileChange(change)
    }
}

impl From<ToolCall> for Event {
    fn from(call: ToolCall) -> Self {
        Event::ToolCall(call)
    }
}

/// An event with its position in the session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencedEvent {
    pub seq: u64,
    pub received_at: Timestamp,
    pub event: Event,
}

/// Append-only event sequence of one session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventStore {
    events: Vec<SequencedEvent>,
}

impl EventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append and return the assigned sequence number
    pub fn append(&mut self, event: Event) -> u64 {
        let seq = self.events.len() as u64;
        self.events.push(SequencedEvent {
            seq,
            received_at: now(),
            event,
        });
        seq
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SequencedEvent> {
        self.events.iter()
    }

    /// The last `n` events, oldest first
    pub fn last_n(&self, n: usize) -> &[SequencedEvent] {
        let start = self.events.len().saturating_sub(n);
        &self.events[start..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_json_shape() {
        let event: Event = serde_json::from_value(json!({
            "type": "file_change",
            "path": "src/lib.rs",
            "lines_added": 12,
            "lines_removed": 3
        }))
        .unwrap();

        match &event {
            Event::FileChange(c) => {
                assert_eq!(c.lines_touched(), 15);
                assert!(!c.is_critical);
                assert!(c.recovery.is_none());
            }
            other => panic!("unexpected event {other:?}"),
        }

        let declaration: Event =
            serde_json::from_value(json!({"type": "confidence_declaration", "task_id": "t1", "value": 40}))
                .unwrap();
        assert_eq!(declaration, Event::confidence("t1", 40));
    }

    #[test]
    fn test_tool_call_resource() {
        let call = ToolCall::new("github", "create_issue", json!({"path": "repo/issues"}));
        assert_eq!(call.resource(), "repo/issues");

        let call = ToolCall::new("jira", "update_ticket", serde_json::Value::Null);
        assert_eq!(call.resource(), "jira/update_ticket");
    }

    #[test]
    fn test_confidence_range() {
        assert!(Event::confidence("t1", 100).validate().is_ok());
        assert!(Event::confidence("t1", 0).validate().is_ok());
        let err = Event::confidence("t1", 101).validate().unwrap_err();
        assert!(matches!(err, GovernanceError::Validation(ref m) if m.contains("101")));
        assert!(Event::confidence(" ", 50).validate().is_err());
        assert!(Event::from(FileChange::new("src/lib.rs", 1, 0)).validate().is_ok());
    }

    #[test]
    fn test_store_sequences_and_tail() {
        let mut store = EventStore::new();
        for i in 0..5u8 {
            assert_eq!(store.append(Event::confidence(format!("t{i}"), 50)), i as u64);
        }
        let tail = store.last_n(3);
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].seq, 2);
        assert_eq!(store.last_n(10).len(), 5);
    }
}
