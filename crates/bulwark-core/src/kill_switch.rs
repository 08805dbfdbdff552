//! Kill switch monitor
//!
//! Evaluated after every appended event, before the blast radius scope alert
//! is reported. Tool calls performed by the engine are also checked before
//! they reach the transport ([`KillSwitchMonitor::check_pending`]). Five
//! triggers, each sufficient on its own:
//!
//! 1. constitution violation: a hard rule matched without a live override
//! 2. confidence collapse: consecutive low declarations for distinct tasks
//! 3. blast radius exceeded: hard file or line ceiling, or an unexempted
//!    critical file
//! 4. cascade failure: consecutive failed → corrective cycles
//! 5. context confusion: a referenced entity the freshness check cannot resolve
//!
//! A trigger is terminal for its session. Nothing here recovers on its own;
//! a trigger stays open until a resume instruction names it.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{error, info};
use uuid::Uuid;

use crate::blast_radius::BlastRadiusTracker;
use crate::break_glass::BreakGlassRegistry;
use crate::config::{compile_pattern, BlastRadiusSettings, HardRule, KillSwitchSettings, RuleKind};
use crate::error::{GovernanceError, Result};
use crate::events::{Event, RecoveryPhase, SequencedEvent};
use crate::types::{now, SessionId, Timestamp};

/// Number of trailing events kept as evidence
pub const EVIDENCE_EVENTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerKind {
    ConstitutionViolation,
    ConfidenceCollapse,
    BlastRadiusExceeded,
    CascadeFailure,
    ContextConfusion,
}

impl TriggerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerKind::ConstitutionViolation => "CONSTITUTION_VIOLATION",
            TriggerKind::ConfidenceCollapse => "CONFIDENCE_COLLAPSE",
            TriggerKind::BlastRadiusExceeded => "BLAST_RADIUS_EXCEEDED",
            TriggerKind::CascadeFailure => "CASCADE_FAILURE",
            TriggerKind::ContextConfusion => "CONTEXT_CONFUSION",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [
            TriggerKind::ConstitutionViolation,
            TriggerKind::ConfidenceCollapse,
            TriggerKind::BlastRadiusExceeded,
            TriggerKind::CascadeFailure,
            TriggerKind::ContextConfusion,
        ]
        .into_iter()
        .find(|k| k.as_str() == s)
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What tripped, before it is bound to a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tripped {
    pub kind: TriggerKind,
    pub rule: String,
    pub detail: String,
}

impl Tripped {
    fn new(kind: TriggerKind, rule: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            rule: rule.into(),
            detail: detail.into(),
        }
    }
}

/// A recorded kill-switch trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KillSwitchTrigger {
    pub id: String,
    pub kind: TriggerKind,
    pub session: SessionId,
    pub repository: String,
    pub rule: String,
    pub detail: String,
    /// Last events up to and including the one that tripped
    pub evidence: Vec<SequencedEvent>,
    pub at: Timestamp,
}

impl KillSwitchTrigger {
    pub fn new(tripped: Tripped, session: &SessionId, repository: &str, evidence: &[SequencedEvent]) -> Self {
        Self {
            id: format!("ks-{}", Uuid::new_v4()),
            kind: tripped.kind,
            session: session.clone(),
            repository: repository.to_string(),
            rule: tripped.rule,
            detail: tripped.detail,
            evidence: evidence.to_vec(),
            at: now(),
        }
    }
}

/// Structured report emitted on halt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HaltReport {
    pub trigger: KillSwitchTrigger,
    pub events_processed: usize,
    pub resume_instruction: String,
}

impl HaltReport {
    pub fn new(trigger: KillSwitchTrigger, events_processed: usize) -> Self {
        let resume_instruction = format!(
            "review the evidence, then resume with trigger id {} for repository {}",
            trigger.id, trigger.repository
        );
        Self {
            trigger,
            events_processed,
            resume_instruction,
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "{} in session {} ({}): {} [trigger {}]",
            self.trigger.kind, self.trigger.session, self.trigger.rule, self.trigger.detail, self.trigger.id
        )
    }

    pub fn render_text(&self) -> String {
        let mut lines = vec![
            "KILL SWITCH TRIGGERED".to_string(),
            format!("  trigger     {}", self.trigger.id),
            format!("  kind        {}", self.trigger.kind),
            format!("  session     {}", self.trigger.session),
            format!("  repository  {}", self.trigger.repository),
            format!("  rule        {}", self.trigger.rule),
            format!("  detail      {}", self.trigger.detail),
            format!("  events      {} processed", self.events_processed),
            "  evidence:".to_string(),
        ];
        for e in &self.trigger.evidence {
            lines.push(format!("    #{} {}", e.seq, e.event.summary()));
        }
        lines.push(format!("  next step   {}", self.resume_instruction));
        lines.join("\n")
    }
}

/// Resolves entities referenced by actions against the current repository
pub trait FreshnessOracle: Send + Sync {
    fn resolves(&self, entity: &str) -> bool;
}

/// Known paths and symbols of a repository snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepoIndex {
    paths: BTreeSet<String>,
    symbols: BTreeSet<String>,
}

impl RepoIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.paths.extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn with_symbols<I, S>(mut self, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.symbols.extend(symbols.into_iter().map(Into::into));
        self
    }
}

impl FreshnessOracle for RepoIndex {
    fn resolves(&self, entity: &str) -> bool {
        self.paths.contains(entity) || self.symbols.contains(entity)
    }
}

/// Inputs the monitor reads but does not own
pub struct MonitorContext<'a> {
    pub tracker: &'a BlastRadiusTracker,
    pub registry: &'a BreakGlassRegistry,
    pub oracle: Option<&'a dyn FreshnessOracle>,
    pub at: Timestamp,
}

/// Per-session kill switch state
#[derive(Debug, Clone)]
pub struct KillSwitchMonitor {
    settings: KillSwitchSettings,
    max_files: usize,
    max_lines_per_file: u32,
    rules: Vec<(HardRule, Regex)>,
    low_confidence_tasks: Vec<String>,
    failure_pending: bool,
    recovery_cycles: usize,
    created_paths: BTreeSet<String>,
    overrides: BTreeSet<String>,
}

impl KillSwitchMonitor {
    pub fn new(settings: &KillSwitchSettings, blast_radius: &BlastRadiusSettings) -> Result<Self> {
        let rules = settings
            .hard_rules
            .iter()
            .map(|r| Ok((r.clone(), compile_pattern("kill_switch.hard_rules", &r.pattern)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            settings: settings.clone(),
            max_files: blast_radius.max_files_modified,
            max_lines_per_file: blast_radius.max_lines_per_file,
            rules,
            low_confidence_tasks: Vec::new(),
            failure_pending: false,
            recovery_cycles: 0,
            created_paths: BTreeSet::new(),
            overrides: BTreeSet::new(),
        })
    }

    /// Remember a verified override for a rule id or critical path
    pub fn record_override(&mut self, rule: impl Into<String>) {
        self.overrides.insert(rule.into());
    }

    /// Recorded and still backed by an active break-glass record
    fn exempt(&self, rule: &str, ctx: &MonitorContext<'_>) -> bool {
        self.overrides.contains(rule) && ctx.registry.active_for(rule, ctx.at).is_some()
    }

    /// Evaluate one event; the tracker must already have observed it
    pub fn evaluate(&mut self, event: &Event, ctx: &MonitorContext<'_>) -> Option<Tripped> {
        if let Event::FileChange(c) = event {
            if c.created {
                self.created_paths.insert(c.path.clone());
            }
        }

        self.check_constitution(event, ctx)
            .or_else(|| self.check_blast_radius(event, ctx))
            .or_else(|| self.check_confidence(event))
            .or_else(|| self.check_cascade(event))
            .or_else(|| self.check_context(event, ctx))
    }

    /// Triggers decidable before an action is carried out: hard rules and
    /// freshness. Leaves the monitor untouched.
    pub fn check_pending(&self, event: &Event, ctx: &MonitorContext<'_>) -> Option<Tripped> {
        self.check_constitution(event, ctx)
            .or_else(|| self.check_context(event, ctx))
    }

    fn check_constitution(&self, event: &Event, ctx: &MonitorContext<'_>) -> Option<Tripped> {
        let (kind, subject) = match event {
            Event::FileChange(c) => (RuleKind::Path, c.path.as_str()),
            Event::ToolCall(c) => (RuleKind::Tool, c.tool.as_str()),
            Event::ConfidenceDeclaration(_) => return None,
        };
        self.rules
            .iter()
            .filter(|(rule, pattern)| rule.kind == kind && pattern.is_match(subject))
            .find(|(rule, _)| !self.exempt(&rule.id, ctx))
            .map(|(rule, _)| {
                Tripped::new(
                    TriggerKind::ConstitutionViolation,
                    format!("kill_switch.hard_rules.{}", rule.id),
                    format!("'{subject}' violates hard rule {}: {}", rule.id, rule.description),
                )
            })
    }

    fn check_blast_radius(&self, event: &Event, ctx: &MonitorContext<'_>) -> Option<Tripped> {
        let Event::FileChange(change) = event else {
            return None;
        };
        let snapshot = ctx.tracker.snapshot();
        if snapshot.files_touched > self.max_files {
            return Some(Tripped::new(
                TriggerKind::BlastRadiusExceeded,
                "blast_radius.max_files_modified",
                format!(
                    "{} files touched exceeds hard ceiling {}",
                    snapshot.files_touched, self.max_files
                ),
            ));
        }
        if let Some(stats) = ctx.tracker.file(&change.path) {
            if stats.lines > self.max_lines_per_file {
                return Some(Tripped::new(
                    TriggerKind::BlastRadiusExceeded,
                    "blast_radius.max_lines_per_file",
                    format!(
                        "{} has {} lines touched, ceiling is {}",
                        change.path, stats.lines, self.max_lines_per_file
                    ),
                ));
            }
            if stats.critical && !self.exempt(&change.path, ctx) {
                return Some(Tripped::new(
                    TriggerKind::BlastRadiusExceeded,
                    "blast_radius.critical_paths",
                    format!("critical file {} touched without a recorded override", change.path),
                ));
            }
        }
        None
    }

    fn check_confidence(&mut self, event: &Event) -> Option<Tripped> {
        let Event::ConfidenceDeclaration(d) = event else {
            return None;
        };
        if d.value >= self.settings.confidence_floor {
            self.low_confidence_tasks.clear();
            return None;
        }
        // a repeated task replaces its earlier declaration
        self.low_confidence_tasks.retain(|t| t != &d.task_id);
        self.low_confidence_tasks.push(d.task_id.clone());

        let window = self.settings.collapse_window.max(1);
        if self.low_confidence_tasks.len() >= window {
            let tasks = self.low_confidence_tasks[self.low_confidence_tasks.len() - window..].join(", ");
            return Some(Tripped::new(
                TriggerKind::ConfidenceCollapse,
                "kill_switch.confidence_floor",
                format!(
                    "{window} consecutive declarations below {} for distinct tasks ({tasks}); last was {}",
                    self.settings.confidence_floor, d.value
                ),
            ));
        }
        None
    }

    fn check_cascade(&mut self, event: &Event) -> Option<Tripped> {
        if !event.is_action() {
            return None;
        }
        match event.recovery() {
            None => {
                self.failure_pending = false;
                self.recovery_cycles = 0;
            }
            Some(RecoveryPhase::Failed) => self.failure_pending = true,
            Some(RecoveryPhase::Corrective) => {
                if self.failure_pending {
                    self.recovery_cycles += 1;
                    self.failure_pending = false;
                }
            }
        }
        if self.recovery_cycles >= self.settings.cascade_cycles.max(1) {
            return Some(Tripped::new(
                TriggerKind::CascadeFailure,
                "kill_switch.cascade_cycles",
                format!(
                    "{} consecutive failure/correction cycles, limit {}",
                    self.recovery_cycles, self.settings.cascade_cycles
                ),
            ));
        }
        None
    }

    fn check_context(&self, event: &Event, ctx: &MonitorContext<'_>) -> Option<Tripped> {
        let oracle = ctx.oracle?;
        let mut entities: Vec<&str> = event.references().iter().map(String::as_str).collect();
        if let Event::FileChange(c) = event {
            if !self.created_paths.contains(&c.path) {
                entities.insert(0, c.path.as_str());
            }
        }
        entities
            .into_iter()
            .find(|e| !self.created_paths.contains(*e) && !oracle.resolves(e))
            .map(|missing| {
                Tripped::new(
                    TriggerKind::ContextConfusion,
                    "freshness",
                    format!("'{missing}' does not resolve against the current repository snapshot"),
                )
            })
    }
}

/// Explicit clearance of a trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub trigger_id: String,
    pub resolved_by: String,
    pub note: String,
    pub at: Timestamp,
}

/// Open triggers per repository and their resolutions
#[derive(Debug, Clone, Default)]
pub struct TriggerBook {
    open: BTreeMap<String, KillSwitchTrigger>,
    resolutions: Vec<Resolution>,
}

impl TriggerBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted open triggers and past resolutions
    pub fn restore(open: Vec<KillSwitchTrigger>, resolutions: Vec<Resolution>) -> Self {
        Self {
            open: open.into_iter().map(|t| (t.id.clone(), t)).collect(),
            resolutions,
        }
    }

    pub fn record(&mut self, trigger: KillSwitchTrigger) {
        error!(
            trigger = %trigger.id,
            kind = %trigger.kind,
            session = %trigger.session,
            repository = %trigger.repository,
            detail = %trigger.detail,
            "Kill switch triggered"
        );
        self.open.insert(trigger.id.clone(), trigger);
    }

    pub fn unresolved_for(&self, repository: &str) -> Option<&KillSwitchTrigger> {
        self.open.values().find(|t| t.repository == repository)
    }

    pub fn open_triggers(&self) -> impl Iterator<Item = &KillSwitchTrigger> {
        self.open.values()
    }

    pub fn resolutions(&self) -> &[Resolution] {
        &self.resolutions
    }

    /// Clear exactly the named trigger
    pub fn resolve(
        &mut self,
        trigger_id: &str,
        resolved_by: impl Into<String>,
        note: impl Into<String>,
    ) -> Result<(KillSwitchTrigger, Resolution)> {
        let trigger = self
            .open
            .remove(trigger_id)
            .ok_or_else(|| GovernanceError::TriggerMismatch {
                given: trigger_id.to_string(),
            })?;
        let resolution = Resolution {
            trigger_id: trigger.id.clone(),
            resolved_by: resolved_by.into(),
            note: note.into(),
            at: now(),
        };
        info!(trigger = %trigger.id, by = %resolution.resolved_by, "Kill switch trigger resolved");
        self.resolutions.push(resolution.clone());
        Ok((trigger, resolution))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{FileChange, ToolCall};

    struct Harness {
        monitor: KillSwitchMonitor,
        tracker: BlastRadiusTracker,
        registry: BreakGlassRegistry,
        index: Option<RepoIndex>,
    }

    impl Harness {
        fn new() -> Self {
            let br = BlastRadiusSettings::default();
            Self {
                monitor: KillSwitchMonitor::new(&KillSwitchSettings::default(), &br).unwrap(),
                tracker: BlastRadiusTracker::new(&br).unwrap(),
                registry: BreakGlassRegistry::new(),
                index: None,
            }
        }

        fn feed(&mut self, event: Event) -> Option<Tripped> {
            if let Event::FileChange(c) = &event {
                self.tracker.observe(c);
            }
            let ctx = MonitorContext {
                tracker: &self.tracker,
                registry: &self.registry,
                oracle: self.index.as_ref().map(|i| i as &dyn FreshnessOracle),
                at: now(),
            };
            self.monitor.evaluate(&event, &ctx)
        }
    }

    #[test]
    fn test_confidence_collapse() {
        let mut h = Harness::new();
        assert!(h.feed(Event::confidence("t1", 25)).is_none());
        assert!(h.feed(Event::confidence("t2", 20)).is_none());
        let tripped = h.feed(Event::confidence("t3", 28)).unwrap();
        assert_eq!(tripped.kind, TriggerKind::ConfidenceCollapse);
        assert!(tripped.detail.contains("t1, t2, t3"));
    }

    #[test]
    fn test_confidence_recovery_resets_and_tasks_must_differ() {
        let mut h = Harness::new();
        h.feed(Event::confidence("t1", 25));
        h.feed(Event::confidence("t2", 20));
        h.feed(Event::confidence("t3", 30));
        assert!(h.feed(Event::confidence("t4", 10)).is_none());

        let mut h = Harness::new();
        h.feed(Event::confidence("t1", 25));
        h.feed(Event::confidence("t1", 20));
        assert!(h.feed(Event::confidence("t1", 5)).is_none());
        assert!(h.feed(Event::confidence("t2", 5)).is_none());
        assert!(h.feed(Event::confidence("t3", 5)).is_some());
    }

    #[test]
    fn test_hard_ceiling_on_files() {
        let mut h = Harness::new();
        for i in 0..15 {
            assert!(h.feed(FileChange::new(format!("docs/{i}.md"), 1, 0).into()).is_none());
        }
        let tripped = h.feed(FileChange::new("docs/15.md", 1, 0).into()).unwrap();
        assert_eq!(tripped.kind, TriggerKind::BlastRadiusExceeded);
        assert!(tripped.detail.contains("16 files"));
    }

    #[test]
    fn test_line_ceiling_is_cumulative() {
        let mut h = Harness::new();
        assert!(h.feed(FileChange::new("src/big.rs", 150, 0).into()).is_none());
        let tripped = h.feed(FileChange::new("src/big.rs", 40, 20).into()).unwrap();
        assert_eq!(tripped.rule, "blast_radius.max_lines_per_file");
    }

    #[test]
    fn test_critical_file_needs_live_override() {
        let mut h = Harness::new();
        let tripped = h.feed(FileChange::new(".env", 1, 0).into()).unwrap();
        assert_eq!(tripped.rule, "blast_radius.critical_paths");

        let mut h = Harness::new();
        h.registry
            .register(
                crate::break_glass::BreakGlassRecord::new(
                    "sam",
                    "rotate leaked key",
                    ".env",
                    now() - chrono::Duration::minutes(5),
                    chrono::Duration::hours(1),
                )
                .unwrap(),
            )
            .unwrap();
        // a live record alone is not enough without a recorded override
        assert!(h.feed(FileChange::new(".env", 1, 0).into()).is_some());

        let mut h2 = Harness::new();
        h2.registry = h.registry.clone();
        h2.monitor.record_override(".env");
        assert!(h2.feed(FileChange::new(".env", 1, 0).into()).is_none());
    }

    #[test]
    fn test_constitution_rules() {
        let mut h = Harness::new();
        let tripped = h.feed(FileChange::new("CLAUDE.md", 2, 0).into()).unwrap();
        assert_eq!(tripped.kind, TriggerKind::ConstitutionViolation);

        let mut h = Harness::new();
        let tripped = h
            .feed(ToolCall::new("github", "force_push", serde_json::Value::Null).into())
            .unwrap();
        assert!(tripped.rule.ends_with("no-force-push"));
    }

    #[test]
    fn test_pending_call_is_judged_before_it_runs() {
        let mut h = Harness::new();
        h.index = Some(RepoIndex::new().with_paths(["src/lib.rs"]));
        let ctx = MonitorContext {
            tracker: &h.tracker,
            registry: &h.registry,
            oracle: h.index.as_ref().map(|i| i as &dyn FreshnessOracle),
            at: now(),
        };

        let push = Event::from(ToolCall::new("github", "force_push", serde_json::Value::Null));
        let tripped = h.monitor.check_pending(&push, &ctx).unwrap();
        assert_eq!(tripped.kind, TriggerKind::ConstitutionViolation);

        let stale = Event::from(
            ToolCall::new("github", "get_file", serde_json::Value::Null).with_reference("src/removed.rs"),
        );
        assert_eq!(
            h.monitor.check_pending(&stale, &ctx).unwrap().kind,
            TriggerKind::ContextConfusion
        );

        // stateful triggers wait for the appended event
        assert!(h.monitor.check_pending(&Event::confidence("t1", 5), &ctx).is_none());
        let read = Event::from(ToolCall::new("github", "get_file", serde_json::Value::Null));
        assert!(h.monitor.check_pending(&read, &ctx).is_none());
    }

    #[test]
    fn test_cascade_failure_cycles() {
        use RecoveryPhase::*;
        let mut h = Harness::new();
        let call = |phase| Event::from(ToolCall::new("ci", "run_tests", serde_json::Value::Null).with_recovery(phase));
        for _ in 0..2 {
            assert!(h.feed(call(Failed)).is_none());
            assert!(h.feed(call(Corrective)).is_none());
        }
        h.feed(call(Failed));
        let tripped = h.feed(call(Corrective)).unwrap();
        assert_eq!(tripped.kind, TriggerKind::CascadeFailure);
    }

    #[test]
    fn test_untagged_action_breaks_cascade() {
        use RecoveryPhase::*;
        let mut h = Harness::new();
        let call = |phase| Event::from(ToolCall::new("ci", "run_tests", serde_json::Value::Null).with_recovery(phase));
        h.feed(call(Failed));
        h.feed(call(Corrective));
        h.feed(call(Failed));
        h.feed(call(Corrective));
        h.feed(ToolCall::new("ci", "status", serde_json::Value::Null).into());
        h.feed(call(Failed));
        assert!(h.feed(call(Corrective)).is_none());
    }

    #[test]
    fn test_context_confusion() {
        let mut h = Harness::new();
        h.index = Some(RepoIndex::new().with_paths(["src/lib.rs"]).with_symbols(["parse_config"]));

        assert!(h
            .feed(FileChange::new("src/lib.rs", 1, 0).with_reference("parse_config").into())
            .is_none());
        assert!(h.feed(FileChange::new("src/new.rs", 10, 0).created().into()).is_none());
        assert!(h
            .feed(FileChange::new("src/lib.rs", 1, 0).with_reference("src/new.rs").into())
            .is_none());

        let tripped = h.feed(FileChange::new("src/legacy.rs", 1, 1).into()).unwrap();
        assert_eq!(tripped.kind, TriggerKind::ContextConfusion);
        assert!(tripped.detail.contains("src/legacy.rs"));
    }

    #[test]
    fn test_trigger_book_resume_requires_matching_id() {
        let mut book = TriggerBook::new();
        let trigger = KillSwitchTrigger::new(
            Tripped::new(TriggerKind::CascadeFailure, "kill_switch.cascade_cycles", "3 cycles"),
            &SessionId::from("session:x"),
            "acme/api",
            &[],
        );
        let id = trigger.id.clone();
        book.record(trigger);
        assert!(book.unresolved_for("acme/api").is_some());

        let err = book.resolve("ks-unknown", "lee", "ok").unwrap_err();
        assert!(matches!(err, GovernanceError::TriggerMismatch { .. }));
        assert!(book.unresolved_for("acme/api").is_some());

        book.resolve(&id, "lee", "root cause fixed").unwrap();
        assert!(book.unresolved_for("acme/api").is_none());
        assert_eq!(book.resolutions().len(), 1);
    }

    #[test]
    fn test_halt_report_summary_names_kind_and_trigger() {
        let trigger = KillSwitchTrigger::new(
            Tripped::new(TriggerKind::ConfidenceCollapse, "kill_switch.confidence_floor", "3 low"),
            &SessionId::from("session:x"),
            "acme/api",
            &[],
        );
        let report = HaltReport::new(trigger.clone(), 7);
        assert!(report.summary().contains("CONFIDENCE_COLLAPSE"));
        assert!(report.summary().contains(&trigger.id));
        assert!(report.render_text().contains("7 processed"));
    }
}
