//! Governance engine
//!
//! Facade over every component. One engine serves many concurrent sessions:
//!
//! ```text
//! start_session ──► ingest* / execute_tool* ──► close_session
//!       │                    │                       │
//!  knowledge           blast radius            contract validator
//!  checkpoint          tool governor           quality gate
//!  open trigger?       kill switch ──► halt    trust ledger
//!       └──────────────── audit log ◄────────────────┘
//! ```
//!
//! Events of one session are processed in arrival order under the session's
//! own lock. Trust state and rate-limit counters are shared and serialized by
//! their owners. Every decision is recorded in the audit log before it is
//! returned to the caller.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::audit::{AuditDraft, AuditKind, AuditLog, AuditOutcome, AuditSink};
use crate::blast_radius::{BlastRadiusLevel, BlastRadiusSnapshot, BlastRadiusTracker};
use crate::break_glass::{BreakGlassRecord, BreakGlassRegistry};
use crate::config::GovernanceConfig;
use crate::contract::{ContractReport, ContractStatus, ContractValidator};
use crate::error::{GovernanceError, Result};
use crate::events::{Event, ToolCall};
use crate::governor::{CallContext, ToolGovernor, ToolResponse, ToolTransport, WriteCascade};
use crate::kill_switch::{
    FreshnessOracle, HaltReport, KillSwitchMonitor, KillSwitchTrigger, MonitorContext, Resolution,
    TriggerBook, EVIDENCE_EVENTS,
};
use crate::knowledge::{KnowledgeEntry, KnowledgeStore};
use crate::quality::{session_checklist, CheckResult, FileSetScanner, QualityGateScorer, QualityReport, Verdict};
use crate::session::{Session, SessionRequest, SessionState};
use crate::storage::SqliteStore;
use crate::trust::{DemotionCause, SessionEvidence, TrustLedger, TrustState, TrustTransition};
use crate::types::{now, Domain, SessionId};

/// What a caller learns when a session starts
#[derive(Debug, Clone, Serialize)]
pub struct SessionStart {
    pub session: SessionId,
    pub trust: TrustState,
    /// Knowledge still served for the repository
    pub knowledge: Vec<KnowledgeEntry>,
    /// Entries that expired at this start
    pub expired: Vec<KnowledgeEntry>,
}

/// Result of an accepted event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ingested {
    pub seq: u64,
    pub blast_radius: BlastRadiusLevel,
    /// Set when this event crossed into HIGH; further file changes wait for
    /// [`GovernanceEngine::confirm_scope`]
    pub scope_alert: Option<String>,
}

/// Everything decided at session close
#[derive(Debug, Clone, Serialize)]
pub struct SessionOutcome {
    pub session: SessionId,
    pub contract: ContractReport,
    pub blast_radius: BlastRadiusSnapshot,
    pub quality: QualityReport,
    pub trust: TrustState,
    pub transition: Option<TrustTransition>,
}

impl SessionOutcome {
    /// CI exit code: 1 for a FAIL contract or any validation error
    pub fn exit_code(&self) -> i32 {
        self.contract.exit_code()
    }

    pub fn is_clean(&self) -> bool {
        clean_session(&self.contract, &self.quality)
    }
}

fn clean_session(contract: &ContractReport, quality: &QualityReport) -> bool {
    contract.is_mergeable()
        && contract.effective_status() != Some(ContractStatus::Fail)
        && quality.verdict == Verdict::Approve
}

struct SessionSlot {
    session: Session,
    tracker: BlastRadiusTracker,
    monitor: KillSwitchMonitor,
    cascade: WriteCascade,
    halt: Option<HaltReport>,
}

/// Session-level governance over a shared configuration
pub struct GovernanceEngine {
    config: GovernanceConfig,
    validator: ContractValidator,
    governor: ToolGovernor,
    scorer: QualityGateScorer,
    trust: TrustLedger,
    audit: AuditLog,
    sessions: RwLock<HashMap<SessionId, Arc<Mutex<SessionSlot>>>>,
    triggers: Mutex<TriggerBook>,
    registry: RwLock<BreakGlassRegistry>,
    knowledge: Mutex<KnowledgeStore>,
    oracle: Option<Arc<dyn FreshnessOracle>>,
    store: Option<Arc<SqliteStore>>,
}

impl std::fmt::Debug for GovernanceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GovernanceEngine")
            .field("sessions", &self.sessions.read().len())
            .field("audit_entries", &self.audit.len())
            .field("durable", &self.store.is_some())
            .finish()
    }
}

impl GovernanceEngine {
    /// In-memory engine
    pub fn new(config: GovernanceConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            validator: ContractValidator::new(config.contract.confidence_ceiling),
            governor: ToolGovernor::new(&config.mcp)?,
            scorer: QualityGateScorer::new(&config.quality),
            trust: TrustLedger::new(&config.trust),
            audit: AuditLog::new(),
            sessions: RwLock::new(HashMap::new()),
            triggers: Mutex::new(TriggerBook::new()),
            registry: RwLock::new(BreakGlassRegistry::new()),
            knowledge: Mutex::new(KnowledgeStore::new()),
            oracle: None,
            store: None,
            config,
        })
    }

    /// Engine whose audit log, trust ledger, open triggers and break-glass
    /// records live in `store`
    pub fn with_store(config: GovernanceConfig, store: Arc<SqliteStore>) -> Result<Self> {
        let mut engine = Self::new(config)?;
        engine.audit = AuditLog::resume_from(store.load_audit(None)?)?;
        engine.audit.add_sink(store.clone() as Arc<dyn AuditSink>);
        engine.trust = TrustLedger::with_repository(&engine.config.trust, store.clone())?;
        engine.triggers = Mutex::new(store.load_trigger_book()?);
        engine.registry = RwLock::new(store.load_break_glass()?);
        info!(
            audit_entries = engine.audit.len(),
            open_triggers = engine.triggers.lock().open_triggers().count(),
            "Governance engine restored from store"
        );
        engine.store = Some(store);
        Ok(engine)
    }

    /// Resolve referenced entities for the context-confusion trigger
    pub fn with_oracle(mut self, oracle: Arc<dyn FreshnessOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn with_knowledge(mut self, knowledge: KnowledgeStore) -> Self {
        self.knowledge = Mutex::new(knowledge);
        self
    }

    pub fn with_break_glass(self, registry: BreakGlassRegistry) -> Result<Self> {
        if let Some(store) = &self.store {
            for record in registry.records() {
                store.save_break_glass(record)?;
            }
        }
        *self.registry.write() = registry;
        Ok(self)
    }

    pub fn config(&self) -> &GovernanceConfig {
        &self.config
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn trust(&self) -> &TrustLedger {
        &self.trust
    }

    pub fn governor(&self) -> &ToolGovernor {
        &self.governor
    }

    fn slot(&self, id: &SessionId) -> Result<Arc<Mutex<SessionSlot>>> {
        self.sessions
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| GovernanceError::SessionNotFound(id.to_string()))
    }

    /// Snapshot of a session, including its events
    pub fn session(&self, id: &SessionId) -> Result<Session> {
        Ok(self.slot(id)?.lock().session.clone())
    }

    pub fn blast_radius(&self, id: &SessionId) -> Result<BlastRadiusSnapshot> {
        Ok(self.slot(id)?.lock().tracker.snapshot())
    }

    pub fn halt_report(&self, id: &SessionId) -> Result<Option<HaltReport>> {
        Ok(self.slot(id)?.lock().halt.clone())
    }

    pub fn open_triggers(&self) -> Vec<KillSwitchTrigger> {
        self.triggers.lock().open_triggers().cloned().collect()
    }

    pub fn unresolved_trigger(&self, repository: &str) -> Option<KillSwitchTrigger> {
        self.triggers.lock().unresolved_for(repository).cloned()
    }

    pub fn break_glass(&self) -> BreakGlassRegistry {
        self.registry.read().clone()
    }

    pub fn knowledge(&self, repository: &str) -> Vec<KnowledgeEntry> {
        self.knowledge
            .lock()
            .active(repository)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn knowledge_store(&self) -> KnowledgeStore {
        self.knowledge.lock().clone()
    }

    pub fn remember(&self, entry: KnowledgeEntry) -> Result<KnowledgeEntry> {
        Ok(self.knowledge.lock().add(entry)?.clone())
    }

    /// Record a new break-glass window
    pub fn register_break_glass(&self, record: BreakGlassRecord) -> Result<()> {
        self.registry.write().register(record.clone())?;
        if let Some(store) = &self.store {
            store.save_break_glass(&record)?;
        }
        self.audit.record(
            AuditDraft::new(
                AuditKind::OverrideRecorded,
                AuditOutcome::Info,
                format!(
                    "break-glass {} by {} for '{}' until {}",
                    record.id, record.activator, record.rule_overridden, record.ends_at
                ),
            )
            .rule(record.rule_overridden.clone()),
        )?;
        self.audit.flush()?;
        Ok(())
    }

    /// Close the mandatory review of a break-glass record
    pub fn review_break_glass(&self, id: &str, resolution: &str) -> Result<BreakGlassRecord> {
        let record = {
            let mut registry = self.registry.write();
            registry.mark_reviewed(id, resolution)?;
            registry
                .get(id)
                .cloned()
                .ok_or_else(|| GovernanceError::BreakGlass(format!("no record with id {id}")))?
        };
        if let Some(store) = &self.store {
            store.save_break_glass(&record)?;
        }
        self.audit.record(
            AuditDraft::new(
                AuditKind::OverrideRecorded,
                AuditOutcome::Accepted,
                format!("break-glass {} reviewed: {resolution}", record.id),
            )
            .rule(record.rule_overridden.clone()),
        )?;
        self.audit.flush()?;
        Ok(record)
    }

    /// Open a session. Refused while the repository has an unresolved
    /// kill-switch trigger.
    pub fn start_session(&self, request: SessionRequest) -> Result<SessionStart> {
        if let Some(trigger) = self.unresolved_trigger(&request.repository) {
            let err = GovernanceError::UnresolvedTrigger {
                trigger_id: trigger.id.clone(),
                kind: trigger.kind.to_string(),
                repository: request.repository.clone(),
            };
            warn!(repository = %request.repository, trigger = %trigger.id, "Session refused");
            self.audit.record(
                AuditDraft::new(AuditKind::SessionStarted, AuditOutcome::Rejected, err.to_string())
                    .repository(&request.repository)
                    .rule(trigger.kind.as_str()),
            )?;
            self.audit.flush()?;
            return Err(err);
        }

        let at = now();
        let (expired, active) = {
            let mut knowledge = self.knowledge.lock();
            let expired = knowledge.checkpoint(&request.repository, at);
            let active: Vec<KnowledgeEntry> = knowledge
                .active(&request.repository)
                .into_iter()
                .cloned()
                .collect();
            (expired, active)
        };

        let slot = SessionSlot {
            tracker: BlastRadiusTracker::new(&self.config.blast_radius)?,
            monitor: KillSwitchMonitor::new(&self.config.kill_switch, &self.config.blast_radius)?,
            cascade: WriteCascade::default(),
            halt: None,
            session: Session::new(request),
        };
        let session = &slot.session;
        let id = session.id.clone();
        let trust = self.trust.state(&session.repository, session.domain);

        for entry in &expired {
            self.audit.record(
                AuditDraft::new(
                    AuditKind::KnowledgeExpired,
                    AuditOutcome::Info,
                    format!("{} ({:?}) expired: {}", entry.id, entry.category, entry.content),
                )
                .session(&id, &session.repository),
            )?;
        }
        self.audit.record(
            AuditDraft::new(
                AuditKind::SessionStarted,
                AuditOutcome::Accepted,
                format!(
                    "agent {} ({}) in domain {} at trust level {} ({})",
                    session.agent.name,
                    session.agent.role,
                    session.domain.as_str(),
                    trust.level.value(),
                    trust.level.review_depth()
                ),
            )
            .session(&id, &session.repository),
        )?;
        info!(
            session = %id,
            repository = %session.repository,
            agent = %session.agent.name,
            domain = %session.domain.as_str(),
            trust_level = trust.level.value(),
            "Session started"
        );

        self.sessions.write().insert(id.clone(), Arc::new(Mutex::new(slot)));
        Ok(SessionStart {
            session: id,
            trust,
            knowledge: active,
            expired,
        })
    }

    fn refuse_event(&self, session: &Session, event: &Event, err: &GovernanceError, rule: &str) -> Result<()> {
        self.audit.record(
            AuditDraft::new(
                AuditKind::EventRejected,
                AuditOutcome::Rejected,
                format!("{}: {err}", event.summary()),
            )
            .session(&session.id, &session.repository)
            .rule(rule),
        )?;
        Ok(())
    }

    /// Feed one event. Tool calls pass the governor first; file changes are
    /// held back while a scope alert waits for confirmation. The kill switch
    /// is evaluated after the event is appended.
    pub fn ingest(&self, id: &SessionId, event: Event) -> Result<Ingested> {
        let slot = self.slot(id)?;
        let mut slot = slot.lock();

        if let Err(err) = slot.session.ensure_open() {
            self.refuse_event(&slot.session, &event, &err, "session.closed")?;
            return Err(err);
        }
        if let Err(err) = event.validate() {
            self.refuse_event(&slot.session, &event, &err, "events.schema")?;
            return Err(err);
        }

        match &event {
            Event::ToolCall(call) => {
                self.halt_if_pending_trips(&mut slot, &event)?;
                let SessionSlot {
                    session, cascade, ..
                } = &mut *slot;
                let ctx = CallContext {
                    session: &session.id,
                    repository: &session.repository,
                    role: &session.agent.role,
                    scope: &session.scope,
                };
                self.governor.admit_recorded(&ctx, cascade, call, &self.audit)?;
            }
            Event::FileChange(_) if slot.tracker.awaiting_confirmation() => {
                let err = GovernanceError::ScopeAlert(format!(
                    "blast radius is {} and awaits confirmation; file change refused",
                    slot.tracker.level()
                ));
                self.refuse_event(&slot.session, &event, &err, "blast_radius.scope_alert")?;
                return Err(err);
            }
            _ => {}
        }

        self.accept(&mut slot, event)
    }

    /// Append, observe, evaluate the kill switch, record
    fn accept(&self, slot: &mut SessionSlot, event: Event) -> Result<Ingested> {
        let seq = slot.session.append(event.clone())?;
        let observation = match &event {
            Event::FileChange(change) => Some(slot.tracker.observe(change)),
            _ => None,
        };

        let tripped = {
            let registry = self.registry.read();
            let ctx = MonitorContext {
                tracker: &slot.tracker,
                registry: &registry,
                oracle: self.oracle.as_deref(),
                at: now(),
            };
            slot.monitor.evaluate(&event, &ctx)
        };

        if let Some(tripped) = tripped {
            let trigger = KillSwitchTrigger::new(
                tripped,
                &slot.session.id,
                &slot.session.repository,
                slot.session.events.last_n(EVIDENCE_EVENTS),
            );
            return Err(self.halt(slot, trigger));
        }

        self.audit.record(
            AuditDraft::new(AuditKind::EventAccepted, AuditOutcome::Accepted, event.summary())
                .session(&slot.session.id, &slot.session.repository),
        )?;

        let scope_alert = observation.and_then(|o| o.scope_alert);
        if let Some(reason) = &scope_alert {
            self.audit.record(
                AuditDraft::new(AuditKind::ScopeAlert, AuditOutcome::Alert, reason.clone())
                    .session(&slot.session.id, &slot.session.repository)
                    .rule("blast_radius.scope_alert"),
            )?;
        }

        Ok(Ingested {
            seq,
            blast_radius: slot.tracker.level(),
            scope_alert,
        })
    }

    /// Hard rules and freshness for an action that has not happened yet. On a
    /// match the action is kept as evidence and the session halts.
    fn halt_if_pending_trips(&self, slot: &mut SessionSlot, event: &Event) -> Result<()> {
        let tripped = {
            let registry = self.registry.read();
            let ctx = MonitorContext {
                tracker: &slot.tracker,
                registry: &registry,
                oracle: self.oracle.as_deref(),
                at: now(),
            };
            slot.monitor.check_pending(event, &ctx)
        };
        let Some(tripped) = tripped else {
            return Ok(());
        };
        slot.session.append(event.clone())?;
        let trigger = KillSwitchTrigger::new(
            tripped,
            &slot.session.id,
            &slot.session.repository,
            slot.session.events.last_n(EVIDENCE_EVENTS),
        );
        Err(self.halt(slot, trigger))
    }

    /// A session that ended without closing breaks its domain's clean streak
    fn break_streak(&self, session: &Session, reason: &str) -> Result<()> {
        let evidence = SessionEvidence {
            clean: false,
            checks_passing: false,
        };
        self.trust.record_session(&session.repository, session.domain, evidence)?;
        self.audit.record(
            AuditDraft::new(
                AuditKind::TrustTransition,
                AuditOutcome::Info,
                format!("{} clean streak reset: {reason}", session.domain.as_str()),
            )
            .session(&session.id, &session.repository)
            .rule("trust.consecutive_clean"),
        )?;
        Ok(())
    }

    /// Close the session on a trigger and return the error the caller sees
    fn halt(&self, slot: &mut SessionSlot, trigger: KillSwitchTrigger) -> GovernanceError {
        slot.session.finish(SessionState::Halted);
        self.governor.end_session(&slot.session.id);
        let report = HaltReport::new(trigger.clone(), slot.session.events.len());

        let persisted = self
            .store
            .as_ref()
            .map_or(Ok(()), |store| store.save_trigger(&trigger).map_err(GovernanceError::from));
        self.triggers.lock().record(trigger.clone());

        let recorded = self
            .audit
            .record(
                AuditDraft::new(AuditKind::KillSwitch, AuditOutcome::Halted, report.summary())
                    .session(&slot.session.id, &slot.session.repository)
                    .rule(trigger.rule.clone()),
            )
            .and_then(|_| self.break_streak(&slot.session, &format!("halted by {}", trigger.kind)))
            .and_then(|_| self.audit.flush());

        slot.halt = Some(report.clone());
        match persisted.and(recorded) {
            Ok(_) => GovernanceError::KillSwitchTriggered(Box::new(report)),
            Err(e) => e.context(format!("persisting kill switch trigger {}", trigger.id)),
        }
    }

    /// Perform a tool call through `transport` and record it as an event.
    ///
    /// Admission (kill switch hard rules and freshness, then the governor's
    /// checks) happens under the session lock, so the write cascade and rate
    /// limit slot are taken before the transport is awaited. The lock is not
    /// held across the call.
    pub async fn execute_tool(
        &self,
        id: &SessionId,
        call: ToolCall,
        transport: &dyn ToolTransport,
    ) -> Result<ToolResponse> {
        let slot = self.slot(id)?;
        let (session_id, repository, role, scope, admission) = {
            let mut guard = slot.lock();
            let pending = Event::ToolCall(call.clone());
            if let Err(err) = guard.session.ensure_open() {
                self.refuse_event(&guard.session, &pending, &err, "session.closed")?;
                return Err(err);
            }
            self.halt_if_pending_trips(&mut guard, &pending)?;

            let SessionSlot {
                session, cascade, ..
            } = &mut *guard;
            let ctx = CallContext {
                session: &session.id,
                repository: &session.repository,
                role: &session.agent.role,
                scope: &session.scope,
            };
            let admission = self.governor.reserve(&ctx, cascade, &call, &self.audit)?;
            (
                session.id.clone(),
                session.repository.clone(),
                session.agent.role.clone(),
                session.scope.clone(),
                admission,
            )
        };

        let ctx = CallContext {
            session: &session_id,
            repository: &repository,
            role: &role,
            scope: &scope,
        };
        let response = self
            .governor
            .perform(&ctx, admission, &call, transport, &self.audit)
            .await?;

        let mut guard = slot.lock();
        self.accept(&mut guard, Event::ToolCall(call.with_response_bytes(response.bytes)))?;
        Ok(response)
    }

    /// Human confirmation of a HIGH blast radius
    pub fn confirm_scope(&self, id: &SessionId, confirmed_by: &str) -> Result<BlastRadiusSnapshot> {
        let slot = self.slot(id)?;
        let mut slot = slot.lock();
        slot.session.ensure_open()?;
        slot.tracker.confirm();
        let snapshot = slot.tracker.snapshot();
        self.audit.record(
            AuditDraft::new(
                AuditKind::ScopeConfirmed,
                AuditOutcome::Accepted,
                format!(
                    "{confirmed_by} confirmed {} blast radius ({} files)",
                    snapshot.level, snapshot.files_touched
                ),
            )
            .session(&slot.session.id, &slot.session.repository),
        )?;
        Ok(snapshot)
    }

    /// Exempt a hard rule or critical path for this session. Only accepted
    /// while an active break-glass record names it.
    pub fn record_override(&self, id: &SessionId, rule: &str) -> Result<BreakGlassRecord> {
        let slot = self.slot(id)?;
        let mut slot = slot.lock();
        slot.session.ensure_open()?;

        let verified = self.registry.read().verify_override(rule, now()).cloned();
        match verified {
            Ok(record) => {
                slot.monitor.record_override(rule);
                self.audit.record(
                    AuditDraft::new(
                        AuditKind::OverrideRecorded,
                        AuditOutcome::Accepted,
                        format!("override backed by {} ({}) until {}", record.id, record.activator, record.ends_at),
                    )
                    .session(&slot.session.id, &slot.session.repository)
                    .rule(rule),
                )?;
                Ok(record)
            }
            Err(err) => {
                self.audit.record(
                    AuditDraft::new(AuditKind::OverrideRecorded, AuditOutcome::Rejected, err.to_string())
                        .session(&slot.session.id, &slot.session.repository)
                        .rule(rule),
                )?;
                Err(err)
            }
        }
    }

    /// Record the output contract, score the session and update trust.
    ///
    /// `extra_checks` are appended to the checklist derived from the contract
    /// and the blast radius (test coverage, docs, scanner output).
    pub fn close_session(
        &self,
        id: &SessionId,
        contract: &Value,
        extra_checks: Vec<CheckResult>,
    ) -> Result<SessionOutcome> {
        let slot = self.slot(id)?;
        let mut slot = slot.lock();
        slot.session.ensure_open()?;

        let (session_id, repository, domain) = (
            slot.session.id.clone(),
            slot.session.repository.clone(),
            slot.session.domain,
        );

        let report = self.validator.validate(format!("session {session_id}"), contract);
        let contract_draft = match report.errors.first() {
            None => AuditDraft::new(
                AuditKind::ContractValidated,
                AuditOutcome::Accepted,
                format!(
                    "status {}",
                    report.effective_status().map_or("unknown", ContractStatus::as_str)
                ),
            ),
            Some(first) => AuditDraft::new(
                AuditKind::ContractValidated,
                AuditOutcome::Rejected,
                report
                    .errors
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; "),
            )
            .rule(first.check_id()),
        };
        self.audit.record(contract_draft.session(&session_id, &repository))?;
        if let Some(downgrade) = &report.downgrade {
            self.audit.record(
                AuditDraft::new(AuditKind::ContractValidated, AuditOutcome::Alert, downgrade.reason.clone())
                    .session(&session_id, &repository)
                    .rule("contract.status_downgrade"),
            )?;
        }

        let blast_radius = slot.tracker.snapshot();
        let mut checks = session_checklist(&report, &blast_radius);
        checks.extend(extra_checks);
        let quality = self.scorer.score(checks);
        let quality_draft = match &quality.override_reason {
            None => AuditDraft::new(
                AuditKind::QualityScored,
                AuditOutcome::Info,
                format!("{} score {} / 100, verdict {}", quality.report_id, quality.score, quality.verdict),
            ),
            Some(reason) => AuditDraft::new(
                AuditKind::QualityScored,
                AuditOutcome::Rejected,
                format!(
                    "{} score {} / 100, verdict REJECT (forced: {reason})",
                    quality.report_id, quality.score
                ),
            )
            .rule("quality.security_failure_forces_reject"),
        };
        self.audit.record(quality_draft.session(&session_id, &repository))?;

        let evidence = SessionEvidence {
            clean: clean_session(&report, &quality),
            checks_passing: quality.failed().next().is_none(),
        };
        let transition = self.trust.record_session(&repository, domain, evidence)?;
        if let Some(t) = &transition {
            self.audit.record(
                AuditDraft::new(
                    AuditKind::TrustTransition,
                    AuditOutcome::Accepted,
                    format!("{} {} -> {}: {}", t.domain.as_str(), t.from.value(), t.to.value(), t.reason),
                )
                .session(&session_id, &repository)
                .rule("trust.promotion_thresholds"),
            )?;
        }
        let trust = self.trust.state(&repository, domain);

        slot.session.contract = Some(contract.clone());
        slot.session.finish(SessionState::Closed);
        self.governor.end_session(&session_id);
        self.audit.record(
            AuditDraft::new(
                AuditKind::SessionClosed,
                AuditOutcome::Accepted,
                format!(
                    "{} events, exit code {}, trust level {}",
                    slot.session.events.len(),
                    report.exit_code(),
                    trust.level.value()
                ),
            )
            .session(&session_id, &repository),
        )?;
        self.audit.flush()?;

        info!(
            session = %session_id,
            score = quality.score,
            verdict = %quality.verdict,
            clean = evidence.clean,
            "Session closed"
        );

        Ok(SessionOutcome {
            session: session_id,
            contract: report,
            blast_radius,
            quality,
            trust,
            transition,
        })
    }

    /// External cancellation; pending audit entries are flushed
    pub fn cancel_session(&self, id: &SessionId, reason: &str) -> Result<()> {
        let slot = self.slot(id)?;
        let mut slot = slot.lock();
        slot.session.ensure_open()?;
        slot.session.finish(SessionState::Cancelled);
        self.governor.end_session(&slot.session.id);
        self.audit.record(
            AuditDraft::new(AuditKind::SessionCancelled, AuditOutcome::Info, reason)
                .session(&slot.session.id, &slot.session.repository),
        )?;
        self.break_streak(&slot.session, "session cancelled")?;
        self.audit.flush()?;
        warn!(session = %slot.session.id, reason, "Session cancelled");
        Ok(())
    }

    /// Clear exactly the trigger named by a human resume instruction
    pub fn resume(&self, trigger_id: &str, resolved_by: &str, note: &str) -> Result<Resolution> {
        let resolved = self.triggers.lock().resolve(trigger_id, resolved_by, note);
        let (trigger, resolution) = match resolved {
            Ok(pair) => pair,
            Err(err) => {
                self.audit.record(
                    AuditDraft::new(AuditKind::Resume, AuditOutcome::Rejected, err.to_string())
                        .rule("kill_switch.resume"),
                )?;
                self.audit.flush()?;
                return Err(err);
            }
        };
        if let Some(store) = &self.store {
            store.save_resolution(&resolution)?;
        }
        self.audit.record(
            AuditDraft::new(
                AuditKind::Resume,
                AuditOutcome::Accepted,
                format!("{} ({}) cleared by {resolved_by}: {note}", trigger.id, trigger.kind),
            )
            .session(&trigger.session, &trigger.repository)
            .rule(trigger.kind.as_str()),
        )?;
        self.audit.flush()?;
        Ok(resolution)
    }

    /// A shipped problem found after the fact; demotes trust
    pub fn report_incident(
        &self,
        repository: &str,
        domain: Domain,
        cause: DemotionCause,
        detail: &str,
    ) -> Result<Vec<TrustTransition>> {
        let transitions = self.trust.demote(repository, domain, cause, detail)?;
        self.audit.record(
            AuditDraft::new(
                AuditKind::Incident,
                AuditOutcome::Alert,
                format!("{cause} in {}: {detail}", domain.as_str()),
            )
            .repository(repository)
            .rule(cause.as_str()),
        )?;
        for t in &transitions {
            self.audit.record(
                AuditDraft::new(
                    AuditKind::TrustTransition,
                    AuditOutcome::Accepted,
                    format!("{} {} -> {}: {}", t.domain.as_str(), t.from.value(), t.to.value(), t.reason),
                )
                .repository(repository)
                .rule(cause.as_str()),
            )?;
        }
        self.audit.flush()?;
        Ok(transitions)
    }

    /// Score an arbitrary file set outside any session
    pub fn evaluate_on_demand(&self, files: &[(String, String)]) -> Result<QualityReport> {
        let checks = FileSetScanner::new(self.config.quality.max_file_lines).scan(files);
        let report = self.scorer.score(checks);
        self.audit.record(AuditDraft::new(
            AuditKind::QualityScored,
            AuditOutcome::Info,
            format!(
                "{} on-demand over {} files: score {} / 100, verdict {}",
                report.report_id,
                files.len(),
                report.score,
                report.verdict
            ),
        ))?;
        self.audit.flush()?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::FileChange;
    use crate::kill_switch::{RepoIndex, TriggerKind};
    use crate::knowledge::{Expiry, KnowledgeCategory};
    use crate::session::AgentIdentity;
    use crate::trust::TrustLevel;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    fn engine() -> GovernanceEngine {
        let config = GovernanceConfig::new()
            .with_allowed_server("implementer", "github")
            .with_server("github", "api.github.com", Some(10));
        GovernanceEngine::new(config).unwrap()
    }

    fn request(repo: &str) -> SessionRequest {
        SessionRequest::new(repo, AgentIdentity::new("builder", "implementer"), Domain::CodeGeneration)
    }

    fn contract(session: &SessionId) -> Value {
        json!({
            "status": "PASS",
            "session": session.as_str(),
            "date": "2026-05-01",
            "model": "model-x",
            "files_changed": [{"path": "src/lib.rs", "operation": "modified"}],
            "confidence": 80,
            "not_verified": [],
            "architectural_impact": "low",
            "requires_review": false,
            "requires_review_reason": null
        })
    }

    #[test]
    fn test_clean_session_lifecycle() {
        let engine = engine();
        let start = engine.start_session(request("acme/api")).unwrap();
        assert_eq!(start.trust.level, TrustLevel::FullReview);

        let id = start.session;
        engine.ingest(&id, FileChange::new("src/lib.rs", 10, 2).into()).unwrap();
        engine.ingest(&id, Event::confidence("t1", 80)).unwrap();

        let outcome = engine.close_session(&id, &contract(&id), Vec::new()).unwrap();
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(outcome.quality.score, 100);
        assert!(outcome.is_clean());
        assert_eq!(outcome.trust.consecutive_clean, 1);

        let err = engine.ingest(&id, Event::confidence("t2", 80)).unwrap_err();
        assert!(matches!(err, GovernanceError::SessionClosed { .. }));
        engine.audit().verify().unwrap();
    }

    #[test]
    fn test_halt_blocks_session_and_repository_until_resume() {
        let engine = engine();
        let id = engine.start_session(request("acme/api")).unwrap().session;
        engine.ingest(&id, Event::confidence("t1", 25)).unwrap();
        engine.ingest(&id, Event::confidence("t2", 20)).unwrap();
        let err = engine.ingest(&id, Event::confidence("t3", 28)).unwrap_err();

        let GovernanceError::KillSwitchTriggered(report) = err else {
            panic!("expected a halt");
        };
        assert_eq!(report.trigger.kind, TriggerKind::ConfidenceCollapse);
        assert_eq!(report.trigger.evidence.len(), 3);
        assert_eq!(engine.session(&id).unwrap().state, SessionState::Halted);

        assert!(engine.ingest(&id, Event::confidence("t4", 90)).is_err());
        assert_eq!(engine.session(&id).unwrap().events.len(), 3);

        let refused = engine.start_session(request("acme/api")).unwrap_err();
        assert!(matches!(refused, GovernanceError::UnresolvedTrigger { .. }));
        assert!(engine.start_session(request("acme/web")).is_ok());

        assert!(engine.resume("ks-wrong", "sam", "looked").is_err());
        engine.resume(&report.trigger.id, "sam", "reviewed evidence").unwrap();
        assert!(engine.start_session(request("acme/api")).is_ok());
    }

    #[test]
    fn test_scope_alert_holds_file_changes_until_confirmed() {
        let engine = engine();
        let id = engine.start_session(request("acme/api")).unwrap().session;
        let mut alert = None;
        for i in 0..11 {
            let ingested = engine
                .ingest(&id, FileChange::new(format!("docs/{i}.md"), 1, 0).into())
                .unwrap();
            alert = alert.or(ingested.scope_alert);
        }
        assert!(alert.is_some());

        let err = engine.ingest(&id, FileChange::new("docs/11.md", 1, 0).into()).unwrap_err();
        assert!(matches!(err, GovernanceError::ScopeAlert(_)));
        assert!(err.is_recoverable());
        // declarations are not file changes
        engine.ingest(&id, Event::confidence("t1", 70)).unwrap();

        engine.confirm_scope(&id, "lead").unwrap();
        engine.ingest(&id, FileChange::new("docs/11.md", 1, 0).into()).unwrap();
    }

    #[test]
    fn test_rejected_tool_call_is_not_appended() {
        let engine = engine();
        let id = engine.start_session(request("acme/api")).unwrap().session;
        let err = engine
            .ingest(&id, ToolCall::new("slack", "post_message", Value::Null).into())
            .unwrap_err();
        assert!(matches!(err, GovernanceError::ToolRejected { .. }));
        assert!(engine.session(&id).unwrap().events.is_empty());

        engine
            .ingest(&id, ToolCall::new("github", "get_file", Value::Null).into())
            .unwrap();
        assert_eq!(engine.session(&id).unwrap().events.len(), 1);
    }

    #[test]
    fn test_override_requires_live_break_glass() {
        let engine = engine();
        let id = engine.start_session(request("acme/api")).unwrap().session;
        assert!(engine.record_override(&id, ".env").is_err());

        engine
            .register_break_glass(
                BreakGlassRecord::new(
                    "sam",
                    "rotate leaked key",
                    ".env",
                    now() - chrono::Duration::minutes(1),
                    chrono::Duration::hours(2),
                )
                .unwrap(),
            )
            .unwrap();
        engine.record_override(&id, ".env").unwrap();
        let ingested = engine.ingest(&id, FileChange::new(".env", 1, 1).into()).unwrap();
        assert_eq!(ingested.blast_radius, BlastRadiusLevel::High);
    }

    #[test]
    fn test_context_confusion_with_oracle() {
        let index = RepoIndex::new().with_paths(["src/lib.rs"]);
        let engine = engine().with_oracle(Arc::new(index));
        let id = engine.start_session(request("acme/api")).unwrap().session;
        engine.ingest(&id, FileChange::new("src/lib.rs", 1, 0).into()).unwrap();
        let err = engine
            .ingest(&id, FileChange::new("src/gone.rs", 1, 0).into())
            .unwrap_err();
        assert!(err.is_terminal());
    }

    #[test]
    fn test_knowledge_checkpoint_runs_at_session_start() {
        let mut store = KnowledgeStore::new();
        store
            .add(KnowledgeEntry::new(
                "acme/api",
                KnowledgeCategory::OpenThread,
                "flaky integration test",
                now(),
                Expiry::AfterSessions(1),
            ))
            .unwrap();
        let engine = engine().with_knowledge(store);
        let start = engine.start_session(request("acme/api")).unwrap();
        assert_eq!(start.expired.len(), 1);
        assert!(start.knowledge.is_empty());
        assert!(engine
            .audit()
            .entries()
            .iter()
            .any(|e| e.kind == AuditKind::KnowledgeExpired));
    }

    #[test]
    fn test_cancel_flushes_and_closes() {
        let engine = engine();
        let id = engine.start_session(request("acme/api")).unwrap().session;
        engine.cancel_session(&id, "operator abort").unwrap();
        assert_eq!(engine.session(&id).unwrap().state, SessionState::Cancelled);
        assert_eq!(engine.audit().pending(), 0);
        assert!(engine.close_session(&id, &contract(&id), Vec::new()).is_err());
    }

    fn run_clean_session(engine: &GovernanceEngine) -> Option<TrustTransition> {
        let id = engine.start_session(request("acme/api")).unwrap().session;
        engine.ingest(&id, FileChange::new("src/lib.rs", 3, 1).into()).unwrap();
        let outcome = engine.close_session(&id, &contract(&id), Vec::new()).unwrap();
        assert!(outcome.is_clean());
        outcome.transition
    }

    #[test]
    fn test_halt_between_clean_sessions_resets_the_streak() {
        let engine = engine();
        for _ in 0..4 {
            assert!(run_clean_session(&engine).is_none());
        }

        let id = engine.start_session(request("acme/api")).unwrap().session;
        engine.ingest(&id, Event::confidence("t1", 25)).unwrap();
        engine.ingest(&id, Event::confidence("t2", 20)).unwrap();
        let Err(GovernanceError::KillSwitchTriggered(report)) = engine.ingest(&id, Event::confidence("t3", 28)) else {
            panic!("expected a halt");
        };
        let state = engine.trust().state("acme/api", Domain::CodeGeneration);
        assert_eq!(state.consecutive_clean, 0);
        assert!(engine
            .audit()
            .entries()
            .iter()
            .any(|e| e.kind == AuditKind::TrustTransition && e.rule.as_deref() == Some("trust.consecutive_clean")));

        engine.resume(&report.trigger.id, "sam", "reviewed evidence").unwrap();
        assert!(run_clean_session(&engine).is_none());
        let state = engine.trust().state("acme/api", Domain::CodeGeneration);
        assert_eq!(state.level, TrustLevel::FullReview);
        assert_eq!(state.consecutive_clean, 1);
    }

    #[test]
    fn test_cancel_resets_the_streak() {
        let engine = engine();
        run_clean_session(&engine);
        run_clean_session(&engine);
        let id = engine.start_session(request("acme/api")).unwrap().session;
        engine.cancel_session(&id, "operator abort").unwrap();
        assert_eq!(
            engine.trust().state("acme/api", Domain::CodeGeneration).consecutive_clean,
            0
        );
    }

    #[test]
    fn test_out_of_range_confidence_is_refused() {
        let engine = engine();
        let id = engine.start_session(request("acme/api")).unwrap().session;
        let err = engine.ingest(&id, Event::confidence("t1", 140)).unwrap_err();
        assert!(matches!(err, GovernanceError::Validation(_)));
        assert!(engine.session(&id).unwrap().events.is_empty());
        assert!(engine
            .audit()
            .entries()
            .iter()
            .any(|e| e.kind == AuditKind::EventRejected && e.rule.as_deref() == Some("events.schema")));
    }

    #[test]
    fn test_incident_demotes_and_is_audited() {
        let engine = engine();
        let transitions = engine
            .report_incident("acme/api", Domain::Security, DemotionCause::ShippedSecurityIssue, "token in logs")
            .unwrap();
        // everything is already at level 1
        assert_eq!(transitions.len(), 1);
        assert!(engine.audit().entries().iter().any(|e| e.kind == AuditKind::Incident));
    }

    struct Echo;

    #[async_trait]
    impl ToolTransport for Echo {
        async fn invoke(&self, _server: &str, _tool: &str, args: &Value) -> anyhow::Result<Value> {
            Ok(args.clone())
        }
    }

    #[tokio::test]
    async fn test_execute_tool_records_event() {
        let engine = engine();
        let id = engine.start_session(request("acme/api")).unwrap().session;
        let response = engine
            .execute_tool(&id, ToolCall::new("github", "get_file", json!({"path": "README.md"})), &Echo)
            .await
            .unwrap();
        assert_eq!(response.payload, json!({"path": "README.md"}));

        let session = engine.session(&id).unwrap();
        assert_eq!(session.events.len(), 1);
        let recorded = session.events.iter().next().unwrap();
        assert!(matches!(&recorded.event, Event::ToolCall(c) if c.response_bytes == Some(response.bytes)));
    }

    #[derive(Default)]
    struct Counting(AtomicUsize);

    #[async_trait]
    impl ToolTransport for Counting {
        async fn invoke(&self, _server: &str, _tool: &str, args: &Value) -> anyhow::Result<Value> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(args.clone())
        }
    }

    #[tokio::test]
    async fn test_hard_ruled_call_never_reaches_the_server() {
        let engine = engine();
        let id = engine.start_session(request("acme/api")).unwrap().session;
        let transport = Counting::default();

        let err = engine
            .execute_tool(&id, ToolCall::new("github", "force_push", json!({"target": "main"})), &transport)
            .await
            .unwrap_err();

        let GovernanceError::KillSwitchTriggered(report) = err else {
            panic!("expected a halt");
        };
        assert_eq!(report.trigger.kind, TriggerKind::ConstitutionViolation);
        assert_eq!(transport.0.load(Ordering::SeqCst), 0);
        assert_eq!(engine.session(&id).unwrap().state, SessionState::Halted);
        // the refused call is the evidence
        assert_eq!(report.trigger.evidence.len(), 1);
        assert!(!engine.audit().entries().iter().any(|e| e.kind == AuditKind::ToolCall));
    }

    #[tokio::test]
    async fn test_stale_reference_halts_before_the_call() {
        let index = RepoIndex::new().with_paths(["src/lib.rs"]);
        let engine = engine().with_oracle(Arc::new(index));
        let id = engine.start_session(request("acme/api")).unwrap().session;
        let transport = Counting::default();

        let call = ToolCall::new("github", "get_file", json!({"path": "src/lib.rs"})).with_reference("src/legacy.rs");
        let err = engine.execute_tool(&id, call, &transport).await.unwrap_err();
        assert!(matches!(err, GovernanceError::KillSwitchTriggered(ref r) if r.trigger.kind == TriggerKind::ContextConfusion));
        assert_eq!(transport.0.load(Ordering::SeqCst), 0);
    }

    /// Holds every call until released
    struct Gate(Notify);

    #[async_trait]
    impl ToolTransport for Gate {
        async fn invoke(&self, _server: &str, _tool: &str, args: &Value) -> anyhow::Result<Value> {
            self.0.notified().await;
            Ok(args.clone())
        }
    }

    #[tokio::test]
    async fn test_in_flight_call_counts_toward_the_write_cascade() {
        let engine = engine();
        let id = engine.start_session(request("acme/api")).unwrap().session;
        let gate = Gate(Notify::new());
        let write = |path: &str| ToolCall::new("github", "create_file", json!({"path": path}));

        let in_flight = engine.execute_tool(&id, write("src/a.rs"), &gate);
        let alongside = async {
            tokio::task::yield_now().await;
            let second = engine.ingest(&id, write("src/b.rs").into());
            let third = engine.ingest(&id, write("src/c.rs").into());
            gate.0.notify_one();
            (second, third)
        };
        let (first, (second, third)) = tokio::join!(in_flight, alongside);

        assert!(first.is_ok());
        assert!(second.is_ok());
        let Err(GovernanceError::ToolRejected { rule, .. }) = third else {
            panic!("expected the cascade limit");
        };
        assert_eq!(rule, "mcp.cascade_write_limit");

        let paths: Vec<String> = engine
            .session(&id)
            .unwrap()
            .events
            .iter()
            .filter_map(|e| match &e.event {
                Event::ToolCall(c) => Some(c.resource()),
                _ => None,
            })
            .collect();
        assert_eq!(paths, ["src/b.rs", "src/a.rs"]);
    }
}
