//! Progressive trust
//!
//! Each (domain, repository) pair has a trust level from 1 (full review) to
//! 4 (task review). Clean sessions accumulate toward promotion; any demotion
//! cause drops the domain straight back to level 1. A shipped security issue
//! also costs every other domain of the repository one level.
//!
//! History is append-only. All mutation goes through [`TrustLedger`], which
//! serializes writers so concurrent session closes cannot double-promote.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::TrustSettings;
use crate::error::{GovernanceError, Result};
use crate::types::{now, Domain, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum TrustLevel {
    FullReview = 1,
    LogicReview = 2,
    ArchitectureReview = 3,
    TaskReview = 4,
}

impl TrustLevel {
    pub const MAX: TrustLevel = TrustLevel::TaskReview;

    pub fn value(self) -> u8 {
        self as u8
    }

    pub fn from_value(value: u8) -> Option<Self> {
        match value {
            1 => Some(TrustLevel::FullReview),
            2 => Some(TrustLevel::LogicReview),
            3 => Some(TrustLevel::ArchitectureReview),
            4 => Some(TrustLevel::TaskReview),
            _ => None,
        }
    }

    pub fn next(self) -> Option<Self> {
        Self::from_value(self.value() + 1)
    }

    /// One level down, saturating at 1
    pub fn previous(self) -> Self {
        Self::from_value(self.value().saturating_sub(1)).unwrap_or(TrustLevel::FullReview)
    }

    /// What a reviewer must look at for a session at this level
    pub fn review_depth(self) -> &'static str {
        match self {
            TrustLevel::FullReview => "review every line",
            TrustLevel::LogicReview => "review logic and control flow",
            TrustLevel::ArchitectureReview => "review architecture and interfaces",
            TrustLevel::TaskReview => "review task outcome only",
        }
    }
}

impl TryFrom<u8> for TrustLevel {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        Self::from_value(value).ok_or_else(|| format!("trust level must be 1-4, got {value}"))
    }
}

impl From<TrustLevel> for u8 {
    fn from(level: TrustLevel) -> u8 {
        level.value()
    }
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{} ({})", self.value(), self.review_depth())
    }
}

/// Reasons a domain loses trust immediately
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DemotionCause {
    ShippedLogicError,
    ShippedSecurityIssue,
    ArchitecturalDrift,
    CoverageDecrease,
    GovernanceFileModified,
}

impl DemotionCause {
    pub fn as_str(self) -> &'static str {
        match self {
            DemotionCause::ShippedLogicError => "shipped_logic_error",
            DemotionCause::ShippedSecurityIssue => "shipped_security_issue",
            DemotionCause::ArchitecturalDrift => "architectural_drift",
            DemotionCause::CoverageDecrease => "coverage_decrease",
            DemotionCause::GovernanceFileModified => "governance_file_modified",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "shipped_logic_error" => Some(DemotionCause::ShippedLogicError),
            "shipped_security_issue" => Some(DemotionCause::ShippedSecurityIssue),
            "architectural_drift" => Some(DemotionCause::ArchitecturalDrift),
            "coverage_decrease" => Some(DemotionCause::CoverageDecrease),
            "governance_file_modified" => Some(DemotionCause::GovernanceFileModified),
            _ => None,
        }
    }
}

impl fmt::Display for DemotionCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Promotion,
    Demotion,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustTransition {
    pub domain: Domain,
    pub repository: String,
    pub kind: TransitionKind,
    pub from: TrustLevel,
    pub to: TrustLevel,
    pub reason: String,
    pub at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustState {
    pub domain: Domain,
    pub repository: String,
    pub level: TrustLevel,
    pub consecutive_clean: u32,
    pub last_transition: Option<TrustTransition>,
}

impl TrustState {
    pub fn new(domain: Domain, repository: impl Into<String>) -> Self {
        Self {
            domain,
            repository: repository.into(),
            level: TrustLevel::FullReview,
            consecutive_clean: 0,
            last_transition: None,
        }
    }

    pub fn key(&self) -> (String, Domain) {
        (self.repository.clone(), self.domain)
    }
}

/// What a closed session contributes to its domain's trust
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEvidence {
    /// Session closed without a halt and the quality gate approved it
    pub clean: bool,
    /// Automated checks relevant to the domain pass
    pub checks_passing: bool,
}

/// Pure transition rules
#[derive(Debug, Clone, Default)]
pub struct TrustPolicy {
    settings: TrustSettings,
}

impl TrustPolicy {
    pub fn new(settings: &TrustSettings) -> Self {
        Self {
            settings: settings.clone(),
        }
    }

    /// Clean sessions required to leave `level`, if it can be left upward
    pub fn threshold(&self, level: TrustLevel) -> Option<u32> {
        if level == TrustLevel::MAX {
            return None;
        }
        self.settings
            .promotion_thresholds
            .get(usize::from(level.value()) - 1)
            .copied()
    }

    /// Counts a session; promotes at most one level.
    ///
    /// A non-clean session resets the streak without demoting.
    pub fn record_session(&self, state: &mut TrustState, evidence: SessionEvidence, at: Timestamp) -> Option<TrustTransition> {
        if !evidence.clean {
            state.consecutive_clean = 0;
            return None;
        }
        state.consecutive_clean = state.consecutive_clean.saturating_add(1);

        let threshold = self.threshold(state.level)?;
        if state.consecutive_clean < threshold || !evidence.checks_passing {
            return None;
        }
        let to = state.level.next()?;
        let transition = TrustTransition {
            domain: state.domain,
            repository: state.repository.clone(),
            kind: TransitionKind::Promotion,
            from: state.level,
            to,
            reason: format!(
                "{} consecutive clean sessions reached threshold {threshold} with automated checks passing",
                state.consecutive_clean
            ),
            at,
        };
        state.level = to;
        state.consecutive_clean = 0;
        state.last_transition = Some(transition.clone());
        Some(transition)
    }

    pub fn demote_to_floor(&self, state: &mut TrustState, cause: DemotionCause, detail: &str, at: Timestamp) -> TrustTransition {
        let transition = TrustTransition {
            domain: state.domain,
            repository: state.repository.clone(),
            kind: TransitionKind::Demotion,
            from: state.level,
            to: TrustLevel::FullReview,
            reason: format!("{cause}: {detail}"),
            at,
        };
        state.level = TrustLevel::FullReview;
        state.consecutive_clean = 0;
        state.last_transition = Some(transition.clone());
        transition
    }

    /// Collateral one-level demotion; None when already at level 1
    pub fn demote_one(&self, state: &mut TrustState, reason: &str, at: Timestamp) -> Option<TrustTransition> {
        state.consecutive_clean = 0;
        if state.level == TrustLevel::FullReview {
            return None;
        }
        let transition = TrustTransition {
            domain: state.domain,
            repository: state.repository.clone(),
            kind: TransitionKind::Demotion,
            from: state.level,
            to: state.level.previous(),
            reason: reason.to_string(),
            at,
        };
        state.level = transition.to;
        state.last_transition = Some(transition.clone());
        Some(transition)
    }
}

/// Durable backing for the ledger
pub trait TrustRepository: Send + Sync {
    fn load_states(&self) -> Result<Vec<TrustState>>;
    fn load_history(&self) -> Result<Vec<TrustTransition>>;
    /// Must persist `states` and append `transitions` atomically
    fn save(&self, states: &[TrustState], transitions: &[TrustTransition]) -> Result<()>;
}

#[derive(Default)]
struct LedgerState {
    states: BTreeMap<(String, Domain), TrustState>,
    history: Vec<TrustTransition>,
}

impl LedgerState {
    fn entry(&mut self, repository: &str, domain: Domain) -> &mut TrustState {
        self.states
            .entry((repository.to_string(), domain))
            .or_insert_with(|| TrustState::new(domain, repository))
    }
}

/// Serialized trust state for every repository and domain
#[derive(Clone)]
pub struct TrustLedger {
    policy: TrustPolicy,
    inner: Arc<Mutex<LedgerState>>,
    repository: Option<Arc<dyn TrustRepository>>,
}

impl fmt::Debug for TrustLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("TrustLedger")
            .field("states", &inner.states.len())
            .field("history", &inner.history.len())
            .field("durable", &self.repository.is_some())
            .finish()
    }
}

impl TrustLedger {
    pub fn new(settings: &TrustSettings) -> Self {
        Self {
            policy: TrustPolicy::new(settings),
            inner: Arc::new(Mutex::new(LedgerState::default())),
            repository: None,
        }
    }

    /// Loads existing states and history, then writes through on every change
    pub fn with_repository(settings: &TrustSettings, repository: Arc<dyn TrustRepository>) -> Result<Self> {
        let mut inner = LedgerState::default();
        for state in repository.load_states()? {
            inner.states.insert(state.key(), state);
        }
        inner.history = repository.load_history()?;
        Ok(Self {
            policy: TrustPolicy::new(settings),
            inner: Arc::new(Mutex::new(inner)),
            repository: Some(repository),
        })
    }

    pub fn policy(&self) -> &TrustPolicy {
        &self.policy
    }

    /// Current state; level 1 with no history if never seen
    pub fn state(&self, repository: &str, domain: Domain) -> TrustState {
        self.inner
            .lock()
            .states
            .get(&(repository.to_string(), domain))
            .cloned()
            .unwrap_or_else(|| TrustState::new(domain, repository))
    }

    pub fn states_for(&self, repository: &str) -> Vec<TrustState> {
        Domain::ALL
            .iter()
            .map(|d| self.state(repository, *d))
            .collect()
    }

    pub fn history(&self) -> Vec<TrustTransition> {
        self.inner.lock().history.clone()
    }

    pub fn history_for(&self, repository: &str, domain: Domain) -> Vec<TrustTransition> {
        self.inner
            .lock()
            .history
            .iter()
            .filter(|t| t.repository == repository && t.domain == domain)
            .cloned()
            .collect()
    }

    /// Applies `change` to a working copy under the lock and commits it only
    /// if the repository accepted the write.
    fn apply<F>(&self, repository: &str, domains: &[Domain], change: F) -> Result<Vec<TrustTransition>>
    where
        F: FnOnce(&TrustPolicy, &mut BTreeMap<Domain, TrustState>) -> Vec<TrustTransition>,
    {
        let mut inner = self.inner.lock();
        let mut working: BTreeMap<Domain, TrustState> = domains
            .iter()
            .map(|d| (*d, inner.entry(repository, *d).clone()))
            .collect();

        let transitions = change(&self.policy, &mut working);
        let states: Vec<TrustState> = working.into_values().collect();

        if let Some(repo) = &self.repository {
            repo.save(&states, &transitions)?;
        }
        for state in states {
            inner.states.insert(state.key(), state);
        }
        inner.history.extend(transitions.iter().cloned());
        Ok(transitions)
    }

    pub fn record_session(&self, repository: &str, domain: Domain, evidence: SessionEvidence) -> Result<Option<TrustTransition>> {
        let at = now();
        let transitions = self.apply(repository, &[domain], |policy, working| {
            working
                .get_mut(&domain)
                .and_then(|state| policy.record_session(state, evidence, at))
                .into_iter()
                .collect()
        })?;
        let transition = transitions.into_iter().next();
        if let Some(t) = &transition {
            info!(
                repository = %repository,
                domain = %domain.as_str(),
                from = t.from.value(),
                to = t.to.value(),
                "Trust promoted"
            );
        }
        Ok(transition)
    }

    /// Immediate demotion to level 1, with the security-issue spillover
    pub fn demote(&self, repository: &str, domain: Domain, cause: DemotionCause, detail: &str) -> Result<Vec<TrustTransition>> {
        if detail.trim().is_empty() {
            return Err(GovernanceError::Validation(format!(
                "demotion for {cause} in {repository}/{} needs a non-empty detail",
                domain.as_str()
            )));
        }
        let at = now();
        let domains: Vec<Domain> = if cause == DemotionCause::ShippedSecurityIssue {
            Domain::ALL.to_vec()
        } else {
            vec![domain]
        };

        let transitions = self.apply(repository, &domains, |policy, working| {
            let mut out = Vec::new();
            if let Some(state) = working.get_mut(&domain) {
                out.push(policy.demote_to_floor(state, cause, detail, at));
            }
            if cause == DemotionCause::ShippedSecurityIssue {
                let reason = format!("{cause} in {}: {detail}", domain.as_str());
                for (other, state) in working.iter_mut() {
                    if *other != domain {
                        out.extend(policy.demote_one(state, &reason, at));
                    }
                }
            }
            out
        })?;

        for t in &transitions {
            warn!(
                repository = %repository,
                domain = %t.domain.as_str(),
                from = t.from.value(),
                to = t.to.value(),
                reason = %t.reason,
                "Trust demoted"
            );
        }
        Ok(transitions)
    }
}
