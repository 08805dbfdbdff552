//! Break-glass override records
//!
//! A break-glass record is a time-boxed exception to a rule that is otherwise
//! never overridable. Records are consulted at evaluation time: whether a
//! record is active is decided against the wall clock passed in by the caller,
//! never against the moment the record was created.

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{GovernanceError, Result};
use crate::types::Timestamp;

/// Longest window a single record may cover
pub const MAX_WINDOW_HOURS: i64 = 24;

/// Days between the end of a window and its mandatory review
pub const DEFAULT_REVIEW_DAYS: i64 = 7;

/// A time-boxed exception record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakGlassRecord {
    pub id: String,
    /// Person who activated the override
    pub activator: String,
    /// Situation that justified it
    pub scenario: String,
    /// Rule id, config key or path the record exempts
    pub rule_overridden: String,
    pub starts_at: Timestamp,
    pub ends_at: Timestamp,
    #[serde(default)]
    pub actions_taken: Vec<String>,
    #[serde(default)]
    pub resolution: Option<String>,
    /// Date by which the mandatory review must happen
    pub review_date: NaiveDate,
    #[serde(default)]
    pub reviewed: bool,
}

impl BreakGlassRecord {
    /// Open a new record starting at `starts_at` for `window`
    pub fn new(
        activator: impl Into<String>,
        scenario: impl Into<String>,
        rule_overridden: impl Into<String>,
        starts_at: Timestamp,
        window: Duration,
    ) -> Result<Self> {
        let ends_at = starts_at + window;
        let record = Self {
            id: format!("bg-{}", Uuid::new_v4()),
            activator: activator.into(),
            scenario: scenario.into(),
            rule_overridden: rule_overridden.into(),
            starts_at,
            ends_at,
            actions_taken: Vec::new(),
            resolution: None,
            review_date: (ends_at + Duration::days(DEFAULT_REVIEW_DAYS)).date_naive(),
            reviewed: false,
        };
        record.validate()?;
        Ok(record)
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.actions_taken.push(action.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("activator", &self.activator),
            ("scenario", &self.scenario),
            ("rule_overridden", &self.rule_overridden),
        ] {
            if value.trim().is_empty() {
                return Err(GovernanceError::BreakGlass(format!(
                    "record {} has an empty {name}",
                    self.id
                )));
            }
        }

        let window = self.ends_at - self.starts_at;
        if window <= Duration::zero() {
            return Err(GovernanceError::BreakGlass(format!(
                "record {} ends ({}) before it starts ({})",
                self.id, self.ends_at, self.starts_at
            )));
        }
        if window > Duration::hours(MAX_WINDOW_HOURS) {
            return Err(GovernanceError::BreakGlass(format!(
                "record {} spans {}h, limit is {MAX_WINDOW_HOURS}h",
                self.id,
                window.num_hours()
            )));
        }
        if self.review_date < self.ends_at.date_naive() {
            return Err(GovernanceError::BreakGlass(format!(
                "record {} schedules review on {} before the window closes",
                self.id, self.review_date
            )));
        }
        Ok(())
    }

    /// Active iff `starts_at <= at < ends_at`
    pub fn is_active(&self, at: Timestamp) -> bool {
        self.starts_at <= at && at < self.ends_at
    }

    pub fn is_review_overdue(&self, today: NaiveDate) -> bool {
        !self.reviewed && self.review_date < today
    }
}

/// Collection of break-glass records
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BreakGlassRegistry {
    records: Vec<BreakGlassRecord>,
}

impl BreakGlassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a JSON array of records
    pub fn from_json_str(content: &str) -> Result<Self> {
        Self::from_records(serde_json::from_str(content)?)
    }

    pub fn from_records(records: Vec<BreakGlassRecord>) -> Result<Self> {
        for record in &records {
            record.validate()?;
        }
        Ok(Self { records })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&content)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.records)?)
    }

    pub fn register(&mut self, record: BreakGlassRecord) -> Result<()> {
        record.validate()?;
        if self.records.iter().any(|r| r.id == record.id) {
            return Err(GovernanceError::BreakGlass(format!(
                "record {} already registered",
                record.id
            )));
        }
        info!(
            record = %record.id,
            rule = %record.rule_overridden,
            activator = %record.activator,
            ends_at = %record.ends_at,
            "Break-glass record registered"
        );
        self.records.push(record);
        Ok(())
    }

    pub fn records(&self) -> &[BreakGlassRecord] {
        &self.records
    }

    pub fn get(&self, id: &str) -> Option<&BreakGlassRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    /// Active record exempting `rule` at `at`, if any
    pub fn active_for(&self, rule: &str, at: Timestamp) -> Option<&BreakGlassRecord> {
        self.records
            .iter()
            .find(|r| r.rule_overridden == rule && r.is_active(at))
    }

    /// An override of `rule` is only legitimate with an active record
    pub fn verify_override(&self, rule: &str, at: Timestamp) -> Result<&BreakGlassRecord> {
        self.active_for(rule, at).ok_or_else(|| {
            warn!(rule, at = %at, "Override attempted without an active break-glass record");
            GovernanceError::BreakGlass(format!(
                "override of '{rule}' at {at} has no active break-glass record"
            ))
        })
    }

    /// Close the review of a record
    pub fn mark_reviewed(&mut self, id: &str, resolution: impl Into<String>) -> Result<()> {
        let record = self
            .records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| GovernanceError::BreakGlass(format!("no record with id {id}")))?;
        record.reviewed = true;
        record.resolution = Some(resolution.into());
        Ok(())
    }

    pub fn overdue_reviews(&self, today: NaiveDate) -> Vec<&BreakGlassRecord> {
        self.records
            .iter()
            .filter(|r| r.is_review_overdue(today))
            .collect()
    }
}
