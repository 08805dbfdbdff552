//! Output contract validation
//!
//! The output contract is the structured record a session produces at the end
//! of its work. Validation never corrects a field: every problem is reported
//! and any problem makes the contract non-mergeable. The one adjustment the
//! validator makes is a status downgrade (PASS → WARN) when unverified items
//! coexist with a medium or high architectural impact; the downgrade carries
//! its own structured reason.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

use crate::error::{GovernanceError, Result};

/// Fields every contract must carry, in report order
pub const REQUIRED_FIELDS: [&str; 10] = [
    "status",
    "session",
    "date",
    "model",
    "files_changed",
    "confidence",
    "not_verified",
    "architectural_impact",
    "requires_review",
    "requires_review_reason",
];

lazy_static! {
    static ref DATE_PATTERN: Regex = Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("static pattern");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContractStatus {
    Pass,
    Warn,
    Fail,
}

impl ContractStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ContractStatus::Pass => "PASS",
            ContractStatus::Warn => "WARN",
            ContractStatus::Fail => "FAIL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOperation {
    Created,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchitecturalImpact {
    None,
    Low,
    Medium,
    High,
}

impl ArchitecturalImpact {
    pub fn as_str(self) -> &'static str {
        match self {
            ArchitecturalImpact::None => "none",
            ArchitecturalImpact::Low => "low",
            ArchitecturalImpact::Medium => "medium",
            ArchitecturalImpact::High => "high",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileChangeSummary {
    pub path: String,
    pub operation: FileOperation,
}

/// A structurally valid output contract
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputContract {
    pub status: ContractStatus,
    pub session: String,
    pub date: String,
    pub model: String,
    pub files_changed: Vec<FileChangeSummary>,
    pub confidence: u8,
    pub not_verified: Vec<String>,
    pub architectural_impact: ArchitecturalImpact,
    pub requires_review: bool,
    pub requires_review_reason: Option<String>,
}

/// A single contract problem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContractError {
    Validation { field: String, message: String },
    ConfidenceCeilingExceeded { value: i64, ceiling: u8 },
    ContractInconsistency { message: String },
}

impl ContractError {
    fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        ContractError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Name of the check this error fails, for the quality gate
    pub fn check_id(&self) -> &'static str {
        match self {
            ContractError::Validation { .. } => "contract.schema",
            ContractError::ConfidenceCeilingExceeded { .. } => "contract.confidence_ceiling",
            ContractError::ContractInconsistency { .. } => "contract.review_consistency",
        }
    }

    pub fn to_governance_error(&self) -> GovernanceError {
        match self {
            ContractError::Validation { message, .. } => GovernanceError::Validation(message.clone()),
            ContractError::ConfidenceCeilingExceeded { value, ceiling } => {
                GovernanceError::ConfidenceCeilingExceeded {
                    value: *value,
                    ceiling: *ceiling,
                }
            }
            ContractError::ContractInconsistency { message } => {
                GovernanceError::ContractInconsistency(message.clone())
            }
        }
    }
}

impl fmt::Display for ContractError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_governance_error())
    }
}

/// PASS → WARN adjustment with its reason
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusDowngrade {
    pub from: ContractStatus,
    pub to: ContractStatus,
    pub architectural_impact: ArchitecturalImpact,
    pub unverified: Vec<String>,
    pub reason: String,
}

/// Outcome of validating one contract
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractReport {
    pub source: String,
    pub confidence_ceiling: u8,
    /// Present when the contract is structurally valid; status already adjusted
    pub contract: Option<OutputContract>,
    pub errors: Vec<ContractError>,
    pub downgrade: Option<StatusDowngrade>,
    #[serde(skip)]
    raw: Value,
}

impl ContractReport {
    /// No errors of any kind
    pub fn is_mergeable(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn effective_status(&self) -> Option<ContractStatus> {
        self.contract.as_ref().map(|c| c.status)
    }

    /// 0 for PASS and WARN, 1 for FAIL or any error
    pub fn exit_code(&self) -> i32 {
        match (self.is_mergeable(), self.effective_status()) {
            (true, Some(ContractStatus::Pass | ContractStatus::Warn)) => 0,
            _ => 1,
        }
    }

    pub fn render_text(&self) -> String {
        let header = format!("Validating {}", self.source);
        let mut lines = vec![header.clone(), "=".repeat(header.len().max(32))];

        if let Some(obj) = self.raw.as_object() {
            let field = |name: &str| -> String {
                match obj.get(name) {
                    Some(Value::String(s)) => s.clone(),
                    Some(v) => v.to_string(),
                    None => "(missing)".to_string(),
                }
            };
            let count = |name: &str| -> String {
                obj.get(name)
                    .and_then(Value::as_array)
                    .map_or_else(|| "(invalid)".to_string(), |a| a.len().to_string())
            };
            let confidence_note = match obj.get("confidence").and_then(Value::as_i64) {
                Some(c) if c > i64::from(self.confidence_ceiling) => {
                    format!("  (ceiling: {})  EXCEEDS CEILING", self.confidence_ceiling)
                }
                Some(_) => format!("  (ceiling: {})  OK", self.confidence_ceiling),
                None => String::new(),
            };

            lines.push(format!("  status               {}", field("status")));
            lines.push(format!("  session              {}", field("session")));
            lines.push(format!("  date                 {}", field("date")));
            lines.push(format!("  model                {}", field("model")));
            lines.push(format!("  files_changed        {} files", count("files_changed")));
            lines.push(format!("  confidence           {}{confidence_note}", field("confidence")));
            lines.push(format!("  not_verified         {} items declared", count("not_verified")));
            lines.push(format!("  architectural_impact {}", field("architectural_impact")));
            lines.push(format!("  requires_review      {}", field("requires_review")));
        }

        lines.push(String::new());
        if let Some(downgrade) = &self.downgrade {
            lines.push(format!(
                "  WARN: status downgraded {} -> {}: {}",
                downgrade.from.as_str(),
                downgrade.to.as_str(),
                downgrade.reason
            ));
            lines.push(String::new());
        }

        if self.errors.is_empty() {
            let status = self.effective_status().map_or("PASS", ContractStatus::as_str);
            lines.push(format!("RESULT: {status}"));
        } else {
            for err in &self.errors {
                lines.push(format!("  FAIL: {err}"));
            }
            lines.push(String::new());
            let plural = if self.errors.len() == 1 { "" } else { "s" };
            lines.push(format!("RESULT: FAIL ({} error{plural})", self.errors.len()));
        }
        lines.join("\n")
    }

    pub fn render_json(&self) -> Result<String> {
        let errors: Vec<String> = self.errors.iter().map(ToString::to_string).collect();
        let body = json!({
            "contract": self.source,
            "passed": self.is_mergeable(),
            "status": self.effective_status(),
            "confidence_ceiling": self.confidence_ceiling,
            "error_count": errors.len(),
            "errors": errors,
            "downgrade": self.downgrade,
        });
        Ok(serde_json::to_string_pretty(&body)?)
    }
}

/// Validates contracts against a confidence ceiling
#[derive(Debug, Clone, Copy)]
pub struct ContractValidator {
    ceiling: u8,
}

impl ContractValidator {
    pub fn new(ceiling: u8) -> Self {
        Self { ceiling }
    }

    pub fn ceiling(&self) -> u8 {
        self.ceiling
    }

    /// Parse and validate a JSON document
    pub fn validate_str(&self, source: impl Into<String>, content: &str) -> Result<ContractReport> {
        let value: Value = serde_json::from_str(content)?;
        Ok(self.validate(source, &value))
    }

    pub fn validate(&self, source: impl Into<String>, value: &Value) -> ContractReport {
        let mut report = ContractReport {
            source: source.into(),
            confidence_ceiling: self.ceiling,
            contract: None,
            errors: Vec::new(),
            downgrade: None,
            raw: value.clone(),
        };

        let Some(obj) = value.as_object() else {
            report.errors.push(ContractError::validation(
                "$",
                format!("contract must be a JSON object, got {}", json_type(value)),
            ));
            return report;
        };

        for key in obj.keys() {
            if !REQUIRED_FIELDS.contains(&key.as_str()) {
                report
                    .errors
                    .push(ContractError::validation(key.clone(), format!("unknown field '{key}'")));
            }
        }
        for field in REQUIRED_FIELDS {
            if !obj.contains_key(field) {
                report
                    .errors
                    .push(ContractError::validation(field, format!("required field missing: {field}")));
            }
        }
        // later checks index fields directly
        if !report.errors.is_empty() {
            return report;
        }

        self.check_fields(obj, &mut report.errors);
        if !report.errors.is_empty() {
            return report;
        }

        match serde_json::from_value::<OutputContract>(value.clone()) {
            Ok(mut contract) => {
                report.downgrade = downgrade_status(&mut contract);
                report.contract = Some(contract);
            }
            Err(e) => report
                .errors
                .push(ContractError::validation("$", format!("contract does not deserialize: {e}"))),
        }
        report
    }

    fn check_fields(&self, obj: &serde_json::Map<String, Value>, errors: &mut Vec<ContractError>) {
        if !matches!(obj["status"].as_str(), Some("PASS" | "WARN" | "FAIL")) {
            errors.push(ContractError::validation(
                "status",
                format!("status must be one of PASS, WARN, FAIL, got {}", obj["status"]),
            ));
        }

        for field in ["session", "model"] {
            if !is_non_empty_string(&obj[field]) {
                errors.push(ContractError::validation(field, format!("{field} must be a non-empty string")));
            }
        }

        let date_ok = obj["date"].as_str().is_some_and(|d| {
            DATE_PATTERN.is_match(d) && chrono::NaiveDate::parse_from_str(d, "%Y-%m-%d").is_ok()
        });
        if !date_ok {
            errors.push(ContractError::validation(
                "date",
                format!("date must be a YYYY-MM-DD string, got {}", obj["date"]),
            ));
        }

        match obj["files_changed"].as_array() {
            None => errors.push(ContractError::validation("files_changed", "files_changed must be an array")),
            Some(entries) => {
                for (i, entry) in entries.iter().enumerate() {
                    check_file_entry(i, entry, errors);
                }
            }
        }

        match obj["confidence"].as_i64() {
            // floats and booleans are not integers
            None => errors.push(ContractError::validation(
                "confidence",
                format!("confidence must be an integer, got {}", obj["confidence"]),
            )),
            Some(c) if c < 0 => errors.push(ContractError::validation(
                "confidence",
                format!("confidence must be between 0 and 100, got {c}"),
            )),
            Some(c) if c > 100 => errors.push(ContractError::validation(
                "confidence",
                format!(
                    "confidence must be between 0 and 100, got {c}, which also exceeds the ceiling of {}",
                    self.ceiling
                ),
            )),
            Some(c) if c > i64::from(self.ceiling) => {
                errors.push(ContractError::ConfidenceCeilingExceeded {
                    value: c,
                    ceiling: self.ceiling,
                })
            }
            Some(_) => {}
        }

        match obj["not_verified"].as_array() {
            None => errors.push(ContractError::validation("not_verified", "not_verified must be an array")),
            Some(items) => {
                for (i, item) in items.iter().enumerate() {
                    if !is_non_empty_string(item) {
                        errors.push(ContractError::validation(
                            format!("not_verified[{i}]"),
                            format!("not_verified[{i}] must be a non-empty string"),
                        ));
                    }
                }
            }
        }

        if !matches!(
            obj["architectural_impact"].as_str(),
            Some("none" | "low" | "medium" | "high")
        ) {
            errors.push(ContractError::validation(
                "architectural_impact",
                format!(
                    "architectural_impact must be one of none, low, medium, high, got {}",
                    obj["architectural_impact"]
                ),
            ));
        }

        let reason = &obj["requires_review_reason"];
        match obj["requires_review"].as_bool() {
            None => errors.push(ContractError::validation(
                "requires_review",
                format!("requires_review must be a boolean, got {}", obj["requires_review"]),
            )),
            Some(true) if !is_non_empty_string(reason) => {
                errors.push(ContractError::ContractInconsistency {
                    message: format!(
                        "requires_review is true but requires_review_reason is {reason}; a non-empty reason is required"
                    ),
                })
            }
            Some(false) if !reason.is_null() => errors.push(ContractError::ContractInconsistency {
                message: format!("requires_review is false but requires_review_reason is {reason}; it must be null"),
            }),
            Some(_) => {}
        }
    }
}

fn check_file_entry(i: usize, entry: &Value, errors: &mut Vec<ContractError>) {
    let field = format!("files_changed[{i}]");
    let Some(obj) = entry.as_object() else {
        errors.push(ContractError::validation(field.clone(), format!("{field} must be an object")));
        return;
    };
    if !obj.get("path").is_some_and(is_non_empty_string) {
        errors.push(ContractError::validation(
            format!("{field}.path"),
            format!("{field}.path must be a non-empty string"),
        ));
    }
    match obj.get("operation") {
        None => errors.push(ContractError::validation(
            format!("{field}.operation"),
            format!("{field}.operation is required"),
        )),
        Some(op) if !matches!(op.as_str(), Some("created" | "modified" | "deleted")) => {
            errors.push(ContractError::validation(
                format!("{field}.operation"),
                format!("{field}.operation must be one of created, modified, deleted, got {op}"),
            ))
        }
        Some(_) => {}
    }
    let mut unknown: Vec<&String> = obj
        .keys()
        .filter(|k| k.as_str() != "path" && k.as_str() != "operation")
        .collect();
    unknown.sort();
    for key in unknown {
        errors.push(ContractError::validation(
            field.clone(),
            format!("{field} has unknown key '{key}'"),
        ));
    }
}

fn downgrade_status(contract: &mut OutputContract) -> Option<StatusDowngrade> {
    let significant = contract.architectural_impact >= ArchitecturalImpact::Medium;
    if contract.status != ContractStatus::Pass || contract.not_verified.is_empty() || !significant {
        return None;
    }
    contract.status = ContractStatus::Warn;
    Some(StatusDowngrade {
        from: ContractStatus::Pass,
        to: ContractStatus::Warn,
        architectural_impact: contract.architectural_impact,
        unverified: contract.not_verified.clone(),
        reason: format!(
            "{} unverified item(s) with {} architectural impact",
            contract.not_verified.len(),
            contract.architectural_impact.as_str()
        ),
    })
}

fn is_non_empty_string(value: &Value) -> bool {
    value.as_str().is_some_and(|s| !s.trim().is_empty())
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contract() -> Value {
        json!({
            "status": "PASS",
            "session": "session:42",
            "date": "2026-03-01",
            "model": "model-x",
            "files_changed": [{"path": "src/lib.rs", "operation": "modified"}],
            "confidence": 72,
            "not_verified": [],
            "architectural_impact": "low",
            "requires_review": false,
            "requires_review_reason": null
        })
    }

    fn validate(value: Value) -> ContractReport {
        ContractValidator::new(85).validate("output_contract.json", &value)
    }

    #[test]
    fn test_valid_contract_passes() {
        let report = validate(contract());
        assert!(report.is_mergeable());
        assert_eq!(report.effective_status(), Some(ContractStatus::Pass));
        assert_eq!(report.exit_code(), 0);
        assert!(report.render_text().ends_with("RESULT: PASS"));
    }

    #[test]
    fn test_confidence_above_ceiling() {
        let mut value = contract();
        value["confidence"] = json!(92);
        let report = validate(value);

        assert_eq!(
            report.errors,
            vec![ContractError::ConfidenceCeilingExceeded { value: 92, ceiling: 85 }]
        );
        assert_eq!(report.exit_code(), 1);
        assert!(report.render_text().contains("EXCEEDS CEILING"));
    }

    #[test]
    fn test_confidence_above_hundred_names_the_ceiling() {
        let mut value = contract();
        value["confidence"] = json!(140);
        let report = validate(value);

        assert_eq!(report.errors.len(), 1);
        let message = report.errors[0].to_string();
        assert!(message.contains("140"));
        assert!(message.contains("85"));
        assert_eq!(report.exit_code(), 1);

        let mut value = contract();
        value["confidence"] = json!(-3);
        assert!(validate(value).errors[0].to_string().contains("-3"));
    }

    #[test]
    fn test_review_reason_must_match_flag() {
        let mut value = contract();
        value["requires_review"] = json!(true);
        let report = validate(value);
        assert!(matches!(
            report.errors.as_slice(),
            [ContractError::ContractInconsistency { .. }]
        ));

        let mut value = contract();
        value["requires_review_reason"] = json!("touches auth");
        let report = validate(value);
        assert_eq!(report.errors[0].check_id(), "contract.review_consistency");
    }

    #[test]
    fn test_missing_fields_short_circuit() {
        let mut value = contract();
        value.as_object_mut().unwrap().remove("model");
        value["confidence"] = json!(99);
        let report = validate(value);

        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].to_string().contains("model"));
    }

    #[test]
    fn test_unknown_fields_reported() {
        let mut value = contract();
        value["mood"] = json!("optimistic");
        value["files_changed"] = json!([{"path": "a.rs", "operation": "renamed", "lines": 4}]);
        let report = validate(value);
        assert_eq!(report.errors.len(), 1);

        let mut value = contract();
        value["files_changed"] = json!([{"path": "a.rs", "operation": "renamed", "lines": 4}]);
        let report = validate(value);
        let messages: Vec<String> = report.errors.iter().map(ToString::to_string).collect();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].contains("renamed"));
        assert!(messages[1].contains("'lines'"));
    }

    #[test]
    fn test_boolean_confidence_is_not_an_integer() {
        let mut value = contract();
        value["confidence"] = json!(true);
        assert!(validate(value).errors[0].to_string().contains("integer"));

        let mut value = contract();
        value["confidence"] = json!(70.5);
        assert!(!validate(value).is_mergeable());
    }

    #[test]
    fn test_unverified_items_downgrade_pass() {
        let mut value = contract();
        value["not_verified"] = json!(["migration rollback"]);
        value["architectural_impact"] = json!("high");
        let report = validate(value);

        assert!(report.is_mergeable());
        assert_eq!(report.effective_status(), Some(ContractStatus::Warn));
        let downgrade = report.downgrade.as_ref().unwrap();
        assert_eq!(downgrade.unverified, vec!["migration rollback"]);
        assert_eq!(report.exit_code(), 0);

        let mut value = contract();
        value["not_verified"] = json!(["docs wording"]);
        assert!(validate(value).downgrade.is_none());
    }

    #[test]
    fn test_fail_status_exits_non_zero() {
        let mut value = contract();
        value["status"] = json!("FAIL");
        let report = validate(value);
        assert!(report.is_mergeable());
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn test_json_report() {
        let mut value = contract();
        value["date"] = json!("03/01/2026");
        let rendered = validate(value).render_json().unwrap();
        let parsed: Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed["passed"], json!(false));
        assert_eq!(parsed["error_count"], json!(1));
    }
}
