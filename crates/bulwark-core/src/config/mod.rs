//! Governance configuration
//!
//! All numeric thresholds are configuration, never constants. Defaults follow
//! the most frequently repeated values in the governance rule set (confidence
//! ceiling 85, hard file ceiling 15).
//!
//! Configs are TOML. A single file can be loaded with
//! [`GovernanceConfig::from_file`]; the org → team → repo hierarchy is
//! resolved by [`layered::resolve`].

pub mod layered;

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{GovernanceError, Result};

pub use layered::{ConfigLayer, LayerLevel, MergePolicy, Narrowing, ResolvedConfig};

/// Minimum local retention for the audit log
pub const MIN_AUDIT_RETENTION_DAYS: u32 = 90;

/// Root configuration for the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GovernanceConfig {
    pub contract: ContractSettings,
    pub blast_radius: BlastRadiusSettings,
    pub mcp: McpSettings,
    pub kill_switch: KillSwitchSettings,
    pub quality: QualitySettings,
    pub trust: TrustSettings,
    pub health: HealthSettings,
    pub audit: AuditSettings,
}

impl GovernanceConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the confidence ceiling
    pub fn with_confidence_ceiling(mut self, ceiling: u8) -> Self {
        self.contract.confidence_ceiling = ceiling;
        self
    }

    /// Allow a role to reach a server
    pub fn with_allowed_server(mut self, role: impl Into<String>, server: impl Into<String>) -> Self {
        self.mcp
            .allowlist
            .entry(role.into())
            .or_default()
            .push(server.into());
        self
    }

    /// Register a server with its resolved host and optional sub-limit
    pub fn with_server(
        mut self,
        name: impl Into<String>,
        host: impl Into<String>,
        max_calls: Option<u32>,
    ) -> Self {
        self.mcp.servers.insert(
            name.into(),
            ServerSettings {
                host: host.into(),
                max_calls,
            },
        );
        self
    }

    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| GovernanceError::Config(e.to_string()))
    }

    /// Reject configurations that cannot be enforced consistently
    pub fn validate(&self) -> Result<()> {
        if self.contract.confidence_ceiling > 100 {
            return Err(GovernanceError::Config(format!(
                "contract.confidence_ceiling must be 0-100, got {}",
                self.contract.confidence_ceiling
            )));
        }

        let br = &self.blast_radius;
        if br.low_max_files > br.medium_max_files {
            return Err(GovernanceError::Config(format!(
                "blast_radius.low_max_files ({}) must not exceed medium_max_files ({})",
                br.low_max_files, br.medium_max_files
            )));
        }
        if br.max_files_modified == 0 || br.max_lines_per_file == 0 {
            return Err(GovernanceError::Config(
                "blast_radius hard ceilings must be greater than zero".to_string(),
            ));
        }

        if self.audit.retention_days < MIN_AUDIT_RETENTION_DAYS {
            return Err(GovernanceError::Config(format!(
                "audit.retention_days must be at least {MIN_AUDIT_RETENTION_DAYS}, got {}",
                self.audit.retention_days
            )));
        }

        if self.trust.promotion_thresholds.len() != 3 {
            return Err(GovernanceError::Config(format!(
                "trust.promotion_thresholds needs one entry per promotion (3), got {}",
                self.trust.promotion_thresholds.len()
            )));
        }

        if !(0.0..=1.0).contains(&self.health.drift_threshold) {
            return Err(GovernanceError::Config(format!(
                "health.drift_threshold must be within 0.0-1.0, got {}",
                self.health.drift_threshold
            )));
        }

        compile_patterns("blast_radius.critical_paths", &br.critical_paths)?;
        for tag in &br.path_tags {
            compile_pattern("blast_radius.path_tags", &tag.pattern)?;
        }
        compile_patterns(
            "mcp.production_host_patterns",
            &self.mcp.production_host_patterns,
        )?;
        for rule in &self.kill_switch.hard_rules {
            compile_pattern("kill_switch.hard_rules", &rule.pattern)?;
        }

        Ok(())
    }
}

/// Compile a single configured regex, naming the key on failure
pub fn compile_pattern(key: &str, pattern: &str) -> Result<Regex> {
    Regex::new(pattern)
        .map_err(|e| GovernanceError::Config(format!("{key}: invalid pattern '{pattern}': {e}")))
}

/// Compile a list of configured regexes
pub fn compile_patterns(key: &str, patterns: &[String]) -> Result<Vec<Regex>> {
    patterns.iter().map(|p| compile_pattern(key, p)).collect()
}

/// Output contract settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContractSettings {
    /// Highest confidence a session may claim
    pub confidence_ceiling: u8,
}

impl Default for ContractSettings {
    fn default() -> Self {
        Self {
            confidence_ceiling: 85,
        }
    }
}

/// Blast radius settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlastRadiusSettings {
    /// Upper bound of the LOW band (no critical files allowed)
    pub low_max_files: usize,
    /// Upper bound of the MEDIUM band
    pub medium_max_files: usize,
    /// Hard ceiling; exceeding it trips the kill switch
    pub max_files_modified: usize,
    /// Hard per-file line ceiling (added + removed, cumulative)
    pub max_lines_per_file: u32,
    /// Newly created files beyond this push the session to HIGH
    pub max_new_files: usize,
    /// Regexes identifying critical files
    pub critical_paths: Vec<String>,
    /// Regex tags used by the forbidden-combination detector
    pub path_tags: Vec<PathTag>,
    /// Tag pairs that may not change in the same session
    pub forbidden_combinations: Vec<ForbiddenCombination>,
}

impl Default for BlastRadiusSettings {
    fn default() -> Self {
        Self {
            low_max_files: 5,
            medium_max_files: 10,
            max_files_modified: 15,
            max_lines_per_file: 200,
            max_new_files: 10,
            critical_paths: vec![
                r"(^|/)\.env(\.[\w-]+)?$".to_string(),
                r"(^|/)secrets?/".to_string(),
                r"(^|/)\.github/workflows/".to_string(),
            ],
            path_tags: vec![
                PathTag {
                    tag: "schema_migration".to_string(),
                    pattern: r"(^|/)(migrations?|schema)/".to_string(),
                },
                PathTag {
                    tag: "application_code".to_string(),
                    pattern: r"^(src|app|lib)/".to_string(),
                },
            ],
            forbidden_combinations: vec![ForbiddenCombination {
                first: "schema_migration".to_string(),
                second: "application_code".to_string(),
            }],
        }
    }
}

/// A path tag: files matching `pattern` carry `tag`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathTag {
    pub tag: String,
    pub pattern: String,
}

/// Two tags that must not both be touched in one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForbiddenCombination {
    pub first: String,
    pub second: String,
}

/// MCP tool governance settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct McpSettings {
    /// Default-deny allowlist: role -> servers
    pub allowlist: BTreeMap<String, Vec<String>>,
    /// Known servers and their resolved hosts
    pub servers: BTreeMap<String, ServerSettings>,
    /// Calls per session across all servers
    pub global_max_calls: u32,
    /// Hosts matching any pattern need production authorization
    pub production_host_patterns: Vec<String>,
    /// Substrings of a tool name that imply a write
    pub write_tool_markers: Vec<String>,
    /// Largest payload accepted without a prior scope declaration
    pub max_payload_bytes: u64,
    /// Bounded wait for a tool server
    pub call_timeout_ms: u64,
    /// Consecutive writes across distinct resources that get rejected
    pub cascade_write_limit: usize,
}

impl Default for McpSettings {
    fn default() -> Self {
        Self {
            allowlist: BTreeMap::new(),
            servers: BTreeMap::new(),
            global_max_calls: 200,
            production_host_patterns: vec![r"(?i)(^|[.-])prod(uction)?([.-]|$)".to_string()],
            write_tool_markers: [
                "write", "create", "update", "delete", "remove", "insert", "drop", "push",
                "merge", "commit", "deploy", "exec",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            max_payload_bytes: 1024 * 1024,
            call_timeout_ms: 30_000,
            cascade_write_limit: 3,
        }
    }
}

/// A single MCP server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub max_calls: Option<u32>,
}

/// Kill switch settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KillSwitchSettings {
    /// Declarations strictly below this value count toward collapse
    pub confidence_floor: u8,
    /// Distinct low-confidence tasks in a row that trip the switch
    pub collapse_window: usize,
    /// Consecutive error-recovery cycles that trip the switch
    pub cascade_cycles: usize,
    /// Constitution rules that no session may break
    pub hard_rules: Vec<HardRule>,
}

impl Default for KillSwitchSettings {
    fn default() -> Self {
        Self {
            confidence_floor: 30,
            collapse_window: 3,
            cascade_cycles: 3,
            hard_rules: vec![
                HardRule {
                    id: "governance-file-write".to_string(),
                    description: "Governance files are changed by humans only".to_string(),
                    kind: RuleKind::Path,
                    pattern: r"(^|/)(CLAUDE\.md|\.governance/)".to_string(),
                },
                HardRule {
                    id: "no-force-push".to_string(),
                    description: "History is never rewritten on shared branches".to_string(),
                    kind: RuleKind::Tool,
                    pattern: r"(?i)force[_-]?push".to_string(),
                },
            ],
        }
    }
}

/// A constitution rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardRule {
    pub id: String,
    pub description: String,
    pub kind: RuleKind,
    pub pattern: String,
}

/// What a hard rule matches against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    /// File paths written by the session
    Path,
    /// Tool names invoked by the session
    Tool,
}

/// Quality gate settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualitySettings {
    pub deductions: Deductions,
    /// Files longer than this earn a complexity warning when scanned
    pub max_file_lines: usize,
    /// Whether a forcing security failure overrides the arithmetic verdict
    pub security_failure_forces_reject: bool,
}

impl Default for QualitySettings {
    fn default() -> Self {
        Self {
            deductions: Deductions::default(),
            max_file_lines: 400,
            security_failure_forces_reject: true,
        }
    }
}

/// Points deducted per failed check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Deductions {
    pub security: u32,
    pub contract: u32,
    pub architecture: u32,
    pub test_coverage: u32,
    pub documentation: u32,
    pub naming: u32,
    pub complexity: u32,
}

impl Default for Deductions {
    fn default() -> Self {
        Self {
            security: 25,
            contract: 15,
            architecture: 10,
            test_coverage: 10,
            documentation: 5,
            naming: 5,
            complexity: 2,
        }
    }
}

/// Progressive trust settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustSettings {
    /// Clean sessions needed for 1→2, 2→3 and 3→4
    pub promotion_thresholds: Vec<u32>,
}

impl Default for TrustSettings {
    fn default() -> Self {
        Self {
            promotion_thresholds: vec![5, 10, 15],
        }
    }
}

/// Health scorer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    /// Section length ratio tolerance for template drift
    pub drift_threshold: f64,
    pub min_changelog_entries: usize,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            drift_threshold: 0.5,
            min_changelog_entries: 3,
        }
    }
}

/// Audit log settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSettings {
    pub retention_days: u32,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            retention_days: MIN_AUDIT_RETENTION_DAYS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_matches_documented_defaults() {
        let config = GovernanceConfig::default();
        assert_eq!(config.contract.confidence_ceiling, 85);
        assert_eq!(config.blast_radius.max_files_modified, 15);
        assert_eq!(config.blast_radius.max_lines_per_file, 200);
        assert_eq!(config.blast_radius.max_new_files, 10);
        assert_eq!(config.mcp.global_max_calls, 200);
        assert_eq!(config.mcp.max_payload_bytes, 1_048_576);
        assert_eq!(config.trust.promotion_thresholds, vec![5, 10, 15]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = GovernanceConfig::new()
            .with_confidence_ceiling(80)
            .with_allowed_server("implementer", "github")
            .with_server("github", "api.github.com", Some(50));

        assert_eq!(config.contract.confidence_ceiling, 80);
        assert_eq!(config.mcp.allowlist["implementer"], vec!["github"]);
        assert_eq!(config.mcp.servers["github"].max_calls, Some(50));
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = GovernanceConfig::from_toml_str(
            r#"
            [contract]
            confidence_ceiling = 80

            [mcp.allowlist]
            reviewer = ["github"]
            "#,
        )
        .unwrap();

        assert_eq!(config.contract.confidence_ceiling, 80);
        assert_eq!(config.blast_radius.max_files_modified, 15);
        assert_eq!(config.mcp.allowlist["reviewer"], vec!["github"]);
    }

    #[test]
    fn test_short_retention_rejected() {
        let err = GovernanceConfig::from_toml_str("[audit]\nretention_days = 30\n").unwrap_err();
        assert!(err.to_string().contains("retention_days"));
        assert!(err.to_string().contains("30"));
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let mut config = GovernanceConfig::default();
        config.blast_radius.critical_paths.push("(unclosed".to_string());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("critical_paths"));
    }

    #[test]
    fn test_toml_round_trip() {
        let config = GovernanceConfig::default().with_server("jira", "jira.internal", None);
        let rendered = config.to_toml_string().unwrap();
        let parsed = GovernanceConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(config, parsed);
    }
}
