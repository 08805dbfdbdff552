//! Hierarchical configuration: org → team → repo
//!
//! Each layer is a TOML table. Layers are flattened to key paths and merged in
//! order on top of the built-in defaults. Every key carries a merge policy
//! declared in [`KEY_POLICIES`]:
//!
//! - `Specific`: the most specific layer that sets the key wins.
//! - `Safety(direction)`: a lower layer may only narrow the inherited value.
//!   Widening is an `InheritanceViolation` unless an active break-glass record
//!   names the key.
//!
//! The org layer is the top authority and may set any value. Team and repo
//! layers are checked against everything above them, defaults included.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use tracing::{debug, info, warn};

use super::GovernanceConfig;
use crate::break_glass::BreakGlassRegistry;
use crate::error::{GovernanceError, Result};
use crate::types::Timestamp;

/// Position of a layer in the hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerLevel {
    Defaults,
    Org,
    Team,
    Repo,
}

impl fmt::Display for LayerLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LayerLevel::Defaults => "defaults",
            LayerLevel::Org => "org",
            LayerLevel::Team => "team",
            LayerLevel::Repo => "repo",
        };
        f.write_str(name)
    }
}

/// Which way a safety key may move
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Narrowing {
    /// Smaller numbers are stricter
    Lower,
    /// Larger numbers are stricter (element-wise for arrays)
    Higher,
    /// More list entries are stricter
    Superset,
    /// Fewer list entries are stricter
    Subset,
    /// `true` is stricter than `false`
    TrueIsStrict,
    /// Only the org layer may change the value
    Fixed,
}

/// Merge policy of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Higher-wins: lower layers may only narrow
    Safety(Narrowing),
    /// Specific-wins
    Specific,
}

/// Key-policy schema. `*` matches exactly one path segment.
pub const KEY_POLICIES: &[(&str, MergePolicy)] = &[
    ("contract.confidence_ceiling", MergePolicy::Safety(Narrowing::Lower)),
    ("blast_radius.low_max_files", MergePolicy::Safety(Narrowing::Lower)),
    ("blast_radius.medium_max_files", MergePolicy::Safety(Narrowing::Lower)),
    ("blast_radius.max_files_modified", MergePolicy::Safety(Narrowing::Lower)),
    ("blast_radius.max_lines_per_file", MergePolicy::Safety(Narrowing::Lower)),
    ("blast_radius.max_new_files", MergePolicy::Safety(Narrowing::Lower)),
    ("blast_radius.critical_paths", MergePolicy::Safety(Narrowing::Superset)),
    ("blast_radius.path_tags", MergePolicy::Safety(Narrowing::Superset)),
    ("blast_radius.forbidden_combinations", MergePolicy::Safety(Narrowing::Superset)),
    ("mcp.allowlist.*", MergePolicy::Safety(Narrowing::Subset)),
    ("mcp.servers.*.host", MergePolicy::Safety(Narrowing::Fixed)),
    ("mcp.servers.*.max_calls", MergePolicy::Safety(Narrowing::Lower)),
    ("mcp.global_max_calls", MergePolicy::Safety(Narrowing::Lower)),
    ("mcp.production_host_patterns", MergePolicy::Safety(Narrowing::Superset)),
    ("mcp.write_tool_markers", MergePolicy::Safety(Narrowing::Superset)),
    ("mcp.max_payload_bytes", MergePolicy::Safety(Narrowing::Lower)),
    ("mcp.cascade_write_limit", MergePolicy::Safety(Narrowing::Lower)),
    ("kill_switch.confidence_floor", MergePolicy::Safety(Narrowing::Higher)),
    ("kill_switch.collapse_window", MergePolicy::Safety(Narrowing::Lower)),
    ("kill_switch.cascade_cycles", MergePolicy::Safety(Narrowing::Lower)),
    ("kill_switch.hard_rules", MergePolicy::Safety(Narrowing::Superset)),
    ("quality.deductions.*", MergePolicy::Safety(Narrowing::Higher)),
    ("quality.security_failure_forces_reject", MergePolicy::Safety(Narrowing::TrueIsStrict)),
    ("trust.promotion_thresholds", MergePolicy::Safety(Narrowing::Higher)),
    ("audit.retention_days", MergePolicy::Safety(Narrowing::Higher)),
];

type KeyPath = Vec<String>;

fn render_key(path: &[String]) -> String {
    path.join(".")
}

/// Policy declared for a key path; unlisted keys are specific-wins
pub fn policy_for(path: &[String]) -> MergePolicy {
    KEY_POLICIES
        .iter()
        .find(|(pattern, _)| {
            let segments: Vec<&str> = pattern.split('.').collect();
            segments.len() == path.len()
                && segments
                    .iter()
                    .zip(path)
                    .all(|(s, p)| *s == "*" || *s == p.as_str())
        })
        .map(|(_, policy)| *policy)
        .unwrap_or(MergePolicy::Specific)
}

/// One level of the hierarchy
#[derive(Debug, Clone)]
pub struct ConfigLayer {
    pub level: LayerLevel,
    /// Where the layer came from, for reports
    pub source: String,
    pub values: toml::Table,
}

impl ConfigLayer {
    pub fn from_toml_str(level: LayerLevel, source: impl Into<String>, content: &str) -> Result<Self> {
        let values: toml::Table = toml::from_str(content)?;
        Ok(Self {
            level,
            source: source.into(),
            values,
        })
    }

    pub fn from_file(level: LayerLevel, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(level, path.display().to_string(), &content)
    }
}

/// A widening attempt found during resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InheritanceFinding {
    pub key: String,
    pub level: LayerLevel,
    pub parent: String,
    pub child: String,
    /// Break-glass record that excused the widening, if any
    pub excused_by: Option<String>,
}

impl InheritanceFinding {
    fn into_error(self) -> GovernanceError {
        GovernanceError::InheritanceViolation {
            key: self.key,
            parent: self.parent,
            child: self.child,
        }
    }
}

/// Result of a successful resolution
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub config: GovernanceConfig,
    /// Layer that supplied the final value of each key
    pub provenance: BTreeMap<String, LayerLevel>,
    /// Widenings accepted under break-glass
    pub overrides: Vec<InheritanceFinding>,
}

struct Merge {
    values: BTreeMap<KeyPath, toml::Value>,
    provenance: BTreeMap<KeyPath, LayerLevel>,
    findings: Vec<InheritanceFinding>,
}

fn flatten(table: &toml::Table, prefix: &mut KeyPath, out: &mut BTreeMap<KeyPath, toml::Value>) {
    for (key, value) in table {
        prefix.push(key.clone());
        match value {
            toml::Value::Table(inner) => flatten(inner, prefix, out),
            leaf => {
                out.insert(prefix.clone(), leaf.clone());
            }
        }
        prefix.pop();
    }
}

fn unflatten(values: &BTreeMap<KeyPath, toml::Value>) -> toml::Table {
    let mut root = toml::Table::new();
    'paths: for (path, value) in values {
        let Some((leaf, parents)) = path.split_last() else {
            continue;
        };
        let mut cursor = &mut root;
        for segment in parents {
            let entry = cursor
                .entry(segment.clone())
                .or_insert(toml::Value::Table(toml::Table::new()));
            match entry.as_table_mut() {
                Some(next) => cursor = next,
                // a leaf already occupies this prefix
                None => continue 'paths,
            }
        }
        cursor.insert(leaf.clone(), value.clone());
    }
    root
}

fn as_number(value: &toml::Value) -> Option<f64> {
    match value {
        toml::Value::Integer(i) => Some(*i as f64),
        toml::Value::Float(f) => Some(*f),
        _ => None,
    }
}

fn compare_numbers(parent: &toml::Value, child: &toml::Value, child_ok: fn(f64, f64) -> bool) -> bool {
    match (parent, child) {
        (toml::Value::Array(p), toml::Value::Array(c)) => {
            p.len() == c.len() && p.iter().zip(c).all(|(p, c)| compare_numbers(p, c, child_ok))
        }
        _ => match (as_number(parent), as_number(child)) {
            (Some(p), Some(c)) => child_ok(p, c),
            _ => false,
        },
    }
}

/// Whether `child` is at least as strict as `parent`
pub fn narrows(direction: Narrowing, parent: Option<&toml::Value>, child: &toml::Value) -> bool {
    match direction {
        Narrowing::Lower => parent.map_or(true, |p| compare_numbers(p, child, |p, c| c <= p)),
        Narrowing::Higher => parent.map_or(true, |p| compare_numbers(p, child, |p, c| c >= p)),
        Narrowing::Superset => match (parent, child) {
            (None, _) => true,
            (Some(toml::Value::Array(p)), toml::Value::Array(c)) => p.iter().all(|v| c.contains(v)),
            _ => false,
        },
        Narrowing::Subset => match (parent, child) {
            // an absent allowlist entry is an empty one
            (None, toml::Value::Array(c)) => c.is_empty(),
            (Some(toml::Value::Array(p)), toml::Value::Array(c)) => c.iter().all(|v| p.contains(v)),
            _ => false,
        },
        Narrowing::TrueIsStrict => match (parent, child) {
            (Some(toml::Value::Boolean(true)), toml::Value::Boolean(c)) => *c,
            (_, toml::Value::Boolean(_)) => true,
            _ => false,
        },
        Narrowing::Fixed => parent.map_or(true, |p| p == child),
    }
}

/// Value a key has when no layer sets it, beyond the rendered defaults.
/// A server without a host entry resolves to its own name.
fn implied_value(path: &[String]) -> Option<toml::Value> {
    match path {
        [mcp, servers, name, host] if mcp == "mcp" && servers == "servers" && host == "host" => {
            Some(toml::Value::String(name.clone()))
        }
        _ => None,
    }
}

fn merge(layers: &[ConfigLayer], registry: &BreakGlassRegistry, at: Timestamp) -> Result<Merge> {
    let defaults = toml::Value::try_from(GovernanceConfig::default())
        .map_err(|e| GovernanceError::Config(format!("cannot render defaults: {e}")))?;
    let mut values = BTreeMap::new();
    if let toml::Value::Table(table) = &defaults {
        flatten(table, &mut Vec::new(), &mut values);
    }
    let mut provenance: BTreeMap<KeyPath, LayerLevel> =
        values.keys().map(|k| (k.clone(), LayerLevel::Defaults)).collect();
    let mut findings = Vec::new();

    let mut ordered: Vec<&ConfigLayer> = layers.iter().collect();
    ordered.sort_by_key(|layer| layer.level);

    for layer in ordered {
        let mut flat = BTreeMap::new();
        flatten(&layer.values, &mut Vec::new(), &mut flat);
        debug!(level = %layer.level, source = %layer.source, keys = flat.len(), "Merging config layer");

        for (path, child) in flat {
            let implied = implied_value(&path);
            let parent = values.get(&path).or(implied.as_ref());
            if layer.level > LayerLevel::Org {
                if let MergePolicy::Safety(direction) = policy_for(&path) {
                    if !narrows(direction, parent, &child) {
                        let key = render_key(&path);
                        let excused_by = registry.active_for(&key, at).map(|r| r.id.clone());
                        let finding = InheritanceFinding {
                            key: key.clone(),
                            level: layer.level,
                            parent: parent.map_or_else(|| "<unset>".to_string(), |p| p.to_string()),
                            child: child.to_string(),
                            excused_by: excused_by.clone(),
                        };
                        match &excused_by {
                            Some(record) => info!(
                                key = %key,
                                level = %layer.level,
                                record = %record,
                                "Safety key widened under break-glass"
                            ),
                            None => warn!(
                                key = %key,
                                level = %layer.level,
                                parent = %finding.parent,
                                child = %finding.child,
                                "Lower layer attempted to widen a safety key"
                            ),
                        }
                        let excused = excused_by.is_some();
                        findings.push(finding);
                        if !excused {
                            continue;
                        }
                    }
                }
            }
            provenance.insert(path.clone(), layer.level);
            values.insert(path, child);
        }
    }

    Ok(Merge {
        values,
        provenance,
        findings,
    })
}

/// Resolve the layers into an effective configuration.
///
/// Fails with the first unexcused `InheritanceViolation` in key order, or with
/// a `Config` error if the merged result does not validate.
pub fn resolve(
    layers: &[ConfigLayer],
    registry: &BreakGlassRegistry,
    at: Timestamp,
) -> Result<ResolvedConfig> {
    let merged = merge(layers, registry, at)?;

    let (overrides, violations): (Vec<_>, Vec<_>) = merged
        .findings
        .into_iter()
        .partition(|f| f.excused_by.is_some());
    if let Some(first) = violations.into_iter().next() {
        return Err(first.into_error());
    }

    let config: GovernanceConfig = toml::Value::Table(unflatten(&merged.values)).try_into()?;
    config.validate()?;

    Ok(ResolvedConfig {
        config,
        provenance: merged
            .provenance
            .into_iter()
            .map(|(k, v)| (render_key(&k), v))
            .collect(),
        overrides,
    })
}

/// Every widening attempt across the layers, excused or not
pub fn inspect(
    layers: &[ConfigLayer],
    registry: &BreakGlassRegistry,
    at: Timestamp,
) -> Result<Vec<InheritanceFinding>> {
    Ok(merge(layers, registry, at)?.findings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::break_glass::BreakGlassRecord;
    use crate::config::BlastRadiusSettings;
    use chrono::{Duration, TimeZone, Utc};

    fn when() -> Timestamp {
        Utc.with_ymd_and_hms(2026, 5, 4, 12, 0, 0).unwrap()
    }

    fn layer(level: LayerLevel, content: &str) -> ConfigLayer {
        ConfigLayer::from_toml_str(level, level.to_string(), content).unwrap()
    }

    #[test]
    fn test_policy_lookup() {
        let key = |s: &str| s.split('.').map(String::from).collect::<Vec<_>>();
        assert_eq!(
            policy_for(&key("mcp.allowlist.implementer")),
            MergePolicy::Safety(Narrowing::Subset)
        );
        assert_eq!(
            policy_for(&key("mcp.servers.github.max_calls")),
            MergePolicy::Safety(Narrowing::Lower)
        );
        assert_eq!(
            policy_for(&key("mcp.servers.github.host")),
            MergePolicy::Safety(Narrowing::Fixed)
        );
        assert_eq!(
            policy_for(&key("blast_radius.path_tags")),
            MergePolicy::Safety(Narrowing::Superset)
        );
        assert_eq!(policy_for(&key("mcp.call_timeout_ms")), MergePolicy::Specific);
        assert_eq!(policy_for(&key("health.drift_threshold")), MergePolicy::Specific);
    }

    #[test]
    fn test_narrowing_accepted_and_specific_wins() {
        let layers = vec![
            layer(LayerLevel::Org, "[contract]\nconfidence_ceiling = 85\n[mcp]\ncall_timeout_ms = 20000\n"),
            layer(LayerLevel::Team, "[contract]\nconfidence_ceiling = 80\n"),
            layer(LayerLevel::Repo, "[mcp]\ncall_timeout_ms = 45000\n"),
        ];
        let resolved = resolve(&layers, &BreakGlassRegistry::new(), when()).unwrap();

        assert_eq!(resolved.config.contract.confidence_ceiling, 80);
        assert_eq!(resolved.config.mcp.call_timeout_ms, 45_000);
        assert_eq!(resolved.provenance["contract.confidence_ceiling"], LayerLevel::Team);
        assert_eq!(resolved.provenance["mcp.call_timeout_ms"], LayerLevel::Repo);
        assert_eq!(resolved.provenance["audit.retention_days"], LayerLevel::Defaults);
    }

    #[test]
    fn test_widening_rejected() {
        let layers = vec![
            layer(LayerLevel::Org, "[contract]\nconfidence_ceiling = 80\n"),
            layer(LayerLevel::Repo, "[contract]\nconfidence_ceiling = 95\n"),
        ];
        let err = resolve(&layers, &BreakGlassRegistry::new(), when()).unwrap_err();
        match err {
            GovernanceError::InheritanceViolation { key, parent, child } => {
                assert_eq!(key, "contract.confidence_ceiling");
                assert_eq!(parent, "80");
                assert_eq!(child, "95");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_allowlist_cannot_gain_servers() {
        let layers = vec![
            layer(LayerLevel::Org, "[mcp.allowlist]\nimplementer = [\"github\"]\n"),
            layer(LayerLevel::Team, "[mcp.allowlist]\nimplementer = [\"github\", \"prod-db\"]\n"),
        ];
        assert!(resolve(&layers, &BreakGlassRegistry::new(), when()).is_err());

        let layers = vec![
            layer(LayerLevel::Org, "[mcp.allowlist]\nimplementer = [\"github\", \"jira\"]\n"),
            layer(LayerLevel::Team, "[mcp.allowlist]\nimplementer = [\"jira\"]\n"),
        ];
        let resolved = resolve(&layers, &BreakGlassRegistry::new(), when()).unwrap();
        assert_eq!(resolved.config.mcp.allowlist["implementer"], vec!["jira"]);
    }

    #[test]
    fn test_new_role_below_org_is_widening() {
        let layers = vec![layer(LayerLevel::Repo, "[mcp.allowlist]\nops = [\"k8s\"]\n")];
        let err = resolve(&layers, &BreakGlassRegistry::new(), when()).unwrap_err();
        assert!(err.to_string().contains("mcp.allowlist.ops"));
    }

    #[test]
    fn test_critical_paths_may_only_grow() {
        let layers = vec![layer(LayerLevel::Team, "[blast_radius]\ncritical_paths = []\n")];
        assert!(resolve(&layers, &BreakGlassRegistry::new(), when()).is_err());
    }

    #[test]
    fn test_server_host_is_fixed_below_org() {
        let org = layer(
            LayerLevel::Org,
            "[mcp.servers.orders-db]\nhost = \"orders.prod.internal\"\nmax_calls = 20\n",
        );

        let remapped = vec![org.clone(), layer(LayerLevel::Repo, "[mcp.servers.orders-db]\nhost = \"orders-db\"\n")];
        let err = resolve(&remapped, &BreakGlassRegistry::new(), when()).unwrap_err();
        assert!(matches!(err, GovernanceError::InheritanceViolation { ref key, .. } if key == "mcp.servers.orders-db.host"));

        // restating the inherited host and narrowing the limit is fine
        let narrowed = vec![
            org,
            layer(
                LayerLevel::Team,
                "[mcp.servers.orders-db]\nhost = \"orders.prod.internal\"\nmax_calls = 5\n",
            ),
        ];
        let resolved = resolve(&narrowed, &BreakGlassRegistry::new(), when()).unwrap();
        assert_eq!(resolved.config.mcp.servers["orders-db"].max_calls, Some(5));

        // an unlisted server resolves to its own name and keeps doing so
        let aliased = vec![layer(LayerLevel::Repo, "[mcp.servers.billing]\nhost = \"billing.prod.internal\"\n")];
        assert!(resolve(&aliased, &BreakGlassRegistry::new(), when()).is_err());
        let plain = vec![layer(LayerLevel::Repo, "[mcp.servers.billing]\nhost = \"billing\"\n")];
        assert!(resolve(&plain, &BreakGlassRegistry::new(), when()).is_ok());
    }

    #[test]
    fn test_path_tags_may_only_grow() {
        let replaced = vec![layer(
            LayerLevel::Repo,
            "[[blast_radius.path_tags]]\ntag = \"docs\"\npattern = \"^docs/\"\n",
        )];
        let err = resolve(&replaced, &BreakGlassRegistry::new(), when()).unwrap_err();
        assert!(err.to_string().contains("blast_radius.path_tags"));

        let mut extended = toml::Table::new();
        let mut tags = toml::Value::try_from(BlastRadiusSettings::default().path_tags).unwrap();
        if let toml::Value::Array(items) = &mut tags {
            let mut docs = toml::Table::new();
            docs.insert("tag".into(), "docs".into());
            docs.insert("pattern".into(), "^docs/".into());
            items.push(toml::Value::Table(docs));
        }
        let mut blast_radius = toml::Table::new();
        blast_radius.insert("path_tags".into(), tags);
        extended.insert("blast_radius".into(), toml::Value::Table(blast_radius));
        let layers = vec![ConfigLayer {
            level: LayerLevel::Repo,
            source: "repo".into(),
            values: extended,
        }];
        let resolved = resolve(&layers, &BreakGlassRegistry::new(), when()).unwrap();
        assert_eq!(
            resolved.config.blast_radius.path_tags.len(),
            BlastRadiusSettings::default().path_tags.len() + 1
        );
    }

    #[test]
    fn test_break_glass_excuses_widening() {
        let mut registry = BreakGlassRegistry::new();
        registry
            .register(
                BreakGlassRecord::new(
                    "sam",
                    "incident bulk fix",
                    "blast_radius.max_files_modified",
                    when() - Duration::hours(1),
                    Duration::hours(4),
                )
                .unwrap(),
            )
            .unwrap();

        let layers = vec![layer(LayerLevel::Repo, "[blast_radius]\nmax_files_modified = 40\n")];
        let resolved = resolve(&layers, &registry, when()).unwrap();
        assert_eq!(resolved.config.blast_radius.max_files_modified, 40);
        assert_eq!(resolved.overrides.len(), 1);

        // expired by the time of a later evaluation
        let later = when() + Duration::hours(5);
        assert!(resolve(&layers, &registry, later).is_err());
    }

    #[test]
    fn test_inspect_lists_every_widening() {
        let layers = vec![
            layer(LayerLevel::Team, "[mcp]\nglobal_max_calls = 500\n"),
            layer(LayerLevel::Repo, "[quality.deductions]\nsecurity = 5\n"),
        ];
        let findings = inspect(&layers, &BreakGlassRegistry::new(), when()).unwrap();
        let keys: Vec<_> = findings.iter().map(|f| f.key.as_str()).collect();
        assert_eq!(keys, vec!["mcp.global_max_calls", "quality.deductions.security"]);
    }

    #[test]
    fn test_org_may_loosen_defaults() {
        let layers = vec![layer(LayerLevel::Org, "[blast_radius]\nmax_files_modified = 20\n")];
        let resolved = resolve(&layers, &BreakGlassRegistry::new(), when()).unwrap();
        assert_eq!(resolved.config.blast_radius.max_files_modified, 20);
    }
}
