//! Multi-agent task graph
//!
//! A coordinating agent splits work into tasks for specialist agents. Tasks
//! form an acyclic graph with two edge kinds:
//!
//! - `Sequential`: the source must finish before the target starts
//! - `Independent`: the two tasks may run in parallel; contradicts any
//!   sequential path between them
//!
//! Each task carries a scope boundary (path prefixes) and its own output
//! contract. Aggregation only combines validated outputs of leaf tasks.

use petgraph::algo::{has_path_connecting, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, warn};

use crate::contract::{
    ArchitecturalImpact, ContractReport, ContractStatus, ContractValidator, FileChangeSummary, OutputContract,
};
use crate::error::{GovernanceError, Result};
use crate::types::AgentRole;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Sequential,
    Independent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNode {
    pub id: String,
    pub agent: AgentRole,
    pub description: String,
    /// Path prefixes this task may change
    pub scope: Vec<String>,
    /// Set once a contract passed validation and scope checks
    pub output: Option<OutputContract>,
}

impl TaskNode {
    pub fn new(id: impl Into<String>, agent: AgentRole, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            agent,
            description: description.into(),
            scope: Vec::new(),
            output: None,
        }
    }

    pub fn with_scope(mut self, prefix: impl Into<String>) -> Self {
        self.scope.push(prefix.into());
        self
    }

    /// Whether `path` lies inside the scope; an empty scope allows nothing
    pub fn in_scope(&self, path: &str) -> bool {
        self.scope.iter().any(|prefix| path.starts_with(prefix.as_str()))
    }
}

/// Combined result of all leaf tasks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateOutput {
    pub tasks: Vec<String>,
    /// Worst leaf status
    pub status: ContractStatus,
    /// Lowest leaf confidence
    pub confidence: u8,
    pub not_verified: Vec<String>,
    /// Highest leaf impact
    pub architectural_impact: ArchitecturalImpact,
    pub requires_review: bool,
    pub requires_review_reasons: Vec<String>,
    pub files_changed: Vec<FileChangeSummary>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    graph: DiGraph<String, EdgeKind>,
    index: HashMap<String, NodeIndex>,
    tasks: HashMap<String, TaskNode>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn task(&self, id: &str) -> Option<&TaskNode> {
        self.tasks.get(id)
    }

    pub fn add_task(&mut self, task: TaskNode) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(GovernanceError::TaskGraph(format!("task {} already exists", task.id)));
        }
        let idx = self.graph.add_node(task.id.clone());
        self.index.insert(task.id.clone(), idx);
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    fn node(&self, id: &str) -> Result<NodeIndex> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| GovernanceError::TaskGraph(format!("unknown task {id}")))
    }

    /// Same nodes, sequential edges only
    fn sequential_view(&self) -> DiGraph<String, ()> {
        self.graph.filter_map(
            |_, id| Some(id.clone()),
            |_, kind| (*kind == EdgeKind::Sequential).then_some(()),
        )
    }

    fn declared_independent(&self, a: NodeIndex, b: NodeIndex) -> bool {
        self.graph
            .edges_connecting(a, b)
            .chain(self.graph.edges_connecting(b, a))
            .any(|e| *e.weight() == EdgeKind::Independent)
    }

    /// `before` must finish before `after` starts
    pub fn add_sequential(&mut self, before: &str, after: &str) -> Result<()> {
        let (b, a) = (self.node(before)?, self.node(after)?);
        if b == a || has_path_connecting(&self.sequential_view(), a, b, None) {
            return Err(GovernanceError::TaskGraph(format!(
                "edge {before} -> {after} would create a cycle"
            )));
        }
        if self.declared_independent(a, b) {
            return Err(GovernanceError::TaskGraph(format!(
                "{before} and {after} are declared independent"
            )));
        }
        self.graph.add_edge(b, a, EdgeKind::Sequential);
        debug!(before, after, "Sequential task edge added");
        Ok(())
    }

    pub fn add_independent(&mut self, first: &str, second: &str) -> Result<()> {
        let (f, s) = (self.node(first)?, self.node(second)?);
        let view = self.sequential_view();
        if f == s || has_path_connecting(&view, f, s, None) || has_path_connecting(&view, s, f, None) {
            return Err(GovernanceError::TaskGraph(format!(
                "{first} and {second} are ordered by a sequential path and cannot be independent"
            )));
        }
        self.graph.add_edge(f, s, EdgeKind::Independent);
        Ok(())
    }

    /// Dependencies before dependents
    pub fn execution_order(&self) -> Result<Vec<&TaskNode>> {
        let view = self.sequential_view();
        let order = toposort(&view, None).map_err(|cycle| {
            GovernanceError::TaskGraph(format!("cycle through task {}", view[cycle.node_id()]))
        })?;
        Ok(order
            .into_iter()
            .filter_map(|idx| self.tasks.get(&view[idx]))
            .collect())
    }

    /// Tasks nothing else waits on
    pub fn leaves(&self) -> Vec<&TaskNode> {
        let mut leaves: Vec<&TaskNode> = self
            .index
            .iter()
            .filter(|(_, idx)| {
                !self
                    .graph
                    .edges_directed(**idx, Direction::Outgoing)
                    .any(|e| *e.weight() == EdgeKind::Sequential)
            })
            .filter_map(|(id, _)| self.tasks.get(id))
            .collect();
        leaves.sort_by(|a, b| a.id.cmp(&b.id));
        leaves
    }

    /// Validates a task's contract and records it if it passes.
    ///
    /// The report is returned either way. A contract that changes files
    /// outside the task's scope is rejected after validation.
    pub fn submit_output(&mut self, id: &str, validator: &ContractValidator, contract: &Value) -> Result<ContractReport> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| GovernanceError::TaskGraph(format!("unknown task {id}")))?;
        let report = validator.validate(format!("task {id}"), contract);

        let Some(valid) = report.contract.as_ref().filter(|_| report.is_mergeable()) else {
            warn!(task = id, errors = report.errors.len(), "Task output rejected");
            return Ok(report);
        };

        if let Some(outside) = valid.files_changed.iter().find(|f| !task.in_scope(&f.path)) {
            return Err(GovernanceError::ScopeAlert(format!(
                "task {id} changed {} outside its scope [{}]",
                outside.path,
                task.scope.join(", ")
            )));
        }
        task.output = Some(valid.clone());
        Ok(report)
    }

    /// Combines every leaf's validated output; fails if a leaf has none
    pub fn aggregate(&self) -> Result<AggregateOutput> {
        let leaves = self.leaves();
        let missing: Vec<&str> = leaves
            .iter()
            .filter(|t| t.output.is_none())
            .map(|t| t.id.as_str())
            .collect();
        if leaves.is_empty() || !missing.is_empty() {
            return Err(GovernanceError::TaskGraph(format!(
                "cannot aggregate: leaf tasks without a validated output: [{}]",
                missing.join(", ")
            )));
        }

        let outputs: Vec<(&str, &OutputContract)> = leaves
            .iter()
            .filter_map(|t| t.output.as_ref().map(|o| (t.id.as_str(), o)))
            .collect();

        let not_verified: BTreeSet<String> = outputs
            .iter()
            .flat_map(|(_, o)| o.not_verified.iter().cloned())
            .collect();

        Ok(AggregateOutput {
            tasks: outputs.iter().map(|(id, _)| id.to_string()).collect(),
            status: outputs.iter().map(|(_, o)| o.status).max().unwrap_or(ContractStatus::Fail),
            confidence: outputs.iter().map(|(_, o)| o.confidence).min().unwrap_or(0),
            not_verified: not_verified.into_iter().collect(),
            architectural_impact: outputs
                .iter()
                .map(|(_, o)| o.architectural_impact)
                .max()
                .unwrap_or(ArchitecturalImpact::None),
            requires_review: outputs.iter().any(|(_, o)| o.requires_review),
            requires_review_reasons: outputs
                .iter()
                .filter_map(|(id, o)| o.requires_review_reason.as_ref().map(|r| format!("{id}: {r}")))
                .collect(),
            files_changed: outputs
                .iter()
                .flat_map(|(_, o)| o.files_changed.iter().cloned())
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn contract(status: &str, confidence: u8, path: &str, not_verified: &[&str]) -> Value {
        json!({
            "status": status,
            "session": "s-1",
            "date": "2026-04-02",
            "model": "m",
            "files_changed": [{"path": path, "operation": "modified"}],
            "confidence": confidence,
            "not_verified": not_verified,
            "architectural_impact": "low",
            "requires_review": false,
            "requires_review_reason": null
        })
    }

    fn graph() -> TaskGraph {
        let mut g = TaskGraph::new();
        g.add_task(TaskNode::new("schema", AgentRole::new("db"), "migrate").with_scope("migrations/"))
            .unwrap();
        g.add_task(TaskNode::new("api", AgentRole::new("backend"), "endpoints").with_scope("src/api/"))
            .unwrap();
        g.add_task(TaskNode::new("docs", AgentRole::new("writer"), "docs").with_scope("docs/"))
            .unwrap();
        g.add_sequential("schema", "api").unwrap();
        g
    }

    #[test]
    fn test_cycle_rejected() {
        let mut g = graph();
        assert!(g.add_sequential("api", "schema").is_err());
        assert!(g.add_sequential("api", "api").is_err());
    }

    #[test]
    fn test_independent_contradiction() {
        let mut g = graph();
        assert!(g.add_independent("schema", "api").is_err());
        g.add_independent("api", "docs").unwrap();
        assert!(g.add_sequential("docs", "api").is_err());
    }

    #[test]
    fn test_execution_order_and_leaves() {
        let g = graph();
        let order: Vec<&str> = g.execution_order().unwrap().iter().map(|t| t.id.as_str()).collect();
        let pos = |id: &str| order.iter().position(|x| *x == id).unwrap();
        assert!(pos("schema") < pos("api"));

        let leaves: Vec<&str> = g.leaves().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(leaves, vec!["api", "docs"]);
    }

    #[test]
    fn test_out_of_scope_output_rejected() {
        let mut g = graph();
        let validator = ContractValidator::new(85);
        let err = g
            .submit_output("api", &validator, &contract("PASS", 80, "src/db.rs", &[]))
            .unwrap_err();
        assert!(err.to_string().contains("src/db.rs"));
        assert!(g.task("api").unwrap().output.is_none());
    }

    #[test]
    fn test_aggregate_requires_all_leaves() {
        let mut g = graph();
        let validator = ContractValidator::new(85);
        g.submit_output("api", &validator, &contract("PASS", 80, "src/api/users.rs", &[]))
            .unwrap();
        assert!(g.aggregate().is_err());

        // invalid contract is reported but not recorded
        let report = g
            .submit_output("docs", &validator, &contract("PASS", 99, "docs/api.md", &[]))
            .unwrap();
        assert!(!report.is_mergeable());
        assert!(g.aggregate().is_err());

        g.submit_output("docs", &validator, &contract("WARN", 70, "docs/api.md", &["examples"]))
            .unwrap();
        let agg = g.aggregate().unwrap();
        assert_eq!(agg.tasks, vec!["api", "docs"]);
        assert_eq!(agg.status, ContractStatus::Warn);
        assert_eq!(agg.confidence, 70);
        assert_eq!(agg.not_verified, vec!["examples"]);
        assert_eq!(agg.files_changed.len(), 2);
    }
}
