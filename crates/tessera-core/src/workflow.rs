//! The workflow graph model: definitions, nodes, edges, retry policy.

use crate::error::{TesseraError, TesseraResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Configures retry behaviour for a node whose failures are recoverable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub backoff_base_ms: u64,
    /// Maximum delay in milliseconds (cap for exponential backoff).
    pub backoff_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_base_ms: 200,
            backoff_max_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay for a given zero-based attempt, capped at
    /// `backoff_max_ms`. Jitter is applied by the caller.
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        self.backoff_base_ms
            .saturating_mul(2u64.saturating_pow(attempt))
            .min(self.backoff_max_ms)
    }
}

/// The kind of work a workflow node performs.
///
/// One variant per node type with an explicit dispatch site in the engine;
/// deliberately a sum type rather than a trait hierarchy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NodeKind {
    /// Run an agent of the given capability type.
    Agent {
        /// Capability type resolved through the registry.
        agent_type: String,
    },
    /// Evaluate a condition expression against the execution state.
    Condition {
        /// Expression in the form `"<dotted.path> <op> <literal>"`.
        expression: String,
    },
    /// Fan out a bounded batch of agent branches and rejoin.
    Parallel {
        /// Node ids of the branches to execute.
        branches: Vec<String>,
        /// Upper bound on concurrently running branches.
        #[serde(default = "default_max_concurrency")]
        max_concurrency: usize,
    },
    /// Suspend the execution until a human supplies input.
    Human {
        /// Prompt shown to the operator, if any.
        #[serde(default)]
        prompt: Option<String>,
    },
    /// Invoke a registered tool by name.
    Tool {
        /// The tool to invoke.
        tool: String,
        /// Arguments passed to the tool.
        #[serde(default)]
        args: Value,
    },
}

fn default_max_concurrency() -> usize {
    3
}

/// One step in a workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    /// Unique node id within the definition.
    pub id: String,
    /// What this node does.
    #[serde(flatten)]
    pub kind: NodeKind,
    /// Node-level configuration passed through to the adapter.
    #[serde(default)]
    pub config: HashMap<String, Value>,
    /// Retry policy for recoverable failures; `None` disables retries.
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
}

impl WorkflowNode {
    /// Creates an agent node.
    pub fn agent(id: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: NodeKind::Agent {
                agent_type: agent_type.into(),
            },
            config: HashMap::new(),
            retry_policy: None,
        }
    }

    /// Creates a condition node.
    pub fn condition(id: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: NodeKind::Condition {
                expression: expression.into(),
            },
            config: HashMap::new(),
            retry_policy: None,
        }
    }

    /// Creates a tool node.
    pub fn tool(id: impl Into<String>, tool: impl Into<String>, args: Value) -> Self {
        Self {
            id: id.into(),
            kind: NodeKind::Tool {
                tool: tool.into(),
                args,
            },
            config: HashMap::new(),
            retry_policy: None,
        }
    }

    /// Attaches a retry policy.
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Adds a config entry.
    pub fn with_config(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }
}

/// A directed edge between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEdge {
    /// Source node id.
    pub source: String,
    /// Target node id.
    pub target: String,
    /// Optional condition expression gating this edge.
    #[serde(default)]
    pub condition: Option<String>,
}

impl WorkflowEdge {
    /// Creates an unconditional edge.
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            condition: None,
        }
    }

    /// Creates a conditional edge.
    pub fn when(
        source: impl Into<String>,
        target: impl Into<String>,
        condition: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            condition: Some(condition.into()),
        }
    }
}

/// An immutable workflow definition: a directed graph of nodes.
///
/// Node and edge declaration order is significant — edge tie-breaking and
/// router-style stable ordering depend on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Definition id.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Node the execution starts at.
    pub entry_point: String,
    /// Nodes whose completion terminates the workflow.
    #[serde(default)]
    pub exit_points: Vec<String>,
    /// Declaration-ordered node set.
    pub nodes: Vec<WorkflowNode>,
    /// Declaration-ordered edge set.
    #[serde(default)]
    pub edges: Vec<WorkflowEdge>,
}

impl WorkflowDefinition {
    /// Looks up a node by id.
    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Edges whose source is the given node, in declaration order.
    pub fn outgoing(&self, node_id: &str) -> Vec<&WorkflowEdge> {
        self.edges.iter().filter(|e| e.source == node_id).collect()
    }

    /// Validates graph invariants: the entry point and every edge endpoint,
    /// exit point, and parallel branch must reference an existing node.
    pub fn validate(&self) -> TesseraResult<()> {
        let exists = |id: &str| self.nodes.iter().any(|n| n.id == id);

        if !exists(&self.entry_point) {
            return Err(TesseraError::Workflow(format!(
                "workflow '{}': entry point '{}' not found",
                self.id, self.entry_point
            )));
        }
        for exit in &self.exit_points {
            if !exists(exit) {
                return Err(TesseraError::Workflow(format!(
                    "workflow '{}': exit point '{exit}' not found",
                    self.id
                )));
            }
        }
        for edge in &self.edges {
            if !exists(&edge.source) || !exists(&edge.target) {
                return Err(TesseraError::Workflow(format!(
                    "workflow '{}': edge {} -> {} references a missing node",
                    self.id, edge.source, edge.target
                )));
            }
        }
        for node in &self.nodes {
            if let NodeKind::Parallel { branches, .. } = &node.kind {
                for branch in branches {
                    if !exists(branch) {
                        return Err(TesseraError::Workflow(format!(
                            "workflow '{}': parallel node '{}' references missing branch '{branch}'",
                            self.id, node.id
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn two_node_definition() -> WorkflowDefinition {
        WorkflowDefinition {
            id: "wf".to_string(),
            name: "test".to_string(),
            entry_point: "n1".to_string(),
            exit_points: vec!["n2".to_string()],
            nodes: vec![
                WorkflowNode::agent("n1", "text-generator"),
                WorkflowNode::agent("n2", "text-generator"),
            ],
            edges: vec![WorkflowEdge::new("n1", "n2")],
        }
    }

    #[test]
    fn valid_definition_passes() {
        assert!(two_node_definition().validate().is_ok());
    }

    #[test]
    fn missing_entry_point_rejected() {
        let mut def = two_node_definition();
        def.entry_point = "nope".to_string();
        assert!(def.validate().is_err());
    }

    #[test]
    fn dangling_edge_rejected() {
        let mut def = two_node_definition();
        def.edges.push(WorkflowEdge::new("n2", "ghost"));
        assert!(def.validate().is_err());
    }

    #[test]
    fn missing_parallel_branch_rejected() {
        let mut def = two_node_definition();
        def.nodes.push(WorkflowNode {
            id: "p".to_string(),
            kind: NodeKind::Parallel {
                branches: vec!["ghost".to_string()],
                max_concurrency: 3,
            },
            config: HashMap::new(),
            retry_policy: None,
        });
        assert!(def.validate().is_err());
    }

    #[test]
    fn outgoing_preserves_declaration_order() {
        let mut def = two_node_definition();
        def.edges.push(WorkflowEdge::when("n1", "n1", "x == 1"));
        let out = def.outgoing("n1");
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].target, "n2");
        assert_eq!(out[1].target, "n1");
    }

    #[test]
    fn node_kind_serde_tagging() {
        let node = WorkflowNode::agent("n1", "image-generator");
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["type"], "agent");
        assert_eq!(json["agent_type"], "image-generator");

        let parsed: WorkflowNode = serde_json::from_value(serde_json::json!({
            "id": "t1",
            "type": "tool",
            "tool": "web-search",
        }))
        .unwrap();
        assert!(matches!(parsed.kind, NodeKind::Tool { .. }));
    }

    #[test]
    fn backoff_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            backoff_base_ms: 200,
            backoff_max_ms: 1_000,
        };
        assert_eq!(policy.delay_ms(0), 200);
        assert_eq!(policy.delay_ms(1), 400);
        assert_eq!(policy.delay_ms(2), 800);
        assert_eq!(policy.delay_ms(3), 1_000); // capped
    }
}
