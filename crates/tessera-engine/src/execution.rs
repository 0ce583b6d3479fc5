//! Execution records, status machine, and metrics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tessera_core::{NodeExecutionError, TesseraError, TesseraResult};
use uuid::Uuid;

/// Lifecycle status of a workflow execution.
///
/// `Completed`, `Failed`, and `Cancelled` are sinks; `Paused` re-enters
/// `Running` via resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// Created, not yet running.
    Pending,
    /// The main loop is driving nodes.
    Running,
    /// Reached an exit point.
    Completed,
    /// Terminated by an unrecoverable error.
    Failed,
    /// Terminated by the caller.
    Cancelled,
    /// Suspended; waiting for resume (operator or human input).
    Paused,
}

impl ExecutionStatus {
    /// Whether this status is a sink.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// Whether the state machine permits moving to `next`.
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Paused)
                | (Paused, Running)
                | (Paused, Cancelled)
        )
    }
}

/// Per-node execution metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeMetrics {
    /// Wall-clock duration of the node.
    pub duration_ms: u64,
    /// Cost of the node call, USD.
    pub cost: f64,
    /// Whether the node succeeded.
    pub success: bool,
    /// Attempts made, including retries.
    pub attempts: u32,
}

/// Aggregate metrics for one execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    /// Total cost across all nodes, USD.
    pub total_cost: f64,
    /// Metrics keyed by node id.
    pub node_metrics: HashMap<String, NodeMetrics>,
    /// Highest memory sample observed while running.
    pub peak_memory_bytes: u64,
}

/// One run of a workflow definition.
///
/// Mutated only by the engine and its delegates; immutable once terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    /// Unique execution id.
    pub id: Uuid,
    /// The definition this execution runs.
    pub workflow_id: String,
    /// Current lifecycle status.
    pub status: ExecutionStatus,
    /// When the execution was created.
    pub started_at: DateTime<Utc>,
    /// When the execution reached a terminal status.
    pub ended_at: Option<DateTime<Utc>>,
    /// Caller-supplied input.
    pub input: Value,
    /// Final state captured at completion.
    pub output: Option<Value>,
    /// The node the loop is at (or paused at).
    pub current_node: Option<String>,
    /// Ordered sequence of executed node ids.
    pub executed_nodes: Vec<String>,
    /// Ordered sequence of node failures.
    pub errors: Vec<NodeExecutionError>,
    /// Aggregate metrics.
    pub metrics: ExecutionMetrics,
}

impl WorkflowExecution {
    /// Creates a pending execution for a workflow.
    pub fn new(workflow_id: impl Into<String>, input: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id: workflow_id.into(),
            status: ExecutionStatus::Pending,
            started_at: Utc::now(),
            ended_at: None,
            input,
            output: None,
            current_node: None,
            executed_nodes: Vec::new(),
            errors: Vec::new(),
            metrics: ExecutionMetrics::default(),
        }
    }

    /// Applies a status transition, rejecting moves the state machine
    /// forbids.
    pub fn transition(&mut self, next: ExecutionStatus) -> TesseraResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(TesseraError::Workflow(format!(
                "execution {}: illegal transition {:?} -> {next:?}",
                self.id, self.status
            )));
        }
        self.status = next;
        if next.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Records metrics for one executed node and updates totals.
    pub fn record_node(&mut self, node_id: &str, metrics: NodeMetrics) {
        self.metrics.total_cost += metrics.cost;
        self.metrics.node_metrics.insert(node_id.to_string(), metrics);
    }

    /// Total wall-clock duration, up to now for live executions.
    pub fn duration_ms(&self) -> u64 {
        let end = self.ended_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds().max(0) as u64
    }
}
