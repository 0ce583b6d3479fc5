//! Lifecycle events and the broadcast event bus.
//!
//! Events are delivered over a buffered `tokio::sync::broadcast` channel so
//! slow subscribers can never stall the engine: a lagging receiver drops the
//! oldest events instead of applying backpressure.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

/// A lifecycle event emitted by the engine, registry, or monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A workflow execution entered the running state.
    WorkflowStarted {
        /// The execution that started.
        execution_id: Uuid,
        /// The workflow definition it runs.
        workflow_id: String,
    },
    /// A workflow execution reached its exit point.
    WorkflowCompleted {
        /// The execution that completed.
        execution_id: Uuid,
        /// Total cost accumulated across all nodes.
        total_cost: f64,
    },
    /// A workflow execution failed with an unrecoverable error.
    WorkflowFailed {
        /// The execution that failed.
        execution_id: Uuid,
        /// The node at which the failure occurred, when known.
        node_id: Option<String>,
        /// Failure description.
        message: String,
    },
    /// A workflow execution was paused (operator request or human node).
    WorkflowPaused {
        /// The paused execution.
        execution_id: Uuid,
        /// The node the execution is waiting at.
        node_id: Option<String>,
    },
    /// A paused execution re-entered the running state.
    WorkflowResumed {
        /// The resumed execution.
        execution_id: Uuid,
    },
    /// A workflow execution was cancelled by the caller.
    WorkflowCancelled {
        /// The cancelled execution.
        execution_id: Uuid,
    },
    /// A node finished executing successfully.
    NodeExecuted {
        /// The owning execution.
        execution_id: Uuid,
        /// The node that ran.
        node_id: String,
        /// Cost of the node call.
        cost: f64,
        /// Duration of the node call.
        duration_ms: u64,
    },
    /// A node failed after exhausting its retries.
    NodeFailed {
        /// The owning execution.
        execution_id: Uuid,
        /// The node that failed.
        node_id: String,
        /// Failure description.
        message: String,
    },
    /// A plugin was registered with the capability registry.
    PluginRegistered {
        /// The plugin name.
        name: String,
        /// The plugin version.
        version: String,
    },
    /// A plugin was unregistered from the capability registry.
    PluginUnregistered {
        /// The plugin name.
        name: String,
    },
    /// The execution monitor raised a threshold alert.
    MonitoringAlert {
        /// The execution the alert belongs to.
        execution_id: Uuid,
        /// Alert payload (kind, severity, message, metadata).
        alert: Value,
    },
}

impl EngineEvent {
    /// The dotted event name external subscribers key on.
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::WorkflowStarted { .. } => "workflow.started",
            EngineEvent::WorkflowCompleted { .. } => "workflow.completed",
            EngineEvent::WorkflowFailed { .. } => "workflow.failed",
            EngineEvent::WorkflowPaused { .. } => "workflow.paused",
            EngineEvent::WorkflowResumed { .. } => "workflow.resumed",
            EngineEvent::WorkflowCancelled { .. } => "workflow.cancelled",
            EngineEvent::NodeExecuted { .. } => "node.executed",
            EngineEvent::NodeFailed { .. } => "node.failed",
            EngineEvent::PluginRegistered { .. } => "plugin.registered",
            EngineEvent::PluginUnregistered { .. } => "plugin.unregistered",
            EngineEvent::MonitoringAlert { .. } => "monitoring.alert",
        }
    }
}

/// Buffered broadcast bus for [`EngineEvent`]s.
///
/// Cloning the bus is cheap; all clones share one channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Creates a bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emits an event. Never blocks; a bus with no subscribers drops the
    /// event silently.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribes to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
