//! The Tessera workflow engine.
//!
//! Drives directed-graph workflows node by node: resolves each node to an
//! agent through the capability registry, routes a cost-optimal model for
//! it, gates the call against the budget guard, merges results into the
//! execution state, and tracks health through the execution monitor.
//!
//! # Main types
//!
//! - [`WorkflowEngine`] — Top-level state machine; `execute`/`pause`/
//!   `resume`/`cancel`.
//! - [`AgentOrchestrator`] — Resolves and runs single agents with retries
//!   and bounded parallel fan-out.
//! - [`ExecutionMonitor`] — Periodic sampling, threshold alerts, final
//!   report.
//! - [`ExecutionStore`] — Durable log of [`WorkflowExecution`] records.

/// Condition expression evaluation.
pub mod conditions;
/// The top-level workflow state machine.
pub mod engine;
/// Execution records, status machine, and metrics.
pub mod execution;
/// Runtime monitoring, alerts, and reports.
pub mod monitor;
/// Engine options.
pub mod options;
/// Agent resolution, retries, and parallel fan-out.
pub mod orchestrator;
/// The execution persistence gateway.
pub mod store;

pub use conditions::evaluate_condition;
pub use engine::WorkflowEngine;
pub use execution::{ExecutionMetrics, ExecutionStatus, NodeMetrics, WorkflowExecution};
pub use monitor::{
    AlertKind, AlertSeverity, ExecutionAlert, ExecutionMonitor, ExecutionReport,
    MonitorThresholds, NodeSample, ResourceSample,
};
pub use options::EngineOptions;
pub use orchestrator::{AgentOrchestrator, AgentRequest, AgentRun};
pub use store::{ExecutionStore, FileExecutionStore, MemoryExecutionStore};
