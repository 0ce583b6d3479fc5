//! Core types and error definitions for the Tessera orchestration engine.
//!
//! This crate provides the foundational types shared across all Tessera
//! crates: the unified error taxonomy, the agent/tool adapter traits, the
//! uniform execution result envelope, and the lifecycle event bus.
//!
//! # Main types
//!
//! - [`TesseraError`] — Unified error enum for all Tessera subsystems.
//! - [`TesseraResult`] — Convenience alias for `Result<T, TesseraError>`.
//! - [`ErrorCode`] — Node-level failure codes with recoverability classification.
//! - [`AgentAdapter`] — Trait implemented by concrete AI-provider adapters.
//! - [`AgentOutcome`] — The uniform result envelope every agent call produces.
//! - [`EventBus`] — Buffered broadcast bus for lifecycle events.

/// Adapter traits and the agent execution envelope.
pub mod adapter;
/// Error taxonomy and node-level error codes.
pub mod error;
/// Lifecycle events and the broadcast event bus.
pub mod event;
/// Workflow graph model: definitions, nodes, edges, retry policy.
pub mod workflow;

pub use adapter::{AgentAdapter, AgentContext, AgentOutcome, ToolAdapter};
pub use error::{ErrorCode, NodeExecutionError, TesseraError, TesseraResult};
pub use event::{EngineEvent, EventBus};
pub use workflow::{
    NodeKind, RetryPolicy, WorkflowDefinition, WorkflowEdge, WorkflowNode,
};
