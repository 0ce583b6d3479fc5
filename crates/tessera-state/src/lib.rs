//! Per-execution state store for the Tessera engine.
//!
//! Each workflow execution owns a JSON working set with dotted-path access,
//! versioned checkpoints with wholesale rollback, and recorded transitions
//! diffed between updates.
//!
//! # Main types
//!
//! - [`StateManager`] — Keyed store of all live execution states.
//! - [`StateSnapshot`] — An immutable, versioned checkpoint.
//! - [`StateDiff`] — Added/modified/removed key paths between two states.

/// Recursive state diffing.
pub mod diff;
/// The state manager and its record types.
pub mod manager;
/// Dotted-path accessors over JSON values.
pub mod paths;

pub use diff::{diff, StateDiff};
pub use manager::{StateManager, StateSnapshot, StateTransition};
pub use paths::{get_path, set_path};
