//! Unified error taxonomy for the Tessera engine.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A convenience `Result` alias using [`TesseraError`].
pub type TesseraResult<T> = Result<T, TesseraError>;

/// Top-level error type for the Tessera engine.
///
/// Registry failures carry structured payloads because callers must
/// distinguish them; the remaining subsystems use message payloads.
#[derive(Debug, thiserror::Error)]
pub enum TesseraError {
    /// A plugin declared a dependency that is not yet registered.
    #[error("dependency missing: plugin '{plugin}' requires '{dependency}'")]
    DependencyMissing {
        /// The plugin being registered.
        plugin: String,
        /// The dependency that was not found.
        dependency: String,
    },

    /// A plugin with this name is already registered.
    #[error("plugin already registered: {0}")]
    AlreadyRegistered(String),

    /// No plugin with this name is registered.
    #[error("plugin not registered: {0}")]
    NotRegistered(String),

    /// No enabled plugin provides the requested capability type.
    #[error("unknown capability '{requested}' (known: {})", known.join(", "))]
    UnknownCapability {
        /// The capability type that was asked for.
        requested: String,
        /// Capability types currently available.
        known: Vec<String>,
    },

    /// A plugin factory raised while constructing a capability instance.
    #[error("capability creation failed for '{capability}': {message}")]
    CapabilityCreationFailed {
        /// The capability type being constructed.
        capability: String,
        /// The underlying failure.
        message: String,
    },

    /// A request was denied by the budget guard before any provider call.
    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),

    /// No model could be selected for a task.
    #[error("routing error: {0}")]
    Routing(String),

    /// An error from the execution state store.
    #[error("state error: {0}")]
    State(String),

    /// An error in the workflow definition or engine state machine.
    #[error("workflow error: {0}")]
    Workflow(String),

    /// A node-level execution failure (see [`NodeExecutionError`]).
    #[error("node '{}' failed: {}", .0.node_id, .0.message)]
    Node(NodeExecutionError),

    /// A workflow execution reached `Failed`.
    ///
    /// Carries the fatal node error plus every node error recorded on
    /// the execution (the fatal one last), so callers see earlier
    /// isolated failures such as parallel-branch errors.
    #[error("execution {execution_id} failed at node '{}': {}", fatal.node_id, fatal.message)]
    ExecutionFailed {
        /// The execution that failed.
        execution_id: Uuid,
        /// The error that terminated the execution.
        fatal: NodeExecutionError,
        /// All node errors recorded on the execution, in order.
        errors: Vec<NodeExecutionError>,
    },

    /// An error in configuration parsing or validation.
    #[error("config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Classifies a node-level failure.
///
/// Only the first four codes are recoverable: they describe transient
/// provider conditions worth retrying. Everything else is fatal to the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The provider rejected the call due to rate limiting.
    RateLimited,
    /// The call exceeded its deadline.
    Timeout,
    /// The provider reported a transient outage.
    TemporaryUnavailable,
    /// A network-level failure reaching the provider.
    NetworkError,
    /// The node received input it cannot process.
    InvalidInput,
    /// The provider returned a permanent error.
    ProviderError,
    /// The budget guard denied the call before it was made.
    BudgetDenied,
    /// An internal engine failure.
    Internal,
}

impl ErrorCode {
    /// Whether this code is transient and eligible for retry.
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            ErrorCode::RateLimited
                | ErrorCode::Timeout
                | ErrorCode::TemporaryUnavailable
                | ErrorCode::NetworkError
        )
    }
}

/// A failure raised while executing a single workflow node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecutionError {
    /// The node that failed.
    pub node_id: String,
    /// Failure classification.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Whether the failure was classified as transient.
    pub recoverable: bool,
    /// How many attempts were made before surfacing this error.
    pub attempts: u32,
}

impl NodeExecutionError {
    /// Creates a single-attempt error; `recoverable` mirrors the code.
    pub fn new(node_id: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            code,
            message: message.into(),
            recoverable: code.is_recoverable(),
            attempts: 1,
        }
    }

    /// Sets the recorded attempt count.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

impl From<NodeExecutionError> for TesseraError {
    fn from(err: NodeExecutionError) -> Self {
        TesseraError::Node(err)
    }
}
