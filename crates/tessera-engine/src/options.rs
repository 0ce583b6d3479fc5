//! Engine options.

use serde::{Deserialize, Serialize};
use tessera_router::RoutePriority;

/// Per-execution options supplied by the caller of
/// [`WorkflowEngine::execute`](crate::WorkflowEngine::execute).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineOptions {
    /// Routing priority for model selection.
    #[serde(default = "default_priority")]
    pub priority: RoutePriority,
    /// Persist the execution record after every node.
    #[serde(default)]
    pub save_intermediate_results: bool,
    /// Overall deadline, checked at node boundaries. Best effort: an
    /// in-flight node call is never aborted mid-call.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Upper bound on concurrently running parallel branches.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

fn default_priority() -> RoutePriority {
    RoutePriority::Cost
}

fn default_max_concurrency() -> usize {
    3
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            priority: default_priority(),
            save_intermediate_results: false,
            timeout_ms: None,
            max_concurrency: default_max_concurrency(),
        }
    }
}
