//! Adapter traits and the uniform agent execution envelope.

use crate::error::TesseraResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Everything an agent adapter needs to execute one workflow node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentContext {
    /// The execution this call belongs to.
    pub execution_id: Uuid,
    /// The workflow node being executed.
    pub node_id: String,
    /// Capability type, e.g. `"text-generator"`.
    pub agent_type: String,
    /// The backend model selected by the router.
    pub model_id: String,
    /// Node input derived from the current execution state.
    pub input: Value,
    /// Read-only snapshot of the execution state at dispatch time.
    pub state: Value,
    /// Node-level configuration from the workflow definition.
    #[serde(default)]
    pub config: HashMap<String, Value>,
}

/// The uniform result envelope every agent call produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutcome {
    /// Whether the call succeeded.
    pub success: bool,
    /// Output to merge into the execution state.
    pub output: Value,
    /// Actual cost of the call in USD.
    pub cost: f64,
    /// Wall-clock duration of the call.
    pub duration_ms: u64,
    /// Error description when `success` is false.
    pub error: Option<String>,
    /// When set, the engine advances to this node instead of following edges.
    pub next_node: Option<String>,
}

impl AgentOutcome {
    /// Creates a successful outcome with the given output.
    pub fn success(output: Value) -> Self {
        Self {
            success: true,
            output,
            cost: 0.0,
            duration_ms: 0,
            error: None,
            next_node: None,
        }
    }

    /// Creates a failed outcome with the given error message.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: Value::Null,
            cost: 0.0,
            duration_ms: 0,
            error: Some(error.into()),
            next_node: None,
        }
    }

    /// Sets the actual cost of the call.
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    /// Sets the call duration.
    pub fn with_duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = ms;
        self
    }

    /// Names the node the engine should advance to next.
    pub fn with_next_node(mut self, node_id: impl Into<String>) -> Self {
        self.next_node = Some(node_id.into());
        self
    }
}

/// Trait implemented by concrete AI-provider adapters (text, image,
/// embedding, custom). One adapter instance serves one capability type.
#[async_trait]
pub trait AgentAdapter: Send + Sync {
    /// The capability type this adapter serves.
    fn capability(&self) -> &str;

    /// Execute one node call.
    async fn execute(&self, ctx: AgentContext) -> TesseraResult<AgentOutcome>;
}

/// Trait implemented by tool integrations invoked from `tool` nodes.
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    /// The tool name workflow definitions refer to.
    fn name(&self) -> &str;

    /// Invoke the tool with JSON arguments.
    async fn invoke(&self, args: Value) -> TesseraResult<Value>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn outcome_builders() {
        let ok = AgentOutcome::success(serde_json::json!({"text": "hi"}))
            .with_cost(0.002)
            .with_duration_ms(120)
            .with_next_node("n2");
        assert!(ok.success);
        assert_eq!(ok.cost, 0.002);
        assert_eq!(ok.next_node.as_deref(), Some("n2"));

        let bad = AgentOutcome::failure("provider unreachable");
        assert!(!bad.success);
        assert_eq!(bad.error.as_deref(), Some("provider unreachable"));
        assert!(bad.output.is_null());
    }

    #[test]
    fn context_serialization_round_trip() {
        let ctx = AgentContext {
            execution_id: Uuid::new_v4(),
            node_id: "n1".to_string(),
            agent_type: "text-generator".to_string(),
            model_id: "text-basic".to_string(),
            input: serde_json::json!({"prompt": "hi"}),
            state: serde_json::json!({}),
            config: HashMap::new(),
        };
        let json = serde_json::to_string(&ctx).unwrap();
        let parsed: AgentContext = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.node_id, "n1");
        assert_eq!(parsed.agent_type, "text-generator");
    }
}
