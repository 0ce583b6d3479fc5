//! End-to-end engine tests with a mock provider plugin.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tessera_core::{
    AgentAdapter, AgentContext, AgentOutcome, ErrorCode, EventBus, NodeKind, TesseraError,
    TesseraResult, ToolAdapter, WorkflowDefinition, WorkflowEdge, WorkflowNode,
};
use tessera_engine::{EngineOptions, ExecutionStatus, WorkflowEngine};
use tessera_registry::{CapabilityDescriptor, CapabilityRegistry, Plugin, PluginManifest};
use tessera_router::{BudgetGuard, CostBudget, ModelCatalog, ModelRouter};

/// Tracks fan-out concurrency across mock agent calls.
#[derive(Default)]
struct Inflight {
    current: AtomicUsize,
    max: AtomicUsize,
    total: AtomicUsize,
}

struct MockAgent {
    capability: String,
    inflight: Arc<Inflight>,
    config: HashMap<String, Value>,
}

#[async_trait]
impl AgentAdapter for MockAgent {
    fn capability(&self) -> &str {
        &self.capability
    }

    async fn execute(&self, ctx: AgentContext) -> TesseraResult<AgentOutcome> {
        let now = self.inflight.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.inflight.max.fetch_max(now, Ordering::SeqCst);
        self.inflight.total.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.inflight.current.fetch_sub(1, Ordering::SeqCst);

        if self.config.get("fail").and_then(Value::as_bool) == Some(true) {
            return Ok(AgentOutcome::failure("invalid request payload"));
        }

        let prompt = ctx
            .input
            .get("prompt")
            .and_then(Value::as_str)
            .unwrap_or("(no prompt)");
        Ok(
            AgentOutcome::success(json!({ "text": format!("echo: {prompt}") }))
                .with_cost(0.001)
                .with_duration_ms(20),
        )
    }
}

struct MockPlugin {
    manifest: PluginManifest,
    inflight: Arc<Inflight>,
}

impl MockPlugin {
    fn new(inflight: Arc<Inflight>) -> Self {
        Self {
            manifest: PluginManifest {
                name: "mock-provider".to_string(),
                version: "1.0.0".to_string(),
                description: "mock text provider".to_string(),
                dependencies: Vec::new(),
            },
            inflight,
        }
    }
}

#[async_trait]
impl Plugin for MockPlugin {
    fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    fn agents(&self) -> Vec<CapabilityDescriptor> {
        vec![CapabilityDescriptor {
            capability: "text-generator".to_string(),
            description: "echoes prompts".to_string(),
            input_schema: Value::Null,
        }]
    }

    fn create_agent(
        &self,
        agent_type: &str,
        config: &HashMap<String, Value>,
    ) -> TesseraResult<Arc<dyn AgentAdapter>> {
        Ok(Arc::new(MockAgent {
            capability: agent_type.to_string(),
            inflight: Arc::clone(&self.inflight),
            config: config.clone(),
        }))
    }
}

struct UppercaseTool;

#[async_trait]
impl ToolAdapter for UppercaseTool {
    fn name(&self) -> &str {
        "uppercase"
    }

    async fn invoke(&self, args: Value) -> TesseraResult<Value> {
        let text = args
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| TesseraError::Config("missing 'text' argument".to_string()))?;
        Ok(json!({ "text": text.to_uppercase() }))
    }
}

async fn engine_with_budget(budget: CostBudget) -> (Arc<WorkflowEngine>, Arc<Inflight>) {
    let inflight = Arc::new(Inflight::default());
    let events = EventBus::default();
    let registry = Arc::new(CapabilityRegistry::new(events.clone()));
    registry
        .register(Arc::new(MockPlugin::new(Arc::clone(&inflight))))
        .await
        .unwrap();
    let catalog = ModelCatalog::default();
    let router = Arc::new(ModelRouter::new(catalog.clone()));
    let guard = Arc::new(BudgetGuard::new(budget, catalog));
    let engine = Arc::new(WorkflowEngine::new(registry, router, guard, events));
    (engine, inflight)
}

async fn engine() -> (Arc<WorkflowEngine>, Arc<Inflight>) {
    engine_with_budget(CostBudget::default()).await
}

fn single_node_workflow() -> WorkflowDefinition {
    WorkflowDefinition {
        id: "single".to_string(),
        name: "single agent node".to_string(),
        entry_point: "n1".to_string(),
        exit_points: vec!["n1".to_string()],
        nodes: vec![WorkflowNode::agent("n1", "text-generator")],
        edges: vec![],
    }
}

#[tokio::test]
async fn single_agent_node_completes() {
    let (engine, _) = engine().await;
    engine.register_workflow(single_node_workflow()).await.unwrap();

    let exec = engine
        .execute("single", json!({"prompt": "hi"}), EngineOptions::default())
        .await
        .unwrap();

    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.executed_nodes, vec!["n1"]);
    let output = exec.output.unwrap();
    assert_eq!(output["text"], json!("echo: hi"));
    assert!(exec.metrics.total_cost > 0.0);
    assert!(exec.ended_at.is_some());
}

#[tokio::test]
async fn unknown_workflow_is_an_error() {
    let (engine, _) = engine().await;
    let err = engine
        .execute("nope", json!({}), EngineOptions::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unknown workflow"));
}

#[tokio::test]
async fn condition_node_branches_on_state() {
    let (engine, _) = engine().await;
    engine
        .register_workflow(WorkflowDefinition {
            id: "branching".to_string(),
            name: "conditional branch".to_string(),
            entry_point: "gen".to_string(),
            exit_points: vec!["long".to_string(), "short".to_string()],
            nodes: vec![
                WorkflowNode::agent("gen", "text-generator"),
                WorkflowNode::condition("check", "score >= 5"),
                WorkflowNode::agent("long", "text-generator"),
                WorkflowNode::agent("short", "text-generator"),
            ],
            edges: vec![
                WorkflowEdge::new("gen", "check"),
                WorkflowEdge::when("check", "long", "check.result == true"),
                WorkflowEdge::when("check", "short", "check.result == false"),
            ],
        })
        .await
        .unwrap();

    let exec = engine
        .execute(
            "branching",
            json!({"prompt": "hi", "score": 7}),
            EngineOptions::default(),
        )
        .await
        .unwrap();

    // check.result is true, so the first edge wins and "long" is the exit.
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.executed_nodes, vec!["gen", "check"]);
    let output = exec.output.unwrap();
    assert_eq!(output["check"]["result"], json!(true));
}

#[tokio::test]
async fn parallel_batches_of_three_and_sibling_failure_is_isolated() {
    let (engine, inflight) = engine().await;

    let mut nodes = vec![WorkflowNode {
        id: "fanout".to_string(),
        kind: NodeKind::Parallel {
            branches: (1..=7).map(|i| format!("b{i}")).collect(),
            max_concurrency: 3,
        },
        config: HashMap::new(),
        retry_policy: None,
    }];
    for i in 1..=7 {
        let mut branch = WorkflowNode::agent(format!("b{i}"), "text-generator");
        if i == 4 {
            branch = branch.with_config("fail", json!(true));
        }
        nodes.push(branch);
    }

    engine
        .register_workflow(WorkflowDefinition {
            id: "fan".to_string(),
            name: "parallel fan-out".to_string(),
            entry_point: "fanout".to_string(),
            exit_points: vec!["fanout".to_string()],
            nodes,
            edges: vec![],
        })
        .await
        .unwrap();

    let exec = engine
        .execute("fan", json!({"prompt": "go"}), EngineOptions::default())
        .await
        .unwrap();

    assert_eq!(exec.status, ExecutionStatus::Completed);
    // All 7 branches ran, never more than 3 at once.
    assert_eq!(inflight.total.load(Ordering::SeqCst), 7);
    assert!(inflight.max.load(Ordering::SeqCst) <= 3);

    let output = exec.output.unwrap();
    // The failing sibling is captured per item, not propagated.
    assert!(output["b4"]["error"].is_string());
    for i in [1, 2, 3, 5, 6, 7] {
        assert_eq!(output[format!("b{i}")]["text"], json!("echo: go"));
    }
    assert_eq!(exec.errors.len(), 1);
    assert!(!exec.metrics.node_metrics["b4"].success);
    assert!(exec.metrics.node_metrics["b1"].success);
}

#[tokio::test]
async fn execution_concurrency_cap_bounds_the_node_level_one() {
    let (engine, inflight) = engine().await;

    let mut nodes = vec![WorkflowNode {
        id: "fanout".to_string(),
        kind: NodeKind::Parallel {
            branches: (1..=4).map(|i| format!("b{i}")).collect(),
            max_concurrency: 3,
        },
        config: HashMap::new(),
        retry_policy: None,
    }];
    for i in 1..=4 {
        nodes.push(WorkflowNode::agent(format!("b{i}"), "text-generator"));
    }

    engine
        .register_workflow(WorkflowDefinition {
            id: "serial-fan".to_string(),
            name: "serialized fan-out".to_string(),
            entry_point: "fanout".to_string(),
            exit_points: vec!["fanout".to_string()],
            nodes,
            edges: vec![],
        })
        .await
        .unwrap();

    let options = EngineOptions {
        max_concurrency: 1,
        ..EngineOptions::default()
    };
    let exec = engine
        .execute("serial-fan", json!({"prompt": "go"}), options)
        .await
        .unwrap();

    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(inflight.total.load(Ordering::SeqCst), 4);
    // The tighter execution-level cap wins over the node's.
    assert_eq!(inflight.max.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn timeout_fails_the_execution_at_a_node_boundary() {
    let (engine, inflight) = engine().await;
    engine
        .register_workflow(WorkflowDefinition {
            id: "slow".to_string(),
            name: "two slow nodes".to_string(),
            entry_point: "n1".to_string(),
            exit_points: vec![],
            nodes: vec![
                WorkflowNode::agent("n1", "text-generator"),
                WorkflowNode::agent("n2", "text-generator"),
            ],
            edges: vec![WorkflowEdge::new("n1", "n2")],
        })
        .await
        .unwrap();

    let options = EngineOptions {
        timeout_ms: Some(1),
        ..EngineOptions::default()
    };
    let err = engine
        .execute("slow", json!({"prompt": "hi"}), options)
        .await
        .unwrap_err();
    let TesseraError::ExecutionFailed { fatal, .. } = err else {
        panic!("expected execution failure, got {err}");
    };
    assert_eq!(fatal.code, ErrorCode::Timeout);
    // The deadline was checked before n2, which never started.
    assert_eq!(fatal.node_id, "n2");
    assert_eq!(inflight.total.load(Ordering::SeqCst), 1);

    let records: Vec<_> = engine
        .executions_snapshot()
        .await
        .into_iter()
        .filter(|e| e.workflow_id == "slow")
        .collect();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, ExecutionStatus::Failed);
}

#[tokio::test]
async fn failure_returned_to_caller_carries_all_recorded_errors() {
    let (engine, _) = engine().await;

    // b1 fails in isolation inside the fan-out; "boom" then fails fatally.
    let nodes = vec![
        WorkflowNode {
            id: "fanout".to_string(),
            kind: NodeKind::Parallel {
                branches: vec!["b1".to_string(), "b2".to_string()],
                max_concurrency: 3,
            },
            config: HashMap::new(),
            retry_policy: None,
        },
        WorkflowNode::agent("b1", "text-generator").with_config("fail", json!(true)),
        WorkflowNode::agent("b2", "text-generator"),
        WorkflowNode::agent("boom", "text-generator").with_config("fail", json!(true)),
    ];
    engine
        .register_workflow(WorkflowDefinition {
            id: "doomed".to_string(),
            name: "isolated then fatal failure".to_string(),
            entry_point: "fanout".to_string(),
            exit_points: vec![],
            nodes,
            edges: vec![WorkflowEdge::new("fanout", "boom")],
        })
        .await
        .unwrap();

    let err = engine
        .execute("doomed", json!({"prompt": "go"}), EngineOptions::default())
        .await
        .unwrap_err();
    let TesseraError::ExecutionFailed { fatal, errors, .. } = err else {
        panic!("expected execution failure, got {err}");
    };
    assert_eq!(fatal.node_id, "boom");
    // Both the isolated branch error and the fatal one, in order.
    assert_eq!(errors.len(), 2);
    assert_eq!(errors[0].node_id, "b1");
    assert_eq!(errors[1].node_id, "boom");
}

#[tokio::test]
async fn human_node_pauses_and_resume_supplies_input() {
    let (engine, _) = engine().await;
    engine
        .register_workflow(WorkflowDefinition {
            id: "review".to_string(),
            name: "human review".to_string(),
            entry_point: "draft".to_string(),
            exit_points: vec!["final".to_string()],
            nodes: vec![
                WorkflowNode::agent("draft", "text-generator"),
                WorkflowNode {
                    id: "approve".to_string(),
                    kind: NodeKind::Human {
                        prompt: Some("approve the draft?".to_string()),
                    },
                    config: HashMap::new(),
                    retry_policy: None,
                },
                WorkflowNode::agent("final", "text-generator"),
            ],
            edges: vec![
                WorkflowEdge::new("draft", "approve"),
                WorkflowEdge::new("approve", "final"),
            ],
        })
        .await
        .unwrap();

    let paused = engine
        .execute("review", json!({"prompt": "draft it"}), EngineOptions::default())
        .await
        .unwrap();
    assert_eq!(paused.status, ExecutionStatus::Paused);
    assert_eq!(paused.current_node.as_deref(), Some("approve"));
    assert_eq!(paused.executed_nodes, vec!["draft"]);

    let resumed = engine
        .resume_with_input(paused.id, Some(json!({"approved": true})))
        .await
        .unwrap();

    // The next node after the human node is the exit point, so resuming
    // completes the workflow with the human input merged into state.
    assert_eq!(resumed.status, ExecutionStatus::Completed);
    assert_eq!(resumed.executed_nodes, vec!["draft", "approve"]);
    let output = resumed.output.unwrap();
    assert_eq!(output["approve"]["approved"], json!(true));
    assert_eq!(output["approve"]["prompt"], json!("approve the draft?"));
}

#[tokio::test]
async fn pause_then_cancel() {
    let (engine, _) = engine().await;
    engine
        .register_workflow(WorkflowDefinition {
            id: "waiting".to_string(),
            name: "waits forever".to_string(),
            entry_point: "hold".to_string(),
            exit_points: vec![],
            nodes: vec![WorkflowNode {
                id: "hold".to_string(),
                kind: NodeKind::Human { prompt: None },
                config: HashMap::new(),
                retry_policy: None,
            }],
            edges: vec![],
        })
        .await
        .unwrap();

    let paused = engine
        .execute("waiting", json!({}), EngineOptions::default())
        .await
        .unwrap();
    assert_eq!(paused.status, ExecutionStatus::Paused);

    engine.cancel(paused.id).await.unwrap();
    let cancelled = engine.execution(paused.id).await.unwrap();
    assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
    assert!(cancelled.ended_at.is_some());

    // A cancelled execution cannot be resumed.
    assert!(engine.resume(paused.id).await.is_err());
}

#[tokio::test]
async fn tool_node_invokes_registered_adapter() {
    let (engine, _) = engine().await;
    engine.register_tool(Arc::new(UppercaseTool)).await;
    engine
        .register_workflow(WorkflowDefinition {
            id: "tooling".to_string(),
            name: "tool call".to_string(),
            entry_point: "shout".to_string(),
            exit_points: vec!["shout".to_string()],
            nodes: vec![WorkflowNode::tool(
                "shout",
                "uppercase",
                json!({"text": "quiet"}),
            )],
            edges: vec![],
        })
        .await
        .unwrap();

    let exec = engine
        .execute("tooling", json!({}), EngineOptions::default())
        .await
        .unwrap();
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.output.unwrap()["shout"]["text"], json!("QUIET"));
}

#[tokio::test]
async fn missing_tool_fails_the_workflow() {
    let (engine, _) = engine().await;
    engine
        .register_workflow(WorkflowDefinition {
            id: "tooling".to_string(),
            name: "tool call".to_string(),
            entry_point: "shout".to_string(),
            exit_points: vec!["shout".to_string()],
            nodes: vec![WorkflowNode::tool("shout", "uppercase", json!({}))],
            edges: vec![],
        })
        .await
        .unwrap();

    let err = engine
        .execute("tooling", json!({}), EngineOptions::default())
        .await
        .unwrap_err();
    let TesseraError::ExecutionFailed { fatal, .. } = err else {
        panic!("expected execution failure, got {err}");
    };
    assert_eq!(fatal.code, ErrorCode::InvalidInput);

    let records: Vec<_> = engine
        .executions_snapshot()
        .await
        .into_iter()
        .filter(|e| e.workflow_id == "tooling")
        .collect();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, ExecutionStatus::Failed);
}

#[tokio::test]
async fn budget_denial_fails_the_node_before_any_call() {
    let budget = CostBudget {
        per_request_limit: 0.000_000_1,
        ..CostBudget::default()
    };
    let (engine, inflight) = engine_with_budget(budget).await;
    engine.register_workflow(single_node_workflow()).await.unwrap();

    let err = engine
        .execute("single", json!({"prompt": "hi"}), EngineOptions::default())
        .await
        .unwrap_err();
    let TesseraError::ExecutionFailed { fatal, .. } = err else {
        panic!("expected execution failure, got {err}");
    };
    assert_eq!(fatal.code, ErrorCode::BudgetDenied);
    assert_eq!(inflight.total.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn lifecycle_events_are_emitted_in_order() {
    let (engine, _) = engine().await;
    engine.register_workflow(single_node_workflow()).await.unwrap();
    let mut rx = engine.events().subscribe();

    engine
        .execute("single", json!({"prompt": "hi"}), EngineOptions::default())
        .await
        .unwrap();

    assert_eq!(rx.recv().await.unwrap().name(), "workflow.started");
    assert_eq!(rx.recv().await.unwrap().name(), "node.executed");
    assert_eq!(rx.recv().await.unwrap().name(), "workflow.completed");
}

#[tokio::test]
async fn concurrent_executions_share_one_engine() {
    let (engine, _) = engine().await;
    engine.register_workflow(single_node_workflow()).await.unwrap();

    let handles: Vec<_> = (0..5)
        .map(|i| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                engine
                    .execute(
                        "single",
                        json!({"prompt": format!("task {i}")}),
                        EngineOptions::default(),
                    )
                    .await
            })
        })
        .collect();

    for handle in handles {
        let exec = handle.await.unwrap().unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
    }
    let usage = engine.budget().usage_snapshot();
    assert!((usage.daily - 0.005).abs() < 1e-9);
}
