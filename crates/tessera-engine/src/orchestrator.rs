//! Agent dispatch: model selection, budget enforcement, retries, fallback.

use rand::Rng;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tessera_core::{
    AgentContext, AgentOutcome, ErrorCode, NodeExecutionError, RetryPolicy, TesseraError,
};
use tessera_registry::CapabilityRegistry;
use tessera_router::{
    BudgetGuard, ModelRouter, RoutePriority, TaskType, UsageEstimate, BASELINE_PIXELS,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One agent-node dispatch request.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// The execution this call belongs to.
    pub execution_id: Uuid,
    /// The workflow node being executed.
    pub node_id: String,
    /// Capability type resolved through the registry.
    pub agent_type: String,
    /// Node input derived from the execution state.
    pub input: Value,
    /// Snapshot of the execution state at dispatch time.
    pub state: Value,
    /// Node-level configuration.
    pub config: HashMap<String, Value>,
    /// Retry behaviour for recoverable failures.
    pub retry_policy: RetryPolicy,
    /// Routing priority for model selection.
    pub priority: RoutePriority,
}

/// A completed agent dispatch, with the attempt count and the model that
/// finally served it.
#[derive(Debug, Clone)]
pub struct AgentRun {
    /// The adapter's result envelope.
    pub outcome: AgentOutcome,
    /// Attempts made, including retries.
    pub attempts: u32,
    /// The model the successful attempt used.
    pub model_id: String,
}

/// Dispatches agent calls through the registry with budget enforcement,
/// retry with exponential backoff, and model fallback down the ranked
/// chain.
pub struct AgentOrchestrator {
    registry: Arc<CapabilityRegistry>,
    router: Arc<ModelRouter>,
    budget: Arc<BudgetGuard>,
}

impl AgentOrchestrator {
    /// Creates an orchestrator over the given registry, router, and guard.
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        router: Arc<ModelRouter>,
        budget: Arc<BudgetGuard>,
    ) -> Self {
        Self {
            registry,
            router,
            budget,
        }
    }

    /// The budget guard this orchestrator charges against.
    pub fn budget(&self) -> &BudgetGuard {
        &self.budget
    }

    /// The model router this orchestrator selects through.
    pub fn router(&self) -> &ModelRouter {
        &self.router
    }

    /// Executes one agent node.
    ///
    /// Every attempt reserves its estimated cost against the budget before
    /// the provider call and settles (or releases) it afterwards; a denied
    /// reservation fails the node without any provider call. Recoverable
    /// failures retry with capped exponential backoff and jitter, each
    /// retry substituting the next model down the fallback chain.
    pub async fn execute_agent(
        &self,
        request: &AgentRequest,
    ) -> Result<AgentRun, NodeExecutionError> {
        let task_type = self.task_type_for(request);
        let usage = self.usage_for(request, task_type);

        let chain = self.router.fallback_chain(task_type, request.priority);
        if chain.is_empty() {
            return Err(NodeExecutionError::new(
                &request.node_id,
                ErrorCode::ProviderError,
                format!("no eligible {task_type} model available"),
            ));
        }

        let max_retries = request.retry_policy.max_retries;
        let mut attempt = 0u32;
        loop {
            let model = &chain[(attempt as usize).min(chain.len() - 1)];

            let estimated = self.router.estimate_cost(model, usage).map_err(|e| {
                NodeExecutionError::new(&request.node_id, ErrorCode::InvalidInput, e.to_string())
            })?;

            let decision = self.budget.reserve(estimated, task_type);
            if let tessera_router::BudgetDecision::Denied { reason } = decision {
                warn!(
                    execution_id = %request.execution_id,
                    node_id = %request.node_id,
                    estimated,
                    "Budget denied agent call: {reason}"
                );
                return Err(NodeExecutionError::new(
                    &request.node_id,
                    ErrorCode::BudgetDenied,
                    reason,
                )
                .with_attempts(attempt + 1));
            }

            let agent = match self
                .registry
                .create_agent(&request.agent_type, &request.config)
                .await
            {
                Ok(agent) => agent,
                Err(e) => {
                    self.budget.release(estimated);
                    let code = match e {
                        TesseraError::UnknownCapability { .. } => ErrorCode::InvalidInput,
                        _ => ErrorCode::Internal,
                    };
                    return Err(NodeExecutionError::new(&request.node_id, code, e.to_string())
                        .with_attempts(attempt + 1));
                }
            };

            let ctx = AgentContext {
                execution_id: request.execution_id,
                node_id: request.node_id.clone(),
                agent_type: request.agent_type.clone(),
                model_id: model.id.clone(),
                input: request.input.clone(),
                state: request.state.clone(),
                config: request.config.clone(),
            };

            debug!(
                execution_id = %request.execution_id,
                node_id = %request.node_id,
                model_id = %model.id,
                attempt = attempt + 1,
                estimated,
                "Dispatching agent call"
            );

            let started = std::time::Instant::now();
            let result = agent.execute(ctx).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            let failure = match result {
                Ok(mut outcome) if outcome.success => {
                    if outcome.duration_ms == 0 {
                        outcome.duration_ms = elapsed_ms;
                    }
                    let alerts = self.budget.settle(estimated, outcome.cost, task_type);
                    for alert in alerts {
                        warn!(
                            execution_id = %request.execution_id,
                            scope = %alert.scope,
                            pct_used = alert.pct_used,
                            "{}",
                            alert.message
                        );
                    }
                    info!(
                        execution_id = %request.execution_id,
                        node_id = %request.node_id,
                        model_id = %model.id,
                        cost = outcome.cost,
                        duration_ms = outcome.duration_ms,
                        "Agent call succeeded"
                    );
                    return Ok(AgentRun {
                        outcome,
                        attempts: attempt + 1,
                        model_id: model.id.clone(),
                    });
                }
                Ok(outcome) => outcome
                    .error
                    .unwrap_or_else(|| "agent reported failure without detail".to_string()),
                Err(e) => e.to_string(),
            };

            // Failed attempt: the held estimate is returned untouched.
            self.budget.release(estimated);
            let code = classify_failure(&failure);

            if code.is_recoverable() && attempt < max_retries {
                let delay = request.retry_policy.delay_ms(attempt);
                let jitter = rand::thread_rng().gen_range(0..=delay / 10 + 1);
                warn!(
                    execution_id = %request.execution_id,
                    node_id = %request.node_id,
                    model_id = %model.id,
                    attempt = attempt + 1,
                    delay_ms = delay + jitter,
                    "Recoverable agent failure, retrying: {failure}"
                );
                tokio::time::sleep(Duration::from_millis(delay + jitter)).await;
                attempt += 1;
                continue;
            }

            warn!(
                execution_id = %request.execution_id,
                node_id = %request.node_id,
                model_id = %model.id,
                attempts = attempt + 1,
                code = ?code,
                "Agent call failed: {failure}"
            );
            return Err(
                NodeExecutionError::new(&request.node_id, code, failure).with_attempts(attempt + 1)
            );
        }
    }

    /// Executes a batch of agent requests with bounded concurrency.
    ///
    /// Requests run in chunks of `max_concurrency`; results come back in
    /// submission order. One branch failing never aborts its siblings.
    pub async fn execute_parallel(
        &self,
        requests: Vec<AgentRequest>,
        max_concurrency: usize,
    ) -> Vec<Result<AgentRun, NodeExecutionError>> {
        let chunk_size = max_concurrency.max(1);
        let mut results = Vec::with_capacity(requests.len());
        for chunk in requests.chunks(chunk_size) {
            let batch = futures_util::future::join_all(
                chunk.iter().map(|request| self.execute_agent(request)),
            )
            .await;
            results.extend(batch);
        }
        results
    }

    /// Task type for a request: explicit `task_type` config wins, then the
    /// capability-type naming convention, then text.
    fn task_type_for(&self, request: &AgentRequest) -> TaskType {
        if let Some(Value::String(s)) = request.config.get("task_type") {
            match s.as_str() {
                "text" => return TaskType::Text,
                "image" => return TaskType::Image,
                "embedding" => return TaskType::Embedding,
                other => {
                    warn!(
                        node_id = %request.node_id,
                        task_type = other,
                        "Unknown task_type override, inferring from agent type"
                    );
                }
            }
        }
        if request.agent_type.starts_with("image") {
            TaskType::Image
        } else if request.agent_type.contains("embed") {
            TaskType::Embedding
        } else {
            TaskType::Text
        }
    }

    /// Usage estimate from node config, with conservative defaults.
    fn usage_for(&self, request: &AgentRequest, task_type: TaskType) -> UsageEstimate {
        let get = |key: &str, default: u64| {
            request
                .config
                .get(key)
                .and_then(Value::as_u64)
                .unwrap_or(default)
        };
        match task_type {
            TaskType::Text => UsageEstimate::Text {
                input_tokens: get("input_tokens", 1000),
                output_tokens: get("output_tokens", 1000),
            },
            TaskType::Image => UsageEstimate::Image {
                count: get("image_count", 1) as u32,
                pixels: get("pixels", BASELINE_PIXELS),
            },
            TaskType::Embedding => UsageEstimate::Embedding {
                tokens: get("tokens", 1000),
            },
        }
    }
}

/// Maps a provider failure message to an error code, mirroring the codes
/// providers commonly surface in message text.
fn classify_failure(message: &str) -> ErrorCode {
    let lower = message.to_lowercase();
    if lower.contains("rate limit") || lower.contains("429") {
        ErrorCode::RateLimited
    } else if lower.contains("timeout") || lower.contains("timed out") {
        ErrorCode::Timeout
    } else if lower.contains("unavailable") || lower.contains("503") {
        ErrorCode::TemporaryUnavailable
    } else if lower.contains("network") || lower.contains("connection") {
        ErrorCode::NetworkError
    } else {
        ErrorCode::ProviderError
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tessera_core::{EventBus, TesseraResult};
    use tessera_registry::{CapabilityDescriptor, Plugin, PluginManifest};
    use tessera_router::{CostBudget, ModelCatalog};

    struct FlakyAdapter {
        capability: String,
        failures: Arc<AtomicU32>,
        error: String,
    }

    #[async_trait]
    impl tessera_core::AgentAdapter for FlakyAdapter {
        fn capability(&self) -> &str {
            &self.capability
        }

        async fn execute(&self, ctx: AgentContext) -> TesseraResult<AgentOutcome> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Ok(AgentOutcome::failure(self.error.clone()));
            }
            Ok(AgentOutcome::success(json!({"echo": ctx.input, "model": ctx.model_id}))
                .with_cost(0.001))
        }
    }

    struct TestPlugin {
        manifest: PluginManifest,
        failures: Arc<AtomicU32>,
        error: String,
    }

    #[async_trait]
    impl Plugin for TestPlugin {
        fn manifest(&self) -> &PluginManifest {
            &self.manifest
        }

        fn agents(&self) -> Vec<CapabilityDescriptor> {
            vec![CapabilityDescriptor {
                capability: "text-generator".to_string(),
                description: String::new(),
                input_schema: Value::Null,
            }]
        }

        fn create_agent(
            &self,
            agent_type: &str,
            _config: &HashMap<String, Value>,
        ) -> TesseraResult<Arc<dyn tessera_core::AgentAdapter>> {
            Ok(Arc::new(FlakyAdapter {
                capability: agent_type.to_string(),
                failures: Arc::clone(&self.failures),
                error: self.error.clone(),
            }))
        }
    }

    async fn orchestrator(
        failures: u32,
        error: &str,
        budget: CostBudget,
    ) -> (AgentOrchestrator, Arc<AtomicU32>) {
        let counter = Arc::new(AtomicU32::new(failures));
        let registry = Arc::new(CapabilityRegistry::new(EventBus::default()));
        registry
            .register(Arc::new(TestPlugin {
                manifest: PluginManifest {
                    name: "test".to_string(),
                    version: "0.1.0".to_string(),
                    description: String::new(),
                    dependencies: Vec::new(),
                },
                failures: Arc::clone(&counter),
                error: error.to_string(),
            }))
            .await
            .unwrap();
        let catalog = ModelCatalog::default();
        let router = Arc::new(ModelRouter::new(catalog.clone()));
        let guard = Arc::new(BudgetGuard::new(budget, catalog));
        (AgentOrchestrator::new(registry, router, guard), counter)
    }

    fn request(node_id: &str) -> AgentRequest {
        AgentRequest {
            execution_id: Uuid::new_v4(),
            node_id: node_id.to_string(),
            agent_type: "text-generator".to_string(),
            input: json!({"prompt": "hi"}),
            state: json!({}),
            config: HashMap::new(),
            retry_policy: RetryPolicy {
                max_retries: 2,
                backoff_base_ms: 1,
                backoff_max_ms: 5,
            },
            priority: RoutePriority::Cost,
        }
    }

    #[tokio::test]
    async fn succeeds_first_attempt_and_records_cost() {
        let (orch, _) = orchestrator(0, "", CostBudget::default()).await;
        let run = orch.execute_agent(&request("n1")).await.unwrap();
        assert!(run.outcome.success);
        assert_eq!(run.attempts, 1);
        let usage = orch.budget().usage_snapshot();
        assert!((usage.daily - 0.001).abs() < 1e-9);
    }

    #[tokio::test]
    async fn retries_recoverable_failures_then_succeeds() {
        let (orch, _) = orchestrator(2, "429 rate limit exceeded", CostBudget::default()).await;
        let run = orch.execute_agent(&request("n1")).await.unwrap();
        assert!(run.outcome.success);
        assert_eq!(run.attempts, 3);
    }

    #[tokio::test]
    async fn fatal_failures_do_not_retry() {
        let (orch, counter) = orchestrator(5, "invalid api key", CostBudget::default()).await;
        let err = orch.execute_agent(&request("n1")).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ProviderError);
        assert!(!err.recoverable);
        assert_eq!(err.attempts, 1);
        // Only one provider call was made.
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_recoverable_error() {
        let (orch, _) = orchestrator(10, "connection reset", CostBudget::default()).await;
        let err = orch.execute_agent(&request("n1")).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NetworkError);
        assert!(err.recoverable);
        assert_eq!(err.attempts, 3);
    }

    #[tokio::test]
    async fn budget_denial_fails_without_provider_call() {
        let budget = CostBudget {
            per_request_limit: 0.000_001,
            ..CostBudget::default()
        };
        let (orch, counter) = orchestrator(0, "", budget).await;
        let err = orch.execute_agent(&request("n1")).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::BudgetDenied);
        assert!(err.message.contains("per-request"));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(orch.budget().usage_snapshot().daily.abs() < 1e-12);
    }

    #[tokio::test]
    async fn unknown_agent_type_is_fatal() {
        let (orch, _) = orchestrator(0, "", CostBudget::default()).await;
        let mut req = request("n1");
        req.agent_type = "no-such-capability".to_string();
        let err = orch.execute_agent(&req).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidInput);
    }

    #[tokio::test]
    async fn parallel_preserves_submission_order() {
        let (orch, _) = orchestrator(0, "", CostBudget::default()).await;
        let requests: Vec<AgentRequest> =
            (0..7).map(|i| request(&format!("branch-{i}"))).collect();
        let results = orch.execute_parallel(requests, 3).await;
        assert_eq!(results.len(), 7);
        for result in results {
            assert!(result.unwrap().outcome.success);
        }
    }

    #[test]
    fn failure_classification() {
        assert_eq!(classify_failure("HTTP 429 Too Many Requests"), ErrorCode::RateLimited);
        assert_eq!(classify_failure("request timed out"), ErrorCode::Timeout);
        assert_eq!(
            classify_failure("service unavailable"),
            ErrorCode::TemporaryUnavailable
        );
        assert_eq!(classify_failure("connection refused"), ErrorCode::NetworkError);
        assert_eq!(classify_failure("bad request"), ErrorCode::ProviderError);
    }
}
