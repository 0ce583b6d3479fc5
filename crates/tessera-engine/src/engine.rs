//! The top-level workflow state machine.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tessera_core::{
    EngineEvent, ErrorCode, EventBus, NodeExecutionError, NodeKind, RetryPolicy, TesseraError,
    TesseraResult, ToolAdapter, WorkflowDefinition, WorkflowNode,
};
use tessera_registry::CapabilityRegistry;
use tessera_router::{BudgetGuard, ModelRouter};
use tessera_state::StateManager;

use crate::conditions::evaluate_condition;
use crate::execution::{ExecutionStatus, NodeMetrics, WorkflowExecution};
use crate::monitor::{ExecutionMonitor, MonitorThresholds, NodeSample};
use crate::options::EngineOptions;
use crate::orchestrator::{AgentOrchestrator, AgentRequest};
use crate::store::{ExecutionStore, MemoryExecutionStore};

/// Per-execution run context: the frozen definition, the caller's options,
/// and the cursor pointing at the next node to execute.
struct ExecContext {
    definition: WorkflowDefinition,
    options: EngineOptions,
    cursor: Option<String>,
}

/// What one node dispatch produced, before it is merged into state.
struct NodeResult {
    updates: HashMap<String, Value>,
    metrics: NodeMetrics,
    explicit_next: Option<String>,
}

/// Drives directed-graph workflow executions node by node.
///
/// The engine owns the execution records, the per-execution state, and the
/// monitor; agent dispatch is delegated to the [`AgentOrchestrator`] and
/// persistence to an [`ExecutionStore`]. Many executions can run
/// concurrently against one engine.
pub struct WorkflowEngine {
    registry: Arc<CapabilityRegistry>,
    orchestrator: AgentOrchestrator,
    state: StateManager,
    monitor: ExecutionMonitor,
    store: Arc<dyn ExecutionStore>,
    events: EventBus,
    definitions: RwLock<HashMap<String, WorkflowDefinition>>,
    executions: RwLock<HashMap<Uuid, WorkflowExecution>>,
    contexts: RwLock<HashMap<Uuid, ExecContext>>,
    tools: RwLock<HashMap<String, Arc<dyn ToolAdapter>>>,
}

impl WorkflowEngine {
    /// Creates an engine over shared registry, router, and budget guard.
    ///
    /// Executions persist to an in-memory store by default; see
    /// [`WorkflowEngine::with_store`].
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        router: Arc<ModelRouter>,
        budget: Arc<BudgetGuard>,
        events: EventBus,
    ) -> Self {
        let orchestrator = AgentOrchestrator::new(Arc::clone(&registry), router, budget);
        Self {
            registry,
            orchestrator,
            state: StateManager::new(),
            monitor: ExecutionMonitor::new(MonitorThresholds::default(), events.clone()),
            store: Arc::new(MemoryExecutionStore::new()),
            events,
            definitions: RwLock::new(HashMap::new()),
            executions: RwLock::new(HashMap::new()),
            contexts: RwLock::new(HashMap::new()),
            tools: RwLock::new(HashMap::new()),
        }
    }

    /// Replaces the execution store.
    pub fn with_store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.store = store;
        self
    }

    /// Replaces the monitor's alert thresholds.
    pub fn with_thresholds(mut self, thresholds: MonitorThresholds) -> Self {
        self.monitor = ExecutionMonitor::new(thresholds, self.events.clone());
        self
    }

    /// The lifecycle event bus.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// The per-execution state manager (checkpoints, transitions).
    pub fn state(&self) -> &StateManager {
        &self.state
    }

    /// The execution monitor.
    pub fn monitor(&self) -> &ExecutionMonitor {
        &self.monitor
    }

    /// The budget guard agent calls are charged against.
    pub fn budget(&self) -> &BudgetGuard {
        self.orchestrator.budget()
    }

    /// Registers a workflow definition after validating its graph.
    pub async fn register_workflow(&self, definition: WorkflowDefinition) -> TesseraResult<()> {
        definition.validate()?;
        info!(workflow_id = %definition.id, "Workflow registered");
        self.definitions
            .write()
            .await
            .insert(definition.id.clone(), definition);
        Ok(())
    }

    /// Imports all workflow templates published by enabled plugins.
    /// Invalid templates are skipped with a warning. Returns how many were
    /// registered.
    pub async fn sync_plugin_workflows(&self) -> usize {
        let mut count = 0;
        for definition in self.registry.list_workflows().await {
            match self.register_workflow(definition.clone()).await {
                Ok(()) => count += 1,
                Err(e) => {
                    warn!(workflow_id = %definition.id, "Skipping invalid plugin workflow: {e}");
                }
            }
        }
        count
    }

    /// Registers a tool adapter for `tool` nodes.
    pub async fn register_tool(&self, tool: Arc<dyn ToolAdapter>) {
        self.tools
            .write()
            .await
            .insert(tool.name().to_string(), tool);
    }

    /// Snapshots of all executions the engine has driven this process.
    pub async fn executions_snapshot(&self) -> Vec<WorkflowExecution> {
        self.executions.read().await.values().cloned().collect()
    }

    /// A snapshot of an execution record, live or persisted.
    pub async fn execution(&self, id: Uuid) -> Option<WorkflowExecution> {
        if let Some(exec) = self.executions.read().await.get(&id) {
            return Some(exec.clone());
        }
        self.store.find(id).await.ok().flatten()
    }

    /// Runs a workflow to completion, pause, or failure.
    ///
    /// Returns the execution snapshot when it reaches `Completed`, `Paused`
    /// (human node or operator pause), or `Cancelled`; an unrecoverable
    /// node failure transitions the execution to `Failed` and returns the
    /// error. The failed record stays queryable via
    /// [`WorkflowEngine::execution`].
    pub async fn execute(
        &self,
        workflow_id: &str,
        input: Value,
        options: EngineOptions,
    ) -> TesseraResult<WorkflowExecution> {
        let definition = self
            .definitions
            .read()
            .await
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| TesseraError::Workflow(format!("unknown workflow '{workflow_id}'")))?;

        let mut execution = WorkflowExecution::new(workflow_id, input.clone());
        let execution_id = execution.id;
        self.store.create(&execution).await?;
        self.state.initialize(execution_id, input).await?;

        execution.transition(ExecutionStatus::Running)?;
        execution.current_node = Some(definition.entry_point.clone());
        self.executions
            .write()
            .await
            .insert(execution_id, execution);
        self.contexts.write().await.insert(
            execution_id,
            ExecContext {
                cursor: Some(definition.entry_point.clone()),
                definition,
                options,
            },
        );

        self.monitor.start_monitoring(execution_id).await;
        self.events.emit(EngineEvent::WorkflowStarted {
            execution_id,
            workflow_id: workflow_id.to_string(),
        });
        info!(execution_id = %execution_id, workflow_id, "Workflow started");

        self.run(execution_id).await
    }

    /// Pauses a running execution. Observed at the next node boundary; an
    /// in-flight node call is never interrupted.
    pub async fn pause(&self, execution_id: Uuid) -> TesseraResult<()> {
        let snapshot = {
            let mut executions = self.executions.write().await;
            let exec = executions
                .get_mut(&execution_id)
                .ok_or_else(|| unknown_execution(execution_id))?;
            exec.transition(ExecutionStatus::Paused)?;
            exec.clone()
        };
        self.store.update(&snapshot).await?;
        self.events.emit(EngineEvent::WorkflowPaused {
            execution_id,
            node_id: snapshot.current_node.clone(),
        });
        info!(execution_id = %execution_id, "Workflow paused");
        Ok(())
    }

    /// Resumes a paused execution at its current node.
    pub async fn resume(&self, execution_id: Uuid) -> TesseraResult<WorkflowExecution> {
        self.resume_with_input(execution_id, None).await
    }

    /// Resumes a paused execution, optionally supplying the input a human
    /// node is waiting for. The input is merged into state as the human
    /// node's output and the loop advances past that node.
    pub async fn resume_with_input(
        &self,
        execution_id: Uuid,
        input: Option<Value>,
    ) -> TesseraResult<WorkflowExecution> {
        {
            let executions = self.executions.read().await;
            let exec = executions
                .get(&execution_id)
                .ok_or_else(|| unknown_execution(execution_id))?;
            if exec.status != ExecutionStatus::Paused {
                return Err(TesseraError::Workflow(format!(
                    "execution {execution_id} is {:?}, not paused",
                    exec.status
                )));
            }
        }

        // A human node waiting at the cursor consumes the supplied input
        // as its output and is marked executed before the loop re-enters.
        if let Some(input) = input {
            let waiting_human = {
                let contexts = self.contexts.read().await;
                let ctx = contexts
                    .get(&execution_id)
                    .ok_or_else(|| unknown_execution(execution_id))?;
                ctx.cursor.clone().filter(|cursor| {
                    matches!(
                        ctx.definition.node(cursor).map(|n| &n.kind),
                        Some(NodeKind::Human { .. })
                    )
                })
            };

            if let Some(node_id) = waiting_human {
                // Object inputs merge key by key under the node's path so
                // the prompt written at pause time survives.
                let mut updates = HashMap::new();
                match input {
                    Value::Object(map) => {
                        for (key, value) in map {
                            updates.insert(format!("{node_id}.{key}"), value);
                        }
                    }
                    other => {
                        updates.insert(node_id.clone(), other);
                    }
                }
                self.state
                    .update(execution_id, updates, Some(&node_id))
                    .await?;
                let state_now = self.state.current_state(execution_id).await?;

                let next = {
                    let mut contexts = self.contexts.write().await;
                    let ctx = contexts
                        .get_mut(&execution_id)
                        .ok_or_else(|| unknown_execution(execution_id))?;
                    let next = next_node(&ctx.definition, &node_id, &state_now, None);
                    ctx.cursor = completion_cursor(&ctx.definition, next);
                    ctx.cursor.clone()
                };

                let metrics = NodeMetrics {
                    duration_ms: 0,
                    cost: 0.0,
                    success: true,
                    attempts: 1,
                };
                {
                    let mut executions = self.executions.write().await;
                    let exec = executions
                        .get_mut(&execution_id)
                        .ok_or_else(|| unknown_execution(execution_id))?;
                    exec.executed_nodes.push(node_id.clone());
                    exec.record_node(&node_id, metrics);
                    exec.current_node = next;
                }
                self.monitor
                    .update_metrics(
                        execution_id,
                        NodeSample {
                            cost: 0.0,
                            duration_ms: 0,
                            success: true,
                        },
                    )
                    .await;
                self.events.emit(EngineEvent::NodeExecuted {
                    execution_id,
                    node_id,
                    cost: 0.0,
                    duration_ms: 0,
                });
            }
        }

        let snapshot = {
            let mut executions = self.executions.write().await;
            let exec = executions
                .get_mut(&execution_id)
                .ok_or_else(|| unknown_execution(execution_id))?;
            exec.transition(ExecutionStatus::Running)?;
            exec.clone()
        };
        self.store.update(&snapshot).await?;
        self.events
            .emit(EngineEvent::WorkflowResumed { execution_id });
        info!(execution_id = %execution_id, "Workflow resumed");

        self.run(execution_id).await
    }

    /// Cancels a pending, running, or paused execution. Cooperative: a
    /// running loop observes the cancellation at the next node boundary.
    pub async fn cancel(&self, execution_id: Uuid) -> TesseraResult<()> {
        let snapshot = {
            let mut executions = self.executions.write().await;
            let exec = executions
                .get_mut(&execution_id)
                .ok_or_else(|| unknown_execution(execution_id))?;
            exec.transition(ExecutionStatus::Cancelled)?;
            exec.clone()
        };
        self.monitor.stop_monitoring(execution_id).await;
        self.store.update(&snapshot).await?;
        self.state.cleanup(execution_id).await;
        self.contexts.write().await.remove(&execution_id);
        self.events
            .emit(EngineEvent::WorkflowCancelled { execution_id });
        info!(execution_id = %execution_id, "Workflow cancelled");
        Ok(())
    }

    /// The main loop: drives nodes from the cursor until the execution
    /// completes, fails, pauses, or is cancelled.
    async fn run(&self, execution_id: Uuid) -> TesseraResult<WorkflowExecution> {
        loop {
            // Externally driven status changes (pause/cancel) are observed
            // here, at node boundaries only.
            let status = self.current_status(execution_id).await?;
            if status.is_terminal() || status == ExecutionStatus::Paused {
                return self.snapshot(execution_id).await;
            }

            let (node, options_timeout, save_intermediate, priority, branch_cap) = {
                let contexts = self.contexts.read().await;
                let ctx = contexts
                    .get(&execution_id)
                    .ok_or_else(|| unknown_execution(execution_id))?;
                let Some(cursor) = ctx.cursor.clone() else {
                    drop(contexts);
                    return self.finalize_success(execution_id).await;
                };
                let Some(node) = ctx.definition.node(&cursor).cloned() else {
                    drop(contexts);
                    let err = NodeExecutionError::new(
                        cursor.clone(),
                        ErrorCode::Internal,
                        format!("node '{cursor}' not found in workflow definition"),
                    );
                    return self.finalize_failure(execution_id, err).await;
                };
                (
                    node,
                    ctx.options.timeout_ms,
                    ctx.options.save_intermediate_results,
                    ctx.options.priority,
                    ctx.options.max_concurrency,
                )
            };

            if let Some(timeout_ms) = options_timeout {
                let elapsed = {
                    let executions = self.executions.read().await;
                    executions
                        .get(&execution_id)
                        .map(WorkflowExecution::duration_ms)
                        .unwrap_or(0)
                };
                if elapsed > timeout_ms {
                    let err = NodeExecutionError::new(
                        node.id.clone(),
                        ErrorCode::Timeout,
                        format!("workflow exceeded timeout of {timeout_ms}ms"),
                    );
                    return self.finalize_failure(execution_id, err).await;
                }
            }

            {
                let mut executions = self.executions.write().await;
                if let Some(exec) = executions.get_mut(&execution_id) {
                    exec.current_node = Some(node.id.clone());
                }
            }
            debug!(execution_id = %execution_id, node_id = %node.id, "Executing node");

            let dispatched = self.dispatch(execution_id, &node, priority, branch_cap).await;

            // A cancel may have landed while the node was in flight; its
            // result is discarded because the state is already cleaned up.
            let status = self.current_status(execution_id).await?;
            if status.is_terminal() {
                return self.snapshot(execution_id).await;
            }

            let result = match dispatched {
                Ok(Some(result)) => result,
                // Human node: the execution is paused, parked at this node.
                Ok(None) => return self.snapshot(execution_id).await,
                Err(err) => {
                    self.events.emit(EngineEvent::NodeFailed {
                        execution_id,
                        node_id: err.node_id.clone(),
                        message: err.message.clone(),
                    });
                    self.monitor
                        .update_metrics(
                            execution_id,
                            NodeSample {
                                cost: 0.0,
                                duration_ms: 0,
                                success: false,
                            },
                        )
                        .await;
                    return self.finalize_failure(execution_id, err).await;
                }
            };

            self.state
                .update(execution_id, result.updates, Some(&node.id))
                .await?;
            self.state
                .create_checkpoint(
                    execution_id,
                    &format!("after-{}", node.id),
                    json!({ "node": node.id }),
                )
                .await?;

            let state_now = self.state.current_state(execution_id).await?;
            let snapshot = {
                let mut executions = self.executions.write().await;
                let exec = executions
                    .get_mut(&execution_id)
                    .ok_or_else(|| unknown_execution(execution_id))?;
                exec.executed_nodes.push(node.id.clone());
                exec.record_node(&node.id, result.metrics.clone());
                exec.clone()
            };

            self.monitor
                .update_metrics(
                    execution_id,
                    NodeSample {
                        cost: result.metrics.cost,
                        duration_ms: result.metrics.duration_ms,
                        success: result.metrics.success,
                    },
                )
                .await;
            self.events.emit(EngineEvent::NodeExecuted {
                execution_id,
                node_id: node.id.clone(),
                cost: result.metrics.cost,
                duration_ms: result.metrics.duration_ms,
            });
            if save_intermediate {
                self.store.update(&snapshot).await?;
            }

            // Advance the cursor; a next node in the exit points (or no
            // next node at all) completes the workflow.
            let mut contexts = self.contexts.write().await;
            if let Some(ctx) = contexts.get_mut(&execution_id) {
                let next = next_node(
                    &ctx.definition,
                    &node.id,
                    &state_now,
                    result.explicit_next.clone(),
                );
                ctx.cursor = completion_cursor(&ctx.definition, next);
            }
        }
    }

    /// Dispatches one node by kind. `Ok(None)` means the execution paused
    /// at a human node.
    async fn dispatch(
        &self,
        execution_id: Uuid,
        node: &WorkflowNode,
        priority: tessera_router::RoutePriority,
        branch_cap: usize,
    ) -> Result<Option<NodeResult>, NodeExecutionError> {
        match &node.kind {
            NodeKind::Agent { agent_type } => {
                let run = self
                    .orchestrator
                    .execute_agent(&self.agent_request(execution_id, node, agent_type, priority).await?)
                    .await?;
                let mut updates = HashMap::new();
                match run.outcome.output {
                    Value::Object(map) => {
                        for (key, value) in map {
                            updates.insert(key, value);
                        }
                    }
                    other => {
                        updates.insert(node.id.clone(), other);
                    }
                }
                Ok(Some(NodeResult {
                    updates,
                    metrics: NodeMetrics {
                        duration_ms: run.outcome.duration_ms,
                        cost: run.outcome.cost,
                        success: true,
                        attempts: run.attempts,
                    },
                    explicit_next: run.outcome.next_node,
                }))
            }

            NodeKind::Condition { expression } => {
                let state_now = self.current_state_for(execution_id, &node.id).await?;
                let result = evaluate_condition(expression, &state_now);
                debug!(
                    execution_id = %execution_id,
                    node_id = %node.id,
                    result,
                    "Condition evaluated"
                );
                let mut updates = HashMap::new();
                updates.insert(format!("{}.result", node.id), json!(result));
                Ok(Some(NodeResult {
                    updates,
                    metrics: NodeMetrics {
                        duration_ms: 0,
                        cost: 0.0,
                        success: true,
                        attempts: 1,
                    },
                    explicit_next: None,
                }))
            }

            NodeKind::Parallel {
                branches,
                max_concurrency,
            } => {
                // The execution-level cap bounds the node-level one.
                let cap = (*max_concurrency).min(branch_cap);
                self.dispatch_parallel(execution_id, node, branches, cap, priority)
                    .await
            }

            NodeKind::Human { prompt } => {
                if let Some(prompt) = prompt {
                    let mut updates = HashMap::new();
                    updates.insert(format!("{}.prompt", node.id), json!(prompt));
                    self.state
                        .update(execution_id, updates, None)
                        .await
                        .map_err(|e| internal(&node.id, e))?;
                }
                let snapshot = {
                    let mut executions = self.executions.write().await;
                    let exec = executions
                        .get_mut(&execution_id)
                        .ok_or_else(|| internal(&node.id, unknown_execution(execution_id)))?;
                    exec.transition(ExecutionStatus::Paused)
                        .map_err(|e| internal(&node.id, e))?;
                    exec.clone()
                };
                self.store
                    .update(&snapshot)
                    .await
                    .map_err(|e| internal(&node.id, e))?;
                self.events.emit(EngineEvent::WorkflowPaused {
                    execution_id,
                    node_id: Some(node.id.clone()),
                });
                info!(
                    execution_id = %execution_id,
                    node_id = %node.id,
                    "Waiting for human input"
                );
                Ok(None)
            }

            NodeKind::Tool { tool, args } => {
                let adapter = self.tools.read().await.get(tool).cloned().ok_or_else(|| {
                    NodeExecutionError::new(
                        node.id.clone(),
                        ErrorCode::InvalidInput,
                        format!("no tool registered under '{tool}'"),
                    )
                })?;
                let started = std::time::Instant::now();
                let output = adapter.invoke(args.clone()).await.map_err(|e| {
                    NodeExecutionError::new(node.id.clone(), ErrorCode::ProviderError, e.to_string())
                })?;
                let mut updates = HashMap::new();
                updates.insert(node.id.clone(), output);
                Ok(Some(NodeResult {
                    updates,
                    metrics: NodeMetrics {
                        duration_ms: started.elapsed().as_millis() as u64,
                        cost: 0.0,
                        success: true,
                        attempts: 1,
                    },
                    explicit_next: None,
                }))
            }
        }
    }

    /// Fans out a parallel node's branches with bounded concurrency.
    ///
    /// Branch failures are captured per item under the branch's node id
    /// and never abort siblings or the workflow.
    async fn dispatch_parallel(
        &self,
        execution_id: Uuid,
        node: &WorkflowNode,
        branches: &[String],
        max_concurrency: usize,
        priority: tessera_router::RoutePriority,
    ) -> Result<Option<NodeResult>, NodeExecutionError> {
        let definition = {
            let contexts = self.contexts.read().await;
            contexts
                .get(&execution_id)
                .map(|ctx| ctx.definition.clone())
                .ok_or_else(|| internal(&node.id, unknown_execution(execution_id)))?
        };

        let mut requests = Vec::with_capacity(branches.len());
        for branch_id in branches {
            let branch = definition.node(branch_id).ok_or_else(|| {
                NodeExecutionError::new(
                    node.id.clone(),
                    ErrorCode::InvalidInput,
                    format!("parallel branch '{branch_id}' not found"),
                )
            })?;
            let NodeKind::Agent { agent_type } = &branch.kind else {
                return Err(NodeExecutionError::new(
                    node.id.clone(),
                    ErrorCode::InvalidInput,
                    format!("parallel branch '{branch_id}' is not an agent node"),
                ));
            };
            requests.push(
                self.agent_request(execution_id, branch, agent_type, priority)
                    .await?,
            );
        }

        let started = std::time::Instant::now();
        let results = self
            .orchestrator
            .execute_parallel(requests, max_concurrency)
            .await;

        let mut updates = HashMap::new();
        let mut total_cost = 0.0;
        let mut branch_records = Vec::with_capacity(results.len());
        for (branch_id, result) in branches.iter().zip(results) {
            match result {
                Ok(run) => {
                    total_cost += run.outcome.cost;
                    updates.insert(branch_id.clone(), run.outcome.output);
                    branch_records.push((
                        branch_id.clone(),
                        NodeMetrics {
                            duration_ms: run.outcome.duration_ms,
                            cost: run.outcome.cost,
                            success: true,
                            attempts: run.attempts,
                        },
                        None,
                    ));
                }
                Err(err) => {
                    updates.insert(branch_id.clone(), json!({ "error": err.message }));
                    branch_records.push((
                        branch_id.clone(),
                        NodeMetrics {
                            duration_ms: 0,
                            cost: 0.0,
                            success: false,
                            attempts: err.attempts,
                        },
                        Some(err),
                    ));
                }
            }
        }

        {
            let mut executions = self.executions.write().await;
            let exec = executions
                .get_mut(&execution_id)
                .ok_or_else(|| internal(&node.id, unknown_execution(execution_id)))?;
            for (branch_id, metrics, err) in &branch_records {
                exec.executed_nodes.push(branch_id.clone());
                exec.record_node(branch_id, metrics.clone());
                if let Some(err) = err {
                    exec.errors.push(err.clone());
                }
            }
        }
        for (branch_id, metrics, err) in branch_records {
            self.monitor
                .update_metrics(
                    execution_id,
                    NodeSample {
                        cost: metrics.cost,
                        duration_ms: metrics.duration_ms,
                        success: metrics.success,
                    },
                )
                .await;
            match err {
                None => self.events.emit(EngineEvent::NodeExecuted {
                    execution_id,
                    node_id: branch_id,
                    cost: metrics.cost,
                    duration_ms: metrics.duration_ms,
                }),
                Some(err) => self.events.emit(EngineEvent::NodeFailed {
                    execution_id,
                    node_id: branch_id,
                    message: err.message,
                }),
            }
        }

        Ok(Some(NodeResult {
            updates,
            metrics: NodeMetrics {
                duration_ms: started.elapsed().as_millis() as u64,
                cost: total_cost,
                success: true,
                attempts: 1,
            },
            explicit_next: None,
        }))
    }

    async fn agent_request(
        &self,
        execution_id: Uuid,
        node: &WorkflowNode,
        agent_type: &str,
        priority: tessera_router::RoutePriority,
    ) -> Result<AgentRequest, NodeExecutionError> {
        let state_now = self.current_state_for(execution_id, &node.id).await?;
        // A node without a retry policy makes exactly one attempt.
        let retry_policy = node.retry_policy.clone().unwrap_or(RetryPolicy {
            max_retries: 0,
            ..RetryPolicy::default()
        });
        Ok(AgentRequest {
            execution_id,
            node_id: node.id.clone(),
            agent_type: agent_type.to_string(),
            input: state_now.clone(),
            state: state_now,
            config: node.config.clone(),
            retry_policy,
            priority,
        })
    }

    async fn current_state_for(
        &self,
        execution_id: Uuid,
        node_id: &str,
    ) -> Result<Value, NodeExecutionError> {
        self.state
            .current_state(execution_id)
            .await
            .map_err(|e| internal(node_id, e))
    }

    async fn current_status(&self, execution_id: Uuid) -> TesseraResult<ExecutionStatus> {
        let executions = self.executions.read().await;
        executions
            .get(&execution_id)
            .map(|exec| exec.status)
            .ok_or_else(|| unknown_execution(execution_id))
    }

    async fn snapshot(&self, execution_id: Uuid) -> TesseraResult<WorkflowExecution> {
        let executions = self.executions.read().await;
        executions
            .get(&execution_id)
            .cloned()
            .ok_or_else(|| unknown_execution(execution_id))
    }

    /// Terminal bookkeeping for a completed execution: capture the output,
    /// fold in the monitor report, persist, clean up state, emit.
    async fn finalize_success(&self, execution_id: Uuid) -> TesseraResult<WorkflowExecution> {
        let output = self.state.current_state(execution_id).await?;
        let report = self.monitor.stop_monitoring(execution_id).await;

        let snapshot = {
            let mut executions = self.executions.write().await;
            let exec = executions
                .get_mut(&execution_id)
                .ok_or_else(|| unknown_execution(execution_id))?;
            exec.output = Some(output);
            if let Some(report) = &report {
                exec.metrics.peak_memory_bytes = report.max_memory_bytes;
            }
            exec.transition(ExecutionStatus::Completed)?;
            exec.clone()
        };

        self.store.update(&snapshot).await?;
        self.state.cleanup(execution_id).await;
        self.contexts.write().await.remove(&execution_id);
        self.events.emit(EngineEvent::WorkflowCompleted {
            execution_id,
            total_cost: snapshot.metrics.total_cost,
        });
        info!(
            execution_id = %execution_id,
            total_cost = snapshot.metrics.total_cost,
            duration_ms = snapshot.duration_ms(),
            nodes = snapshot.executed_nodes.len(),
            "Workflow completed"
        );
        Ok(snapshot)
    }

    /// Terminal bookkeeping for a failed execution; the caller gets the
    /// fatal node error together with every error recorded on the
    /// execution, including earlier isolated parallel-branch failures.
    async fn finalize_failure(
        &self,
        execution_id: Uuid,
        err: NodeExecutionError,
    ) -> TesseraResult<WorkflowExecution> {
        let snapshot = {
            let mut executions = self.executions.write().await;
            let exec = executions
                .get_mut(&execution_id)
                .ok_or_else(|| unknown_execution(execution_id))?;
            exec.errors.push(err.clone());
            exec.transition(ExecutionStatus::Failed)?;
            exec.clone()
        };

        self.monitor.stop_monitoring(execution_id).await;
        self.store.update(&snapshot).await?;
        self.state.cleanup(execution_id).await;
        self.contexts.write().await.remove(&execution_id);
        self.events.emit(EngineEvent::WorkflowFailed {
            execution_id,
            node_id: Some(err.node_id.clone()),
            message: err.message.clone(),
        });
        error!(
            execution_id = %execution_id,
            node_id = %err.node_id,
            code = ?err.code,
            "Workflow failed: {}",
            err.message
        );
        Err(TesseraError::ExecutionFailed {
            execution_id,
            fatal: err,
            errors: snapshot.errors,
        })
    }
}

/// The next-node rule.
///
/// An explicit next from the node's outcome wins. Otherwise: no outgoing
/// edges ends the path; a single outgoing edge is always taken; with
/// multiple edges the first whose condition holds (an unconditional edge
/// always holds) is taken in declaration order, and when none hold the
/// first declared edge is the fallback.
fn next_node(
    definition: &WorkflowDefinition,
    node_id: &str,
    state: &Value,
    explicit: Option<String>,
) -> Option<String> {
    if let Some(next) = explicit {
        return Some(next);
    }
    let edges = definition.outgoing(node_id);
    match edges.len() {
        0 => None,
        1 => Some(edges[0].target.clone()),
        _ => {
            for edge in &edges {
                match &edge.condition {
                    None => return Some(edge.target.clone()),
                    Some(condition) if evaluate_condition(condition, state) => {
                        return Some(edge.target.clone())
                    }
                    Some(_) => {}
                }
            }
            Some(edges[0].target.clone())
        }
    }
}

/// Maps "next is an exit point" to "no next node": reaching an exit point
/// completes the workflow.
fn completion_cursor(definition: &WorkflowDefinition, next: Option<String>) -> Option<String> {
    next.filter(|n| !definition.exit_points.contains(n))
}

fn unknown_execution(execution_id: Uuid) -> TesseraError {
    TesseraError::Workflow(format!("unknown execution {execution_id}"))
}

fn internal(node_id: &str, err: TesseraError) -> NodeExecutionError {
    NodeExecutionError::new(node_id, ErrorCode::Internal, err.to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use tessera_core::{WorkflowEdge, WorkflowNode};

    fn definition(edges: Vec<WorkflowEdge>) -> WorkflowDefinition {
        WorkflowDefinition {
            id: "wf".to_string(),
            name: "test".to_string(),
            entry_point: "a".to_string(),
            exit_points: vec!["z".to_string()],
            nodes: vec![
                WorkflowNode::agent("a", "text-generator"),
                WorkflowNode::agent("b", "text-generator"),
                WorkflowNode::agent("c", "text-generator"),
                WorkflowNode::agent("z", "text-generator"),
            ],
            edges,
        }
    }

    #[test]
    fn explicit_next_wins() {
        let def = definition(vec![WorkflowEdge::new("a", "b")]);
        assert_eq!(
            next_node(&def, "a", &json!({}), Some("c".to_string())),
            Some("c".to_string())
        );
    }

    #[test]
    fn single_edge_taken_unconditionally() {
        let def = definition(vec![WorkflowEdge::when("a", "b", "missing == 1")]);
        // One outgoing edge is followed without evaluating its condition.
        assert_eq!(next_node(&def, "a", &json!({}), None), Some("b".to_string()));
    }

    #[test]
    fn first_true_condition_in_declaration_order() {
        let def = definition(vec![
            WorkflowEdge::when("a", "b", "score > 5"),
            WorkflowEdge::when("a", "c", "score > 1"),
        ]);
        assert_eq!(
            next_node(&def, "a", &json!({"score": 3}), None),
            Some("c".to_string())
        );
        assert_eq!(
            next_node(&def, "a", &json!({"score": 9}), None),
            Some("b".to_string())
        );
    }

    #[test]
    fn no_true_condition_falls_back_to_first_declared_edge() {
        let def = definition(vec![
            WorkflowEdge::when("a", "b", "score > 5"),
            WorkflowEdge::when("a", "c", "score > 9"),
        ]);
        assert_eq!(
            next_node(&def, "a", &json!({"score": 1}), None),
            Some("b".to_string())
        );
    }

    #[test]
    fn no_edges_ends_the_path() {
        let def = definition(vec![]);
        assert_eq!(next_node(&def, "a", &json!({}), None), None);
    }

    #[test]
    fn exit_point_next_completes() {
        let def = definition(vec![]);
        assert_eq!(completion_cursor(&def, Some("z".to_string())), None);
        assert_eq!(
            completion_cursor(&def, Some("b".to_string())),
            Some("b".to_string())
        );
        assert_eq!(completion_cursor(&def, None), None);
    }
}
