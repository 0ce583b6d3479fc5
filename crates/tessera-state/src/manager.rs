//! The state manager and its record types.

use crate::diff::{diff, StateDiff};
use crate::paths::{get_path, set_path};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tessera_core::{TesseraError, TesseraResult};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// An immutable, versioned snapshot of execution state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// The execution this snapshot belongs to.
    pub execution_id: Uuid,
    /// Caller-assigned checkpoint id.
    pub checkpoint_id: String,
    /// Deep copy of the state at checkpoint time.
    pub state: Value,
    /// Monotonically increasing per execution.
    pub version: u64,
    /// When the checkpoint was taken.
    pub created_at: DateTime<Utc>,
    /// Serialized size of the state in bytes.
    pub size: usize,
    /// Caller-supplied metadata.
    #[serde(default)]
    pub metadata: Value,
}

/// A recorded state change triggered by a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    /// State before the update.
    pub from: Value,
    /// State after the update.
    pub to: Value,
    /// Key paths that changed.
    pub diff: StateDiff,
    /// The node id that triggered the update.
    pub trigger: String,
    /// When the update happened.
    pub at: DateTime<Utc>,
}

#[derive(Debug)]
struct ExecutionState {
    state: Value,
    checkpoints: Vec<StateSnapshot>,
    transitions: Vec<StateTransition>,
    next_version: u64,
}

/// Keyed store of all live execution states.
///
/// State is discarded only by [`StateManager::cleanup`]; callers must invoke
/// it when an execution finishes to bound memory growth.
#[derive(Debug, Default)]
pub struct StateManager {
    executions: RwLock<HashMap<Uuid, ExecutionState>>,
}

impl StateManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the initial state for an execution and takes an `"initial"`
    /// checkpoint at version 1. Non-object initial states are wrapped under
    /// an `"input"` key so dotted-path access always works.
    pub async fn initialize(&self, execution_id: Uuid, initial_state: Value) -> TesseraResult<()> {
        let state = match initial_state {
            Value::Object(_) => initial_state,
            Value::Null => Value::Object(Map::new()),
            other => {
                let mut map = Map::new();
                map.insert("input".to_string(), other);
                Value::Object(map)
            }
        };

        let mut executions = self.executions.write().await;
        if executions.contains_key(&execution_id) {
            return Err(TesseraError::State(format!(
                "execution {execution_id} already initialized"
            )));
        }
        let snapshot = make_snapshot(execution_id, "initial", &state, 1, Value::Null)?;
        executions.insert(
            execution_id,
            ExecutionState {
                state,
                checkpoints: vec![snapshot],
                transitions: Vec::new(),
                next_version: 2,
            },
        );
        debug!(execution_id = %execution_id, "State initialized");
        Ok(())
    }

    /// Merges dotted-path updates into the current state. When `trigger` is
    /// set, a [`StateTransition`] with the computed diff is recorded.
    pub async fn update(
        &self,
        execution_id: Uuid,
        updates: HashMap<String, Value>,
        trigger: Option<&str>,
    ) -> TesseraResult<()> {
        let mut executions = self.executions.write().await;
        let exec = executions
            .get_mut(&execution_id)
            .ok_or_else(|| unknown_execution(execution_id))?;

        let before = exec.state.clone();
        for (path, value) in updates {
            set_path(&mut exec.state, &path, value);
        }

        if let Some(trigger) = trigger {
            let transition = StateTransition {
                diff: diff(&before, &exec.state),
                from: before,
                to: exec.state.clone(),
                trigger: trigger.to_string(),
                at: Utc::now(),
            };
            exec.transitions.push(transition);
        }
        Ok(())
    }

    /// Reads a value at a dotted path.
    pub async fn get_value(&self, execution_id: Uuid, path: &str) -> TesseraResult<Option<Value>> {
        let executions = self.executions.read().await;
        let exec = executions
            .get(&execution_id)
            .ok_or_else(|| unknown_execution(execution_id))?;
        Ok(get_path(&exec.state, path).cloned())
    }

    /// Writes a single value at a dotted path.
    pub async fn set_value(
        &self,
        execution_id: Uuid,
        path: &str,
        value: Value,
    ) -> TesseraResult<()> {
        let mut updates = HashMap::new();
        updates.insert(path.to_string(), value);
        self.update(execution_id, updates, None).await
    }

    /// A copy of the current working state.
    pub async fn current_state(&self, execution_id: Uuid) -> TesseraResult<Value> {
        let executions = self.executions.read().await;
        let exec = executions
            .get(&execution_id)
            .ok_or_else(|| unknown_execution(execution_id))?;
        Ok(exec.state.clone())
    }

    /// Deep-copies the current state into a new checkpoint with the next
    /// version number for this execution.
    pub async fn create_checkpoint(
        &self,
        execution_id: Uuid,
        checkpoint_id: &str,
        metadata: Value,
    ) -> TesseraResult<StateSnapshot> {
        let mut executions = self.executions.write().await;
        let exec = executions
            .get_mut(&execution_id)
            .ok_or_else(|| unknown_execution(execution_id))?;

        let version = exec.next_version;
        exec.next_version += 1;
        let snapshot = make_snapshot(execution_id, checkpoint_id, &exec.state, version, metadata)?;
        exec.checkpoints.push(snapshot.clone());
        info!(
            execution_id = %execution_id,
            checkpoint = checkpoint_id,
            version,
            "Checkpoint created"
        );
        Ok(snapshot)
    }

    /// Replaces the live state wholesale with a checkpoint's copy. Returns
    /// `false` when the checkpoint id is unknown — callers must check.
    pub async fn restore_from_checkpoint(
        &self,
        execution_id: Uuid,
        checkpoint_id: &str,
    ) -> TesseraResult<bool> {
        let mut executions = self.executions.write().await;
        let exec = executions
            .get_mut(&execution_id)
            .ok_or_else(|| unknown_execution(execution_id))?;

        let Some(snapshot) = exec
            .checkpoints
            .iter()
            .rev()
            .find(|c| c.checkpoint_id == checkpoint_id)
        else {
            return Ok(false);
        };
        exec.state = snapshot.state.clone();
        info!(
            execution_id = %execution_id,
            checkpoint = checkpoint_id,
            version = snapshot.version,
            "State restored from checkpoint"
        );
        Ok(true)
    }

    /// All checkpoints for an execution, in creation order.
    pub async fn checkpoints(&self, execution_id: Uuid) -> TesseraResult<Vec<StateSnapshot>> {
        let executions = self.executions.read().await;
        let exec = executions
            .get(&execution_id)
            .ok_or_else(|| unknown_execution(execution_id))?;
        Ok(exec.checkpoints.clone())
    }

    /// All recorded transitions for an execution, in order.
    pub async fn transitions(&self, execution_id: Uuid) -> TesseraResult<Vec<StateTransition>> {
        let executions = self.executions.read().await;
        let exec = executions
            .get(&execution_id)
            .ok_or_else(|| unknown_execution(execution_id))?;
        Ok(exec.transitions.clone())
    }

    /// Discards state, checkpoints, and transitions for a finished
    /// execution.
    pub async fn cleanup(&self, execution_id: Uuid) {
        let removed = self.executions.write().await.remove(&execution_id);
        if removed.is_some() {
            debug!(execution_id = %execution_id, "State cleaned up");
        }
    }

    /// Number of executions currently holding state.
    pub async fn live_count(&self) -> usize {
        self.executions.read().await.len()
    }
}

fn unknown_execution(execution_id: Uuid) -> TesseraError {
    TesseraError::State(format!("unknown execution {execution_id}"))
}

fn make_snapshot(
    execution_id: Uuid,
    checkpoint_id: &str,
    state: &Value,
    version: u64,
    metadata: Value,
) -> TesseraResult<StateSnapshot> {
    let size = serde_json::to_vec(state)?.len();
    Ok(StateSnapshot {
        execution_id,
        checkpoint_id: checkpoint_id.to_string(),
        state: state.clone(),
        version,
        created_at: Utc::now(),
        size,
        metadata,
    })
}
