//! Runtime monitoring, alerts, and reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use tessera_core::{EngineEvent, EventBus};

/// Most recent samples kept per execution.
const SAMPLE_CAP: usize = 100;

/// Alert thresholds evaluated after every metrics update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorThresholds {
    /// Maximum execution duration before alerting.
    #[serde(default = "default_max_duration_ms")]
    pub max_duration_ms: u64,
    /// Maximum total cost before alerting, USD.
    #[serde(default = "default_max_cost")]
    pub max_cost: f64,
    /// Maximum sampled memory before alerting.
    #[serde(default = "default_max_memory_bytes")]
    pub max_memory_bytes: u64,
    /// Maximum node error rate before alerting.
    #[serde(default = "default_max_error_rate")]
    pub max_error_rate: f64,
}

fn default_max_duration_ms() -> u64 {
    300_000
}

fn default_max_cost() -> f64 {
    10.0
}

fn default_max_memory_bytes() -> u64 {
    1024 * 1024 * 1024
}

fn default_max_error_rate() -> f64 {
    0.5
}

impl Default for MonitorThresholds {
    fn default() -> Self {
        Self {
            max_duration_ms: default_max_duration_ms(),
            max_cost: default_max_cost(),
            max_memory_bytes: default_max_memory_bytes(),
            max_error_rate: default_max_error_rate(),
        }
    }
}

/// One point-in-time resource observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSample {
    /// Resident memory of the process.
    pub memory_bytes: u64,
    /// Process CPU usage since the previous sample, percent.
    pub cpu_pct: f64,
    /// Scheduling lag observed by the sampler.
    pub latency_ms: u64,
    /// When the sample was taken.
    pub at: DateTime<Utc>,
}

/// Which threshold an alert breached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Execution ran longer than the duration ceiling.
    Duration,
    /// Total cost crossed the cost ceiling.
    Cost,
    /// Sampled memory crossed the memory ceiling.
    Memory,
    /// Node error rate crossed the error-rate ceiling.
    ErrorRate,
}

/// How severe a breach is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    /// Breach below 150% of the ceiling.
    Warning,
    /// Breach at or above 150% of the ceiling.
    Critical,
}

/// A threshold breach recorded for an execution. Append-only; repeated
/// breaches are recorded every time they are observed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionAlert {
    /// The execution the alert belongs to.
    pub execution_id: Uuid,
    /// Which threshold was breached.
    pub kind: AlertKind,
    /// Breach severity.
    pub severity: AlertSeverity,
    /// Human-readable description.
    pub message: String,
    /// When the breach was observed.
    pub at: DateTime<Utc>,
    /// Observed and threshold values.
    pub metadata: Value,
}

/// Per-node observation fed into [`ExecutionMonitor::update_metrics`].
#[derive(Debug, Clone, Copy)]
pub struct NodeSample {
    /// Cost of the node call, USD.
    pub cost: f64,
    /// Wall-clock duration of the node call.
    pub duration_ms: u64,
    /// Whether the node succeeded.
    pub success: bool,
}

/// Final report produced when monitoring stops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    /// The execution reported on.
    pub execution_id: Uuid,
    /// Total monitored duration.
    pub duration_ms: u64,
    /// Nodes observed.
    pub node_count: u32,
    /// Nodes that failed.
    pub failed_nodes: u32,
    /// failed / total.
    pub error_rate: f64,
    /// Total cost observed, USD.
    pub total_cost: f64,
    /// Average sampled memory.
    pub avg_memory_bytes: u64,
    /// Peak sampled memory.
    pub max_memory_bytes: u64,
    /// Average sampled CPU percent.
    pub avg_cpu_pct: f64,
    /// Peak sampled CPU percent.
    pub max_cpu_pct: f64,
    /// Average sampler lag.
    pub avg_latency_ms: u64,
    /// Success rate weighted by normalized average node duration, in [0,1].
    pub efficiency: f64,
    /// Average memory over the memory ceiling, in [0,1].
    pub resource_utilization: f64,
    /// One minus normalized cost per successful node, in [0,1].
    pub cost_effectiveness: f64,
    /// All alerts raised while monitoring.
    pub alerts: Vec<ExecutionAlert>,
}

#[derive(Debug)]
struct MonitorState {
    started_at: DateTime<Utc>,
    samples: VecDeque<ResourceSample>,
    total_cost: f64,
    node_count: u32,
    failed_nodes: u32,
    total_node_duration_ms: u64,
    error_rate: f64,
    alerts: Vec<ExecutionAlert>,
}

impl MonitorState {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            samples: VecDeque::with_capacity(SAMPLE_CAP),
            total_cost: 0.0,
            node_count: 0,
            failed_nodes: 0,
            total_node_duration_ms: 0,
            error_rate: 0.0,
            alerts: Vec::new(),
        }
    }

    fn push_sample(&mut self, sample: ResourceSample) {
        if self.samples.len() == SAMPLE_CAP {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }
}

/// Samples performance during a run, raises threshold alerts, and produces
/// a final [`ExecutionReport`].
pub struct ExecutionMonitor {
    states: Arc<RwLock<HashMap<Uuid, MonitorState>>>,
    thresholds: MonitorThresholds,
    sample_interval: Duration,
    events: EventBus,
}

impl ExecutionMonitor {
    /// Creates a monitor with the given thresholds, publishing
    /// `monitoring.alert` events on `events`.
    pub fn new(thresholds: MonitorThresholds, events: EventBus) -> Self {
        Self {
            states: Arc::new(RwLock::new(HashMap::new())),
            thresholds,
            sample_interval: Duration::from_secs(5),
            events,
        }
    }

    /// Overrides the sampling interval (default 5s).
    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    /// Begins periodic resource sampling for an execution. The sampling
    /// task exits on [`ExecutionMonitor::stop_monitoring`].
    pub async fn start_monitoring(&self, execution_id: Uuid) {
        self.states
            .write()
            .await
            .insert(execution_id, MonitorState::new());

        let states = Arc::clone(&self.states);
        let interval = self.sample_interval;
        tokio::spawn(async move {
            let mut cpu = CpuTracker::new();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // first tick fires immediately
            loop {
                let before = tokio::time::Instant::now();
                ticker.tick().await;
                let lag = before.elapsed().saturating_sub(interval);
                let sample = ResourceSample {
                    memory_bytes: read_memory_bytes(),
                    cpu_pct: cpu.sample(),
                    latency_ms: lag.as_millis() as u64,
                    at: Utc::now(),
                };
                let mut states = states.write().await;
                match states.get_mut(&execution_id) {
                    Some(state) => state.push_sample(sample),
                    None => break, // monitoring stopped
                }
            }
            debug!(execution_id = %execution_id, "Sampler stopped");
        });
    }

    /// Records an externally observed sample and evaluates thresholds.
    pub async fn record_sample(
        &self,
        execution_id: Uuid,
        sample: ResourceSample,
    ) -> Vec<ExecutionAlert> {
        let mut states = self.states.write().await;
        let Some(state) = states.get_mut(&execution_id) else {
            return Vec::new();
        };
        state.push_sample(sample);
        self.check_alerts(execution_id, state)
    }

    /// Merges a node observation into the running totals, recomputes the
    /// error rate, and evaluates thresholds.
    pub async fn update_metrics(
        &self,
        execution_id: Uuid,
        node: NodeSample,
    ) -> Vec<ExecutionAlert> {
        let mut states = self.states.write().await;
        let Some(state) = states.get_mut(&execution_id) else {
            return Vec::new();
        };
        state.total_cost += node.cost;
        state.node_count += 1;
        state.total_node_duration_ms += node.duration_ms;
        if !node.success {
            state.failed_nodes += 1;
        }
        state.error_rate = f64::from(state.failed_nodes) / f64::from(state.node_count.max(1));
        self.check_alerts(execution_id, state)
    }

    /// Evaluates the four independent thresholds. Every breach produces a
    /// distinct alert; repeats are never suppressed.
    fn check_alerts(&self, execution_id: Uuid, state: &mut MonitorState) -> Vec<ExecutionAlert> {
        let mut raised = Vec::new();
        let now = Utc::now();

        let duration_ms = (now - state.started_at).num_milliseconds().max(0) as u64;
        if duration_ms > self.thresholds.max_duration_ms {
            raised.push(self.alert(
                execution_id,
                AlertKind::Duration,
                duration_ms as f64,
                self.thresholds.max_duration_ms as f64,
                format!(
                    "execution running {duration_ms}ms, over limit {}ms",
                    self.thresholds.max_duration_ms
                ),
                now,
            ));
        }
        if state.total_cost > self.thresholds.max_cost {
            raised.push(self.alert(
                execution_id,
                AlertKind::Cost,
                state.total_cost,
                self.thresholds.max_cost,
                format!(
                    "cost ${:.4} over limit ${:.4}",
                    state.total_cost, self.thresholds.max_cost
                ),
                now,
            ));
        }
        if let Some(last) = state.samples.back() {
            if last.memory_bytes > self.thresholds.max_memory_bytes {
                raised.push(self.alert(
                    execution_id,
                    AlertKind::Memory,
                    last.memory_bytes as f64,
                    self.thresholds.max_memory_bytes as f64,
                    format!(
                        "memory {} bytes over limit {}",
                        last.memory_bytes, self.thresholds.max_memory_bytes
                    ),
                    now,
                ));
            }
        }
        if state.error_rate > self.thresholds.max_error_rate {
            raised.push(self.alert(
                execution_id,
                AlertKind::ErrorRate,
                state.error_rate,
                self.thresholds.max_error_rate,
                format!(
                    "error rate {:.2} over limit {:.2}",
                    state.error_rate, self.thresholds.max_error_rate
                ),
                now,
            ));
        }

        for alert in &raised {
            warn!(
                execution_id = %execution_id,
                kind = ?alert.kind,
                severity = ?alert.severity,
                "{}",
                alert.message
            );
            self.events.emit(EngineEvent::MonitoringAlert {
                execution_id,
                alert: serde_json::to_value(alert).unwrap_or(Value::Null),
            });
        }
        state.alerts.extend(raised.clone());
        raised
    }

    fn alert(
        &self,
        execution_id: Uuid,
        kind: AlertKind,
        observed: f64,
        limit: f64,
        message: String,
        at: DateTime<Utc>,
    ) -> ExecutionAlert {
        let severity = if limit > 0.0 && observed >= limit * 1.5 {
            AlertSeverity::Critical
        } else {
            AlertSeverity::Warning
        };
        ExecutionAlert {
            execution_id,
            kind,
            severity,
            message,
            at,
            metadata: serde_json::json!({ "observed": observed, "limit": limit }),
        }
    }

    /// Freezes sampling and produces the final report. Returns `None` for
    /// an unmonitored execution.
    pub async fn stop_monitoring(&self, execution_id: Uuid) -> Option<ExecutionReport> {
        let state = self.states.write().await.remove(&execution_id)?;
        let duration_ms = (Utc::now() - state.started_at).num_milliseconds().max(0) as u64;

        let n = state.samples.len().max(1) as f64;
        let avg_memory =
            (state.samples.iter().map(|s| s.memory_bytes).sum::<u64>() as f64 / n) as u64;
        let max_memory = state.samples.iter().map(|s| s.memory_bytes).max().unwrap_or(0);
        let avg_cpu = state.samples.iter().map(|s| s.cpu_pct).sum::<f64>() / n;
        let max_cpu = state
            .samples
            .iter()
            .map(|s| s.cpu_pct)
            .fold(0.0_f64, f64::max);
        let avg_latency =
            (state.samples.iter().map(|s| s.latency_ms).sum::<u64>() as f64 / n) as u64;

        let success_rate = if state.node_count == 0 {
            1.0
        } else {
            f64::from(state.node_count - state.failed_nodes) / f64::from(state.node_count)
        };
        let avg_node_duration = if state.node_count == 0 {
            0.0
        } else {
            state.total_node_duration_ms as f64 / f64::from(state.node_count)
        };
        let norm_duration =
            (avg_node_duration / self.thresholds.max_duration_ms as f64).clamp(0.0, 1.0);
        let efficiency = (success_rate * (1.0 - norm_duration)).clamp(0.0, 1.0);

        let resource_utilization =
            (avg_memory as f64 / self.thresholds.max_memory_bytes as f64).clamp(0.0, 1.0);

        let successes = state.node_count - state.failed_nodes;
        let cost_per_success = state.total_cost / f64::from(successes.max(1));
        let cost_effectiveness =
            (1.0 - (cost_per_success / self.thresholds.max_cost).clamp(0.0, 1.0)).clamp(0.0, 1.0);

        Some(ExecutionReport {
            execution_id,
            duration_ms,
            node_count: state.node_count,
            failed_nodes: state.failed_nodes,
            error_rate: state.error_rate,
            total_cost: state.total_cost,
            avg_memory_bytes: avg_memory,
            max_memory_bytes: max_memory,
            avg_cpu_pct: avg_cpu,
            max_cpu_pct: max_cpu,
            avg_latency_ms: avg_latency,
            efficiency,
            resource_utilization,
            cost_effectiveness,
            alerts: state.alerts,
        })
    }

    /// Alerts recorded so far for a live execution.
    pub async fn alerts(&self, execution_id: Uuid) -> Vec<ExecutionAlert> {
        self.states
            .read()
            .await
            .get(&execution_id)
            .map(|s| s.alerts.clone())
            .unwrap_or_default()
    }

    /// Peak sampled memory for a live execution.
    pub async fn peak_memory_bytes(&self, execution_id: Uuid) -> u64 {
        self.states
            .read()
            .await
            .get(&execution_id)
            .and_then(|s| s.samples.iter().map(|x| x.memory_bytes).max())
            .unwrap_or(0)
    }
}

/// Resident memory of the current process, from procfs on Linux.
fn read_memory_bytes() -> u64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(statm) = std::fs::read_to_string("/proc/self/statm") {
            if let Some(resident) = statm.split_whitespace().nth(1) {
                if let Ok(pages) = resident.parse::<u64>() {
                    return pages * 4096;
                }
            }
        }
    }
    0
}

/// Tracks process CPU usage between samples via procfs jiffies.
struct CpuTracker {
    last_jiffies: u64,
    last_at: std::time::Instant,
}

impl CpuTracker {
    fn new() -> Self {
        Self {
            last_jiffies: read_cpu_jiffies(),
            last_at: std::time::Instant::now(),
        }
    }

    fn sample(&mut self) -> f64 {
        let jiffies = read_cpu_jiffies();
        let elapsed = self.last_at.elapsed().as_secs_f64();
        let used = (jiffies.saturating_sub(self.last_jiffies)) as f64 / 100.0;
        self.last_jiffies = jiffies;
        self.last_at = std::time::Instant::now();
        if elapsed > 0.0 {
            (used / elapsed * 100.0).min(100.0)
        } else {
            0.0
        }
    }
}

/// utime + stime of the current process, from procfs on Linux.
fn read_cpu_jiffies() -> u64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(stat) = std::fs::read_to_string("/proc/self/stat") {
            // Fields 14 and 15 (1-based) after the parenthesized comm field.
            if let Some(rest) = stat.rsplit(')').next() {
                let fields: Vec<&str> = rest.split_whitespace().collect();
                if fields.len() > 12 {
                    let utime: u64 = fields[11].parse().unwrap_or(0);
                    let stime: u64 = fields[12].parse().unwrap_or(0);
                    return utime + stime;
                }
            }
        }
    }
    0
}
