//! Budget configuration, usage tracking, and the budget guard.

use crate::catalog::{ModelCatalog, QualityTier, TaskType};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};

/// Spend ceilings supplied by external configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostBudget {
    /// Maximum spend per calendar day, USD.
    #[serde(default = "default_daily_limit")]
    pub daily_limit: f64,
    /// Maximum spend per calendar month, USD.
    #[serde(default = "default_monthly_limit")]
    pub monthly_limit: f64,
    /// Maximum spend for a single request, USD.
    #[serde(default = "default_per_request_limit")]
    pub per_request_limit: f64,
    /// Usage percentage at which warning alerts fire.
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold_pct: f64,
}

fn default_daily_limit() -> f64 {
    50.0
}

fn default_monthly_limit() -> f64 {
    1000.0
}

fn default_per_request_limit() -> f64 {
    5.0
}

fn default_alert_threshold() -> f64 {
    80.0
}

impl Default for CostBudget {
    fn default() -> Self {
        Self {
            daily_limit: default_daily_limit(),
            monthly_limit: default_monthly_limit(),
            per_request_limit: default_per_request_limit(),
            alert_threshold_pct: default_alert_threshold(),
        }
    }
}

/// Running spend totals.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostUsage {
    /// Spend so far today, USD.
    pub daily: f64,
    /// Spend so far this month, USD.
    pub monthly: f64,
    /// Monthly spend broken down by task type.
    pub by_task: HashMap<TaskType, f64>,
}

/// Outcome of a budget check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "lowercase")]
pub enum BudgetDecision {
    /// The request may proceed.
    Allowed,
    /// The request must not be made.
    Denied {
        /// Which ceiling would be breached and by how much.
        reason: String,
    },
}

impl BudgetDecision {
    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, BudgetDecision::Allowed)
    }
}

/// A non-blocking warning that usage crossed an alert threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetAlert {
    /// `"daily"` or `"monthly"`.
    pub scope: String,
    /// Percentage of the limit consumed.
    pub pct_used: f64,
    /// Human-readable warning.
    pub message: String,
}

/// Qualitative quality change from substituting a cheaper model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityImpact {
    /// Same tier.
    None,
    /// One tier down, still at or above standard.
    Minimal,
    /// One tier down to basic.
    Moderate,
    /// Two tiers down.
    Significant,
}

/// A cheaper-model suggestion from the optimizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRecommendation {
    /// The suggested model.
    pub model_id: String,
    /// Per-unit cost savings versus the current model, percent.
    pub savings_pct: f64,
    /// Qualitative quality change.
    pub quality_impact: QualityImpact,
}

#[derive(Debug, Default)]
struct UsageInner {
    usage: CostUsage,
    /// Estimates reserved by in-flight requests, not yet settled.
    reserved_daily: f64,
    reserved_monthly: f64,
}

/// Gates paid calls against configured ceilings and tracks cumulative spend.
///
/// All totals live behind one mutex so a check-then-reserve sequence is
/// atomic: two concurrent requests can never both pass a check that only one
/// of them can satisfy.
pub struct BudgetGuard {
    budget: CostBudget,
    catalog: ModelCatalog,
    inner: Mutex<UsageInner>,
}

impl BudgetGuard {
    /// Creates a guard over the given budget and model catalog.
    pub fn new(budget: CostBudget, catalog: ModelCatalog) -> Self {
        Self {
            budget,
            catalog,
            inner: Mutex::new(UsageInner::default()),
        }
    }

    /// The configured ceilings.
    pub fn budget(&self) -> &CostBudget {
        &self.budget
    }

    /// Checks whether a call with the given estimated cost may proceed.
    /// Read-only; use [`BudgetGuard::reserve`] for in-flight accounting.
    pub fn check_budget(&self, estimated: f64, task_type: TaskType) -> BudgetDecision {
        let inner = self.inner.lock();
        self.decide(&inner, estimated, task_type)
    }

    /// Atomically checks the budget and, when allowed, reserves the estimate
    /// against the running totals until [`BudgetGuard::settle`] or
    /// [`BudgetGuard::release`] is called.
    pub fn reserve(&self, estimated: f64, task_type: TaskType) -> BudgetDecision {
        let mut inner = self.inner.lock();
        let decision = self.decide(&inner, estimated, task_type);
        if decision.is_allowed() {
            inner.reserved_daily += estimated;
            inner.reserved_monthly += estimated;
        } else if let BudgetDecision::Denied { reason } = &decision {
            warn!(task_type = %task_type, estimated, reason = %reason, "Budget denied");
        }
        decision
    }

    fn decide(&self, inner: &UsageInner, estimated: f64, task_type: TaskType) -> BudgetDecision {
        if estimated > self.budget.per_request_limit {
            return BudgetDecision::Denied {
                reason: format!(
                    "estimated cost ${estimated:.4} for {task_type} exceeds per-request limit ${:.4}",
                    self.budget.per_request_limit
                ),
            };
        }
        if inner.usage.daily + inner.reserved_daily + estimated > self.budget.daily_limit {
            return BudgetDecision::Denied {
                reason: format!(
                    "estimated cost ${estimated:.4} would exceed daily limit ${:.4} (used ${:.4})",
                    self.budget.daily_limit, inner.usage.daily
                ),
            };
        }
        if inner.usage.monthly + inner.reserved_monthly + estimated > self.budget.monthly_limit {
            return BudgetDecision::Denied {
                reason: format!(
                    "estimated cost ${estimated:.4} would exceed monthly limit ${:.4} (used ${:.4})",
                    self.budget.monthly_limit, inner.usage.monthly
                ),
            };
        }
        BudgetDecision::Allowed
    }

    /// Replaces a reservation with the actual cost and evaluates alert
    /// thresholds.
    pub fn settle(&self, estimated: f64, actual: f64, task_type: TaskType) -> Vec<BudgetAlert> {
        {
            let mut inner = self.inner.lock();
            inner.reserved_daily = (inner.reserved_daily - estimated).max(0.0);
            inner.reserved_monthly = (inner.reserved_monthly - estimated).max(0.0);
        }
        self.record_cost(actual, task_type)
    }

    /// Drops a reservation without recording cost (the call never happened
    /// or failed before being billed).
    pub fn release(&self, estimated: f64) {
        let mut inner = self.inner.lock();
        inner.reserved_daily = (inner.reserved_daily - estimated).max(0.0);
        inner.reserved_monthly = (inner.reserved_monthly - estimated).max(0.0);
    }

    /// Adds actual spend to the running totals and returns any threshold
    /// warnings. Warnings are advisory and never block.
    pub fn record_cost(&self, actual: f64, task_type: TaskType) -> Vec<BudgetAlert> {
        let mut inner = self.inner.lock();
        inner.usage.daily += actual;
        inner.usage.monthly += actual;
        *inner.usage.by_task.entry(task_type).or_insert(0.0) += actual;

        let mut alerts = Vec::new();
        for (scope, used, limit) in [
            ("daily", inner.usage.daily, self.budget.daily_limit),
            ("monthly", inner.usage.monthly, self.budget.monthly_limit),
        ] {
            if limit <= 0.0 {
                continue;
            }
            let pct = used / limit * 100.0;
            if pct >= self.budget.alert_threshold_pct {
                let alert = BudgetAlert {
                    scope: scope.to_string(),
                    pct_used: pct,
                    message: format!("{scope} spend at {pct:.1}% of ${limit:.2} limit"),
                };
                warn!(scope, pct_used = pct, "Budget threshold crossed");
                alerts.push(alert);
            }
        }
        alerts
    }

    /// Zeroes today's totals. Called by an external scheduler at day roll.
    pub fn reset_daily_usage(&self) {
        let mut inner = self.inner.lock();
        inner.usage.daily = 0.0;
        info!("Daily budget usage reset");
    }

    /// Zeroes this month's totals and the per-task breakdown.
    pub fn reset_monthly_usage(&self) {
        let mut inner = self.inner.lock();
        inner.usage.monthly = 0.0;
        inner.usage.by_task.clear();
        info!("Monthly budget usage reset");
    }

    /// A copy of the current running totals.
    pub fn usage_snapshot(&self) -> CostUsage {
        self.inner.lock().usage.clone()
    }

    /// Among catalog models of the task type meeting the quality floor,
    /// suggests the cheapest. Returns `None` when the current model is
    /// already the cheapest eligible choice.
    pub fn recommend_optimized_model(
        &self,
        task_type: TaskType,
        quality_floor: QualityTier,
        current_model_id: &str,
    ) -> Option<ModelRecommendation> {
        let current = self.catalog.get(current_model_id)?;
        let best = self
            .catalog
            .of_type(task_type)
            .into_iter()
            .filter(|m| m.availability.rank() > 1 && m.quality >= quality_floor)
            .min_by(|a, b| {
                a.unit_cost
                    .partial_cmp(&b.unit_cost)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })?;

        if best.id == current.id || best.unit_cost >= current.unit_cost {
            return None;
        }

        let savings_pct = (current.unit_cost - best.unit_cost) / current.unit_cost * 100.0;
        let distance = current.quality.rank().saturating_sub(best.quality.rank());
        let quality_impact = match distance {
            0 => QualityImpact::None,
            1 if best.quality >= QualityTier::Standard => QualityImpact::Minimal,
            1 => QualityImpact::Moderate,
            _ => QualityImpact::Significant,
        };

        Some(ModelRecommendation {
            model_id: best.id.clone(),
            savings_pct,
            quality_impact,
        })
    }
}
