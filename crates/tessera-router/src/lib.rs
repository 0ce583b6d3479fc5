//! Cost-aware model routing and budget enforcement for the Tessera engine.
//!
//! The router ranks backend models from an immutable catalog by cost,
//! quality, or speed; the budget guard gates every paid call against
//! configured daily, monthly, and per-request ceilings.
//!
//! # Main types
//!
//! - [`ModelCatalog`] — Declaration-ordered, immutable model catalog.
//! - [`ModelRouter`] — Priority-based model selection and cost estimation.
//! - [`BudgetGuard`] — Serialized check-then-commit spend tracking.

/// Budget configuration, usage tracking, and the budget guard.
pub mod budget;
/// The immutable model catalog and its entry types.
pub mod catalog;
/// Model selection, fallback chains, and cost estimation.
pub mod router;

pub use budget::{
    BudgetAlert, BudgetDecision, BudgetGuard, CostBudget, CostUsage, ModelRecommendation,
    QualityImpact,
};
pub use catalog::{Availability, LatencyTier, ModelCatalog, ModelConfig, QualityTier, TaskType};
pub use router::{ModelRouter, RoutePriority, UsageEstimate, BASELINE_PIXELS};
