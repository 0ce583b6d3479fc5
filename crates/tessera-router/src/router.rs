//! Model selection, fallback chains, and cost estimation.

use crate::catalog::{ModelCatalog, ModelConfig, TaskType};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tessera_core::{TesseraError, TesseraResult};
use tracing::debug;

/// Baseline pixel count (1024×1024) that image model costs are quoted at.
pub const BASELINE_PIXELS: u64 = 1024 * 1024;

/// What to optimize for when selecting a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutePriority {
    /// Cheapest eligible model.
    Cost,
    /// Highest quality and availability.
    Quality,
    /// Lowest latency and highest availability.
    Speed,
}

/// Units consumed by one provider call, used for cost estimation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum UsageEstimate {
    /// A text generation call.
    Text {
        /// Prompt tokens.
        input_tokens: u64,
        /// Completion tokens.
        output_tokens: u64,
    },
    /// An image generation call.
    Image {
        /// Number of images.
        count: u32,
        /// Pixels per image.
        pixels: u64,
    },
    /// An embedding call.
    Embedding {
        /// Tokens embedded.
        tokens: u64,
    },
}

impl UsageEstimate {
    /// The task type this usage corresponds to.
    pub fn task_type(&self) -> TaskType {
        match self {
            UsageEstimate::Text { .. } => TaskType::Text,
            UsageEstimate::Image { .. } => TaskType::Image,
            UsageEstimate::Embedding { .. } => TaskType::Embedding,
        }
    }
}

/// Ranks and selects backend models from an immutable catalog.
#[derive(Debug, Clone)]
pub struct ModelRouter {
    catalog: ModelCatalog,
}

impl ModelRouter {
    /// Creates a router over the given catalog.
    pub fn new(catalog: ModelCatalog) -> Self {
        Self { catalog }
    }

    /// The catalog this router selects from.
    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    /// Selects the best model for a task type under the given priority.
    ///
    /// Models with low availability are never selected. Ties keep catalog
    /// declaration order.
    pub fn select_model(
        &self,
        task_type: TaskType,
        priority: RoutePriority,
    ) -> TesseraResult<&ModelConfig> {
        self.ranked(task_type, priority)
            .into_iter()
            .next()
            .ok_or_else(|| {
                TesseraError::Routing(format!("no eligible {task_type} model in catalog"))
            })
    }

    /// Full ranked list of eligible models, for retry-on-failure
    /// substitution down the chain.
    pub fn fallback_chain(&self, task_type: TaskType, priority: RoutePriority) -> Vec<ModelConfig> {
        self.ranked(task_type, priority)
            .into_iter()
            .cloned()
            .collect()
    }

    fn ranked(&self, task_type: TaskType, priority: RoutePriority) -> Vec<&ModelConfig> {
        let mut candidates: Vec<&ModelConfig> = self
            .catalog
            .of_type(task_type)
            .into_iter()
            .filter(|m| m.availability.rank() > 1)
            .collect();

        // Stable sorts so catalog declaration order breaks ties.
        match priority {
            RoutePriority::Cost => candidates.sort_by(|a, b| {
                a.unit_cost
                    .partial_cmp(&b.unit_cost)
                    .unwrap_or(Ordering::Equal)
            }),
            RoutePriority::Quality => candidates.sort_by(|a, b| {
                let score = |m: &ModelConfig| m.quality.rank() + m.availability.rank();
                score(b).cmp(&score(a))
            }),
            RoutePriority::Speed => candidates.sort_by(|a, b| {
                let score = |m: &ModelConfig| (4 - m.latency.rank()) + m.availability.rank();
                score(b).cmp(&score(a))
            }),
        }

        debug!(
            task_type = %task_type,
            ?priority,
            candidates = candidates.len(),
            "Ranked models"
        );
        candidates
    }

    /// Estimates the USD cost of one call against the given model.
    ///
    /// Fails if the usage kind does not match the model's task type.
    pub fn estimate_cost(&self, model: &ModelConfig, usage: UsageEstimate) -> TesseraResult<f64> {
        if usage.task_type() != model.task_type {
            return Err(TesseraError::Routing(format!(
                "usage kind {} does not match model '{}' ({})",
                usage.task_type(),
                model.id,
                model.task_type
            )));
        }
        let cost = match usage {
            UsageEstimate::Text {
                input_tokens,
                output_tokens,
            } => (input_tokens + output_tokens) as f64 / 1000.0 * model.unit_cost,
            UsageEstimate::Image { count, pixels } => {
                model.unit_cost * (pixels as f64 / BASELINE_PIXELS as f64) * f64::from(count)
            }
            UsageEstimate::Embedding { tokens } => tokens as f64 / 1000.0 * model.unit_cost,
        };
        Ok(cost)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::catalog::{Availability, LatencyTier, QualityTier};

    fn model(
        id: &str,
        task_type: TaskType,
        unit_cost: f64,
        quality: QualityTier,
        latency: LatencyTier,
        availability: Availability,
    ) -> ModelConfig {
        ModelConfig {
            id: id.to_string(),
            task_type,
            unit_cost,
            quality,
            latency,
            availability,
        }
    }

    fn router() -> ModelRouter {
        ModelRouter::new(ModelCatalog::new(vec![
            model(
                "A",
                TaskType::Text,
                0.01,
                QualityTier::Premium,
                LatencyTier::High,
                Availability::High,
            ),
            model(
                "B",
                TaskType::Text,
                0.005,
                QualityTier::Standard,
                LatencyTier::Low,
                Availability::High,
            ),
            model(
                "C",
                TaskType::Text,
                0.001,
                QualityTier::Basic,
                LatencyTier::Low,
                Availability::Low,
            ),
            model(
                "D",
                TaskType::Image,
                0.04,
                QualityTier::Standard,
                LatencyTier::Medium,
                Availability::High,
            ),
        ]))
    }

    #[test]
    fn cheapest_first_for_cost_priority() {
        let r = router();
        let selected = r.select_model(TaskType::Text, RoutePriority::Cost).unwrap();
        // C is cheaper but has low availability, so B wins.
        assert_eq!(selected.id, "B");
    }

    #[test]
    fn quality_priority_prefers_premium() {
        let r = router();
        let selected = r
            .select_model(TaskType::Text, RoutePriority::Quality)
            .unwrap();
        assert_eq!(selected.id, "A");
    }

    #[test]
    fn speed_priority_prefers_low_latency() {
        let r = router();
        let selected = r
            .select_model(TaskType::Text, RoutePriority::Speed)
            .unwrap();
        assert_eq!(selected.id, "B");
    }

    #[test]
    fn ties_keep_declaration_order() {
        let r = ModelRouter::new(ModelCatalog::new(vec![
            model(
                "first",
                TaskType::Text,
                0.002,
                QualityTier::Standard,
                LatencyTier::Low,
                Availability::High,
            ),
            model(
                "second",
                TaskType::Text,
                0.002,
                QualityTier::Standard,
                LatencyTier::Low,
                Availability::High,
            ),
        ]));
        assert_eq!(
            r.select_model(TaskType::Text, RoutePriority::Cost).unwrap().id,
            "first"
        );
        assert_eq!(
            r.select_model(TaskType::Text, RoutePriority::Quality)
                .unwrap()
                .id,
            "first"
        );
    }

    #[test]
    fn fallback_chain_is_fully_ranked() {
        let r = router();
        let chain = r.fallback_chain(TaskType::Text, RoutePriority::Cost);
        let ids: Vec<&str> = chain.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["B", "A"]); // C excluded for low availability
    }

    #[test]
    fn no_eligible_model_is_an_error() {
        let r = ModelRouter::new(ModelCatalog::new(vec![]));
        assert!(r.select_model(TaskType::Embedding, RoutePriority::Cost).is_err());
    }

    #[test]
    fn text_cost_is_per_thousand_tokens() {
        let r = router();
        let m = r.catalog().get("B").unwrap();
        let cost = r
            .estimate_cost(
                m,
                UsageEstimate::Text {
                    input_tokens: 1500,
                    output_tokens: 500,
                },
            )
            .unwrap();
        assert!((cost - 0.01).abs() < 1e-9); // 2000/1000 * 0.005
    }

    #[test]
    fn image_cost_scales_with_resolution() {
        let r = router();
        let m = r.catalog().get("D").unwrap();
        let cost = r
            .estimate_cost(
                m,
                UsageEstimate::Image {
                    count: 2,
                    pixels: BASELINE_PIXELS * 2,
                },
            )
            .unwrap();
        assert!((cost - 0.16).abs() < 1e-9); // 0.04 * 2.0 * 2
    }

    #[test]
    fn mismatched_usage_kind_rejected() {
        let r = router();
        let m = r.catalog().get("D").unwrap();
        assert!(r
            .estimate_cost(
                m,
                UsageEstimate::Text {
                    input_tokens: 10,
                    output_tokens: 10
                }
            )
            .is_err());
    }
}
