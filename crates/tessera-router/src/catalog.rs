//! The immutable model catalog.

use serde::{Deserialize, Serialize};
use tessera_core::{TesseraError, TesseraResult};

/// The kind of generation work a model performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    /// Text generation.
    Text,
    /// Image generation.
    Image,
    /// Embedding generation.
    Embedding,
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskType::Text => write!(f, "text"),
            TaskType::Image => write!(f, "image"),
            TaskType::Embedding => write!(f, "embedding"),
        }
    }
}

/// Output quality class of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    /// Cheapest, lowest fidelity.
    Basic,
    /// Balanced default.
    Standard,
    /// Highest fidelity.
    Premium,
}

impl QualityTier {
    /// Numeric rank, higher is better.
    pub fn rank(self) -> u8 {
        match self {
            QualityTier::Basic => 1,
            QualityTier::Standard => 2,
            QualityTier::Premium => 3,
        }
    }
}

/// Typical response latency class of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LatencyTier {
    /// Fast responses.
    Low,
    /// Moderate responses.
    Medium,
    /// Slow responses.
    High,
}

impl LatencyTier {
    /// Numeric rank, higher means slower.
    pub fn rank(self) -> u8 {
        match self {
            LatencyTier::Low => 1,
            LatencyTier::Medium => 2,
            LatencyTier::High => 3,
        }
    }
}

/// How reliably a model is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    /// Reliably available.
    High,
    /// Occasionally degraded.
    Medium,
    /// Routinely degraded; excluded from routing.
    Low,
}

impl Availability {
    /// Numeric rank, higher is better.
    pub fn rank(self) -> u8 {
        match self {
            Availability::High => 3,
            Availability::Medium => 2,
            Availability::Low => 1,
        }
    }
}

/// An immutable catalog entry describing one backend model.
///
/// `unit_cost` is USD per 1K tokens for text and embedding models, and USD
/// per image at baseline resolution for image models.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model id passed to provider adapters.
    pub id: String,
    /// The task type this model serves.
    pub task_type: TaskType,
    /// Per-unit cost in USD (see type-level docs).
    pub unit_cost: f64,
    /// Output quality class.
    pub quality: QualityTier,
    /// Latency class.
    pub latency: LatencyTier,
    /// Availability class.
    pub availability: Availability,
}

/// Declaration-ordered model catalog, loaded once at process start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCatalog {
    /// Catalog entries in declaration order.
    pub models: Vec<ModelConfig>,
}

impl ModelCatalog {
    /// Creates a catalog from an ordered list of entries.
    pub fn new(models: Vec<ModelConfig>) -> Self {
        Self { models }
    }

    /// Parses a catalog from a TOML document with a `[[models]]` array.
    pub fn from_toml_str(input: &str) -> TesseraResult<Self> {
        toml::from_str(input).map_err(|e| TesseraError::Config(format!("invalid catalog: {e}")))
    }

    /// Looks up a model by id.
    pub fn get(&self, id: &str) -> Option<&ModelConfig> {
        self.models.iter().find(|m| m.id == id)
    }

    /// Models of the given task type, in declaration order.
    pub fn of_type(&self, task_type: TaskType) -> Vec<&ModelConfig> {
        self.models
            .iter()
            .filter(|m| m.task_type == task_type)
            .collect()
    }
}

impl Default for ModelCatalog {
    /// A small built-in catalog covering all three task types.
    fn default() -> Self {
        let m = |id: &str, task_type, unit_cost, quality, latency, availability| ModelConfig {
            id: id.to_string(),
            task_type,
            unit_cost,
            quality,
            latency,
            availability,
        };
        Self::new(vec![
            m(
                "text-basic",
                TaskType::Text,
                0.0005,
                QualityTier::Basic,
                LatencyTier::Low,
                Availability::High,
            ),
            m(
                "text-standard",
                TaskType::Text,
                0.003,
                QualityTier::Standard,
                LatencyTier::Medium,
                Availability::High,
            ),
            m(
                "text-premium",
                TaskType::Text,
                0.015,
                QualityTier::Premium,
                LatencyTier::High,
                Availability::Medium,
            ),
            m(
                "image-standard",
                TaskType::Image,
                0.04,
                QualityTier::Standard,
                LatencyTier::Medium,
                Availability::High,
            ),
            m(
                "image-premium",
                TaskType::Image,
                0.12,
                QualityTier::Premium,
                LatencyTier::High,
                Availability::Medium,
            ),
            m(
                "embed-small",
                TaskType::Embedding,
                0.0001,
                QualityTier::Standard,
                LatencyTier::Low,
                Availability::High,
            ),
        ])
    }
}
