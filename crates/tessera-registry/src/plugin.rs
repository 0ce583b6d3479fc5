//! Plugin trait, manifest, and capability descriptors.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tessera_core::workflow::WorkflowDefinition;
use tessera_core::{AgentAdapter, TesseraError, TesseraResult};

/// Metadata describing a plugin's identity and its declared dependencies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Unique plugin name (registry key).
    pub name: String,
    /// Plugin version.
    pub version: String,
    /// What this plugin provides.
    pub description: String,
    /// Names of plugins that must be registered before this one.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// Metadata describing one agent capability a plugin provides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    /// Capability type string, e.g. `"text-generator"`.
    pub capability: String,
    /// What the capability does.
    pub description: String,
    /// JSON schema of the expected node input.
    #[serde(default)]
    pub input_schema: Value,
}

/// Trait that all capability plugins must implement.
///
/// Lifecycle hooks (`initialize`, `destroy`) have default no-op
/// implementations so plugins only override what they need. A plugin may
/// provide agent capabilities, workflow templates, or both.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Returns the plugin's manifest.
    fn manifest(&self) -> &PluginManifest;

    /// Called once during registration, before the plugin becomes visible.
    async fn initialize(&self) -> TesseraResult<()> {
        Ok(())
    }

    /// Called during unregistration, after the plugin is disabled.
    async fn destroy(&self) -> TesseraResult<()> {
        Ok(())
    }

    /// Agent capabilities this plugin provides.
    fn agents(&self) -> Vec<CapabilityDescriptor> {
        Vec::new()
    }

    /// Reusable workflow definitions this plugin provides.
    fn workflows(&self) -> Vec<WorkflowDefinition> {
        Vec::new()
    }

    /// Constructs an agent instance for one of this plugin's capability
    /// types. Instances are handed out by reference and remain valid even
    /// if the plugin is later disabled.
    fn create_agent(
        &self,
        agent_type: &str,
        _config: &HashMap<String, Value>,
    ) -> TesseraResult<Arc<dyn AgentAdapter>> {
        Err(TesseraError::UnknownCapability {
            requested: agent_type.to_string(),
            known: self.agents().into_iter().map(|d| d.capability).collect(),
        })
    }
}
