//! The shared capability registry.

use crate::plugin::{CapabilityDescriptor, Plugin};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tessera_core::workflow::WorkflowDefinition;
use tessera_core::{AgentAdapter, EngineEvent, EventBus, TesseraError, TesseraResult};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Registration status of a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    /// Capabilities are reachable.
    Enabled,
    /// Registered but capabilities are hidden.
    Disabled,
    /// The plugin reported a fault.
    Error,
}

/// Per-plugin registration record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    /// Plugin name (registry key).
    pub name: String,
    /// Plugin version.
    pub version: String,
    /// Current status.
    pub status: PluginStatus,
    /// Declared plugin dependencies.
    pub dependencies: Vec<String>,
    /// When the plugin was registered.
    pub registered_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    plugins: HashMap<String, Arc<dyn Plugin>>,
    entries: HashMap<String, RegistryEntry>,
    /// capability type -> owning plugin name
    agent_index: HashMap<String, String>,
    /// workflow id -> owning plugin name
    workflow_index: HashMap<String, String>,
}

/// Shared catalog of registered plugins and their capability factories.
///
/// All mutation goes through one writer lock so concurrent register and
/// unregister calls are serialized. Agent instances already handed out are
/// never revoked by a later disable.
pub struct CapabilityRegistry {
    inner: RwLock<Inner>,
    events: EventBus,
}

impl CapabilityRegistry {
    /// Creates an empty registry publishing lifecycle events on `events`.
    pub fn new(events: EventBus) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            events,
        }
    }

    /// Registers a plugin.
    ///
    /// Fails with [`TesseraError::DependencyMissing`] if any declared
    /// dependency is not already registered and with
    /// [`TesseraError::AlreadyRegistered`] on a duplicate name. The
    /// plugin's `initialize` hook runs before it becomes visible; an
    /// initialize failure leaves the registry unchanged.
    pub async fn register(&self, plugin: Arc<dyn Plugin>) -> TesseraResult<()> {
        let manifest = plugin.manifest().clone();
        let mut inner = self.inner.write().await;

        if inner.entries.contains_key(&manifest.name) {
            return Err(TesseraError::AlreadyRegistered(manifest.name));
        }
        for dep in &manifest.dependencies {
            if !inner.entries.contains_key(dep) {
                return Err(TesseraError::DependencyMissing {
                    plugin: manifest.name,
                    dependency: dep.clone(),
                });
            }
        }

        plugin.initialize().await?;

        for descriptor in plugin.agents() {
            if let Some(owner) = inner.agent_index.get(&descriptor.capability) {
                warn!(
                    capability = %descriptor.capability,
                    owner = %owner,
                    plugin = %manifest.name,
                    "Capability type already provided, keeping existing owner"
                );
                continue;
            }
            inner
                .agent_index
                .insert(descriptor.capability, manifest.name.clone());
        }
        for workflow in plugin.workflows() {
            if let Some(owner) = inner.workflow_index.get(&workflow.id) {
                warn!(
                    workflow = %workflow.id,
                    owner = %owner,
                    plugin = %manifest.name,
                    "Workflow id already provided, keeping existing owner"
                );
                continue;
            }
            inner
                .workflow_index
                .insert(workflow.id, manifest.name.clone());
        }

        inner.entries.insert(
            manifest.name.clone(),
            RegistryEntry {
                name: manifest.name.clone(),
                version: manifest.version.clone(),
                status: PluginStatus::Enabled,
                dependencies: manifest.dependencies.clone(),
                registered_at: Utc::now(),
            },
        );
        inner.plugins.insert(manifest.name.clone(), plugin);

        info!(plugin = %manifest.name, version = %manifest.version, "Registered plugin");
        self.events.emit(EngineEvent::PluginRegistered {
            name: manifest.name,
            version: manifest.version,
        });
        Ok(())
    }

    /// Unregisters a plugin: disables it, runs its `destroy` hook, removes
    /// its factories, then deletes the entry.
    pub async fn unregister(&self, name: &str) -> TesseraResult<()> {
        let plugin = {
            let mut inner = self.inner.write().await;
            let entry = inner
                .entries
                .get_mut(name)
                .ok_or_else(|| TesseraError::NotRegistered(name.to_string()))?;
            entry.status = PluginStatus::Disabled;
            inner
                .plugins
                .get(name)
                .cloned()
                .ok_or_else(|| TesseraError::NotRegistered(name.to_string()))?
        };

        // Destroy hook runs outside the lock; a failing hook still unregisters.
        if let Err(e) = plugin.destroy().await {
            warn!(plugin = %name, error = %e, "Plugin destroy hook failed");
        }

        let mut inner = self.inner.write().await;
        inner.agent_index.retain(|_, owner| owner != name);
        inner.workflow_index.retain(|_, owner| owner != name);
        inner.plugins.remove(name);
        inner.entries.remove(name);

        info!(plugin = %name, "Unregistered plugin");
        self.events.emit(EngineEvent::PluginUnregistered {
            name: name.to_string(),
        });
        Ok(())
    }

    /// Enables a plugin. Idempotent.
    pub async fn enable(&self, name: &str) -> TesseraResult<()> {
        self.set_status(name, PluginStatus::Enabled).await
    }

    /// Disables a plugin. Idempotent; in-flight executions keep the agent
    /// instances they already hold.
    pub async fn disable(&self, name: &str) -> TesseraResult<()> {
        self.set_status(name, PluginStatus::Disabled).await
    }

    async fn set_status(&self, name: &str, status: PluginStatus) -> TesseraResult<()> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .entries
            .get_mut(name)
            .ok_or_else(|| TesseraError::NotRegistered(name.to_string()))?;
        entry.status = status;
        Ok(())
    }

    /// Constructs an agent instance for a capability type.
    ///
    /// Only enabled plugins are consulted. Unknown types fail with
    /// [`TesseraError::UnknownCapability`] listing the known types; a
    /// factory failure is wrapped as
    /// [`TesseraError::CapabilityCreationFailed`].
    pub async fn create_agent(
        &self,
        agent_type: &str,
        config: &HashMap<String, Value>,
    ) -> TesseraResult<Arc<dyn AgentAdapter>> {
        let plugin = {
            let inner = self.inner.read().await;
            let owner = inner
                .agent_index
                .get(agent_type)
                .filter(|owner| inner.is_enabled(owner))
                .ok_or_else(|| TesseraError::UnknownCapability {
                    requested: agent_type.to_string(),
                    known: inner.enabled_capabilities(),
                })?;
            inner
                .plugins
                .get(owner)
                .cloned()
                .ok_or_else(|| TesseraError::NotRegistered(owner.clone()))?
        };

        plugin
            .create_agent(agent_type, config)
            .map_err(|e| TesseraError::CapabilityCreationFailed {
                capability: agent_type.to_string(),
                message: e.to_string(),
            })
    }

    /// Returns a workflow definition by id from an enabled plugin.
    pub async fn create_workflow(&self, workflow_id: &str) -> TesseraResult<WorkflowDefinition> {
        let inner = self.inner.read().await;
        let owner = inner
            .workflow_index
            .get(workflow_id)
            .filter(|owner| inner.is_enabled(owner))
            .ok_or_else(|| TesseraError::UnknownCapability {
                requested: workflow_id.to_string(),
                known: inner.enabled_workflows(),
            })?;
        let plugin = inner
            .plugins
            .get(owner)
            .ok_or_else(|| TesseraError::NotRegistered(owner.clone()))?;
        plugin
            .workflows()
            .into_iter()
            .find(|w| w.id == workflow_id)
            .ok_or_else(|| TesseraError::UnknownCapability {
                requested: workflow_id.to_string(),
                known: inner.enabled_workflows(),
            })
    }

    /// Capability descriptors from enabled plugins only.
    pub async fn list_agents(&self) -> Vec<CapabilityDescriptor> {
        let inner = self.inner.read().await;
        let mut descriptors: Vec<CapabilityDescriptor> = inner
            .plugins
            .iter()
            .filter(|(name, _)| inner.is_enabled(name))
            .flat_map(|(_, p)| p.agents())
            .collect();
        descriptors.sort_by(|a, b| a.capability.cmp(&b.capability));
        descriptors
    }

    /// Workflow definitions from enabled plugins only.
    pub async fn list_workflows(&self) -> Vec<WorkflowDefinition> {
        let inner = self.inner.read().await;
        let mut workflows: Vec<WorkflowDefinition> = inner
            .plugins
            .iter()
            .filter(|(name, _)| inner.is_enabled(name))
            .flat_map(|(_, p)| p.workflows())
            .collect();
        workflows.sort_by(|a, b| a.id.cmp(&b.id));
        workflows
    }

    /// Returns the registration record for a plugin.
    pub async fn entry(&self, name: &str) -> Option<RegistryEntry> {
        self.inner.read().await.entries.get(name).cloned()
    }

    /// Whether a plugin exists and is enabled.
    pub async fn is_enabled(&self, name: &str) -> bool {
        self.inner.read().await.is_enabled(name)
    }

    /// Number of registered plugins, regardless of status.
    pub async fn plugin_count(&self) -> usize {
        self.inner.read().await.entries.len()
    }
}

impl Inner {
    fn is_enabled(&self, name: &str) -> bool {
        self.entries
            .get(name)
            .is_some_and(|e| e.status == PluginStatus::Enabled)
    }

    fn enabled_capabilities(&self) -> Vec<String> {
        let mut known: Vec<String> = self
            .agent_index
            .iter()
            .filter(|(_, owner)| self.is_enabled(owner))
            .map(|(cap, _)| cap.clone())
            .collect();
        known.sort();
        known
    }

    fn enabled_workflows(&self) -> Vec<String> {
        let mut known: Vec<String> = self
            .workflow_index
            .iter()
            .filter(|(_, owner)| self.is_enabled(owner))
            .map(|(id, _)| id.clone())
            .collect();
        known.sort();
        known
    }
}
