//! Dynamic capability registry for the Tessera engine.
//!
//! Plugins bundle agent capabilities and reusable workflow definitions.
//! The registry validates plugin dependencies at registration time, tracks
//! enable/disable status, and hands out typed agent instances through each
//! plugin's factory.
//!
//! # Main types
//!
//! - [`Plugin`] — Trait implemented by installable capability providers.
//! - [`CapabilityRegistry`] — Shared catalog of registered plugins.
//! - [`RegistryEntry`] — Per-plugin registration record and status.

/// Plugin trait, manifest, and capability descriptors.
pub mod plugin;
/// The shared capability registry.
pub mod registry;

pub use plugin::{CapabilityDescriptor, Plugin, PluginManifest};
pub use registry::{CapabilityRegistry, PluginStatus, RegistryEntry};
