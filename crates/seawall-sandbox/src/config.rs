//! Plugin configuration.
//!
//! [`PluginConfig`] is supplied by the gateway's control plane and versioned
//! by the content hash of its source bytecode.  The pool never caches it: the
//! current value is re-read through a [`PluginConfigSource`] on every
//! admission action, so external updates are observed within one admission
//! cycle.  [`ConfigStore`] is a `DashMap`-backed in-memory source for
//! embedding and tests.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use ring::digest;
use serde::{Deserialize, Serialize};

/// A host function family that may be exposed into a plugin instance.
///
/// Only the capabilities listed in [`PluginConfig::host_capabilities`] are
/// linked into an instance; a module importing anything else fails at
/// instantiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostCapability {
    /// `host_log(level, ptr, len)` -- emit a tracing event from the guest.
    Log,
    /// `host_read_input` / `host_read_attribute` -- read the per-call input
    /// bytes and request attributes.
    ReadInput,
    /// `host_write_result(ptr, len)` -- write the call's result payload.
    WriteResult,
    /// `host_check_host(ptr, len)` -- query the outbound host allow-list.
    CheckHost,
    /// `host_check_path(ptr, len)` -- query the filesystem path allow-list.
    CheckPath,
}

/// Resource limits applied to every instance of a plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryLimits {
    /// Maximum linear memory an instance may allocate, in bytes.
    ///
    /// Default: **16 MiB**.
    pub max_memory_bytes: usize,

    /// Maximum fuel (abstract instruction count) per call.
    ///
    /// Default: **1 000 000**.
    pub max_fuel: u64,
}

impl Default for MemoryLimits {
    fn default() -> Self {
        Self {
            max_memory_bytes: 16 * 1024 * 1024,
            max_fuel: 1_000_000,
        }
    }
}

/// Configuration for one plugin, as supplied by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Unique plugin identifier (the pool registry key).
    pub plugin_id: String,
    /// Raw module bytecode. Its SHA-256 hash versions the whole config.
    pub source_bytes: Vec<u8>,
    /// Upper bound on live instances (available + in-use) for this plugin.
    pub instance_count: usize,
    /// Calls permitted on one instance before mandatory retirement.
    pub call_budget: u32,
    /// Host function families exposed into instances.
    pub host_capabilities: Vec<HostCapability>,
    /// Memory and fuel limits per instance.
    pub memory_limits: MemoryLimits,
    /// Outbound hosts the guest may be told are reachable.
    pub allowed_hosts: Vec<String>,
    /// Filesystem path prefixes the guest may be told are readable.
    pub allowed_paths: Vec<String>,
}

impl PluginConfig {
    /// Create a configuration with default limits and capabilities.
    pub fn new(plugin_id: impl Into<String>, source_bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            source_bytes: source_bytes.into(),
            instance_count: 1,
            call_budget: 1000,
            host_capabilities: vec![
                HostCapability::Log,
                HostCapability::ReadInput,
                HostCapability::WriteResult,
            ],
            memory_limits: MemoryLimits::default(),
            allowed_hosts: Vec::new(),
            allowed_paths: Vec::new(),
        }
    }

    /// Set the instance cap.
    pub fn with_instance_count(mut self, count: usize) -> Self {
        self.instance_count = count;
        self
    }

    /// Set the per-instance call budget.
    pub fn with_call_budget(mut self, budget: u32) -> Self {
        self.call_budget = budget;
        self
    }

    /// Replace the exposed capability set.
    pub fn with_capabilities(mut self, caps: Vec<HostCapability>) -> Self {
        self.host_capabilities = caps;
        self
    }

    /// Set the memory/fuel limits.
    pub fn with_memory_limits(mut self, limits: MemoryLimits) -> Self {
        self.memory_limits = limits;
        self
    }

    /// Set the outbound host allow-list.
    pub fn with_allowed_hosts(mut self, hosts: Vec<String>) -> Self {
        self.allowed_hosts = hosts;
        self
    }

    /// Set the filesystem path allow-list.
    pub fn with_allowed_paths(mut self, paths: Vec<String>) -> Self {
        self.allowed_paths = paths;
        self
    }

    /// Content hash of the source bytecode, hex-encoded SHA-256.
    pub fn content_hash(&self) -> String {
        content_hash(&self.source_bytes)
    }
}

/// Hex-encoded SHA-256 of `bytes`.
pub fn content_hash(bytes: &[u8]) -> String {
    let hash = digest::digest(&digest::SHA256, bytes);
    hash.as_ref().iter().map(|b| format!("{b:02x}")).collect()
}

/// Source of truth for plugin configuration.
///
/// Implemented by the gateway's control plane.  The pool calls this on every
/// admission action, so implementations should be cheap (an in-memory
/// snapshot, not a network round trip).
#[async_trait]
pub trait PluginConfigSource: Send + Sync + 'static {
    /// Return the current configuration for `plugin_id`, or `None` if the
    /// plugin has been removed.
    async fn config_for(&self, plugin_id: &str) -> Option<Arc<PluginConfig>>;
}

/// In-memory [`PluginConfigSource`] backed by a [`DashMap`].
#[derive(Default)]
pub struct ConfigStore {
    configs: DashMap<String, Arc<PluginConfig>>,
}

impl ConfigStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a plugin's configuration.
    pub fn insert(&self, config: PluginConfig) {
        tracing::debug!(plugin = %config.plugin_id, hash = %config.content_hash(), "plugin config updated");
        self.configs
            .insert(config.plugin_id.clone(), Arc::new(config));
    }

    /// Remove a plugin's configuration. Returns `true` if it existed.
    pub fn remove(&self, plugin_id: &str) -> bool {
        self.configs.remove(plugin_id).is_some()
    }

    /// Number of configured plugins.
    pub fn len(&self) -> usize {
        self.configs.len()
    }

    /// Returns `true` if no plugins are configured.
    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}

#[async_trait]
impl PluginConfigSource for ConfigStore {
    async fn config_for(&self, plugin_id: &str) -> Option<Arc<PluginConfig>> {
        self.configs.get(plugin_id).map(|entry| Arc::clone(&entry))
    }
}
