//! Process-wide pool registry.
//!
//! [`PoolRegistry`] caches one [`VmPool`] per plugin id, creating pools
//! lazily on first use and dropping them when the plugin's configuration
//! disappears (the pool actor removes its own entry on teardown).  The
//! registry also owns the shared wasmtime engine and the compiled-template
//! cache.

use std::sync::Arc;

use dashmap::DashMap;
use wasmtime::Engine;

use crate::config::PluginConfigSource;
use crate::error::{Result, SandboxError};
use crate::instance::build_engine;
use crate::lease::SlotLease;
use crate::pool::{InitOptions, VmPool};
use crate::slot::CorruptionPolicy;
use crate::template::TemplateCache;

/// Process-wide cache of per-plugin instance pools.
///
/// Cheaply cloneable; clones share the engine, the template cache, and the
/// pool map.
#[derive(Clone)]
pub struct PoolRegistry {
    engine: Engine,
    templates: Arc<TemplateCache>,
    source: Arc<dyn PluginConfigSource>,
    policy: CorruptionPolicy,
    pools: Arc<DashMap<String, VmPool>>,
}

impl PoolRegistry {
    /// Create a registry reading plugin configuration from `source`, with
    /// the default corruption policy.
    pub fn new(source: Arc<dyn PluginConfigSource>) -> Result<Self> {
        Self::with_policy(source, CorruptionPolicy::default())
    }

    /// Create a registry with an explicit [`CorruptionPolicy`] applied to
    /// every pool.
    pub fn with_policy(
        source: Arc<dyn PluginConfigSource>,
        policy: CorruptionPolicy,
    ) -> Result<Self> {
        let engine = build_engine()?;
        tracing::info!("pool registry initialized");
        Ok(Self {
            engine,
            templates: Arc::new(TemplateCache::new()),
            source,
            policy,
            pools: Arc::new(DashMap::new()),
        })
    }

    /// Return the pool for `plugin_id`, creating it lazily.
    ///
    /// Fails with [`SandboxError::ConfigMissing`] when the config source does
    /// not currently know the plugin, so registry entries only ever exist for
    /// configured plugins.
    pub async fn pool_for(&self, plugin_id: &str) -> Result<VmPool> {
        if let Some(pool) = self.pools.get(plugin_id) {
            return Ok(pool.clone());
        }

        if self.source.config_for(plugin_id).await.is_none() {
            return Err(SandboxError::ConfigMissing {
                plugin_id: plugin_id.to_owned(),
            });
        }

        let pool = self
            .pools
            .entry(plugin_id.to_owned())
            .or_insert_with(|| {
                tracing::info!(plugin = %plugin_id, "creating pool");
                VmPool::spawn(
                    plugin_id.to_owned(),
                    Arc::clone(&self.source),
                    self.engine.clone(),
                    Arc::clone(&self.templates),
                    self.policy.clone(),
                    Arc::clone(&self.pools),
                )
            })
            .clone();
        Ok(pool)
    }

    /// Acquire a slot for `plugin_id`, resolving the pool first.
    pub async fn acquire(&self, plugin_id: &str, options: InitOptions) -> Result<SlotLease> {
        self.pool_for(plugin_id).await?.acquire(options).await
    }

    /// Tear down and drop the pool for `plugin_id`, if present.
    pub fn remove(&self, plugin_id: &str) {
        if let Some((_, pool)) = self.pools.remove(plugin_id) {
            pool.shutdown();
        }
    }

    /// Number of live pools.
    pub fn len(&self) -> usize {
        self.pools.len()
    }

    /// Returns `true` if no pools are live.
    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// Tear down every pool.
    pub fn shutdown(&self) {
        for entry in self.pools.iter() {
            entry.value().shutdown();
        }
        self.pools.clear();
        tracing::info!("pool registry shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::{ConfigStore, PluginConfig};
    use crate::instance::CallContext;

    const CONSTANT_MODULE: &str = r#"
        (module
          (memory (export "memory") 1)
          (func (export "handle") (param i32) (result i32)
            i32.const 0))
    "#;

    fn registry_with(store: &Arc<ConfigStore>) -> PoolRegistry {
        PoolRegistry::new(Arc::clone(store) as Arc<dyn PluginConfigSource>).unwrap()
    }

    #[tokio::test]
    async fn pools_are_created_lazily_and_cached() {
        let store = Arc::new(ConfigStore::new());
        store.insert(PluginConfig::new("p1", CONSTANT_MODULE.as_bytes().to_vec()));
        let registry = registry_with(&store);

        assert!(registry.is_empty());
        let first = registry.pool_for("p1").await.unwrap();
        assert_eq!(registry.len(), 1);

        let second = registry.pool_for("p1").await.unwrap();
        assert_eq!(first.plugin_id(), second.plugin_id());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn unknown_plugin_is_config_missing() {
        let store = Arc::new(ConfigStore::new());
        let registry = registry_with(&store);

        let result = registry.pool_for("ghost").await;
        assert!(matches!(
            result,
            Err(SandboxError::ConfigMissing { plugin_id }) if plugin_id == "ghost"
        ));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn acquire_through_registry() {
        let store = Arc::new(ConfigStore::new());
        store.insert(PluginConfig::new("p1", CONSTANT_MODULE.as_bytes().to_vec()));
        let registry = registry_with(&store);

        let lease = registry.acquire("p1", InitOptions::none()).await.unwrap();
        let outcome = lease.call("handle", b"", CallContext::new()).await.unwrap();
        assert_eq!(outcome.code, 0);
        lease.release();
    }

    #[tokio::test]
    async fn pool_drops_out_when_config_disappears() {
        let store = Arc::new(ConfigStore::new());
        store.insert(PluginConfig::new("p1", CONSTANT_MODULE.as_bytes().to_vec()));
        let registry = registry_with(&store);

        let lease = registry.acquire("p1", InitOptions::none()).await.unwrap();
        lease.release();
        assert_eq!(registry.len(), 1);

        store.remove("p1");
        let result = registry.acquire("p1", InitOptions::none()).await;
        assert!(matches!(result, Err(SandboxError::ConfigMissing { .. })));

        // The pool removed its own entry during teardown.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn remove_shuts_the_pool_down() {
        let store = Arc::new(ConfigStore::new());
        store.insert(PluginConfig::new("p1", CONSTANT_MODULE.as_bytes().to_vec()));
        let registry = registry_with(&store);

        let pool = registry.pool_for("p1").await.unwrap();
        registry.remove("p1");
        assert!(registry.is_empty());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let result = pool.acquire(InitOptions::none()).await;
        assert!(matches!(result, Err(SandboxError::PoolClosed)));
    }

    #[tokio::test]
    async fn independent_plugins_get_independent_pools() {
        let store = Arc::new(ConfigStore::new());
        store.insert(PluginConfig::new("p1", CONSTANT_MODULE.as_bytes().to_vec()));
        store.insert(PluginConfig::new("p2", CONSTANT_MODULE.as_bytes().to_vec()));
        let registry = registry_with(&store);

        let a = registry.acquire("p1", InitOptions::none()).await.unwrap();
        let b = registry.acquire("p2", InitOptions::none()).await.unwrap();
        assert_eq!(registry.len(), 2);
        a.release();
        b.release();
    }
}
