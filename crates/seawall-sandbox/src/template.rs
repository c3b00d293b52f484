//! Compiled module templates.
//!
//! Compiling Wasm bytecode is the expensive step, so the pool compiles each
//! distinct module exactly once.  [`TemplateCache`] keys compiled
//! [`CompiledTemplate`]s by the content hash of their source bytes and hands
//! out shared references; every slot of a pool instantiates from the same
//! template until the plugin's hash changes.

use std::sync::Arc;

use dashmap::DashMap;
use wasmtime::{Engine, Module};

use crate::error::{Result, SandboxError};

/// An immutable, compiled module shared read-only across a pool's slots.
pub struct CompiledTemplate {
    hash: String,
    module: Module,
}

impl CompiledTemplate {
    /// Content hash of the source bytes this template was compiled from.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// The compiled wasmtime module.
    pub(crate) fn module(&self) -> &Module {
        &self.module
    }
}

/// Process-wide cache of compiled templates, keyed by content hash.
///
/// There is no eviction policy beyond [`TemplateCache::forget`], which pools
/// call when they hot-swap or tear down.
#[derive(Default)]
pub struct TemplateCache {
    templates: DashMap<String, Arc<CompiledTemplate>>,
}

impl TemplateCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached template for `hash`, compiling `source_bytes` on a
    /// miss.
    pub fn get_or_compile(
        &self,
        engine: &Engine,
        hash: &str,
        source_bytes: &[u8],
    ) -> Result<Arc<CompiledTemplate>> {
        if let Some(cached) = self.templates.get(hash) {
            tracing::debug!(hash = %hash, "template cache hit");
            return Ok(Arc::clone(&cached));
        }

        let module = Module::new(engine, source_bytes)
            .map_err(|e| SandboxError::Compilation(e.to_string()))?;

        tracing::info!(hash = %hash, bytes = source_bytes.len(), "compiled wasm template");

        let template = Arc::new(CompiledTemplate {
            hash: hash.to_owned(),
            module,
        });

        // Two pools may race to compile the same module; keep whichever entry
        // landed first so all callers share one template.
        Ok(Arc::clone(
            &self
                .templates
                .entry(hash.to_owned())
                .or_insert(template),
        ))
    }

    /// Drop the cached template for `hash`, if any.
    pub fn forget(&self, hash: &str) {
        if self.templates.remove(hash).is_some() {
            tracing::debug!(hash = %hash, "template forgotten");
        }
    }

    /// Number of cached templates.
    pub fn len(&self) -> usize {
        self.templates.len()
    }

    /// Returns `true` if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::content_hash;
    use crate::instance::build_engine;

    const EMPTY_MODULE: &[u8] = b"(module)";

    #[test]
    fn compile_and_cache() {
        let engine = build_engine().unwrap();
        let cache = TemplateCache::new();
        let hash = content_hash(EMPTY_MODULE);

        let first = cache.get_or_compile(&engine, &hash, EMPTY_MODULE).unwrap();
        assert_eq!(first.hash(), hash);
        assert_eq!(cache.len(), 1);

        // Second lookup returns the same template, not a recompile.
        let second = cache.get_or_compile(&engine, &hash, EMPTY_MODULE).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn distinct_hashes_get_distinct_entries() {
        let engine = build_engine().unwrap();
        let cache = TemplateCache::new();

        let other: &[u8] = b"(module (func))";
        cache
            .get_or_compile(&engine, &content_hash(EMPTY_MODULE), EMPTY_MODULE)
            .unwrap();
        cache
            .get_or_compile(&engine, &content_hash(other), other)
            .unwrap();

        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn invalid_bytecode_is_a_compilation_error() {
        let engine = build_engine().unwrap();
        let cache = TemplateCache::new();
        let garbage: &[u8] = b"definitely not wasm";

        let result = cache.get_or_compile(&engine, &content_hash(garbage), garbage);
        assert!(matches!(result, Err(SandboxError::Compilation(_))));
        // Failed compiles are not cached.
        assert!(cache.is_empty());
    }

    #[test]
    fn forget_removes_entry() {
        let engine = build_engine().unwrap();
        let cache = TemplateCache::new();
        let hash = content_hash(EMPTY_MODULE);

        cache.get_or_compile(&engine, &hash, EMPTY_MODULE).unwrap();
        cache.forget(&hash);
        assert!(cache.is_empty());

        // Forgetting an unknown hash is a no-op.
        cache.forget("0000");
    }
}
