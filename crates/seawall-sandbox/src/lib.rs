//! Seawall Wasm plugin instance pool.
//!
//! This crate is the resource manager behind the gateway's Wasm plugin
//! pipeline: it compiles plugin bytecode once, keeps a bounded number of
//! isolated instances per plugin, serializes concurrent use of each
//! instance, hot-swaps instances when plugin configuration changes, and
//! retires instances after a call budget.
//!
//! - **[`config`]** -- [`PluginConfig`] and the [`PluginConfigSource`]
//!   collaborator trait; configuration is re-read on every admission action.
//! - **[`error`]** -- [`SandboxError`] enumerates every failure mode.
//! - **[`template`]** -- [`TemplateCache`] of compiled modules keyed by
//!   content hash.
//! - **[`instance`]** -- [`CallContext`] and [`CallOutcome`] for individual
//!   guest calls; the instance itself is internal to its slot.
//! - **[`slot`]** -- [`VmSlot`] serializes calls against one instance and
//!   applies the call budget and the [`CorruptionPolicy`].
//! - **[`pool`]** -- [`VmPool`], the per-plugin admission actor.
//! - **[`registry`]** -- [`PoolRegistry`], the process-wide pool cache.
//! - **[`lease`]** -- [`SlotLease`], the caller's checkout handle.
//!
//! All public types are `Send + Sync` and designed for use within a
//! multi-threaded tokio runtime.

pub mod config;
pub mod error;
pub mod instance;
pub mod lease;
pub mod pool;
pub mod registry;
pub mod slot;
pub mod template;

// Re-export the most commonly used types at the crate root.
pub use config::{ConfigStore, HostCapability, MemoryLimits, PluginConfig, PluginConfigSource};
pub use error::{Result, SandboxError};
pub use instance::{CallContext, CallOutcome};
pub use lease::SlotLease;
pub use pool::{InitOptions, PoolStats, VmPool};
pub use registry::PoolRegistry;
pub use slot::{CorruptionPolicy, VmSlot};
pub use template::{CompiledTemplate, TemplateCache};
