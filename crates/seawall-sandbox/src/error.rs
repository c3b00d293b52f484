//! Sandbox pool error types.
//!
//! All pool subsystems surface errors through [`SandboxError`], which is the
//! single error type returned by every public API in this crate.

/// Unified error type for the Wasm plugin instance pool.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SandboxError {
    /// The plugin's configuration disappeared from the config source.
    ///
    /// Terminal for the pool (it tears down and drops out of the registry),
    /// but not for the process.
    #[error("no configuration for plugin '{plugin_id}'")]
    ConfigMissing {
        /// Identifier of the plugin whose configuration vanished.
        plugin_id: String,
    },

    /// Wasm module failed to compile (e.g. invalid bytecode).
    ///
    /// Fails only the acquisition that was waiting on instance creation; the
    /// next acquire retries the compile.
    #[error("wasm compilation error: {0}")]
    Compilation(String),

    /// Wasm module could not be instantiated (e.g. missing imports, memory
    /// limit rejected at setup).
    #[error("wasm instantiation error: {0}")]
    Instantiation(String),

    /// A plugin call failed. Scoped to that one call; the instance and the
    /// pool stay usable.
    #[error("wasm call failure: {0}")]
    CallFailure(String),

    /// A Wasm trap was raised during execution (including fuel exhaustion).
    #[error("wasm trap: {0}")]
    Trap(String),

    /// The module does not export the requested function.
    #[error("missing export '{name}'")]
    MissingExport {
        /// Name of the export the caller asked for.
        name: String,
    },

    /// The pool (or the slot's worker) was torn down while a request was
    /// outstanding.
    #[error("pool closed")]
    PoolClosed,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_missing_display() {
        let err = SandboxError::ConfigMissing {
            plugin_id: "rate-limit".into(),
        };
        assert_eq!(err.to_string(), "no configuration for plugin 'rate-limit'");
    }

    #[test]
    fn compilation_error_display() {
        let err = SandboxError::Compilation("bad magic".into());
        assert_eq!(err.to_string(), "wasm compilation error: bad magic");
    }

    #[test]
    fn instantiation_error_display() {
        let err = SandboxError::Instantiation("missing import".into());
        assert_eq!(err.to_string(), "wasm instantiation error: missing import");
    }

    #[test]
    fn call_failure_display() {
        let err = SandboxError::CallFailure("guest declined".into());
        assert_eq!(err.to_string(), "wasm call failure: guest declined");
    }

    #[test]
    fn trap_display() {
        let err = SandboxError::Trap("all fuel consumed".into());
        assert_eq!(err.to_string(), "wasm trap: all fuel consumed");
    }

    #[test]
    fn missing_export_display() {
        let err = SandboxError::MissingExport {
            name: "handle".into(),
        };
        assert_eq!(err.to_string(), "missing export 'handle'");
    }

    #[test]
    fn errors_are_cloneable() {
        let err = SandboxError::PoolClosed;
        let cloned = err.clone();
        assert_eq!(cloned.to_string(), "pool closed");
    }
}
