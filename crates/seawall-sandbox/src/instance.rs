//! Sandbox instances.
//!
//! A [`SandboxInstance`] is one instantiated run of a plugin module: a
//! wasmtime [`Store`] with bound memory/fuel limits plus the host capability
//! functions granted by the plugin's configuration.  Instances are mutable
//! and exclusively owned by one slot; the per-call [`CallContext`] is bound
//! into the store before each guest call and cleared afterwards so host
//! functions always see the data of exactly the call in flight.

use std::collections::HashMap;

use wasmtime::{
    AsContextMut, Caller, Config, Engine, Extern, Instance, Linker, Store, StoreLimits,
    StoreLimitsBuilder,
};

use crate::config::{HostCapability, PluginConfig};
use crate::error::{Result, SandboxError};
use crate::template::CompiledTemplate;

/// Request-scoped data visible to host functions during a single call.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Identifier of the gateway request this call serves.
    pub request_id: String,
    /// Request attributes the guest may read by key (headers, route values).
    pub attributes: HashMap<String, String>,
}

impl CallContext {
    /// Create a context with a fresh request id.
    pub fn new() -> Self {
        Self {
            request_id: uuid::Uuid::now_v7().to_string(),
            attributes: HashMap::new(),
        }
    }

    /// Use a caller-supplied request id.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// Attach a request attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of one guest call: the primary return code plus whatever the guest
/// wrote through `host_write_result`.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    /// The exported function's return code.
    pub code: i32,
    /// Result payload written by the guest (empty if it wrote nothing).
    pub output: Vec<u8>,
}

/// Host state stored in the wasmtime [`Store`].
///
/// Carries the data host functions need during a single invocation, plus the
/// [`StoreLimits`] that cap the instance's memory.
struct HostState {
    context: Option<CallContext>,
    input: Vec<u8>,
    output: Vec<u8>,
    allowed_hosts: Vec<String>,
    allowed_paths: Vec<String>,
    limits: StoreLimits,
}

/// Build the process-wide wasmtime engine: fuel metering on, memory64 off.
pub(crate) fn build_engine() -> Result<Engine> {
    let mut config = Config::new();
    config.consume_fuel(true);
    config.wasm_memory64(false);
    Engine::new(&config).map_err(|e| SandboxError::Compilation(format!("engine setup: {e}")))
}

/// One instantiated, runnable plugin module.
pub struct SandboxInstance {
    store: Store<HostState>,
    instance: Instance,
    max_fuel: u64,
}

impl SandboxInstance {
    /// Instantiate `template` with the capabilities and limits in `config`.
    ///
    /// Modules importing host functions outside the granted capability set
    /// fail here with [`SandboxError::Instantiation`].
    pub(crate) fn new(
        engine: &Engine,
        template: &CompiledTemplate,
        config: &PluginConfig,
    ) -> Result<Self> {
        let state = HostState {
            context: None,
            input: Vec::new(),
            output: Vec::new(),
            allowed_hosts: config.allowed_hosts.clone(),
            allowed_paths: config.allowed_paths.clone(),
            limits: StoreLimitsBuilder::new()
                .memory_size(config.memory_limits.max_memory_bytes)
                .build(),
        };

        let mut store = Store::new(engine, state);
        store.limiter(|state| &mut state.limits);
        // Fuel must be present before any guest code runs, including the
        // module's start function.
        store
            .set_fuel(config.memory_limits.max_fuel)
            .map_err(|e| SandboxError::Instantiation(e.to_string()))?;

        let mut linker: Linker<HostState> = Linker::new(engine);
        for capability in &config.host_capabilities {
            define_capability(&mut linker, *capability)?;
        }

        let instance = linker
            .instantiate(&mut store, template.module())
            .map_err(|e| SandboxError::Instantiation(e.to_string()))?;

        tracing::debug!(plugin = %config.plugin_id, hash = %template.hash(), "instantiated sandbox");

        Ok(Self {
            store,
            instance,
            max_fuel: config.memory_limits.max_fuel,
        })
    }

    /// Invoke the exported function `function` with `input` bound as the call
    /// payload and `ctx` bound as the ambient call context.
    ///
    /// Expected guest signature: `fn(input_len: i32) -> i32`. The guest pulls
    /// the payload through `host_read_input` and pushes its result through
    /// `host_write_result`.
    pub(crate) fn invoke(
        &mut self,
        function: &str,
        input: &[u8],
        ctx: CallContext,
    ) -> Result<CallOutcome> {
        self.store
            .set_fuel(self.max_fuel)
            .map_err(|e| SandboxError::CallFailure(e.to_string()))?;

        {
            let state = self.store.data_mut();
            state.context = Some(ctx);
            state.input = input.to_vec();
            state.output.clear();
        }

        let entry = self
            .instance
            .get_typed_func::<i32, i32>(self.store.as_context_mut(), function)
            .map_err(|_| SandboxError::MissingExport {
                name: function.to_owned(),
            })?;

        let code = entry
            .call(&mut self.store, input.len() as i32)
            .map_err(|e| SandboxError::Trap(e.to_string()))?;

        let output = std::mem::take(&mut self.store.data_mut().output);
        Ok(CallOutcome { code, output })
    }

    /// Clear all per-call state (bound context, input, pending output).
    pub(crate) fn reset(&mut self) {
        let state = self.store.data_mut();
        state.context = None;
        state.input.clear();
        state.output.clear();
    }

    /// Irreversible native teardown.
    pub(crate) fn close(self) {
        // Dropping the store releases the instance's linear memory and any
        // native resources wasmtime holds for it.
        drop(self);
    }
}

/// Read `len` bytes of guest memory at `ptr`, if in bounds.
fn read_guest_bytes(caller: &mut Caller<'_, HostState>, ptr: i32, len: i32) -> Option<Vec<u8>> {
    let memory = match caller.get_export("memory") {
        Some(Extern::Memory(m)) => m,
        _ => return None,
    };
    let data = memory.data(&caller);
    let start = ptr as usize;
    let end = start.checked_add(len as usize)?;
    if ptr < 0 || len < 0 || end > data.len() {
        return None;
    }
    Some(data[start..end].to_vec())
}

/// Write `bytes` into guest memory at `ptr`. Returns the bytes written, or
/// `-1` if the destination is out of bounds.
fn write_guest_bytes(caller: &mut Caller<'_, HostState>, ptr: i32, cap: i32, bytes: &[u8]) -> i32 {
    let memory = match caller.get_export("memory") {
        Some(Extern::Memory(m)) => m,
        _ => return -1,
    };
    let write_len = bytes.len().min(cap as usize);
    let start = ptr as usize;
    let Some(end) = start.checked_add(write_len) else {
        return -1;
    };
    let data = memory.data_mut(caller.as_context_mut());
    if ptr < 0 || cap < 0 || end > data.len() {
        return -1;
    }
    data[start..end].copy_from_slice(&bytes[..write_len]);
    write_len as i32
}

/// Define the host functions for one granted capability.
fn define_capability(linker: &mut Linker<HostState>, capability: HostCapability) -> Result<()> {
    let map_err = |e: wasmtime::Error| SandboxError::Instantiation(e.to_string());

    match capability {
        HostCapability::Log => {
            linker
                .func_wrap(
                    "env",
                    "host_log",
                    |mut caller: Caller<'_, HostState>, level: i32, ptr: i32, len: i32| {
                        let Some(bytes) = read_guest_bytes(&mut caller, ptr, len) else {
                            return;
                        };
                        let Ok(msg) = std::str::from_utf8(&bytes) else {
                            return;
                        };
                        let request_id = caller
                            .data()
                            .context
                            .as_ref()
                            .map(|c| c.request_id.clone())
                            .unwrap_or_default();
                        match level {
                            0 => tracing::error!(request_id = %request_id, plugin_msg = msg),
                            1 => tracing::warn!(request_id = %request_id, plugin_msg = msg),
                            2 => tracing::info!(request_id = %request_id, plugin_msg = msg),
                            3 => tracing::debug!(request_id = %request_id, plugin_msg = msg),
                            _ => tracing::trace!(request_id = %request_id, plugin_msg = msg),
                        }
                    },
                )
                .map_err(map_err)?;
        }
        HostCapability::ReadInput => {
            linker
                .func_wrap(
                    "env",
                    "host_read_input",
                    |mut caller: Caller<'_, HostState>, ptr: i32, cap: i32| -> i32 {
                        let input = caller.data().input.clone();
                        write_guest_bytes(&mut caller, ptr, cap, &input)
                    },
                )
                .map_err(map_err)?;
            linker
                .func_wrap(
                    "env",
                    "host_read_attribute",
                    |mut caller: Caller<'_, HostState>,
                     key_ptr: i32,
                     key_len: i32,
                     val_ptr: i32,
                     val_cap: i32|
                     -> i32 {
                        let Some(key) = read_guest_bytes(&mut caller, key_ptr, key_len) else {
                            return -1;
                        };
                        let Ok(key) = String::from_utf8(key) else {
                            return -1;
                        };
                        let value = caller
                            .data()
                            .context
                            .as_ref()
                            .and_then(|c| c.attributes.get(&key).cloned());
                        match value {
                            Some(value) => {
                                write_guest_bytes(&mut caller, val_ptr, val_cap, value.as_bytes())
                            }
                            None => -1,
                        }
                    },
                )
                .map_err(map_err)?;
        }
        HostCapability::WriteResult => {
            linker
                .func_wrap(
                    "env",
                    "host_write_result",
                    |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| {
                        if let Some(bytes) = read_guest_bytes(&mut caller, ptr, len) {
                            caller.data_mut().output = bytes;
                        }
                    },
                )
                .map_err(map_err)?;
        }
        HostCapability::CheckHost => {
            linker
                .func_wrap(
                    "env",
                    "host_check_host",
                    |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> i32 {
                        let Some(bytes) = read_guest_bytes(&mut caller, ptr, len) else {
                            return 0;
                        };
                        let Ok(host) = String::from_utf8(bytes) else {
                            return 0;
                        };
                        let allowed = caller
                            .data()
                            .allowed_hosts
                            .iter()
                            .any(|h| h == "*" || *h == host);
                        allowed as i32
                    },
                )
                .map_err(map_err)?;
        }
        HostCapability::CheckPath => {
            linker
                .func_wrap(
                    "env",
                    "host_check_path",
                    |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> i32 {
                        let Some(bytes) = read_guest_bytes(&mut caller, ptr, len) else {
                            return 0;
                        };
                        let Ok(path) = String::from_utf8(bytes) else {
                            return 0;
                        };
                        let allowed = caller
                            .data()
                            .allowed_paths
                            .iter()
                            .any(|p| path.starts_with(p.as_str()));
                        allowed as i32
                    },
                )
                .map_err(map_err)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MemoryLimits, content_hash};
    use crate::template::TemplateCache;

    fn instantiate(wat: &str, config_fn: impl FnOnce(PluginConfig) -> PluginConfig) -> SandboxInstance {
        let engine = build_engine().unwrap();
        let cache = TemplateCache::new();
        let config = config_fn(PluginConfig::new("test", wat.as_bytes().to_vec()));
        let template = cache
            .get_or_compile(&engine, &config.content_hash(), &config.source_bytes)
            .unwrap();
        SandboxInstance::new(&engine, &template, &config).unwrap()
    }

    const CONSTANT_MODULE: &str = r#"
        (module
          (memory (export "memory") 1)
          (func (export "handle") (param i32) (result i32)
            i32.const 4))
    "#;

    const ECHO_MODULE: &str = r#"
        (module
          (import "env" "host_read_input" (func $read (param i32 i32) (result i32)))
          (import "env" "host_write_result" (func $write (param i32 i32)))
          (memory (export "memory") 1)
          (func (export "handle") (param i32) (result i32)
            (call $write (i32.const 0) (call $read (i32.const 0) (i32.const 4096)))
            i32.const 0))
    "#;

    #[test]
    fn invoke_returns_guest_code() {
        let mut instance = instantiate(CONSTANT_MODULE, |c| c);
        let outcome = instance
            .invoke("handle", b"", CallContext::new())
            .unwrap();
        assert_eq!(outcome.code, 4);
        assert!(outcome.output.is_empty());
    }

    #[test]
    fn echo_through_host_functions() {
        let mut instance = instantiate(ECHO_MODULE, |c| c);
        let outcome = instance
            .invoke("handle", b"request body", CallContext::new())
            .unwrap();
        assert_eq!(outcome.code, 0);
        assert_eq!(outcome.output, b"request body");
    }

    #[test]
    fn instance_survives_repeated_calls() {
        let mut instance = instantiate(ECHO_MODULE, |c| c);
        for i in 0..5u8 {
            let input = vec![i; 3];
            let outcome = instance.invoke("handle", &input, CallContext::new()).unwrap();
            assert_eq!(outcome.output, input);
            instance.reset();
        }
    }

    #[test]
    fn missing_export_is_reported() {
        let mut instance = instantiate(CONSTANT_MODULE, |c| c);
        let result = instance.invoke("absent", b"", CallContext::new());
        assert!(matches!(
            result,
            Err(SandboxError::MissingExport { name }) if name == "absent"
        ));
    }

    #[test]
    fn runaway_guest_traps_on_fuel() {
        let looping = r#"
            (module
              (memory (export "memory") 1)
              (func (export "handle") (param i32) (result i32)
                (loop $forever (br $forever))
                i32.const 0))
        "#;
        let mut instance = instantiate(looping, |c| {
            c.with_memory_limits(MemoryLimits {
                max_fuel: 10_000,
                ..MemoryLimits::default()
            })
        });
        let result = instance.invoke("handle", b"", CallContext::new());
        assert!(matches!(result, Err(SandboxError::Trap(_))));
    }

    #[test]
    fn ungranted_import_fails_instantiation() {
        let engine = build_engine().unwrap();
        let cache = TemplateCache::new();
        // Module needs host_write_result, config only grants Log.
        let config = PluginConfig::new("test", ECHO_MODULE.as_bytes().to_vec())
            .with_capabilities(vec![HostCapability::Log]);
        let template = cache
            .get_or_compile(&engine, &config.content_hash(), &config.source_bytes)
            .unwrap();
        let result = SandboxInstance::new(&engine, &template, &config);
        assert!(matches!(result, Err(SandboxError::Instantiation(_))));
    }

    #[test]
    fn attribute_lookup_reads_bound_context() {
        let module = r#"
            (module
              (import "env" "host_read_attribute"
                (func $attr (param i32 i32 i32 i32) (result i32)))
              (import "env" "host_write_result" (func $write (param i32 i32)))
              (memory (export "memory") 1)
              (data (i32.const 0) "route")
              (func (export "handle") (param i32) (result i32)
                (call $write
                  (i32.const 64)
                  (call $attr (i32.const 0) (i32.const 5) (i32.const 64) (i32.const 128)))
                i32.const 0))
        "#;
        let mut instance = instantiate(module, |c| c);
        let ctx = CallContext::new().with_attribute("route", "/api/users");
        let outcome = instance.invoke("handle", b"", ctx).unwrap();
        assert_eq!(outcome.output, b"/api/users");

        // After reset the context is cleared; the attribute lookup now
        // fails and host_write_result receives a negative length (no-op),
        // leaving the output empty.
        instance.reset();
        let outcome = instance.invoke("handle", b"", CallContext::new()).unwrap();
        assert!(outcome.output.is_empty());
    }

    #[test]
    fn host_allow_list_checks() {
        let module = r#"
            (module
              (import "env" "host_check_host" (func $check (param i32 i32) (result i32)))
              (memory (export "memory") 1)
              (data (i32.const 0) "api.example.com")
              (func (export "handle") (param i32) (result i32)
                (call $check (i32.const 0) (i32.const 15))))
        "#;
        let mut allowed = instantiate(module, |c| {
            c.with_capabilities(vec![HostCapability::CheckHost])
                .with_allowed_hosts(vec!["api.example.com".into()])
        });
        let outcome = allowed.invoke("handle", b"", CallContext::new()).unwrap();
        assert_eq!(outcome.code, 1);

        let mut denied = instantiate(module, |c| {
            c.with_capabilities(vec![HostCapability::CheckHost])
        });
        let outcome = denied.invoke("handle", b"", CallContext::new()).unwrap();
        assert_eq!(outcome.code, 0);
    }

    #[test]
    fn reset_clears_per_call_state() {
        let mut instance = instantiate(ECHO_MODULE, |c| c);
        instance
            .invoke("handle", b"stale", CallContext::new())
            .unwrap();
        instance.reset();
        assert!(instance.store.data().context.is_none());
        assert!(instance.store.data().input.is_empty());
        assert!(instance.store.data().output.is_empty());
    }
}
