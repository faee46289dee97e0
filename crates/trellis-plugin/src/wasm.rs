//! WebAssembly plugin runtime.
//!
//! A [`WasmPlugin`] compiles a module once and instantiates it per call
//! with a fresh store, fuel budget, and memory limit, so calls are isolated
//! and a runaway handler burns its own fuel only. Guest convention:
//!
//! - exports `memory`, `allocate(len) -> ptr`, optionally
//!   `deallocate(ptr, len)`;
//! - `registration() -> ptr` returns the registration as length-prefixed
//!   JSON (4 little-endian length bytes, then the payload), read at load;
//! - handlers are `(ptr, len) -> ptr` over the same length-prefixed JSON;
//! - the `env.host_call(ptr, len) -> ptr` import routes
//!   `{method, args}` requests through the plugin's sandboxed host API and
//!   returns `{"ok": ...}` or `{"error": "..."}`.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tokio::runtime::Handle;
use trellis_core::{Error, Result};
use trellis_plugin_api::host::{CallContext, HostApi};
use trellis_plugin_api::registration::Registration;
use trellis_plugin_api::Plugin;
use wasmtime::{
    Caller, Engine, Instance, Linker, Memory, Module, Store, StoreLimits, StoreLimitsBuilder,
    TypedFunc,
};

use crate::dispatch::dispatch_host_call;

/// Upper bound for a single guest allocation or result.
const MAX_ALLOCATION_SIZE: usize = 256 * 1024 * 1024;

/// Fuel granted per millisecond of the plugin's call budget.
const FUEL_PER_MS: u64 = 1000;

const DEFAULT_MEMORY_LIMIT: usize = 64 * 1024 * 1024;
const DEFAULT_FUEL: u64 = 30_000 * FUEL_PER_MS;

/// An engine configured the way this runtime expects (fuel metering on).
#[must_use]
pub fn default_engine() -> Engine {
    let mut config = wasmtime::Config::new();
    config.consume_fuel(true);
    config.max_wasm_stack(512 * 1024);
    Engine::new(&config).unwrap_or_else(|_| Engine::default())
}

/// Per-store state handed to host functions.
struct StoreData {
    limits: StoreLimits,
    plugin_name: String,
    host: Option<Arc<dyn HostApi>>,
    ctx: CallContext,
    runtime: Option<Handle>,
}

#[derive(Deserialize)]
struct GuestHostCall {
    method: String,
    #[serde(default)]
    args: Value,
}

struct WasmCore {
    engine: Engine,
    module: Module,
    linker: Linker<StoreData>,
    name: String,
    fuel: u64,
    memory_limit: usize,
}

impl WasmCore {
    fn store(
        &self,
        host: Option<Arc<dyn HostApi>>,
        ctx: CallContext,
        runtime: Option<Handle>,
    ) -> Result<Store<StoreData>> {
        let data = StoreData {
            limits: StoreLimitsBuilder::new().memory_size(self.memory_limit).build(),
            plugin_name: self.name.clone(),
            host,
            ctx,
            runtime,
        };
        let mut store = Store::new(&self.engine, data);
        store.limiter(|data| &mut data.limits);
        store
            .set_fuel(self.fuel)
            .map_err(|e| Error::internal(format!("failed to set fuel: {e}")))?;
        Ok(store)
    }

    fn invoke(
        &self,
        host: Option<Arc<dyn HostApi>>,
        ctx: CallContext,
        function: &str,
        payload: Option<Vec<u8>>,
        runtime: Option<Handle>,
    ) -> Result<Value> {
        let mut store = self.store(host, ctx, runtime)?;
        let instance = self
            .linker
            .instantiate(&mut store, &self.module)
            .map_err(|e| Error::plugin(format!("failed to instantiate '{}': {e}", self.name)))?;
        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| Error::plugin(format!("'{}' exports no memory", self.name)))?;

        let result_ptr = match payload {
            Some(payload) => {
                let (ptr, len) = allocate_and_write(&mut store, &memory, &instance, &payload)?;
                let func: TypedFunc<(i32, i32), i32> = instance
                    .get_typed_func(&mut store, function)
                    .map_err(|e| {
                        Error::plugin(format!("'{}' has no handler '{function}': {e}", self.name))
                    })?;
                let result = func
                    .call(&mut store, (ptr as i32, len as i32))
                    .map_err(|e| {
                        Error::plugin(format!("'{}' handler '{function}' trapped: {e}", self.name))
                    })?;
                deallocate(&mut store, &instance, ptr, len)?;
                result
            }
            None => {
                let func: TypedFunc<(), i32> = instance
                    .get_typed_func(&mut store, function)
                    .map_err(|e| {
                        Error::plugin(format!("'{}' has no export '{function}': {e}", self.name))
                    })?;
                func.call(&mut store, ()).map_err(|e| {
                    Error::plugin(format!("'{}' export '{function}' trapped: {e}", self.name))
                })?
            }
        };

        read_result(&mut store, &memory, u32::try_from(result_ptr).unwrap_or(0))
    }

    fn has_export(&self, name: &str) -> bool {
        self.module.get_export(name).is_some()
    }
}

/// A plugin backed by a compiled WebAssembly module.
pub struct WasmPlugin {
    core: Arc<WasmCore>,
    registration: Registration,
    host: Mutex<Option<Arc<dyn HostApi>>>,
}

impl WasmPlugin {
    /// Compile `path` and read its registration export.
    ///
    /// # Errors
    ///
    /// Fails when the module does not compile, lacks the expected exports,
    /// or publishes a malformed registration.
    pub fn load(engine: &Engine, path: &Path) -> Result<Self> {
        let module = Module::from_file(engine, path)
            .map_err(|e| Error::load_failed(format!("{}: {e}", path.display())))?;

        let name_hint = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "wasm-plugin".to_string());

        let bootstrap = Arc::new(WasmCore {
            engine: engine.clone(),
            module: module.clone(),
            linker: build_linker(engine)?,
            name: name_hint,
            fuel: DEFAULT_FUEL,
            memory_limit: DEFAULT_MEMORY_LIMIT,
        });

        let value = bootstrap
            .invoke(
                None,
                CallContext::root(),
                "registration",
                None,
                Handle::try_current().ok(),
            )
            .map_err(|e| Error::load_failed(format!("{}: {e}", path.display())))?;
        let registration: Registration = serde_json::from_value(value).map_err(|e| {
            Error::load_failed(format!("{}: malformed registration: {e}", path.display()))
        })?;

        // Rebuild the core with the limits the plugin actually requested.
        let core = Arc::new(WasmCore {
            engine: engine.clone(),
            module,
            linker: build_linker(engine)?,
            name: registration.name.clone(),
            fuel: registration.resources.call_timeout_ms.max(1) * FUEL_PER_MS,
            memory_limit: usize::try_from(registration.resources.max_memory_bytes)
                .unwrap_or(DEFAULT_MEMORY_LIMIT),
        });

        Ok(Self {
            core,
            registration,
            host: Mutex::new(None),
        })
    }

    fn host(&self) -> Option<Arc<dyn HostApi>> {
        self.host.lock().clone()
    }

    async fn invoke_blocking(
        &self,
        ctx: CallContext,
        function: String,
        payload: Option<Vec<u8>>,
    ) -> Result<Value> {
        let core = Arc::clone(&self.core);
        let host = self.host();
        // Capture the runtime handle here; the blocking thread has no
        // async context of its own and host_call needs one to re-enter.
        let runtime = Handle::try_current().ok();
        tokio::task::spawn_blocking(move || core.invoke(host, ctx, &function, payload, runtime))
            .await
            .map_err(|e| Error::internal(format!("wasm invocation task failed: {e}")))?
    }
}

#[async_trait]
impl Plugin for WasmPlugin {
    async fn registration(&self) -> Result<Registration> {
        Ok(self.registration.clone())
    }

    async fn init(&self, host: Arc<dyn HostApi>) -> Result<()> {
        *self.host.lock() = Some(host);
        if self.core.has_export("init") {
            self.invoke_blocking(CallContext::root(), "init".to_string(), None)
                .await?;
        }
        Ok(())
    }

    async fn call(&self, ctx: &CallContext, function: &str, args: Value) -> Result<Value> {
        let payload = serde_json::to_vec(&args)?;
        self.invoke_blocking(ctx.clone(), function.to_string(), Some(payload))
            .await
    }

    async fn shutdown(&self) -> Result<()> {
        if self.core.has_export("shutdown") {
            self.invoke_blocking(CallContext::root(), "shutdown".to_string(), None)
                .await?;
        }
        self.host.lock().take();
        Ok(())
    }
}

fn build_linker(engine: &Engine) -> Result<Linker<StoreData>> {
    let mut linker = Linker::new(engine);
    linker
        .func_wrap(
            "env",
            "host_call",
            |mut caller: Caller<'_, StoreData>, ptr: i32, len: i32| -> i32 {
                let response = guest_host_call(&mut caller, ptr as u32, len as u32);
                let envelope = match response {
                    Ok(value) => serde_json::json!({ "ok": value }),
                    Err(e) => serde_json::json!({ "error": e.to_string() }),
                };
                let bytes = serde_json::to_vec(&envelope).unwrap_or_default();
                match write_guest_result(&mut caller, &bytes) {
                    Ok(ptr) => ptr as i32,
                    Err(_) => 0,
                }
            },
        )
        .map_err(|e| Error::internal(format!("failed to register host_call: {e}")))?;
    Ok(linker)
}

fn guest_host_call(caller: &mut Caller<'_, StoreData>, ptr: u32, len: u32) -> Result<Value> {
    let memory = caller
        .get_export("memory")
        .and_then(wasmtime::Extern::into_memory)
        .ok_or_else(|| Error::plugin("memory export not found"))?;

    if len as usize > MAX_ALLOCATION_SIZE {
        return Err(Error::bad_input(format!("host call of {len} bytes exceeds limit")));
    }
    let mut buffer = vec![0_u8; len as usize];
    memory
        .read(&mut *caller, ptr as usize, &mut buffer)
        .map_err(|e| Error::plugin(format!("failed to read host call: {e}")))?;

    let request: GuestHostCall = serde_json::from_slice(&buffer)
        .map_err(|e| Error::bad_input(format!("malformed host call: {e}")))?;

    let host = caller
        .data()
        .host
        .clone()
        .ok_or_else(|| Error::internal("host api not attached yet"))?;
    let runtime = caller
        .data()
        .runtime
        .clone()
        .ok_or_else(|| Error::internal("no async runtime for host call"))?;
    let ctx = CallContext {
        caller: Some(caller.data().plugin_name.clone()),
        depth: caller.data().ctx.depth,
    };

    runtime.block_on(dispatch_host_call(
        host.as_ref(),
        &ctx,
        &request.method,
        request.args,
    ))
}

/// Allocate in the guest and write `bytes` with the length prefix; returns
/// the blob pointer. Used for host-call responses.
fn write_guest_result(caller: &mut Caller<'_, StoreData>, bytes: &[u8]) -> Result<u32> {
    let memory = caller
        .get_export("memory")
        .and_then(wasmtime::Extern::into_memory)
        .ok_or_else(|| Error::plugin("memory export not found"))?;
    let allocate = caller
        .get_export("allocate")
        .and_then(wasmtime::Extern::into_func)
        .ok_or_else(|| Error::plugin("allocate export not found"))?;
    let allocate: TypedFunc<i32, i32> = allocate
        .typed(&mut *caller)
        .map_err(|e| Error::plugin(format!("allocate has wrong signature: {e}")))?;

    let total = bytes.len() + 4;
    let ptr = allocate
        .call(&mut *caller, i32::try_from(total).map_err(|_| Error::bad_input("oversized result"))?)
        .map_err(|e| Error::plugin(format!("guest allocation failed: {e}")))? as u32;

    let len_bytes = u32::try_from(bytes.len())
        .map_err(|_| Error::bad_input("oversized result"))?
        .to_le_bytes();
    memory
        .write(&mut *caller, ptr as usize, &len_bytes)
        .and_then(|()| memory.write(&mut *caller, ptr as usize + 4, bytes))
        .map_err(|e| Error::plugin(format!("failed to write result: {e}")))?;
    Ok(ptr)
}

fn allocate_and_write(
    store: &mut Store<StoreData>,
    memory: &Memory,
    instance: &Instance,
    data: &[u8],
) -> Result<(u32, u32)> {
    if data.len() > MAX_ALLOCATION_SIZE {
        return Err(Error::bad_input(format!("allocation of {} bytes exceeds limit", data.len())));
    }
    let allocate: TypedFunc<i32, i32> = instance
        .get_typed_func(&mut *store, "allocate")
        .map_err(|e| Error::plugin(format!("allocate export missing: {e}")))?;
    let len = data.len() as u32;
    let ptr = allocate
        .call(&mut *store, len as i32)
        .map_err(|e| Error::plugin(format!("guest allocation failed: {e}")))? as u32;
    memory
        .write(&mut *store, ptr as usize, data)
        .map_err(|e| Error::plugin(format!("failed to write payload: {e}")))?;
    Ok((ptr, len))
}

fn deallocate(store: &mut Store<StoreData>, instance: &Instance, ptr: u32, len: u32) -> Result<()> {
    if let Ok(dealloc) = instance.get_typed_func::<(i32, i32), ()>(&mut *store, "deallocate") {
        dealloc
            .call(&mut *store, (ptr as i32, len as i32))
            .map_err(|e| Error::plugin(format!("guest deallocation failed: {e}")))?;
    }
    Ok(())
}

fn read_result(store: &mut Store<StoreData>, memory: &Memory, ptr: u32) -> Result<Value> {
    if ptr == 0 {
        return Ok(Value::Null);
    }
    let mut len_bytes = [0_u8; 4];
    memory
        .read(&mut *store, ptr as usize, &mut len_bytes)
        .map_err(|e| Error::plugin(format!("failed to read result length: {e}")))?;
    let len = u32::from_le_bytes(len_bytes);
    if len as usize > MAX_ALLOCATION_SIZE {
        return Err(Error::plugin(format!("result of {len} bytes exceeds limit")));
    }
    let mut data = vec![0_u8; len as usize];
    memory
        .read(&mut *store, ptr as usize + 4, &mut data)
        .map_err(|e| Error::plugin(format!("failed to read result: {e}")))?;
    serde_json::from_slice(&data).map_err(|e| Error::plugin(format!("malformed result: {e}")))
}
