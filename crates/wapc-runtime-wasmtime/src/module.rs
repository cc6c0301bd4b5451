//! Compiled waPC modules.
//!
//! A [`WasmtimeModule`] owns one compiled program and the configuration
//! shared by every instance spawned from it. Instantiation wires the full
//! waPC import surface (host ABI + `env.abort` + WASI shim) against a fresh
//! store, resolves the guest's required exports, and runs the optional init
//! exports before the instance is handed out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, instrument};
use wasmtime::{Engine, Linker, Module, Store};

use wapc_runtime_common::WapcError;
use wapc_runtime_core::{CallerContext, InvocationContext, ModuleConfig, WapcInstance, WapcModule};

use crate::instance::{trap_reason, WasmtimeInstance};
use crate::linker::{register_env, register_wapc, GuestState};
use crate::wasi::register_wasi;

// Optional guest init exports, run in this order, each exactly once.
const INIT_FUNCTIONS: [&str; 2] = ["_start", "wapc_init"];

/// A compiled waPC module: a factory for [`WasmtimeInstance`]s.
///
/// The compiled program and the shared configuration are immutable;
/// `instantiate` may be called from multiple threads. `close` is an atomic,
/// idempotent flip; instances already created are unaffected and must be
/// closed by their owners first.
pub struct WasmtimeModule {
    engine: Arc<Engine>,
    module: Module,
    config: Arc<ModuleConfig>,
    fuel: Option<u64>,
    closed: AtomicBool,
}

impl WasmtimeModule {
    pub(crate) fn new(
        engine: Arc<Engine>,
        module: Module,
        config: ModuleConfig,
        fuel: Option<u64>,
    ) -> Self {
        Self {
            engine,
            module,
            config: Arc::new(config),
            fuel,
            closed: AtomicBool::new(false),
        }
    }

    fn build_linker(&self) -> Result<Linker<GuestState>, WapcError> {
        let mut linker = Linker::new(self.engine.as_ref());
        register_env(&mut linker)?;
        register_wapc(&mut linker)?;
        register_wasi(&mut linker)?;
        Ok(linker)
    }
}

impl WapcModule for WasmtimeModule {
    #[instrument(skip(self, ctx))]
    fn instantiate(&self, ctx: &CallerContext) -> Result<Arc<dyn WapcInstance>, WapcError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WapcError::ModuleClosed);
        }
        // The window between the check above and the work below is a benign
        // race: an instantiation racing a close may succeed or see Closed.

        let linker = self.build_linker()?;

        let state = GuestState::new(
            self.config.clone(),
            InvocationContext::empty_shell(ctx.clone()),
        );
        let mut store = Store::new(self.engine.as_ref(), state);
        if let Some(fuel) = self.fuel {
            store
                .set_fuel(fuel)
                .map_err(|e| WapcError::engine(format!("failed to set fuel: {e}")))?;
        }

        let instance = linker
            .instantiate(&mut store, &self.module)
            .map_err(|e| WapcError::engine(format!("instantiation failed: {e}")))?;

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| WapcError::bad_export("memory"))?;

        let guest_call = instance
            .get_typed_func::<(i32, i32), i32>(&mut store, "__guest_call")
            .map_err(|_| WapcError::bad_export("__guest_call"))?;

        for name in INIT_FUNCTIONS {
            if let Ok(init) = instance.get_typed_func::<(), ()>(&mut store, name) {
                debug!(function = name, "running guest init export");
                init.call(&mut store, ())
                    .map_err(|e| WapcError::init_failed(format!("{name}: {}", trap_reason(&e))))?;
            }
        }

        Ok(Arc::new(WasmtimeInstance::new(
            store, instance, memory, guest_call,
        )))
    }

    fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            debug!("module closed");
        }
    }
}

impl std::fmt::Debug for WasmtimeModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmtimeModule")
            .field("config", &self.config)
            .field("fuel", &self.fuel)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}
