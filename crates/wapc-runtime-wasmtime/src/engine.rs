//! Wasmtime engine configuration and creation.
//!
//! [`WasmtimeEngine`] is the production binding of the waPC engine
//! abstraction. It is thread-safe, shared across all modules compiled
//! through it, and carries no per-call state.

use std::sync::Arc;

use tracing::info;
use wasmtime::{Config, Engine, Module, OptLevel};

use wapc_runtime_common::{EngineSettings, WapcError};
use wapc_runtime_core::{ModuleConfig, WapcEngine, WapcModule};

use crate::module::WasmtimeModule;

/// The waPC engine backed by Wasmtime.
///
/// # Example
///
/// ```ignore
/// use wapc_runtime_core::{ModuleConfig, WapcEngine};
/// use wapc_runtime_wasmtime::WasmtimeEngine;
///
/// let engine = WasmtimeEngine::new()?;
/// let module = engine.new_module(&wasm_bytes, ModuleConfig::new())?;
/// ```
#[derive(Clone)]
pub struct WasmtimeEngine {
    engine: Arc<Engine>,
    settings: EngineSettings,
}

impl WasmtimeEngine {
    /// Create an engine with default settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the Wasmtime configuration is rejected.
    pub fn new() -> Result<Self, WapcError> {
        Self::with_settings(EngineSettings::default())
    }

    /// Create an engine with explicit settings.
    ///
    /// Setting `fuel` enables instruction metering: every instance starts
    /// with that budget and exhausting it traps the guest.
    ///
    /// # Errors
    ///
    /// Returns an error if the Wasmtime configuration is rejected.
    pub fn with_settings(settings: EngineSettings) -> Result<Self, WapcError> {
        let mut config = Config::new();

        if settings.optimize {
            config.cranelift_opt_level(OptLevel::Speed);
        }
        if settings.fuel.is_some() {
            config.consume_fuel(true);
        }

        let engine = Engine::new(&config)
            .map_err(|e| WapcError::engine(format!("failed to create wasmtime engine: {e}")))?;

        info!(fuel = ?settings.fuel, "wasmtime engine initialized");

        Ok(Self {
            engine: Arc::new(engine),
            settings,
        })
    }

    /// The inner Wasmtime engine.
    pub fn inner(&self) -> &Engine {
        &self.engine
    }

    /// The settings this engine was built with.
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }
}

impl WapcEngine for WasmtimeEngine {
    fn name(&self) -> &str {
        "wasmtime"
    }

    fn new_module(
        &self,
        code: &[u8],
        config: ModuleConfig,
    ) -> Result<Arc<dyn WapcModule>, WapcError> {
        let module =
            Module::new(&self.engine, code).map_err(|e| WapcError::bad_module(e.to_string()))?;

        Ok(Arc::new(WasmtimeModule::new(
            self.engine.clone(),
            module,
            config,
            self.settings.fuel,
        )))
    }
}

impl std::fmt::Debug for WasmtimeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmtimeEngine")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
