//! waPC runtime CLI entry point.
//!
//! A thin reference driver around the engine abstraction: loads a compiled
//! waPC guest, wires printing sinks and an echo host-call handler, and
//! invokes a single operation through a small instance pool.

use anyhow::Context;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wapc_runtime_common::RuntimeConfig;
use wapc_runtime_core::{CallerContext, InstancePool, ModuleConfig, WapcEngine};
use wapc_runtime_wasmtime::WasmtimeEngine;

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,wapc_runtime=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut args = std::env::args().skip(1);
    let module_path = args
        .next()
        .context("usage: wapc-runtime <module.wasm> <operation> [payload]")?;
    let operation = args
        .next()
        .context("usage: wapc-runtime <module.wasm> <operation> [payload]")?;
    let payload = args.next().unwrap_or_default();

    // Load configuration from WAPC_CONFIG if set, defaults otherwise.
    let config = match std::env::var("WAPC_CONFIG") {
        Ok(path) => RuntimeConfig::from_file(&path)
            .with_context(|| format!("cannot load configuration from {path}"))?,
        Err(_) => RuntimeConfig::default(),
    };

    let engine = WasmtimeEngine::with_settings(config.engine.clone())?;
    info!(engine = engine.name(), "engine ready");

    let code = std::fs::read(&module_path)
        .with_context(|| format!("cannot read module from {module_path}"))?;

    let module_config = ModuleConfig::new()
        .with_console_logger(|msg| info!(guest_log = true, "{}", msg))
        .with_stdout_writer(|msg| print!("{msg}"))
        .with_stderr_writer(|msg| eprint!("{msg}"))
        .with_host_call_handler(|_ctx, binding, namespace, operation, payload| {
            debug!(binding, namespace, operation, "host call from guest");
            Ok(payload.to_vec())
        });

    let module = engine.new_module(&code, module_config)?;
    let ctx = CallerContext::new();
    let pool = InstancePool::new(module.as_ref(), &ctx, config.pool.size)?;

    info!(
        module = %module_path,
        operation = %operation,
        payload_len = payload.len(),
        pool_size = pool.capacity(),
        "invoking guest"
    );

    let instance = pool.get(config.pool.get_timeout())?;
    let result = instance.invoke(&ctx, &operation, payload.as_bytes())?;
    pool.put_back(instance)?;

    match std::str::from_utf8(&result) {
        Ok(text) => println!("{text}"),
        Err(_) => println!("{} bytes (non-UTF-8): {result:02x?}", result.len()),
    }

    pool.close();
    module.close();

    Ok(())
}
