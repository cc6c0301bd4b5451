//! The waPC host-function surface.
//!
//! This module registers the nine `wapc.*` imports plus the AssemblyScript
//! `env.abort` stub on a Wasmtime [`Linker`], and defines [`GuestState`], the
//! per-instance store data those imports operate on.
//!
//! # Memory protocol
//!
//! Every pointer the guest passes is a 32-bit offset into its own exported
//! `memory`. The host bounds-checks each access; an out-of-range pointer or
//! length means the guest has violated the ABI, so the access is recorded in
//! [`GuestState`] and the guest is trapped. The surrounding `invoke` surfaces
//! the recorded violation instead of an opaque trap.

use std::ops::Range;
use std::sync::Arc;

use tracing::debug;
use wasmtime::{Caller, Linker, Memory};

use wapc_runtime_common::WapcError;
use wapc_runtime_core::{InvocationContext, ModuleConfig};

/// Per-instance store data backing the waPC imports.
///
/// Holds the module's shared sinks/handler, the single invocation-context
/// slot, and the ABI-violation marker used to classify traps.
pub struct GuestState {
    config: Arc<ModuleConfig>,
    context: InvocationContext,
    abi_violation: Option<String>,
}

impl GuestState {
    /// Create store data for a fresh instance.
    pub fn new(config: Arc<ModuleConfig>, context: InvocationContext) -> Self {
        Self {
            config,
            context,
            abi_violation: None,
        }
    }

    /// The module configuration shared by all instances.
    pub fn config(&self) -> &ModuleConfig {
        &self.config
    }

    /// The current invocation context.
    pub fn context(&self) -> &InvocationContext {
        &self.context
    }

    /// Mutable access to the current invocation context.
    pub fn context_mut(&mut self) -> &mut InvocationContext {
        &mut self.context
    }

    /// Install a fresh context for a top-level invocation, clearing any
    /// violation left over from a previous call.
    pub fn begin_invocation(&mut self, context: InvocationContext) {
        self.context = context;
        self.abi_violation = None;
    }

    fn record_violation(&mut self, reason: &str) {
        self.abi_violation = Some(reason.to_string());
    }

    /// Take the recorded ABI violation, if the last trap was host-detected.
    pub fn take_violation(&mut self) -> Option<String> {
        self.abi_violation.take()
    }
}

impl std::fmt::Debug for GuestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestState")
            .field("context", &self.context)
            .field("abi_violation", &self.abi_violation)
            .finish_non_exhaustive()
    }
}

/// Register the nine waPC host functions in the `wapc` namespace.
///
/// # Errors
///
/// Returns an error if function registration fails.
pub fn register_wapc(linker: &mut Linker<GuestState>) -> Result<(), WapcError> {
    linker
        .func_wrap(
            "wapc",
            "__guest_request",
            |mut caller: Caller<'_, GuestState>,
             op_ptr: i32,
             payload_ptr: i32|
             -> Result<(), wasmtime::Error> {
                let memory = guest_memory(&mut caller)?;
                let (data, state) = memory.data_and_store_mut(&mut caller);
                let operation = state.context().operation().as_bytes().to_vec();
                let request = state.context().guest_request().to_vec();
                write_bytes(data, state, op_ptr as i64, &operation)?;
                write_bytes(data, state, payload_ptr as i64, &request)?;
                Ok(())
            },
        )
        .map_err(|e| define_error("__guest_request", &e))?;

    linker
        .func_wrap(
            "wapc",
            "__guest_response",
            |mut caller: Caller<'_, GuestState>, ptr: i32, len: i32| -> Result<(), wasmtime::Error> {
                let memory = guest_memory(&mut caller)?;
                let (data, state) = memory.data_and_store_mut(&mut caller);
                let response = read_bytes(data, state, ptr as i64, len as i64)?;
                state.context_mut().set_guest_response(response);
                Ok(())
            },
        )
        .map_err(|e| define_error("__guest_response", &e))?;

    linker
        .func_wrap(
            "wapc",
            "__guest_error",
            |mut caller: Caller<'_, GuestState>, ptr: i32, len: i32| -> Result<(), wasmtime::Error> {
                let memory = guest_memory(&mut caller)?;
                let (data, state) = memory.data_and_store_mut(&mut caller);
                let message = read_bytes(data, state, ptr as i64, len as i64)?;
                state
                    .context_mut()
                    .set_guest_error(String::from_utf8_lossy(&message).into_owned());
                Ok(())
            },
        )
        .map_err(|e| define_error("__guest_error", &e))?;

    linker
        .func_wrap(
            "wapc",
            "__host_call",
            |mut caller: Caller<'_, GuestState>,
             binding_ptr: i32,
             binding_len: i32,
             namespace_ptr: i32,
             namespace_len: i32,
             operation_ptr: i32,
             operation_len: i32,
             payload_ptr: i32,
             payload_len: i32|
             -> Result<i32, wasmtime::Error> {
                let memory = guest_memory(&mut caller)?;
                let (data, state) = memory.data_and_store_mut(&mut caller);

                let binding = read_string(data, state, binding_ptr as i64, binding_len as i64)?;
                let namespace =
                    read_string(data, state, namespace_ptr as i64, namespace_len as i64)?;
                let operation =
                    read_string(data, state, operation_ptr as i64, operation_len as i64)?;
                let payload = read_bytes(data, state, payload_ptr as i64, payload_len as i64)?;

                let handler = state.config().host_call_handler.clone();
                let caller_ctx = state.context().caller().clone();

                // Handler failure is guest-observable data, never a trap.
                let result = match handler {
                    Some(handler) => {
                        handler(&caller_ctx, &binding, &namespace, &operation, &payload)
                            .map_err(|e| e.to_string())
                    }
                    None => Err("no host call handler configured".to_string()),
                };

                let code = i32::from(result.is_ok());
                state.context_mut().set_host_result(result);
                Ok(code)
            },
        )
        .map_err(|e| define_error("__host_call", &e))?;

    linker
        .func_wrap(
            "wapc",
            "__host_response_len",
            |caller: Caller<'_, GuestState>| -> i32 {
                caller
                    .data()
                    .context()
                    .host_response()
                    .map_or(0, |bytes| bytes.len() as i32)
            },
        )
        .map_err(|e| define_error("__host_response_len", &e))?;

    linker
        .func_wrap(
            "wapc",
            "__host_response",
            |mut caller: Caller<'_, GuestState>, ptr: i32| -> Result<(), wasmtime::Error> {
                let memory = guest_memory(&mut caller)?;
                let (data, state) = memory.data_and_store_mut(&mut caller);
                let Some(response) = state.context().host_response().map(<[u8]>::to_vec) else {
                    return Ok(());
                };
                write_bytes(data, state, ptr as i64, &response)
            },
        )
        .map_err(|e| define_error("__host_response", &e))?;

    linker
        .func_wrap(
            "wapc",
            "__host_error_len",
            |caller: Caller<'_, GuestState>| -> i32 {
                caller
                    .data()
                    .context()
                    .host_error()
                    .map_or(0, |message| message.len() as i32)
            },
        )
        .map_err(|e| define_error("__host_error_len", &e))?;

    linker
        .func_wrap(
            "wapc",
            "__host_error",
            |mut caller: Caller<'_, GuestState>, ptr: i32| -> Result<(), wasmtime::Error> {
                let memory = guest_memory(&mut caller)?;
                let (data, state) = memory.data_and_store_mut(&mut caller);
                let Some(message) = state.context().host_error().map(str::to_owned) else {
                    return Ok(());
                };
                write_bytes(data, state, ptr as i64, message.as_bytes())
            },
        )
        .map_err(|e| define_error("__host_error", &e))?;

    linker
        .func_wrap(
            "wapc",
            "__console_log",
            |mut caller: Caller<'_, GuestState>, ptr: i32, len: i32| -> Result<(), wasmtime::Error> {
                let memory = guest_memory(&mut caller)?;
                let (data, state) = memory.data_and_store_mut(&mut caller);
                let bytes = read_bytes(data, state, ptr as i64, len as i64)?;
                let message = String::from_utf8_lossy(&bytes);

                debug!(guest_log = true, "{}", message);
                if let Some(logger) = state.config().console_logger.clone() {
                    logger(&message);
                }
                Ok(())
            },
        )
        .map_err(|e| define_error("__console_log", &e))?;

    Ok(())
}

/// Register the `env` namespace: the AssemblyScript `abort` stub.
///
/// `abort(msg_ptr, file_ptr, line, col)` does nothing and returns. Other
/// waPC engines stub it the same way; the module must not be killed here.
pub fn register_env(linker: &mut Linker<GuestState>) -> Result<(), WapcError> {
    linker
        .func_wrap("env", "abort", |_msg: i32, _file: i32, _line: i32, _col: i32| {})
        .map_err(|e| define_error("abort", &e))?;
    Ok(())
}

fn define_error(name: &str, err: &wasmtime::Error) -> WapcError {
    WapcError::engine(format!("cannot define function {name}: {err}"))
}

/// Resolve the guest's exported `memory` from inside a host function.
pub(crate) fn guest_memory(
    caller: &mut Caller<'_, GuestState>,
) -> Result<Memory, wasmtime::Error> {
    match caller
        .get_export("memory")
        .and_then(wasmtime::Extern::into_memory)
    {
        Some(memory) => Ok(memory),
        None => {
            let reason = "guest module does not export 'memory'";
            caller.data_mut().record_violation(reason);
            Err(wasmtime::Error::msg(reason))
        }
    }
}

/// Read `len` bytes at `ptr`, recording a violation and trapping on any
/// out-of-range access.
pub(crate) fn read_bytes(
    data: &[u8],
    state: &mut GuestState,
    ptr: i64,
    len: i64,
) -> Result<Vec<u8>, wasmtime::Error> {
    match checked_range(ptr, len, data.len()) {
        Some(range) => Ok(data[range].to_vec()),
        None => Err(violation(
            state,
            format!("read of {len} bytes at offset {ptr} exceeds memory of {} bytes", data.len()),
        )),
    }
}

/// Read and decode a UTF-8 string (lossy, matching the copy-out semantics of
/// the byte reads).
pub(crate) fn read_string(
    data: &[u8],
    state: &mut GuestState,
    ptr: i64,
    len: i64,
) -> Result<String, wasmtime::Error> {
    let bytes = read_bytes(data, state, ptr, len)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Write `bytes` at `ptr`, recording a violation and trapping on any
/// out-of-range access.
pub(crate) fn write_bytes(
    data: &mut [u8],
    state: &mut GuestState,
    ptr: i64,
    bytes: &[u8],
) -> Result<(), wasmtime::Error> {
    match checked_range(ptr, bytes.len() as i64, data.len()) {
        Some(range) => {
            data[range].copy_from_slice(bytes);
            Ok(())
        }
        None => Err(violation(
            state,
            format!(
                "write of {} bytes at offset {ptr} exceeds memory of {} bytes",
                bytes.len(),
                data.len()
            ),
        )),
    }
}

fn checked_range(ptr: i64, len: i64, memory_len: usize) -> Option<Range<usize>> {
    if ptr < 0 || len < 0 {
        return None;
    }
    let start = ptr as usize;
    let end = start.checked_add(len as usize)?;
    (end <= memory_len).then_some(start..end)
}

fn violation(state: &mut GuestState, reason: String) -> wasmtime::Error {
    state.record_violation(&reason);
    wasmtime::Error::msg(reason)
}
