//! The engine abstraction and per-module configuration.
//!
//! waPC deliberately keeps the seam between the protocol layer and the
//! WebAssembly engine small: an engine is anything that can turn guest bytes
//! into a [`WapcModule`], a module is a factory for [`WapcInstance`]s, and an
//! instance can run one guest call at a time. Alternative engines plug in by
//! implementing these three traits.

use std::error::Error;
use std::sync::Arc;

use wapc_runtime_common::WapcError;

use crate::context::CallerContext;

/// A sink for guest-produced text.
///
/// Used for `__console_log` messages and for WASI `fd_write` output.
pub type Logger = Arc<dyn Fn(&str) + Send + Sync>;

/// The user-supplied handler invoked when a guest performs a host call.
///
/// Receives the caller's [`CallerContext`] plus the guest's binding,
/// namespace, operation, and payload. A returned error is not a failure of
/// the surrounding invocation: the guest observes it via `__host_error` and
/// decides what to do.
pub type HostCallHandler = Arc<
    dyn Fn(&CallerContext, &str, &str, &str, &[u8]) -> Result<Vec<u8>, Box<dyn Error + Send + Sync>>
        + Send
        + Sync,
>;

/// A host-call handler that accepts everything and returns empty bytes.
///
/// Useful for hosts that load guests which never call back, and for tests.
pub fn no_op_host_call() -> HostCallHandler {
    Arc::new(|_ctx, _binding, _namespace, _operation, _payload| Ok(Vec::new()))
}

/// Per-module configuration: output sinks and the host-call handler.
///
/// All options default to absent. An absent `host_call_handler` behaves like
/// a handler that always fails, so guests that perform host calls against an
/// unconfigured module see `__host_call` return 0.
///
/// # Example
///
/// ```
/// use wapc_runtime_core::ModuleConfig;
///
/// let config = ModuleConfig::new()
///     .with_console_logger(|msg| println!("guest: {msg}"))
///     .with_host_call_handler(|_ctx, _bd, _ns, _op, payload| Ok(payload.to_vec()));
/// ```
#[derive(Clone, Default)]
pub struct ModuleConfig {
    /// Sink for each `__console_log` call.
    pub console_logger: Option<Logger>,

    /// Sink for WASI `fd_write` output to fd 1.
    pub stdout_writer: Option<Logger>,

    /// Sink for WASI `fd_write` output to fd 2.
    pub stderr_writer: Option<Logger>,

    /// Handler for guest-initiated host calls.
    pub host_call_handler: Option<HostCallHandler>,
}

impl ModuleConfig {
    /// Create a configuration with no sinks and no handler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the sink for `__console_log` messages.
    pub fn with_console_logger(mut self, logger: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.console_logger = Some(Arc::new(logger));
        self
    }

    /// Set the sink for WASI standard output.
    pub fn with_stdout_writer(mut self, writer: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.stdout_writer = Some(Arc::new(writer));
        self
    }

    /// Set the sink for WASI standard error.
    pub fn with_stderr_writer(mut self, writer: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.stderr_writer = Some(Arc::new(writer));
        self
    }

    /// Set the host-call handler.
    pub fn with_host_call_handler(
        mut self,
        handler: impl Fn(&CallerContext, &str, &str, &str, &[u8]) -> Result<Vec<u8>, Box<dyn Error + Send + Sync>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.host_call_handler = Some(Arc::new(handler));
        self
    }
}

impl std::fmt::Debug for ModuleConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleConfig")
            .field("console_logger", &self.console_logger.is_some())
            .field("stdout_writer", &self.stdout_writer.is_some())
            .field("stderr_writer", &self.stderr_writer.is_some())
            .field("host_call_handler", &self.host_call_handler.is_some())
            .finish()
    }
}

/// A named strategy that compiles guest bytes into modules.
pub trait WapcEngine: Send + Sync {
    /// Identifies the backend, e.g. `"wasmtime"`.
    fn name(&self) -> &str;

    /// Compile `code` into a module bound to `config`.
    ///
    /// # Errors
    ///
    /// Returns [`WapcError::BadModule`] when the bytes fail validation or
    /// compilation, or [`WapcError::Engine`] for engine-level resource
    /// failures.
    fn new_module(
        &self,
        code: &[u8],
        config: ModuleConfig,
    ) -> Result<Arc<dyn WapcModule>, WapcError>;
}

/// A compiled module: a factory for instances.
///
/// The compiled program is immutable; `instantiate` may be called from
/// multiple threads. A module may be closed only after all of its instances
/// are closed, or the engine may trap during finalization.
pub trait WapcModule: Send + Sync {
    /// Create a fresh instance with its own linear memory.
    ///
    /// Binds the full waPC import surface, resolves the guest's required
    /// exports, and runs `_start` / `wapc_init` (each exactly once, in that
    /// order) if the guest exports them.
    ///
    /// # Errors
    ///
    /// [`WapcError::ModuleClosed`] after `close`; [`WapcError::BadExport`]
    /// when `__guest_call` is missing; [`WapcError::InitFailed`] when an
    /// init export traps.
    fn instantiate(&self, ctx: &CallerContext) -> Result<Arc<dyn WapcInstance>, WapcError>;

    /// Close the module. Idempotent; further `instantiate` calls fail.
    fn close(&self);
}

/// One execution context of a module.
///
/// An instance runs at most one guest call at a time; parallel threads must
/// use distinct instances (see [`crate::InstancePool`]).
pub trait WapcInstance: Send + Sync {
    /// Invoke `operation` with `payload` and return the guest's response.
    ///
    /// # Errors
    ///
    /// [`WapcError::InstanceClosed`] after `close`; [`WapcError::GuestError`]
    /// when the guest signalled an error; [`WapcError::GuestUnsuccessful`]
    /// when the guest returned 0 silently; [`WapcError::GuestTrap`] /
    /// [`WapcError::HostAbiViolation`] when the call aborted.
    fn invoke(
        &self,
        ctx: &CallerContext,
        operation: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, WapcError>;

    /// Current size of the instance's linear memory, in bytes.
    fn memory_size(&self) -> u32;

    /// Close the instance. Idempotent; releases engine-level resources.
    fn close(&self);
}
