//! Error types for the waPC runtime.
//!
//! This module defines [`WapcError`], the single error type surfaced at the
//! `invoke` / `instantiate` / `get` boundaries, using `thiserror`.
//!
//! Host-call handler failures are deliberately *not* part of this taxonomy:
//! they are recorded in the invocation context, observed by the guest through
//! `__host_error`, and only become a [`WapcError::GuestError`] if the guest
//! decides to convert them.

use thiserror::Error;

/// Errors surfaced by the waPC runtime.
#[derive(Error, Debug)]
pub enum WapcError {
    /// The guest bytes failed validation or compilation.
    #[error("invalid module: {reason}")]
    BadModule {
        /// Description of the compilation failure.
        reason: String,
    },

    /// A required guest export is missing.
    #[error("guest module does not export '{export}'")]
    BadExport {
        /// The name of the missing export.
        export: String,
    },

    /// `_start` or `wapc_init` trapped during instantiation.
    #[error("could not initialize instance: {reason}")]
    InitFailed {
        /// Description of the initialization failure.
        reason: String,
    },

    /// The module has been closed; no further instantiation is possible.
    #[error("cannot instantiate when a module is closed")]
    ModuleClosed,

    /// The instance has been closed; no further invocation is possible.
    #[error("error invoking guest with closed instance")]
    InstanceClosed,

    /// The guest signalled a domain error via `__guest_error`.
    #[error("{message}")]
    GuestError {
        /// The UTF-8 error message the guest wrote.
        message: String,
    },

    /// The guest returned 0 from `__guest_call` without writing an error.
    #[error("call to {operation:?} was unsuccessful")]
    GuestUnsuccessful {
        /// The operation that the guest did not handle.
        operation: String,
    },

    /// An engine-level trap occurred during `__guest_call`.
    #[error("error invoking guest: {reason}")]
    GuestTrap {
        /// Description of the trap.
        reason: String,
    },

    /// The guest passed an out-of-range pointer or length to a host import.
    #[error("guest violated the waPC ABI: {reason}")]
    HostAbiViolation {
        /// Description of the offending access.
        reason: String,
    },

    /// `Pool::get` timed out waiting for an available instance.
    #[error("get from pool timed out")]
    PoolTimeout,

    /// An instance was offered to a pool that is already at capacity.
    #[error("cannot return instance to full pool")]
    PoolFull,

    /// The pool has been closed.
    #[error("pool has been disposed")]
    PoolDisposed,

    /// Opaque engine-level resource failure.
    #[error("engine error: {reason}")]
    Engine {
        /// Description of the engine failure.
        reason: String,
    },

    /// Invalid runtime configuration.
    #[error("invalid configuration: {reason}")]
    Config {
        /// Description of the configuration error.
        reason: String,
    },
}

impl WapcError {
    /// Create a new `BadModule` error.
    pub fn bad_module(reason: impl Into<String>) -> Self {
        Self::BadModule {
            reason: reason.into(),
        }
    }

    /// Create a new `BadExport` error.
    pub fn bad_export(export: impl Into<String>) -> Self {
        Self::BadExport {
            export: export.into(),
        }
    }

    /// Create a new `InitFailed` error.
    pub fn init_failed(reason: impl Into<String>) -> Self {
        Self::InitFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `GuestError` error.
    pub fn guest_error(message: impl Into<String>) -> Self {
        Self::GuestError {
            message: message.into(),
        }
    }

    /// Create a new `GuestUnsuccessful` error.
    pub fn guest_unsuccessful(operation: impl Into<String>) -> Self {
        Self::GuestUnsuccessful {
            operation: operation.into(),
        }
    }

    /// Create a new `GuestTrap` error.
    pub fn guest_trap(reason: impl Into<String>) -> Self {
        Self::GuestTrap {
            reason: reason.into(),
        }
    }

    /// Create a new `HostAbiViolation` error.
    pub fn abi_violation(reason: impl Into<String>) -> Self {
        Self::HostAbiViolation {
            reason: reason.into(),
        }
    }

    /// Create a new `Engine` error.
    pub fn engine(reason: impl Into<String>) -> Self {
        Self::Engine {
            reason: reason.into(),
        }
    }

    /// Create a new `Config` error.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Returns `true` if this error came from a closed module or instance.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::ModuleClosed | Self::InstanceClosed)
    }

    /// Returns `true` if this error was signalled by the guest itself.
    pub fn is_guest_failure(&self) -> bool {
        matches!(
            self,
            Self::GuestError { .. } | Self::GuestUnsuccessful { .. } | Self::GuestTrap { .. }
        )
    }

    /// Returns `true` if this error came from the instance pool.
    pub fn is_pool_failure(&self) -> bool {
        matches!(self, Self::PoolTimeout | Self::PoolFull | Self::PoolDisposed)
    }
}
