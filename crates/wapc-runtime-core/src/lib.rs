//! Engine-independent core of the waPC host runtime.
//!
//! This crate defines the contract every engine binding implements:
//! - [`WapcEngine`] / [`WapcModule`] / [`WapcInstance`]: the three-trait seam
//!   between the waPC protocol layer and a WebAssembly engine
//! - [`ModuleConfig`]: per-module sinks and the host-call handler
//! - [`CallerContext`] / [`InvocationContext`]: per-caller token and per-call
//!   scratchpad
//! - [`InstancePool`]: bounded blocking checkout of reusable instances
//!
//! # Architecture
//!
//! ```text
//! caller ──► WapcInstance::invoke(op, payload)
//!              │  writes op + payload into the InvocationContext slot
//!              ▼
//!          __guest_call(op_len, payload_len)          (guest export)
//!              │  guest pulls the request, may reenter the host via
//!              │  __host_call, pushes a response or an error
//!              ▼
//!          InvocationContext ──► bytes | GuestError | GuestUnsuccessful
//! ```

pub mod context;
pub mod engine;
pub mod pool;

pub use context::{CallerContext, InvocationContext};
pub use engine::{
    no_op_host_call, HostCallHandler, Logger, ModuleConfig, WapcEngine, WapcInstance, WapcModule,
};
pub use pool::{InstanceInitializer, InstancePool};
