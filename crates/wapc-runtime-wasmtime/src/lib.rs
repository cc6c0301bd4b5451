//! Wasmtime binding for the waPC host runtime.
//!
//! This crate implements the engine-independent contract from
//! `wapc-runtime-core` on top of Wasmtime:
//! - [`WasmtimeEngine`]: named engine; compiles guest bytes into modules
//! - [`WasmtimeModule`]: compiled program + shared sinks/handler; instance
//!   factory
//! - [`WasmtimeInstance`]: one execution context with its own linear memory
//! - [`linker`]: the nine `wapc.*` host functions and `env.abort`
//! - [`wasi`]: the minimal WASI preview-1 stub shim
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    WasmtimeEngine                       │
//! │  (shared, thread-safe, compiles bytes → modules)        │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                    WasmtimeModule                       │
//! │  (immutable compiled program + ModuleConfig)            │
//! └─────────────────────────────────────────────────────────┘
//!                            │ instantiate
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │          WasmtimeInstance / Store<GuestState>           │
//! │  (own linear memory, one invocation context slot,       │
//! │   one guest call in flight at a time)                   │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod engine;
pub mod instance;
pub mod linker;
pub mod module;
pub mod wasi;

pub use engine::WasmtimeEngine;
pub use instance::WasmtimeInstance;
pub use linker::GuestState;
pub use module::WasmtimeModule;
