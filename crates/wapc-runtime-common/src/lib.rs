//! Common types, errors, and configuration for the waPC runtime workspace.
//!
//! This crate provides shared functionality used across the workspace:
//! - [`WapcError`]: the runtime error taxonomy, built with `thiserror`
//! - [`RuntimeConfig`]: serde configuration structures with TOML loading

pub mod config;
pub mod error;

pub use config::{ConfigFileError, EngineSettings, PoolSettings, RuntimeConfig};
pub use error::WapcError;
