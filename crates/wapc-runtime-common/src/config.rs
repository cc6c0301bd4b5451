//! Configuration structures for the waPC runtime.
//!
//! This module defines the settings consumed by the reference driver and the
//! Wasmtime engine binding:
//! - [`RuntimeConfig`]: top-level configuration containing all settings
//! - [`EngineSettings`]: engine knobs (optimization, optional fuel metering)
//! - [`PoolSettings`]: instance pool sizing and checkout timeout
//!
//! Per-module callback configuration (console logger, stdout/stderr writers,
//! host-call handler) is a runtime object, not file configuration; see the
//! core crate's `ModuleConfig`.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::WapcError;

/// Top-level runtime configuration.
///
/// Can be loaded from a TOML file via [`RuntimeConfig::from_file`] or built
/// programmatically; every field has a sensible default.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Engine settings.
    #[serde(default)]
    pub engine: EngineSettings,

    /// Instance pool settings.
    #[serde(default)]
    pub pool: PoolSettings,
}

/// Engine settings.
///
/// These knobs are engine-specific diagnostics and tuning, not part of the
/// waPC contract. Fuel metering in particular bounds guest CPU consumption
/// when the backing engine supports instruction counting.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineSettings {
    /// Optimize compiled code for speed rather than compile time.
    #[serde(default = "defaults::optimize")]
    pub optimize: bool,

    /// Optional instruction-count budget per instance.
    ///
    /// `None` disables metering entirely.
    #[serde(default)]
    pub fuel: Option<u64>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            optimize: defaults::optimize(),
            fuel: None,
        }
    }
}

/// Instance pool settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolSettings {
    /// Number of pre-instantiated instances held by the pool.
    #[serde(default = "defaults::pool_size")]
    pub size: u32,

    /// Checkout timeout in milliseconds for `Pool::get`.
    #[serde(default = "defaults::get_timeout_ms")]
    pub get_timeout_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            size: defaults::pool_size(),
            get_timeout_ms: defaults::get_timeout_ms(),
        }
    }
}

impl PoolSettings {
    /// Get the checkout timeout as a `Duration`.
    pub fn get_timeout(&self) -> Duration {
        Duration::from_millis(self.get_timeout_ms)
    }
}

/// Errors produced while loading a configuration file.
#[derive(Error, Debug)]
pub enum ConfigFileError {
    /// The file could not be read.
    #[error("cannot read config file {path}: {source}")]
    Io {
        /// Path that failed to load.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The file contents are not valid TOML for [`RuntimeConfig`].
    #[error("cannot parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

impl From<ConfigFileError> for WapcError {
    fn from(err: ConfigFileError) -> Self {
        WapcError::config(err.to_string())
    }
}

impl RuntimeConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let content =
            std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigFileError::Io {
                path: path.as_ref().display().to_string(),
                source: e,
            })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        Ok(toml::from_str(content)?)
    }
}

/// Default value functions for serde.
mod defaults {
    pub const fn optimize() -> bool {
        true
    }

    pub const fn pool_size() -> u32 {
        10
    }

    pub const fn get_timeout_ms() -> u64 {
        100
    }
}
