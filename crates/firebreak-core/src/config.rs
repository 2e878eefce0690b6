//! Embedder-facing configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::pool::PoolConfig;
use crate::runner::VmConfig;
use crate::runner::firecracker::FirecrackerConfig;

/// Full host configuration: base machine shape, pool sizing, and the
/// hypervisor backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FirebreakConfig {
    /// Base machine configuration profiles are applied onto.
    pub vm: VmConfig,
    /// Defaults for every pool.
    pub pool: PoolConfig,
    /// Hypervisor backend settings.
    pub firecracker: FirecrackerConfig,
}

impl FirebreakConfig {
    /// Load configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the file cannot be read or
    /// parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        serde_json::from_slice(&raw).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            source: e,
        })
    }
}

/// Configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read config {path}: {source}")]
    Read {
        /// Offending path.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The file is not valid configuration JSON.
    #[error("cannot parse config {path}: {source}")]
    Parse {
        /// Offending path.
        path: String,
        /// Underlying parse error.
        source: serde_json::Error,
    },
}
