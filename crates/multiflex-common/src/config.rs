//! Configuration types for Multiflex
//!
//! This module defines configuration structures used by the store and the CLI.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Root configuration for Multiflex
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Store configuration
    #[serde(default)]
    pub store: StoreConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Store configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Page cache size of the backing engine in bytes (default: 16 MB)
    pub cache_size_bytes: usize,
    /// Create missing parent directories when opening writable
    pub create_parent_dirs: bool,
    /// Maximum number of cached descriptors (0 = unbounded)
    pub descriptor_cache_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cache_size_bytes: 16 * 1024 * 1024, // 16 MB
            create_parent_dirs: true,
            descriptor_cache_capacity: 1024,
        }
    }
}

impl StoreConfig {
    /// Reject settings the backing engine cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.cache_size_bytes == 0 {
            return Err(Error::Configuration(
                "store.cache_size_bytes must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default log filter (overridden by `RUST_LOG`)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}
