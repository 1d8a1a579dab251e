//! Store configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/docrepo/config.toml)
//! 3. Environment variables (DOCREPO_* prefix)
//!
//! Environment variables take precedence over config file values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::store::StoreOptions;

/// Environment variable prefix
const ENV_PREFIX: &str = "DOCREPO";

/// Connection settings for a [`Store`](crate::Store)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Connection URI (`mongodb://...`, `mongodb+srv://...` or `memory://...`)
    #[serde(default = "default_uri")]
    pub uri: String,

    /// Logical database name
    #[serde(default = "default_database")]
    pub database: String,

    /// Seconds allowed for connecting and the liveness check
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Whether to ping the store while opening
    #[serde(default = "default_use_ping")]
    pub use_ping: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            uri: default_uri(),
            database: default_database(),
            timeout_secs: default_timeout_secs(),
            use_ping: default_use_ping(),
        }
    }
}

impl StoreConfig {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (DOCREPO_URI, DOCREPO_DATABASE,
    ///    DOCREPO_TIMEOUT_SECS, DOCREPO_USE_PING)
    /// 2. Config file (~/.config/docrepo/config.toml or DOCREPO_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: StoreConfig =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var(format!("{}_URI", ENV_PREFIX)) {
            if !val.is_empty() {
                self.uri = val;
            }
        }

        if let Ok(val) = std::env::var(format!("{}_DATABASE", ENV_PREFIX)) {
            if !val.is_empty() {
                self.database = val;
            }
        }

        if let Ok(val) = std::env::var(format!("{}_TIMEOUT_SECS", ENV_PREFIX)) {
            match val.parse::<u64>() {
                Ok(secs) => self.timeout_secs = secs,
                Err(_) => warn!("Ignoring invalid {}_TIMEOUT_SECS: {:?}", ENV_PREFIX, val),
            }
        }

        if let Ok(val) = std::env::var(format!("{}_USE_PING", ENV_PREFIX)) {
            self.use_ping = val.eq_ignore_ascii_case("true") || val == "1";
        }
    }

    /// Write configuration to a file, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with DOCREPO_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("docrepo")
            .join("config.toml")
    }

    /// Connection timeout as a duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Options for [`Store::open`](crate::Store::open)
    ///
    /// A zero timeout keeps the default, like any non-positive timeout.
    pub fn to_options(&self) -> StoreOptions {
        StoreOptions::new()
            .with_timeout(self.timeout())
            .with_use_ping(self.use_ping)
    }
}

fn default_uri() -> String {
    "memory://default".to_string()
}

fn default_database() -> String {
    "app".to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_use_ping() -> bool {
    true
}
