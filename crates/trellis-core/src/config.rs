//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/trellis/config.toml)
//! 3. Environment variables (TRELLIS_* prefix)
//!
//! Environment variables take precedence over config file values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable prefix
const ENV_PREFIX: &str = "TRELLIS";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the server collaborator (HTTP endpoints)
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// WebSocket URL for the change channel; derived from `server_url`
    /// when not set
    #[serde(default)]
    pub channel_url: Option<String>,

    /// Surface processing errors instead of reloading the application
    #[serde(default)]
    pub debug_sync: bool,

    /// Wall-clock budget for applying one change batch, in seconds
    #[serde(default = "default_apply_timeout_secs")]
    pub apply_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            channel_url: None,
            debug_sync: false,
            apply_timeout_secs: default_apply_timeout_secs(),
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (TRELLIS_SERVER_URL, TRELLIS_CHANNEL_URL, TRELLIS_DEBUG_SYNC)
    /// 2. Config file (~/.config/trellis/config.toml or TRELLIS_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
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
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var(format!("{}_SERVER_URL", ENV_PREFIX)) {
            if !val.is_empty() {
                self.server_url = val;
            }
        }

        if let Ok(val) = std::env::var(format!("{}_CHANNEL_URL", ENV_PREFIX)) {
            self.channel_url = if val.is_empty() { None } else { Some(val) };
        }

        if let Ok(val) = std::env::var(format!("{}_DEBUG_SYNC", ENV_PREFIX)) {
            self.debug_sync = val.eq_ignore_ascii_case("true") || val == "1";
        }
    }

    /// Get the config file path
    ///
    /// Can be overridden with TRELLIS_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("trellis")
            .join("config.toml")
    }

    /// WebSocket URL for the change channel
    ///
    /// Defaults to the server URL with the scheme switched to ws(s) and
    /// `/channel` appended.
    pub fn channel_url(&self) -> String {
        if let Some(ref url) = self.channel_url {
            return url.clone();
        }

        let base = self
            .server_url
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!("{}/channel", base.trim_end_matches('/'))
    }

    /// Wall-clock budget for applying one change batch
    pub fn apply_timeout(&self) -> Duration {
        Duration::from_secs(self.apply_timeout_secs)
    }
}

fn default_server_url() -> String {
    "http://localhost:37840".to_string()
}

fn default_apply_timeout_secs() -> u64 {
    30
}
