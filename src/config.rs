//! Server configuration loaded with Figment.
//!
//! Configuration is merged from two providers, highest precedence first:
//! 1. Environment variables with the `TAGGER_RPC_` prefix
//! 2. A TOML file (default `tagger-rpc.toml`)
//!
//! ```text
//! TAGGER_RPC_SERVER_PORT=24000
//! TAGGER_RPC_LOG_FILTER=debug
//! TAGGER_RPC_SESSION_TIMEOUT_SECS=600
//! ```

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE: &str = "tagger-rpc.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration load error: {0}")]
    Load(#[from] figment::Error),
    #[error("configuration validation error: {0}")]
    Validation(String),
}

/// Top-level server settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub log: LogSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Listen address.
    #[serde(default = "default_host")]
    pub host: String,
    /// Listen port.
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Idle time after which a session is expired and its resources freed.
    #[serde(default = "default_session_timeout")]
    pub timeout_secs: u64,
    /// How often the expiry sweeper runs.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    /// Tracing env-filter directive, e.g. "info" or "tagger_rpc=debug".
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    23000
}

fn default_session_timeout() -> u64 {
    300
}

fn default_sweep_interval() -> u64 {
    10
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_session_timeout(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

impl Settings {
    /// Load settings from the default config file and environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load settings from a specific TOML file, then apply `TAGGER_RPC_`
    /// environment overrides. A missing file falls back to defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let settings: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("TAGGER_RPC_").split("_"))
            .extract()
            .map_err(ConfigError::Load)?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.host.is_empty() {
            return Err(ConfigError::Validation(
                "server.host cannot be empty".to_string(),
            ));
        }
        if self.session.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "session.timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.session.sweep_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "session.sweep_interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session.timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.session.sweep_interval_secs)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
