//! Bootstrap configuration loading
//!
//! Configuration file resolution order:
//! 1. Command-line argument (highest priority)
//! 2. `VIGIL_CONFIG` environment variable
//! 3. Platform config directory (`~/.config/vigil/vigil.toml` on Linux)
//! 4. Compiled defaults (fallback)
//!
//! A missing file at step 3 is not fatal: a warning is logged and compiled
//! defaults are used. A file named explicitly (steps 1-2) must exist.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "VIGIL_CONFIG";

/// Top-level TOML document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub resolver: ResolverConfig,
    pub quota: QuotaConfig,
    pub alerts: AlertsConfig,
    pub digest: DigestConfig,
    /// SMS provider; channel is reported as skipped when absent
    pub sms: Option<SmsConfig>,
    /// Push provider; channel is reported as skipped when absent
    pub push: Option<PushConfig>,
    /// Transactional email provider used by the weekly digest
    pub email: Option<EmailConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 5730,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file; defaults to the platform data directory
    pub path: Option<PathBuf>,
}

impl DatabaseConfig {
    pub fn resolved_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(default_database_path)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error); `RUST_LOG` overrides
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// External recognition service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub base_url: String,
    /// Lowest-priority credential source (database and env take precedence)
    pub api_key: Option<String>,
    /// Hard deadline for the whole submit call, retries included
    pub submit_timeout_ms: u64,
    /// Time the resolver may spend before answering with a pending job;
    /// kept below `submit_timeout_ms` so a slow job degrades to polling
    pub submit_wait_ms: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub max_redirects: u32,
    pub requests_per_second: u32,
    pub poll_deadline_secs: u64,
    pub poll_initial_delay_ms: u64,
    pub poll_max_delay_ms: u64,
    /// Largest accepted raw image upload
    pub max_image_bytes: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8600".to_string(),
            api_key: None,
            submit_timeout_ms: 8_000,
            submit_wait_ms: 5_000,
            max_retries: 3,
            retry_base_delay_ms: 250,
            max_redirects: 3,
            requests_per_second: 10,
            poll_deadline_secs: 120,
            poll_initial_delay_ms: 5_000,
            poll_max_delay_ms: 30_000,
            max_image_bytes: 8 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Scans allowed per account per UTC day
    pub daily_limit: i64,
    /// Usage percentage at which a warning is emitted
    pub warn_percent: i64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            daily_limit: 14_400,
            warn_percent: 80,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    /// Maximum webhook deliveries in flight for one alert
    pub webhook_concurrency: usize,
    pub webhook_timeout_ms: u64,
    pub push_timeout_ms: u64,
    pub sms_timeout_ms: u64,
    /// Alerts being dispatched at once; further alerts wait in their queue
    pub max_concurrent_dispatches: usize,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            webhook_concurrency: 8,
            webhook_timeout_ms: 5_000,
            push_timeout_ms: 10_000,
            sms_timeout_ms: 10_000,
            max_concurrent_dispatches: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DigestConfig {
    pub enabled: bool,
    pub interval_hours: u64,
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub send_timeout_ms: u64,
    /// Link target embedded in digests; the unsubscribe token is appended
    pub unsubscribe_base_url: String,
}

impl Default for DigestConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_hours: 24 * 7,
            max_attempts: 3,
            retry_base_delay_ms: 1_000,
            send_timeout_ms: 15_000,
            unsubscribe_base_url: "https://vigil.invalid/unsubscribe".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsConfig {
    pub base_url: String,
    pub api_key: String,
    /// Sender number (E.164)
    pub from: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    pub base_url: String,
    /// Endpoint exchanging client credentials for a session token
    pub auth_url: String,
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    pub base_url: String,
    pub api_key: String,
    pub from: String,
}

impl TomlConfig {
    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))
    }

    /// Load from an explicit file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Read config {} failed: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Resolve and load configuration following the documented priority order
    ///
    /// Returns the config and the file it came from (None for compiled defaults).
    pub fn load(cli_path: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = cli_path {
            info!("Loading config from command line: {}", path.display());
            return Ok((Self::from_file(path)?, Some(path.to_path_buf())));
        }

        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            let path = PathBuf::from(path);
            info!("Loading config from {}: {}", CONFIG_ENV_VAR, path.display());
            return Ok((Self::from_file(&path)?, Some(path)));
        }

        match default_config_path() {
            Some(path) if path.exists() => {
                info!("Loading config from {}", path.display());
                Ok((Self::from_file(&path)?, Some(path)))
            }
            _ => {
                warn!("No config file found, using compiled defaults");
                Ok((Self::default(), None))
            }
        }
    }
}

/// Platform config file location
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("vigil").join("vigil.toml"))
}

/// OS-dependent default database location
fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("vigil"))
        .unwrap_or_else(|| PathBuf::from("./vigil_data"))
        .join("vigil.db")
}
