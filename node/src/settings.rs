//! Node configuration: TOML file, then `PAYID_*` environment, then CLI flags.

use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use config::{Config, Environment, File as ConfigFile};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Sled,
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => f.write_str("memory"),
            Self::Sled => f.write_str("sled"),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    // Admin API
    pub api_host: String,
    pub api_port: u16,

    // Storage
    pub storage_backend: StorageBackend,
    pub db_path: String,
    pub storage_timeout_ms: u64,

    // Logging
    pub log_level: String,
    pub log_format: String,

    // Observability
    pub prometheus_enabled: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            config_path: None,
            api_host: "127.0.0.1".to_string(),
            api_port: 8081,
            storage_backend: StorageBackend::Memory,
            db_path: "./data/payid".to_string(),
            storage_timeout_ms: 5_000,
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            prometheus_enabled: true,
        }
    }
}

impl AppConfig {
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = config_path {
            if !path.exists() {
                bail!(
                    "Configuration file {} not found (specified via --config)",
                    path.display()
                );
            }
            builder = builder.add_source(ConfigFile::from(path));
        }

        builder = builder.add_source(Environment::with_prefix("PAYID").try_parsing(true));

        let mut config: AppConfig = builder
            .build()?
            .try_deserialize()
            .context("invalid payid-node configuration")?;
        config.config_path = config_path.map(Path::to_path_buf);
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.api_host.trim().is_empty() {
            bail!("API_HOST must not be empty");
        }
        if self.api_port == 0 {
            bail!("API_PORT must be greater than zero");
        }
        if self.storage_backend == StorageBackend::Sled && self.db_path.trim().is_empty() {
            bail!("DB_PATH must not be empty when using the sled backend");
        }
        if self.storage_timeout_ms == 0 {
            bail!("STORAGE_TIMEOUT_MS must be greater than zero");
        }
        if !matches!(self.log_format.as_str(), "pretty" | "compact") {
            bail!("LOG_FORMAT must be either 'pretty' or 'compact'");
        }
        Ok(())
    }

    pub fn api_addr(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }

    pub fn storage_timeout(&self) -> Duration {
        Duration::from_millis(self.storage_timeout_ms)
    }
}
