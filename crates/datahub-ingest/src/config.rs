//! Runtime configuration for the ingest worker

use datahub_common::{DatahubError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default BPstat API base URL.
pub const DEFAULT_API_URL: &str = "https://bpstat.bportugal.pt/data/v1";

/// Default response language for category labels.
pub const DEFAULT_API_LANG: &str = "PT";

/// Default User-Agent sent with every request.
pub const DEFAULT_USER_AGENT: &str = "datahub-ingest/0.1 (statistical data worker)";

/// Default metadata lookup timeout in seconds.
pub const DEFAULT_METADATA_TIMEOUT_SECS: u64 = 60;

/// Default dataset fetch timeout in seconds.
pub const DEFAULT_DATA_TIMEOUT_SECS: u64 = 90;

/// Default cap on concurrent fetch units per group.
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;

/// Default SQLite database path.
pub const DEFAULT_DB_PATH: &str = "./data/datahub.db";

/// Default snapshot archive directory.
pub const DEFAULT_SNAPSHOT_DIR: &str = "./data/datalake";

/// Default source label written into snapshots.
pub const DEFAULT_SOURCE_LABEL: &str = "BPstat (Banco de Portugal)";

/// Default series catalog location.
pub const DEFAULT_CATALOG_PATH: &str = "./config/catalog.toml";

/// Ingest worker configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestConfig {
    pub api_url: String,
    pub api_lang: String,
    pub user_agent: String,
    pub metadata_timeout_secs: u64,
    pub data_timeout_secs: u64,
    pub max_concurrency: usize,
    /// Opaque store location handed to SQLite
    pub db_path: String,
    pub snapshot_dir: PathBuf,
    pub source_label: String,
    pub catalog_path: PathBuf,
}

impl IngestConfig {
    /// Load `.env` (if any), then read configuration from the environment
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_env()
    }

    /// Read configuration from `DATAHUB_*` environment variables
    pub fn from_env() -> Result<Self> {
        let config = Self {
            api_url: env_or("DATAHUB_API_URL", DEFAULT_API_URL),
            api_lang: env_or("DATAHUB_API_LANG", DEFAULT_API_LANG),
            user_agent: env_or("DATAHUB_USER_AGENT", DEFAULT_USER_AGENT),
            metadata_timeout_secs: env_parse(
                "DATAHUB_METADATA_TIMEOUT_SECS",
                DEFAULT_METADATA_TIMEOUT_SECS,
            )?,
            data_timeout_secs: env_parse("DATAHUB_DATA_TIMEOUT_SECS", DEFAULT_DATA_TIMEOUT_SECS)?,
            max_concurrency: env_parse("DATAHUB_MAX_CONCURRENCY", DEFAULT_MAX_CONCURRENCY)?,
            db_path: env_or("DATAHUB_DB_PATH", DEFAULT_DB_PATH),
            snapshot_dir: PathBuf::from(env_or("DATAHUB_SNAPSHOT_DIR", DEFAULT_SNAPSHOT_DIR)),
            source_label: env_or("DATAHUB_SOURCE_LABEL", DEFAULT_SOURCE_LABEL),
            catalog_path: PathBuf::from(env_or("DATAHUB_CATALOG_PATH", DEFAULT_CATALOG_PATH)),
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !(self.api_url.starts_with("http://") || self.api_url.starts_with("https://")) {
            return Err(DatahubError::config(format!(
                "API URL must start with http:// or https://, got '{}'",
                self.api_url
            )));
        }

        if self.api_lang.trim().is_empty() {
            return Err(DatahubError::config("API language cannot be empty"));
        }

        if self.user_agent.trim().is_empty() {
            return Err(DatahubError::config("User-Agent cannot be empty"));
        }

        if self.metadata_timeout_secs == 0 || self.data_timeout_secs == 0 {
            return Err(DatahubError::config("Request timeouts must be greater than 0"));
        }

        if self.max_concurrency == 0 {
            return Err(DatahubError::config("max_concurrency must be greater than 0"));
        }

        if self.db_path.trim().is_empty() {
            return Err(DatahubError::config("Database path cannot be empty"));
        }

        Ok(())
    }

    /// API base URL without a trailing slash
    pub fn base_url(&self) -> &str {
        self.api_url.trim_end_matches('/')
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata_timeout_secs)
    }

    pub fn data_timeout(&self) -> Duration {
        Duration::from_secs(self.data_timeout_secs)
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            api_lang: DEFAULT_API_LANG.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            metadata_timeout_secs: DEFAULT_METADATA_TIMEOUT_SECS,
            data_timeout_secs: DEFAULT_DATA_TIMEOUT_SECS,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            db_path: DEFAULT_DB_PATH.to_string(),
            snapshot_dir: PathBuf::from(DEFAULT_SNAPSHOT_DIR),
            source_label: DEFAULT_SOURCE_LABEL.to_string(),
            catalog_path: PathBuf::from(DEFAULT_CATALOG_PATH),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| DatahubError::config(format!("{key} has an invalid value '{raw}'"))),
        Err(_) => Ok(default),
    }
}
