//! Configuration loader and validator for the Notion mirror.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub notion: Notion,
    pub storage: Storage,
}

/// App-level settings: where state lives and how hard the run pushes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub page_concurrency: usize,
    pub asset_concurrency: usize,
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub max_backoff_seconds: u64,
    pub http_timeout_seconds: u64,
    #[serde(default = "default_edit_granularity")]
    pub edit_granularity_seconds: i64,
    #[serde(default = "default_max_download_mb")]
    pub max_download_mb: u64,
}

/// Notion API settings and the collection to mirror.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notion {
    pub token: String,
    pub version: String,
    pub database_id: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

/// Durable object storage backend for rehosted media.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Storage {
    Local {
        root: String,
        public_base_url: String,
    },
    Http {
        endpoint: String,
        bucket: String,
        token: String,
        public_base_url: String,
    },
}

fn default_edit_granularity() -> i64 {
    60
}

fn default_max_download_mb() -> u64 {
    200
}

fn default_page_size() -> u32 {
    100
}

impl App {
    /// `data_dir` with a leading `~/` expanded against `$HOME`.
    pub fn resolved_data_dir(&self) -> String {
        expand_home(&self.data_dir)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_secs(self.max_backoff_seconds),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_seconds)
    }

    pub fn max_download_bytes(&self) -> u64 {
        self.max_download_mb.saturating_mul(1024 * 1024)
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_data_dir())
    }

    /// `DATABASE_URL` if set, otherwise a SQLite file inside the data dir.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/mirror.db", self.app.resolved_data_dir()))
    }
}

pub(crate) fn expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{}/{}", home.trim_end_matches('/'), rest);
        }
    }
    path.to_string()
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.page_concurrency == 0 {
        return Err(ConfigError::Invalid("app.page_concurrency must be > 0"));
    }
    if cfg.app.asset_concurrency == 0 {
        return Err(ConfigError::Invalid("app.asset_concurrency must be > 0"));
    }
    if cfg.app.max_attempts == 0 {
        return Err(ConfigError::Invalid("app.max_attempts must be > 0"));
    }
    if cfg.app.http_timeout_seconds == 0 {
        return Err(ConfigError::Invalid("app.http_timeout_seconds must be > 0"));
    }
    if cfg.app.max_download_mb == 0 {
        return Err(ConfigError::Invalid("app.max_download_mb must be > 0"));
    }
    if cfg.app.edit_granularity_seconds < 0 {
        return Err(ConfigError::Invalid("app.edit_granularity_seconds must be >= 0"));
    }

    if cfg.notion.token.trim().is_empty() {
        return Err(ConfigError::Invalid("notion.token must be non-empty"));
    }
    if cfg.notion.version.trim().is_empty() {
        return Err(ConfigError::Invalid("notion.version must be non-empty"));
    }
    if cfg.notion.database_id.trim().is_empty() {
        return Err(ConfigError::Invalid("notion.database_id must be non-empty"));
    }
    // Notion rejects page_size outside 1..=100.
    if cfg.notion.page_size == 0 || cfg.notion.page_size > 100 {
        return Err(ConfigError::Invalid("notion.page_size must be within 1..=100"));
    }

    match &cfg.storage {
        Storage::Local {
            root,
            public_base_url,
        } => {
            if root.trim().is_empty() {
                return Err(ConfigError::Invalid("storage.root must be non-empty"));
            }
            if public_base_url.trim().is_empty() {
                return Err(ConfigError::Invalid("storage.public_base_url must be non-empty"));
            }
        }
        Storage::Http {
            endpoint,
            bucket,
            token,
            public_base_url,
        } => {
            if endpoint.trim().is_empty() {
                return Err(ConfigError::Invalid("storage.endpoint must be non-empty"));
            }
            if bucket.trim().is_empty() {
                return Err(ConfigError::Invalid("storage.bucket must be non-empty"));
            }
            if token.trim().is_empty() {
                return Err(ConfigError::Invalid("storage.token must be non-empty"));
            }
            if public_base_url.trim().is_empty() {
                return Err(ConfigError::Invalid("storage.public_base_url must be non-empty"));
            }
        }
    }

    Ok(())
}

/// Returns the example YAML content shipped with the project.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  page_concurrency: 4
  asset_concurrency: 2
  max_attempts: 3
  retry_base_delay_ms: 500
  max_backoff_seconds: 30
  http_timeout_seconds: 30
  edit_granularity_seconds: 60
  max_download_mb: 200

notion:
  token: "YOUR_NOTION_INTEGRATION_TOKEN"
  version: "2022-06-28"
  database_id: "NOTION_CONTENT_DATABASE_ID"
  page_size: 100

storage:
  kind: local
  root: "./data/media"
  public_base_url: "https://cdn.example.com/media"
"#
}
