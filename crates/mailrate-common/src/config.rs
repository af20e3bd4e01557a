//! Configuration for mailrate

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix for environment overrides, e.g. `MAILRATE__LIMITS__MESSAGES_PER_HOUR`
const ENV_PREFIX: &str = "MAILRATE";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Database configuration
    pub database: DatabaseConfig,

    /// Rate limit configuration
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Policy protocol configuration
    #[serde(default)]
    pub protocol: ProtocolConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database backend, only "postgres" is supported
    #[serde(default = "default_db_backend")]
    pub backend: String,

    /// Database URL
    pub url: Option<String>,

    /// Maximum connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection acquire timeout in seconds
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
}

fn default_db_backend() -> String {
    "postgres".to_string()
}

// One policy process handles a single transaction at a time.
fn default_max_connections() -> u32 {
    2
}

fn default_min_connections() -> u32 {
    0
}

fn default_acquire_timeout() -> u64 {
    5
}

/// Rate limit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Messages a sender may submit per window before being deferred
    #[serde(default = "default_messages_per_hour")]
    pub messages_per_hour: i64,

    /// Recipients a sender may address per window before being deferred
    #[serde(default = "default_recipients_per_hour")]
    pub recipients_per_hour: i64,

    /// Length of the sliding counting window in seconds
    #[serde(default = "default_window")]
    pub window_secs: u64,

    /// Period in which a resubmitted message counts as the same message
    #[serde(default = "default_queue_lifetime")]
    pub queue_lifetime_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            messages_per_hour: default_messages_per_hour(),
            recipients_per_hour: default_recipients_per_hour(),
            window_secs: default_window(),
            queue_lifetime_secs: default_queue_lifetime(),
        }
    }
}

impl LimitsConfig {
    /// Sliding counting window
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Queue lifetime
    pub fn queue_lifetime(&self) -> Duration {
        Duration::from_secs(self.queue_lifetime_secs)
    }
}

fn default_messages_per_hour() -> i64 {
    10
}

fn default_recipients_per_hour() -> i64 {
    100
}

fn default_window() -> u64 {
    3600
}

fn default_queue_lifetime() -> u64 {
    5 * 24 * 3600 // 5 days
}

/// Policy protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Deadline for reading one request block, in seconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    /// Character separating a sub-address from the local part
    #[serde(default = "default_recipient_delimiter")]
    pub recipient_delimiter: String,

    /// Seconds after which an unfinished transaction is forgotten
    #[serde(default = "default_transaction_ttl")]
    pub transaction_ttl_secs: u64,

    /// Maximum number of transactions tracked at once
    #[serde(default = "default_max_transactions")]
    pub max_transactions: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            read_timeout_secs: default_read_timeout(),
            recipient_delimiter: default_recipient_delimiter(),
            transaction_ttl_secs: default_transaction_ttl(),
            max_transactions: default_max_transactions(),
        }
    }
}

impl ProtocolConfig {
    /// Read deadline per block
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// Transaction staleness deadline
    pub fn transaction_ttl(&self) -> Duration {
        Duration::from_secs(self.transaction_ttl_secs)
    }

    /// The recipient delimiter as a single character
    pub fn delimiter(&self) -> crate::Result<char> {
        let mut chars = self.recipient_delimiter.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Ok(c),
            _ => Err(crate::Error::Config(format!(
                "recipient_delimiter must be a single character, got {:?}",
                self.recipient_delimiter
            ))),
        }
    }
}

fn default_read_timeout() -> u64 {
    10
}

fn default_recipient_delimiter() -> String {
    crate::types::DEFAULT_RECIPIENT_DELIMITER.to_string()
}

fn default_transaction_ttl() -> u64 {
    600
}

fn default_max_transactions() -> usize {
    1024
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file with environment overrides.
    ///
    /// Without an explicit path the default locations are searched.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::find_default().ok_or_else(|| {
                crate::Error::Config("No configuration file found".to_string())
            })?,
        };

        tracing::debug!(path = %path.display(), "Loading configuration");

        let config: Config = config::Config::builder()
            .add_source(config::File::from(path.as_path()).format(config::FileFormat::Toml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| crate::Error::Config(format!("Failed to load config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    fn find_default() -> Option<PathBuf> {
        [
            PathBuf::from("./mailrate.toml"),
            PathBuf::from("/etc/mailrate/mailrate.toml"),
        ]
        .into_iter()
        .find(|p| p.exists())
    }

    /// Check values that serde cannot express
    pub fn validate(&self) -> crate::Result<()> {
        self.protocol.delimiter()?;

        if self.protocol.read_timeout_secs == 0 {
            return Err(crate::Error::Config(
                "read_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.protocol.max_transactions == 0 {
            return Err(crate::Error::Config(
                "max_transactions must be at least 1".to_string(),
            ));
        }
        if self.limits.messages_per_hour < 0 || self.limits.recipients_per_hour < 0 {
            return Err(crate::Error::Config(
                "rate limits must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}
