//! Configuration loaded from `STREAMLOG_*` environment variables.

use std::time::Duration;

use thiserror::Error;

use streamlog_events::Dek;

pub const DEFAULT_READ_PAGE_SIZE: usize = 100;
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_millis(1000);
pub const DEFAULT_READER_CACHE_SIZE: usize = 256;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} must be a positive integer, got '{value}'")]
    NotAPositiveInteger { var: &'static str, value: String },

    #[error("STREAMLOG_KEK must be base64 of a 256-bit key: {reason}")]
    InvalidKek { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamlogConfig {
    /// Postgres backends are used when set; in-memory otherwise.
    pub database_url: Option<String>,
    pub read_page_size: usize,
    pub stale_after: Duration,
    pub reader_cache_size: usize,
    /// Cross-process change notifications (`redis` feature).
    pub redis_url: Option<String>,
    /// Wraps every stream's DEK. Required with a durable backend: a random
    /// per-process KEK makes stored envelopes unreadable after a restart.
    pub kek: Option<Dek>,
}

impl Default for StreamlogConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            read_page_size: DEFAULT_READ_PAGE_SIZE,
            stale_after: DEFAULT_STALE_AFTER,
            reader_cache_size: DEFAULT_READER_CACHE_SIZE,
            redis_url: None,
            kek: None,
        }
    }
}

impl StreamlogConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; unset and empty values take defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let positive = |var: &'static str, default: u64| -> Result<u64, ConfigError> {
            match get(var) {
                None => Ok(default),
                Some(value) => match value.trim().parse::<u64>() {
                    Ok(n) if n > 0 => Ok(n),
                    _ => Err(ConfigError::NotAPositiveInteger { var, value }),
                },
            }
        };

        Ok(Self {
            database_url: get("STREAMLOG_DATABASE_URL"),
            read_page_size: positive("STREAMLOG_READ_PAGE_SIZE", defaults.read_page_size as u64)?
                as usize,
            stale_after: Duration::from_millis(positive(
                "STREAMLOG_STALE_AFTER_MS",
                defaults.stale_after.as_millis() as u64,
            )?),
            reader_cache_size: positive(
                "STREAMLOG_READER_CACHE_SIZE",
                defaults.reader_cache_size as u64,
            )? as usize,
            redis_url: get("STREAMLOG_REDIS_URL"),
            kek: get("STREAMLOG_KEK")
                .map(|encoded| Dek::from_base64(&encoded))
                .transpose()
                .map_err(|e| ConfigError::InvalidKek {
                    reason: e.to_string(),
                })?,
        })
    }
}
