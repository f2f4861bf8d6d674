use std::time::Duration;

use serde::Deserialize;

use crate::error::StoreError;

pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_POOL_SIZE: usize = 10;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_CONNECTION_NAME: &str = "default";

/// Options for opening the store and sizing its pool.
///
/// Deserializes from any serde format with per-field defaults, so a config file only
/// needs to name what it changes:
///
/// ```rust
/// use storefront_db::prelude::*;
///
/// let opts = StoreOptions::from_json_str(r#"{ "url": "shop.db", "pool_size": 4 }"#).unwrap();
/// assert_eq!(opts.pool_size, 4);
/// assert_eq!(opts.max_retries, 3);
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreOptions {
    /// Path, `sqlite://path`, `sqlite:path`, or a `file:` URI.
    pub url: String,
    pub read_only: bool,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub pool_size: usize,
    /// Connections allowed above `pool_size` while every candidate is mid-transaction.
    /// `None` means the same as `pool_size`.
    pub max_overflow: Option<usize>,
    pub busy_timeout_ms: u64,
    /// Pool key used for non-transactional statements.
    pub connection_name: String,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            url: String::new(),
            read_only: false,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            pool_size: DEFAULT_POOL_SIZE,
            max_overflow: None,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            connection_name: DEFAULT_CONNECTION_NAME.to_string(),
        }
    }
}

impl StoreOptions {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn builder(url: impl Into<String>) -> StoreOptionsBuilder {
        StoreOptionsBuilder::new(url)
    }

    /// Parse options from a JSON document.
    ///
    /// # Errors
    /// Returns `StoreError::ConfigError` if the document is malformed or fails validation.
    pub fn from_json_str(json: &str) -> Result<Self, StoreError> {
        let opts: StoreOptions = serde_json::from_str(json)
            .map_err(|e| StoreError::ConfigError(format!("invalid store options: {e}")))?;
        opts.validate()?;
        Ok(opts)
    }

    /// # Errors
    /// Returns `StoreError::ConfigError` naming the first invalid field.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.url.trim().is_empty() {
            return Err(StoreError::ConfigError("url must not be empty".into()));
        }
        if self.pool_size == 0 {
            return Err(StoreError::ConfigError("pool_size must be at least 1".into()));
        }
        if self.timeout_ms == 0 {
            return Err(StoreError::ConfigError("timeout_ms must be greater than 0".into()));
        }
        if self.connection_name.trim().is_empty() {
            return Err(StoreError::ConfigError(
                "connection_name must not be empty".into(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    #[must_use]
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    #[must_use]
    pub fn max_overflow(&self) -> usize {
        self.max_overflow.unwrap_or(self.pool_size)
    }

    /// Filesystem path or URI handed to SQLite, with any `sqlite:` scheme removed.
    #[must_use]
    pub fn database_path(&self) -> &str {
        let url = self.url.trim();
        url.strip_prefix("sqlite://")
            .or_else(|| url.strip_prefix("sqlite:"))
            .unwrap_or(url)
    }

    pub(crate) fn open_flags(&self) -> rusqlite::OpenFlags {
        use rusqlite::OpenFlags;
        let base = OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        if self.read_only {
            base | OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            base | OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE
        }
    }
}

/// Fluent builder for `StoreOptions`.
#[derive(Debug, Clone)]
pub struct StoreOptionsBuilder {
    opts: StoreOptions,
}

impl StoreOptionsBuilder {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            opts: StoreOptions::new(url),
        }
    }

    #[must_use]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.opts.read_only = read_only;
        self
    }

    #[must_use]
    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.opts.timeout_ms = timeout_ms;
        self
    }

    #[must_use]
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.opts.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.opts.pool_size = pool_size;
        self
    }

    #[must_use]
    pub fn max_overflow(mut self, max_overflow: usize) -> Self {
        self.opts.max_overflow = Some(max_overflow);
        self
    }

    #[must_use]
    pub fn busy_timeout_ms(mut self, busy_timeout_ms: u64) -> Self {
        self.opts.busy_timeout_ms = busy_timeout_ms;
        self
    }

    #[must_use]
    pub fn connection_name(mut self, name: impl Into<String>) -> Self {
        self.opts.connection_name = name.into();
        self
    }

    /// # Errors
    /// Returns `StoreError::ConfigError` if the options fail validation.
    pub fn finish(self) -> Result<StoreOptions, StoreError> {
        self.opts.validate()?;
        Ok(self.opts)
    }
}

/// Per-call overrides for a single statement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOptions {
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
}

impl QueryOptions {
    #[must_use]
    pub fn timeout_ms(ms: u64) -> Self {
        Self {
            timeout: Some(Duration::from_millis(ms)),
            max_retries: None,
        }
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}
