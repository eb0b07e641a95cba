//! Cache configuration: region lifetimes, lock lifetimes and per-query options.

use crate::error::{Error, Result};
use crate::mode::CacheMode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

const DEFAULT_LIFETIME_SECS: u64 = 3600;
const DEFAULT_LOCK_LIFETIME_SECS: u64 = 60;
const DEFAULT_TIMESTAMP_REGION: &str = "timestamp_cache_region";
const DEFAULT_QUERY_REGION: &str = "query_cache_region";

/// Lifetimes per region. A lifetime of 0 means entries never expire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionsConfiguration {
    #[serde(default = "default_lifetime_secs")]
    pub default_lifetime_secs: u64,
    #[serde(default = "default_lock_lifetime_secs")]
    pub default_lock_lifetime_secs: u64,
    #[serde(default)]
    pub lifetimes: HashMap<String, u64>,
    #[serde(default)]
    pub lock_lifetimes: HashMap<String, u64>,
}

fn default_lifetime_secs() -> u64 {
    DEFAULT_LIFETIME_SECS
}

fn default_lock_lifetime_secs() -> u64 {
    DEFAULT_LOCK_LIFETIME_SECS
}

impl Default for RegionsConfiguration {
    fn default() -> Self {
        RegionsConfiguration {
            default_lifetime_secs: DEFAULT_LIFETIME_SECS,
            default_lock_lifetime_secs: DEFAULT_LOCK_LIFETIME_SECS,
            lifetimes: HashMap::new(),
            lock_lifetimes: HashMap::new(),
        }
    }
}

impl RegionsConfiguration {
    /// Entry lifetime for `region`; `None` means no expiry.
    pub fn lifetime(&self, region: &str) -> Option<Duration> {
        let secs = self
            .lifetimes
            .get(region)
            .copied()
            .unwrap_or(self.default_lifetime_secs);
        non_zero(secs)
    }

    /// Soft-lock lifetime for `region`. Locks always expire.
    pub fn lock_lifetime(&self, region: &str) -> Duration {
        let secs = self
            .lock_lifetimes
            .get(region)
            .copied()
            .unwrap_or(self.default_lock_lifetime_secs);
        Duration::from_secs(secs.max(1))
    }

    pub fn set_lifetime(&mut self, region: impl Into<String>, secs: u64) {
        self.lifetimes.insert(region.into(), secs);
    }

    pub fn set_lock_lifetime(&mut self, region: impl Into<String>, secs: u64) {
        self.lock_lifetimes.insert(region.into(), secs);
    }
}

/// Top-level second-level cache configuration.
///
/// # Example
///
/// ```
/// use orm_cache::config::CacheConfiguration;
///
/// let config = CacheConfiguration::from_json(
///     r#"{"regions": {"default_lifetime_secs": 600, "lifetimes": {"countries": 0}}}"#,
/// ).unwrap();
///
/// assert_eq!(config.regions.lifetime("orders").map(|d| d.as_secs()), Some(600));
/// assert_eq!(config.regions.lifetime("countries"), None);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfiguration {
    #[serde(default)]
    pub regions: RegionsConfiguration,
    #[serde(default = "default_timestamp_region")]
    pub timestamp_region: String,
    #[serde(default = "default_query_region")]
    pub default_query_region: String,
}

fn default_timestamp_region() -> String {
    DEFAULT_TIMESTAMP_REGION.to_string()
}

fn default_query_region() -> String {
    DEFAULT_QUERY_REGION.to_string()
}

impl Default for CacheConfiguration {
    fn default() -> Self {
        CacheConfiguration {
            regions: RegionsConfiguration::default(),
            timestamp_region: default_timestamp_region(),
            default_query_region: default_query_region(),
        }
    }
}

impl CacheConfiguration {
    /// # Errors
    /// `Error::ConfigError` on malformed JSON or empty region names.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: CacheConfiguration = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by environment variables:
    ///
    /// - `ORM_CACHE_DEFAULT_LIFETIME` (seconds, 0 = no expiry)
    /// - `ORM_CACHE_DEFAULT_LOCK_LIFETIME` (seconds)
    /// - `ORM_CACHE_TIMESTAMP_REGION`
    /// - `ORM_CACHE_QUERY_REGION`
    ///
    /// # Errors
    /// `Error::ConfigError` when a numeric variable does not parse.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup("ORM_CACHE_DEFAULT_LIFETIME") {
            config.regions.default_lifetime_secs = parse_secs("ORM_CACHE_DEFAULT_LIFETIME", &raw)?;
        }
        if let Some(raw) = lookup("ORM_CACHE_DEFAULT_LOCK_LIFETIME") {
            config.regions.default_lock_lifetime_secs =
                parse_secs("ORM_CACHE_DEFAULT_LOCK_LIFETIME", &raw)?;
        }
        if let Some(name) = lookup("ORM_CACHE_TIMESTAMP_REGION") {
            config.timestamp_region = name;
        }
        if let Some(name) = lookup("ORM_CACHE_QUERY_REGION") {
            config.default_query_region = name;
        }

        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// `Error::ConfigError` when a region name is empty or the timestamp and
    /// query regions collide.
    pub fn validate(&self) -> Result<()> {
        if self.timestamp_region.is_empty() || self.default_query_region.is_empty() {
            return Err(Error::ConfigError(
                "timestamp and query region names must not be empty".to_string(),
            ));
        }
        if self.timestamp_region == self.default_query_region {
            return Err(Error::ConfigError(format!(
                "timestamp region and query region share the name {}",
                self.timestamp_region
            )));
        }
        Ok(())
    }
}

/// Per-query caching options.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueryCacheOptions {
    pub cacheable: bool,
    /// Explicit query region; the configured default query region otherwise.
    pub region: Option<String>,
    /// Lifetime override for this query's entry.
    pub lifetime: Option<Duration>,
    pub mode: CacheMode,
}

impl QueryCacheOptions {
    pub fn cacheable() -> Self {
        QueryCacheOptions {
            cacheable: true,
            ..Default::default()
        }
    }
}

fn non_zero(secs: u64) -> Option<Duration> {
    if secs == 0 {
        None
    } else {
        Some(Duration::from_secs(secs))
    }
}

fn parse_secs(name: &str, raw: &str) -> Result<u64> {
    raw.trim()
        .parse::<u64>()
        .map_err(|e| Error::ConfigError(format!("{} must be a number of seconds: {}", name, e)))
}
