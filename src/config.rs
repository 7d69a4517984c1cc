//! Engine configuration.
//!
//! `EngineConfig` can be built in code (every field is public and has a
//! default) or loaded from a TOML file. A missing or empty file yields
//! `EngineConfig::default()`. Unknown keys are accepted but logged, since
//! they are usually typos.
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::util::{validate_url, HostPolicy, UrlValidationError};

/// Redirect hops followed before a request fails.
const MAX_REDIRECTS: usize = 10;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),

    /// A value is out of range or inconsistent with another setting.
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// The HTTP client could not be constructed from this configuration.
    #[error("Failed to build HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),
}

/// Why the HTTP client refused to follow a redirect.
#[derive(Debug, Error)]
pub enum RedirectError {
    #[error("Too many redirects (max {MAX_REDIRECTS})")]
    TooMany,

    #[error("Redirect loop detected at {0}")]
    Loop(String),

    /// The target fails the same URL guard as the original request.
    #[error("Redirect to {target} refused: {reason}")]
    Refused {
        target: String,
        #[source]
        reason: UrlValidationError,
    },
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Which cache backend the engine stores results in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    /// Bounded in-process LRU. Lost on restart.
    #[default]
    Memory,
    /// SQLite file at `cache_path`. Survives restart.
    Durable,
}

/// Engine configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
///
/// Custom Debug impl masks `search_api_key` to prevent secret leakage
/// in logs, error messages, and debug output.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cache_backend: CacheBackend,

    /// SQLite file for the durable backend. Required iff `cache_backend = "durable"`.
    pub cache_path: Option<PathBuf>,

    /// Deadline for one fetch attempt (connect, headers and body).
    pub fetch_timeout_ms: u64,

    /// Retries after the first attempt, for network/timeout failures only.
    pub max_retries: u32,

    /// Base backoff; attempt `n` waits `retry_backoff_ms * 2^n`.
    pub retry_backoff_ms: u64,

    /// Upper bound on simultaneous outbound fetches across all requests.
    pub max_concurrent_fetches: usize,

    /// Lifetime of a cache entry, in seconds. 0 makes every entry stale at once.
    pub default_ttl_secs: u64,

    /// Entry bound for the memory backend.
    pub memory_cache_capacity: usize,

    /// Largest response body accepted, in bytes.
    pub max_feed_bytes: usize,

    pub user_agent: String,

    /// Remote feed directory queried for free-text searches. When unset,
    /// searches run against the feeds this engine has parsed.
    pub search_endpoint: Option<String>,

    /// Bearer token for `search_endpoint`.
    pub search_api_key: Option<String>,

    pub search_cache_ttl_secs: u64,

    /// Fetch each item's page and read its Open Graph tags during enrichment.
    pub fetch_page_metadata: bool,

    /// Display-column width of enrichment summaries.
    pub summary_width: usize,

    /// Permit localhost and private-range hosts. Off by default (SSRF guard).
    pub allow_private_hosts: bool,

    /// How long `close()` waits for in-flight requests before aborting them.
    pub shutdown_grace_ms: u64,

    /// Interval of the expired-entry sweeper. 0 disables it.
    pub cache_sweep_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_backend: CacheBackend::Memory,
            cache_path: None,
            fetch_timeout_ms: 30_000,
            max_retries: 3,
            retry_backoff_ms: 500,
            max_concurrent_fetches: 10,
            default_ttl_secs: 3600,
            memory_cache_capacity: 1024,
            max_feed_bytes: 10 * 1024 * 1024,
            user_agent: concat!("digests/", env!("CARGO_PKG_VERSION")).to_string(),
            search_endpoint: None,
            search_api_key: None,
            search_cache_ttl_secs: 86_400,
            fetch_page_metadata: false,
            summary_width: 280,
            allow_private_hosts: false,
            shutdown_grace_ms: 5000,
            cache_sweep_interval_secs: 300,
        }
    }
}

/// Mask search_api_key in Debug output to prevent secret leakage.
impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("cache_backend", &self.cache_backend)
            .field("cache_path", &self.cache_path)
            .field("fetch_timeout_ms", &self.fetch_timeout_ms)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("max_concurrent_fetches", &self.max_concurrent_fetches)
            .field("default_ttl_secs", &self.default_ttl_secs)
            .field("memory_cache_capacity", &self.memory_cache_capacity)
            .field("max_feed_bytes", &self.max_feed_bytes)
            .field("user_agent", &self.user_agent)
            .field("search_endpoint", &self.search_endpoint)
            .field(
                "search_api_key",
                &self.search_api_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("search_cache_ttl_secs", &self.search_cache_ttl_secs)
            .field("fetch_page_metadata", &self.fetch_page_metadata)
            .field("summary_width", &self.summary_width)
            .field("allow_private_hosts", &self.allow_private_hosts)
            .field("shutdown_grace_ms", &self.shutdown_grace_ms)
            .field("cache_sweep_interval_secs", &self.cache_sweep_interval_secs)
            .finish()
    }
}

impl EngineConfig {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 18] = [
        "cache_backend",
        "cache_path",
        "fetch_timeout_ms",
        "max_retries",
        "retry_backoff_ms",
        "max_concurrent_fetches",
        "default_ttl_secs",
        "memory_cache_capacity",
        "max_feed_bytes",
        "user_agent",
        "search_endpoint",
        "search_api_key",
        "search_cache_ttl_secs",
        "fetch_page_metadata",
        "summary_width",
        "allow_private_hosts",
        "shutdown_grace_ms",
        "cache_sweep_interval_secs",
    ];

    /// Shorthand for a config that only picks the cache backend, as
    /// `lifecycle::init_with_cache` does.
    pub fn with_cache(backend: CacheBackend, cache_path: Option<PathBuf>) -> Self {
        Self {
            cache_backend: backend,
            cache_path,
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(EngineConfig::default())`
    /// - Empty file → `Ok(EngineConfig::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    ///
    /// The result is not validated; [`EngineConfig::validate`] runs when an
    /// engine is built from it.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // Check file size before reading to prevent memory exhaustion
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Race condition: file deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: EngineConfig = toml::from_str(&content)?;
        tracing::info!(
            path = %path.display(),
            backend = ?config.cache_backend,
            "Loaded engine configuration"
        );
        Ok(config)
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_backend == CacheBackend::Durable && self.cache_path.is_none() {
            return Err(ConfigError::Invalid(
                "cache_path is required for the durable cache backend".into(),
            ));
        }
        let positive = [
            ("max_concurrent_fetches", self.max_concurrent_fetches as u64),
            ("fetch_timeout_ms", self.fetch_timeout_ms),
            ("memory_cache_capacity", self.memory_cache_capacity as u64),
            ("max_feed_bytes", self.max_feed_bytes as u64),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be greater than 0")));
            }
        }
        if let Some(endpoint) = &self.search_endpoint {
            url::Url::parse(endpoint).map_err(|e| {
                ConfigError::Invalid(format!("search_endpoint is not a valid URL: {e}"))
            })?;
        }
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn host_policy(&self) -> HostPolicy {
        if self.allow_private_hosts {
            HostPolicy::AllowPrivate
        } else {
            HostPolicy::PublicOnly
        }
    }

    /// Builds the shared HTTP client. Every redirect hop is checked against
    /// the host policy, so a public URL cannot bounce into a private one.
    pub fn http_client(&self) -> Result<reqwest::Client, ConfigError> {
        reqwest::Client::builder()
            .user_agent(&self.user_agent)
            .redirect(redirect_policy(self.host_policy()))
            .build()
            .map_err(ConfigError::HttpClient)
    }
}

// ============================================================================
// HTTP Client Configuration
// ============================================================================

/// Redirect policy with a hop cap, loop detection and a per-hop URL guard.
pub fn redirect_policy(host_policy: HostPolicy) -> reqwest::redirect::Policy {
    reqwest::redirect::Policy::custom(move |attempt| {
        match check_redirect(attempt.url(), attempt.previous(), host_policy) {
            Ok(()) => {
                tracing::debug!(
                    from = %attempt.previous().last().map(Url::as_str).unwrap_or("initial"),
                    to = %attempt.url(),
                    hop = attempt.previous().len(),
                    "Following redirect"
                );
                attempt.follow()
            }
            Err(e) => {
                tracing::warn!(error = %e, "Redirect refused");
                attempt.error(e)
            }
        }
    })
}

/// `previous` holds every URL already requested, the original one first.
fn check_redirect(next: &Url, previous: &[Url], host_policy: HostPolicy) -> Result<(), RedirectError> {
    if previous.len() > MAX_REDIRECTS {
        return Err(RedirectError::TooMany);
    }
    if previous.iter().any(|p| p == next) {
        return Err(RedirectError::Loop(next.to_string()));
    }
    validate_url(next.as_str(), host_policy).map_err(|reason| RedirectError::Refused {
        target: next.to_string(),
        reason,
    })?;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
