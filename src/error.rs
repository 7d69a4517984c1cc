//! Crate-wide error type and the stable error taxonomy exposed to embedders.
//!
//! Every component owns its own `thiserror` enum; [`Error`] wraps them so the
//! engine can surface one type, and [`Error::kind`] collapses the lot onto a
//! small, serializable [`ErrorKind`] that a boundary layer can hand out as-is.

use serde::Serialize;
use thiserror::Error;

use crate::config::ConfigError;
use crate::enrich::EnrichError;
use crate::feed::{FetchError, ParseError};
use crate::search::SearchError;
use crate::storage::CacheError;
use crate::util::UrlValidationError;

/// Coarse classification of every failure the engine can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Timeout,
    HttpStatus,
    MalformedFeed,
    UnsupportedEncoding,
    CacheIo,
    SearchUnavailable,
    NotInitialized,
    InvalidConfig,
    InvalidUrl,
    InvalidQuery,
    ResponseTooLarge,
    Aborted,
}

impl ErrorKind {
    /// Stable snake_case name, identical to the serialized form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::HttpStatus => "http_status",
            Self::MalformedFeed => "malformed_feed",
            Self::UnsupportedEncoding => "unsupported_encoding",
            Self::CacheIo => "cache_io",
            Self::SearchUnavailable => "search_unavailable",
            Self::NotInitialized => "not_initialized",
            Self::InvalidConfig => "invalid_config",
            Self::InvalidUrl => "invalid_url",
            Self::InvalidQuery => "invalid_query",
            Self::ResponseTooLarge => "response_too_large",
            Self::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Any failure surfaced by the engine or the process-wide lifecycle API.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Enrich(#[from] EnrichError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Search(#[from] SearchError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A request URL failed validation (bad scheme, private host, unparseable).
    #[error("invalid feed URL: {0}")]
    InvalidUrl(#[from] UrlValidationError),

    /// The process-wide engine has not been initialized, or was closed.
    #[error("engine is not initialized")]
    NotInitialized,

    /// The request was still in flight when shutdown's grace period ran out.
    #[error("request aborted by engine shutdown")]
    Aborted,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Fetch(e) => e.kind(),
            Self::Parse(e) => e.kind(),
            Self::Enrich(_) => ErrorKind::MalformedFeed,
            Self::Cache(_) => ErrorKind::CacheIo,
            Self::Search(e) => e.kind(),
            Self::Config(_) => ErrorKind::InvalidConfig,
            Self::InvalidUrl(_) => ErrorKind::InvalidUrl,
            Self::NotInitialized => ErrorKind::NotInitialized,
            Self::Aborted => ErrorKind::Aborted,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
