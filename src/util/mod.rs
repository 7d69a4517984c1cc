//! Utility functions shared by the fetch, parse, enrich and search layers.
//!
//! - **URL validation**: Security-focused validation to prevent SSRF attacks
//! - **Text processing**: Unicode-aware truncation and control-character stripping
//! - **HTML**: text extraction and `<link>` attribute scanning
//!
//! # Examples
//!
//! ```
//! use digests::util::{html_to_text, truncate_to_width, validate_url, HostPolicy};
//!
//! let url = validate_url("https://example.com/feed.xml", HostPolicy::PublicOnly).unwrap();
//! assert_eq!(url.scheme(), "https");
//!
//! let text = html_to_text("<p>Caf&eacute; <em>open</em></p>");
//! assert_eq!(text, "Caf\u{e9}  open");
//!
//! assert_eq!(truncate_to_width("Long article title", 10), "Long...");
//! ```

mod html;
mod text;
mod url_validator;

pub use html::{extract_attr_value, find_tags, has_attr, html_to_text};
pub use text::{collapse_whitespace, strip_control_chars, truncate_to_width, word_count};
pub use url_validator::{validate_url, HostPolicy, UrlValidationError};

/// Maximum allowed search query length, in characters
pub const MAX_SEARCH_QUERY_LENGTH: usize = 100;

/// Minimum allowed search query length, in characters
pub const MIN_SEARCH_QUERY_LENGTH: usize = 2;
