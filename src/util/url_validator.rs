use std::net::IpAddr;
use thiserror::Error;
use url::Url;

/// Errors that can occur during URL validation.
///
/// These errors cover both parsing failures and security policy violations
/// designed to prevent SSRF (Server-Side Request Forgery) attacks.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UrlValidationError {
    /// The URL string could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The URL uses a scheme other than http or https.
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    /// The URL has no host component.
    #[error("URL has no host")]
    MissingHost,
    /// The URL points to a private/internal IP address.
    #[error("Private IP address not allowed: {0}")]
    PrivateIp(String),
    /// The URL points to localhost.
    #[error("Localhost not allowed")]
    Localhost,
}

/// Which hosts a URL may point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostPolicy {
    /// Reject localhost and private/link-local ranges (SSRF guard).
    #[default]
    PublicOnly,
    /// Accept any host. Intended for tests and trusted deployments.
    AllowPrivate,
}

/// Validates a URL string for use as a remote fetch target.
///
/// Performs security-focused validation to prevent SSRF attacks by rejecting:
/// - Non-HTTP(S) schemes (e.g., `file://`, `ftp://`)
/// - URLs without a host
/// - Localhost addresses (`localhost`, `127.0.0.1`, `::1`) under [`HostPolicy::PublicOnly`]
/// - Private IP ranges (RFC 1918, link-local, unique local IPv6) under [`HostPolicy::PublicOnly`]
///
/// # Errors
///
/// Returns [`UrlValidationError`] describing the first rule the URL breaks.
///
/// # Examples
///
/// ```
/// use digests::util::{validate_url, HostPolicy};
///
/// let url = validate_url("https://example.com/feed.xml", HostPolicy::PublicOnly).unwrap();
/// assert_eq!(url.host_str(), Some("example.com"));
///
/// assert!(validate_url("http://localhost/feed", HostPolicy::PublicOnly).is_err());
/// assert!(validate_url("http://localhost/feed", HostPolicy::AllowPrivate).is_ok());
/// assert!(validate_url("file:///etc/passwd", HostPolicy::AllowPrivate).is_err());
/// ```
pub fn validate_url(url_str: &str, policy: HostPolicy) -> Result<Url, UrlValidationError> {
    let url = Url::parse(url_str.trim())?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlValidationError::UnsupportedScheme(scheme.to_owned())),
    }

    let host = url.host_str().ok_or(UrlValidationError::MissingHost)?;
    if policy == HostPolicy::AllowPrivate {
        return Ok(url);
    }

    if host.eq_ignore_ascii_case("localhost") {
        return Err(UrlValidationError::Localhost);
    }

    // Strip brackets from IPv6 addresses for parsing
    let host_for_parse = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    if let Ok(ip) = host_for_parse.parse::<IpAddr>() {
        if ip.is_loopback() {
            return Err(UrlValidationError::Localhost);
        }
        if is_private_ip(&ip) {
            return Err(UrlValidationError::PrivateIp(ip.to_string()));
        }
    }

    Ok(url)
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_private() || ipv4.is_loopback() || ipv4.is_link_local() || ipv4.is_unspecified()
        }
        IpAddr::V6(ipv6) => {
            if ipv6.is_loopback() || ipv6.is_unspecified() {
                return true;
            }
            let segments = ipv6.segments();
            // Unique Local (fc00::/7)
            let is_unique_local = (segments[0] & 0xfe00) == 0xfc00;
            // Link-Local (fe80::/10)
            let is_link_local = (segments[0] & 0xffc0) == 0xfe80;
            is_unique_local || is_link_local
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STRICT: HostPolicy = HostPolicy::PublicOnly;

    #[test]
    fn test_valid_urls() {
        assert!(validate_url("https://example.com/feed.xml", STRICT).is_ok());
        assert!(validate_url("http://news.example.org", STRICT).is_ok());
        assert!(validate_url("  https://example.com/padded  ", STRICT).is_ok());
    }

    #[test]
    fn test_invalid_schemes() {
        assert!(matches!(
            validate_url("file:///etc/passwd", STRICT),
            Err(UrlValidationError::UnsupportedScheme(_))
        ));
        assert!(validate_url("ftp://example.com", STRICT).is_err());
        assert!(validate_url("javascript:alert(1)", HostPolicy::AllowPrivate).is_err());
    }

    #[test]
    fn test_relative_url_rejected() {
        assert!(matches!(
            validate_url("/feed.xml", STRICT),
            Err(UrlValidationError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_localhost_rejected() {
        assert_eq!(
            validate_url("http://localhost/feed", STRICT),
            Err(UrlValidationError::Localhost)
        );
        assert!(validate_url("http://127.0.0.1/feed", STRICT).is_err());
        assert!(validate_url("http://[::1]/feed", STRICT).is_err());
    }

    #[test]
    fn test_private_ips_rejected() {
        assert!(validate_url("http://192.168.1.1/feed", STRICT).is_err());
        assert!(validate_url("http://10.0.0.1:3000/feed", STRICT).is_err());
        assert!(validate_url("http://172.16.0.1/feed", STRICT).is_err());
        assert!(validate_url("http://169.254.1.1/feed", STRICT).is_err());
        assert!(validate_url("http://[fe80::1]/feed", STRICT).is_err());
        assert!(validate_url("http://0.0.0.0/feed", STRICT).is_err());
    }

    #[test]
    fn test_allow_private_policy_accepts_loopback() {
        let url = validate_url("http://127.0.0.1:8080/feed", HostPolicy::AllowPrivate).unwrap();
        assert_eq!(url.port(), Some(8080));
    }
}
