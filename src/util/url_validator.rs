use std::net::IpAddr;
use thiserror::Error;
use url::Url;

/// Errors that can occur while validating an endpoint URL.
#[derive(Error, Debug)]
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

/// Validates a URL string for use as a polled endpoint.
///
/// Only `http` and `https` URLs with a host are accepted. Unless
/// `allow_private` is set, loopback and private-range hosts are rejected
/// as well, so a config file cannot point the poller at internal services
/// by accident.
///
/// # Examples
///
/// ```
/// use feedpulse::util::validate_endpoint_url;
///
/// let url = validate_endpoint_url("https://example.com/feed.xml", false).unwrap();
/// assert_eq!(url.host_str(), Some("example.com"));
///
/// assert!(validate_endpoint_url("http://localhost/feed", false).is_err());
/// assert!(validate_endpoint_url("http://localhost/feed", true).is_ok());
/// assert!(validate_endpoint_url("file:///etc/passwd", true).is_err());
/// ```
pub fn validate_endpoint_url(url_str: &str, allow_private: bool) -> Result<Url, UrlValidationError> {
    let url = Url::parse(url_str)?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlValidationError::UnsupportedScheme(scheme.to_owned())),
    }

    let host = url.host_str().ok_or(UrlValidationError::MissingHost)?;
    if allow_private {
        return Ok(url);
    }

    if host == "localhost" {
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

    #[test]
    fn test_public_endpoints_accepted() {
        assert!(validate_endpoint_url("https://example.com/feed.xml", false).is_ok());
        assert!(validate_endpoint_url("http://api.example.org:8443/v1/prices", false).is_ok());
    }

    #[test]
    fn test_non_http_schemes_rejected() {
        assert!(matches!(
            validate_endpoint_url("ftp://example.com", true),
            Err(UrlValidationError::UnsupportedScheme(_))
        ));
        assert!(validate_endpoint_url("file:///etc/passwd", true).is_err());
    }

    #[test]
    fn test_loopback_rejected_unless_allowed() {
        assert!(matches!(
            validate_endpoint_url("http://127.0.0.1:9000/feed", false),
            Err(UrlValidationError::Localhost)
        ));
        assert!(validate_endpoint_url("http://[::1]/feed", false).is_err());
        assert!(validate_endpoint_url("http://127.0.0.1:9000/feed", true).is_ok());
    }

    #[test]
    fn test_private_ranges_rejected_unless_allowed() {
        assert!(matches!(
            validate_endpoint_url("http://10.0.0.1:3000/feed", false),
            Err(UrlValidationError::PrivateIp(_))
        ));
        assert!(validate_endpoint_url("http://169.254.1.1/feed", false).is_err());
        assert!(validate_endpoint_url("http://[fe80::1]/feed", false).is_err());
        assert!(validate_endpoint_url("http://192.168.1.1/feed", true).is_ok());
    }

    #[test]
    fn test_garbage_is_parse_error() {
        assert!(matches!(
            validate_endpoint_url("not a url", false),
            Err(UrlValidationError::InvalidUrl(_))
        ));
    }
}
