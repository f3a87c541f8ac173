use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::time::Duration;

/// Header names the engine reads from probe responses.
pub mod names {
    pub const ETAG: &str = "etag";
    pub const LAST_MODIFIED: &str = "last-modified";
    pub const RETRY_AFTER: &str = "retry-after";
    pub const RATELIMIT_RESET: &str = "ratelimit-reset";
    pub const X_RATELIMIT_RESET: &str = "x-ratelimit-reset";
    pub const CACHE_CONTROL: &str = "cache-control";
    pub const AGE: &str = "age";
}

/// Raw outcome of one probe, as returned by a [`ProbeClient`](super::ProbeClient).
///
/// `status` is 0 when the request never produced an HTTP response; in that
/// case `transport_error` carries the reason.
#[derive(Debug, Clone, Default)]
pub struct TransportResult {
    pub status: u16,
    pub headers: HeaderMap,
    pub payload: Option<Bytes>,
    pub transport_error: Option<String>,
}

impl TransportResult {
    /// A response with the given status and no headers or body.
    pub fn with_status(status: u16) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    /// A request that failed before any HTTP status was received.
    pub fn transport_failure(reason: impl Into<String>) -> Self {
        Self {
            transport_error: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Adds a header. Invalid names or values are skipped.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    pub fn body(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn is_transport_failure(&self) -> bool {
        self.transport_error.is_some()
    }

    pub fn is_success(&self) -> bool {
        !self.is_transport_failure() && (200..300).contains(&self.status)
    }

    /// Transport failures and 5xx responses are worth retrying within a tick.
    pub fn is_transient(&self) -> bool {
        self.is_transport_failure() || (500..600).contains(&self.status)
    }

    /// First value of a header as text, trimmed.
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    pub fn etag(&self) -> Option<&str> {
        self.header_str(names::ETAG)
    }

    pub fn last_modified(&self) -> Option<&str> {
        self.header_str(names::LAST_MODIFIED)
    }

    /// Remaining freshness from `Cache-Control: max-age` minus `Age`.
    ///
    /// `None` when there is no max-age directive, when `no-cache`/`no-store`
    /// is present, or when the response is already stale.
    pub fn freshness_remaining(&self) -> Option<Duration> {
        let cache_control = self.header_str(names::CACHE_CONTROL)?;
        let mut max_age = None;
        for directive in cache_control.split(',').map(str::trim) {
            let lower = directive.to_ascii_lowercase();
            if lower == "no-cache" || lower == "no-store" {
                return None;
            }
            if let Some(value) = lower.strip_prefix("max-age=") {
                max_age = value.trim_matches('"').parse::<u64>().ok();
            }
        }
        let age = self
            .header_str(names::AGE)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        match max_age?.checked_sub(age) {
            Some(remaining) if remaining > 0 => Some(Duration::from_secs(remaining)),
            _ => None,
        }
    }
}

/// Validators to attach to the next outbound probe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConditionalHeaders {
    /// Sent as `If-None-Match`.
    pub if_none_match: Option<String>,
    /// Sent as `If-Modified-Since`.
    pub if_modified_since: Option<String>,
}

impl ConditionalHeaders {
    pub fn is_empty(&self) -> bool {
        self.if_none_match.is_none() && self.if_modified_since.is_none()
    }
}
