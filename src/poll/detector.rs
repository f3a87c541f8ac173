use crate::probe::{ConditionalHeaders, TransportResult};

use super::ChangeDecision;

/// Decides whether a probe saw new content, using the cheapest validator
/// the response offers.
///
/// Validators are compared in priority order ETag → Last-Modified →
/// content hash, and stored only when a change is recorded. A response with
/// no validator at all is never reported as a change.
#[derive(Debug, Clone, Default)]
pub struct ChangeDetector {
    etag: Option<String>,
    last_modified: Option<String>,
    content_hash: Option<String>,
}

impl ChangeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classifies `result`. `fallback_hash` is the payload digest, used only
    /// when the response has neither an ETag nor a Last-Modified header.
    pub fn evaluate(&mut self, result: &TransportResult, fallback_hash: Option<&str>) -> ChangeDecision {
        if result.is_transport_failure() {
            return ChangeDecision::Error;
        }
        match result.status {
            304 => return ChangeDecision::NoChange,
            429 => return ChangeDecision::RateLimited,
            200..=299 => {}
            _ => return ChangeDecision::Error,
        }

        let etag = result.etag();
        let last_modified = result.last_modified();

        let changed = if let Some(etag) = etag {
            self.etag.as_deref() != Some(etag)
        } else if let Some(last_modified) = last_modified {
            self.last_modified.as_deref() != Some(last_modified)
        } else if let Some(hash) = fallback_hash {
            self.content_hash.as_deref() != Some(hash)
        } else {
            return ChangeDecision::NoChange;
        };

        if !changed {
            return ChangeDecision::NoChange;
        }

        self.etag = etag.map(str::to_owned);
        self.last_modified = last_modified.map(str::to_owned);
        self.content_hash = fallback_hash.map(str::to_owned);
        ChangeDecision::Changed
    }

    /// Validators to send with the next probe.
    pub fn conditional_headers(&self) -> ConditionalHeaders {
        ConditionalHeaders {
            if_none_match: self.etag.clone(),
            if_modified_since: self.last_modified.clone(),
        }
    }
}
