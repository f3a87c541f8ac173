use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::{IF_MODIFIED_SINCE, IF_NONE_MATCH};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use super::transport::{ConditionalHeaders, TransportResult};
use super::ProbeClient;

const MAX_PAYLOAD_SIZE: usize = 10 * 1024 * 1024; // 10MB

/// Failures that prevent a probe from producing a usable HTTP response.
///
/// These never reach callers as `Err`; [`HttpProbeClient`] folds them into
/// [`TransportResult::transport_failure`] so the scheduler can retry them.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// Request exceeded the configured timeout
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    /// Response body exceeded the size limit
    #[error("Response too large (exceeds {0} bytes)")]
    ResponseTooLarge(usize),
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
}

/// Probes one endpoint over HTTP with conditional GET requests.
#[derive(Debug, Clone)]
pub struct HttpProbeClient {
    client: reqwest::Client,
    url: Url,
    timeout: Duration,
    max_payload: usize,
}

impl HttpProbeClient {
    pub fn new(client: reqwest::Client, url: Url, timeout: Duration) -> Self {
        Self {
            client,
            url,
            timeout,
            max_payload: MAX_PAYLOAD_SIZE,
        }
    }

    /// Overrides the 10MB body limit.
    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn fetch(&self, conditional: &ConditionalHeaders) -> Result<TransportResult, ProbeError> {
        let mut request = self.client.get(self.url.clone());
        if let Some(etag) = &conditional.if_none_match {
            request = request.header(IF_NONE_MATCH, etag.as_str());
        }
        if let Some(last_modified) = &conditional.if_modified_since {
            request = request.header(IF_MODIFIED_SINCE, last_modified.as_str());
        }

        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| ProbeError::Timeout(self.timeout))??;

        let status = response.status().as_u16();
        let headers = response.headers().clone();

        // Only successful responses carry a payload worth reading
        let payload = if response.status().is_success() {
            let bytes = tokio::time::timeout(self.timeout, read_limited_bytes(response, self.max_payload))
                .await
                .map_err(|_| ProbeError::Timeout(self.timeout))??;
            Some(bytes)
        } else {
            None
        };

        Ok(TransportResult {
            status,
            headers,
            payload,
            transport_error: None,
        })
    }
}

#[async_trait]
impl ProbeClient for HttpProbeClient {
    async fn probe(&self, conditional: &ConditionalHeaders) -> TransportResult {
        match self.fetch(conditional).await {
            Ok(result) => result,
            Err(e) => {
                tracing::debug!(url = %self.url, error = %e, "Probe transport failure");
                TransportResult::transport_failure(e.to_string())
            }
        }
    }
}

async fn read_limited_bytes(response: reqwest::Response, limit: usize) -> Result<Bytes, ProbeError> {
    // Capture Content-Length for completeness check
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if len > limit as u64 {
            return Err(ProbeError::ResponseTooLarge(limit));
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(ProbeError::ResponseTooLarge(limit));
        }
        bytes.extend_from_slice(&chunk);
    }

    // A short read surfaces as a transport failure so the tick retries it
    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(ProbeError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(Bytes::from(bytes))
}
