//! The probe seam between the engine and the outside world.
//!
//! The engine never talks to the network directly. Each scheduler holds a
//! [`ProbeClient`] that performs one conditional request per call and
//! reports what came back as a [`TransportResult`]:
//!
//! - [`transport`] - the raw result type and the validators sent with a probe
//! - [`http`] - a `reqwest`-backed client for HTTP endpoints

mod http;
mod transport;

use async_trait::async_trait;

pub use http::{HttpProbeClient, ProbeError};
pub use transport::{names, ConditionalHeaders, TransportResult};

/// Performs a single probe of one endpoint.
///
/// Implementations must not fail: anything that prevents a response is
/// reported through [`TransportResult::transport_failure`].
#[async_trait]
pub trait ProbeClient: Send + Sync {
    async fn probe(&self, conditional: &ConditionalHeaders) -> TransportResult;
}

