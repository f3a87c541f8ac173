//! Outbound request admission.
//!
//! - [`RateLimiter`] paces probes to a fixed rate, globally and per feed
//! - [`RateLimitHandler`] remembers how long a server told us to stay away

mod backoff;
mod rate_limiter;

pub use backoff::{server_advertised_wait, RateLimitHandler};
pub use rate_limiter::RateLimiter;
