//! feedpulse: adaptive change-driven polling for HTTP feeds.
//!
//! Each configured endpoint gets a [`poll::PollScheduler`] that learns how
//! often the endpoint really changes and probes densely only around the
//! predicted change. Changed payloads flow into a per-feed
//! [`pipeline::ProcessingPipeline`]. Outbound traffic is capped by a shared
//! [`limit::RateLimiter`] and server `429` responses are honoured through
//! [`limit::RateLimitHandler`].

pub mod config;
pub mod limit;
pub mod metrics;
pub mod pipeline;
pub mod poll;
pub mod probe;
pub mod util;
