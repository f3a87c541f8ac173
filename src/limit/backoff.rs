use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::probe::names;

/// Epoch values above this are milliseconds; between this and
/// [`EPOCH_SECONDS_THRESHOLD`] they are seconds; below, delta-seconds.
const EPOCH_MILLIS_THRESHOLD: u64 = 100_000_000_000;
const EPOCH_SECONDS_THRESHOLD: u64 = 1_000_000_000;

/// Tracks the server-imposed "blocked until" deadline for one feed.
///
/// The deadline is stored as milliseconds past a fixed anchor in a single
/// atomic, raised with `fetch_max`, so it never moves backwards no matter
/// how 429 responses interleave.
#[derive(Debug)]
pub struct RateLimitHandler {
    anchor: Instant,
    fallback_cooldown: Duration,
    max_wait: Duration,
    blocked_until_ms: AtomicU64,
}

impl RateLimitHandler {
    /// Longest server-advertised wait honoured by default.
    pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

    pub fn new(fallback_cooldown: Duration) -> Self {
        Self {
            anchor: Instant::now(),
            fallback_cooldown,
            max_wait: Self::DEFAULT_MAX_WAIT,
            blocked_until_ms: AtomicU64::new(0),
        }
    }

    /// Caps how long a single response can block the feed.
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Records a 429 response received at `now` and returns how long the
    /// feed is now blocked for.
    pub fn on_429(&self, headers: &HeaderMap, now: Instant) -> Duration {
        self.on_429_at(headers, now, Utc::now())
    }

    /// Like [`on_429`](Self::on_429) with an explicit wall clock, used to
    /// resolve HTTP-dates and epoch resets.
    pub fn on_429_at(&self, headers: &HeaderMap, now: Instant, wall_now: DateTime<Utc>) -> Duration {
        let mut server_wait = server_advertised_wait(headers, wall_now).unwrap_or(Duration::ZERO);
        if server_wait > self.max_wait {
            tracing::warn!(
                advertised_secs = server_wait.as_secs(),
                cap_secs = self.max_wait.as_secs(),
                "Server-advertised wait is implausibly long, capping it"
            );
            server_wait = self.max_wait;
        }
        let wait = server_wait.max(self.fallback_cooldown);

        let candidate = self.offset_ms(now).saturating_add(duration_ms(wait));
        let previous = self.blocked_until_ms.fetch_max(candidate, Ordering::AcqRel);
        if previous > candidate {
            tracing::debug!(
                kept_ms = previous,
                offered_ms = candidate,
                "Existing rate-limit deadline is later, keeping it"
            );
        }
        self.blocked_for(now)
    }

    /// Time remaining until the deadline, or zero once it has passed.
    pub fn blocked_for(&self, now: Instant) -> Duration {
        let deadline = self.blocked_until_ms.load(Ordering::Acquire);
        Duration::from_millis(deadline.saturating_sub(self.offset_ms(now)))
    }

    pub fn is_blocked(&self, now: Instant) -> bool {
        !self.blocked_for(now).is_zero()
    }

    fn offset_ms(&self, now: Instant) -> u64 {
        duration_ms(now.saturating_duration_since(self.anchor))
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Longest wait advertised by `Retry-After`, `RateLimit-Reset` or
/// `X-RateLimit-Reset`.
pub fn server_advertised_wait(headers: &HeaderMap, wall_now: DateTime<Utc>) -> Option<Duration> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    let retry_after = header(names::RETRY_AFTER).and_then(|v| parse_retry_after(v, wall_now));
    let reset = header(names::RATELIMIT_RESET)
        .or_else(|| header(names::X_RATELIMIT_RESET))
        .and_then(|v| parse_reset(v, wall_now));

    match (retry_after, reset) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

/// `Retry-After` is either delta-seconds or an HTTP-date.
fn parse_retry_after(value: &str, wall_now: DateTime<Utc>) -> Option<Duration> {
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let date = DateTime::parse_from_rfc2822(value).ok()?;
    let delta = date.with_timezone(&Utc) - wall_now;
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

/// Reset headers come as delta-seconds or absolute epoch seconds/millis.
fn parse_reset(value: &str, wall_now: DateTime<Utc>) -> Option<Duration> {
    let raw = value.parse::<f64>().ok().filter(|v| v.is_finite() && *v >= 0.0)?;
    // Whole units are all the precision these headers carry
    let whole = raw.ceil() as u64;

    if whole >= EPOCH_MILLIS_THRESHOLD {
        let now_ms = u64::try_from(wall_now.timestamp_millis()).unwrap_or(0);
        Some(Duration::from_millis(whole.saturating_sub(now_ms)))
    } else if whole >= EPOCH_SECONDS_THRESHOLD {
        let now_s = u64::try_from(wall_now.timestamp()).unwrap_or(0);
        Some(Duration::from_secs(whole.saturating_sub(now_s)))
    } else {
        Some(Duration::from_secs_f64(raw))
    }
}
