use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Paces requests to a fixed rate by handing out time slots.
///
/// Each reservation claims the next free slot and pushes the following one
/// `1/rps` further out. Callers wait until their slot instead of racing for
/// the next one, so concurrent reservations never lose a slot. One instance
/// is shared by every feed as the global ceiling; each feed also owns a
/// private instance for its burst ceiling.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    next_allowed: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// Longest spacing between slots: one request per day.
    pub const MAX_INTERVAL: Duration = Duration::from_secs(86_400);

    /// Slowest rate a config may ask for.
    pub const MIN_RATE: f64 = 1.0 / 86_400.0;

    /// A limiter admitting `requests_per_second` requests per second.
    ///
    /// Non-positive or non-finite rates disable pacing. Slower rates than
    /// [`MIN_RATE`](Self::MIN_RATE) are paced at [`MAX_INTERVAL`](Self::MAX_INTERVAL).
    pub fn new(requests_per_second: f64) -> Self {
        let interval = if requests_per_second.is_finite() && requests_per_second > 0.0 {
            Duration::try_from_secs_f64(1.0 / requests_per_second)
                .unwrap_or(Self::MAX_INTERVAL)
                .min(Self::MAX_INTERVAL)
        } else {
            Duration::ZERO
        };
        Self {
            interval,
            next_allowed: Mutex::new(None),
        }
    }

    /// Spacing between consecutive slots.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Reserves the next slot and returns how long to wait for it.
    pub fn reserve_delay(&self) -> Duration {
        self.reserve_delay_at(Instant::now())
    }

    pub fn reserve_delay_at(&self, now: Instant) -> Duration {
        // The guarded value is a plain instant, so a poisoned lock is still usable
        let mut next_allowed = self.next_allowed.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = match *next_allowed {
            Some(next) if next > now => next,
            _ => now,
        };
        *next_allowed = Some(slot + self.interval);
        slot - now
    }

    /// Reserves a slot and sleeps until it arrives. Returns the time waited.
    pub async fn acquire(&self) -> Duration {
        let delay = self.reserve_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        delay
    }
}
