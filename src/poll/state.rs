use bytes::Bytes;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

use crate::probe::TransportResult;

/// Scheduling mode of one feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PollMode {
    /// Dense probing to bootstrap the period estimate.
    Warmup,
    /// Sleeping until just before the next predicted change.
    Steady,
    /// Dense probing around a predicted change that has not shown up yet.
    Burst,
    /// Cooling down after an error, a rate limit, or an unproductive burst.
    Backoff,
}

impl PollMode {
    pub const ALL: [PollMode; 4] = [
        PollMode::Warmup,
        PollMode::Steady,
        PollMode::Burst,
        PollMode::Backoff,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PollMode::Warmup => "warmup",
            PollMode::Steady => "steady",
            PollMode::Burst => "burst",
            PollMode::Backoff => "backoff",
        }
    }
}

impl fmt::Display for PollMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a probe result compares with what was seen before.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeDecision {
    Changed,
    NoChange,
    RateLimited,
    Error,
}

/// Mutable scheduling state of one feed.
///
/// Only the feed's tick task mutates this; everyone else sees clones
/// published through [`PollScheduler::snapshot_state`](super::PollScheduler::snapshot_state).
#[derive(Debug, Clone, PartialEq)]
pub struct PollerState {
    pub mode: PollMode,
    pub warmup_started_at: Option<Instant>,
    pub burst_started_at: Option<Instant>,
    pub last_poll_at: Option<Instant>,
    pub last_change_at: Option<Instant>,
    pub estimated_period: Duration,
    pub expected_next_change_at: Option<Instant>,
    pub miss_count: u64,
    pub update_count: u64,
    pub consecutive_errors: u64,
}

impl PollerState {
    pub fn new(period_hint: Duration) -> Self {
        Self {
            mode: PollMode::Warmup,
            warmup_started_at: None,
            burst_started_at: None,
            last_poll_at: None,
            last_change_at: None,
            estimated_period: period_hint,
            expected_next_change_at: None,
            miss_count: 0,
            update_count: 0,
            consecutive_errors: 0,
        }
    }

    pub fn estimated_period_millis(&self) -> u64 {
        u64::try_from(self.estimated_period.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Everything one tick learned, handed from the probe step to the state machine.
#[derive(Debug, Clone)]
pub struct PollExecution {
    pub decision: ChangeDecision,
    /// Present only for `Changed` decisions with a body.
    pub payload: Option<Bytes>,
    /// Best estimate of when the observed change happened.
    pub changed_at: Instant,
    pub result: TransportResult,
}
