use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::EndpointConfig;
use crate::limit::RateLimitHandler;
use crate::metrics::MetricsSink;
use crate::probe::TransportResult;

use super::{ChangeDecision, PeriodEstimator, PollExecution, PollMode, PollerState};

/// One feed's scheduling state machine.
///
/// Pure decision logic: given the outcome of a tick and the current
/// instant, [`apply`](Self::apply) updates the feed state and returns how
/// long to wait before the next tick. It never sleeps or does I/O, so the
/// whole mode graph can be driven with synthetic instants.
pub struct PollMachine {
    name: Arc<str>,
    config: Arc<EndpointConfig>,
    state: PollerState,
    estimator: PeriodEstimator,
    rate_limit: RateLimitHandler,
    metrics: Arc<dyn MetricsSink>,
}

impl PollMachine {
    pub fn new(config: Arc<EndpointConfig>, metrics: Arc<dyn MetricsSink>) -> Self {
        let estimator = PeriodEstimator::new(
            config.estimator_window_size,
            config.ema_alpha,
            config.period_hint(),
            config.min_period(),
            config.max_period(),
        );
        Self {
            name: Arc::from(config.name.as_str()),
            state: PollerState::new(config.period_hint()),
            rate_limit: RateLimitHandler::new(config.backoff_interval()),
            estimator,
            config,
            metrics,
        }
    }

    pub fn state(&self) -> &PollerState {
        &self.state
    }

    pub fn estimator(&self) -> &PeriodEstimator {
        &self.estimator
    }

    /// Starts the warmup clock. Called once, right before the first tick.
    pub fn begin(&mut self, now: Instant) {
        if self.state.warmup_started_at.is_none() {
            self.state.warmup_started_at = Some(now);
        }
        self.metrics.set_mode(&self.name, self.state.mode);
    }

    /// Remaining server-imposed block, if any.
    pub fn blocked_for(&self, now: Instant) -> Duration {
        self.rate_limit.blocked_for(now)
    }

    /// Lead time before a predicted change at which probing starts.
    ///
    /// Widens with change-timing jitter, bounded by config.
    pub fn guard_window(&self) -> Duration {
        let base = Duration::from_millis(self.config.guard_window_ms);
        let widened = base + self.estimator.jitter_mad() * 2;
        widened.clamp(
            Duration::from_millis(self.config.guard_window_min_ms),
            Duration::from_millis(self.config.guard_window_max_ms),
        )
    }

    /// Folds one tick's outcome into the state and returns the next delay.
    pub fn apply(&mut self, execution: &PollExecution, now: Instant) -> Duration {
        self.state.last_poll_at = Some(now);
        match execution.decision {
            ChangeDecision::Changed => self.on_changed(execution.changed_at, now),
            ChangeDecision::NoChange => self.on_no_change(&execution.result, now),
            ChangeDecision::RateLimited => self.on_rate_limited(&execution.result, now),
            ChangeDecision::Error => self.on_error(),
        }
    }

    fn on_changed(&mut self, changed_at: Instant, now: Instant) -> Duration {
        if let Some(previous) = self.state.last_change_at {
            if changed_at > previous {
                self.estimator.observe_delta(changed_at - previous);
            }
        }
        if let Some(expected) = self.state.expected_next_change_at {
            self.metrics.phase_error(&self.name, signed_millis(changed_at, expected));
        }

        self.state.last_change_at = Some(changed_at);
        self.state.estimated_period = self.estimator.estimate();
        self.state.miss_count = 0;
        self.state.consecutive_errors = 0;
        self.state.update_count += 1;
        self.state.burst_started_at = None;

        let target = changed_at + self.state.estimated_period;
        self.state.expected_next_change_at = Some(target);

        if self.state.mode == PollMode::Warmup {
            tracing::info!(
                feed = %self.name,
                period_ms = self.state.estimated_period_millis(),
                "Warmup ended by first change"
            );
        }
        self.transition(PollMode::Steady);

        target
            .checked_sub(self.guard_window())
            .map(|start| start.saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    fn on_no_change(&mut self, result: &TransportResult, now: Instant) -> Duration {
        self.state.miss_count += 1;

        let delay = match self.state.mode {
            PollMode::Warmup => {
                if self.warmup_expired(now) {
                    self.finish_warmup(now)
                } else {
                    self.config.warmup_interval()
                }
            }
            PollMode::Steady => {
                self.state.burst_started_at = Some(now);
                self.transition(PollMode::Burst);
                self.config.burst_interval()
            }
            PollMode::Burst => {
                let started = *self.state.burst_started_at.get_or_insert(now);
                if now.saturating_duration_since(started) <= self.config.burst_window() {
                    self.config.burst_interval()
                } else {
                    self.state.burst_started_at = None;
                    self.transition(PollMode::Backoff);
                    self.config.backoff_interval()
                }
            }
            // Backoff is a single cooldown step on this path
            PollMode::Backoff => {
                self.transition(PollMode::Steady);
                self.steady_delay(now)
            }
        };

        // Polling inside the server's freshness window cannot see anything new
        match result.freshness_remaining() {
            Some(fresh) if fresh > delay => fresh.min(delay.max(self.config.max_period())),
            _ => delay,
        }
    }

    fn on_rate_limited(&mut self, result: &TransportResult, now: Instant) -> Duration {
        let blocked = self.rate_limit.on_429(&result.headers, now);
        self.transition(PollMode::Backoff);
        tracing::warn!(
            feed = %self.name,
            blocked_ms = blocked.as_millis() as u64,
            "Rate limited by server, backing off"
        );
        blocked.max(self.config.backoff_interval())
    }

    fn on_error(&mut self) -> Duration {
        self.state.consecutive_errors += 1;
        self.transition(PollMode::Backoff);
        self.config.backoff_interval()
    }

    fn warmup_expired(&mut self, now: Instant) -> bool {
        let started = *self.state.warmup_started_at.get_or_insert(now);
        now.saturating_duration_since(started) >= self.config.warmup_max()
    }

    fn finish_warmup(&mut self, now: Instant) -> Duration {
        // A change always leaves Warmup, so samples only exist here when
        // Warmup is entered again with history already collected
        self.state.estimated_period = if self.estimator.sample_count() >= 2 {
            self.estimator.estimate()
        } else {
            self.config.period_hint()
        };
        self.transition(PollMode::Steady);
        tracing::info!(
            feed = %self.name,
            samples = self.estimator.sample_count(),
            period_ms = self.state.estimated_period_millis(),
            "Warmup finished"
        );
        self.steady_delay(now)
    }

    /// Delay until the guard window before the next predicted change.
    ///
    /// Projects forward whole periods from the last change so a prediction
    /// that is already behind us never yields a zero delay.
    fn steady_delay(&mut self, now: Instant) -> Duration {
        let period = self.state.estimated_period.max(Duration::from_millis(1));
        let guard = self.guard_window();

        let Some(last_change) = self.state.last_change_at else {
            self.state.expected_next_change_at = None;
            return period.saturating_sub(guard).max(self.config.burst_interval());
        };

        // Smallest k >= 1 with last_change + k*period - guard > now
        let behind = now.saturating_duration_since(last_change) + guard;
        let k = behind.as_millis() / period.as_millis().max(1) + 1;
        let target = last_change + period * u32::try_from(k).unwrap_or(u32::MAX);
        self.state.expected_next_change_at = Some(target);

        target
            .checked_sub(guard)
            .map(|start| start.saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    fn transition(&mut self, to: PollMode) {
        let from = self.state.mode;
        if from == to {
            return;
        }
        self.state.mode = to;
        self.metrics.mode_transition(&self.name, from, to);
        self.metrics.set_mode(&self.name, to);
        tracing::debug!(feed = %self.name, from = %from, to = %to, "Mode transition");
    }
}

fn signed_millis(actual: Instant, expected: Instant) -> i64 {
    if actual >= expected {
        i64::try_from((actual - expected).as_millis()).unwrap_or(i64::MAX)
    } else {
        -i64::try_from((expected - actual).as_millis()).unwrap_or(i64::MAX)
    }
}
