//! Observability sink for the polling engine.
//!
//! Schedulers and pipelines report through [`MetricsSink`] so the
//! scheduling logic can be exercised without any metrics backend:
//!
//! - [`NoopMetrics`] discards everything
//! - [`InMemoryMetrics`] keeps lock-light per-feed counters that can be
//!   snapshotted for logging or assertions

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use crate::poll::PollMode;

/// Named event counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    /// A tick probed the endpoint.
    Tick,
    /// A probe was retried inside a tick.
    TransientRetry,
    /// The endpoint answered 429.
    RateLimited,
    /// A manual trigger arrived while a tick was running.
    TickOverlap,
    Changed,
    Unchanged,
    ProbeError,
    ProcessingSuccess,
    ProcessingError,
    ProcessingDropped,
}

/// Named duration distributions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timing {
    /// Delay armed for the next tick.
    PollInterval,
    /// Time a payload waited in the pipeline.
    ProcessingLag,
    /// Time the processor spent on a payload.
    ProcessingDuration,
}

/// Receives engine telemetry. Implementations must be cheap and non-blocking.
pub trait MetricsSink: Send + Sync {
    fn increment(&self, feed: &str, counter: Counter);

    fn record(&self, feed: &str, timing: Timing, value: Duration);

    /// Current mode gauge.
    fn set_mode(&self, feed: &str, mode: PollMode);

    fn mode_transition(&self, feed: &str, from: PollMode, to: PollMode);

    /// Signed error of the predicted change instant; positive means the
    /// change arrived later than predicted.
    fn phase_error(&self, feed: &str, error_ms: i64);
}

/// A sink that discards all telemetry.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment(&self, _feed: &str, _counter: Counter) {}
    fn record(&self, _feed: &str, _timing: Timing, _value: Duration) {}
    fn set_mode(&self, _feed: &str, _mode: PollMode) {}
    fn mode_transition(&self, _feed: &str, _from: PollMode, _to: PollMode) {}
    fn phase_error(&self, _feed: &str, _error_ms: i64) {}
}

/// Count/sum/min/max summary of a duration distribution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimingSummary {
    pub count: u64,
    pub total: Duration,
    pub min: Duration,
    pub max: Duration,
}

impl TimingSummary {
    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total / u32::try_from(self.count).unwrap_or(u32::MAX)
        }
    }
}

#[derive(Debug, Default)]
struct AtomicTiming {
    count: AtomicU64,
    total_us: AtomicU64,
    min_us: AtomicU64,
    max_us: AtomicU64,
}

impl AtomicTiming {
    fn record(&self, value: Duration) {
        let us = u64::try_from(value.as_micros()).unwrap_or(u64::MAX);
        // min starts at 0 meaning "unset"; the first sample claims it
        if self.count.fetch_add(1, Ordering::Relaxed) == 0 {
            self.min_us.store(us, Ordering::Relaxed);
        } else {
            self.min_us.fetch_min(us, Ordering::Relaxed);
        }
        self.total_us.fetch_add(us, Ordering::Relaxed);
        self.max_us.fetch_max(us, Ordering::Relaxed);
    }

    fn summary(&self) -> TimingSummary {
        TimingSummary {
            count: self.count.load(Ordering::Relaxed),
            total: Duration::from_micros(self.total_us.load(Ordering::Relaxed)),
            min: Duration::from_micros(self.min_us.load(Ordering::Relaxed)),
            max: Duration::from_micros(self.max_us.load(Ordering::Relaxed)),
        }
    }
}

#[derive(Debug, Default)]
struct FeedMetrics {
    ticks: AtomicU64,
    transient_retries: AtomicU64,
    rate_limited: AtomicU64,
    tick_overlaps: AtomicU64,
    changed: AtomicU64,
    unchanged: AtomicU64,
    probe_errors: AtomicU64,
    processing_success: AtomicU64,
    processing_errors: AtomicU64,
    processing_dropped: AtomicU64,
    poll_interval: AtomicTiming,
    processing_lag: AtomicTiming,
    processing_duration: AtomicTiming,
    last_phase_error_ms: AtomicI64,
    phase_error_abs_total_ms: AtomicU64,
    phase_error_count: AtomicU64,
    mode: Mutex<Option<PollMode>>,
    transitions: Mutex<BTreeMap<(PollMode, PollMode), u64>>,
}

impl FeedMetrics {
    fn counter(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::Tick => &self.ticks,
            Counter::TransientRetry => &self.transient_retries,
            Counter::RateLimited => &self.rate_limited,
            Counter::TickOverlap => &self.tick_overlaps,
            Counter::Changed => &self.changed,
            Counter::Unchanged => &self.unchanged,
            Counter::ProbeError => &self.probe_errors,
            Counter::ProcessingSuccess => &self.processing_success,
            Counter::ProcessingError => &self.processing_errors,
            Counter::ProcessingDropped => &self.processing_dropped,
        }
    }

    fn timing(&self, timing: Timing) -> &AtomicTiming {
        match timing {
            Timing::PollInterval => &self.poll_interval,
            Timing::ProcessingLag => &self.processing_lag,
            Timing::ProcessingDuration => &self.processing_duration,
        }
    }

    fn snapshot(&self) -> FeedMetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let phase_count = load(&self.phase_error_count);
        FeedMetricsSnapshot {
            ticks: load(&self.ticks),
            transient_retries: load(&self.transient_retries),
            rate_limited: load(&self.rate_limited),
            tick_overlaps: load(&self.tick_overlaps),
            changed: load(&self.changed),
            unchanged: load(&self.unchanged),
            probe_errors: load(&self.probe_errors),
            processing_success: load(&self.processing_success),
            processing_errors: load(&self.processing_errors),
            processing_dropped: load(&self.processing_dropped),
            poll_interval: self.poll_interval.summary(),
            processing_lag: self.processing_lag.summary(),
            processing_duration: self.processing_duration.summary(),
            last_phase_error_ms: (phase_count > 0)
                .then(|| self.last_phase_error_ms.load(Ordering::Relaxed)),
            mean_abs_phase_error_ms: (phase_count > 0)
                .then(|| load(&self.phase_error_abs_total_ms) / phase_count),
            mode: *self.mode.lock().unwrap_or_else(PoisonError::into_inner),
            transitions: self
                .transitions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }
}

/// Point-in-time copy of one feed's metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedMetricsSnapshot {
    pub ticks: u64,
    pub transient_retries: u64,
    pub rate_limited: u64,
    pub tick_overlaps: u64,
    pub changed: u64,
    pub unchanged: u64,
    pub probe_errors: u64,
    pub processing_success: u64,
    pub processing_errors: u64,
    pub processing_dropped: u64,
    pub poll_interval: TimingSummary,
    pub processing_lag: TimingSummary,
    pub processing_duration: TimingSummary,
    pub last_phase_error_ms: Option<i64>,
    pub mean_abs_phase_error_ms: Option<u64>,
    pub mode: Option<PollMode>,
    pub transitions: BTreeMap<(PollMode, PollMode), u64>,
}

impl FeedMetricsSnapshot {
    /// How many times the feed moved from `from` to `to`.
    pub fn transition_count(&self, from: PollMode, to: PollMode) -> u64 {
        self.transitions.get(&(from, to)).copied().unwrap_or(0)
    }
}

/// Per-feed atomic counters held in memory.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    feeds: RwLock<HashMap<String, Arc<FeedMetrics>>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn feed(&self, feed: &str) -> Arc<FeedMetrics> {
        if let Some(metrics) = self
            .feeds
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(feed)
        {
            return Arc::clone(metrics);
        }
        let mut feeds = self.feeds.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(feeds.entry(feed.to_owned()).or_default())
    }

    /// Snapshot of one feed; all zeros if the feed never reported.
    pub fn snapshot(&self, feed: &str) -> FeedMetricsSnapshot {
        self.feeds
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(feed)
            .map(|m| m.snapshot())
            .unwrap_or_default()
    }

    /// Snapshots of every feed that has reported, sorted by name.
    pub fn snapshot_all(&self) -> BTreeMap<String, FeedMetricsSnapshot> {
        self.feeds
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, m)| (name.clone(), m.snapshot()))
            .collect()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment(&self, feed: &str, counter: Counter) {
        self.feed(feed).counter(counter).fetch_add(1, Ordering::Relaxed);
    }

    fn record(&self, feed: &str, timing: Timing, value: Duration) {
        self.feed(feed).timing(timing).record(value);
    }

    fn set_mode(&self, feed: &str, mode: PollMode) {
        let metrics = self.feed(feed);
        *metrics.mode.lock().unwrap_or_else(PoisonError::into_inner) = Some(mode);
    }

    fn mode_transition(&self, feed: &str, from: PollMode, to: PollMode) {
        let metrics = self.feed(feed);
        *metrics
            .transitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry((from, to))
            .or_insert(0) += 1;
    }

    fn phase_error(&self, feed: &str, error_ms: i64) {
        let metrics = self.feed(feed);
        metrics.last_phase_error_ms.store(error_ms, Ordering::Relaxed);
        metrics
            .phase_error_abs_total_ms
            .fetch_add(error_ms.unsigned_abs(), Ordering::Relaxed);
        metrics.phase_error_count.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_sinks_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopMetrics>();
        assert_send_sync::<InMemoryMetrics>();
    }

    #[test]
    fn test_unknown_feed_snapshot_is_empty() {
        let metrics = InMemoryMetrics::new();
        assert_eq!(metrics.snapshot("nope"), FeedMetricsSnapshot::default());
    }

    #[test]
    fn test_counters_are_per_feed() {
        let metrics = InMemoryMetrics::new();
        metrics.increment("a", Counter::Tick);
        metrics.increment("a", Counter::Tick);
        metrics.increment("b", Counter::RateLimited);

        assert_eq!(metrics.snapshot("a").ticks, 2);
        assert_eq!(metrics.snapshot("a").rate_limited, 0);
        assert_eq!(metrics.snapshot("b").rate_limited, 1);
        assert_eq!(metrics.snapshot_all().len(), 2);
    }

    #[test]
    fn test_timing_summary() {
        let metrics = InMemoryMetrics::new();
        for ms in [30, 10, 20] {
            metrics.record("a", Timing::PollInterval, Duration::from_millis(ms));
        }

        let summary = metrics.snapshot("a").poll_interval;
        assert_eq!(summary.count, 3);
        assert_eq!(summary.min, Duration::from_millis(10));
        assert_eq!(summary.max, Duration::from_millis(30));
        assert_eq!(summary.mean(), Duration::from_millis(20));
    }

    #[test]
    fn test_transitions_and_mode_gauge() {
        let metrics = InMemoryMetrics::new();
        metrics.set_mode("a", PollMode::Warmup);
        metrics.mode_transition("a", PollMode::Warmup, PollMode::Steady);
        metrics.set_mode("a", PollMode::Steady);
        metrics.mode_transition("a", PollMode::Steady, PollMode::Burst);
        metrics.mode_transition("a", PollMode::Steady, PollMode::Burst);

        let snapshot = metrics.snapshot("a");
        assert_eq!(snapshot.mode, Some(PollMode::Steady));
        assert_eq!(snapshot.transition_count(PollMode::Warmup, PollMode::Steady), 1);
        assert_eq!(snapshot.transition_count(PollMode::Steady, PollMode::Burst), 2);
        assert_eq!(snapshot.transition_count(PollMode::Burst, PollMode::Backoff), 0);
    }

    #[test]
    fn test_phase_error_tracking() {
        let metrics = InMemoryMetrics::new();
        metrics.phase_error("a", -400);
        metrics.phase_error("a", 200);

        let snapshot = metrics.snapshot("a");
        assert_eq!(snapshot.last_phase_error_ms, Some(200));
        assert_eq!(snapshot.mean_abs_phase_error_ms, Some(300));
    }
}
