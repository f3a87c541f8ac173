use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::EndpointConfig;
use crate::limit::RateLimiter;
use crate::metrics::{Counter, MetricsSink, Timing};
use crate::pipeline::ProcessingPipeline;
use crate::probe::{ProbeClient, TransportResult};
use crate::util::content_hash;

use super::{ChangeDecision, ChangeDetector, PollExecution, PollMachine, PollerState};

/// First pause between transient retries; doubles per attempt.
const RETRY_BASE: Duration = Duration::from_millis(250);
const RETRY_MAX: Duration = Duration::from_millis(1000);

/// Drives one feed: probes on a timer, classifies results, and arms the
/// next tick from the state machine's answer.
///
/// All mutable polling state lives inside a single tick task spawned by
/// [`start`](Self::start). The handle only holds what callers need to
/// observe or stop it.
pub struct PollScheduler {
    name: Arc<str>,
    cancel: CancellationToken,
    wake: Arc<Notify>,
    in_flight: Arc<AtomicBool>,
    snapshots: watch::Receiver<PollerState>,
    pipeline: Arc<ProcessingPipeline>,
    metrics: Arc<dyn MetricsSink>,
    pending: Mutex<Option<TickTask>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PollScheduler {
    pub fn new(
        config: Arc<EndpointConfig>,
        probe: Arc<dyn ProbeClient>,
        global: Arc<RateLimiter>,
        pipeline: Arc<ProcessingPipeline>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let name: Arc<str> = Arc::from(config.name.as_str());
        let cancel = CancellationToken::new();
        let wake = Arc::new(Notify::new());
        let in_flight = Arc::new(AtomicBool::new(false));

        let machine = PollMachine::new(config.clone(), metrics.clone());
        let (publisher, snapshots) = watch::channel(machine.state().clone());

        let task = TickTask {
            name: name.clone(),
            burst: RateLimiter::new(config.max_burst_rate),
            config,
            machine,
            detector: ChangeDetector::new(),
            probe,
            global,
            pipeline: pipeline.clone(),
            metrics: metrics.clone(),
            cancel: cancel.clone(),
            wake: wake.clone(),
            in_flight: in_flight.clone(),
            publisher,
        };

        Self {
            name,
            cancel,
            wake,
            in_flight,
            snapshots,
            pipeline,
            metrics,
            pending: Mutex::new(Some(task)),
            handle: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawns the tick task; the first probe runs immediately.
    ///
    /// Returns `false` if the scheduler was already started or stopped.
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        let task = self.pending.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(task) = task else {
            return false;
        };
        tracing::info!(feed = %self.name, "Starting scheduler");
        let handle = tokio::spawn(task.run());
        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        true
    }

    /// Cancels the next unstarted tick and closes the pipeline.
    ///
    /// A tick already probing is left to finish.
    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            tracing::info!(feed = %self.name, "Stopping scheduler");
        }
        self.cancel.cancel();
        self.pipeline.close();
    }

    /// Stops and waits for the tick task and pipeline worker to exit.
    pub async fn shutdown(&self) {
        self.stop();
        let handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(feed = %self.name, error = %e, "Tick task failed");
            }
        }
        self.pipeline.shutdown().await;
    }

    /// Requests an immediate tick.
    ///
    /// Skipped, and counted as an overlap, while a tick is in flight.
    pub fn poll_now(&self) -> bool {
        if self.in_flight.load(Ordering::Acquire) {
            self.metrics.increment(&self.name, Counter::TickOverlap);
            tracing::debug!(feed = %self.name, "Tick already in flight, skipping manual poll");
            return false;
        }
        self.wake.notify_one();
        true
    }

    /// Copy of the feed state as of the last completed tick.
    pub fn snapshot_state(&self) -> PollerState {
        self.snapshots.borrow().clone()
    }

    /// Receiver that sees every published state.
    pub fn snapshots(&self) -> watch::Receiver<PollerState> {
        self.snapshots.clone()
    }

    pub fn is_polling(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn pipeline(&self) -> &ProcessingPipeline {
        &self.pipeline
    }
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// The single writer of one feed's polling state.
struct TickTask {
    name: Arc<str>,
    config: Arc<EndpointConfig>,
    machine: PollMachine,
    detector: ChangeDetector,
    probe: Arc<dyn ProbeClient>,
    global: Arc<RateLimiter>,
    burst: RateLimiter,
    pipeline: Arc<ProcessingPipeline>,
    metrics: Arc<dyn MetricsSink>,
    cancel: CancellationToken,
    wake: Arc<Notify>,
    in_flight: Arc<AtomicBool>,
    publisher: watch::Sender<PollerState>,
}

impl TickTask {
    async fn run(mut self) {
        let mut next = Instant::now();
        self.machine.begin(next);
        self.publish();

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep_until(next) => {}
                _ = self.wake.notified() => {
                    tracing::debug!(feed = %self.name, "Manual poll");
                }
            }

            self.in_flight.store(true, Ordering::Release);
            let delay = self.tick().await;
            self.in_flight.store(false, Ordering::Release);

            self.metrics.record(&self.name, Timing::PollInterval, delay);
            next = Instant::now() + delay;
            self.publish();
            tracing::debug!(
                feed = %self.name,
                mode = %self.machine.state().mode,
                delay_ms = delay.as_millis() as u64,
                "Next tick armed"
            );
        }

        tracing::info!(feed = %self.name, "Scheduler stopped");
    }

    async fn tick(&mut self) -> Duration {
        let blocked = self.machine.blocked_for(Instant::now());
        if !blocked.is_zero() {
            tracing::debug!(
                feed = %self.name,
                blocked_ms = blocked.as_millis() as u64,
                "Server rate limit still active, skipping probe"
            );
            return blocked;
        }

        // Both slots are reserved up front; waiting for the later one honours both
        let wait = self.global.reserve_delay().max(self.burst.reserve_delay());
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }

        let previous_poll = self.machine.state().last_poll_at;
        let result = self.probe_with_retries().await;
        let now = Instant::now();

        let hash = result
            .payload
            .as_deref()
            .filter(|_| result.is_success())
            .map(content_hash);
        let decision = self.detector.evaluate(&result, hash.as_deref());
        self.count(decision, &result);

        let (payload, changed_at) = if decision == ChangeDecision::Changed {
            (
                result.payload.clone(),
                change_instant(&result, previous_poll, now, Utc::now()),
            )
        } else {
            (None, now)
        };

        if let Some(payload) = &payload {
            self.pipeline.submit(payload.clone());
        }

        let execution = PollExecution {
            decision,
            payload,
            changed_at,
            result,
        };
        self.machine.apply(&execution, now)
    }

    async fn probe_with_retries(&self) -> TransportResult {
        let conditional = self.detector.conditional_headers();
        let mut attempt = 0u32;
        loop {
            let result = self.probe.probe(&conditional).await;
            if !result.is_transient() || attempt >= self.config.transient_retries {
                return result;
            }
            attempt += 1;
            let pause = retry_pause(attempt);
            self.metrics.increment(&self.name, Counter::TransientRetry);
            tracing::warn!(
                feed = %self.name,
                attempt,
                status = result.status,
                error = result.transport_error.as_deref().unwrap_or(""),
                pause_ms = pause.as_millis() as u64,
                "Transient probe failure, retrying"
            );
            tokio::time::sleep(pause).await;
        }
    }

    fn count(&self, decision: ChangeDecision, result: &TransportResult) {
        self.metrics.increment(&self.name, Counter::Tick);
        let counter = match decision {
            ChangeDecision::Changed => Counter::Changed,
            ChangeDecision::NoChange => Counter::Unchanged,
            ChangeDecision::RateLimited => Counter::RateLimited,
            ChangeDecision::Error => {
                tracing::warn!(
                    feed = %self.name,
                    status = result.status,
                    error = result.transport_error.as_deref().unwrap_or(""),
                    "Probe failed"
                );
                Counter::ProbeError
            }
        };
        self.metrics.increment(&self.name, counter);
    }

    fn publish(&self) {
        self.publisher.send_replace(self.machine.state().clone());
    }
}

/// Pause before retry number `attempt` (1-based).
fn retry_pause(attempt: u32) -> Duration {
    RETRY_BASE
        .saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
        .min(RETRY_MAX)
}

/// When the observed change most likely happened.
///
/// A Last-Modified stamp that falls between the previous poll and now pins
/// the change more precisely than the probe time does.
fn change_instant(
    result: &TransportResult,
    previous_poll: Option<Instant>,
    now: Instant,
    wall_now: DateTime<Utc>,
) -> Instant {
    let Some(previous_poll) = previous_poll else {
        return now;
    };
    let Some(modified) = result
        .last_modified()
        .and_then(|value| DateTime::parse_from_rfc2822(value).ok())
    else {
        return now;
    };
    let Ok(age) = (wall_now - modified.with_timezone(&Utc)).to_std() else {
        return now;
    };
    match now.checked_sub(age) {
        Some(at) if at > previous_poll => at,
        _ => now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_retry_pause_doubles_and_caps() {
        assert_eq!(retry_pause(1), Duration::from_millis(250));
        assert_eq!(retry_pause(2), Duration::from_millis(500));
        assert_eq!(retry_pause(3), Duration::from_millis(1000));
        assert_eq!(retry_pause(9), Duration::from_millis(1000));
    }

    fn wall() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_change_instant_backdates_to_last_modified() {
        let now = Instant::now() + Duration::from_secs(600);
        let previous = now - Duration::from_secs(60);
        let result = TransportResult::with_status(200)
            .header("Last-Modified", "Fri, 01 Mar 2024 11:59:30 GMT");

        let at = change_instant(&result, Some(previous), now, wall());
        assert_eq!(at, now - Duration::from_secs(30));
    }

    #[test]
    fn test_change_instant_ignores_stale_or_future_stamps() {
        let now = Instant::now() + Duration::from_secs(600);
        let previous = now - Duration::from_secs(60);

        // Older than the previous poll: we would have seen it then
        let stale = TransportResult::with_status(200)
            .header("Last-Modified", "Fri, 01 Mar 2024 11:00:00 GMT");
        assert_eq!(change_instant(&stale, Some(previous), now, wall()), now);

        // Clock skew puts it in the future
        let future = TransportResult::with_status(200)
            .header("Last-Modified", "Fri, 01 Mar 2024 12:05:00 GMT");
        assert_eq!(change_instant(&future, Some(previous), now, wall()), now);

        let garbage = TransportResult::with_status(200).header("Last-Modified", "yesterday");
        assert_eq!(change_instant(&garbage, Some(previous), now, wall()), now);
    }

    #[test]
    fn test_change_instant_needs_a_previous_poll() {
        let now = Instant::now();
        let result = TransportResult::with_status(200)
            .header("Last-Modified", "Fri, 01 Mar 2024 11:59:30 GMT");
        assert_eq!(change_instant(&result, None, now, wall()), now);
    }
}
