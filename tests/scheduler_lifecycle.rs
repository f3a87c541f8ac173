//! End-to-end scheduler tests against a scripted probe.
//!
//! Time is paused, so every tick lands exactly on its deadline and the
//! mode sequence is deterministic.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;

use feedpulse::config::EndpointConfig;
use feedpulse::limit::RateLimiter;
use feedpulse::metrics::InMemoryMetrics;
use feedpulse::pipeline::{PipelineMode, ProcessingPipeline, Processor};
use feedpulse::poll::{PollMode, PollScheduler, PollerState};
use feedpulse::probe::{ConditionalHeaders, ProbeClient, TransportResult};

/// Replays canned results, then answers 304 forever.
#[derive(Default)]
struct ScriptedProbe {
    script: Mutex<VecDeque<TransportResult>>,
    calls: Mutex<Vec<(Instant, ConditionalHeaders)>>,
}

impl ScriptedProbe {
    fn new(script: impl IntoIterator<Item = TransportResult>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            calls: Mutex::default(),
        })
    }

    fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().iter().map(|(at, _)| *at).collect()
    }

    fn last_conditional(&self) -> Option<ConditionalHeaders> {
        self.calls.lock().unwrap().last().map(|(_, c)| c.clone())
    }
}

#[async_trait]
impl ProbeClient for ScriptedProbe {
    async fn probe(&self, conditional: &ConditionalHeaders) -> TransportResult {
        self.calls
            .lock()
            .unwrap()
            .push((Instant::now(), conditional.clone()));
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| TransportResult::with_status(304))
    }
}

struct Recorder(mpsc::UnboundedSender<Bytes>);

#[async_trait]
impl Processor for Recorder {
    async fn process(&self, _feed: &str, payload: Bytes) -> anyhow::Result<()> {
        let _ = self.0.send(payload);
        Ok(())
    }
}

fn test_config() -> EndpointConfig {
    EndpointConfig {
        period_hint_secs: 60,
        warmup_interval_secs: 1,
        warmup_max_secs: 5,
        guard_window_ms: 2_000,
        guard_window_min_ms: 1_000,
        guard_window_max_ms: 10_000,
        burst_interval_ms: 1_000,
        burst_window_ms: 3_000,
        backoff_interval_secs: 10,
        ..EndpointConfig::new("feed", "https://example.com/feed")
    }
}

struct Harness {
    scheduler: PollScheduler,
    metrics: Arc<InMemoryMetrics>,
    delivered: mpsc::UnboundedReceiver<Bytes>,
}

fn harness(config: EndpointConfig, probe: Arc<dyn ProbeClient>) -> Harness {
    let metrics = Arc::new(InMemoryMetrics::new());
    let (tx, delivered) = mpsc::unbounded_channel();
    let pipeline = Arc::new(ProcessingPipeline::new(
        &config.name,
        PipelineMode::Coalescing,
        Arc::new(Recorder(tx)),
        metrics.clone(),
    ));
    let scheduler = PollScheduler::new(
        Arc::new(config),
        probe,
        Arc::new(RateLimiter::new(100.0)),
        pipeline,
        metrics.clone(),
    );
    Harness {
        scheduler,
        metrics,
        delivered,
    }
}

async fn wait_for_state(
    scheduler: &PollScheduler,
    predicate: impl FnMut(&PollerState) -> bool,
) -> PollerState {
    let mut snapshots = scheduler.snapshots();
    let state = tokio::time::timeout(Duration::from_secs(3_600), snapshots.wait_for(predicate))
        .await
        .expect("state never reached")
        .expect("scheduler dropped")
        .clone();
    state
}

fn ok_with_etag(etag: &str, body: &'static str) -> TransportResult {
    TransportResult::with_status(200).header("ETag", etag).body(body)
}

#[tokio::test(start_paused = true)]
async fn test_warmup_steady_burst_backoff_then_change() {
    let mut script: Vec<TransportResult> = (0..11).map(|_| TransportResult::with_status(304)).collect();
    script.push(ok_with_etag("\"v1\"", "payload-v1"));
    let probe = ScriptedProbe::new(script);
    let mut h = harness(test_config(), probe.clone());

    let started = Instant::now();
    assert!(h.scheduler.start());
    let state = wait_for_state(&h.scheduler, |s| s.update_count == 1).await;

    assert_eq!(state.mode, PollMode::Steady);
    assert_eq!(state.update_count, 1);
    assert!(state.estimated_period_millis() > 0);

    // Warmup 0..=5s, steady sleep to 63s, burst 63..=67s, backoff to 77s
    let offsets: Vec<u64> = probe
        .call_times()
        .iter()
        .map(|at| (*at - started).as_secs())
        .collect();
    assert_eq!(offsets, [0, 1, 2, 3, 4, 5, 63, 64, 65, 66, 67, 77]);

    let metrics = h.metrics.snapshot("feed");
    assert_eq!(metrics.ticks, 12);
    assert_eq!(metrics.unchanged, 11);
    assert_eq!(metrics.changed, 1);
    assert_eq!(metrics.transition_count(PollMode::Warmup, PollMode::Steady), 1);
    assert_eq!(metrics.transition_count(PollMode::Steady, PollMode::Burst), 1);
    assert_eq!(metrics.transition_count(PollMode::Burst, PollMode::Backoff), 1);
    assert_eq!(metrics.transition_count(PollMode::Backoff, PollMode::Steady), 1);

    let payload = h.delivered.recv().await.unwrap();
    assert_eq!(payload, Bytes::from_static(b"payload-v1"));

    // The next probe revalidates against the stored ETag
    tokio::time::sleep(Duration::from_secs(60)).await;
    let conditional = probe.last_conditional().unwrap();
    assert_eq!(conditional.if_none_match.as_deref(), Some("\"v1\""));

    h.scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_defers_next_probe() {
    let probe = ScriptedProbe::new([
        TransportResult::with_status(429).header("Retry-After", "30"),
        ok_with_etag("\"a\"", "a"),
    ]);
    let h = harness(test_config(), probe.clone());

    h.scheduler.start();
    let state = wait_for_state(&h.scheduler, |s| s.update_count == 1).await;
    assert_eq!(state.mode, PollMode::Steady);

    let calls = probe.call_times();
    assert_eq!(calls.len(), 2);
    assert!(calls[1] - calls[0] >= Duration::from_secs(30));

    let metrics = h.metrics.snapshot("feed");
    assert_eq!(metrics.rate_limited, 1);
    assert_eq!(metrics.transient_retries, 0);
    assert_eq!(metrics.transition_count(PollMode::Warmup, PollMode::Backoff), 1);
    assert_eq!(metrics.transition_count(PollMode::Backoff, PollMode::Steady), 1);

    h.scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_poll_now_while_server_blocked_skips_request() {
    let probe = ScriptedProbe::new([
        TransportResult::with_status(429).header("Retry-After", "30"),
        ok_with_etag("\"a\"", "a"),
    ]);
    let h = harness(test_config(), probe.clone());

    h.scheduler.start();
    wait_for_state(&h.scheduler, |s| s.mode == PollMode::Backoff).await;

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(h.scheduler.poll_now());
    tokio::time::sleep(Duration::from_secs(1)).await;

    // The manual tick re-armed for the rest of the window without a request
    assert_eq!(probe.call_times().len(), 1);
    assert_eq!(h.metrics.snapshot("feed").ticks, 1);

    let state = wait_for_state(&h.scheduler, |s| s.update_count == 1).await;
    assert_eq!(state.mode, PollMode::Steady);

    let calls = probe.call_times();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1] - calls[0], Duration::from_secs(30));

    let metrics = h.metrics.snapshot("feed");
    assert_eq!(metrics.ticks, 2);
    assert_eq!(metrics.rate_limited, 1);
    assert!(metrics.poll_interval.count >= 3);
    assert!(metrics.poll_interval.min > Duration::from_secs(24));
    assert!(metrics.poll_interval.min <= Duration::from_secs(25));

    h.scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_retry_within_one_tick() {
    let probe = ScriptedProbe::new([
        TransportResult::with_status(503),
        TransportResult::transport_failure("connection reset"),
        ok_with_etag("\"a\"", "a"),
    ]);
    let h = harness(test_config(), probe.clone());

    let started = Instant::now();
    h.scheduler.start();
    wait_for_state(&h.scheduler, |s| s.update_count == 1).await;

    let offsets: Vec<Duration> = probe.call_times().iter().map(|at| *at - started).collect();
    assert_eq!(
        offsets,
        [
            Duration::ZERO,
            Duration::from_millis(250),
            Duration::from_millis(750)
        ]
    );

    let metrics = h.metrics.snapshot("feed");
    assert_eq!(metrics.ticks, 1);
    assert_eq!(metrics.transient_retries, 2);
    assert_eq!(metrics.probe_errors, 0);
    assert_eq!(metrics.changed, 1);

    h.scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_back_off() {
    let mut config = test_config();
    config.transient_retries = 1;
    let probe = ScriptedProbe::new([
        TransportResult::with_status(502),
        TransportResult::with_status(502),
    ]);
    let h = harness(config, probe.clone());

    h.scheduler.start();
    let state = wait_for_state(&h.scheduler, |s| s.consecutive_errors == 1).await;
    assert_eq!(state.mode, PollMode::Backoff);
    assert_eq!(probe.call_times().len(), 2);

    let metrics = h.metrics.snapshot("feed");
    assert_eq!(metrics.probe_errors, 1);
    assert_eq!(metrics.transient_retries, 1);

    h.scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_poll_now_triggers_early_tick() {
    let mut config = test_config();
    config.warmup_interval_secs = 30;
    config.warmup_max_secs = 600;
    let probe = ScriptedProbe::new([]);
    let h = harness(config, probe.clone());

    h.scheduler.start();
    wait_for_state(&h.scheduler, |s| s.miss_count == 1).await;

    assert!(h.scheduler.poll_now());
    wait_for_state(&h.scheduler, |s| s.miss_count == 2).await;

    let calls = probe.call_times();
    assert_eq!(calls.len(), 2);
    assert!(calls[1] - calls[0] < Duration::from_secs(30));

    h.scheduler.shutdown().await;
}

/// Blocks every probe until the test releases it.
struct HeldProbe {
    started: mpsc::UnboundedSender<()>,
    release: Arc<Semaphore>,
}

#[async_trait]
impl ProbeClient for HeldProbe {
    async fn probe(&self, _conditional: &ConditionalHeaders) -> TransportResult {
        let _ = self.started.send(());
        if let Ok(permit) = self.release.acquire().await {
            permit.forget();
        }
        TransportResult::with_status(304)
    }
}

#[tokio::test(start_paused = true)]
async fn test_poll_now_during_tick_is_counted_as_overlap() {
    let (tx, mut started) = mpsc::unbounded_channel();
    let release = Arc::new(Semaphore::new(0));
    let probe = Arc::new(HeldProbe {
        started: tx,
        release: release.clone(),
    });
    let h = harness(test_config(), probe);

    h.scheduler.start();
    started.recv().await.unwrap();

    assert!(h.scheduler.is_polling());
    assert!(!h.scheduler.poll_now());
    assert_eq!(h.metrics.snapshot("feed").tick_overlaps, 1);

    release.add_permits(1);
    let state = wait_for_state(&h.scheduler, |s| s.miss_count == 1).await;
    assert_eq!(state.mode, PollMode::Warmup);
    assert!(!h.scheduler.is_polling());

    release.add_permits(100);
    h.scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_cancels_future_ticks() {
    let probe = ScriptedProbe::new([]);
    let h = harness(test_config(), probe.clone());

    assert!(h.scheduler.start());
    assert!(!h.scheduler.start());
    wait_for_state(&h.scheduler, |s| s.last_poll_at.is_some()).await;

    h.scheduler.shutdown().await;
    let calls = probe.call_times().len();

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(probe.call_times().len(), calls);
    assert!(h.scheduler.pipeline().is_closed());
    assert!(!h.scheduler.start());
}
