//! Per-feed processing pipeline.
//!
//! Decouples polling from payload processing: the tick task hands changed
//! payloads to [`ProcessingPipeline::submit`], which never blocks, and a
//! single worker task feeds them to the [`Processor`] in order.
//!
//! Two queueing policies:
//!
//! - **Coalescing** keeps at most one pending payload. A payload that
//!   arrives while another is still waiting replaces it, so the processor
//!   always sees the newest state and never falls more than one step behind.
//! - **Strict** queues up to a fixed capacity and drops new payloads when
//!   full.

mod processor;

pub use processor::{LogProcessor, Processor};

use bytes::Bytes;
use futures::FutureExt;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::metrics::{Counter, MetricsSink, Timing};

/// Queueing policy for undelivered payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineMode {
    Coalescing,
    Strict { capacity: usize },
}

impl From<&PipelineConfig> for PipelineMode {
    fn from(config: &PipelineConfig) -> Self {
        if config.coalesce_enabled {
            PipelineMode::Coalescing
        } else {
            PipelineMode::Strict {
                capacity: config.queue_capacity.max(1),
            }
        }
    }
}

/// What [`ProcessingPipeline::submit`] did with a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Queued behind nothing or behind the payload being processed.
    Accepted,
    /// Took the place of an older pending payload, which was discarded.
    Replaced,
    /// Queue full; the payload was discarded.
    Dropped,
    /// The pipeline has been closed.
    Closed,
}

/// Counters describing a pipeline's lifetime so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub accepted: u64,
    pub dropped: u64,
    pub processed: u64,
    pub failed: u64,
    pub pending: usize,
}

struct Envelope {
    payload: Bytes,
    enqueued_at: Instant,
}

struct Shared {
    feed: Arc<str>,
    mode: PipelineMode,
    pending: Mutex<VecDeque<Envelope>>,
    wake: Notify,
    cancel: CancellationToken,
    processor: Arc<dyn Processor>,
    metrics: Arc<dyn MetricsSink>,
    accepted: AtomicU64,
    dropped: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
}

impl Shared {
    fn queue(&self) -> std::sync::MutexGuard<'_, VecDeque<Envelope>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        self.metrics.increment(&self.feed, Counter::ProcessingDropped);
    }
}

/// Single-worker delivery queue for one feed.
pub struct ProcessingPipeline {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessingPipeline {
    /// Creates the pipeline and spawns its worker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        feed: &str,
        mode: PipelineMode,
        processor: Arc<dyn Processor>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let shared = Arc::new(Shared {
            feed: Arc::from(feed),
            mode,
            pending: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
            cancel: CancellationToken::new(),
            processor,
            metrics,
            accepted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        });
        let worker = tokio::spawn(run_worker(shared.clone()));
        Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn mode(&self) -> PipelineMode {
        self.shared.mode
    }

    /// Hands a payload to the worker without waiting for it.
    pub fn submit(&self, payload: Bytes) -> SubmitOutcome {
        let shared = &self.shared;
        if shared.cancel.is_cancelled() {
            return SubmitOutcome::Closed;
        }

        let envelope = Envelope {
            payload,
            enqueued_at: Instant::now(),
        };
        let outcome = {
            let mut queue = shared.queue();
            match shared.mode {
                PipelineMode::Coalescing => {
                    let replaced = queue.pop_front().is_some();
                    queue.push_back(envelope);
                    if replaced {
                        SubmitOutcome::Replaced
                    } else {
                        SubmitOutcome::Accepted
                    }
                }
                PipelineMode::Strict { capacity } if queue.len() >= capacity => SubmitOutcome::Dropped,
                PipelineMode::Strict { .. } => {
                    queue.push_back(envelope);
                    SubmitOutcome::Accepted
                }
            }
        };

        match outcome {
            SubmitOutcome::Accepted => {
                shared.accepted.fetch_add(1, Ordering::Relaxed);
            }
            SubmitOutcome::Replaced => {
                shared.accepted.fetch_add(1, Ordering::Relaxed);
                shared.record_drop();
                tracing::debug!(feed = %shared.feed, "Coalesced pending payload");
            }
            SubmitOutcome::Dropped => {
                shared.record_drop();
                tracing::warn!(feed = %shared.feed, "Processing queue full, dropping payload");
            }
            SubmitOutcome::Closed => {}
        }
        if outcome != SubmitOutcome::Dropped {
            shared.wake.notify_one();
        }
        outcome
    }

    pub fn stats(&self) -> PipelineStats {
        let shared = &self.shared;
        PipelineStats {
            accepted: shared.accepted.load(Ordering::Relaxed),
            dropped: shared.dropped.load(Ordering::Relaxed),
            processed: shared.processed.load(Ordering::Relaxed),
            failed: shared.failed.load(Ordering::Relaxed),
            pending: shared.queue().len(),
        }
    }

    /// Stops accepting payloads. The worker finishes its current payload
    /// and exits; anything still pending is discarded.
    pub fn close(&self) {
        self.shared.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Closes the pipeline and waits for the worker to exit.
    pub async fn shutdown(&self) {
        self.close();
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(feed = %self.shared.feed, error = %e, "Pipeline worker failed");
            }
        }
    }
}

impl Drop for ProcessingPipeline {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

async fn run_worker(shared: Arc<Shared>) {
    loop {
        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            _ = shared.wake.notified() => {}
        }

        loop {
            if shared.cancel.is_cancelled() {
                break;
            }
            // Pop under the lock, process outside it
            let next = shared.queue().pop_front();
            let Some(envelope) = next else {
                break;
            };
            deliver(&shared, envelope).await;
        }
    }

    let discarded = shared.queue().drain(..).count();
    if discarded > 0 {
        tracing::debug!(feed = %shared.feed, discarded, "Pipeline closed with pending payloads");
    }
}

async fn deliver(shared: &Shared, envelope: Envelope) {
    let feed = &*shared.feed;
    shared
        .metrics
        .record(feed, Timing::ProcessingLag, envelope.enqueued_at.elapsed());

    let started = Instant::now();
    let result = AssertUnwindSafe(shared.processor.process(feed, envelope.payload))
        .catch_unwind()
        .await;
    shared
        .metrics
        .record(feed, Timing::ProcessingDuration, started.elapsed());

    match result {
        Ok(Ok(())) => {
            shared.processed.fetch_add(1, Ordering::Relaxed);
            shared.metrics.increment(feed, Counter::ProcessingSuccess);
        }
        Ok(Err(e)) => {
            shared.failed.fetch_add(1, Ordering::Relaxed);
            shared.metrics.increment(feed, Counter::ProcessingError);
            tracing::warn!(feed = %feed, error = %e, "Processor failed");
        }
        Err(_) => {
            shared.failed.fetch_add(1, Ordering::Relaxed);
            shared.metrics.increment(feed, Counter::ProcessingError);
            tracing::error!(feed = %feed, "Processor panicked");
        }
    }
}
