use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use feedpulse::config::Config;
use feedpulse::limit::RateLimiter;
use feedpulse::metrics::{InMemoryMetrics, MetricsSink};
use feedpulse::pipeline::{LogProcessor, PipelineMode, ProcessingPipeline, Processor};
use feedpulse::poll::PollScheduler;
use feedpulse::probe::{HttpProbeClient, ProbeClient};
use feedpulse::util::validate_endpoint_url;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser, Debug)]
#[command(name = "feedpulse", about = "Adaptive change-driven feed poller")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, short, value_name = "FILE", default_value = "feedpulse.toml")]
    config: PathBuf,

    /// Validate the configuration, list the feeds, and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config = Config::load(&args.config)
        .with_context(|| format!("Failed to load config '{}'", args.config.display()))?;

    if args.check {
        println!("Configuration OK: {} feed(s)", config.feeds.len());
        for feed in &config.feeds {
            println!(
                "  {:<24} {} (hint {}s, burst {} rps)",
                feed.name, feed.url, feed.period_hint_secs, feed.max_burst_rate
            );
        }
        return Ok(());
    }

    if config.feeds.is_empty() {
        anyhow::bail!(
            "No feeds configured in '{}'; add at least one [[feed]] table",
            args.config.display()
        );
    }

    let http_client = reqwest::Client::builder()
        .pool_max_idle_per_host(4)
        .pool_idle_timeout(Duration::from_secs(30))
        .tcp_keepalive(Duration::from_secs(60))
        .user_agent(concat!("feedpulse/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")?;

    let metrics = Arc::new(InMemoryMetrics::new());
    let sink: Arc<dyn MetricsSink> = metrics.clone();
    let global = Arc::new(RateLimiter::new(config.global_max_requests_per_second));
    let processor: Arc<dyn Processor> = Arc::new(LogProcessor);
    let mode = PipelineMode::from(&config.pipeline);

    let mut schedulers = Vec::with_capacity(config.feeds.len());
    for feed in &config.feeds {
        let url = validate_endpoint_url(&feed.url, config.allow_private_hosts)
            .with_context(|| format!("Invalid URL for feed '{}'", feed.name))?;
        let probe: Arc<dyn ProbeClient> = Arc::new(HttpProbeClient::new(
            http_client.clone(),
            url,
            feed.request_timeout(),
        ));
        let pipeline = Arc::new(ProcessingPipeline::new(
            &feed.name,
            mode,
            processor.clone(),
            sink.clone(),
        ));
        let scheduler = PollScheduler::new(
            Arc::new(feed.clone()),
            probe,
            global.clone(),
            pipeline,
            sink.clone(),
        );
        scheduler.start();
        schedulers.push(scheduler);
    }
    tracing::info!(feeds = schedulers.len(), "Polling started");

    run_until_signal(&schedulers, &metrics, config.stats_interval()).await?;

    for scheduler in &schedulers {
        scheduler.stop();
    }
    for scheduler in &schedulers {
        scheduler.shutdown().await;
    }
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Logs periodic stats until SIGINT or SIGTERM arrives.
async fn run_until_signal(
    schedulers: &[PollScheduler],
    metrics: &InMemoryMetrics,
    stats_interval: Option<Duration>,
) -> Result<()> {
    #[cfg(unix)]
    let mut sigterm = signal(SignalKind::terminate())?;
    #[cfg(unix)]
    let mut sigint = signal(SignalKind::interrupt())?;

    let mut stats = stats_interval.map(|period| {
        tokio::time::interval_at(tokio::time::Instant::now() + period, period)
    });

    loop {
        #[cfg(unix)]
        let sigterm_fut = sigterm.recv();
        #[cfg(not(unix))]
        let sigterm_fut = std::future::pending::<Option<()>>();

        #[cfg(unix)]
        let sigint_fut = sigint.recv();
        #[cfg(not(unix))]
        let sigint_fut = async {
            let _ = tokio::signal::ctrl_c().await;
            Some(())
        };

        tokio::select! {
            biased;

            _ = sigterm_fut => {
                tracing::info!("Received SIGTERM, shutting down gracefully");
                return Ok(());
            }

            _ = sigint_fut => {
                tracing::info!("Received SIGINT, shutting down gracefully");
                return Ok(());
            }

            _ = next_stats(&mut stats) => log_stats(schedulers, metrics),
        }
    }
}

async fn next_stats(stats: &mut Option<tokio::time::Interval>) {
    match stats {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn log_stats(schedulers: &[PollScheduler], metrics: &InMemoryMetrics) {
    for scheduler in schedulers {
        let state = scheduler.snapshot_state();
        let counters = metrics.snapshot(scheduler.name());
        let pipeline = scheduler.pipeline().stats();
        tracing::info!(
            feed = %scheduler.name(),
            mode = %state.mode,
            period_ms = state.estimated_period_millis(),
            updates = state.update_count,
            misses = state.miss_count,
            errors = state.consecutive_errors,
            ticks = counters.ticks,
            retries = counters.transient_retries,
            rate_limited = counters.rate_limited,
            mean_interval_ms = counters.poll_interval.mean().as_millis() as u64,
            phase_error_ms = ?counters.mean_abs_phase_error_ms,
            processed = pipeline.processed,
            dropped = pipeline.dropped,
            "Feed stats"
        );
    }
}
