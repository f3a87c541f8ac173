//! Configuration file parser for the poller (`feedpulse.toml`).
//!
//! The config file is optional. A missing file yields `Config::default()`,
//! which polls nothing. Unknown keys are accepted by serde but logged as
//! warnings so typos do not silently fall back to defaults.
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::limit::RateLimiter;
use crate::util::validate_endpoint_url;

/// Upper bound for any configured duration, including the largest
/// period the estimator may report.
const MAX_DURATION: Duration = Duration::from_secs(30 * 86_400);

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),

    /// A value parsed but is semantically unusable.
    #[error("Invalid config: {0}")]
    Invalid(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Process-wide configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Ceiling on outbound probes per second, shared by every feed.
    pub global_max_requests_per_second: f64,

    /// How often the binary logs per-feed stats. 0 disables the reporter.
    pub stats_interval_secs: u64,

    /// Permit loopback and private-range endpoint hosts.
    pub allow_private_hosts: bool,

    /// Change handoff settings, shared by every feed's pipeline.
    pub pipeline: PipelineConfig,

    /// One `[[feed]]` table per polled endpoint.
    #[serde(rename = "feed")]
    pub feeds: Vec<EndpointConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            global_max_requests_per_second: 10.0,
            stats_interval_secs: 60,
            allow_private_hosts: false,
            pipeline: PipelineConfig::default(),
            feeds: Vec::new(),
        }
    }
}

/// Settings for the per-feed processing pipeline.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Keep only the newest undelivered payload instead of queueing.
    pub coalesce_enabled: bool,

    /// Bounded queue size when coalescing is off.
    pub queue_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            coalesce_enabled: true,
            queue_capacity: 64,
        }
    }
}

/// Immutable per-feed polling parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Unique feed name, used in logs and metrics.
    pub name: String,
    /// Endpoint URL to probe.
    pub url: String,
    /// Best prior guess of the update period.
    pub period_hint_secs: u64,
    /// Probe spacing while warming up.
    pub warmup_interval_secs: u64,
    /// Maximum time spent in warmup.
    pub warmup_max_secs: u64,
    /// Base lead time before a predicted change.
    pub guard_window_ms: u64,
    pub guard_window_min_ms: u64,
    pub guard_window_max_ms: u64,
    /// Probe spacing while hunting for a change edge.
    pub burst_interval_ms: u64,
    /// How long a burst may last before cooling down.
    pub burst_window_ms: u64,
    /// Cooldown after errors, rate limits, or an unproductive burst.
    pub backoff_interval_secs: u64,
    /// Per-feed request ceiling (requests per second).
    pub max_burst_rate: f64,
    /// In-tick retries for transport failures and 5xx responses.
    pub transient_retries: u32,
    /// Number of change deltas kept by the period estimator.
    pub estimator_window_size: usize,
    /// EMA smoothing factor in (0, 1].
    pub ema_alpha: f64,
    /// Lower estimate bound as a multiple of the period hint.
    pub min_period_multiplier: f64,
    /// Upper estimate bound as a multiple of the period hint.
    pub max_period_multiplier: f64,
    /// Timeout for a single probe request.
    pub request_timeout_secs: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            url: String::new(),
            period_hint_secs: 60,
            warmup_interval_secs: 5,
            warmup_max_secs: 120,
            guard_window_ms: 2_000,
            guard_window_min_ms: 500,
            guard_window_max_ms: 15_000,
            burst_interval_ms: 1_000,
            burst_window_ms: 30_000,
            backoff_interval_secs: 30,
            max_burst_rate: 2.0,
            transient_retries: 3,
            estimator_window_size: 16,
            ema_alpha: 0.3,
            min_period_multiplier: 0.25,
            max_period_multiplier: 8.0,
            request_timeout_secs: 30,
        }
    }
}

impl EndpointConfig {
    /// Default parameters for the named endpoint.
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn period_hint(&self) -> Duration {
        Duration::from_secs(self.period_hint_secs)
    }

    pub fn warmup_interval(&self) -> Duration {
        Duration::from_secs(self.warmup_interval_secs)
    }

    pub fn warmup_max(&self) -> Duration {
        Duration::from_secs(self.warmup_max_secs)
    }

    pub fn burst_interval(&self) -> Duration {
        Duration::from_millis(self.burst_interval_ms)
    }

    pub fn burst_window(&self) -> Duration {
        Duration::from_millis(self.burst_window_ms)
    }

    pub fn backoff_interval(&self) -> Duration {
        Duration::from_secs(self.backoff_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Smallest period the estimator may report.
    pub fn min_period(&self) -> Duration {
        scaled(self.period_hint(), self.min_period_multiplier)
    }

    /// Largest period the estimator may report.
    pub fn max_period(&self) -> Duration {
        scaled(self.period_hint(), self.max_period_multiplier)
    }

    /// Checks the numeric invariants the scheduler relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(format!("feed '{}': {}", self.name, msg)));

        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("feed name must not be empty".into()));
        }
        if self.period_hint_secs == 0 {
            return invalid("period_hint_secs must be positive".into());
        }
        if self.warmup_interval_secs == 0 || self.burst_interval_ms == 0 || self.backoff_interval_secs == 0 {
            return invalid("warmup, burst and backoff intervals must be positive".into());
        }
        if self.guard_window_min_ms > self.guard_window_max_ms {
            return invalid(format!(
                "guard_window_min_ms ({}) exceeds guard_window_max_ms ({})",
                self.guard_window_min_ms, self.guard_window_max_ms
            ));
        }
        if !(self.max_burst_rate.is_finite() && self.max_burst_rate >= RateLimiter::MIN_RATE) {
            return invalid(format!(
                "max_burst_rate must be at least {} (one request per day)",
                RateLimiter::MIN_RATE
            ));
        }
        if self.estimator_window_size == 0 {
            return invalid("estimator_window_size must be at least 1".into());
        }
        if !(self.ema_alpha > 0.0 && self.ema_alpha <= 1.0) {
            return invalid(format!("ema_alpha must be in (0, 1], got {}", self.ema_alpha));
        }
        if !(self.min_period_multiplier > 0.0
            && self.min_period_multiplier.is_finite()
            && self.max_period_multiplier.is_finite()
            && self.min_period_multiplier <= self.max_period_multiplier)
        {
            return invalid("period multipliers must satisfy 0 < min <= max".into());
        }
        if self.request_timeout_secs == 0 {
            return invalid("request_timeout_secs must be positive".into());
        }

        let longest = Duration::try_from_secs_f64(self.period_hint_secs as f64 * self.max_period_multiplier)
            .unwrap_or(Duration::MAX);
        if longest > MAX_DURATION {
            return invalid(format!(
                "period_hint_secs x max_period_multiplier must not exceed {} days",
                MAX_DURATION.as_secs() / 86_400
            ));
        }
        let intervals = [
            ("period_hint_secs", self.period_hint()),
            ("warmup_interval_secs", self.warmup_interval()),
            ("warmup_max_secs", self.warmup_max()),
            ("guard_window_max_ms", Duration::from_millis(self.guard_window_max_ms)),
            ("burst_interval_ms", self.burst_interval()),
            ("burst_window_ms", self.burst_window()),
            ("backoff_interval_secs", self.backoff_interval()),
            ("request_timeout_secs", self.request_timeout()),
        ];
        if let Some((key, _)) = intervals.iter().find(|(_, d)| *d > MAX_DURATION) {
            return invalid(format!("{key} must not exceed {} days", MAX_DURATION.as_secs() / 86_400));
        }
        Ok(())
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 5] = [
        "global_max_requests_per_second",
        "stats_interval_secs",
        "allow_private_hosts",
        "pipeline",
        "feed",
    ];

    const KNOWN_FEED_KEYS: [&'static str; 18] = [
        "name",
        "url",
        "period_hint_secs",
        "warmup_interval_secs",
        "warmup_max_secs",
        "guard_window_ms",
        "guard_window_min_ms",
        "guard_window_max_ms",
        "burst_interval_ms",
        "burst_window_ms",
        "backoff_interval_secs",
        "max_burst_rate",
        "transient_retries",
        "estimator_window_size",
        "ema_alpha",
        "min_period_multiplier",
        "max_period_multiplier",
        "request_timeout_secs",
    ];

    /// Load and validate configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    /// - Unusable values → `Err(ConfigError::Invalid)`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // Check file size before reading to avoid slurping a huge file
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        let config = Self::from_toml_str(&content)?;
        tracing::info!(
            path = %path.display(),
            feeds = config.feeds.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            tracing::debug!("Config is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            warn_unknown_keys(&raw);
        }

        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Period of the stats log line; `None` when disabled with 0.
    pub fn stats_interval(&self) -> Option<Duration> {
        (self.stats_interval_secs > 0).then(|| Duration::from_secs(self.stats_interval_secs))
    }

    /// Checks process-wide settings and every feed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.global_max_requests_per_second.is_finite()
            && self.global_max_requests_per_second >= RateLimiter::MIN_RATE)
        {
            return Err(ConfigError::Invalid(format!(
                "global_max_requests_per_second must be at least {} (one request per day)",
                RateLimiter::MIN_RATE
            )));
        }
        if !self.pipeline.coalesce_enabled && self.pipeline.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.queue_capacity must be at least 1".into(),
            ));
        }

        let mut names = HashSet::new();
        for feed in &self.feeds {
            feed.validate()?;
            if !names.insert(feed.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate feed name '{}'", feed.name)));
            }
            validate_endpoint_url(&feed.url, self.allow_private_hosts)
                .map_err(|e| ConfigError::Invalid(format!("feed '{}': {}", feed.name, e)))?;
        }
        Ok(())
    }
}

/// `base * factor`, saturating instead of panicking on overflow.
fn scaled(base: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(base.as_secs_f64() * factor).unwrap_or(if factor > 0.0 {
        Duration::MAX
    } else {
        Duration::ZERO
    })
}

fn warn_unknown_keys(raw: &toml::Table) {
    for key in raw.keys() {
        if !Config::KNOWN_KEYS.contains(&key.as_str()) {
            tracing::warn!(key = %key, "Unknown key in config file, ignoring");
        }
    }

    let Some(toml::Value::Array(feeds)) = raw.get("feed") else {
        return;
    };
    for table in feeds.iter().filter_map(toml::Value::as_table) {
        for key in table.keys() {
            if !Config::KNOWN_FEED_KEYS.contains(&key.as_str()) {
                tracing::warn!(key = %key, "Unknown key in [[feed]] table, ignoring");
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
