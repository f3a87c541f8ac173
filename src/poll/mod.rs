//! Adaptive polling for a single feed.
//!
//! A [`PollScheduler`] owns one feed's tick task. Each tick probes the
//! endpoint, lets the [`ChangeDetector`] classify the response, and hands the
//! outcome to the [`PollMachine`], which learns the feed's update period
//! through a [`PeriodEstimator`] and picks the next delay:
//!
//! ```text
//! Warmup ──> Steady <──> Burst ──> Backoff ──> Steady
//!                 ^                              |
//!                 └──────── Changed ─────────────┘
//! ```

mod detector;
mod estimator;
mod machine;
mod scheduler;
mod state;

pub use detector::ChangeDetector;
pub use estimator::PeriodEstimator;
pub use machine::PollMachine;
pub use scheduler::PollScheduler;
pub use state::{ChangeDecision, PollExecution, PollMode, PollerState};
