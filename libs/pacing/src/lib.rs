//! Pacing primitives for quota-bound polling.
//!
//! This library holds the accounting side of the scheduler. Nothing here
//! performs I/O or sleeps; callers own the clock and the suspend points.
//!
//! - **Quota window**: at most N calls inside a rolling window that restarts
//!   at the first reservation after it elapses.
//! - **Latency tracker**: short moving history of call durations.
//! - **Pacer**: spreads the idle time left in a window evenly over the calls
//!   left in it.
//! - **Backoff**: exponential delays with jitter for rate-limited retries.
//!
//! # Invariants
//!
//! - `calls_issued <= quota_per_window` at all times
//! - A window resets at most once per boundary crossing
//! - Pauses are never negative

mod backoff;
mod latency;
mod pacer;
mod quota;

pub use backoff::BackoffPolicy;
pub use latency::{LatencyTracker, DEFAULT_LATENCY_CAPACITY};
pub use pacer::{AdaptivePacer, PacerConfig};
pub use quota::{Endpoint, QuotaBook, QuotaScope, QuotaWindow};

use thiserror::Error;

/// Pacing configuration errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacingError {
    /// Quota must allow at least one call per window.
    #[error("quota per window must be greater than zero")]
    ZeroQuota,

    /// Window duration must be non-zero.
    #[error("window duration must be greater than zero")]
    ZeroWindow,

    /// Unrecognized quota scope name.
    #[error("unknown quota scope: {0} (expected `shared` or `per-endpoint`)")]
    UnknownScope(String),
}
