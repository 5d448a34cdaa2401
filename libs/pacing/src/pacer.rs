//! Adaptive pause computation.

use std::time::{Duration, Instant};

use crate::{LatencyTracker, QuotaWindow};

/// Bounds applied to computed pauses.
#[derive(Debug, Clone)]
pub struct PacerConfig {
    /// Shortest pause between two calls while the window has calls left.
    pub min_pause: Duration,

    /// Longest pause while the window has calls left. Keeps the loop
    /// responsive; an exhausted window is waited out regardless.
    pub max_pause: Duration,
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self {
            min_pause: Duration::from_secs(1),
            max_pause: Duration::from_secs(30),
        }
    }
}

/// Computes the pause before the next call so the window's remaining calls
/// are spread evenly over its remaining time.
#[derive(Debug, Clone, Default)]
pub struct AdaptivePacer {
    config: PacerConfig,
}

impl AdaptivePacer {
    pub fn new(config: PacerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PacerConfig {
        &self.config
    }

    /// Pause to insert before the next call, evaluated at `now`.
    ///
    /// With no calls left the rest of the window is returned. Otherwise the
    /// idle budget (remaining time minus the expected cost of the remaining
    /// calls) is divided by the remaining calls and clamped to
    /// `[min_pause, max_pause]`.
    pub fn next_pause_at(
        &self,
        quota: &QuotaWindow,
        latency: &LatencyTracker,
        now: Instant,
    ) -> Duration {
        let remaining_window = quota.remaining_in_window_at(now);
        let remaining_calls = quota.remaining_calls();

        if remaining_calls == 0 {
            return remaining_window;
        }

        let expected_cost = latency.mean_latency().saturating_mul(remaining_calls);
        let budget = remaining_window.saturating_sub(expected_cost);
        let pause = budget / remaining_calls;

        pause
            .max(self.config.min_pause)
            .min(self.config.max_pause.max(self.config.min_pause))
    }

    pub fn next_pause(&self, quota: &QuotaWindow, latency: &LatencyTracker) -> Duration {
        self.next_pause_at(quota, latency, Instant::now())
    }
}
