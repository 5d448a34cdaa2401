//! Moving history of observed call durations.

use std::collections::VecDeque;
use std::time::Duration;

/// Number of samples kept by default.
pub const DEFAULT_LATENCY_CAPACITY: usize = 10;

/// Bounded latency history used to estimate the cost of future calls.
#[derive(Debug, Clone)]
pub struct LatencyTracker {
    samples: VecDeque<Duration>,
    capacity: usize,
    default_latency: Duration,
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new(DEFAULT_LATENCY_CAPACITY, Duration::ZERO)
    }
}

impl LatencyTracker {
    /// Create a tracker. A zero capacity is treated as one.
    pub fn new(capacity: usize, default_latency: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            default_latency,
        }
    }

    /// Record one observed duration, evicting the oldest past capacity.
    pub fn record(&mut self, duration: Duration) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(duration);
    }

    /// Arithmetic mean of the stored samples, or the default when empty.
    pub fn mean_latency(&self) -> Duration {
        if self.samples.is_empty() {
            return self.default_latency;
        }

        let total: Duration = self.samples.iter().sum();
        total / self.samples.len() as u32
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
