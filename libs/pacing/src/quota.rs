//! Rolling quota windows.

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use crate::PacingError;

/// Call accounting for one rolling window.
///
/// The window restarts lazily: the first reservation (or explicit
/// [`QuotaWindow::roll_at`]) at or after `window_start + window_duration`
/// resets the counter and moves the start to that instant.
#[derive(Debug, Clone)]
pub struct QuotaWindow {
    window_start: Instant,
    calls_issued: u32,
    quota_per_window: u32,
    window_duration: Duration,
    resets: u64,
}

impl QuotaWindow {
    /// Create a window that starts now.
    pub fn new(quota_per_window: u32, window_duration: Duration) -> Result<Self, PacingError> {
        Self::starting_at(quota_per_window, window_duration, Instant::now())
    }

    /// Create a window that starts at `now`.
    pub fn starting_at(
        quota_per_window: u32,
        window_duration: Duration,
        now: Instant,
    ) -> Result<Self, PacingError> {
        if quota_per_window == 0 {
            return Err(PacingError::ZeroQuota);
        }
        if window_duration.is_zero() {
            return Err(PacingError::ZeroWindow);
        }

        Ok(Self {
            window_start: now,
            calls_issued: 0,
            quota_per_window,
            window_duration,
            resets: 0,
        })
    }

    /// Reset the window if it has elapsed at `now`.
    ///
    /// Returns true if a reset happened.
    pub fn roll_at(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.window_start) < self.window_duration {
            return false;
        }

        self.window_start = now;
        self.calls_issued = 0;
        self.resets += 1;
        true
    }

    /// Reserve one call at `now`.
    ///
    /// Returns false when the window is exhausted; the caller must not issue
    /// the call in that case.
    pub fn try_reserve_at(&mut self, now: Instant) -> bool {
        self.roll_at(now);

        if self.calls_issued >= self.quota_per_window {
            return false;
        }

        self.calls_issued += 1;
        true
    }

    /// Reserve one call now.
    pub fn try_reserve(&mut self) -> bool {
        self.try_reserve_at(Instant::now())
    }

    /// Wall-clock time left in the current window at `now`.
    pub fn remaining_in_window_at(&self, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(self.window_start);
        self.window_duration.saturating_sub(elapsed)
    }

    /// Wall-clock time left in the current window.
    pub fn remaining_in_window(&self) -> Duration {
        self.remaining_in_window_at(Instant::now())
    }

    /// Calls still allowed in the current window.
    pub fn remaining_calls(&self) -> u32 {
        self.quota_per_window - self.calls_issued
    }

    pub fn calls_issued(&self) -> u32 {
        self.calls_issued
    }

    pub fn quota_per_window(&self) -> u32 {
        self.quota_per_window
    }

    pub fn window_duration(&self) -> Duration {
        self.window_duration
    }

    pub fn window_start(&self) -> Instant {
        self.window_start
    }

    /// Number of resets since creation.
    pub fn resets(&self) -> u64 {
        self.resets
    }
}

/// Remote endpoints that draw from a quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Endpoint {
    /// Location directory listing.
    Locations,
    /// Per-location coefficient listing (issued every cycle).
    Coefficients,
    /// Per-item option check.
    Options,
}

impl Endpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Locations => "locations",
            Self::Coefficients => "coefficients",
            Self::Options => "options",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How endpoints share quota windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuotaScope {
    /// All endpoints draw from one window.
    #[default]
    Shared,
    /// Each endpoint has its own window with the same shape.
    PerEndpoint,
}

impl FromStr for QuotaScope {
    type Err = PacingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "shared" => Ok(Self::Shared),
            "per-endpoint" | "per_endpoint" => Ok(Self::PerEndpoint),
            other => Err(PacingError::UnknownScope(other.to_string())),
        }
    }
}

/// Set of quota windows keyed by endpoint.
///
/// The coefficients window doubles as the pacing window: it is the only
/// endpoint called on every cycle, so in `Shared` scope it is the single
/// window and in `PerEndpoint` scope it drives the cadence.
#[derive(Debug, Clone)]
pub struct QuotaBook {
    scope: QuotaScope,
    primary: QuotaWindow,
    locations: Option<QuotaWindow>,
    options: Option<QuotaWindow>,
}

impl QuotaBook {
    pub fn new(
        scope: QuotaScope,
        quota_per_window: u32,
        window_duration: Duration,
    ) -> Result<Self, PacingError> {
        Self::starting_at(scope, quota_per_window, window_duration, Instant::now())
    }

    pub fn starting_at(
        scope: QuotaScope,
        quota_per_window: u32,
        window_duration: Duration,
        now: Instant,
    ) -> Result<Self, PacingError> {
        let primary = QuotaWindow::starting_at(quota_per_window, window_duration, now)?;
        let (locations, options) = match scope {
            QuotaScope::Shared => (None, None),
            QuotaScope::PerEndpoint => (Some(primary.clone()), Some(primary.clone())),
        };

        Ok(Self {
            scope,
            primary,
            locations,
            options,
        })
    }

    pub fn scope(&self) -> QuotaScope {
        self.scope
    }

    /// Window that paces the cycle cadence.
    pub fn pacing_window(&self) -> &QuotaWindow {
        &self.primary
    }

    pub fn pacing_window_mut(&mut self) -> &mut QuotaWindow {
        &mut self.primary
    }

    /// Window charged for calls to `endpoint`.
    pub fn window(&self, endpoint: Endpoint) -> &QuotaWindow {
        match endpoint {
            Endpoint::Coefficients => &self.primary,
            Endpoint::Locations => self.locations.as_ref().unwrap_or(&self.primary),
            Endpoint::Options => self.options.as_ref().unwrap_or(&self.primary),
        }
    }

    fn window_mut(&mut self, endpoint: Endpoint) -> &mut QuotaWindow {
        match endpoint {
            Endpoint::Coefficients => &mut self.primary,
            Endpoint::Locations => self.locations.as_mut().unwrap_or(&mut self.primary),
            Endpoint::Options => self.options.as_mut().unwrap_or(&mut self.primary),
        }
    }

    /// Reserve one call to `endpoint` at `now`.
    pub fn try_reserve_at(&mut self, endpoint: Endpoint, now: Instant) -> bool {
        self.window_mut(endpoint).try_reserve_at(now)
    }

    pub fn try_reserve(&mut self, endpoint: Endpoint) -> bool {
        self.try_reserve_at(endpoint, Instant::now())
    }
}
