//! One scheduler cycle.
//!
//! A cycle is either refresh+call (first cycle of a window: re-fetch the data
//! sets and reference data, then list coefficients) or call-only (reuse the
//! cached context, list coefficients). Every remote request reserves from the
//! quota before it is sent and feeds its duration, retries included, into the
//! latency history.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use slotwatch_pacing::{AdaptivePacer, Endpoint, LatencyTracker, QuotaBook};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::allocation::{AllocationApi, RemoteError};
use crate::model::{Dataset, Item, Location, OptionsReport};
use crate::notifier::ChangeNotifier;
use crate::report::{self, Snapshot};
use crate::retry::{CallOutcome, RetryingCaller};
use crate::shutdown::ShutdownSignal;
use crate::source::{DatasetSource, SourceError};

/// Why a cycle was abandoned.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CycleError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// Setup error; the scheduler cannot make progress.
    #[error("source permanently unavailable: {0}")]
    SourcePermanent(String),

    #[error("{endpoint} call still rate limited after {attempts} attempts")]
    QuotaExceeded { endpoint: Endpoint, attempts: u32 },

    #[error("{endpoint} call failed: {error}")]
    RemoteFailure {
        endpoint: Endpoint,
        error: RemoteError,
    },

    #[error("quota window exhausted before {endpoint} call")]
    WindowExhausted { endpoint: Endpoint },

    #[error("cancelled")]
    Cancelled,
}

impl CycleError {
    /// Whether the error stops the scheduler.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::SourcePermanent(_))
    }
}

impl From<SourceError> for CycleError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::Unavailable(reason) => Self::SourceUnavailable(reason),
            SourceError::Permanent(reason) => Self::SourcePermanent(reason),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleKind {
    RefreshAndCall,
    CallOnly,
}

impl fmt::Display for CycleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::RefreshAndCall => "refresh+call",
            Self::CallOnly => "call-only",
        })
    }
}

/// Timing breakdown of one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleTimings {
    /// Source fetch (zero for call-only cycles).
    pub fetch_time: Duration,
    /// Remote calls, retries and backoff included.
    pub call_time: Duration,
    pub total_time: Duration,
}

/// Outcome of one cycle.
#[derive(Debug)]
pub enum CycleResult {
    Success {
        snapshot: Snapshot,
        kind: CycleKind,
        timings: CycleTimings,
    },
    Failure {
        reason: CycleError,
        kind: CycleKind,
        timings: CycleTimings,
    },
}

impl CycleResult {
    pub fn kind(&self) -> CycleKind {
        match self {
            Self::Success { kind, .. } | Self::Failure { kind, .. } => *kind,
        }
    }

    pub fn timings(&self) -> CycleTimings {
        match self {
            Self::Success { timings, .. } | Self::Failure { timings, .. } => *timings,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Data fetched on refresh and reused by call-only cycles.
#[derive(Debug, Clone)]
pub struct CycleContext {
    pub datasets: Vec<Dataset>,
    pub locations: Vec<Location>,
    pub options: OptionsReport,
    pub fetched_at: DateTime<Utc>,
}

/// Runs cycles against the source and the allocation API.
pub struct PollCycleRunner {
    source: Arc<dyn DatasetSource>,
    api: Arc<dyn AllocationApi>,
    caller: RetryingCaller,
    quota: QuotaBook,
    latency: LatencyTracker,
    pacer: AdaptivePacer,
    context: Option<CycleContext>,
    notifier: Option<Arc<ChangeNotifier>>,
    shutdown: ShutdownSignal,
}

impl PollCycleRunner {
    pub fn new(
        source: Arc<dyn DatasetSource>,
        api: Arc<dyn AllocationApi>,
        caller: RetryingCaller,
        quota: QuotaBook,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            source,
            api,
            caller,
            quota,
            latency: LatencyTracker::default(),
            pacer: AdaptivePacer::default(),
            context: None,
            notifier: None,
            shutdown,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<ChangeNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_pacer(mut self, pacer: AdaptivePacer) -> Self {
        self.pacer = pacer;
        self
    }

    pub fn quota(&self) -> &QuotaBook {
        &self.quota
    }

    pub fn latency(&self) -> &LatencyTracker {
        &self.latency
    }

    pub fn context(&self) -> Option<&CycleContext> {
        self.context.as_ref()
    }

    /// Pause before the next cycle, from the pacing window and latency.
    pub fn next_pause(&self) -> Duration {
        self.pacer.next_pause(self.quota.pacing_window(), &self.latency)
    }

    /// True once the pacing window has no calls left.
    pub fn window_exhausted(&self) -> bool {
        self.quota.pacing_window().remaining_calls() == 0
    }

    pub fn remaining_in_window(&self) -> Duration {
        self.quota.pacing_window().remaining_in_window()
    }

    /// Kind of the next cycle. Rolls the pacing window if it has elapsed.
    pub fn next_kind(&mut self) -> CycleKind {
        let window = self.quota.pacing_window_mut();
        if window.roll_at(Instant::now()) {
            debug!(resets = window.resets(), "Quota window restarted");
        }

        if window.calls_issued() == 0 || self.context.is_none() {
            CycleKind::RefreshAndCall
        } else {
            CycleKind::CallOnly
        }
    }

    /// Run one cycle. Never panics on collaborator failures.
    pub async fn run_cycle(&mut self) -> CycleResult {
        let started = Instant::now();
        let kind = self.next_kind();
        let mut timings = CycleTimings::default();

        let result = self.execute(kind, &mut timings).await;
        timings.total_time = started.elapsed();

        match result {
            Ok(snapshot) => {
                info!(
                    kind = %kind,
                    fetch_ms = timings.fetch_time.as_millis() as u64,
                    call_ms = timings.call_time.as_millis() as u64,
                    total_ms = timings.total_time.as_millis() as u64,
                    slots = snapshot.slot_count,
                    datasets_with_slots = snapshot.datasets_with_slots,
                    "Cycle completed"
                );
                CycleResult::Success {
                    snapshot,
                    kind,
                    timings,
                }
            }
            Err(reason) => {
                warn!(
                    kind = %kind,
                    total_ms = timings.total_time.as_millis() as u64,
                    reason = %reason,
                    "Cycle failed"
                );
                CycleResult::Failure {
                    reason,
                    kind,
                    timings,
                }
            }
        }
    }

    async fn execute(
        &mut self,
        kind: CycleKind,
        timings: &mut CycleTimings,
    ) -> Result<Snapshot, CycleError> {
        if self.shutdown.is_set() {
            return Err(CycleError::Cancelled);
        }

        if kind == CycleKind::RefreshAndCall {
            self.refresh(timings).await?;
        }

        let api = self.api.clone();
        let coefficients = self
            .call(Endpoint::Coefficients, timings, move || {
                let api = api.clone();
                async move { api.list_coefficients().await }
            })
            .await?;

        let context = self
            .context
            .as_ref()
            .ok_or_else(|| CycleError::SourceUnavailable("no data sets fetched".to_string()))?;

        let analyses = report::analyze(
            &context.datasets,
            &context.locations,
            &context.options,
            &coefficients,
        );
        let snapshot = report::render(&analyses, Utc::now());

        if let Some(notifier) = &self.notifier {
            if let Err(e) = notifier.deliver(&snapshot).await {
                warn!(error = %e, "Failed to persist delivery state");
            }
        }

        Ok(snapshot)
    }

    async fn refresh(&mut self, timings: &mut CycleTimings) -> Result<(), CycleError> {
        let fetch_started = Instant::now();
        let fetched = self.source.fetch_datasets().await;
        timings.fetch_time = fetch_started.elapsed();

        let datasets = fetched?;
        if !datasets.iter().any(Dataset::is_usable) {
            return Err(CycleError::SourceUnavailable(
                "source yielded no usable records".to_string(),
            ));
        }
        debug!(
            datasets = datasets.len(),
            fetch_ms = timings.fetch_time.as_millis() as u64,
            "Fetched data sets"
        );

        let api = self.api.clone();
        let locations = self
            .call(Endpoint::Locations, timings, move || {
                let api = api.clone();
                async move { api.list_locations().await }
            })
            .await?;

        let items = unique_items(&datasets);
        let api = self.api.clone();
        let options = self
            .call(Endpoint::Options, timings, move || {
                let api = api.clone();
                let items = items.clone();
                async move { api.check_options(&items).await }
            })
            .await?;

        self.context = Some(CycleContext {
            datasets,
            locations,
            options,
            fetched_at: Utc::now(),
        });

        Ok(())
    }

    /// Issue one logical remote call: reserve, call with retries, record.
    async fn call<T, F, Fut>(
        &mut self,
        endpoint: Endpoint,
        timings: &mut CycleTimings,
        op: F,
    ) -> Result<T, CycleError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        if self.shutdown.is_set() {
            return Err(CycleError::Cancelled);
        }
        if !self.quota.try_reserve(endpoint) {
            return Err(CycleError::WindowExhausted { endpoint });
        }

        let outcome = self.caller.call(op, &mut self.shutdown).await;
        self.latency.record(outcome.elapsed());
        timings.call_time += outcome.elapsed();

        debug!(
            endpoint = %endpoint,
            attempts = outcome.attempts(),
            elapsed_ms = outcome.elapsed().as_millis() as u64,
            remaining_calls = self.quota.window(endpoint).remaining_calls(),
            "Remote call finished"
        );

        // A result that lands after cancellation is not acted upon.
        if self.shutdown.is_set() {
            return Err(CycleError::Cancelled);
        }

        match outcome {
            CallOutcome::Success { payload, .. } => Ok(payload),
            CallOutcome::Failure {
                error, attempts, ..
            } if error.is_quota_shaped() => Err(CycleError::QuotaExceeded { endpoint, attempts }),
            CallOutcome::Failure { error, .. } => {
                Err(CycleError::RemoteFailure { endpoint, error })
            }
        }
    }
}

/// Items of all data sets, one per key (largest quantity wins).
fn unique_items(datasets: &[Dataset]) -> Vec<Item> {
    let mut by_key: BTreeMap<&str, i64> = BTreeMap::new();
    for item in datasets.iter().flat_map(|d| &d.items) {
        let quantity = by_key.entry(item.key.as_str()).or_insert(item.quantity);
        *quantity = (*quantity).max(item.quantity);
    }

    by_key
        .into_iter()
        .map(|(key, quantity)| Item {
            key: key.to_string(),
            quantity,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(key: &str, quantity: i64) -> Item {
        Item {
            key: key.to_string(),
            quantity,
        }
    }

    #[test]
    fn test_unique_items() {
        let datasets = vec![
            Dataset {
                name: "a".into(),
                warehouses: vec![],
                date_range: Default::default(),
                items: vec![item("1", 2), item("2", 5)],
                max_coefficient: 1.0,
            },
            Dataset {
                name: "b".into(),
                warehouses: vec![],
                date_range: Default::default(),
                items: vec![item("1", 7)],
                max_coefficient: 1.0,
            },
        ];

        assert_eq!(unique_items(&datasets), vec![item("1", 7), item("2", 5)]);
    }

    #[test]
    fn test_source_error_mapping() {
        let permanent: CycleError = SourceError::Permanent("gone".into()).into();
        assert!(permanent.is_fatal());

        let transient: CycleError = SourceError::Unavailable("503".into()).into();
        assert!(!transient.is_fatal());
        assert_eq!(transient, CycleError::SourceUnavailable("503".into()));
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(CycleKind::RefreshAndCall.to_string(), "refresh+call");
        assert_eq!(CycleKind::CallOnly.to_string(), "call-only");
    }
}
