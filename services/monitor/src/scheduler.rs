//! The cancellable polling loop.
//!
//! Drives `PollCycleRunner` until the shutdown signal fires. The signal is
//! observed at the loop top, raced against the in-flight cycle and raced
//! against the inter-cycle pause. An in-flight cycle gets a grace period to
//! finish; its result is then discarded.

use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::cycle::{CycleResult, PollCycleRunner};
use crate::shutdown::ShutdownSignal;

/// Consecutive failures logged at `warn` before escalating to `error`.
const FAILURE_ESCALATION: u32 = 3;

/// Observable scheduler state, published after every cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStatus {
    pub cycle_count: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

/// How the loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopOutcome {
    Stopped {
        cycle_count: u64,
        last_success: Option<DateTime<Utc>>,
    },
}

/// Repeats cycles with adaptive pauses until cancelled.
pub struct CancellableLoop {
    runner: PollCycleRunner,
    shutdown: ShutdownSignal,
    failure_backoff: Duration,
    grace: Duration,
    status: watch::Sender<SchedulerStatus>,
}

impl CancellableLoop {
    pub fn new(
        runner: PollCycleRunner,
        shutdown: ShutdownSignal,
        failure_backoff: Duration,
        grace: Duration,
    ) -> Self {
        let (status, _) = watch::channel(SchedulerStatus::default());
        Self {
            runner,
            shutdown,
            failure_backoff,
            grace,
            status,
        }
    }

    /// Subscribe to status updates.
    pub fn status(&self) -> watch::Receiver<SchedulerStatus> {
        self.status.subscribe()
    }

    /// Run until cancelled.
    ///
    /// Returns an error only for unrecoverable setup failures.
    pub async fn run(mut self) -> Result<LoopOutcome> {
        let mut state = SchedulerStatus::default();
        info!(
            failure_backoff_secs = self.failure_backoff.as_secs(),
            "Starting scheduler loop"
        );

        loop {
            if self.shutdown.is_set() {
                break;
            }

            let result = {
                let cycle = self.runner.run_cycle();
                tokio::pin!(cycle);

                tokio::select! {
                    result = &mut cycle => Some(result),
                    _ = self.shutdown.cancelled() => {
                        match tokio::time::timeout(self.grace, &mut cycle).await {
                            Ok(_) => debug!(
                                "In-flight cycle finished after cancellation, result discarded"
                            ),
                            Err(_) => warn!(
                                grace_ms = self.grace.as_millis() as u64,
                                "Abandoning in-flight cycle"
                            ),
                        }
                        None
                    }
                }
            };

            let Some(result) = result else {
                break;
            };

            state.cycle_count += 1;
            let pause = match &result {
                CycleResult::Success { .. } => {
                    state.last_success = Some(Utc::now());
                    state.consecutive_failures = 0;
                    self.runner.next_pause()
                }
                CycleResult::Failure { reason, .. } => {
                    if reason.is_fatal() {
                        error!(reason = %reason, "Scheduler cannot continue");
                        self.status.send_replace(state);
                        return Err(anyhow!("unrecoverable cycle failure: {reason}"));
                    }

                    state.consecutive_failures += 1;
                    if state.consecutive_failures > FAILURE_ESCALATION {
                        error!(
                            reason = %reason,
                            consecutive_failures = state.consecutive_failures,
                            "Cycles failing repeatedly"
                        );
                    }

                    if self.runner.window_exhausted() {
                        self.runner.remaining_in_window()
                    } else {
                        self.failure_backoff
                    }
                }
            };

            self.status.send_replace(state.clone());

            let window = self.runner.quota().pacing_window();
            info!(
                cycle = state.cycle_count,
                kind = %result.kind(),
                success = result.is_success(),
                remaining_calls = window.remaining_calls(),
                remaining_window_ms = window.remaining_in_window().as_millis() as u64,
                mean_latency_ms = self.runner.latency().mean_latency().as_millis() as u64,
                pause_ms = pause.as_millis() as u64,
                "Pacing decision"
            );

            if self.shutdown.sleep(pause).await {
                break;
            }
        }

        info!(
            cycle_count = state.cycle_count,
            last_success = ?state.last_success,
            "Scheduler loop stopped"
        );

        Ok(LoopOutcome::Stopped {
            cycle_count: state.cycle_count,
            last_success: state.last_success,
        })
    }
}
