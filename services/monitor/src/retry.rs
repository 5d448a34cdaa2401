//! Bounded retry of remote calls on quota-shaped failures.

use std::future::Future;
use std::time::{Duration, Instant};

use slotwatch_pacing::BackoffPolicy;
use tracing::{debug, warn};

use crate::allocation::RemoteError;
use crate::shutdown::ShutdownSignal;

/// Outcome of one logical call, retries included.
///
/// `elapsed` covers every attempt and every backoff sleep: failed attempts
/// consume real window time and feed the latency history like successes.
#[derive(Debug)]
pub enum CallOutcome<T> {
    Success {
        payload: T,
        elapsed: Duration,
        attempts: u32,
    },
    Failure {
        error: RemoteError,
        elapsed: Duration,
        attempts: u32,
    },
}

impl<T> CallOutcome<T> {
    pub fn elapsed(&self) -> Duration {
        match self {
            Self::Success { elapsed, .. } | Self::Failure { elapsed, .. } => *elapsed,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Success { attempts, .. } | Self::Failure { attempts, .. } => *attempts,
        }
    }
}

/// Executes remote calls with exponential backoff on rate limiting.
#[derive(Debug, Clone)]
pub struct RetryingCaller {
    max_attempts: u32,
    backoff: BackoffPolicy,
    attempt_timeout: Duration,
}

impl RetryingCaller {
    pub fn new(max_attempts: u32, backoff: BackoffPolicy, attempt_timeout: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            attempt_timeout,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run `op` until it succeeds, fails with a non-quota error, or runs out
    /// of attempts. A set shutdown signal prevents any further backoff.
    pub async fn call<T, F, Fut>(&self, mut op: F, shutdown: &mut ShutdownSignal) -> CallOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let started = Instant::now();
        let mut attempt = 0;

        loop {
            attempt += 1;

            let result = match tokio::time::timeout(self.attempt_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(RemoteError::Timeout),
            };

            let error = match result {
                Ok(payload) => {
                    return CallOutcome::Success {
                        payload,
                        elapsed: started.elapsed(),
                        attempts: attempt,
                    };
                }
                Err(e) => e,
            };

            if !error.is_quota_shaped() {
                debug!(attempt, error = %error, "Remote call failed, not retrying");
                return self.failure(error, started, attempt);
            }

            if attempt >= self.max_attempts {
                warn!(attempt, error = %error, "Remote call rate limited, attempts exhausted");
                return self.failure(error, started, attempt);
            }

            if shutdown.is_set() {
                debug!(attempt, "Shutdown requested, skipping backoff");
                return self.failure(error, started, attempt);
            }

            let delay = self.delay_for(attempt, &error);
            warn!(
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Remote call rate limited, backing off"
            );

            if shutdown.sleep(delay).await {
                return self.failure(error, started, attempt);
            }
        }
    }

    fn delay_for(&self, attempt: u32, error: &RemoteError) -> Duration {
        let delay = self.backoff.delay(attempt);
        match error {
            RemoteError::RateLimited {
                retry_after: Some(hint),
                ..
            } => delay.max((*hint).min(self.backoff.max)),
            _ => delay,
        }
    }

    fn failure<T>(&self, error: RemoteError, started: Instant, attempts: u32) -> CallOutcome<T> {
        CallOutcome::Failure {
            error,
            elapsed: started.elapsed(),
            attempts,
        }
    }
}
