//! Change-only delivery of snapshots to subscribers.
//!
//! A snapshot is reduced to a content fingerprint. Each subscriber receives
//! a push only when the fingerprint differs from the last one delivered to
//! them, so a steady state costs one comparison per subscriber and no I/O.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::report::Snapshot;
use crate::shutdown::ShutdownSignal;
use crate::subscribers::{DeliveryStatus, StoreError, SubscriberId, SubscriberRegistry};

/// SHA-256 content fingerprint, `sha256:<hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(text: &str) -> Self {
        let digest = Sha256::digest(text.as_bytes());
        Self(format!("sha256:{}", hex::encode(digest)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Push failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// The target is gone (blocked the bot, chat deleted). Permanent.
    #[error("subscriber unreachable: {0}")]
    Unreachable(String),

    #[error("delivery failed: {0}")]
    Transient(String),
}

/// Sends rendered text to one subscriber.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send_to(&self, id: SubscriberId, text: &str) -> Result<(), DeliveryError>;
}

/// Counts for one delivery batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub sent: usize,
    pub suppressed: usize,
    pub removed: usize,
    pub failed: usize,
}

/// Delivers snapshots to subscribers whose last fingerprint differs.
pub struct ChangeNotifier {
    registry: Arc<SubscriberRegistry>,
    sink: Arc<dyn NotificationSink>,
    send_spacing: Duration,
    shutdown: Option<ShutdownSignal>,
}

impl ChangeNotifier {
    pub fn new(
        registry: Arc<SubscriberRegistry>,
        sink: Arc<dyn NotificationSink>,
        send_spacing: Duration,
    ) -> Self {
        Self {
            registry,
            sink,
            send_spacing,
            shutdown: None,
        }
    }

    /// Stop a batch between two pushes once `shutdown` is set. Subscribers
    /// not reached yet stay pending.
    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    /// Push `snapshot` to every subscriber that has not seen it yet.
    ///
    /// Sends happen outside the registry lock; the outcomes are applied and
    /// persisted once for the whole batch.
    pub async fn deliver(&self, snapshot: &Snapshot) -> Result<DeliveryReport, StoreError> {
        let fp = Fingerprint::of(&snapshot.body);
        let total = self.registry.len().await;
        let pending = self.registry.pending_for(&fp).await;

        let mut report = DeliveryReport {
            suppressed: total.saturating_sub(pending.len()),
            ..Default::default()
        };

        if pending.is_empty() {
            debug!(
                fingerprint = %fp,
                suppressed = report.suppressed,
                "Snapshot unchanged, nothing to send"
            );
            return Ok(report);
        }

        let message = snapshot.message();
        let mut outcomes = Vec::with_capacity(pending.len());
        let mut shutdown = self.shutdown.clone();
        let pending_count = pending.len();

        for (i, id) in pending.into_iter().enumerate() {
            if i > 0 && self.pause_between_sends(shutdown.as_mut()).await {
                info!(
                    remaining = pending_count - i,
                    "Shutdown requested, stopping delivery batch"
                );
                break;
            }

            let status = match self.sink.send_to(id, &message).await {
                Ok(()) => {
                    report.sent += 1;
                    DeliveryStatus::Delivered
                }
                Err(DeliveryError::Unreachable(reason)) => {
                    info!(subscriber = %id, reason = %reason, "Subscriber unreachable, removing");
                    report.removed += 1;
                    DeliveryStatus::Unreachable
                }
                Err(DeliveryError::Transient(reason)) => {
                    warn!(
                        subscriber = %id,
                        reason = %reason,
                        "Delivery failed, will retry on next change"
                    );
                    report.failed += 1;
                    DeliveryStatus::Transient
                }
            };
            outcomes.push((id, status));
        }

        self.registry.apply_deliveries(&fp, &outcomes).await?;

        info!(
            fingerprint = %fp,
            sent = report.sent,
            suppressed = report.suppressed,
            removed = report.removed,
            failed = report.failed,
            "Delivered snapshot"
        );

        Ok(report)
    }

    /// Wait out the send spacing. Returns true if shutdown was requested.
    async fn pause_between_sends(&self, shutdown: Option<&mut ShutdownSignal>) -> bool {
        match shutdown {
            Some(signal) if self.send_spacing.is_zero() => signal.is_set(),
            Some(signal) => signal.sleep(self.send_spacing).await,
            None => {
                if !self.send_spacing.is_zero() {
                    tokio::time::sleep(self.send_spacing).await;
                }
                false
            }
        }
    }
}
