//! Subscriber table and its durable store.
//!
//! The table is shared by the notifier and the bot command loop. Every
//! read-modify-write runs under one async mutex, and each batch of mutations
//! is persisted with a write-to-temp then rename.
//!
//! File format v2:
//! `{"version": 2, "updated_at": "...", "subscribers": {"<id>": {"last_fingerprint": "sha256:..."}}}`
//!
//! Older files (`{"subscribed_users": [ids]}`, `{"subscribed_users": {id: {...}}}`
//! or a bare `[ids]`) are upgraded once at load and rewritten immediately.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::notifier::Fingerprint;

/// Current store format version.
const STORE_VERSION: u32 = 2;

/// Chat identifier of a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriberId(pub i64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SubscriberId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

/// Per-subscriber delivery state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberRecord {
    /// Fingerprint of the last snapshot delivered. None means never delivered.
    #[serde(default)]
    pub last_fingerprint: Option<Fingerprint>,
}

pub type SubscriberTable = BTreeMap<SubscriberId, SubscriberRecord>;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedSubscribers {
    version: u32,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
    subscribers: SubscriberTable,
}

/// Result of loading the store.
#[derive(Debug, Default)]
pub struct LoadedTable {
    pub table: SubscriberTable,
    /// The file was in a legacy format and must be rewritten.
    pub migrated: bool,
}

/// Durable subscriber store.
#[derive(Debug, Clone)]
pub struct SubscriberStore {
    path: PathBuf,
}

impl SubscriberStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the table. A missing file yields an empty table.
    pub fn load(&self) -> Result<LoadedTable, StoreError> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "No subscriber store, starting empty");
            return Ok(LoadedTable::default());
        }

        let content = fs::read_to_string(&self.path).map_err(|e| StoreError::io(&self.path, e))?;
        let value: serde_json::Value =
            serde_json::from_str(&content).map_err(|e| self.parse_error(e))?;
        let loaded = self.decode(value)?;

        info!(
            path = %self.path.display(),
            subscriber_count = loaded.table.len(),
            migrated = loaded.migrated,
            "Loaded subscriber store"
        );

        Ok(loaded)
    }

    fn decode(&self, value: serde_json::Value) -> Result<LoadedTable, StoreError> {
        use serde_json::Value;

        let legacy_ids = |ids: Vec<SubscriberId>| LoadedTable {
            table: ids
                .into_iter()
                .map(|id| (id, SubscriberRecord::default()))
                .collect(),
            migrated: true,
        };

        let is_current = value.get("version").is_some();
        match value {
            Value::Array(_) => {
                let ids: Vec<SubscriberId> =
                    serde_json::from_value(value).map_err(|e| self.parse_error(e))?;
                Ok(legacy_ids(ids))
            }
            Value::Object(_) if is_current => {
                let state: PersistedSubscribers =
                    serde_json::from_value(value).map_err(|e| self.parse_error(e))?;
                if state.version > STORE_VERSION {
                    return Err(self.parse_error(format!(
                        "unsupported store version {}",
                        state.version
                    )));
                }
                Ok(LoadedTable {
                    table: state.subscribers,
                    migrated: state.version < STORE_VERSION,
                })
            }
            Value::Object(mut fields) => match fields.remove("subscribed_users") {
                Some(list @ Value::Array(_)) => {
                    let ids: Vec<SubscriberId> =
                        serde_json::from_value(list).map_err(|e| self.parse_error(e))?;
                    Ok(legacy_ids(ids))
                }
                // Legacy hashes used a different digest; they never match.
                Some(map @ Value::Object(_)) => {
                    let users: BTreeMap<SubscriberId, IgnoredAny> =
                        serde_json::from_value(map).map_err(|e| self.parse_error(e))?;
                    Ok(legacy_ids(users.into_keys().collect()))
                }
                _ => Err(self.parse_error("unrecognized store layout")),
            },
            _ => Err(self.parse_error("unrecognized store layout")),
        }
    }

    fn parse_error(&self, reason: impl fmt::Display) -> StoreError {
        StoreError::Parse {
            path: self.path.clone(),
            reason: reason.to_string(),
        }
    }

    /// Save the table atomically.
    pub fn save(&self, table: &SubscriberTable) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }

        let state = PersistedSubscribers {
            version: STORE_VERSION,
            updated_at: Some(Utc::now()),
            subscribers: table.clone(),
        };
        let content = serde_json::to_string_pretty(&state).map_err(|e| self.parse_error(e))?;

        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, content).map_err(|e| StoreError::io(&tmp_path, e))?;
        fs::rename(&tmp_path, &self.path).map_err(|e| StoreError::io(&self.path, e))?;

        debug!(
            path = %self.path.display(),
            subscriber_count = table.len(),
            "Saved subscriber store"
        );

        Ok(())
    }
}

/// Outcome of one push, as applied to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Delivered,
    Unreachable,
    Transient,
}

/// Changes applied by one delivery batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AppliedBatch {
    pub updated: usize,
    pub removed: usize,
}

/// Process-wide subscriber table.
pub struct SubscriberRegistry {
    store: SubscriberStore,
    table: Mutex<SubscriberTable>,
}

impl SubscriberRegistry {
    /// Load the store, rewriting it right away if it was in a legacy format.
    pub fn open(store: SubscriberStore) -> Result<Self, StoreError> {
        let loaded = store.load()?;
        if loaded.migrated {
            store.save(&loaded.table)?;
            info!(
                path = %store.path().display(),
                subscriber_count = loaded.table.len(),
                "Upgraded subscriber store"
            );
        }

        Ok(Self {
            store,
            table: Mutex::new(loaded.table),
        })
    }

    /// Add a subscriber. Returns false if already subscribed.
    pub async fn subscribe(&self, id: SubscriberId) -> Result<bool, StoreError> {
        let mut table = self.table.lock().await;
        if table.contains_key(&id) {
            return Ok(false);
        }
        let mut next = table.clone();
        next.insert(id, SubscriberRecord::default());
        self.store.save(&next)?;
        *table = next;
        Ok(true)
    }

    /// Remove a subscriber. Returns false if not subscribed.
    pub async fn unsubscribe(&self, id: SubscriberId) -> Result<bool, StoreError> {
        let mut table = self.table.lock().await;
        let mut next = table.clone();
        if next.remove(&id).is_none() {
            return Ok(false);
        }
        self.store.save(&next)?;
        *table = next;
        Ok(true)
    }

    pub async fn contains(&self, id: SubscriberId) -> bool {
        self.table.lock().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.table.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.table.lock().await.is_empty()
    }

    pub async fn get(&self, id: SubscriberId) -> Option<SubscriberRecord> {
        self.table.lock().await.get(&id).cloned()
    }

    /// Subscribers whose last delivered fingerprint differs from `fp`.
    pub async fn pending_for(&self, fp: &Fingerprint) -> Vec<SubscriberId> {
        let table = self.table.lock().await;
        table
            .iter()
            .filter(|(_, record)| record.last_fingerprint.as_ref() != Some(fp))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Apply the outcomes of one batch and persist once.
    ///
    /// Subscribers that left while the batch was in flight stay removed.
    pub async fn apply_deliveries(
        &self,
        fp: &Fingerprint,
        outcomes: &[(SubscriberId, DeliveryStatus)],
    ) -> Result<AppliedBatch, StoreError> {
        let mut table = self.table.lock().await;
        let mut next = table.clone();
        let mut applied = AppliedBatch::default();

        for (id, status) in outcomes {
            match status {
                DeliveryStatus::Delivered => {
                    if let Some(record) = next.get_mut(id) {
                        record.last_fingerprint = Some(fp.clone());
                        applied.updated += 1;
                    }
                }
                DeliveryStatus::Unreachable => {
                    if next.remove(id).is_some() {
                        applied.removed += 1;
                    }
                }
                DeliveryStatus::Transient => {}
            }
        }

        if applied != AppliedBatch::default() {
            self.store.save(&next)?;
            *table = next;
        }

        Ok(applied)
    }
}
