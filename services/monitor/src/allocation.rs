//! Remote allocation API collaborator.
//!
//! Three call shapes: the location directory, the acceptance coefficient
//! listing and per-item acceptance options. Failures are classified at this
//! boundary so the retry layer only sees structured outcomes.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::Secret;
use crate::model::{Coefficient, Item, ItemOptions, Location, LocationOption, OptionsReport};

/// Body fragments providers use when throttling without a 429.
const QUOTA_MARKERS: &[&str] = &[
    "too many requests",
    "rate limit",
    "limit exceeded",
    "quota exceeded",
];

/// Remote call failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// The provider rejected the call as rate limited.
    #[error("rate limited (status={status:?})")]
    RateLimited {
        status: Option<u16>,
        retry_after: Option<Duration>,
    },

    /// The attempt exceeded the request timeout.
    #[error("request timed out")]
    Timeout,

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid response: {0}")]
    Decode(String),
}

impl RemoteError {
    /// Whether a retry with backoff may succeed.
    pub fn is_quota_shaped(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Timeout)
    }
}

/// Classify a non-success response.
pub fn classify_failure(
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> RemoteError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return RemoteError::RateLimited {
            status: Some(status.as_u16()),
            retry_after,
        };
    }

    let lowered = body.to_lowercase();
    if QUOTA_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        return RemoteError::RateLimited {
            status: Some(status.as_u16()),
            retry_after,
        };
    }

    RemoteError::Http {
        status: status.as_u16(),
        body: body.to_string(),
    }
}

fn classify_transport(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Timeout
    } else if err.is_decode() {
        RemoteError::Decode(err.to_string())
    } else {
        RemoteError::Transport(err.to_string())
    }
}

/// The remote allocation API.
#[async_trait]
pub trait AllocationApi: Send + Sync {
    async fn list_locations(&self) -> Result<Vec<Location>, RemoteError>;

    async fn list_coefficients(&self) -> Result<Vec<Coefficient>, RemoteError>;

    async fn check_options(&self, items: &[Item]) -> Result<OptionsReport, RemoteError>;
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Deserialize)]
struct WireLocation {
    #[serde(rename = "ID")]
    id: i64,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCoefficient {
    #[serde(rename = "warehouseID")]
    warehouse_id: i64,
    #[serde(default)]
    warehouse_name: String,
    #[serde(default)]
    date: String,
    coefficient: f64,
    #[serde(default)]
    allow_unload: bool,
    #[serde(default)]
    box_type_name: String,
}

#[derive(Debug, Serialize)]
struct WireItem<'a> {
    quantity: i64,
    barcode: &'a str,
}

#[derive(Debug, Deserialize)]
struct WireOptionsReport {
    #[serde(default)]
    result: Vec<WireItemOptions>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireItemOptions {
    #[serde(default)]
    barcode: String,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    error: Option<WireOptionsError>,
    #[serde(default)]
    warehouses: Option<Vec<WireLocationOption>>,
}

#[derive(Debug, Deserialize)]
struct WireOptionsError {
    #[serde(default)]
    title: String,
    #[serde(default)]
    detail: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireLocationOption {
    #[serde(rename = "warehouseID")]
    warehouse_id: i64,
    #[serde(default)]
    can_box: bool,
    #[serde(default)]
    can_monopallet: bool,
    #[serde(default)]
    can_supersafe: bool,
}

impl From<WireCoefficient> for Coefficient {
    fn from(w: WireCoefficient) -> Self {
        Self {
            location_id: w.warehouse_id,
            location_name: w.warehouse_name,
            date: w.date,
            coefficient: w.coefficient,
            allow_unload: w.allow_unload,
            box_type: w.box_type_name,
        }
    }
}

impl From<WireItemOptions> for ItemOptions {
    fn from(w: WireItemOptions) -> Self {
        let error = w.error.map(|e| match (e.title.is_empty(), e.detail.is_empty()) {
            (false, false) => format!("{} - {}", e.title, e.detail),
            (false, true) => e.title,
            (true, _) => e.detail,
        });

        Self {
            key: w.barcode,
            is_error: w.is_error,
            error,
            locations: w
                .warehouses
                .unwrap_or_default()
                .into_iter()
                .map(|o| LocationOption {
                    location_id: o.warehouse_id,
                    can_box: o.can_box,
                    can_monopallet: o.can_monopallet,
                    can_supersafe: o.can_supersafe,
                })
                .collect(),
        }
    }
}

// =============================================================================
// HTTP client
// =============================================================================

/// HTTP client for the supplies API.
pub struct HttpAllocationApi {
    client: reqwest::Client,
    base_url: String,
    api_key: Secret,
}

impl HttpAllocationApi {
    pub fn new(base_url: &str, api_key: Secret, timeout: Duration) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .user_agent("slotwatch/0.1.0")
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    async fn read<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, RemoteError> {
        let response = request
            .header("Authorization", self.api_key.expose())
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = response.text().await.unwrap_or_default();
            return Err(classify_failure(status, retry_after, &body));
        }

        response.json::<T>().await.map_err(classify_transport)
    }
}

#[async_trait]
impl AllocationApi for HttpAllocationApi {
    async fn list_locations(&self) -> Result<Vec<Location>, RemoteError> {
        let url = format!("{}/api/v1/warehouses", self.base_url);
        let wire: Vec<WireLocation> = self.read(self.client.get(&url)).await?;
        debug!(count = wire.len(), "Fetched location directory");

        Ok(wire
            .into_iter()
            .map(|w| Location {
                id: w.id,
                name: w.name,
            })
            .collect())
    }

    async fn list_coefficients(&self) -> Result<Vec<Coefficient>, RemoteError> {
        let url = format!("{}/api/v1/acceptance/coefficients", self.base_url);
        let wire: Vec<WireCoefficient> = self.read(self.client.get(&url)).await?;
        debug!(count = wire.len(), "Fetched acceptance coefficients");

        Ok(wire.into_iter().map(Coefficient::from).collect())
    }

    async fn check_options(&self, items: &[Item]) -> Result<OptionsReport, RemoteError> {
        let url = format!("{}/api/v1/acceptance/options", self.base_url);
        let body: Vec<WireItem<'_>> = items
            .iter()
            .map(|i| WireItem {
                quantity: i.quantity,
                barcode: &i.key,
            })
            .collect();

        let wire: WireOptionsReport = self.read(self.client.post(&url).json(&body)).await?;
        debug!(count = wire.result.len(), "Fetched acceptance options");

        Ok(OptionsReport {
            result: wire.result.into_iter().map(ItemOptions::from).collect(),
        })
    }
}
