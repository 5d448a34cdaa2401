//! Watched data set sources.
//!
//! The scheduler fetches data sets once per window restart. Two adapters:
//! - `SheetsSource`: one data set per worksheet of a spreadsheet
//! - `FileSource`: a local JSON file (development and tests)

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Secret;
use crate::model::{Dataset, Item};

/// Source fetch errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    /// Transient failure; the next refresh may succeed.
    #[error("source unavailable: {0}")]
    Unavailable(String),

    /// The source cannot succeed without operator action.
    #[error("source permanently unavailable: {0}")]
    Permanent(String),
}

impl SourceError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

/// Provides the watched data sets.
#[async_trait]
pub trait DatasetSource: Send + Sync {
    async fn fetch_datasets(&self) -> Result<Vec<Dataset>, SourceError>;
}

// =============================================================================
// File source
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FileLayout {
    Wrapped { datasets: Vec<FileDataset> },
    Bare(Vec<FileDataset>),
}

#[derive(Debug, Deserialize)]
struct FileDataset {
    name: String,
    #[serde(default)]
    warehouses: Vec<String>,
    #[serde(default)]
    date_range: (String, String),
    #[serde(default)]
    items: Vec<Item>,
    #[serde(default)]
    max_coefficient: Option<f64>,
}

/// Reads data sets from a JSON file.
pub struct FileSource {
    path: PathBuf,
    default_max_coefficient: f64,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>, default_max_coefficient: f64) -> Self {
        Self {
            path: path.into(),
            default_max_coefficient,
        }
    }
}

#[async_trait]
impl DatasetSource for FileSource {
    async fn fetch_datasets(&self) -> Result<Vec<Dataset>, SourceError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SourceError::Permanent(format!(
                    "{} does not exist",
                    self.path.display()
                )));
            }
            Err(e) => {
                return Err(SourceError::Unavailable(format!(
                    "failed to read {}: {e}",
                    self.path.display()
                )));
            }
        };

        let layout: FileLayout = serde_json::from_str(&raw).map_err(|e| {
            SourceError::Unavailable(format!("failed to parse {}: {e}", self.path.display()))
        })?;
        let entries = match layout {
            FileLayout::Wrapped { datasets } => datasets,
            FileLayout::Bare(datasets) => datasets,
        };

        Ok(entries
            .into_iter()
            .map(|d| Dataset {
                name: d.name,
                warehouses: d.warehouses,
                date_range: d.date_range,
                items: d.items,
                max_coefficient: d.max_coefficient.unwrap_or(self.default_max_coefficient),
            })
            .collect())
    }
}

// =============================================================================
// Spreadsheet source
// =============================================================================

/// Cell holding the comma-separated location names.
const WAREHOUSES_AND_DATES_RANGE: &str = "B4:B6";
/// Barcode/quantity column pair, open-ended.
const ITEMS_RANGE: &str = "B8:C";

#[derive(Debug, Deserialize)]
struct SpreadsheetMeta {
    #[serde(default)]
    sheets: Vec<SheetEntry>,
}

#[derive(Debug, Deserialize)]
struct SheetEntry {
    properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
struct SheetProperties {
    title: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchGetResponse {
    #[serde(default)]
    value_ranges: Vec<ValueRange>,
}

#[derive(Debug, Default, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<String>>,
}

/// Reads one data set per worksheet through the Sheets values API.
///
/// Layout per worksheet: B4 location names (comma separated), B5/B6 start
/// and end dates, B8 onward barcode (B) and quantity (C).
pub struct SheetsSource {
    client: reqwest::Client,
    api_url: String,
    spreadsheet_id: String,
    api_key: Secret,
    default_max_coefficient: f64,
}

impl SheetsSource {
    pub fn new(
        api_url: &str,
        spreadsheet_url: &str,
        api_key: Secret,
        timeout: Duration,
        default_max_coefficient: f64,
    ) -> Result<Self, SourceError> {
        let spreadsheet_id = extract_spreadsheet_id(spreadsheet_url).ok_or_else(|| {
            SourceError::Permanent(format!("invalid spreadsheet URL: {spreadsheet_url}"))
        })?;

        let client = reqwest::Client::builder()
            .user_agent("slotwatch/0.1.0")
            .timeout(timeout)
            .build()
            .map_err(|e| SourceError::Permanent(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            spreadsheet_id,
            api_key,
            default_max_coefficient,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T, SourceError> {
        let resp = self
            .client
            .get(url)
            .query(query)
            .query(&[("key", self.api_key.expose())])
            .send()
            .await
            .map_err(|e| SourceError::Unavailable(format!("request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let message = format!("spreadsheet request failed (status={status}): {body}");
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
                    SourceError::Permanent(message)
                }
                _ => SourceError::Unavailable(message),
            });
        }

        resp.json::<T>()
            .await
            .map_err(|e| SourceError::Unavailable(format!("invalid spreadsheet response: {e}")))
    }

    async fn sheet_titles(&self) -> Result<Vec<String>, SourceError> {
        let url = format!("{}/v4/spreadsheets/{}", self.api_url, self.spreadsheet_id);
        let meta: SpreadsheetMeta = self
            .get_json(&url, &[("fields", "sheets.properties.title")])
            .await?;
        Ok(meta.sheets.into_iter().map(|s| s.properties.title).collect())
    }

    async fn read_sheet(&self, title: &str) -> Result<Dataset, SourceError> {
        let url = format!(
            "{}/v4/spreadsheets/{}/values:batchGet",
            self.api_url, self.spreadsheet_id
        );
        let header_range = a1_range(title, WAREHOUSES_AND_DATES_RANGE);
        let items_range = a1_range(title, ITEMS_RANGE);

        let resp: BatchGetResponse = self
            .get_json(
                &url,
                &[("ranges", header_range.as_str()), ("ranges", items_range.as_str())],
            )
            .await?;

        let mut ranges = resp.value_ranges.into_iter();
        let header = ranges.next().unwrap_or_default();
        let items = ranges.next().unwrap_or_default();

        Ok(parse_sheet(
            title,
            &header.values,
            &items.values,
            self.default_max_coefficient,
        ))
    }
}

#[async_trait]
impl DatasetSource for SheetsSource {
    async fn fetch_datasets(&self) -> Result<Vec<Dataset>, SourceError> {
        let titles = self.sheet_titles().await?;
        debug!(sheet_count = titles.len(), "Listed worksheets");

        let mut datasets = Vec::with_capacity(titles.len());
        for title in titles {
            match self.read_sheet(&title).await {
                Ok(dataset) => datasets.push(dataset),
                Err(e) => warn!(sheet = %title, error = %e, "Skipping worksheet"),
            }
        }

        Ok(datasets)
    }
}

/// Extract the spreadsheet ID from a `.../d/<id>/...` URL.
fn extract_spreadsheet_id(url: &str) -> Option<String> {
    let (_, rest) = url.split_once("/d/")?;
    let id = rest.split('/').next()?.trim();
    (!id.is_empty()).then(|| id.to_string())
}

fn a1_range(title: &str, cells: &str) -> String {
    format!("'{}'!{}", title.replace('\'', "''"), cells)
}

fn cell(rows: &[Vec<String>], row: usize, col: usize) -> Option<&str> {
    rows.get(row)
        .and_then(|r| r.get(col))
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}

fn parse_sheet(
    title: &str,
    header: &[Vec<String>],
    item_rows: &[Vec<String>],
    max_coefficient: f64,
) -> Dataset {
    let warehouses = cell(header, 0, 0)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|w| !w.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let start = cell(header, 1, 0).unwrap_or_default().to_string();
    let end = cell(header, 2, 0).unwrap_or_default().to_string();

    let items = item_rows
        .iter()
        .filter_map(|row| {
            let key = row.first().map(|v| v.trim()).filter(|v| !v.is_empty())?;
            let quantity = row
                .get(1)
                .and_then(|q| q.trim().parse::<i64>().ok())
                .unwrap_or(0);
            Some(Item {
                key: key.to_string(),
                quantity,
            })
        })
        .collect();

    Dataset {
        name: title.to_string(),
        warehouses,
        date_range: (start, end),
        items,
        max_coefficient,
    }
}
