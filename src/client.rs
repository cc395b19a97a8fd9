//! Client side of the measurement API: an HTTP client and the drawing session
//! that turns finished shapes into saved measurements.

use crate::geometry::{DisplayProjection, DrawnShape};
use crate::server::NOTHING_TO_DELETE;
use crate::types::{Measurement, NewMeasurement};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Local, NaiveDate};
use futures::future::join_all;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("server responded {status}: {message}")]
    Server { status: u16, message: String },
    #[error("no measurements to delete")]
    NothingToDelete,
}

#[async_trait]
pub trait MeasurementApi: Send + Sync {
    async fn create(&self, new: &NewMeasurement) -> Result<Measurement, ClientError>;
    async fn list(&self) -> Result<Vec<Measurement>, ClientError>;
    async fn delete_latest(&self) -> Result<u64, ClientError>;
}

/// Talks to the REST API at `base` (for example `http://127.0.0.1:3000/api`).
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    details: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteBody {
    deleted_count: u64,
}

impl ApiClient {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub async fn health(&self) -> Result<bool, ClientError> {
        let resp = self.http.get(self.url("/health")).send().await?;
        Ok(resp.status().is_success())
    }

    async fn server_error(resp: reqwest::Response) -> ClientError {
        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();
        let message = match serde_json::from_str::<ErrorBody>(&text) {
            Ok(ErrorBody { error, details: Some(details) }) => format!("{error} ({details})"),
            Ok(ErrorBody { error, details: None }) => error,
            Err(_) => text,
        };
        ClientError::Server { status, message }
    }
}

#[async_trait]
impl MeasurementApi for ApiClient {
    async fn create(&self, new: &NewMeasurement) -> Result<Measurement, ClientError> {
        let resp = self.http.post(self.url("/measurements")).json(new).send().await?;
        if !resp.status().is_success() {
            return Err(Self::server_error(resp).await);
        }
        Ok(resp.json().await?)
    }

    async fn list(&self) -> Result<Vec<Measurement>, ClientError> {
        let resp = self.http.get(self.url("/measurements")).send().await?;
        if !resp.status().is_success() {
            return Err(Self::server_error(resp).await);
        }
        Ok(resp.json().await?)
    }

    async fn delete_latest(&self) -> Result<u64, ClientError> {
        let resp = self.http.delete(self.url("/measurements/latest")).send().await?;
        if !resp.status().is_success() {
            // a 404 from a wrong base URL must not read as an empty store
            return Err(match Self::server_error(resp).await {
                ClientError::Server { status: 404, message } if message == NOTHING_TO_DELETE => {
                    ClientError::NothingToDelete
                }
                other => other,
            });
        }
        let body: DeleteBody = resp.json().await?;
        Ok(body.deleted_count)
    }
}

/// A shape that the server has confirmed, with the record it was stored as.
#[derive(Debug, Clone)]
pub struct SavedShape {
    pub shape: DrawnShape,
    pub record: Measurement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchOutcome {
    pub submitted: usize,
    pub saved: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl BatchOutcome {
    pub fn succeeded(&self) -> bool {
        self.failed == 0
    }
}

/// Everything the map UI holds between interactions: drawn but unsaved
/// shapes, confirmed shapes, the last listing and a single status line.
#[derive(Debug)]
pub struct DrawSession {
    projection: DisplayProjection,
    pending: Vec<DrawnShape>,
    saved: Vec<SavedShape>,
    records: Vec<Measurement>,
    status: String,
}

impl DrawSession {
    pub fn new(projection: DisplayProjection) -> Self {
        Self {
            projection,
            pending: Vec::new(),
            saved: Vec::new(),
            records: Vec::new(),
            status: String::new(),
        }
    }

    pub fn add_shape(&mut self, shape: DrawnShape) {
        self.pending.push(shape);
    }

    pub fn pending(&self) -> &[DrawnShape] {
        &self.pending
    }

    pub fn saved(&self) -> &[SavedShape] {
        &self.saved
    }

    pub fn records(&self) -> &[Measurement] {
        &self.records
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    /// Submit every pending shape concurrently.
    ///
    /// Degenerate shapes are dropped without a request. Shapes whose create
    /// call succeeds move to the saved layer; failed ones stay pending so the
    /// user can retry. Requests already committed are never rolled back.
    pub async fn save_pending<A>(&mut self, api: &A) -> BatchOutcome
    where
        A: MeasurementApi + ?Sized,
    {
        let mut outcome = BatchOutcome::default();
        let mut batch = Vec::new();
        for shape in std::mem::take(&mut self.pending) {
            match shape.measure(self.projection) {
                Some(measurement) => batch.push((shape, measurement)),
                None => {
                    debug!("Skipping degenerate {} with too few vertices", shape.kind());
                    outcome.skipped += 1;
                }
            }
        }

        if batch.is_empty() {
            self.status = "Nothing to save.".to_string();
            return outcome;
        }

        let total = batch.len();
        outcome.submitted = total;
        let completed = AtomicUsize::new(0);
        let results = join_all(batch.iter().map(|(_, measurement)| {
            let completed = &completed;
            async move {
                let result = api.create(measurement).await;
                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                debug!("{}/{} create calls resolved", done, total);
                result
            }
        }))
        .await;

        let mut first_error = None;
        for ((shape, _), result) in batch.into_iter().zip(results) {
            match result {
                Ok(record) => {
                    outcome.saved += 1;
                    self.saved.push(SavedShape { shape, record });
                }
                Err(e) => {
                    warn!("Failed to save measurement: {}", e);
                    outcome.failed += 1;
                    first_error.get_or_insert(e);
                    self.pending.push(shape);
                }
            }
        }

        self.status = match first_error {
            None => format!("Saved {} measurement(s).", outcome.saved),
            Some(e) => format!(
                "Failed to save {} of {} measurement(s): {}",
                outcome.failed, total, e
            ),
        };
        info!("{}", self.status);
        outcome
    }

    /// Reload all stored measurements, newest first.
    pub async fn refresh<A>(&mut self, api: &A) -> Result<(), ClientError>
    where
        A: MeasurementApi + ?Sized,
    {
        match api.list().await {
            Ok(records) => {
                self.status = format!("Loaded {} measurement(s).", records.len());
                self.records = records;
                Ok(())
            }
            Err(e) => {
                self.status = format!("Failed to load measurements: {}", e);
                Err(e)
            }
        }
    }

    /// Delete the most recently stored measurement, then reload the listing.
    pub async fn delete_latest<A>(&mut self, api: &A) -> Result<(), ClientError>
    where
        A: MeasurementApi + ?Sized,
    {
        match api.delete_latest().await {
            Ok(_) => {
                self.status = match self.refresh(api).await {
                    Ok(()) => "Deleted the latest measurement.".to_string(),
                    Err(e) => format!(
                        "Deleted the latest measurement, but reloading the list failed: {}",
                        e
                    ),
                };
                Ok(())
            }
            Err(ClientError::NothingToDelete) => {
                self.status = "There are no measurements to delete.".to_string();
                Err(ClientError::NothingToDelete)
            }
            Err(e) => {
                self.status = format!("Failed to delete the latest measurement: {}", e);
                Err(e)
            }
        }
    }

    /// Write the full listing to `dir` as `measurements-YYYY-MM-DD.json`.
    pub async fn download<A>(&mut self, api: &A, dir: &Path) -> Result<PathBuf>
    where
        A: MeasurementApi + ?Sized,
    {
        self.refresh(api).await?;
        let path = dir.join(export_file_name(Local::now().date_naive()));
        let json = serde_json::to_string_pretty(&self.records)
            .context("Failed to serialize measurements")?;
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("Failed to write {:?}", path))?;
        self.status = format!("Downloaded {} measurement(s) to {}", self.records.len(), path.display());
        Ok(path)
    }
}

pub fn export_file_name(date: NaiveDate) -> String {
    format!("measurements-{}.json", date.format("%Y-%m-%d"))
}
