//! AutoExam REST client.
//!
//! This module provides functionality to:
//! - Stream-upload a CSV as multipart form data with byte-level progress
//! - Query the status and result of a grading job
//! - Fetch the upload history
//! - Build the download URL and stream the graded CSV to disk
//!
//! # Logging
//!
//! - File contents and response bodies are never logged
//! - Only HTTP method, path, byte counts and status codes are logged

use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::StreamExt;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::api::{redact_id, JobStatus};
use crate::error::AppError;
use crate::streaming::AtomicDownload;

// ─────────────────────────────────────────────────────────────────────────────
// Public Types
// ─────────────────────────────────────────────────────────────────────────────

/// Response of `POST /api/upload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadResponse {
    /// Backend-assigned job identifier (e.g. `result-1a2b3c4d5e6f`).
    pub id: String,
    /// Human-readable acknowledgement from the backend.
    pub message: String,
    #[serde(default)]
    pub success: Option<bool>,
}

/// One graded answer inside a completed result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamRecord {
    pub exam_id: String,
    pub question_id: String,
    pub score: u32,
    #[serde(default)]
    pub transcription: String,
}

/// Response of `GET /api/results/{id}`.
///
/// Everything past `status` is only filled in once the job has completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRecord {
    pub id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub total_records: Option<u64>,
    #[serde(default)]
    pub average_score: Option<f64>,
    /// Score bucket (`score1`, `score2`, ...) to number of answers.
    #[serde(default)]
    pub distribution: Option<BTreeMap<String, u64>>,
    #[serde(default)]
    pub records: Option<Vec<ExamRecord>>,
    #[serde(default)]
    pub download_url: Option<String>,
}

impl ResultRecord {
    /// True once the job is completed and its summary is present.
    pub fn is_ready(&self) -> bool {
        self.status == JobStatus::Completed && self.total_records.is_some()
    }
}

/// One entry of `GET /api/history`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: String,
    #[serde(default)]
    pub user_id: Option<u64>,
    pub filename: String,
    pub uploaded_at: String,
    pub status: JobStatus,
    #[serde(default)]
    pub total_records: Option<u64>,
    #[serde(default)]
    pub average_score: Option<f64>,
    #[serde(default)]
    pub results_url: Option<String>,
}

/// Response of `GET /api/history`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryResponse {
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Internal Wire Types
// ─────────────────────────────────────────────────────────────────────────────

/// FastAPI error body: `detail` is a string, or a list of validation items.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    detail: serde_json::Value,
}

// ─────────────────────────────────────────────────────────────────────────────
// Trait seam
// ─────────────────────────────────────────────────────────────────────────────

/// Backend operations used by the poller and the workflow, allowing test fakes.
pub trait ExamApiOps: Send + Sync {
    /// Uploads a file, emitting percentages on `progress`.
    fn upload_file<'a>(
        &'a self,
        path: &'a Path,
        progress: Option<UnboundedSender<u8>>,
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<UploadResponse, AppError>> + Send + 'a>>;

    /// Fetches the current status/result of a job.
    fn get_result<'a>(
        &'a self,
        job_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<ResultRecord, AppError>> + Send + 'a>>;

    /// Builds the download URL for a job's graded CSV. Does not touch the network.
    fn download_url(&self, job_id: &str) -> Result<Url, AppError>;
}

impl ExamApiOps for ExamApiClient {
    fn upload_file<'a>(
        &'a self,
        path: &'a Path,
        progress: Option<UnboundedSender<u8>>,
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<UploadResponse, AppError>> + Send + 'a>> {
        Box::pin(ExamApiClient::upload_file(self, path, progress, cancel))
    }

    fn get_result<'a>(
        &'a self,
        job_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<ResultRecord, AppError>> + Send + 'a>> {
        Box::pin(ExamApiClient::get_result(self, job_id))
    }

    fn download_url(&self, job_id: &str) -> Result<Url, AppError> {
        ExamApiClient::download_url(self, job_id)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ExamApiClient
// ─────────────────────────────────────────────────────────────────────────────

/// Client for the AutoExam `/api` endpoints.
#[derive(Clone)]
pub struct ExamApiClient {
    /// Shared HTTP client.
    client: Arc<Client>,
    /// Backend origin (e.g. "http://localhost:8000/"); must end with a slash.
    base_url: Url,
}

impl ExamApiClient {
    /// Creates a new client.
    ///
    /// # Arguments
    ///
    /// * `client` - Shared HTTP client
    /// * `base_url` - Backend origin; `api/...` paths are joined onto it
    pub fn new(client: Arc<Client>, base_url: Url) -> Self {
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Uploads a file to `POST /api/upload` as multipart field `file`.
    ///
    /// The file is streamed from disk. As chunks are handed to the transport,
    /// `progress` receives `floor(sent * 100 / total)`, only when it grows.
    /// An empty file reports 0 and then 100 once the backend accepts it.
    ///
    /// # Errors
    ///
    /// - `AppError::Cancelled` - `cancel` fired before the response arrived
    /// - `AppError::Network` - transport failure
    /// - `AppError::Server` - non-2xx response
    /// - `AppError::Internal` - file could not be opened
    pub async fn upload_file(
        &self,
        path: &Path,
        progress: Option<UnboundedSender<u8>>,
        cancel: &CancellationToken,
    ) -> Result<UploadResponse, AppError> {
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }

        let url = self.build_url("api/upload")?;

        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to open {}: {}", path.display(), e)))?;
        let total_bytes = file
            .metadata()
            .await
            .map_err(|e| AppError::Internal(format!("Failed to get file metadata: {}", e)))?
            .len();

        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload.csv")
            .to_string();

        let mut meter = ByteProgress::new(total_bytes, progress.clone(), cancel.clone());
        meter.start();

        let stream = ReaderStream::new(file).map(move |chunk| {
            if let Ok(bytes) = &chunk {
                meter.advance(bytes.len() as u64);
            }
            chunk
        });

        let part = Part::stream_with_length(reqwest::Body::wrap_stream(stream), total_bytes)
            .file_name(filename)
            .mime_str("text/csv")
            .map_err(|e| AppError::Internal(format!("Failed to build multipart body: {}", e)))?;
        let form = Form::new().part("file", part);

        info!("[UPLOAD] POST /api/upload ({} bytes)", total_bytes);

        let request = self.client.post(url).multipart(form).send();
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("[UPLOAD] POST /api/upload cancelled");
                return Err(AppError::Cancelled);
            }
            result = request => result
                .map_err(|e| AppError::Network(format!("Upload failed: {}", e)))?,
        };

        let status = response.status();
        info!("[UPLOAD] POST /api/upload -> {}", status.as_u16());

        if !status.is_success() {
            return Err(parse_error_response(response, status).await);
        }

        let body: UploadResponse = response
            .json()
            .await
            .map_err(|e| AppError::Internal(format!("Failed to parse upload response: {}", e)))?;

        if total_bytes == 0 && !cancel.is_cancelled() {
            if let Some(tx) = &progress {
                let _ = tx.send(100);
            }
        }

        info!("[UPLOAD] accepted as job {}", redact_id(&body.id));
        Ok(body)
    }

    /// Gets the current status (and result, once completed) of a job.
    ///
    /// A `failed` status is returned as data, not as an error; callers decide.
    ///
    /// # Errors
    ///
    /// - `AppError::Server` - non-2xx (404 while the job is not yet visible)
    /// - `AppError::Network` - transport failure
    pub async fn get_result(&self, job_id: &str) -> Result<ResultRecord, AppError> {
        let url = self.build_result_url(job_id, None)?;

        debug!("[RESULTS] GET /api/results/{}", redact_id(job_id));

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AppError::Network(format!("Status check failed: {}", e)))?;

        let status = response.status();
        info!(
            "[RESULTS] GET /api/results/{} -> {}",
            redact_id(job_id),
            status.as_u16()
        );

        if !status.is_success() {
            return Err(parse_error_response(response, status).await);
        }

        response
            .json()
            .await
            .map_err(|e| AppError::Internal(format!("Failed to parse result response: {}", e)))
    }

    /// Fetches `GET /api/history`.
    pub async fn get_history(&self) -> Result<HistoryResponse, AppError> {
        let url = self.build_url("api/history")?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AppError::Network(format!("History request failed: {}", e)))?;

        let status = response.status();
        info!("[HISTORY] GET /api/history -> {}", status.as_u16());

        if !status.is_success() {
            return Err(parse_error_response(response, status).await);
        }

        response
            .json()
            .await
            .map_err(|e| AppError::Internal(format!("Failed to parse history response: {}", e)))
    }

    /// Builds `{base}/api/results/{id}/download`.
    pub fn download_url(&self, job_id: &str) -> Result<Url, AppError> {
        self.build_result_url(job_id, Some("download"))
    }

    /// Streams the graded CSV to `output_path`.
    ///
    /// Writes to a temp file beside the destination and renames it on success,
    /// so a partial download never replaces an existing file.
    ///
    /// # Returns
    ///
    /// Number of bytes written.
    pub async fn download_result(
        &self,
        job_id: &str,
        output_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64, AppError> {
        let url = self.download_url(job_id)?;

        info!("[DOWNLOAD] GET /api/results/{}/download", redact_id(job_id));

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AppError::Cancelled),
            result = self.client.get(url).send() => result
                .map_err(|e| AppError::Network(format!("Download failed: {}", e)))?,
        };

        let status = response.status();
        info!(
            "[DOWNLOAD] GET /api/results/{}/download -> {}",
            redact_id(job_id),
            status.as_u16()
        );

        if !status.is_success() {
            return Err(parse_error_response(response, status).await);
        }

        let mut target = AtomicDownload::create(output_path).await?;
        let mut stream = response.bytes_stream();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AppError::Cancelled),
                next = stream.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk
                .map_err(|e| AppError::Network(format!("Error reading download stream: {}", e)))?;
            target.write_chunk(&chunk).await?;
        }

        let written = target.bytes_written();
        target.finish().await?;

        info!(
            "[DOWNLOAD] job {} saved ({} bytes)",
            redact_id(job_id),
            written
        );
        Ok(written)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // URL Builders
    // ─────────────────────────────────────────────────────────────────────────

    fn build_url(&self, path: &str) -> Result<Url, AppError> {
        self.base_url
            .join(path)
            .map_err(|e| AppError::Internal(format!("Failed to build URL for {}: {}", path, e)))
    }

    /// Builds `api/results/{id}[/{suffix}]`, percent-encoding the id as one segment.
    fn build_result_url(&self, job_id: &str, suffix: Option<&str>) -> Result<Url, AppError> {
        let mut url = self.build_url("api/results/")?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| AppError::Internal("Base URL cannot hold a path".to_string()))?;
            segments.pop_if_empty().push(job_id);
            if let Some(suffix) = suffix {
                segments.push(suffix);
            }
        }
        Ok(url)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Upload Progress
// ─────────────────────────────────────────────────────────────────────────────

/// Turns bytes handed to the transport into non-decreasing whole percentages.
struct ByteProgress {
    total: u64,
    sent: u64,
    last: Option<u8>,
    tx: Option<UnboundedSender<u8>>,
    cancel: CancellationToken,
}

impl ByteProgress {
    fn new(total: u64, tx: Option<UnboundedSender<u8>>, cancel: CancellationToken) -> Self {
        Self {
            total,
            sent: 0,
            last: None,
            tx,
            cancel,
        }
    }

    fn start(&mut self) {
        self.emit(0);
    }

    fn advance(&mut self, bytes: u64) {
        self.sent = self.sent.saturating_add(bytes);
        if self.total > 0 {
            let pct = (self.sent.saturating_mul(100) / self.total).min(100) as u8;
            self.emit(pct);
        }
    }

    fn emit(&mut self, pct: u8) {
        if self.cancel.is_cancelled() {
            return;
        }
        if self.last.is_some_and(|last| pct <= last) {
            return;
        }
        self.last = Some(pct);
        if let Some(tx) = &self.tx {
            let _ = tx.send(pct);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Error Handling
// ─────────────────────────────────────────────────────────────────────────────

/// Maps a non-2xx response to `AppError::Server`, preferring FastAPI's `detail`.
async fn parse_error_response(response: reqwest::Response, status: StatusCode) -> AppError {
    let body = response.text().await.unwrap_or_default();

    let detail = serde_json::from_str::<ErrorBody>(&body)
        .ok()
        .and_then(|b| match b.detail {
            serde_json::Value::String(s) => Some(s),
            serde_json::Value::Array(items) => {
                let msgs: Vec<String> = items
                    .iter()
                    .filter_map(|i| i.get("msg").and_then(|m| m.as_str()).map(String::from))
                    .collect();
                (!msgs.is_empty()).then(|| msgs.join("; "))
            }
            _ => None,
        });

    let message = detail.unwrap_or_else(|| {
        format!(
            "HTTP {} - {}",
            status.as_u16(),
            status.canonical_reason().unwrap_or("Unknown error")
        )
    });

    AppError::Server {
        status: status.as_u16(),
        message,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
