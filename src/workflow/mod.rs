//! Upload workflow orchestration.
//!
//! Drives one CSV through validation, upload and polling, and exposes the
//! download of the graded file afterwards:
//!
//! `Idle → Uploading (0–10%) → Polling (10–100%) → Completed | Failed`,
//! with `Cancelled` reachable from `Uploading` and `Polling`.
//!
//! Starting a new run cancels the previous one and waits for it to settle
//! before touching the backend. A failed poll gets one reconciliation check
//! before the run is reported as failed.

pub mod progress;

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use url::Url;
use uuid::Uuid;

use crate::api::{
    redact_id, ExamApiClient, ExamApiOps, JobStatus, PollConfig, PollRegistry, ResultPoller,
    ResultRecord,
};
use crate::config::ClientConfig;
use crate::error::{AppError, ErrorPresentation};
use crate::validation::{validate, CsvValidationResult};

pub use progress::{phase_label, ProgressState};
use progress::ProgressTracker;

// ─────────────────────────────────────────────────────────────────────────────
// Public Types
// ─────────────────────────────────────────────────────────────────────────────

/// A grading job known to the workflow.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadJob {
    /// Backend-assigned identifier.
    pub id: String,
    pub filename: Option<String>,
    pub status: JobStatus,
    /// Summary and records, once completed.
    pub result: Option<ResultRecord>,
}

/// Where the workflow currently is.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum WorkflowState {
    Idle,
    Uploading,
    Polling {
        job_id: String,
    },
    Completed {
        job: UploadJob,
    },
    /// Keeps the job id, when one was obtained, so polling can be resumed.
    Failed {
        job_id: Option<String>,
        error: ErrorPresentation,
    },
    Cancelled {
        job_id: Option<String>,
    },
}

impl WorkflowState {
    /// Job id carried by this state, if any.
    pub fn job_id(&self) -> Option<&str> {
        match self {
            WorkflowState::Polling { job_id } => Some(job_id),
            WorkflowState::Completed { job } => Some(&job.id),
            WorkflowState::Failed { job_id, .. } | WorkflowState::Cancelled { job_id } => {
                job_id.as_deref()
            }
            WorkflowState::Idle | WorkflowState::Uploading => None,
        }
    }
}

/// Event stream for a front end.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// Pre-upload validation passed; carries warnings and a preview.
    Validated { report: CsvValidationReport },
    Progress(ProgressState),
    State(WorkflowState),
}

/// Validation summary forwarded to the front end.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CsvValidationReport {
    pub headers: Vec<String>,
    pub preview: Vec<Vec<String>>,
    pub warnings: Vec<String>,
}

impl From<&CsvValidationResult> for CsvValidationReport {
    fn from(result: &CsvValidationResult) -> Self {
        Self {
            headers: result.stats.headers.clone(),
            preview: result.stats.preview.clone(),
            warnings: result.warnings.iter().map(ToString::to_string).collect(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// UploadWorkflow
// ─────────────────────────────────────────────────────────────────────────────

/// Upload → poll → download controller.
///
/// The only layer that recovers from errors and turns them into
/// user-facing presentations.
pub struct UploadWorkflow<C: ExamApiOps> {
    client: Arc<C>,
    poller: ResultPoller<C>,
    max_file_size_bytes: u64,
    events: Option<UnboundedSender<WorkflowEvent>>,
    state: Mutex<WorkflowState>,
    /// Id and token of the newest run; only that run may write `state`.
    current: Mutex<Option<(u64, CancellationToken)>>,
    next_run: AtomicU64,
    /// Held for the whole of a run, so runs never overlap.
    run_slot: tokio::sync::Mutex<()>,
}

/// A run that owns the run slot.
struct ActiveRun<'a> {
    id: u64,
    cancel: CancellationToken,
    _slot: tokio::sync::MutexGuard<'a, ()>,
}

impl<C: ExamApiOps> UploadWorkflow<C> {
    /// Creates a workflow.
    ///
    /// # Arguments
    ///
    /// * `client` - Backend operations
    /// * `registry` - Session poll registry
    /// * `config` - Poll and file-size settings
    pub fn new(client: Arc<C>, registry: PollRegistry, config: &ClientConfig) -> Self {
        let poller = ResultPoller::new(client.clone(), registry, PollConfig::from(config));
        Self {
            client,
            poller,
            max_file_size_bytes: config.max_file_size_bytes,
            events: None,
            state: Mutex::new(WorkflowState::Idle),
            current: Mutex::new(None),
            next_run: AtomicU64::new(0),
            run_slot: tokio::sync::Mutex::new(()),
        }
    }

    /// Sends state and progress events to `tx`.
    pub fn with_events(mut self, tx: UnboundedSender<WorkflowEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn state(&self) -> WorkflowState {
        lock(&self.state).clone()
    }

    /// Cancels the run in progress, if any.
    pub fn cancel(&self) {
        if let Some((_, token)) = lock(&self.current).as_ref() {
            if !token.is_cancelled() {
                info!("[WORKFLOW] cancellation requested");
                token.cancel();
            }
        }
    }

    /// Validates, uploads and polls `path` until the job settles.
    ///
    /// # Errors
    ///
    /// - `AppError::InvalidFile` - rejected before upload
    /// - `AppError::Cancelled` - `cancel()` or a newer run interrupted this one
    /// - any upload or poll error that reconciliation could not recover
    pub async fn run(&self, path: &Path) -> Result<UploadJob, AppError> {
        let run_id = Uuid::new_v4().to_string();
        let span = info_span!("upload", run = %&run_id[..8]);

        async {
            let run = self.begin_run(None).await?;
            let cancel = &run.cancel;
            let filename = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(String::from);

            let report = match validate(path, self.max_file_size_bytes)
                .await
                .and_then(CsvValidationResult::into_result)
            {
                Ok(report) => report,
                Err(_) if cancel.is_cancelled() => return Err(self.cancelled(run.id, None)),
                Err(e) => return Err(self.fail(None, e, cancel)),
            };
            self.emit(
                WorkflowEvent::Validated {
                    report: CsvValidationReport::from(&report),
                },
                cancel,
            );

            if cancel.is_cancelled() {
                return Err(self.cancelled(run.id, None));
            }

            let mut tracker = ProgressTracker::new();
            self.set_state(WorkflowState::Uploading, cancel);
            self.emit_progress(tracker.upload(0), cancel);

            let uploaded = match self.upload(path, &mut tracker, cancel).await {
                Ok(response) => response,
                Err(AppError::Cancelled) => return Err(self.cancelled(run.id, None)),
                Err(e) => return Err(self.fail(None, e, cancel)),
            };

            info!(
                "[WORKFLOW] uploaded {} as job {}",
                filename.as_deref().unwrap_or("file"),
                redact_id(&uploaded.id)
            );

            self.poll_job(&uploaded.id, &mut tracker, &run).await
        }
        .instrument(span)
        .await
    }

    /// Polls a job uploaded earlier, e.g. after a timeout.
    pub async fn resume(&self, job_id: &str) -> Result<UploadJob, AppError> {
        let span = info_span!("resume", job = %redact_id(job_id));

        async {
            let run = self.begin_run(Some(job_id)).await?;
            let mut tracker = ProgressTracker::resumed();
            self.poll_job(job_id, &mut tracker, &run).await
        }
        .instrument(span)
        .await
    }

    /// Re-checks the job and builds its download URL.
    ///
    /// # Errors
    ///
    /// - `AppError::NotReady` - the job is not completed
    pub async fn download_link(&self, job_id: &str) -> Result<Url, AppError> {
        let record = self.client.get_result(job_id).await?;
        if !record.is_ready() {
            return Err(AppError::NotReady {
                job_id: job_id.to_string(),
                status: record.status.to_string(),
            });
        }
        self.client.download_url(job_id)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Steps
    // ─────────────────────────────────────────────────────────────────────────

    async fn upload(
        &self,
        path: &Path,
        tracker: &mut ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<crate::api::UploadResponse, AppError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<u8>();
        let upload = self.client.upload_file(path, Some(tx), cancel);
        tokio::pin!(upload);

        let result = loop {
            tokio::select! {
                result = &mut upload => break result,
                Some(pct) = rx.recv() => self.emit_progress(tracker.upload(pct), cancel),
            }
        };
        while let Ok(pct) = rx.try_recv() {
            self.emit_progress(tracker.upload(pct), cancel);
        }
        result
    }

    async fn poll_job(
        &self,
        job_id: &str,
        tracker: &mut ProgressTracker,
        run: &ActiveRun<'_>,
    ) -> Result<UploadJob, AppError> {
        let cancel = &run.cancel;
        self.set_state(
            WorkflowState::Polling {
                job_id: job_id.to_string(),
            },
            cancel,
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let poll = self.poller.poll(job_id, Some(tx), cancel);
        tokio::pin!(poll);

        let result = loop {
            tokio::select! {
                result = &mut poll => break result,
                Some(event) = rx.recv() => self.emit_progress(tracker.poll(&event), cancel),
            }
        };
        while let Ok(event) = rx.try_recv() {
            self.emit_progress(tracker.poll(&event), cancel);
        }

        match result {
            Ok(record) => Ok(self.complete(record, tracker, cancel)),
            Err(AppError::Cancelled) => Err(self.cancelled(run.id, Some(job_id))),
            Err(e @ AppError::DuplicatePoll { .. }) => Err(self.fail(Some(job_id), e, cancel)),
            Err(e) => match self.reconcile(job_id, cancel).await {
                Some(record) => Ok(self.complete(record, tracker, cancel)),
                None if cancel.is_cancelled() => Err(self.cancelled(run.id, Some(job_id))),
                None => Err(self.fail(Some(job_id), e, cancel)),
            },
        }
    }

    /// One more status check after a failed poll.
    async fn reconcile(&self, job_id: &str, cancel: &CancellationToken) -> Option<ResultRecord> {
        if cancel.is_cancelled() {
            return None;
        }
        let checked = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            result = self.client.get_result(job_id) => result,
        };
        match checked {
            Ok(record) if record.is_ready() => {
                info!(
                    "[WORKFLOW] job {} turned out completed on reconciliation",
                    redact_id(job_id)
                );
                Some(record)
            }
            Ok(record) => {
                info!(
                    "[WORKFLOW] job {} still {} on reconciliation",
                    redact_id(job_id),
                    record.status
                );
                None
            }
            Err(e) => {
                warn!(
                    "[WORKFLOW] reconciliation for job {} failed: {}",
                    redact_id(job_id),
                    e
                );
                None
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Transitions
    // ─────────────────────────────────────────────────────────────────────────

    /// Cancels the previous run, resets the state to `Idle` and waits for
    /// the previous run to release the run slot.
    ///
    /// # Errors
    ///
    /// - `AppError::Cancelled` - this run was cancelled while waiting
    async fn begin_run(&self, job_id: Option<&str>) -> Result<ActiveRun<'_>, AppError> {
        let id = self.next_run.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        if let Some((_, previous)) = lock(&self.current).replace((id, cancel.clone())) {
            if !previous.is_cancelled() {
                info!("[WORKFLOW] cancelling previous run");
                previous.cancel();
            }
        }
        self.set_state(WorkflowState::Idle, &cancel);

        let slot = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(self.cancelled(id, job_id)),
            slot = self.run_slot.lock() => slot,
        };
        Ok(ActiveRun {
            id,
            cancel,
            _slot: slot,
        })
    }

    fn complete(
        &self,
        record: ResultRecord,
        tracker: &mut ProgressTracker,
        cancel: &CancellationToken,
    ) -> UploadJob {
        let job = UploadJob {
            id: record.id.clone(),
            filename: record.filename.clone(),
            status: record.status,
            result: Some(record),
        };
        self.emit_progress(tracker.complete(), cancel);
        self.set_state(WorkflowState::Completed { job: job.clone() }, cancel);
        job
    }

    fn fail(&self, job_id: Option<&str>, error: AppError, cancel: &CancellationToken) -> AppError {
        warn!(
            "[WORKFLOW] run failed{}: {}",
            job_id
                .map(|id| format!(" for job {}", redact_id(id)))
                .unwrap_or_default(),
            error
        );
        self.set_state(
            WorkflowState::Failed {
                job_id: job_id.map(String::from),
                error: error.to_presentation(),
            },
            cancel,
        );
        error
    }

    fn cancelled(&self, run_id: u64, job_id: Option<&str>) -> AppError {
        info!("[WORKFLOW] run cancelled");
        // A newer run owns the state once it has replaced ours. Held until the
        // write so a replacement cannot slip in between.
        let current = lock(&self.current);
        if current.as_ref().is_some_and(|(id, _)| *id != run_id) {
            return AppError::Cancelled;
        }
        let state = WorkflowState::Cancelled {
            job_id: job_id.map(String::from),
        };
        *lock(&self.state) = state.clone();
        if let Some(tx) = &self.events {
            let _ = tx.send(WorkflowEvent::State(state));
        }
        drop(current);
        AppError::Cancelled
    }

    /// Records a transition unless cancellation has been observed.
    fn set_state(&self, state: WorkflowState, cancel: &CancellationToken) {
        if cancel.is_cancelled() {
            return;
        }
        *lock(&self.state) = state.clone();
        self.emit(WorkflowEvent::State(state), cancel);
    }

    fn emit_progress(&self, progress: ProgressState, cancel: &CancellationToken) {
        self.emit(WorkflowEvent::Progress(progress), cancel);
    }

    fn emit(&self, event: WorkflowEvent, cancel: &CancellationToken) {
        if cancel.is_cancelled() {
            return;
        }
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

impl UploadWorkflow<ExamApiClient> {
    /// Re-checks the job, then streams the graded CSV to `output_path`.
    ///
    /// # Returns
    ///
    /// Number of bytes written.
    pub async fn download_to(
        &self,
        job_id: &str,
        output_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64, AppError> {
        self.download_link(job_id).await?;
        self.client.download_result(job_id, output_path, cancel).await
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
