//! Result poller.
//!
//! Queries `GET /api/results/{id}` at a fixed interval until the job is
//! completed, failed, or the attempt budget runs out. Each status is turned
//! into a coarse percentage for display.
//!
//! The `processing` percentage is a client-side estimate that creeps with
//! the attempt count; the backend does not report a real fraction.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::client::{ExamApiOps, ResultRecord};
use crate::api::registry::PollRegistry;
use crate::api::{redact_id, JobStatus};
use crate::config::ClientConfig;
use crate::error::AppError;

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Consecutive non-transient errors tolerated before the poll gives up.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 10;

const QUEUED_PERCENT: u8 = 5;
const PROCESSING_BASE_PERCENT: u8 = 20;
const PROCESSING_MAX_CREEP: u32 = 70;

// ─────────────────────────────────────────────────────────────────────────────
// Public Types
// ─────────────────────────────────────────────────────────────────────────────

/// Polling parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollConfig {
    /// Wait between status checks (doubled after a 5xx).
    pub interval: Duration,
    /// Status checks before giving up; one final check follows.
    pub max_attempts: u32,
    /// Non-transient errors in a row that are retried before propagating.
    pub max_consecutive_errors: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_attempts: 600,
            max_consecutive_errors: MAX_CONSECUTIVE_ERRORS,
        }
    }
}

impl From<&ClientConfig> for PollConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            interval: config.poll_interval(),
            max_attempts: config.max_poll_attempts,
            max_consecutive_errors: MAX_CONSECUTIVE_ERRORS,
        }
    }
}

/// Progress event emitted after each successful status check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollProgress {
    /// Poll-local percentage, 0–100, non-decreasing within one poll.
    pub percent: u8,
    pub status: JobStatus,
    /// 1-based number of the status check that produced this event.
    pub attempt: u32,
}

/// Maps a status to a percentage. `attempts` counts status checks so far.
///
/// `queued` → 5, `processing` → `20 + min(70, attempts / 10)`, `completed` → 100.
/// `failed` has no percentage.
pub fn status_progress(status: JobStatus, attempts: u32) -> Option<u8> {
    match status {
        JobStatus::Queued => Some(QUEUED_PERCENT),
        JobStatus::Processing => {
            let creep = (attempts / 10).min(PROCESSING_MAX_CREEP) as u8;
            Some(PROCESSING_BASE_PERCENT + creep)
        }
        JobStatus::Completed => Some(100),
        JobStatus::Failed => None,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ResultPoller
// ─────────────────────────────────────────────────────────────────────────────

/// Polls one job at a time per id, guarded by the session's `PollRegistry`.
pub struct ResultPoller<C: ExamApiOps> {
    client: Arc<C>,
    registry: PollRegistry,
    config: PollConfig,
}

impl<C: ExamApiOps> ResultPoller<C> {
    pub fn new(client: Arc<C>, registry: PollRegistry, config: PollConfig) -> Self {
        Self {
            client,
            registry,
            config,
        }
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Polls `job_id` until it completes.
    ///
    /// Cancellation is checked before every request and every wait; a pending
    /// wait is abandoned as soon as `cancel` fires. No progress is sent after
    /// cancellation has been observed.
    ///
    /// # Errors
    ///
    /// - `AppError::DuplicatePoll` - another poll holds this id (no request made)
    /// - `AppError::ProcessingFailed` - backend reported `failed`
    /// - `AppError::PollTimeout` - attempts exhausted and the final check was not `completed`
    /// - `AppError::Cancelled` - `cancel` fired
    /// - any other error after `max_consecutive_errors` retries in a row
    pub async fn poll(
        &self,
        job_id: &str,
        progress: Option<UnboundedSender<PollProgress>>,
        cancel: &CancellationToken,
    ) -> Result<ResultRecord, AppError> {
        let _guard = self
            .registry
            .try_acquire(job_id)
            .ok_or_else(|| AppError::DuplicatePoll {
                job_id: job_id.to_string(),
            })?;

        info!(
            "[POLL] job {} (every {:?}, max {} checks)",
            redact_id(job_id),
            self.config.interval,
            self.config.max_attempts
        );

        let mut emitter = ProgressEmitter::new(progress, cancel.clone());
        let mut attempts = 0u32;
        let mut consecutive_errors = 0u32;

        while attempts < self.config.max_attempts {
            if cancel.is_cancelled() {
                return Err(self.cancelled(job_id, attempts));
            }
            attempts += 1;

            let wait = match self.fetch(job_id, cancel).await {
                Ok(record) => {
                    consecutive_errors = 0;
                    if record.is_ready() {
                        emitter.emit(JobStatus::Completed, 100, attempts);
                        info!(
                            "[POLL] job {} completed after {} checks",
                            redact_id(job_id),
                            attempts
                        );
                        return Ok(record);
                    }
                    if record.status == JobStatus::Failed {
                        return Err(processing_failed(job_id));
                    }

                    // Completed without a summary is still settling.
                    let shown = match record.status {
                        JobStatus::Completed => JobStatus::Processing,
                        other => other,
                    };
                    if let Some(percent) = status_progress(shown, attempts) {
                        emitter.emit(shown, percent, attempts);
                    }
                    self.config.interval
                }
                Err(AppError::Cancelled) => return Err(self.cancelled(job_id, attempts)),
                Err(e) if e.is_server_side() => {
                    warn!(
                        "[POLL] job {} check {} hit a server error, backing off: {}",
                        redact_id(job_id),
                        attempts,
                        e
                    );
                    self.config.interval * 2
                }
                Err(e) if e.is_not_found() => {
                    debug!("[POLL] job {} not visible yet", redact_id(job_id));
                    self.config.interval
                }
                Err(e) => {
                    consecutive_errors += 1;
                    if consecutive_errors > self.config.max_consecutive_errors {
                        warn!(
                            "[POLL] job {} giving up after {} consecutive errors",
                            redact_id(job_id),
                            consecutive_errors
                        );
                        return Err(e);
                    }
                    warn!(
                        "[POLL] job {} check {} failed ({}/{}): {}",
                        redact_id(job_id),
                        attempts,
                        consecutive_errors,
                        self.config.max_consecutive_errors,
                        e
                    );
                    self.config.interval
                }
            };

            if cancel.is_cancelled() {
                return Err(self.cancelled(job_id, attempts));
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(self.cancelled(job_id, attempts)),
                _ = tokio::time::sleep(wait) => {}
            }
        }

        // Budget spent: one last look before reporting a timeout.
        if cancel.is_cancelled() {
            return Err(self.cancelled(job_id, attempts));
        }
        match self.fetch(job_id, cancel).await {
            Ok(record) if record.is_ready() => {
                emitter.emit(JobStatus::Completed, 100, attempts + 1);
                info!(
                    "[POLL] job {} completed on the final check",
                    redact_id(job_id)
                );
                Ok(record)
            }
            Ok(record) if record.status == JobStatus::Failed => Err(processing_failed(job_id)),
            Err(AppError::Cancelled) => Err(self.cancelled(job_id, attempts)),
            _ => {
                warn!(
                    "[POLL] job {} timed out after {} checks",
                    redact_id(job_id),
                    attempts
                );
                Err(AppError::PollTimeout {
                    job_id: job_id.to_string(),
                    attempts,
                })
            }
        }
    }

    /// One status request, abandoned if `cancel` fires first.
    async fn fetch(
        &self,
        job_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ResultRecord, AppError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AppError::Cancelled),
            result = self.client.get_result(job_id) => result,
        }
    }

    fn cancelled(&self, job_id: &str, attempts: u32) -> AppError {
        info!(
            "[POLL] job {} cancelled after {} checks",
            redact_id(job_id),
            attempts
        );
        AppError::Cancelled
    }
}

fn processing_failed(job_id: &str) -> AppError {
    warn!("[POLL] job {} reported failed", redact_id(job_id));
    AppError::ProcessingFailed {
        job_id: job_id.to_string(),
        message: "The server reported that processing failed.".to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Progress emission
// ─────────────────────────────────────────────────────────────────────────────

/// Sends clamped, non-decreasing progress until cancellation is observed.
struct ProgressEmitter {
    tx: Option<UnboundedSender<PollProgress>>,
    cancel: CancellationToken,
    last: u8,
}

impl ProgressEmitter {
    fn new(tx: Option<UnboundedSender<PollProgress>>, cancel: CancellationToken) -> Self {
        Self { tx, cancel, last: 0 }
    }

    fn emit(&mut self, status: JobStatus, percent: u8, attempt: u32) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.last = self.last.max(percent.min(100));
        if let Some(tx) = &self.tx {
            let _ = tx.send(PollProgress {
                percent: self.last,
                status,
                attempt,
            });
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeExamApi, Step};
    use tokio::sync::mpsc;

    fn poller(api: &Arc<FakeExamApi>, registry: &PollRegistry, max_attempts: u32) -> ResultPoller<FakeExamApi> {
        ResultPoller::new(
            api.clone(),
            registry.clone(),
            PollConfig {
                interval: Duration::from_millis(100),
                max_attempts,
                max_consecutive_errors: MAX_CONSECUTIVE_ERRORS,
            },
        )
    }

    fn drain(mut rx: mpsc::UnboundedReceiver<PollProgress>) -> Vec<PollProgress> {
        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        events
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Progress mapping
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn test_status_progress_mapping() {
        assert_eq!(status_progress(JobStatus::Queued, 1), Some(5));
        assert_eq!(status_progress(JobStatus::Processing, 0), Some(20));
        assert_eq!(status_progress(JobStatus::Processing, 9), Some(20));
        assert_eq!(status_progress(JobStatus::Processing, 10), Some(21));
        assert_eq!(status_progress(JobStatus::Processing, 355), Some(55));
        assert_eq!(status_progress(JobStatus::Processing, 700), Some(90));
        assert_eq!(status_progress(JobStatus::Processing, u32::MAX), Some(90));
        assert_eq!(status_progress(JobStatus::Completed, 3), Some(100));
        assert_eq!(status_progress(JobStatus::Failed, 3), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_sequence_follows_formula() {
        let mut steps = vec![Step::Status(JobStatus::Queued)];
        steps.extend(std::iter::repeat(Step::Status(JobStatus::Processing)).take(12));
        steps.push(Step::Completed(150));
        let api = Arc::new(FakeExamApi::with_steps(steps));
        let registry = PollRegistry::new();

        let (tx, rx) = mpsc::unbounded_channel();
        let record = poller(&api, &registry, 100)
            .poll("result-42", Some(tx), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(record.total_records, Some(150));

        let percents: Vec<u8> = drain(rx).iter().map(|e| e.percent).collect();
        let mut expected = vec![5u8];
        expected.extend((2..=13).map(|attempt| 20 + (attempt / 10) as u8));
        expected.push(100);
        assert_eq!(percents, expected);
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(api.status_calls(), 14);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_without_summary_keeps_polling() {
        let api = Arc::new(FakeExamApi::with_steps(vec![
            Step::Status(JobStatus::Completed),
            Step::Completed(10),
        ]));
        let registry = PollRegistry::new();

        let record = poller(&api, &registry, 10)
            .poll("result-1", None, &CancellationToken::new())
            .await
            .unwrap();
        assert!(record.is_ready());
        assert_eq!(api.status_calls(), 2);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Registry interaction
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_poll_rejected_without_request() {
        let api = Arc::new(FakeExamApi::with_steps(vec![Step::Completed(1)]));
        let registry = PollRegistry::new();
        let _held = registry.try_acquire("result-42").unwrap();

        let result = poller(&api, &registry, 10)
            .poll("result-42", None, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(AppError::DuplicatePoll { ref job_id }) if job_id == "result-42"));
        assert_eq!(api.status_calls(), 0);
        assert!(registry.is_active("result-42"), "holder keeps its claim");
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_empty_after_success() {
        let api = Arc::new(FakeExamApi::with_steps(vec![Step::Completed(3)]));
        let registry = PollRegistry::new();
        poller(&api, &registry, 10)
            .poll("result-1", None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(registry.active_polls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_empty_after_failure() {
        let api = Arc::new(FakeExamApi::with_steps(vec![
            Step::Status(JobStatus::Processing),
            Step::Status(JobStatus::Failed),
        ]));
        let registry = PollRegistry::new();
        let result = poller(&api, &registry, 10)
            .poll("result-1", None, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(AppError::ProcessingFailed { .. })));
        assert_eq!(registry.active_polls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_empty_after_timeout() {
        let api = Arc::new(FakeExamApi::with_steps(vec![Step::Status(JobStatus::Processing)]));
        let registry = PollRegistry::new();
        let result = poller(&api, &registry, 3)
            .poll("result-1", None, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(AppError::PollTimeout { attempts: 3, .. })));
        assert_eq!(registry.active_polls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_empty_after_cancellation() {
        let cancel = CancellationToken::new();
        let api = Arc::new(
            FakeExamApi::with_steps(vec![Step::Status(JobStatus::Processing)])
                .cancel_on_status_call(2, cancel.clone()),
        );
        let registry = PollRegistry::new();
        let result = poller(&api, &registry, 50).poll("result-1", None, &cancel).await;
        assert!(matches!(result, Err(AppError::Cancelled)));
        assert_eq!(registry.active_polls(), 0);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Terminal outcomes
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_final_check_rescues_timeout() {
        let api = Arc::new(FakeExamApi::with_steps(vec![
            Step::Status(JobStatus::Processing),
            Step::Status(JobStatus::Processing),
            Step::Status(JobStatus::Processing),
            Step::Completed(7),
        ]));
        let registry = PollRegistry::new();

        let (tx, rx) = mpsc::unbounded_channel();
        let record = poller(&api, &registry, 3)
            .poll("result-1", Some(tx), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(record.total_records, Some(7));
        assert_eq!(api.status_calls(), 4);
        assert_eq!(drain(rx).last().map(|e| e.percent), Some(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_after_final_check() {
        let api = Arc::new(FakeExamApi::with_steps(vec![Step::Status(JobStatus::Queued)]));
        let registry = PollRegistry::new();

        let result = poller(&api, &registry, 4)
            .poll("result-1", None, &CancellationToken::new())
            .await;

        match result {
            Err(AppError::PollTimeout { job_id, attempts }) => {
                assert_eq!(job_id, "result-1");
                assert_eq!(attempts, 4);
            }
            other => panic!("Expected PollTimeout, got {:?}", other),
        }
        assert_eq!(api.status_calls(), 5, "max_attempts checks plus the final one");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_status_is_processing_failed() {
        let api = Arc::new(FakeExamApi::with_steps(vec![Step::Status(JobStatus::Failed)]));
        let registry = PollRegistry::new();

        let result = poller(&api, &registry, 10)
            .poll("result-9", None, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(AppError::ProcessingFailed { ref job_id, .. }) if job_id == "result-9"));
        assert_eq!(api.status_calls(), 1);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Transient errors
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_server_error_doubles_wait() {
        let api = Arc::new(FakeExamApi::with_steps(vec![
            Step::HttpError(503),
            Step::Completed(1),
        ]));
        let registry = PollRegistry::new();

        let started = tokio::time::Instant::now();
        poller(&api, &registry, 10)
            .poll("result-1", None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(started.elapsed(), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_waits_normal_interval() {
        let api = Arc::new(FakeExamApi::with_steps(vec![
            Step::HttpError(404),
            Step::HttpError(404),
            Step::Completed(1),
        ]));
        let registry = PollRegistry::new();

        let started = tokio::time::Instant::now();
        poller(&api, &registry, 10)
            .poll("result-1", None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(started.elapsed(), Duration::from_millis(200));
        assert_eq!(api.status_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_do_not_exhaust_retry_budget() {
        let mut steps: Vec<Step> = std::iter::repeat(Step::HttpError(500)).take(15).collect();
        steps.push(Step::Completed(2));
        let api = Arc::new(FakeExamApi::with_steps(steps));
        let registry = PollRegistry::new();

        let record = poller(&api, &registry, 100)
            .poll("result-1", None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(record.total_records, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_errors_retried_ten_times_then_propagated() {
        let api = Arc::new(FakeExamApi::with_steps(vec![Step::Network]));
        let registry = PollRegistry::new();

        let result = poller(&api, &registry, 100)
            .poll("result-1", None, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(AppError::Network(_))));
        assert_eq!(api.status_calls(), MAX_CONSECUTIVE_ERRORS + 1);
        assert_eq!(registry.active_polls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_error_count() {
        let mut steps: Vec<Step> = std::iter::repeat(Step::Network).take(8).collect();
        steps.push(Step::Status(JobStatus::Processing));
        steps.extend(std::iter::repeat(Step::Network).take(8));
        steps.push(Step::Completed(4));
        let api = Arc::new(FakeExamApi::with_steps(steps));
        let registry = PollRegistry::new();

        let record = poller(&api, &registry, 100)
            .poll("result-1", None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(record.total_records, Some(4));
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Cancellation
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_cancel_between_attempts_stops_progress() {
        let cancel = CancellationToken::new();
        let api = Arc::new(
            FakeExamApi::with_steps(vec![Step::Status(JobStatus::Processing)])
                .cancel_on_status_call(3, cancel.clone()),
        );
        let registry = PollRegistry::new();

        let (tx, rx) = mpsc::unbounded_channel();
        let result = poller(&api, &registry, 50).poll("result-1", Some(tx), &cancel).await;

        assert!(matches!(result, Err(AppError::Cancelled)));
        assert_eq!(api.status_calls(), 3);
        let events = drain(rx);
        assert_eq!(events.len(), 2, "the check that observed cancellation emits nothing");
        assert!(events.iter().all(|e| e.attempt <= 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_wait_returns_promptly() {
        let api = Arc::new(FakeExamApi::with_steps(vec![Step::Status(JobStatus::Processing)]));
        let registry = PollRegistry::new();
        let cancel = CancellationToken::new();
        let poller = ResultPoller::new(
            api.clone(),
            registry.clone(),
            PollConfig {
                interval: Duration::from_secs(3600),
                max_attempts: 5,
                max_consecutive_errors: MAX_CONSECUTIVE_ERRORS,
            },
        );

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let started = tokio::time::Instant::now();
        let result = poller.poll("result-1", None, &cancel).await;
        assert!(matches!(result, Err(AppError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(api.status_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_cancelled_makes_no_request() {
        let api = Arc::new(FakeExamApi::with_steps(vec![Step::Completed(1)]));
        let registry = PollRegistry::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = poller(&api, &registry, 10).poll("result-1", None, &cancel).await;
        assert!(matches!(result, Err(AppError::Cancelled)));
        assert_eq!(api.status_calls(), 0);
    }
}
