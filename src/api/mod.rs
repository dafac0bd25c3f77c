//! AutoExam backend HTTP layer.
//!
//! - `client`: upload, status, history and download calls against `/api`
//! - `registry`: session-scoped guard against concurrent polls of one job
//! - `poller`: status polling loop with progress mapping and cancellation
//!
//! Only method, path, status codes and shortened job ids are ever logged.

pub mod client;
pub mod poller;
pub mod registry;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use client::{
    ExamApiClient, ExamApiOps, ExamRecord, HistoryEntry, HistoryResponse, ResultRecord,
    UploadResponse,
};
pub use poller::{status_progress, PollConfig, PollProgress, ResultPoller};
pub use registry::{PollGuard, PollRegistry};

/// Processing status reported by `GET /api/results/{id}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Returns true if the job cannot transition further.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shortens a job id for logging (shows first 12 chars).
pub(crate) fn redact_id(id: &str) -> String {
    match id.char_indices().nth(12) {
        Some((idx, _)) => format!("{}...", &id[..idx]),
        None => id.to_string(),
    }
}
