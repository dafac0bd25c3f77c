//! Overall progress for one upload-to-completion run.
//!
//! Upload progress fills 0–10%, polling fills 10–100%. The tracker never
//! reports a lower percentage than it already has.

use serde::Serialize;

use crate::api::{JobStatus, PollProgress};

/// Upper bound of the upload share of the bar.
const UPLOAD_SHARE: u8 = 10;

/// Percentage plus a label describing what is happening.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressState {
    pub percent: u8,
    pub phase: String,
}

/// Human-readable phase for a poll status.
///
/// The `processing` labels move on with the attempt count; they are a rough
/// guide, not backend stages.
pub fn phase_label(status: JobStatus, attempt: u32) -> &'static str {
    match status {
        JobStatus::Queued => "Waiting in queue",
        JobStatus::Processing if attempt < 10 => "Transcribing answers",
        JobStatus::Processing if attempt < 60 => "Grading answers",
        JobStatus::Processing => "Finalizing results",
        JobStatus::Completed => "Completed",
        JobStatus::Failed => "Failed",
    }
}

/// Monotonic progress tracker owned by the workflow.
#[derive(Debug, Default)]
pub(crate) struct ProgressTracker {
    percent: u8,
}

impl ProgressTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Starts polling an existing job; upload share counts as done.
    pub(crate) fn resumed() -> Self {
        Self {
            percent: UPLOAD_SHARE,
        }
    }

    #[cfg(test)]
    pub(crate) fn percent(&self) -> u8 {
        self.percent
    }

    /// Maps an upload percentage (0–100) onto 0–10.
    pub(crate) fn upload(&mut self, pct: u8) -> ProgressState {
        self.advance(pct.min(100) / UPLOAD_SHARE, "Uploading file")
    }

    /// Maps a poll percentage (0–100) onto 10–100.
    pub(crate) fn poll(&mut self, event: &PollProgress) -> ProgressState {
        let span = u16::from(100 - UPLOAD_SHARE);
        let mapped = u16::from(UPLOAD_SHARE) + u16::from(event.percent.min(100)) * span / 100;
        self.advance(mapped as u8, phase_label(event.status, event.attempt))
    }

    pub(crate) fn complete(&mut self) -> ProgressState {
        self.advance(100, "Completed")
    }

    /// Current percentage with a new label.
    pub(crate) fn relabel(&self, phase: &str) -> ProgressState {
        ProgressState {
            percent: self.percent,
            phase: phase.to_string(),
        }
    }

    fn advance(&mut self, percent: u8, phase: &str) -> ProgressState {
        self.percent = self.percent.max(percent);
        self.relabel(phase)
    }
}
