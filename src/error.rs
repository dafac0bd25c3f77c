use serde::Serialize;
use thiserror::Error;

/// Patterns (lowercase) that indicate backend text not safe for display.
/// Used by `contains_sensitive()` for case-insensitive matching.
pub(crate) const SENSITIVE_PATTERNS: &[&str] = &[
    "traceback (most recent call last)",
    "bearer ",
    "authorization:",
    "access_token",
    "password",
];

/// Returns true if the message contains any sensitive pattern (case-insensitive).
fn contains_sensitive(msg: &str) -> bool {
    let lower = msg.to_ascii_lowercase();
    SENSITIVE_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Sanitizes a message for display.
/// If sensitive content is detected, returns the fallback instead.
fn sanitize_message(msg: &str, fallback: &str) -> String {
    if contains_sensitive(msg) || msg.trim().is_empty() {
        fallback.into()
    } else {
        msg.to_string()
    }
}

/// User-facing error presentation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorPresentation {
    pub title: String,
    pub message: String,
    pub action: Option<String>,
}

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum AppError {
    // ── Transport ─────────────────────────────────────────────────────────────
    #[error("Network error: {0}")]
    Network(String),

    #[error("Server responded with HTTP {status}: {message}")]
    Server { status: u16, message: String },

    // ── Jobs ──────────────────────────────────────────────────────────────────
    #[error("Processing of job {job_id} failed: {message}")]
    ProcessingFailed { job_id: String, message: String },

    #[error("Job {job_id} did not finish after {attempts} status checks")]
    PollTimeout { job_id: String, attempts: u32 },

    #[error("A poll for job {job_id} is already running")]
    DuplicatePoll { job_id: String },

    #[error("Result for job {job_id} is not ready (status: {status})")]
    NotReady { job_id: String, status: String },

    #[error("Operation cancelled")]
    Cancelled,

    // ── File ──────────────────────────────────────────────────────────────────
    #[error("Invalid file: {0}")]
    InvalidFile(String),

    // ── Generic fallback ──────────────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Returns true for HTTP 5xx responses.
    pub fn is_server_side(&self) -> bool {
        matches!(self, AppError::Server { status, .. } if *status >= 500)
    }

    /// Returns true for HTTP 404 responses.
    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::Server { status: 404, .. })
    }

    /// Converts the error into a presentation suitable for display.
    /// Never passes raw stack traces or credentials through.
    pub fn to_presentation(&self) -> ErrorPresentation {
        match self {
            AppError::Network(_) => ErrorPresentation {
                title: "Connection Failed".into(),
                message: "Could not reach the grading server. Please check your connection.".into(),
                action: Some("Check network and retry".into()),
            },

            AppError::Server { status, message } => ErrorPresentation {
                title: "Server Error".into(),
                message: sanitize_message(
                    message,
                    &format!("The grading server returned an error (HTTP {}).", status),
                ),
                action: if *status >= 500 {
                    Some("Wait a moment and retry".into())
                } else {
                    None
                },
            },

            AppError::ProcessingFailed { message, .. } => ErrorPresentation {
                title: "Processing Failed".into(),
                message: sanitize_message(message, "The server could not grade this file."),
                action: Some("Check the file contents and upload again".into()),
            },

            AppError::PollTimeout { .. } => ErrorPresentation {
                title: "Still Processing".into(),
                message: "Grading is taking longer than expected. The job is still on the server.".into(),
                action: Some("Resume checking the job later".into()),
            },

            AppError::DuplicatePoll { .. } => ErrorPresentation {
                title: "Already Checking".into(),
                message: "This job is already being checked for results.".into(),
                action: Some("Wait for the current check to finish".into()),
            },

            AppError::NotReady { status, .. } => ErrorPresentation {
                title: "Result Not Ready".into(),
                message: format!("The result cannot be downloaded yet (status: {}).", status),
                action: Some("Wait for grading to complete".into()),
            },

            AppError::Cancelled => ErrorPresentation {
                title: "Cancelled".into(),
                message: "The operation was cancelled.".into(),
                action: None,
            },

            AppError::InvalidFile(msg) => ErrorPresentation {
                title: "Invalid File".into(),
                message: msg.clone(),
                action: Some("Fix the CSV file and try again".into()),
            },

            AppError::Internal(_) => ErrorPresentation {
                title: "Unexpected Error".into(),
                message: "Something went wrong. Please try again.".into(),
                action: Some("Try again".into()),
            },
        }
    }
}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_presentation().serialize(serializer)
    }
}
