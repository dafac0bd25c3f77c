//! Client for the AutoExam grading backend.
//!
//! Validates an exam CSV, uploads it, polls the grading job until it settles
//! and fetches the graded file. `workflow::UploadWorkflow` ties the steps
//! together; `state::Session` wires it to a real HTTP client.

pub mod api;
pub mod config;
pub mod error;
pub mod state;
pub mod streaming;
pub mod validation;
pub mod workflow;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::ClientConfig;
pub use error::{AppError, ErrorPresentation};
pub use state::Session;
pub use workflow::{UploadJob, UploadWorkflow, WorkflowEvent, WorkflowState};
