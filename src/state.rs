//! Session state shared by every operation of one application session.
//!
//! Holds the HTTP client, the resolved configuration and the poll registry.

use std::sync::Arc;

use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};

use crate::api::{ExamApiClient, PollRegistry};
use crate::config::ClientConfig;
use crate::error::AppError;
use crate::workflow::UploadWorkflow;

/// User agent string for all backend requests.
const CLIENT_USER_AGENT: &str = concat!("autoexam/", env!("CARGO_PKG_VERSION"));

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

/// One application session.
///
/// Cloning shares the HTTP connection pool and the poll registry.
#[derive(Clone)]
pub struct Session {
    http: Arc<reqwest::Client>,
    config: ClientConfig,
    registry: PollRegistry,
}

impl Session {
    /// Creates a session from a resolved configuration.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Internal` if the base URL is invalid or the HTTP
    /// client cannot be built.
    pub fn new(config: ClientConfig) -> Result<Self, AppError> {
        config.base_url()?;
        let http = build_http_client(&config)?;
        Ok(Self {
            http: Arc::new(http),
            config,
            registry: PollRegistry::new(),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn registry(&self) -> &PollRegistry {
        &self.registry
    }

    /// Client for the backend endpoints, sharing the session's connection pool.
    pub fn api_client(&self) -> Result<ExamApiClient, AppError> {
        Ok(ExamApiClient::new(self.http.clone(), self.config.base_url()?))
    }

    /// Workflow bound to this session's registry.
    pub fn workflow(&self) -> Result<UploadWorkflow<ExamApiClient>, AppError> {
        Ok(UploadWorkflow::new(
            Arc::new(self.api_client()?),
            self.registry.clone(),
            &self.config,
        ))
    }
}

fn build_http_client(config: &ClientConfig) -> Result<reqwest::Client, AppError> {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(CLIENT_USER_AGENT));

    reqwest::Client::builder()
        .default_headers(headers)
        .timeout(config.request_timeout())
        .build()
        .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {}", e)))
}
