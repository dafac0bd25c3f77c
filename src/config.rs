//! Client configuration.
//!
//! Values come from built-in defaults, an optional TOML file, and
//! `AUTOEXAM_*` environment variables, in that order of precedence (last wins).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::AppError;

/// Environment variable overriding `base_url`.
pub const ENV_API_URL: &str = "AUTOEXAM_API_URL";
/// Environment variable overriding `poll_interval_ms`.
pub const ENV_POLL_INTERVAL_MS: &str = "AUTOEXAM_POLL_INTERVAL_MS";
/// Environment variable overriding `max_poll_attempts`.
pub const ENV_MAX_POLL_ATTEMPTS: &str = "AUTOEXAM_MAX_POLL_ATTEMPTS";

/// Configuration for talking to the grading backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Backend origin; the `/api/...` paths are joined onto it.
    pub base_url: String,
    /// Spacing between status checks while polling.
    pub poll_interval_ms: u64,
    /// Status checks before a poll gives up (a final check follows).
    pub max_poll_attempts: u32,
    /// Per-request timeout for the shared HTTP client.
    pub request_timeout_secs: u64,
    /// Largest file accepted for upload.
    pub max_file_size_bytes: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/".to_string(),
            poll_interval_ms: 1000,
            max_poll_attempts: 600, // ~10 minutes at the default interval
            request_timeout_secs: 300,
            max_file_size_bytes: 50 * 1024 * 1024,
        }
    }
}

impl ClientConfig {
    /// Loads a config from a TOML file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, AppError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            AppError::Internal(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        toml::from_str(&text)
            .map_err(|e| AppError::Internal(format!("Invalid config {}: {}", path.display(), e)))
    }

    /// Applies `AUTOEXAM_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> Result<Self, AppError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary lookup (the environment in production).
    fn with_overrides<F>(mut self, lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_API_URL) {
            self.base_url = url;
        }
        if let Some(raw) = lookup(ENV_POLL_INTERVAL_MS) {
            self.poll_interval_ms = raw.trim().parse().map_err(|_| {
                AppError::Internal(format!("{} must be an integer, got {:?}", ENV_POLL_INTERVAL_MS, raw))
            })?;
        }
        if let Some(raw) = lookup(ENV_MAX_POLL_ATTEMPTS) {
            self.max_poll_attempts = raw.trim().parse().map_err(|_| {
                AppError::Internal(format!("{} must be an integer, got {:?}", ENV_MAX_POLL_ATTEMPTS, raw))
            })?;
        }
        Ok(self)
    }

    /// Parses `base_url`, making sure it ends with a slash so joins keep any path prefix.
    pub fn base_url(&self) -> Result<Url, AppError> {
        let mut raw = self.base_url.trim().to_string();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        Url::parse(&raw)
            .map_err(|e| AppError::Internal(format!("Invalid base URL {:?}: {}", self.base_url, e)))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
