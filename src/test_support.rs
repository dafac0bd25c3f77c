//! In-memory backend used by poller and workflow tests.

use std::collections::VecDeque;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::api::{ExamApiClient, ExamApiOps, JobStatus, ResultRecord, UploadResponse};
use crate::error::AppError;

/// One scripted answer to a status query.
#[derive(Debug, Clone)]
pub(crate) enum Step {
    /// Record with the given status and no summary.
    Status(JobStatus),
    /// Completed record with `totalRecords` set.
    Completed(u64),
    /// Non-2xx response.
    HttpError(u16),
    /// Transport failure.
    Network,
}

/// How the fake answers an upload.
#[derive(Debug, Clone)]
pub(crate) enum UploadScript {
    /// Emits 0, 50, 100 and returns the id.
    Accept(String),
    /// Fails with a server error.
    Reject(u16, String),
    /// Waits until cancelled.
    Hang,
}

pub(crate) struct FakeExamApi {
    steps: Mutex<VecDeque<Step>>,
    last: Mutex<Option<Step>>,
    upload: UploadScript,
    status_calls: AtomicU32,
    upload_calls: AtomicU32,
    cancel_on: Option<(u32, CancellationToken)>,
    urls: ExamApiClient,
}

impl FakeExamApi {
    /// Answers status queries from `steps` in order, repeating the last one.
    pub(crate) fn with_steps(steps: Vec<Step>) -> Self {
        let base = Url::parse("http://backend.test/").expect("static url");
        Self {
            steps: Mutex::new(steps.into()),
            last: Mutex::new(None),
            upload: UploadScript::Hang,
            status_calls: AtomicU32::new(0),
            upload_calls: AtomicU32::new(0),
            cancel_on: None,
            urls: ExamApiClient::new(Arc::new(reqwest::Client::new()), base),
        }
    }

    pub(crate) fn with_upload(mut self, upload: UploadScript) -> Self {
        self.upload = upload;
        self
    }

    /// Fires `token` while answering the `call`-th status query.
    pub(crate) fn cancel_on_status_call(mut self, call: u32, token: CancellationToken) -> Self {
        self.cancel_on = Some((call, token));
        self
    }

    /// Replaces the remaining script.
    pub(crate) fn set_steps(&self, steps: Vec<Step>) {
        *self.steps.lock().unwrap() = steps.into();
    }

    pub(crate) fn status_calls(&self) -> u32 {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn upload_calls(&self) -> u32 {
        self.upload_calls.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> Step {
        let mut steps = self.steps.lock().unwrap();
        let mut last = self.last.lock().unwrap();
        if let Some(step) = steps.pop_front() {
            *last = Some(step.clone());
        }
        last.clone().unwrap_or(Step::HttpError(404))
    }
}

fn record(job_id: &str, status: JobStatus, total: Option<u64>) -> ResultRecord {
    ResultRecord {
        id: job_id.to_string(),
        status,
        filename: Some("answers.csv".to_string()),
        total_records: total,
        average_score: total.map(|_| 1.5),
        distribution: None,
        records: None,
        download_url: None,
    }
}

impl ExamApiOps for FakeExamApi {
    fn upload_file<'a>(
        &'a self,
        _path: &'a Path,
        progress: Option<UnboundedSender<u8>>,
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<UploadResponse, AppError>> + Send + 'a>> {
        Box::pin(async move {
            self.upload_calls.fetch_add(1, Ordering::SeqCst);
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }
            match &self.upload {
                UploadScript::Accept(id) => {
                    if let Some(tx) = &progress {
                        for pct in [0u8, 50, 100] {
                            let _ = tx.send(pct);
                        }
                    }
                    Ok(UploadResponse {
                        id: id.clone(),
                        message: "File uploaded".to_string(),
                        success: Some(true),
                    })
                }
                UploadScript::Reject(status, message) => Err(AppError::Server {
                    status: *status,
                    message: message.clone(),
                }),
                UploadScript::Hang => {
                    if let Some(tx) = &progress {
                        let _ = tx.send(0);
                    }
                    cancel.cancelled().await;
                    Err(AppError::Cancelled)
                }
            }
        })
    }

    fn get_result<'a>(
        &'a self,
        job_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<ResultRecord, AppError>> + Send + 'a>> {
        Box::pin(async move {
            let call = self.status_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some((at, token)) = &self.cancel_on {
                if *at == call {
                    token.cancel();
                }
            }
            match self.next_step() {
                Step::Status(status) => Ok(record(job_id, status, None)),
                Step::Completed(total) => Ok(record(job_id, JobStatus::Completed, Some(total))),
                Step::HttpError(status) => Err(AppError::Server {
                    status,
                    message: format!("HTTP {}", status),
                }),
                Step::Network => Err(AppError::Network("connection refused".to_string())),
            }
        })
    }

    fn download_url(&self, job_id: &str) -> Result<Url, AppError> {
        self.urls.download_url(job_id)
    }
}
