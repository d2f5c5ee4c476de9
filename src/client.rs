//! HTTP client for a RunPod-style serverless endpoint.
//!
//! Wraps the three calls the run loop needs (`POST /run`,
//! `GET /stream/{id}`, `GET /status/{id}`) using [`reqwest`]. Every
//! request carries `Authorization: Bearer <token>`.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::messages::{StatusReport, StreamEvent, StreamResponse};

/// The job-queue operations the reconciler depends on.
///
/// `poll_stream` and `poll_status` never fail: a transport error or a
/// non-2xx response (the stream 404s until the worker yields its first
/// event) is reported as `None`, meaning "no new information".
#[async_trait]
pub trait JobEndpoint: Send + Sync {
    async fn submit(&self, workflow: &serde_json::Value) -> Result<String, SubmissionError>;

    /// Full snapshot of the job's event log.
    async fn poll_stream(&self, job_id: &str) -> Option<Vec<StreamEvent>>;

    async fn poll_status(&self, job_id: &str) -> Option<StatusReport>;
}

/// Submitting a job failed. Fatal to the run.
#[derive(Debug, thiserror::Error)]
pub enum SubmissionError {
    #[error("submit request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("submit failed ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("unexpected submit response: {body}")]
    MissingId { body: String },
}

/// Transient failure on the stream or status channel.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
}

#[derive(Deserialize)]
struct SubmitResponse {
    id: Option<String>,
}

pub struct RunpodClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl RunpodClient {
    /// * `endpoint` - base URL, e.g. `https://api.runpod.ai/v2/<endpoint-id>`.
    pub fn new(endpoint: &str, api_key: String, timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, endpoint, api_key))
    }

    /// Reuse an existing [`reqwest::Client`] (shared connection pool).
    pub fn with_client(client: reqwest::Client, endpoint: &str, api_key: String) -> Self {
        Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.client
    }

    pub async fn fetch_stream(&self, job_id: &str) -> Result<StreamResponse, FetchError> {
        self.get_json(&format!("{}/stream/{}", self.endpoint, job_id)).await
    }

    pub async fn fetch_status(&self, job_id: &str) -> Result<StatusReport, FetchError> {
        self.get_json(&format!("{}/status/{}", self.endpoint, job_id)).await
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(FetchError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl JobEndpoint for RunpodClient {
    async fn submit(&self, workflow: &serde_json::Value) -> Result<String, SubmissionError> {
        let body = serde_json::json!({ "input": { "workflow": workflow } });
        let response = self
            .client
            .post(format!("{}/run", self.endpoint))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(SubmissionError::Rejected {
                status: status.as_u16(),
                body: text,
            });
        }
        parse_job_id(&text)
    }

    async fn poll_stream(&self, job_id: &str) -> Option<Vec<StreamEvent>> {
        match self.fetch_stream(job_id).await {
            Ok(resp) => Some(resp.stream),
            Err(e) => {
                tracing::debug!(job_id, error = %e, "Stream poll yielded nothing");
                None
            }
        }
    }

    async fn poll_status(&self, job_id: &str) -> Option<StatusReport> {
        match self.fetch_status(job_id).await {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::debug!(job_id, error = %e, "Status poll yielded nothing");
                None
            }
        }
    }
}

fn parse_job_id(body: &str) -> Result<String, SubmissionError> {
    match serde_json::from_str::<SubmitResponse>(body) {
        Ok(SubmitResponse { id: Some(id) }) if !id.is_empty() => Ok(id),
        _ => Err(SubmissionError::MissingId {
            body: body.to_string(),
        }),
    }
}
