//! REST client for the job status endpoints.
//!
//! Wraps `GET <base>/{id}` (one-shot snapshot, also used by the polling
//! fallback) and `POST <base>/{id}/cancel` using [`reqwest`].

use async_trait::async_trait;
use chrono::Utc;
use jobsync_core::job::{clamp_percent, JobStatus, JobType, JobUpdate, UpdateSource};
use jobsync_core::types::{JobId, Timestamp};
use serde::Deserialize;

/// HTTP client for one job status API.
#[derive(Debug, Clone)]
pub struct JobApi {
    client: reqwest::Client,
    base_url: String,
}

/// Body of a job status response. Same field set as the stream's
/// generic envelope.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    #[serde(alias = "id")]
    pub job_id: JobId,
    #[serde(default)]
    pub job_type: Option<JobType>,
    pub status: JobStatus,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default, alias = "timestamp")]
    pub updated_at: Option<Timestamp>,
}

impl JobStatusResponse {
    /// Convert into a poll-sourced store update. A response without a
    /// server timestamp is stamped with `received_at`.
    pub fn into_update(self, received_at: Timestamp) -> JobUpdate {
        JobUpdate {
            job_id: self.job_id,
            job_type: self.job_type,
            status: Some(self.status),
            progress: self.progress.map(clamp_percent),
            message: self.message,
            error: self.error,
            result: self.result,
            timestamp: self.updated_at.unwrap_or(received_at),
            source: UpdateSource::Poll,
        }
    }
}

/// Errors from the REST layer.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The HTTP request itself failed (network, DNS, TLS, decoding).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The server returned a non-2xx status code.
    #[error("Job API error ({status}): {body}")]
    ApiError {
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },
}

/// Something that can report a job's current state.
///
/// Implemented by [`JobApi`]; tests substitute a scripted source.
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn fetch_status(&self, job_id: &str) -> Result<JobUpdate, ApiError>;
}

impl JobApi {
    /// * `base_url` - Job status collection URL, e.g. `https://host/api/jobs`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    /// Reuse an existing [`reqwest::Client`] for connection pooling.
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetch a one-shot snapshot of a job.
    ///
    /// Sends `GET {base}/{job_id}`.
    pub async fn get_status(&self, job_id: &str) -> Result<JobStatusResponse, ApiError> {
        let response = self.client.get(self.job_url(job_id)).send().await?;

        Self::parse_response(response).await
    }

    /// Ask the server to cancel a job.
    ///
    /// Sends `POST {base}/{job_id}/cancel`.
    pub async fn cancel_job(&self, job_id: &str) -> Result<(), ApiError> {
        let response = self
            .client
            .post(self.cancel_url(job_id))
            .send()
            .await?;

        Self::check_status(response).await
    }

    fn job_url(&self, job_id: &str) -> String {
        format!("{}/{}", self.base_url, job_id)
    }

    fn cancel_url(&self, job_id: &str) -> String {
        format!("{}/cancel", self.job_url(job_id))
    }

    // ---- private helpers ----

    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }

    async fn check_status(response: reqwest::Response) -> Result<(), ApiError> {
        Self::ensure_success(response).await?;
        Ok(())
    }
}

#[async_trait]
impl StatusSource for JobApi {
    async fn fetch_status(&self, job_id: &str) -> Result<JobUpdate, ApiError> {
        let snapshot = self.get_status(job_id).await?;
        Ok(snapshot.into_update(Utc::now()))
    }
}
