//! Job lifecycle types.
//!
//! [`JobState`] is the canonical view of one backend job. Partial
//! observations arrive as [`JobUpdate`]s from either the stream or the
//! polling path and are folded in by [`crate::merge`].

use serde::{Deserialize, Serialize};

use crate::types::{JobId, Timestamp};

/// Kind of backend work a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Export,
    AiGeneration,
    Thumbnail,
    Processing,
}

/// Lifecycle status of a job.
///
/// Transitions only move forward: `queued -> running -> terminal`.
/// Wire aliases used by older servers are accepted on input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[serde(alias = "pending")]
    Queued,
    #[serde(alias = "processing")]
    Running,
    #[serde(alias = "completed")]
    Succeeded,
    Failed,
    #[serde(alias = "cancelled")]
    Canceled,
}

impl JobStatus {
    /// Whether no further mutation is accepted once this status is stored.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    /// Position in the lifecycle ordering. All terminal statuses share
    /// the highest rank.
    pub fn rank(self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Running => 1,
            Self::Succeeded | Self::Failed | Self::Canceled => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which transport path observed an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateSource {
    Stream,
    Poll,
}

/// The canonical view of one backend job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobState {
    pub id: JobId,
    /// `None` until some observation reports the job type.
    pub job_type: Option<JobType>,
    pub status: JobStatus,
    /// Completion percentage (0-100).
    pub progress: u8,
    pub message: Option<String>,
    /// Server-reported failure detail, set when the job failed.
    pub error: Option<String>,
    /// Type-specific result payload (output URLs, dimensions, ...).
    pub result: Option<serde_json::Value>,
    pub updated_at: Timestamp,
    /// Path that delivered the most recently applied update.
    pub source: UpdateSource,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// A partial observation of a job, tagged with the time the server
/// produced it and the path that delivered it.
#[derive(Debug, Clone, PartialEq)]
pub struct JobUpdate {
    pub job_id: JobId,
    pub job_type: Option<JobType>,
    pub status: Option<JobStatus>,
    /// Proposed percentage; clamped into 0-100 by [`clamp_percent`].
    pub progress: Option<u8>,
    pub message: Option<String>,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
    pub timestamp: Timestamp,
    pub source: UpdateSource,
}

impl JobUpdate {
    /// An update carrying only the identifying fields.
    pub fn new(job_id: impl Into<JobId>, timestamp: Timestamp, source: UpdateSource) -> Self {
        Self {
            job_id: job_id.into(),
            job_type: None,
            status: None,
            progress: None,
            message: None,
            error: None,
            result: None,
            timestamp,
            source,
        }
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_progress(mut self, percent: u8) -> Self {
        self.progress = Some(percent.min(100));
        self
    }

    pub fn with_job_type(mut self, job_type: JobType) -> Self {
        self.job_type = Some(job_type);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }
}

/// Convert a raw wire percentage into the 0-100 range.
///
/// Non-finite values map to zero.
pub fn clamp_percent(raw: f64) -> u8 {
    if !raw.is_finite() {
        return 0;
    }
    raw.round().clamp(0.0, 100.0) as u8
}
