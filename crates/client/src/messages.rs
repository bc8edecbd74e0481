//! Job stream message types and parser.
//!
//! The server sends flat JSON envelopes tagged by an `event` field, e.g.
//! `{"event": "progress", "jobId": "job_1", "progress": 40}`. This module
//! deserializes them into a closed [`ServerMessage`] enum and encodes the
//! client's outbound requests as [`ClientMessage`].

use chrono::Utc;
use jobsync_core::job::{clamp_percent, JobStatus, JobType, JobUpdate, UpdateSource};
use jobsync_core::job_events;
use jobsync_core::types::{JobId, Timestamp};
use serde::{Deserialize, Serialize};

/// All known inbound message types.
///
/// Deserialized via the internally-tagged `"event"` field; the remaining
/// envelope fields are flattened next to it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event")]
pub enum ServerMessage {
    /// Progress update from a running job.
    #[serde(rename = "progress")]
    Progress(ProgressData),

    /// A job moved to a new lifecycle status.
    #[serde(rename = "status_change")]
    StatusChange(StatusChangeData),

    /// A job finished successfully.
    #[serde(rename = "completed", alias = "job.succeeded")]
    Completed(CompletedData),

    /// A job failed. This is job data, not a connection fault.
    #[serde(rename = "error", alias = "job.failed")]
    Failed(FailedData),

    /// A job was canceled.
    #[serde(rename = "job.canceled", alias = "canceled")]
    Canceled(CanceledData),

    /// Generic envelope carrying any subset of job fields.
    #[serde(rename = "job.updated", alias = "job_update")]
    Updated(EnvelopeData),

    /// Server-initiated heartbeat; answered with a pong.
    #[serde(rename = "ping")]
    Ping(HeartbeatData),

    /// Reply to a client heartbeat.
    #[serde(rename = "pong")]
    Pong(HeartbeatData),
}

/// Routing key for a [`ServerMessage`], one per variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventTag {
    Progress,
    StatusChange,
    Completed,
    Failed,
    Canceled,
    Updated,
    Ping,
    Pong,
}

impl EventTag {
    /// Tags that carry job state, in the order a tracker subscribes to them.
    pub const JOB_EVENTS: [EventTag; 6] = [
        EventTag::Progress,
        EventTag::StatusChange,
        EventTag::Completed,
        EventTag::Failed,
        EventTag::Canceled,
        EventTag::Updated,
    ];

    /// Canonical wire spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Progress => job_events::EVENT_PROGRESS,
            Self::StatusChange => job_events::EVENT_STATUS_CHANGE,
            Self::Completed => job_events::EVENT_COMPLETED,
            Self::Failed => job_events::EVENT_ERROR,
            Self::Canceled => job_events::EVENT_JOB_CANCELED,
            Self::Updated => job_events::EVENT_JOB_UPDATED,
            Self::Ping => job_events::EVENT_PING,
            Self::Pong => job_events::EVENT_PONG,
        }
    }
}

impl std::fmt::Display for EventTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload for `progress` messages.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressData {
    pub job_id: JobId,
    pub job_type: Option<JobType>,
    /// Raw percentage as sent by the server; may be fractional.
    #[serde(alias = "percentage")]
    pub progress: f64,
    pub message: Option<String>,
    #[serde(default, deserialize_with = "wire_timestamp::deserialize")]
    pub timestamp: Option<Timestamp>,
}

/// Payload for `status_change` messages.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChangeData {
    pub job_id: JobId,
    pub job_type: Option<JobType>,
    pub status: JobStatus,
    pub message: Option<String>,
    #[serde(default, deserialize_with = "wire_timestamp::deserialize")]
    pub timestamp: Option<Timestamp>,
}

/// Payload for `completed` / `job.succeeded` messages.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedData {
    pub job_id: JobId,
    pub job_type: Option<JobType>,
    /// Type-specific output (download URL, dimensions, ...).
    pub result: Option<serde_json::Value>,
    pub message: Option<String>,
    #[serde(default, deserialize_with = "wire_timestamp::deserialize")]
    pub timestamp: Option<Timestamp>,
}

/// Payload for `error` / `job.failed` messages.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedData {
    pub job_id: JobId,
    pub job_type: Option<JobType>,
    #[serde(alias = "detail")]
    pub error: Option<String>,
    pub message: Option<String>,
    #[serde(default, deserialize_with = "wire_timestamp::deserialize")]
    pub timestamp: Option<Timestamp>,
}

/// Payload for `job.canceled` messages.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanceledData {
    pub job_id: JobId,
    pub job_type: Option<JobType>,
    pub message: Option<String>,
    #[serde(default, deserialize_with = "wire_timestamp::deserialize")]
    pub timestamp: Option<Timestamp>,
}

/// The generic job envelope; every field but the id is optional.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeData {
    pub job_id: JobId,
    pub job_type: Option<JobType>,
    pub status: Option<JobStatus>,
    pub progress: Option<f64>,
    pub message: Option<String>,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
    #[serde(default, deserialize_with = "wire_timestamp::deserialize")]
    pub timestamp: Option<Timestamp>,
}

/// Payload for heartbeat messages.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct HeartbeatData {
    #[serde(default, deserialize_with = "wire_timestamp::deserialize")]
    pub timestamp: Option<Timestamp>,
}

impl ServerMessage {
    pub fn tag(&self) -> EventTag {
        match self {
            Self::Progress(_) => EventTag::Progress,
            Self::StatusChange(_) => EventTag::StatusChange,
            Self::Completed(_) => EventTag::Completed,
            Self::Failed(_) => EventTag::Failed,
            Self::Canceled(_) => EventTag::Canceled,
            Self::Updated(_) => EventTag::Updated,
            Self::Ping(_) => EventTag::Ping,
            Self::Pong(_) => EventTag::Pong,
        }
    }

    /// The job this message refers to; `None` for heartbeats.
    pub fn job_id(&self) -> Option<&str> {
        match self {
            Self::Progress(d) => Some(&d.job_id),
            Self::StatusChange(d) => Some(&d.job_id),
            Self::Completed(d) => Some(&d.job_id),
            Self::Failed(d) => Some(&d.job_id),
            Self::Canceled(d) => Some(&d.job_id),
            Self::Updated(d) => Some(&d.job_id),
            Self::Ping(_) | Self::Pong(_) => None,
        }
    }

    /// Translate a job-bearing message into a store update.
    ///
    /// Messages without a server timestamp are stamped with `received_at`.
    /// Heartbeats return `None`.
    pub fn to_update(&self, received_at: Timestamp) -> Option<JobUpdate> {
        let stamp = |ts: Option<Timestamp>| ts.unwrap_or(received_at);

        let update = match self {
            Self::Progress(d) => {
                let mut u = JobUpdate::new(d.job_id.clone(), stamp(d.timestamp), UpdateSource::Stream)
                    .with_status(JobStatus::Running)
                    .with_progress(clamp_percent(d.progress));
                u.job_type = d.job_type;
                u.message = d.message.clone();
                u
            }
            Self::StatusChange(d) => {
                let mut u = JobUpdate::new(d.job_id.clone(), stamp(d.timestamp), UpdateSource::Stream)
                    .with_status(d.status);
                u.job_type = d.job_type;
                u.message = d.message.clone();
                u
            }
            Self::Completed(d) => {
                let mut u = JobUpdate::new(d.job_id.clone(), stamp(d.timestamp), UpdateSource::Stream)
                    .with_status(JobStatus::Succeeded)
                    .with_progress(100);
                u.job_type = d.job_type;
                u.message = d.message.clone();
                u.result = d.result.clone();
                u
            }
            Self::Failed(d) => {
                let mut u = JobUpdate::new(d.job_id.clone(), stamp(d.timestamp), UpdateSource::Stream)
                    .with_status(JobStatus::Failed);
                u.job_type = d.job_type;
                u.message = d.message.clone();
                u.error = d
                    .error
                    .clone()
                    .or_else(|| d.message.clone())
                    .or_else(|| Some("Job failed".to_string()));
                u
            }
            Self::Canceled(d) => {
                let mut u = JobUpdate::new(d.job_id.clone(), stamp(d.timestamp), UpdateSource::Stream)
                    .with_status(JobStatus::Canceled);
                u.job_type = d.job_type;
                u.message = d.message.clone();
                u
            }
            Self::Updated(d) => JobUpdate {
                job_id: d.job_id.clone(),
                job_type: d.job_type,
                status: d.status,
                progress: d.progress.map(clamp_percent),
                message: d.message.clone(),
                error: d.error.clone(),
                result: d.result.clone(),
                timestamp: stamp(d.timestamp),
                source: UpdateSource::Stream,
            },
            Self::Ping(_) | Self::Pong(_) => return None,
        };

        Some(update)
    }
}

/// Outbound requests from the client to the server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start receiving events for one job.
    Subscribe {
        #[serde(rename = "jobId")]
        job_id: JobId,
    },
    /// Stop receiving events for one job.
    Unsubscribe {
        #[serde(rename = "jobId")]
        job_id: JobId,
    },
    /// Ask the server to cancel a job.
    Cancel {
        #[serde(rename = "jobId")]
        job_id: JobId,
    },
    /// Client heartbeat.
    Ping { timestamp: Timestamp },
    /// Reply to a server heartbeat.
    Pong { timestamp: Timestamp },
}

impl ClientMessage {
    pub fn ping() -> Self {
        Self::Ping {
            timestamp: Utc::now(),
        }
    }

    pub fn pong() -> Self {
        Self::Pong {
            timestamp: Utc::now(),
        }
    }

    /// Encode as a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }
}

/// Malformed or unexpected protocol traffic.
///
/// Logged and dropped by the connection loop; never changes connection
/// state.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Inbound text was not a known event envelope.
    #[error("Malformed message: {0}")]
    Malformed(#[source] serde_json::Error),

    /// An outbound message could not be serialized.
    #[error("Failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Parse a stream text frame into a typed message.
///
/// Returns `Err` for malformed JSON or unknown `event` values.
/// Callers should log and continue.
pub fn parse_message(text: &str) -> Result<ServerMessage, ProtocolError> {
    serde_json::from_str(text).map_err(ProtocolError::Malformed)
}

/// Servers send either RFC 3339 strings or epoch milliseconds.
mod wire_timestamp {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Rfc3339(DateTime<Utc>),
        Millis(i64),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<Raw>::deserialize(deserializer)? {
            None => Ok(None),
            Some(Raw::Rfc3339(ts)) => Ok(Some(ts)),
            Some(Raw::Millis(ms)) => DateTime::<Utc>::from_timestamp_millis(ms)
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom(format!("timestamp out of range: {ms}"))),
        }
    }
}
