//! Event tag constants for the job status protocol.
//!
//! Used by the client crate when parsing inbound envelopes and when
//! encoding outbound requests, so both directions agree on spelling.

/// Progress update during job execution (percentage + message).
pub const EVENT_PROGRESS: &str = "progress";

/// Job moved to a new lifecycle status.
pub const EVENT_STATUS_CHANGE: &str = "status_change";

/// Job completed successfully.
pub const EVENT_COMPLETED: &str = "completed";

/// Namespaced alias of [`EVENT_COMPLETED`].
pub const EVENT_JOB_SUCCEEDED: &str = "job.succeeded";

/// Job failed with an error.
pub const EVENT_ERROR: &str = "error";

/// Namespaced alias of [`EVENT_ERROR`].
pub const EVENT_JOB_FAILED: &str = "job.failed";

/// Job was canceled (by user or system).
pub const EVENT_JOB_CANCELED: &str = "job.canceled";

/// Generic envelope carrying any subset of job fields.
pub const EVENT_JOB_UPDATED: &str = "job.updated";

/// Heartbeat request.
pub const EVENT_PING: &str = "ping";

/// Heartbeat reply.
pub const EVENT_PONG: &str = "pong";

/// Outbound: start receiving events for one job.
pub const EVENT_SUBSCRIBE: &str = "subscribe";

/// Outbound: stop receiving events for one job.
pub const EVENT_UNSUBSCRIBE: &str = "unsubscribe";

/// Outbound: ask the server to cancel a job.
pub const EVENT_CANCEL: &str = "cancel";
