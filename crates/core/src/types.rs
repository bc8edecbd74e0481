/// Backend job identifiers are opaque strings assigned by the server.
pub type JobId = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
