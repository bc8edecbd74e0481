//! Connection configuration.
//!
//! [`ConnectionConfig`] is injected into each
//! [`ConnectionManager`](crate::connection::ConnectionManager) and never
//! changes for the lifetime of that connection.

use std::time::Duration;

use crate::reconnect::ReconnectPolicy;

/// Default interval between heartbeat pings.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Default time to wait for a pong before declaring the connection dead.
pub const DEFAULT_PONG_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound on messages buffered while disconnected.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Everything a connection needs to reach and keep alive one endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    /// WebSocket URL, e.g. `wss://api.example.com/ws/jobs`.
    pub endpoint_url: String,
    pub heartbeat_interval: Duration,
    pub pong_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    /// Sent as `Authorization: Bearer <token>` during the handshake.
    pub auth_token: Option<String>,
    /// Maximum number of outbound messages held while disconnected.
    pub queue_capacity: usize,
}

impl ConnectionConfig {
    pub fn new(endpoint_url: impl Into<String>) -> Self {
        Self {
            endpoint_url: endpoint_url.into(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            pong_timeout: DEFAULT_PONG_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
            auth_token: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    /// Copy this configuration for a different endpoint.
    pub fn for_endpoint(&self, endpoint_url: impl Into<String>) -> Self {
        Self {
            endpoint_url: endpoint_url.into(),
            ..self.clone()
        }
    }

    pub fn with_heartbeat(mut self, interval: Duration, pong_timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.pong_timeout = pong_timeout;
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }
}
