//! Events emitted by a connection to a job stream endpoint.
//!
//! A [`ConnectionManager`](crate::connection::ConnectionManager)
//! broadcasts these to its subscribers. Connection health and job data
//! travel on the same channel but stay distinct variants: a dropped
//! socket is never reported as a failed job.

use std::time::Duration;

use crate::messages::ServerMessage;

/// Lifecycle status of one streaming connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    /// A handshake is in flight.
    Connecting,
    /// The socket is open and heartbeats are running.
    Connected,
    /// The connection was lost; waiting for the next backoff slot.
    Reconnecting,
    /// Closed by the caller, or reconnect attempts were exhausted.
    Disconnected,
    /// The server rejected the handshake; no automatic retry.
    Error,
}

impl ConnectionStatus {
    /// Whether job updates should be sourced from the poller instead.
    pub fn is_degraded(self) -> bool {
        matches!(self, Self::Reconnecting | Self::Disconnected | Self::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something that happened on a connection.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The connection moved to a new status.
    StatusChanged { status: ConnectionStatus },

    /// A job message arrived, in transport order.
    Message(ServerMessage),

    /// A heartbeat round trip completed.
    LatencySampled { latency: Duration },
}
