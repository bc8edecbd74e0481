//! Real-time job stream client.
//!
//! Provides typed protocol messages, a self-healing WebSocket connection
//! with heartbeats and a bounded outbound queue, tag-based subscription
//! routing, a REST status client with a polling fallback, and the
//! [`JobTracker`](tracker::JobTracker) facade that ties them to a shared
//! job store.

pub mod api;
pub mod config;
pub mod connection;
pub mod events;
pub mod messages;
pub mod poller;
pub mod queue;
pub mod reconnect;
pub mod router;
pub mod tracker;
pub mod transport;
