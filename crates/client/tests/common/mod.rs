//! Shared test helpers: an in-memory connector whose handshakes follow a
//! script, a handle to the server side of every accepted connection, and
//! a scripted status source for the poller.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use jobsync_client::api::{ApiError, StatusSource};
use jobsync_client::config::ConnectionConfig;
use jobsync_client::events::{ConnectionEvent, ConnectionStatus};
use jobsync_client::reconnect::ReconnectPolicy;
use jobsync_client::transport::{ConnectError, Connector, Frame, Transport, TransportError};
use jobsync_core::job::JobUpdate;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

pub const ENDPOINT: &str = "ws://jobs.test/ws";

/// Upper bound on any single wait; with a paused clock this only fires
/// if the system under test is stuck.
const WAIT_LIMIT: Duration = Duration::from_secs(600);

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

/// Default-shaped config with a fast, short reconnect policy.
pub fn config(max_attempts: u32) -> ConnectionConfig {
    ConnectionConfig::new(ENDPOINT).with_reconnect(ReconnectPolicy {
        initial_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(30),
        multiplier: 1.5,
        max_attempts,
    })
}

/// Config whose heartbeat never fires within a test.
pub fn quiet_config() -> ConnectionConfig {
    config(10).with_heartbeat(Duration::from_secs(24 * 3600), Duration::from_secs(5))
}

// ---------------------------------------------------------------------------
// Mock connector
// ---------------------------------------------------------------------------

/// Outcome of one handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    Accept,
    /// Transient failure; retried.
    Fail,
    /// Server refusal; not retried.
    Reject,
}

pub struct MockConnector {
    script: Mutex<VecDeque<Handshake>>,
    fallback: Handshake,
    attempts: AtomicUsize,
    attempt_times: Mutex<Vec<Instant>>,
    servers: mpsc::UnboundedSender<ServerSide>,
}

impl MockConnector {
    /// Handshakes follow `script`, then `fallback` forever. Every accepted
    /// connection's server side is sent on the returned channel.
    pub fn new(
        script: Vec<Handshake>,
        fallback: Handshake,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerSide>) {
        let (servers, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            attempts: AtomicUsize::new(0),
            attempt_times: Mutex::new(Vec::new()),
            servers,
        });
        (connector, rx)
    }

    pub fn accepting() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerSide>) {
        Self::new(Vec::new(), Handshake::Accept)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempt_times.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        endpoint_url: &str,
        _auth_token: Option<&str>,
    ) -> Result<Box<dyn Transport>, ConnectError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.attempt_times.lock().unwrap().push(Instant::now());

        let outcome = self.script.lock().unwrap().pop_front().unwrap_or(self.fallback);
        match outcome {
            Handshake::Accept => {
                let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
                let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                let _ = self.servers.send(ServerSide {
                    endpoint: endpoint_url.to_string(),
                    inbound: inbound_tx,
                    outbound: outbound_rx,
                });
                Ok(Box::new(MockTransport {
                    inbound: inbound_rx,
                    outbound: outbound_tx,
                }))
            }
            Handshake::Fail => Err(ConnectError::Transport(TransportError::Closed)),
            Handshake::Reject => Err(ConnectError::Handshake("Server responded 401 Unauthorized".into())),
        }
    }
}

struct MockTransport {
    inbound: mpsc::UnboundedReceiver<Frame>,
    outbound: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.outbound.send(text).map_err(|_| TransportError::Closed)
    }

    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.inbound.close();
    }
}

// ---------------------------------------------------------------------------
// Server side of a mock connection
// ---------------------------------------------------------------------------

pub struct ServerSide {
    pub endpoint: String,
    inbound: mpsc::UnboundedSender<Frame>,
    outbound: mpsc::UnboundedReceiver<String>,
}

impl ServerSide {
    pub fn send_json(&self, value: Value) {
        let _ = self.inbound.send(Frame::Text(value.to_string()));
    }

    pub fn send_raw(&self, text: &str) {
        let _ = self.inbound.send(Frame::Text(text.to_string()));
    }

    pub fn send_close(&self) {
        let _ = self.inbound.send(Frame::Close);
    }

    /// Next frame the client sent, as JSON. `None` once the client side
    /// is gone.
    pub async fn recv_json(&mut self) -> Option<Value> {
        let text = tokio::time::timeout(WAIT_LIMIT, self.outbound.recv())
            .await
            .expect("timed out waiting for a client frame")?;
        Some(serde_json::from_str(&text).expect("client sent invalid JSON"))
    }

    /// Next client frame whose `event` is `event`, skipping others.
    pub async fn recv_event(&mut self, event: &str) -> Value {
        loop {
            let frame = self
                .recv_json()
                .await
                .unwrap_or_else(|| panic!("connection closed while waiting for {event}"));
            if frame["event"] == event {
                return frame;
            }
        }
    }
}

/// Wait for the next accepted connection.
pub async fn next_server(servers: &mut mpsc::UnboundedReceiver<ServerSide>) -> ServerSide {
    tokio::time::timeout(WAIT_LIMIT, servers.recv())
        .await
        .expect("timed out waiting for a connection")
        .expect("connector dropped")
}

// ---------------------------------------------------------------------------
// Connection event helpers
// ---------------------------------------------------------------------------

/// Consume events until the connection reports `target`. Returns every
/// status seen on the way, `target` included.
pub async fn wait_for_status(
    events: &mut broadcast::Receiver<ConnectionEvent>,
    target: ConnectionStatus,
) -> Vec<ConnectionStatus> {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(WAIT_LIMIT, events.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {target}; saw {seen:?}"))
            .expect("event channel closed");
        if let ConnectionEvent::StatusChanged { status } = event {
            seen.push(status);
            if status == target {
                return seen;
            }
        }
    }
}

/// Poll `check` on the paused clock until it holds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT_LIMIT;
    while !check() {
        assert!(Instant::now() < deadline, "condition never became true");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ---------------------------------------------------------------------------
// Scripted status source
// ---------------------------------------------------------------------------

type Responder = dyn Fn(&str, usize) -> Result<JobUpdate, ApiError> + Send + Sync;

/// Answers each status request with `respond(job_id, call_index)`.
pub struct ScriptedSource {
    respond: Box<Responder>,
    calls: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(
        respond: impl Fn(&str, usize) -> Result<JobUpdate, ApiError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            respond: Box::new(respond),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StatusSource for ScriptedSource {
    async fn fetch_status(&self, job_id: &str) -> Result<JobUpdate, ApiError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        (self.respond)(job_id, call)
    }
}

/// A 503 from the status endpoint.
pub fn unavailable() -> ApiError {
    ApiError::ApiError {
        status: 503,
        body: "upstream unavailable".into(),
    }
}

// ---------------------------------------------------------------------------
// Delayed status source
// ---------------------------------------------------------------------------

type DelayedResponder = dyn Fn(&str) -> Result<JobUpdate, ApiError> + Send + Sync;

/// Answers each status request with `respond(job_id)` after `delay`, so a
/// request can be interrupted while it is in flight.
pub struct DelayedSource {
    delay: Duration,
    respond: Box<DelayedResponder>,
    started: AtomicUsize,
}

impl DelayedSource {
    pub fn new(
        delay: Duration,
        respond: impl Fn(&str) -> Result<JobUpdate, ApiError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            delay,
            respond: Box::new(respond),
            started: AtomicUsize::new(0),
        })
    }

    /// Requests issued so far, finished or not.
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StatusSource for DelayedSource {
    async fn fetch_status(&self, job_id: &str) -> Result<JobUpdate, ApiError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        (self.respond)(job_id)
    }
}
