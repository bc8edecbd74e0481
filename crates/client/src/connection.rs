//! Streaming connection lifecycle for one job stream endpoint.
//!
//! [`ConnectionManager`] owns a single logical connection: it performs
//! the handshake, runs heartbeats, reconnects with exponential backoff
//! and buffers outbound messages in a [`MessageQueue`] while the socket
//! is down. All socket work happens on one spawned task per
//! [`connect`](ConnectionManager::connect) call; the handle is cheap to
//! share behind an `Arc`.
//!
//! Status changes and inbound job messages are broadcast as
//! [`ConnectionEvent`]s. Call [`ConnectionManager::subscribe`] to
//! receive them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use jobsync_core::types::Timestamp;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::ConnectionConfig;
use crate::events::{ConnectionEvent, ConnectionStatus};
use crate::messages::{parse_message, ClientMessage, ServerMessage};
use crate::queue::{EnqueueOutcome, MessageQueue, Priority, QueuedMessage};
use crate::transport::{ConnectError, Connector, Frame, Transport, TransportError};

/// Broadcast channel capacity for connection events.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// How long `disconnect` waits for the connection task to finish.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a close handshake may take during teardown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Outcome of [`ConnectionManager::send`].
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// Handed to the live connection for immediate transmission.
    Dispatched,
    /// Not connected; the message went through the outbound queue.
    Queued(EnqueueOutcome),
}

/// Point-in-time view of a connection's health.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStats {
    pub status: ConnectionStatus,
    /// Consecutive failed handshakes; reset on success.
    pub failed_attempts: u32,
    /// Round trip of the most recent heartbeat.
    pub latency: Option<Duration>,
    /// Last time a frame was sent or received.
    pub last_activity: Option<Timestamp>,
    /// Messages waiting in the outbound queue.
    pub queued_messages: usize,
}

/// Manages one streaming connection to one endpoint.
pub struct ConnectionManager {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
    running: Mutex<Option<RunningTask>>,
}

/// State visible to both the handle and the connection task.
struct Shared {
    endpoint: String,
    queue: Mutex<MessageQueue>,
    status_tx: watch::Sender<ConnectionStatus>,
    event_tx: broadcast::Sender<ConnectionEvent>,
    health: RwLock<Health>,
}

#[derive(Default)]
struct Health {
    failed_attempts: u32,
    latency: Option<Duration>,
    last_activity: Option<Timestamp>,
}

/// Bookkeeping for the spawned connection task.
struct RunningTask {
    cmd_tx: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    /// Set together with the task's final status.
    exited: Arc<AtomicBool>,
    handle: tokio::task::JoinHandle<()>,
}

/// Commands from the handle to the connection task.
enum Command {
    Send(QueuedMessage),
}

impl ConnectionManager {
    /// Create an idle manager. Nothing happens until [`connect`](Self::connect).
    pub fn new(config: ConnectionConfig, connector: Arc<dyn Connector>) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let shared = Arc::new(Shared {
            endpoint: config.endpoint_url.clone(),
            queue: Mutex::new(MessageQueue::new(config.queue_capacity)),
            status_tx,
            event_tx,
            health: RwLock::new(Health::default()),
        });

        Self {
            config,
            connector,
            shared,
            running: Mutex::new(None),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint_url
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Start connecting in the background.
    ///
    /// Returns as soon as the first attempt is issued; the result shows
    /// up as status changes. A no-op while a connection task is already
    /// running. After `disconnected` or `error`, calling this again is
    /// how the caller requests a fresh reconnection cycle.
    pub fn connect(&self) {
        let mut running = self.lock_running();
        if running.as_ref().is_some_and(|task| !task.exited.load(Ordering::Acquire)) {
            return;
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let exited = Arc::new(AtomicBool::new(false));

        self.shared.set_status(ConnectionStatus::Connecting);

        let task = ConnectionTask {
            config: self.config.clone(),
            connector: Arc::clone(&self.connector),
            shared: Arc::clone(&self.shared),
            cmd_rx,
            cancel: cancel.clone(),
            exited: Arc::clone(&exited),
        };
        let endpoint = self.config.endpoint_url.clone();
        let handle = tokio::spawn(async move {
            tracing::info!(endpoint = %endpoint, "Starting connection task");
            task.run().await;
            tracing::info!(endpoint = %endpoint, "Connection task exited");
        });

        *running = Some(RunningTask {
            cmd_tx,
            cancel,
            exited,
            handle,
        });
    }

    /// Send a message, or queue it if the connection is not up.
    pub fn send(&self, payload: ClientMessage, priority: Priority) -> Delivery {
        let mut message = QueuedMessage::new(payload, priority);

        if self.status() == ConnectionStatus::Connected {
            if let Some(task) = self.lock_running().as_ref() {
                match task.cmd_tx.send(Command::Send(message)) {
                    Ok(()) => return Delivery::Dispatched,
                    Err(mpsc::error::SendError(Command::Send(returned))) => message = returned,
                }
            }
        }

        let outcome = self.shared.lock_queue().push(message);
        tracing::debug!(endpoint = %self.shared.endpoint, ?priority, "Message queued while not connected");
        Delivery::Queued(outcome)
    }

    /// Request teardown without waiting for it to finish.
    ///
    /// Safe to call from synchronous contexts; idempotent.
    pub fn close(&self) {
        if let Some(task) = self.lock_running().as_ref() {
            task.cancel.cancel();
        }
    }

    /// Tear down the socket, timers and heartbeat state and wait for the
    /// connection task to exit. Always ends in `disconnected`.
    pub async fn disconnect(&self) {
        let task = self.lock_running().take();

        if let Some(task) = task {
            task.cancel.cancel();
            let abort = task.handle.abort_handle();
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, task.handle).await.is_err() {
                tracing::warn!(endpoint = %self.shared.endpoint, "Connection task did not stop in time, aborting");
                abort.abort();
            }
        }

        self.shared.set_status(ConnectionStatus::Disconnected);
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status_tx.borrow()
    }

    /// Watch the current status; useful for awaiting a transition.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Subscribe to status changes, heartbeat samples and inbound messages.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.event_tx.subscribe()
    }

    pub fn stats(&self) -> ConnectionStats {
        let health = self.shared.health.read().unwrap_or_else(PoisonError::into_inner);
        ConnectionStats {
            status: self.status(),
            failed_attempts: health.failed_attempts,
            latency: health.latency,
            last_activity: health.last_activity,
            queued_messages: self.shared.lock_queue().len(),
        }
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<RunningTask>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        // Best-effort shutdown signal.
        if let Some(task) = self.lock_running().as_ref() {
            task.cancel.cancel();
        }
    }
}

impl Shared {
    fn set_status(&self, status: ConnectionStatus) {
        let changed = self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            self.announce(status);
        }
    }

    /// Publish the final status of an exiting task and mark it exited in
    /// the same step, so anyone woken by that status can start a new task.
    fn finish(&self, status: ConnectionStatus, exited: &AtomicBool) {
        let changed = self.status_tx.send_if_modified(|current| {
            exited.store(true, Ordering::Release);
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            self.announce(status);
        }
    }

    fn announce(&self, status: ConnectionStatus) {
        tracing::info!(endpoint = %self.endpoint, status = %status, "Connection status changed");
        let _ = self.event_tx.send(ConnectionEvent::StatusChanged { status });
    }

    fn lock_queue(&self) -> MutexGuard<'_, MessageQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn health_mut(&self) -> std::sync::RwLockWriteGuard<'_, Health> {
        self.health.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_failed_attempts(&self, failures: u32) {
        self.health_mut().failed_attempts = failures;
    }

    fn touch(&self) {
        self.health_mut().last_activity = Some(Utc::now());
    }

    fn record_latency(&self, latency: Duration) {
        self.health_mut().latency = Some(latency);
        let _ = self.event_tx.send(ConnectionEvent::LatencySampled { latency });
    }
}

/// Sets the final status when the connection task exits, including on
/// panic or abort.
struct TeardownGuard {
    shared: Arc<Shared>,
    exited: Arc<AtomicBool>,
    final_status: ConnectionStatus,
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        self.shared.finish(self.final_status, &self.exited);
    }
}

/// Why a connected session ended.
enum SessionEnd {
    /// The caller asked for teardown.
    Cancelled,
    /// The socket died or stopped answering heartbeats.
    Lost(String),
}

/// The spawned half: owns the socket for the lifetime of one
/// connect() call.
struct ConnectionTask {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
    exited: Arc<AtomicBool>,
}

impl ConnectionTask {
    async fn run(mut self) {
        let mut guard = TeardownGuard {
            shared: Arc::clone(&self.shared),
            exited: Arc::clone(&self.exited),
            final_status: ConnectionStatus::Disconnected,
        };
        guard.final_status = self.connection_loop().await;
        self.requeue_pending_commands();
        drop(guard);
    }

    /// Core loop: connect -> session -> backoff -> connect ...
    ///
    /// Returns the status to publish on exit: `error` after a handshake
    /// rejection, `disconnected` on cancellation or once the reconnect
    /// policy is exhausted.
    async fn connection_loop(&mut self) -> ConnectionStatus {
        let endpoint = self.config.endpoint_url.clone();
        let policy = self.config.reconnect.clone();
        // Consecutive failed handshakes, checked against max_attempts.
        let mut failures: u32 = 0;
        // Backoff slots used in the current outage.
        let mut retry: u32 = 0;

        loop {
            self.shared.set_status(ConnectionStatus::Connecting);

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return ConnectionStatus::Disconnected,
                result = self.connector.connect(&endpoint, self.config.auth_token.as_deref()) => result,
            };

            match result {
                Ok(mut transport) => {
                    failures = 0;
                    retry = 0;
                    self.shared.record_failed_attempts(0);
                    self.shared.set_status(ConnectionStatus::Connected);

                    match self.run_session(transport.as_mut()).await {
                        SessionEnd::Cancelled => {
                            let _ = tokio::time::timeout(CLOSE_TIMEOUT, transport.close()).await;
                            return ConnectionStatus::Disconnected;
                        }
                        SessionEnd::Lost(reason) => {
                            tracing::warn!(endpoint = %endpoint, reason = %reason, "Connection lost");
                            self.shared.set_status(ConnectionStatus::Reconnecting);
                        }
                    }
                }
                Err(ConnectError::Handshake(reason)) => {
                    tracing::error!(endpoint = %endpoint, reason = %reason, "Handshake rejected, not retrying");
                    return ConnectionStatus::Error;
                }
                Err(ConnectError::Transport(e)) => {
                    failures += 1;
                    self.shared.record_failed_attempts(failures);
                    tracing::warn!(
                        endpoint = %endpoint,
                        error = %e,
                        "Connect attempt {failures} failed",
                    );
                    if policy.is_exhausted(failures) {
                        tracing::warn!(
                            endpoint = %endpoint,
                            attempts = failures,
                            "Reconnect attempts exhausted, giving up",
                        );
                        return ConnectionStatus::Disconnected;
                    }
                    self.shared.set_status(ConnectionStatus::Reconnecting);
                }
            }

            let delay = policy.delay_for_attempt(retry);
            retry = retry.saturating_add(1);
            tracing::info!(
                endpoint = %endpoint,
                attempt = failures + 1,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting to job stream",
            );
            if !self.backoff(delay).await {
                return ConnectionStatus::Disconnected;
            }
        }
    }

    /// Wait out a backoff delay. Sends issued meanwhile are queued.
    /// Returns `false` if cancelled.
    async fn backoff(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                _ = &mut sleep => return true,
                Some(cmd) = self.cmd_rx.recv() => self.queue_command(cmd),
            }
        }
    }

    /// Drive one connected session until it is lost or cancelled.
    async fn run_session(&mut self, transport: &mut dyn Transport) -> SessionEnd {
        if let Err(e) = self.flush_queue(transport).await {
            return SessionEnd::Lost(format!("Failed to drain outbound queue: {e}"));
        }

        let period = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ping_sent_at: Option<Instant> = None;

        loop {
            let pong_deadline = ping_sent_at.map(|sent| sent + self.config.pong_timeout);

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    self.flush_pending_commands(transport).await;
                    return SessionEnd::Cancelled;
                }

                _ = tokio::time::sleep_until(pong_deadline.unwrap_or_else(Instant::now)), if pong_deadline.is_some() => {
                    return SessionEnd::Lost(format!(
                        "No pong within {}ms",
                        self.config.pong_timeout.as_millis()
                    ));
                }

                frame = transport.next_frame() => {
                    match frame {
                        Some(Ok(Frame::Text(text))) => {
                            self.shared.touch();
                            if let Err(e) = self.handle_text(&text, transport, &mut ping_sent_at).await {
                                return SessionEnd::Lost(e.to_string());
                            }
                        }
                        Some(Ok(Frame::Pong)) => {
                            self.shared.touch();
                            self.record_pong(&mut ping_sent_at);
                        }
                        Some(Ok(Frame::Close)) | None => {
                            return SessionEnd::Lost("Closed by server".to_string());
                        }
                        Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                    }
                }

                _ = heartbeat.tick() => {
                    if ping_sent_at.is_none() {
                        tracing::debug!(endpoint = %self.shared.endpoint, "Heartbeat ping");
                        if let Err(e) = self.transmit(transport, &ClientMessage::ping()).await {
                            return SessionEnd::Lost(format!("Heartbeat ping failed: {e}"));
                        }
                        ping_sent_at = Some(Instant::now());
                    }
                }

                Some(cmd) = self.cmd_rx.recv() => {
                    let Command::Send(mut message) = cmd;
                    message.retry_count += 1;
                    if let Err(e) = self.transmit(transport, &message.payload).await {
                        self.shared.lock_queue().requeue_front(message);
                        return SessionEnd::Lost(e.to_string());
                    }
                }
            }
        }
    }

    /// Parse and route one text frame. Malformed input is dropped.
    async fn handle_text(
        &mut self,
        text: &str,
        transport: &mut dyn Transport,
        ping_sent_at: &mut Option<Instant>,
    ) -> Result<(), TransportError> {
        match parse_message(text) {
            Ok(ServerMessage::Pong(_)) => self.record_pong(ping_sent_at),
            Ok(ServerMessage::Ping(_)) => {
                tracing::trace!(endpoint = %self.shared.endpoint, "Answering server ping");
                self.transmit(transport, &ClientMessage::pong()).await?;
            }
            Ok(message) => {
                tracing::trace!(
                    endpoint = %self.shared.endpoint,
                    event = %message.tag(),
                    job_id = message.job_id().unwrap_or_default(),
                    "Job message received",
                );
                let _ = self.shared.event_tx.send(ConnectionEvent::Message(message));
            }
            Err(e) => {
                tracing::warn!(
                    endpoint = %self.shared.endpoint,
                    error = %e,
                    raw_message = %text,
                    "Dropping malformed job stream message",
                );
            }
        }
        Ok(())
    }

    fn record_pong(&self, ping_sent_at: &mut Option<Instant>) {
        if let Some(sent) = ping_sent_at.take() {
            let latency = sent.elapsed();
            tracing::trace!(
                endpoint = %self.shared.endpoint,
                latency_ms = latency.as_millis() as u64,
                "Heartbeat pong",
            );
            self.shared.record_latency(latency);
        }
    }

    /// Deliver queued messages in priority order.
    async fn flush_queue(&mut self, transport: &mut dyn Transport) -> Result<(), TransportError> {
        loop {
            let next = self.shared.lock_queue().pop_next();
            let Some(message) = next else {
                return Ok(());
            };
            if let Err(e) = self.transmit(transport, &message.payload).await {
                self.shared.lock_queue().requeue_front(message);
                return Err(e);
            }
            tracing::debug!(
                endpoint = %self.shared.endpoint,
                message_id = %message.id,
                attempt = message.retry_count,
                "Delivered queued message",
            );
        }
    }

    async fn transmit(
        &mut self,
        transport: &mut dyn Transport,
        message: &ClientMessage,
    ) -> Result<(), TransportError> {
        let text = match message.encode() {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(endpoint = %self.shared.endpoint, error = %e, "Dropping unencodable message");
                return Ok(());
            }
        };
        transport.send_text(text).await?;
        self.shared.touch();
        Ok(())
    }

    /// Transmit sends that were already dispatched when teardown was
    /// requested. Whatever fails stays queued.
    async fn flush_pending_commands(&mut self, transport: &mut dyn Transport) {
        while let Ok(Command::Send(mut message)) = self.cmd_rx.try_recv() {
            message.retry_count += 1;
            if self.transmit(transport, &message.payload).await.is_err() {
                self.shared.lock_queue().requeue_front(message);
                return;
            }
        }
    }

    fn queue_command(&self, cmd: Command) {
        let Command::Send(message) = cmd;
        self.shared.lock_queue().push(message);
    }

    /// Move sends that raced with shutdown into the queue so the next
    /// connection delivers them.
    fn requeue_pending_commands(&mut self) {
        self.cmd_rx.close();
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            self.queue_command(cmd);
        }
    }
}
