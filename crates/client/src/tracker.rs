//! High-level job tracking over one stream endpoint.
//!
//! [`JobTracker`] is what an application holds. Tracking a job registers
//! stream handlers for it on the [`SubscriptionRouter`], asks the server
//! to stream it, and, depending on [`PollMode`] and connection health,
//! runs a poll loop for it. Both paths feed the same [`JobStore`].
//!
//! A supervisor task follows the endpoint's connection status: while the
//! stream is degraded every non-terminal job is polled, and once it is
//! back the tracker re-sends `subscribe` for each of them (and, in
//! [`PollMode::Fallback`], stops the polls).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::Utc;
use jobsync_core::job::JobState;
use jobsync_core::store::JobStore;
use jobsync_core::types::JobId;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::connection::{ConnectionManager, Delivery};
use crate::events::ConnectionStatus;
use crate::messages::{ClientMessage, EventTag};
use crate::poller::PollingCoordinator;
use crate::queue::Priority;
use crate::router::{Subscription, SubscriptionRouter};

/// When the poller runs for stream-tracked jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PollMode {
    /// Only while the stream is `reconnecting`, `disconnected` or `error`.
    #[default]
    Fallback,
    /// Always, in parallel with the stream.
    Always,
}

impl PollMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fallback" => Some(Self::Fallback),
            "always" => Some(Self::Always),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("Job {0} is not tracked")]
    NotTracked(JobId),

    #[error("No stream connection for {0}")]
    NotConnected(String),
}

/// Tracks jobs through the stream with a polling fallback.
pub struct JobTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    router: SubscriptionRouter,
    poller: PollingCoordinator,
    endpoint: String,
    mode: PollMode,
    tracked: Mutex<HashMap<JobId, TrackedJob>>,
    supervisor: Mutex<Option<Supervisor>>,
}

struct TrackedJob {
    /// Empty for poll-only jobs.
    subscriptions: Vec<Subscription>,
}

impl TrackedJob {
    fn is_streamed(&self) -> bool {
        !self.subscriptions.is_empty()
    }
}

struct Supervisor {
    connection: Weak<ConnectionManager>,
    cancel: CancellationToken,
}

impl JobTracker {
    /// `endpoint` is the stream URL every tracked job is subscribed on.
    /// The store is the poller's.
    pub fn new(
        router: SubscriptionRouter,
        poller: PollingCoordinator,
        endpoint: impl Into<String>,
        mode: PollMode,
    ) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                router,
                poller,
                endpoint: endpoint.into(),
                mode,
                tracked: Mutex::new(HashMap::new()),
                supervisor: Mutex::new(None),
            }),
        }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        self.inner.poller.store()
    }

    pub fn poller(&self) -> &PollingCoordinator {
        &self.inner.poller
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    pub fn mode(&self) -> PollMode {
        self.inner.mode
    }

    /// The stream connection, while at least one job is stream-tracked.
    pub fn connection(&self) -> Option<Arc<ConnectionManager>> {
        self.inner.router.connection(&self.inner.endpoint)
    }

    /// Start tracking a job through the stream (plus polling as the
    /// mode and connection health dictate). Returns `false` if the job
    /// is already tracked.
    pub fn track(&self, job_id: impl Into<JobId>) -> bool {
        let job_id = job_id.into();
        let inner = &self.inner;

        let mut tracked = inner.lock_tracked();
        if tracked.contains_key(&job_id) {
            return false;
        }

        let subscriptions = EventTag::JOB_EVENTS
            .iter()
            .map(|&tag| {
                let store = Arc::clone(inner.poller.store());
                let id = job_id.clone();
                inner.router.subscribe(&inner.endpoint, tag, move |message| {
                    if message.job_id() != Some(id.as_str()) {
                        return;
                    }
                    if let Some(update) = message.to_update(Utc::now()) {
                        store.apply(update);
                    }
                })
            })
            .collect();
        tracked.insert(job_id.clone(), TrackedJob { subscriptions });
        drop(tracked);

        let status = inner.ensure_supervisor();
        if status == Some(ConnectionStatus::Connected) {
            inner.send_subscribe(&job_id);
        }
        if inner.mode == PollMode::Always || status.is_some_and(ConnectionStatus::is_degraded) {
            inner.poller.start(&job_id);
        }

        tracing::info!(job_id = %job_id, endpoint = %inner.endpoint, "Tracking job");
        true
    }

    /// Track a job through polling alone.
    pub fn poll_only(&self, job_id: impl Into<JobId>) -> bool {
        let job_id = job_id.into();

        let mut tracked = self.inner.lock_tracked();
        if tracked.contains_key(&job_id) {
            return false;
        }
        tracked.insert(
            job_id.clone(),
            TrackedJob {
                subscriptions: Vec::new(),
            },
        );
        drop(tracked);

        self.inner.poller.start(&job_id);
        tracing::info!(job_id = %job_id, "Tracking job by polling only");
        true
    }

    /// Stop tracking a job. Its last known state stays in the store.
    pub fn untrack(&self, job_id: &str) -> bool {
        let removed = self.inner.lock_tracked().remove(job_id);
        let Some(job) = removed else {
            return false;
        };

        if job.is_streamed() {
            if let Some(connection) = self.connection() {
                if connection.status() == ConnectionStatus::Connected {
                    connection.send(
                        ClientMessage::Unsubscribe {
                            job_id: job_id.to_string(),
                        },
                        Priority::Normal,
                    );
                }
            }
        }
        self.inner.poller.stop(job_id);
        drop(job);

        tracing::info!(job_id = %job_id, "Stopped tracking job");
        true
    }

    /// Untrack a job and evict it from the store.
    pub fn dismiss(&self, job_id: &str) -> Option<JobState> {
        self.untrack(job_id);
        self.store().dismiss(job_id)
    }

    /// Ask the server to cancel a tracked job. Delivered at high
    /// priority; queued if the stream is down.
    pub fn cancel(&self, job_id: &str) -> Result<Delivery, TrackerError> {
        if !self.is_tracked(job_id) {
            return Err(TrackerError::NotTracked(job_id.to_string()));
        }
        let connection = self
            .connection()
            .ok_or_else(|| TrackerError::NotConnected(self.inner.endpoint.clone()))?;

        tracing::info!(job_id = %job_id, "Requesting job cancellation");
        Ok(connection.send(
            ClientMessage::Cancel {
                job_id: job_id.to_string(),
            },
            Priority::High,
        ))
    }

    pub fn is_tracked(&self, job_id: &str) -> bool {
        self.inner.lock_tracked().contains_key(job_id)
    }

    /// Tracked job ids, sorted.
    pub fn tracked_ids(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self.inner.lock_tracked().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Whether every tracked job has reached a terminal status.
    pub fn all_terminal(&self) -> bool {
        let store = self.store();
        self.inner
            .lock_tracked()
            .keys()
            .all(|id| store.is_terminal(id))
    }
}

impl Drop for JobTracker {
    fn drop(&mut self) {
        if let Some(supervisor) = self.inner.lock_supervisor().take() {
            supervisor.cancel.cancel();
        }
        let ids: Vec<JobId> = self.inner.lock_tracked().drain().map(|(id, _)| id).collect();
        for id in ids {
            self.inner.poller.stop(&id);
        }
    }
}

impl TrackerInner {
    fn lock_tracked(&self) -> MutexGuard<'_, HashMap<JobId, TrackedJob>> {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_supervisor(&self) -> MutexGuard<'_, Option<Supervisor>> {
        self.supervisor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a supervisor to the current connection if it is not
    /// already watched. Returns the connection's status.
    fn ensure_supervisor(self: &Arc<Self>) -> Option<ConnectionStatus> {
        let connection = self.router.connection(&self.endpoint)?;
        let status = connection.status();

        let mut supervisor = self.lock_supervisor();
        if let Some(current) = supervisor.as_ref() {
            let same = current
                .connection
                .upgrade()
                .is_some_and(|watched| Arc::ptr_eq(&watched, &connection));
            if same {
                return Some(status);
            }
            current.cancel.cancel();
        }

        let cancel = CancellationToken::new();
        tokio::spawn(supervise(
            Arc::downgrade(self),
            Arc::downgrade(&connection),
            connection.watch_status(),
            cancel.clone(),
        ));
        *supervisor = Some(Supervisor {
            connection: Arc::downgrade(&connection),
            cancel,
        });

        Some(status)
    }

    /// Non-terminal jobs tracked through the stream.
    fn live_streamed_jobs(&self) -> Vec<JobId> {
        let store = self.poller.store();
        self.lock_tracked()
            .iter()
            .filter(|(id, job)| job.is_streamed() && !store.is_terminal(id))
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn send_subscribe(&self, job_id: &str) {
        if let Some(connection) = self.router.connection(&self.endpoint) {
            connection.send(
                ClientMessage::Subscribe {
                    job_id: job_id.to_string(),
                },
                Priority::Normal,
            );
        }
    }

    fn on_status(&self, status: ConnectionStatus) {
        match status {
            ConnectionStatus::Connected => {
                let jobs = self.live_streamed_jobs();
                for job_id in &jobs {
                    self.send_subscribe(job_id);
                    if self.mode == PollMode::Fallback {
                        self.poller.stop(job_id);
                    }
                }
                tracing::info!(endpoint = %self.endpoint, jobs = jobs.len(), "Stream up, subscriptions sent");
            }
            status if status.is_degraded() => {
                let jobs = self.live_streamed_jobs();
                for job_id in &jobs {
                    self.poller.start(job_id);
                }
                if !jobs.is_empty() {
                    tracing::info!(
                        endpoint = %self.endpoint,
                        status = %status,
                        jobs = jobs.len(),
                        "Stream degraded, polling fallback engaged",
                    );
                }
            }
            _ => {}
        }
    }
}

async fn supervise(
    tracker: Weak<TrackerInner>,
    connection: Weak<ConnectionManager>,
    mut status: watch::Receiver<ConnectionStatus>,
    cancel: CancellationToken,
) {
    loop {
        let current = *status.borrow_and_update();
        match tracker.upgrade() {
            Some(tracker) => tracker.on_status(current),
            None => break,
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        if connection.strong_count() == 0 {
            break;
        }
    }
    tracing::debug!("Connection supervisor stopped");
}
