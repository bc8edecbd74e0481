//! Polling fallback for job state.
//!
//! Each polled job gets its own task that fetches a snapshot on a fixed
//! interval and applies it to the [`JobStore`]. A loop ends when the job
//! turns terminal (through either path), when it is dismissed, or when
//! the caller stops it. Request failures never end a loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use jobsync_core::merge::MergeOutcome;
use jobsync_core::store::{JobStore, StoreEvent};
use jobsync_core::types::JobId;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::api::{ApiError, StatusSource};

/// Default time between status requests.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq)]
pub struct PollConfig {
    pub interval: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// A failed status request. Logged and retried on the next tick.
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("Status request failed: {0}")]
    Api(#[from] ApiError),
}

/// Runs and cancels per-job poll loops. Cheap to clone.
#[derive(Clone)]
pub struct PollingCoordinator {
    inner: Arc<PollerInner>,
}

struct PollerInner {
    source: Arc<dyn StatusSource>,
    store: Arc<JobStore>,
    config: PollConfig,
    polls: Mutex<HashMap<JobId, ActivePoll>>,
    next_generation: AtomicU64,
}

struct ActivePoll {
    generation: u64,
    cancel: CancellationToken,
}

impl PollingCoordinator {
    pub fn new(source: Arc<dyn StatusSource>, store: Arc<JobStore>, config: PollConfig) -> Self {
        Self {
            inner: Arc::new(PollerInner {
                source,
                store,
                config,
                polls: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.inner.store
    }

    /// Start polling `job_id`. Returns `false` if it is already being
    /// polled or already terminal.
    pub fn start(&self, job_id: &str) -> bool {
        if self.inner.store.is_terminal(job_id) {
            return false;
        }

        let mut polls = self.inner.lock_polls();
        if polls.contains_key(job_id) {
            return false;
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        polls.insert(
            job_id.to_string(),
            ActivePoll {
                generation,
                cancel: cancel.clone(),
            },
        );
        drop(polls);

        let task = PollTask {
            job_id: job_id.to_string(),
            generation,
            source: Arc::clone(&self.inner.source),
            store: Arc::clone(&self.inner.store),
            interval: self.inner.config.interval,
            coordinator: Arc::downgrade(&self.inner),
            cancel,
        };
        tokio::spawn(task.run());

        tracing::info!(job_id = %job_id, interval_ms = self.inner.config.interval.as_millis() as u64, "Polling started");
        true
    }

    /// Stop polling `job_id`. Idempotent; a response already in flight is
    /// discarded. Dismissing the job from the store has the same effect.
    pub fn stop(&self, job_id: &str) -> bool {
        let removed = self.inner.lock_polls().remove(job_id);
        match removed {
            Some(poll) => {
                poll.cancel.cancel();
                tracing::info!(job_id = %job_id, "Polling stopped");
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        self.inner.cancel_all();
    }

    pub fn is_polling(&self, job_id: &str) -> bool {
        self.inner.lock_polls().contains_key(job_id)
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock_polls().len()
    }

    /// Fetch one snapshot and apply it, outside any poll loop.
    pub async fn poll_now(&self, job_id: &str) -> Result<MergeOutcome, PollError> {
        let update = self.inner.source.fetch_status(job_id).await?;
        Ok(self.inner.store.apply(update))
    }
}

impl PollerInner {
    fn lock_polls(&self) -> MutexGuard<'_, HashMap<JobId, ActivePoll>> {
        self.polls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Forget a loop that ended on its own, unless it was already
    /// replaced by a newer one.
    fn finished(&self, job_id: &str, generation: u64) {
        let mut polls = self.lock_polls();
        if polls.get(job_id).is_some_and(|p| p.generation == generation) {
            polls.remove(job_id);
        }
    }

    fn cancel_all(&self) {
        for (_, poll) in self.lock_polls().drain() {
            poll.cancel.cancel();
        }
    }
}

impl Drop for PollerInner {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

struct PollTask {
    job_id: JobId,
    generation: u64,
    source: Arc<dyn StatusSource>,
    store: Arc<JobStore>,
    interval: Duration,
    coordinator: Weak<PollerInner>,
    cancel: CancellationToken,
}

impl PollTask {
    async fn run(self) {
        let mut store_events = self.store.subscribe();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Once the job has been stored, a response may only refresh it,
        // never recreate it after a dismissal.
        let mut observed = false;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                event = store_events.recv() => {
                    match event {
                        Ok(StoreEvent::Updated(state)) if state.id == self.job_id && state.is_terminal() => {
                            tracing::debug!(job_id = %self.job_id, status = %state.status, "Job turned terminal, ending poll");
                            break;
                        }
                        Ok(StoreEvent::Dismissed(id)) if id == self.job_id => break,
                        Ok(_) | Err(RecvError::Lagged(_)) => continue,
                        Err(RecvError::Closed) => break,
                    }
                }
                _ = ticker.tick() => {}
            }

            observed |= self.store.contains(&self.job_id);
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                result = self.source.fetch_status(&self.job_id) => result,
            };

            match result {
                Ok(update) => {
                    // Cancellation or dismissal observed after the response arrived wins.
                    if self.cancel.is_cancelled() || self.dismissal_pending(&mut store_events) {
                        break;
                    }
                    observed |= self.store.contains(&self.job_id);
                    let outcome = if observed {
                        self.store.apply_existing(update)
                    } else {
                        Some(self.store.apply(update))
                    };
                    match outcome {
                        None => {
                            tracing::debug!(job_id = %self.job_id, "Job dismissed during request, ending poll");
                            break;
                        }
                        Some(MergeOutcome::Rejected(reason)) => {
                            tracing::trace!(job_id = %self.job_id, ?reason, "Poll response not applied");
                        }
                        Some(_) => observed = true,
                    }
                    if self.store.is_terminal(&self.job_id) {
                        tracing::info!(job_id = %self.job_id, "Job terminal, polling finished");
                        break;
                    }
                }
                Err(e) => {
                    let e = PollError::from(e);
                    tracing::warn!(job_id = %self.job_id, error = %e, "Status poll failed, retrying next interval");
                }
            }
        }

        if let Some(coordinator) = self.coordinator.upgrade() {
            coordinator.finished(&self.job_id, self.generation);
        }
    }

    /// Drain store events queued while a request was in flight. True if
    /// this job was dismissed in the meantime.
    fn dismissal_pending(&self, events: &mut broadcast::Receiver<StoreEvent>) -> bool {
        loop {
            match events.try_recv() {
                Ok(StoreEvent::Dismissed(id)) if id == self.job_id => return true,
                Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty) => return false,
                Err(TryRecvError::Closed) => return true,
            }
        }
    }
}
