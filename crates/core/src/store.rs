//! Authoritative in-memory job state.
//!
//! [`JobStore`] is shared via `Arc<JobStore>` between the stream handlers
//! and the poll loops. Reads are synchronous and always reflect the last
//! applied update. Every accepted change is also published on a
//! broadcast channel so UIs and pollers can react without polling the
//! store themselves.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use tokio::sync::broadcast;

use crate::job::{JobState, JobUpdate};
use crate::merge::{merge, MergeOutcome, RejectReason};
use crate::types::JobId;

/// Broadcast channel capacity for store change events.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// A change to the store's contents.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// A job was created or updated; carries the new state.
    Updated(JobState),
    /// A job was removed by the caller.
    Dismissed(JobId),
}

/// Single source of truth for every tracked job.
pub struct JobStore {
    jobs: RwLock<HashMap<JobId, JobState>>,
    event_tx: broadcast::Sender<StoreEvent>,
}

impl JobStore {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            jobs: RwLock::new(HashMap::new()),
            event_tx,
        }
    }

    /// Fold an update into the store using the sticky-terminal merge rule.
    ///
    /// Returns the merge outcome so callers can tell whether the update
    /// took effect.
    pub fn apply(&self, update: JobUpdate) -> MergeOutcome {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        self.apply_locked(&mut jobs, update)
    }

    /// Like [`apply`](Self::apply), but only for a job that is still
    /// stored. Returns `None` without touching the store if the job is
    /// absent, so a late update cannot recreate a dismissed job.
    pub fn apply_existing(&self, update: JobUpdate) -> Option<MergeOutcome> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        if !jobs.contains_key(&update.job_id) {
            tracing::debug!(job_id = %update.job_id, source = ?update.source, "Discarding update for removed job");
            return None;
        }
        Some(self.apply_locked(&mut jobs, update))
    }

    fn apply_locked(&self, jobs: &mut HashMap<JobId, JobState>, update: JobUpdate) -> MergeOutcome {
        let outcome = merge(jobs.get(&update.job_id), &update);

        match &outcome {
            MergeOutcome::Created(state) | MergeOutcome::Updated(state) => {
                tracing::debug!(
                    job_id = %state.id,
                    status = %state.status,
                    progress = state.progress,
                    source = ?update.source,
                    "Job state applied",
                );
                jobs.insert(state.id.clone(), state.clone());
                // Sent under the lock so subscribers observe changes in
                // the same order they were applied.
                let _ = self.event_tx.send(StoreEvent::Updated(state.clone()));
            }
            MergeOutcome::Rejected(RejectReason::Stale) => {
                tracing::debug!(
                    job_id = %update.job_id,
                    source = ?update.source,
                    timestamp = %update.timestamp,
                    "Discarding stale job update",
                );
            }
            MergeOutcome::Rejected(RejectReason::Terminal) => {
                tracing::debug!(
                    job_id = %update.job_id,
                    source = ?update.source,
                    "Discarding update for terminal job",
                );
            }
        }

        outcome
    }

    /// Current state of one job.
    pub fn get(&self, job_id: &str) -> Option<JobState> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_id)
            .cloned()
    }

    /// Snapshot of every job, ordered by id.
    pub fn get_all(&self) -> Vec<JobState> {
        let mut all: Vec<JobState> = self
            .jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(job_id)
    }

    /// Whether the job is stored and in a terminal status.
    pub fn is_terminal(&self, job_id: &str) -> bool {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_id)
            .is_some_and(JobState::is_terminal)
    }

    /// Remove a job. Only ever called on explicit caller request.
    pub fn dismiss(&self, job_id: &str) -> Option<JobState> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        let removed = jobs.remove(job_id);
        if removed.is_some() {
            tracing::debug!(job_id, "Job dismissed");
            let _ = self.event_tx.send(StoreEvent::Dismissed(job_id.to_string()));
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribe to store change events.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.event_tx.subscribe()
    }
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chrono::{DateTime, Utc};

    use super::*;
    use crate::job::{JobStatus, UpdateSource};

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn progress(secs: i64, percent: u8, source: UpdateSource) -> JobUpdate {
        JobUpdate::new("job_1", at(secs), source)
            .with_status(JobStatus::Running)
            .with_progress(percent)
    }

    #[test]
    fn get_reflects_latest_apply() {
        let store = JobStore::new();
        assert!(store.get("job_1").is_none());

        store.apply(progress(1, 10, UpdateSource::Stream));
        assert_eq!(store.get("job_1").unwrap().progress, 10);

        store.apply(progress(2, 20, UpdateSource::Stream));
        assert_eq!(store.get("job_1").unwrap().progress, 20);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn newer_poll_wins_over_lagging_stream() {
        let store = JobStore::new();

        store.apply(JobUpdate::new("job_1", at(0), UpdateSource::Stream).with_status(JobStatus::Queued));
        store.apply(progress(1, 10, UpdateSource::Stream));
        // Stream drops here; poller reports a newer snapshot.
        store.apply(progress(5, 45, UpdateSource::Poll));

        // Stream reconnects and replays an older progress event.
        let outcome = store.apply(progress(3, 40, UpdateSource::Stream));
        assert_eq!(outcome, MergeOutcome::Rejected(RejectReason::Stale));

        let state = store.get("job_1").unwrap();
        assert_eq!(state.status, JobStatus::Running);
        assert_eq!(state.progress, 45);
        assert_eq!(state.source, UpdateSource::Poll);
    }

    #[test]
    fn first_terminal_outcome_wins() {
        let store = JobStore::new();
        store.apply(progress(1, 50, UpdateSource::Stream));

        store.apply(
            JobUpdate::new("job_1", at(2), UpdateSource::Stream)
                .with_status(JobStatus::Succeeded)
                .with_result(serde_json::json!({"url": "out.mp4"})),
        );
        let late = store.apply(
            JobUpdate::new("job_1", at(3), UpdateSource::Poll)
                .with_status(JobStatus::Failed)
                .with_error("stale failure"),
        );

        assert_eq!(late, MergeOutcome::Rejected(RejectReason::Terminal));
        let state = store.get("job_1").unwrap();
        assert_eq!(state.status, JobStatus::Succeeded);
        assert!(state.error.is_none());
        assert!(store.is_terminal("job_1"));
    }

    #[test]
    fn progress_is_non_decreasing_across_sources() {
        let store = JobStore::new();
        let sequence = [
            (1, 10, UpdateSource::Stream),
            (2, 30, UpdateSource::Poll),
            (3, 25, UpdateSource::Stream),
            (4, 60, UpdateSource::Stream),
            (5, 55, UpdateSource::Poll),
        ];

        let mut last = 0;
        for (secs, percent, source) in sequence {
            store.apply(progress(secs, percent, source));
            let current = store.get("job_1").unwrap().progress;
            assert!(current >= last, "progress went from {last} to {current}");
            last = current;
        }
        assert_eq!(last, 60);
    }

    #[test]
    fn dismiss_removes_and_notifies() {
        let store = JobStore::new();
        let mut rx = store.subscribe();

        store.apply(progress(1, 10, UpdateSource::Stream));
        let removed = store.dismiss("job_1").unwrap();
        assert_eq!(removed.id, "job_1");
        assert!(store.get("job_1").is_none());
        assert!(store.dismiss("job_1").is_none());

        assert_matches!(rx.try_recv(), Ok(StoreEvent::Updated(s)) if s.progress == 10);
        assert_matches!(rx.try_recv(), Ok(StoreEvent::Dismissed(id)) if id == "job_1");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn apply_existing_never_recreates_a_dismissed_job() {
        let store = JobStore::new();
        assert!(store.apply_existing(progress(1, 10, UpdateSource::Poll)).is_none());
        assert!(store.get("job_1").is_none());

        store.apply(progress(1, 10, UpdateSource::Stream));
        assert_matches!(
            store.apply_existing(progress(2, 20, UpdateSource::Poll)),
            Some(MergeOutcome::Updated(s)) if s.progress == 20
        );

        store.dismiss("job_1");
        assert!(store.apply_existing(progress(3, 30, UpdateSource::Poll)).is_none());
        assert!(store.get("job_1").is_none());
    }

    #[test]
    fn rejected_updates_are_not_broadcast() {
        let store = JobStore::new();
        store.apply(progress(5, 10, UpdateSource::Poll));
        let mut rx = store.subscribe();

        store.apply(progress(1, 90, UpdateSource::Stream));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn get_all_is_sorted_by_id() {
        let store = JobStore::new();
        for id in ["job_c", "job_a", "job_b"] {
            store.apply(JobUpdate::new(id, at(0), UpdateSource::Poll));
        }
        let ids: Vec<String> = store.get_all().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["job_a", "job_b", "job_c"]);
    }
}
