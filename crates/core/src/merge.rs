//! Last-writer-wins merge with sticky terminal statuses.
//!
//! The stream and the poller may deliver updates for the same job in any
//! order. [`merge`] is the only arbitration between them:
//!
//! 1. A job with no stored record accepts any update.
//! 2. A stored terminal job accepts nothing.
//! 3. Otherwise the update must carry a strictly newer timestamp.
//! 4. Status never moves backwards; a lower-ranked status is ignored
//!    while the remaining fields still apply.
//! 5. Progress never decreases.

use crate::job::{JobState, JobStatus, JobUpdate};

/// Result of folding one update into the stored state.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// First observation of this job.
    Created(JobState),
    /// The update was newer and produced this state.
    Updated(JobState),
    /// The update was discarded.
    Rejected(RejectReason),
}

/// Why an update was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The update's timestamp is not newer than the stored one.
    Stale,
    /// The stored job already reached a terminal status.
    Terminal,
}

/// Fold `update` into `current`, returning the new state or the reason
/// the update was discarded. Pure; callers own storage.
pub fn merge(current: Option<&JobState>, update: &JobUpdate) -> MergeOutcome {
    let Some(current) = current else {
        return MergeOutcome::Created(initial_state(update));
    };

    if current.is_terminal() {
        return MergeOutcome::Rejected(RejectReason::Terminal);
    }
    if update.timestamp <= current.updated_at {
        return MergeOutcome::Rejected(RejectReason::Stale);
    }

    let mut next = current.clone();

    if let Some(status) = update.status {
        if status.rank() >= current.status.rank() {
            next.status = status;
        }
    }
    if let Some(percent) = update.progress {
        next.progress = percent.min(100).max(current.progress);
    }
    if next.status == JobStatus::Succeeded {
        next.progress = 100;
    }
    if let Some(job_type) = update.job_type {
        next.job_type = Some(job_type);
    }
    if let Some(message) = &update.message {
        next.message = Some(message.clone());
    }
    if let Some(error) = &update.error {
        next.error = Some(error.clone());
    }
    if let Some(result) = &update.result {
        next.result = Some(result.clone());
    }
    next.updated_at = update.timestamp;
    next.source = update.source;

    MergeOutcome::Updated(next)
}

fn initial_state(update: &JobUpdate) -> JobState {
    let status = update.status.unwrap_or(JobStatus::Queued);
    let progress = if status == JobStatus::Succeeded {
        100
    } else {
        update.progress.unwrap_or(0).min(100)
    };

    JobState {
        id: update.job_id.clone(),
        job_type: update.job_type,
        status,
        progress,
        message: update.message.clone(),
        error: update.error.clone(),
        result: update.result.clone(),
        updated_at: update.timestamp,
        source: update.source,
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chrono::{Duration, Utc};

    use super::*;
    use crate::job::{JobType, UpdateSource};

    fn at(secs: i64) -> crate::types::Timestamp {
        chrono::DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn stored(status: JobStatus, progress: u8, secs: i64) -> JobState {
        JobState {
            id: "job_1".into(),
            job_type: Some(JobType::Export),
            status,
            progress,
            message: None,
            error: None,
            result: None,
            updated_at: at(secs),
            source: UpdateSource::Stream,
        }
    }

    #[test]
    fn first_observation_creates_record() {
        let update = JobUpdate::new("job_1", at(0), UpdateSource::Poll)
            .with_status(JobStatus::Running)
            .with_progress(12);

        let state = assert_matches!(merge(None, &update), MergeOutcome::Created(s) => s);
        assert_eq!(state.status, JobStatus::Running);
        assert_eq!(state.progress, 12);
        assert_eq!(state.source, UpdateSource::Poll);
    }

    #[test]
    fn first_observation_without_status_is_queued() {
        let update = JobUpdate::new("job_1", at(0), UpdateSource::Stream);
        let state = assert_matches!(merge(None, &update), MergeOutcome::Created(s) => s);
        assert_eq!(state.status, JobStatus::Queued);
        assert_eq!(state.progress, 0);
    }

    #[test]
    fn older_timestamp_is_rejected() {
        let current = stored(JobStatus::Running, 45, 10);
        let update = JobUpdate::new("job_1", at(5), UpdateSource::Stream).with_progress(40);
        assert_eq!(
            merge(Some(&current), &update),
            MergeOutcome::Rejected(RejectReason::Stale)
        );
    }

    #[test]
    fn equal_timestamp_is_rejected() {
        let current = stored(JobStatus::Running, 45, 10);
        let update = JobUpdate::new("job_1", at(10), UpdateSource::Poll).with_progress(50);
        assert_eq!(
            merge(Some(&current), &update),
            MergeOutcome::Rejected(RejectReason::Stale)
        );
    }

    #[test]
    fn terminal_is_sticky_even_for_newer_updates() {
        let current = stored(JobStatus::Succeeded, 100, 10);
        let update = JobUpdate::new("job_1", at(60), UpdateSource::Poll)
            .with_status(JobStatus::Failed)
            .with_error("late failure");
        assert_eq!(
            merge(Some(&current), &update),
            MergeOutcome::Rejected(RejectReason::Terminal)
        );
    }

    #[test]
    fn lower_progress_is_clamped_but_message_applies() {
        let current = stored(JobStatus::Running, 45, 10);
        let update = JobUpdate::new("job_1", at(11), UpdateSource::Stream)
            .with_status(JobStatus::Running)
            .with_progress(30)
            .with_message("encoding audio");

        let state = assert_matches!(merge(Some(&current), &update), MergeOutcome::Updated(s) => s);
        assert_eq!(state.progress, 45);
        assert_eq!(state.message.as_deref(), Some("encoding audio"));
        assert_eq!(state.updated_at, at(11));
    }

    #[test]
    fn status_never_moves_backwards() {
        let current = stored(JobStatus::Running, 20, 10);
        let update = JobUpdate::new("job_1", at(11), UpdateSource::Poll)
            .with_status(JobStatus::Queued)
            .with_message("requeued?");

        let state = assert_matches!(merge(Some(&current), &update), MergeOutcome::Updated(s) => s);
        assert_eq!(state.status, JobStatus::Running);
        assert_eq!(state.message.as_deref(), Some("requeued?"));
    }

    #[test]
    fn success_forces_full_progress() {
        let current = stored(JobStatus::Running, 80, 10);
        let update = JobUpdate::new("job_1", at(12), UpdateSource::Stream)
            .with_status(JobStatus::Succeeded)
            .with_result(serde_json::json!({"url": "https://cdn/out.mp4"}));

        let state = assert_matches!(merge(Some(&current), &update), MergeOutcome::Updated(s) => s);
        assert_eq!(state.progress, 100);
        assert_eq!(state.result.unwrap()["url"], "https://cdn/out.mp4");
    }

    #[test]
    fn failure_keeps_error_detail() {
        let current = stored(JobStatus::Running, 33, 10);
        let update = JobUpdate::new("job_1", at(12), UpdateSource::Stream)
            .with_status(JobStatus::Failed)
            .with_error("model timed out");

        let state = assert_matches!(merge(Some(&current), &update), MergeOutcome::Updated(s) => s);
        assert_eq!(state.status, JobStatus::Failed);
        assert_eq!(state.progress, 33);
        assert_eq!(state.error.as_deref(), Some("model timed out"));
    }

    #[test]
    fn status_is_monotonic_over_arbitrary_sequences() {
        let statuses = [
            JobStatus::Running,
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Canceled,
            JobStatus::Running,
            JobStatus::Succeeded,
        ];
        let base = Utc::now();
        let mut state: Option<JobState> = None;
        let mut last_rank = 0;
        let mut terminal_seen = None;

        for (i, status) in statuses.iter().enumerate() {
            let update = JobUpdate::new("job_1", base + Duration::seconds(i as i64), UpdateSource::Poll)
                .with_status(*status);
            match merge(state.as_ref(), &update) {
                MergeOutcome::Created(s) | MergeOutcome::Updated(s) => state = Some(s),
                MergeOutcome::Rejected(_) => {}
            }
            let current = state.as_ref().unwrap();
            assert!(current.status.rank() >= last_rank);
            last_rank = current.status.rank();
            if let Some(t) = terminal_seen {
                assert_eq!(current.status, t);
            } else if current.is_terminal() {
                terminal_seen = Some(current.status);
            }
        }
        assert_eq!(terminal_seen, Some(JobStatus::Canceled));
    }
}
