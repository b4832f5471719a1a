// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{EpisodeId, JobId, PodcastId};
use crate::error::JobFailure;

/// State of an ingestion job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Fetching,
    Transcoded,
    Storing,
    Attached,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Attached | JobState::Failed)
    }

    /// Claimed by a worker and somewhere between dispatch and attach
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            JobState::Fetching | JobState::Transcoded | JobState::Storing
        )
    }

    /// Whether `next` is a permitted move from this state.
    ///
    /// Moving back to `Pending` only happens when a retryable failure
    /// reschedules the job.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Fetching)
                | (Pending, Failed)
                | (Fetching, Transcoded)
                | (Fetching, Pending)
                | (Fetching, Failed)
                | (Transcoded, Storing)
                | (Transcoded, Failed)
                | (Storing, Attached)
                | (Storing, Pending)
                | (Storing, Failed)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Pending => "pending",
            JobState::Fetching => "fetching",
            JobState::Transcoded => "transcoded",
            JobState::Storing => "storing",
            JobState::Attached => "attached",
            JobState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Claim held by a worker; once expired the job may be reclaimed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub worker: String,
    pub expires_at: DateTime<Utc>,
}

/// Unit of retryable work turning one episode's source into stored audio
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionJob {
    pub id: JobId,
    pub episode_id: EpisodeId,
    pub podcast_id: PodcastId,
    pub state: JobState,
    /// Number of times the job has been dispatched to a worker
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<JobFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease: Option<Lease>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl IngestionJob {
    pub fn new(episode_id: EpisodeId, podcast_id: PodcastId, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            episode_id,
            podcast_id,
            state: JobState::Pending,
            attempts: 0,
            last_error: None,
            next_retry_at: None,
            lease: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Retries consumed so far (the first dispatch is not a retry)
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }

    /// Whether a worker may claim this job at `now`
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            JobState::Pending => self.next_retry_at.is_none_or(|at| at <= now),
            state if state.is_in_flight() => self.is_lease_expired(now),
            _ => false,
        }
    }

    pub fn is_lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease.as_ref().is_none_or(|lease| lease.expires_at <= now)
    }

    /// Whether `worker` holds the lease, even if it has run out but
    /// nobody has reclaimed the job yet
    pub fn is_leased_to(&self, worker: &str) -> bool {
        self.lease.as_ref().is_some_and(|lease| lease.worker == worker)
    }

    pub fn handle(&self) -> JobHandle {
        JobHandle {
            job_id: self.id,
            episode_id: self.episode_id,
        }
    }
}

/// Reference returned to the API layer on enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle {
    pub job_id: JobId,
    pub episode_id: EpisodeId,
}

/// Queryable snapshot of a job
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatus {
    pub job_id: JobId,
    pub episode_id: EpisodeId,
    pub state: JobState,
    pub attempts: u32,
    pub retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<JobFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&IngestionJob> for JobStatus {
    fn from(job: &IngestionJob) -> Self {
        Self {
            job_id: job.id,
            episode_id: job.episode_id,
            state: job.state,
            attempts: job.attempts,
            retries: job.retries(),
            last_error: job.last_error.clone(),
            next_retry_at: job.next_retry_at,
            finished_at: job.finished_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn make_job() -> IngestionJob {
        IngestionJob::new(EpisodeId::new(), PodcastId::new(), Utc::now())
    }

    #[test]
    fn state_machine_runs_forward() {
        use JobState::*;

        assert!(Pending.can_transition_to(Fetching));
        assert!(Fetching.can_transition_to(Transcoded));
        assert!(Transcoded.can_transition_to(Storing));
        assert!(Storing.can_transition_to(Attached));
        assert!(!Attached.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Attached));
    }

    #[test]
    fn new_job_is_claimable_immediately() {
        let job = make_job();
        assert!(job.is_claimable(Utc::now()));
        assert_eq!(job.retries(), 0);
    }

    #[test]
    fn rescheduled_job_waits_for_retry_time() {
        let now = Utc::now();
        let mut job = make_job();
        job.next_retry_at = Some(now + Duration::seconds(30));

        assert!(!job.is_claimable(now));
        assert!(job.is_claimable(now + Duration::seconds(31)));
    }

    #[test]
    fn in_flight_job_is_reclaimable_after_lease_expiry() {
        let now = Utc::now();
        let mut job = make_job();
        job.state = JobState::Fetching;
        job.lease = Some(Lease {
            worker: "w-1".to_string(),
            expires_at: now + Duration::seconds(60),
        });

        assert!(!job.is_claimable(now));
        assert!(job.is_leased_to("w-1"));
        assert!(!job.is_leased_to("w-2"));
        assert!(job.is_claimable(now + Duration::seconds(61)));
    }

    #[test]
    fn terminal_jobs_are_never_claimable() {
        let mut job = make_job();
        job.state = JobState::Failed;
        assert!(!job.is_claimable(Utc::now()));
    }
}
