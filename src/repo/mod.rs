// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

mod file;

pub use file::FileRepository;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{JobFailure, RepositoryError};
use crate::model::{
    AudioArtifact, Episode, EpisodeEdit, EpisodeId, EpisodeState, IngestionJob, JobId, JobState,
    Podcast, PodcastId,
};

/// A job handed to a worker by [`Repository::claim_job`]
#[derive(Debug, Clone)]
pub struct Claim {
    pub job: IngestionJob,
    /// The previous holder's lease ran out before it finished
    pub reclaimed: bool,
}

/// Result of archiving an episode
#[derive(Debug, Clone)]
pub struct Archived {
    pub episode: Episode,
    pub previous_state: EpisodeState,
    /// Active job that was failed because its episode went away
    pub cancelled_job: Option<JobId>,
}

/// Durable record of podcasts, episodes and ingestion jobs.
///
/// Job and audio mutations are the only writers of an episode's audio and
/// state fields. Every job mutation that takes a `worker` requires that
/// worker to hold the job's lease and fails with
/// [`RepositoryError::LeaseLost`] otherwise.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn insert_podcast(&self, podcast: Podcast) -> Result<Podcast, RepositoryError>;

    async fn get_podcast(&self, id: PodcastId) -> Result<Podcast, RepositoryError>;

    async fn list_podcasts(&self) -> Result<Vec<Podcast>, RepositoryError>;

    /// Store a new episode; its podcast must exist
    async fn insert_episode(&self, episode: Episode) -> Result<Episode, RepositoryError>;

    async fn get_episode(&self, id: EpisodeId) -> Result<Episode, RepositoryError>;

    /// All episodes of a podcast, archived ones included
    async fn list_episodes(&self, podcast: PodcastId) -> Result<Vec<Episode>, RepositoryError>;

    /// Apply a metadata edit, never touching audio or state
    async fn edit_episode(
        &self,
        id: EpisodeId,
        edit: &EpisodeEdit,
        now: DateTime<Utc>,
    ) -> Result<Episode, RepositoryError>;

    /// Soft-delete an episode, failing any active job for it
    async fn archive_episode(
        &self,
        id: EpisodeId,
        now: DateTime<Utc>,
    ) -> Result<Archived, RepositoryError>;

    /// Create a pending job for an episode.
    ///
    /// Fails with [`RepositoryError::ActiveJobExists`] if the episode already
    /// has a non-terminal job. A failed episode moves back to `Pending`.
    async fn open_job(
        &self,
        episode: EpisodeId,
        now: DateTime<Utc>,
    ) -> Result<IngestionJob, RepositoryError>;

    async fn get_job(&self, id: JobId) -> Result<IngestionJob, RepositoryError>;

    async fn list_jobs(&self) -> Result<Vec<IngestionJob>, RepositoryError>;

    /// The non-terminal job of an episode, if any
    async fn active_job(&self, episode: EpisodeId)
    -> Result<Option<IngestionJob>, RepositoryError>;

    /// Lease the oldest claimable job to `worker` and move it to `Fetching`
    async fn claim_job(
        &self,
        worker: &str,
        now: DateTime<Utc>,
        lease_for: Duration,
    ) -> Result<Option<Claim>, RepositoryError>;

    async fn renew_lease(
        &self,
        job: JobId,
        worker: &str,
        now: DateTime<Utc>,
        lease_for: Duration,
    ) -> Result<IngestionJob, RepositoryError>;

    /// Move a leased job along its state machine
    async fn advance_job(
        &self,
        job: JobId,
        worker: &str,
        next: JobState,
        now: DateTime<Utc>,
    ) -> Result<IngestionJob, RepositoryError>;

    /// Return a leased job to `Pending` until `retry_at`
    async fn reschedule_job(
        &self,
        job: JobId,
        worker: &str,
        failure: JobFailure,
        retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<IngestionJob, RepositoryError>;

    /// Attach stored audio and publish the episode, finishing the job.
    ///
    /// Both records change together: no reader sees an `Attached` job whose
    /// episode lacks its audio.
    async fn attach_artifact(
        &self,
        job: JobId,
        worker: &str,
        artifact: AudioArtifact,
        now: DateTime<Utc>,
    ) -> Result<(IngestionJob, Episode), RepositoryError>;

    /// Fail a job and its episode.
    ///
    /// Without a `worker` only a job nobody holds may be failed.
    async fn fail_job(
        &self,
        job: JobId,
        worker: Option<&str>,
        failure: JobFailure,
        now: DateTime<Utc>,
    ) -> Result<IngestionJob, RepositoryError>;
}
