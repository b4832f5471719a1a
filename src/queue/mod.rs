// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

mod worker;

pub use worker::WorkerPool;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{JobFailure, QueueError, RepositoryError};
use crate::model::{EpisodeId, JobHandle, JobId, JobState, JobStatus};
use crate::progress::{ProgressEvent, SharedProgressReporter};
use crate::repo::{Claim, Repository};

/// Accepts ingestion requests and hands jobs to workers.
///
/// Job records live in the repository, so the at-most-one-active-job rule
/// and leases hold across processes sharing it. Cancellation tokens only
/// reach jobs running in this process.
pub struct JobQueue {
    repo: Arc<dyn Repository>,
    reporter: SharedProgressReporter,
    /// Wakes idle workers when a job is enqueued
    notify: Notify,
    running: RwLock<HashMap<JobId, CancellationToken>>,
}

impl JobQueue {
    pub fn new(repo: Arc<dyn Repository>, reporter: SharedProgressReporter) -> Self {
        Self {
            repo,
            reporter,
            notify: Notify::new(),
            running: RwLock::new(HashMap::new()),
        }
    }

    /// Queue an episode for ingestion.
    ///
    /// If the episode already has an active job, that job's handle is
    /// returned instead of starting a second one.
    pub async fn enqueue(&self, episode_id: EpisodeId) -> Result<JobHandle, QueueError> {
        match self.repo.open_job(episode_id, Utc::now()).await {
            Ok(job) => {
                info!(job = %job.id, episode = %episode_id, "enqueued ingestion job");
                self.reporter.report(ProgressEvent::JobEnqueued {
                    job_id: job.id,
                    episode_id,
                });
                self.notify.notify_one();
                Ok(job.handle())
            }
            Err(RepositoryError::ActiveJobExists { job, .. }) => {
                debug!(job = %job, episode = %episode_id, "coalesced with active job");
                self.reporter.report(ProgressEvent::JobCoalesced {
                    job_id: job,
                    episode_id,
                });
                Ok(JobHandle {
                    job_id: job,
                    episode_id,
                })
            }
            Err(RepositoryError::InvalidEpisodeTransition { from, .. }) => {
                Err(QueueError::NotIngestible {
                    episode: episode_id,
                    state: from,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn status(&self, handle: &JobHandle) -> Result<JobStatus, QueueError> {
        let job = self.get_job(handle.job_id).await?;
        Ok(JobStatus::from(&job))
    }

    /// Start a fresh job for the episode of a failed job
    pub async fn retry(&self, handle: &JobHandle) -> Result<JobHandle, QueueError> {
        let job = self.get_job(handle.job_id).await?;
        if job.state != JobState::Failed {
            return Err(QueueError::NotRetryable {
                job: job.id,
                state: job.state,
            });
        }

        info!(job = %job.id, episode = %job.episode_id, "manual retry");
        self.enqueue(job.episode_id).await
    }

    /// Cancel a job.
    ///
    /// A job waiting in the queue fails right away. A job running in this
    /// process is signalled and fails at its next step. Finished jobs are
    /// left as they are.
    pub async fn cancel(&self, handle: &JobHandle) -> Result<JobStatus, QueueError> {
        let job = self.get_job(handle.job_id).await?;
        if job.state.is_terminal() {
            return Ok(JobStatus::from(&job));
        }

        if let Some(token) = self.running.read().await.get(&job.id) {
            info!(job = %job.id, "signalling running job to cancel");
            token.cancel();
            return Ok(JobStatus::from(&job));
        }

        let failure = JobFailure::cancelled();
        let job = self
            .repo
            .fail_job(job.id, None, failure.clone(), Utc::now())
            .await?;

        info!(job = %job.id, "cancelled queued job");
        self.reporter.report(ProgressEvent::JobStateChanged {
            job_id: job.id,
            state: JobState::Failed,
        });
        self.reporter.report(ProgressEvent::JobFailed {
            job_id: job.id,
            error: failure.to_string(),
        });

        Ok(JobStatus::from(&job))
    }

    /// Signal a job running in this process without touching its record.
    ///
    /// Used after the job was already failed elsewhere, e.g. by archiving
    /// its episode.
    pub async fn interrupt(&self, job_id: JobId) -> bool {
        match self.running.read().await.get(&job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether any job has yet to reach a terminal state
    pub async fn has_unfinished(&self) -> Result<bool, QueueError> {
        let jobs = self.repo.list_jobs().await?;
        Ok(jobs.iter().any(|job| !job.state.is_terminal()))
    }

    /// Lease the next claimable job to `worker`, with a token to cancel it
    pub(crate) async fn claim(
        &self,
        worker: &str,
        lease_for: Duration,
    ) -> Result<Option<(Claim, CancellationToken)>, QueueError> {
        let Some(claim) = self.repo.claim_job(worker, Utc::now(), lease_for).await? else {
            return Ok(None);
        };

        let token = CancellationToken::new();
        self.running.write().await.insert(claim.job.id, token.clone());
        Ok(Some((claim, token)))
    }

    /// Forget the cancellation token of a job this process stopped running
    pub(crate) async fn release(&self, job_id: JobId) {
        self.running.write().await.remove(&job_id);
    }

    /// Wait until a job is enqueued or `timeout` passes
    pub(crate) async fn wait_for_work(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
    }

    async fn get_job(&self, job_id: JobId) -> Result<crate::model::IngestionJob, QueueError> {
        match self.repo.get_job(job_id).await {
            Ok(job) => Ok(job),
            Err(RepositoryError::JobNotFound(id)) => Err(QueueError::JobNotFound(id)),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureCode;
    use crate::model::{Episode, EpisodeState, NewPodcast, Podcast};
    use crate::progress::NoopReporter;
    use crate::progress::testing::RecordingReporter;
    use crate::repo::FileRepository;
    use tempfile::{TempDir, tempdir};
    use url::Url;

    const LEASE: Duration = Duration::from_secs(60);

    async fn setup() -> (TempDir, Arc<FileRepository>, EpisodeId) {
        let dir = tempdir().unwrap();
        let repo = Arc::new(FileRepository::open(dir.path()).unwrap());
        let podcast = repo
            .insert_podcast(Podcast::create(
                NewPodcast {
                    name: "Show".to_string(),
                    owner: "alice".to_string(),
                    ..Default::default()
                },
                Utc::now(),
            ))
            .await
            .unwrap();
        let now = Utc::now();
        let episode = repo
            .insert_episode(Episode {
                id: EpisodeId::new(),
                podcast_id: podcast.id,
                title: "Episode".to_string(),
                description: None,
                author: None,
                image_url: None,
                source_url: Url::parse("https://host/ep1.mp3").unwrap(),
                audio: None,
                state: EpisodeState::Pending,
                created_at: now,
                updated_at: now,
                published_at: None,
            })
            .await
            .unwrap();
        (dir, repo, episode.id)
    }

    #[tokio::test]
    async fn enqueue_while_running_is_coalesced() {
        let (_dir, repo, episode) = setup().await;
        let reporter = Arc::new(RecordingReporter::default());
        let queue = JobQueue::new(repo.clone(), reporter.clone());

        let first = queue.enqueue(episode).await.unwrap();
        queue.claim("w-0", LEASE).await.unwrap().unwrap();
        let second = queue.enqueue(episode).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(repo.list_jobs().await.unwrap().len(), 1);
        assert!(reporter.events().iter().any(|event| matches!(
            event,
            ProgressEvent::JobCoalesced { job_id, .. } if *job_id == first.job_id
        )));
    }

    #[tokio::test]
    async fn status_reports_state_and_attempts() {
        let (_dir, repo, episode) = setup().await;
        let queue = JobQueue::new(repo, NoopReporter::shared());
        let handle = queue.enqueue(episode).await.unwrap();

        let pending = queue.status(&handle).await.unwrap();
        assert_eq!(pending.state, JobState::Pending);
        assert_eq!(pending.attempts, 0);

        queue.claim("w-0", LEASE).await.unwrap().unwrap();
        let running = queue.status(&handle).await.unwrap();
        assert_eq!(running.state, JobState::Fetching);
        assert_eq!(running.attempts, 1);
        assert_eq!(running.retries, 0);
    }

    #[tokio::test]
    async fn unknown_handle_is_not_found() {
        let (_dir, repo, episode) = setup().await;
        let queue = JobQueue::new(repo, NoopReporter::shared());

        let handle = JobHandle {
            job_id: JobId::new(),
            episode_id: episode,
        };

        assert!(matches!(
            queue.status(&handle).await,
            Err(QueueError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn cancelling_queued_job_fails_it_immediately() {
        let (_dir, repo, episode) = setup().await;
        let queue = JobQueue::new(repo.clone(), NoopReporter::shared());
        let handle = queue.enqueue(episode).await.unwrap();

        let status = queue.cancel(&handle).await.unwrap();

        assert_eq!(status.state, JobState::Failed);
        assert_eq!(status.last_error.unwrap().code, FailureCode::Cancelled);
        assert_eq!(
            repo.get_episode(episode).await.unwrap().state,
            EpisodeState::Failed
        );
        assert!(queue.claim("w-0", LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancelling_running_job_signals_its_token() {
        let (_dir, repo, episode) = setup().await;
        let queue = JobQueue::new(repo, NoopReporter::shared());
        let handle = queue.enqueue(episode).await.unwrap();
        let (_, token) = queue.claim("w-0", LEASE).await.unwrap().unwrap();

        let status = queue.cancel(&handle).await.unwrap();

        assert!(token.is_cancelled());
        assert_eq!(status.state, JobState::Fetching);
    }

    #[tokio::test]
    async fn interrupt_only_reaches_running_jobs() {
        let (_dir, repo, episode) = setup().await;
        let queue = JobQueue::new(repo, NoopReporter::shared());
        let handle = queue.enqueue(episode).await.unwrap();
        assert!(!queue.interrupt(handle.job_id).await);

        let (_, token) = queue.claim("w-0", LEASE).await.unwrap().unwrap();
        assert!(queue.interrupt(handle.job_id).await);
        assert!(token.is_cancelled());

        queue.release(handle.job_id).await;
        assert!(!queue.interrupt(handle.job_id).await);
    }

    #[tokio::test]
    async fn retry_requires_failed_job_and_starts_new_one() {
        let (_dir, repo, episode) = setup().await;
        let queue = JobQueue::new(repo, NoopReporter::shared());
        let handle = queue.enqueue(episode).await.unwrap();

        assert!(matches!(
            queue.retry(&handle).await,
            Err(QueueError::NotRetryable {
                state: JobState::Pending,
                ..
            })
        ));

        queue.cancel(&handle).await.unwrap();
        let retried = queue.retry(&handle).await.unwrap();

        assert_ne!(retried.job_id, handle.job_id);
        assert_eq!(retried.episode_id, episode);
        assert_eq!(queue.status(&retried).await.unwrap().state, JobState::Pending);
    }

    #[tokio::test]
    async fn archived_episode_is_not_ingestible() {
        let (_dir, repo, episode) = setup().await;
        repo.archive_episode(episode, Utc::now()).await.unwrap();
        let queue = JobQueue::new(repo, NoopReporter::shared());

        assert!(matches!(
            queue.enqueue(episode).await,
            Err(QueueError::NotIngestible {
                state: EpisodeState::Archived,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn unfinished_tracks_non_terminal_jobs() {
        let (_dir, repo, episode) = setup().await;
        let queue = JobQueue::new(repo, NoopReporter::shared());
        assert!(!queue.has_unfinished().await.unwrap());

        let handle = queue.enqueue(episode).await.unwrap();
        assert!(queue.has_unfinished().await.unwrap());

        queue.cancel(&handle).await.unwrap();
        assert!(!queue.has_unfinished().await.unwrap());
    }
}
