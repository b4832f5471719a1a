// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{RetryPolicy, deadline};
use crate::config::PipelineOptions;
use crate::error::{JobFailure, RepositoryError};
use crate::feed::FeedPublisher;
use crate::fetch::{FetchContext, MediaFetcher, object_key};
use crate::model::{AudioArtifact, Episode, IngestionJob, JobId, JobState};
use crate::progress::{ProgressEvent, SharedProgressReporter};
use crate::repo::{Claim, Repository};
use crate::store::ArtifactStore;

/// Shortest interval between lease renewals
const MIN_HEARTBEAT: Duration = Duration::from_millis(10);

/// How a processed job ended up
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Audio stored and attached; the episode is published
    Attached(Episode),
    /// A retryable failure sent the job back to the queue
    Rescheduled { retry_at: DateTime<Utc> },
    /// The job is terminally failed
    Failed(JobFailure),
}

/// Result of running one step while keeping the lease alive
enum Step<T> {
    Done(T),
    Cancelled,
}

/// Runs one ingestion job: fetch, store, attach, then refresh the feed
pub struct Ingestor {
    repo: Arc<dyn Repository>,
    fetcher: Arc<dyn MediaFetcher>,
    store: Arc<dyn ArtifactStore>,
    publisher: Arc<FeedPublisher>,
    reporter: SharedProgressReporter,
    retry: RetryPolicy,
    work_dir: PathBuf,
    lease_for: Duration,
}

impl Ingestor {
    pub fn new(
        repo: Arc<dyn Repository>,
        fetcher: Arc<dyn MediaFetcher>,
        store: Arc<dyn ArtifactStore>,
        publisher: Arc<FeedPublisher>,
        reporter: SharedProgressReporter,
        options: &PipelineOptions,
    ) -> Self {
        Self {
            repo,
            fetcher,
            store,
            publisher,
            reporter,
            retry: options.retry_policy(),
            work_dir: options.work_dir(),
            lease_for: options.visibility_timeout(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease_for
    }

    /// Drive a claimed job to `Attached`, a reschedule, or `Failed`.
    ///
    /// Errors are repository failures, including losing the lease to
    /// another worker; the job is then left to whoever holds it.
    pub async fn process(
        &self,
        claim: Claim,
        worker: &str,
        cancel: &CancellationToken,
    ) -> Result<Outcome, RepositoryError> {
        let job = claim.job;

        self.reporter.report(ProgressEvent::JobClaimed {
            worker: worker.to_string(),
            job_id: job.id,
            attempt: job.attempts,
            reclaimed: claim.reclaimed,
        });
        self.report_state(job.id, JobState::Fetching);

        // A job abandoned by crashed workers can exceed the ceiling on reclaim
        if job.attempts > self.retry.max_attempts {
            let failure = job.last_error.clone().unwrap_or_else(|| {
                JobFailure::consistency(format!(
                    "job abandoned after {} attempts",
                    job.attempts - 1
                ))
            });
            return self.fail(&job, worker, failure).await;
        }

        let episode = self.repo.get_episode(job.episode_id).await?;
        info!(job = %job.id, episode = %episode.id, attempt = job.attempts, "fetching {}", episode.source_url);

        let context = FetchContext {
            job_id: job.id,
            work_dir: self.work_dir.clone(),
            reporter: self.reporter.clone(),
        };
        let fetched = self
            .keep_leased(
                job.id,
                worker,
                cancel,
                self.fetcher.fetch(&episode.source_url, &context),
            )
            .await?;
        let media = match fetched {
            Step::Done(Ok(media)) => media,
            Step::Done(Err(e)) => return self.handle_failure(&job, worker, JobFailure::from(&e)).await,
            Step::Cancelled => return self.fail(&job, worker, JobFailure::cancelled()).await,
        };

        if cancel.is_cancelled() {
            return self.fail(&job, worker, JobFailure::cancelled()).await;
        }
        self.advance(job.id, worker, JobState::Transcoded).await?;

        if cancel.is_cancelled() {
            return self.fail(&job, worker, JobFailure::cancelled()).await;
        }
        self.advance(job.id, worker, JobState::Storing).await?;

        let key = object_key(&episode.source_url, &media.content_type);
        let stored = self
            .keep_leased(job.id, worker, cancel, self.store.put(&media, &key))
            .await?;
        let url = match stored {
            Step::Done(Ok(url)) => url,
            Step::Done(Err(e)) => return self.handle_failure(&job, worker, JobFailure::from(&e)).await,
            Step::Cancelled => return self.fail(&job, worker, JobFailure::cancelled()).await,
        };

        if cancel.is_cancelled() {
            return self.fail(&job, worker, JobFailure::cancelled()).await;
        }

        let artifact = AudioArtifact {
            key,
            url: url.clone(),
            size: media.size,
            content_type: media.content_type.clone(),
            checksum: media.checksum.clone(),
            duration_secs: media.duration_secs,
        };
        drop(media);

        let episode = match self
            .repo
            .attach_artifact(job.id, worker, artifact, Utc::now())
            .await
        {
            Ok((_, episode)) => episode,
            Err(e @ RepositoryError::InvalidEpisodeTransition { .. }) => {
                error!(job = %job.id, "cannot attach audio: {}", e);
                return self.fail(&job, worker, JobFailure::from(&e)).await;
            }
            Err(e) => return Err(e),
        };

        info!(job = %job.id, episode = %episode.id, "attached {}", url);
        self.report_state(job.id, JobState::Attached);
        self.reporter.report(ProgressEvent::JobAttached {
            job_id: job.id,
            episode_id: episode.id,
            audio_url: url,
        });

        // The episode is durably published; a failed render is retried on the next change
        if let Err(e) = self.publisher.invalidate(episode.podcast_id).await {
            error!(podcast = %episode.podcast_id, "failed to refresh feed: {}", e);
        }

        Ok(Outcome::Attached(episode))
    }

    /// Reschedule a retryable failure while attempts remain, otherwise fail
    async fn handle_failure(
        &self,
        job: &IngestionJob,
        worker: &str,
        failure: JobFailure,
    ) -> Result<Outcome, RepositoryError> {
        if !failure.is_retryable() || !self.retry.allows_another(job.attempts) {
            return self.fail(job, worker, failure).await;
        }

        let delay = self.retry.delay_for(job.attempts);
        let now = Utc::now();
        let retry_at = deadline(now, delay);

        self.repo
            .reschedule_job(job.id, worker, failure.clone(), retry_at, now)
            .await?;

        warn!(
            job = %job.id,
            attempt = job.attempts,
            max_attempts = self.retry.max_attempts,
            "retrying in {:?}: {}",
            delay,
            failure
        );
        self.report_state(job.id, JobState::Pending);
        self.reporter.report(ProgressEvent::RetryScheduled {
            job_id: job.id,
            attempt: job.attempts,
            delay,
            error: failure.message,
        });

        Ok(Outcome::Rescheduled { retry_at })
    }

    async fn fail(
        &self,
        job: &IngestionJob,
        worker: &str,
        failure: JobFailure,
    ) -> Result<Outcome, RepositoryError> {
        self.repo
            .fail_job(job.id, Some(worker), failure.clone(), Utc::now())
            .await?;

        warn!(job = %job.id, attempts = job.attempts, "job failed: {}", failure);
        self.report_state(job.id, JobState::Failed);
        self.reporter.report(ProgressEvent::JobFailed {
            job_id: job.id,
            error: failure.to_string(),
        });

        Ok(Outcome::Failed(failure))
    }

    async fn advance(
        &self,
        job: JobId,
        worker: &str,
        next: JobState,
    ) -> Result<(), RepositoryError> {
        self.repo.advance_job(job, worker, next, Utc::now()).await?;
        self.report_state(job, next);
        Ok(())
    }

    /// Run `step` to completion, renewing the lease while it is in flight.
    ///
    /// Cancellation drops the step, which interrupts it.
    async fn keep_leased<F, T>(
        &self,
        job: JobId,
        worker: &str,
        cancel: &CancellationToken,
        step: F,
    ) -> Result<Step<T>, RepositoryError>
    where
        F: Future<Output = T>,
    {
        tokio::pin!(step);
        let mut heartbeat = tokio::time::interval((self.lease_for / 3).max(MIN_HEARTBEAT));
        heartbeat.tick().await;

        loop {
            tokio::select! {
                output = &mut step => return Ok(Step::Done(output)),
                _ = cancel.cancelled() => return Ok(Step::Cancelled),
                _ = heartbeat.tick() => {
                    match self.repo.renew_lease(job, worker, Utc::now(), self.lease_for).await {
                        Ok(_) => {}
                        Err(e @ RepositoryError::LeaseLost { .. }) => return Err(e),
                        Err(e) => warn!(job = %job, "failed to renew lease: {}", e),
                    }
                }
            }
        }
    }

    fn report_state(&self, job_id: JobId, state: JobState) {
        self.reporter.report(ProgressEvent::JobStateChanged { job_id, state });
    }
}
