// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, warn};

use super::{Archived, Claim, Repository};
use crate::error::{JobFailure, RepositoryError};
use crate::job::deadline;
use crate::model::{
    AudioArtifact, Episode, EpisodeEdit, EpisodeId, EpisodeState, IngestionJob, JobId, JobState,
    Lease, Podcast, PodcastId,
};

const PODCASTS_DIR: &str = "podcasts";
const EPISODES_DIR: &str = "episodes";
const JOBS_DIR: &str = "jobs";
const LOCK_FILE: &str = ".lock";

#[derive(Debug, Clone, Copy)]
enum LockMode {
    Shared,
    Exclusive,
}

/// Advisory lock on the repository's lock file, released on drop
struct DirLock {
    _file: File,
}

impl DirLock {
    /// Block until the lock is held.
    ///
    /// Every acquisition opens its own file description, so handles in the
    /// same process exclude each other just like separate processes do.
    fn acquire(path: &Path, mode: LockMode) -> Result<Self, RepositoryError> {
        let lock_failed = |e| RepositoryError::LockFailed {
            path: path.to_path_buf(),
            source: e,
        };

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(lock_failed)?;
        match mode {
            LockMode::Shared => file.lock_shared(),
            LockMode::Exclusive => file.lock(),
        }
        .map_err(lock_failed)?;

        Ok(Self { _file: file })
    }
}

/// Repository keeping one JSON file per record below a data directory.
///
/// Disk is the only copy of the data. Reads run under a shared lock on
/// `<root>/.lock` and mutations under an exclusive one, re-reading the
/// records they check before writing them. Several handles, in one process
/// or many, can therefore share a data directory.
pub struct FileRepository {
    root: PathBuf,
    partial_files_cleaned: usize,
}

impl FileRepository {
    /// Open the repository at `root`, creating its directories if needed.
    ///
    /// Leftover `.partial` files from interrupted writes are removed.
    pub fn open(root: &Path) -> Result<Self, RepositoryError> {
        for dir in [PODCASTS_DIR, EPISODES_DIR, JOBS_DIR] {
            let dir = root.join(dir);
            std::fs::create_dir_all(&dir).map_err(|e| RepositoryError::WriteFailed {
                path: dir.clone(),
                source: e,
            })?;
        }

        let _lock = DirLock::acquire(&root.join(LOCK_FILE), LockMode::Exclusive)?;
        let mut cleaned = 0;
        for dir in [PODCASTS_DIR, EPISODES_DIR, JOBS_DIR] {
            cleaned += remove_partial_files(&root.join(dir))?;
        }

        info!(
            partial_files_cleaned = cleaned,
            "opened repository at {}",
            root.display()
        );

        Ok(Self {
            root: root.to_path_buf(),
            partial_files_cleaned: cleaned,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of interrupted writes removed by [`FileRepository::open`]
    pub fn partial_files_cleaned(&self) -> usize {
        self.partial_files_cleaned
    }

    async fn lock(&self, mode: LockMode) -> Result<DirLock, RepositoryError> {
        let path = self.root.join(LOCK_FILE);
        let lock_path = path.clone();
        tokio::task::spawn_blocking(move || DirLock::acquire(&lock_path, mode))
            .await
            .map_err(|e| RepositoryError::LockFailed {
                path,
                source: std::io::Error::other(e),
            })?
    }

    fn podcast_path(&self, id: PodcastId) -> PathBuf {
        self.root.join(PODCASTS_DIR).join(format!("{}.json", id))
    }

    fn episode_path(&self, id: EpisodeId) -> PathBuf {
        self.root.join(EPISODES_DIR).join(format!("{}.json", id))
    }

    fn job_path(&self, id: JobId) -> PathBuf {
        self.root.join(JOBS_DIR).join(format!("{}.json", id))
    }

    async fn load_podcast(&self, id: PodcastId) -> Result<Podcast, RepositoryError> {
        read_record(&self.podcast_path(id))
            .await?
            .ok_or(RepositoryError::PodcastNotFound(id))
    }

    async fn load_episode(&self, id: EpisodeId) -> Result<Episode, RepositoryError> {
        read_record(&self.episode_path(id))
            .await?
            .ok_or(RepositoryError::EpisodeNotFound(id))
    }

    async fn load_job(&self, id: JobId) -> Result<IngestionJob, RepositoryError> {
        read_record(&self.job_path(id))
            .await?
            .ok_or(RepositoryError::JobNotFound(id))
    }

    async fn load_jobs(&self) -> Result<Vec<IngestionJob>, RepositoryError> {
        read_records(&self.root.join(JOBS_DIR)).await
    }

    async fn find_active_job(
        &self,
        episode: EpisodeId,
    ) -> Result<Option<IngestionJob>, RepositoryError> {
        Ok(self
            .load_jobs()
            .await?
            .into_iter()
            .find(|job| job.episode_id == episode && !job.state.is_terminal()))
    }

    async fn save_podcast(&self, podcast: &Podcast) -> Result<(), RepositoryError> {
        write_record(&self.podcast_path(podcast.id), podcast).await
    }

    async fn save_episode(&self, episode: &Episode) -> Result<(), RepositoryError> {
        write_record(&self.episode_path(episode.id), episode).await
    }

    async fn save_job(&self, job: &IngestionJob) -> Result<(), RepositoryError> {
        write_record(&self.job_path(job.id), job).await
    }

    /// Write an episode and then its job.
    ///
    /// If the job write fails the episode file is put back to `previous`, so
    /// neither record changes.
    async fn save_episode_then_job(
        &self,
        episode: &Episode,
        previous: &Episode,
        job: &IngestionJob,
    ) -> Result<(), RepositoryError> {
        self.save_episode(episode).await?;

        if let Err(e) = self.save_job(job).await {
            if let Err(restore) = self.save_episode(previous).await {
                error!(
                    episode = %episode.id,
                    job = %job.id,
                    "failed to restore episode after job write failed: {}",
                    restore
                );
            }
            return Err(e);
        }

        Ok(())
    }
}

#[async_trait]
impl Repository for FileRepository {
    async fn insert_podcast(&self, podcast: Podcast) -> Result<Podcast, RepositoryError> {
        let _lock = self.lock(LockMode::Exclusive).await?;
        self.save_podcast(&podcast).await?;
        Ok(podcast)
    }

    async fn get_podcast(&self, id: PodcastId) -> Result<Podcast, RepositoryError> {
        let _lock = self.lock(LockMode::Shared).await?;
        self.load_podcast(id).await
    }

    async fn list_podcasts(&self) -> Result<Vec<Podcast>, RepositoryError> {
        let _lock = self.lock(LockMode::Shared).await?;
        let mut podcasts: Vec<Podcast> = read_records(&self.root.join(PODCASTS_DIR)).await?;
        podcasts.sort_by_key(|p| (p.created_at, p.id));
        Ok(podcasts)
    }

    async fn insert_episode(&self, episode: Episode) -> Result<Episode, RepositoryError> {
        let _lock = self.lock(LockMode::Exclusive).await?;
        self.load_podcast(episode.podcast_id).await?;

        self.save_episode(&episode).await?;
        Ok(episode)
    }

    async fn get_episode(&self, id: EpisodeId) -> Result<Episode, RepositoryError> {
        let _lock = self.lock(LockMode::Shared).await?;
        self.load_episode(id).await
    }

    async fn list_episodes(&self, podcast: PodcastId) -> Result<Vec<Episode>, RepositoryError> {
        let _lock = self.lock(LockMode::Shared).await?;
        self.load_podcast(podcast).await?;

        let mut episodes: Vec<Episode> = read_records::<Episode>(&self.root.join(EPISODES_DIR))
            .await?
            .into_iter()
            .filter(|e| e.podcast_id == podcast)
            .collect();
        episodes.sort_by_key(|e| (e.created_at, e.id));
        Ok(episodes)
    }

    async fn edit_episode(
        &self,
        id: EpisodeId,
        edit: &EpisodeEdit,
        now: DateTime<Utc>,
    ) -> Result<Episode, RepositoryError> {
        let _lock = self.lock(LockMode::Exclusive).await?;
        let mut episode = self.load_episode(id).await?;

        episode.apply_edit(edit, now);

        self.save_episode(&episode).await?;
        Ok(episode)
    }

    async fn archive_episode(
        &self,
        id: EpisodeId,
        now: DateTime<Utc>,
    ) -> Result<Archived, RepositoryError> {
        let _lock = self.lock(LockMode::Exclusive).await?;
        let previous = self.load_episode(id).await?;
        let mut episode = previous.clone();

        transition_episode(&mut episode, EpisodeState::Archived, now)?;

        let cancelled = self.find_active_job(id).await?.map(|mut job| {
            job.state = JobState::Failed;
            job.last_error = Some(JobFailure::cancelled());
            job.lease = None;
            job.next_retry_at = None;
            job.updated_at = now;
            job.finished_at = Some(now);
            job
        });

        match &cancelled {
            Some(job) => self.save_episode_then_job(&episode, &previous, job).await?,
            None => self.save_episode(&episode).await?,
        }

        info!(episode = %id, from = %previous.state, "archived episode");

        Ok(Archived {
            episode,
            previous_state: previous.state,
            cancelled_job: cancelled.map(|job| job.id),
        })
    }

    async fn open_job(
        &self,
        episode_id: EpisodeId,
        now: DateTime<Utc>,
    ) -> Result<IngestionJob, RepositoryError> {
        let _lock = self.lock(LockMode::Exclusive).await?;
        let previous = self.load_episode(episode_id).await?;
        let mut episode = previous.clone();

        if let Some(active) = self.find_active_job(episode_id).await? {
            return Err(RepositoryError::ActiveJobExists {
                episode: episode_id,
                job: active.id,
            });
        }

        match episode.state {
            EpisodeState::Pending => {}
            EpisodeState::Failed => transition_episode(&mut episode, EpisodeState::Pending, now)?,
            from => {
                return Err(RepositoryError::InvalidEpisodeTransition {
                    episode: episode_id,
                    from,
                    to: EpisodeState::Pending,
                });
            }
        }

        let job = IngestionJob::new(episode_id, episode.podcast_id, now);

        self.save_episode_then_job(&episode, &previous, &job).await?;
        Ok(job)
    }

    async fn get_job(&self, id: JobId) -> Result<IngestionJob, RepositoryError> {
        let _lock = self.lock(LockMode::Shared).await?;
        self.load_job(id).await
    }

    async fn list_jobs(&self) -> Result<Vec<IngestionJob>, RepositoryError> {
        let _lock = self.lock(LockMode::Shared).await?;
        let mut jobs = self.load_jobs().await?;
        jobs.sort_by_key(|j| (j.created_at, j.id));
        Ok(jobs)
    }

    async fn active_job(
        &self,
        episode: EpisodeId,
    ) -> Result<Option<IngestionJob>, RepositoryError> {
        let _lock = self.lock(LockMode::Shared).await?;
        self.find_active_job(episode).await
    }

    async fn claim_job(
        &self,
        worker: &str,
        now: DateTime<Utc>,
        lease_for: Duration,
    ) -> Result<Option<Claim>, RepositoryError> {
        let _lock = self.lock(LockMode::Exclusive).await?;

        let mut candidates: Vec<IngestionJob> = self
            .load_jobs()
            .await?
            .into_iter()
            .filter(|job| job.is_claimable(now))
            .collect();
        candidates.sort_by_key(|job| {
            (
                job.next_retry_at.unwrap_or(job.created_at),
                job.created_at,
                job.id,
            )
        });

        for mut job in candidates {
            let job_id = job.id;
            let episode = read_record::<Episode>(&self.episode_path(job.episode_id)).await?;

            let previous = match episode {
                Some(episode)
                    if matches!(
                        episode.state,
                        EpisodeState::Pending | EpisodeState::Downloading
                    ) =>
                {
                    episode
                }
                other => {
                    let reason = match other {
                        Some(episode) => format!("episode {} is {}", episode.id, episode.state),
                        None => format!("episode {} is missing", job.episode_id),
                    };
                    error!(job = %job_id, "claimable job has an inconsistent episode: {}", reason);

                    job.state = JobState::Failed;
                    job.last_error = Some(JobFailure::consistency(reason));
                    job.lease = None;
                    job.updated_at = now;
                    job.finished_at = Some(now);
                    self.save_job(&job).await?;
                    continue;
                }
            };

            let reclaimed = job.state.is_in_flight();
            if reclaimed {
                let holder = job.lease.as_ref().map(|l| l.worker.as_str()).unwrap_or("");
                warn!(job = %job_id, holder, worker, "reclaiming job with expired lease");
            }

            job.state = JobState::Fetching;
            job.attempts += 1;
            job.next_retry_at = None;
            job.lease = Some(Lease {
                worker: worker.to_string(),
                expires_at: deadline(now, lease_for),
            });
            job.updated_at = now;

            if previous.state == EpisodeState::Pending {
                let mut episode = previous.clone();
                transition_episode(&mut episode, EpisodeState::Downloading, now)?;
                self.save_episode_then_job(&episode, &previous, &job).await?;
            } else {
                self.save_job(&job).await?;
            }

            debug!(job = %job_id, worker, attempt = job.attempts, "claimed job");

            return Ok(Some(Claim { job, reclaimed }));
        }

        Ok(None)
    }

    async fn renew_lease(
        &self,
        job_id: JobId,
        worker: &str,
        now: DateTime<Utc>,
        lease_for: Duration,
    ) -> Result<IngestionJob, RepositoryError> {
        let _lock = self.lock(LockMode::Exclusive).await?;
        let mut job = self.load_job(job_id).await?;
        check_lease(&job, worker)?;

        job.lease = Some(Lease {
            worker: worker.to_string(),
            expires_at: deadline(now, lease_for),
        });

        self.save_job(&job).await?;
        Ok(job)
    }

    async fn advance_job(
        &self,
        job_id: JobId,
        worker: &str,
        next: JobState,
        now: DateTime<Utc>,
    ) -> Result<IngestionJob, RepositoryError> {
        let _lock = self.lock(LockMode::Exclusive).await?;
        let mut job = self.load_job(job_id).await?;
        check_lease(&job, worker)?;

        transition_job(&mut job, next, now)?;

        self.save_job(&job).await?;
        Ok(job)
    }

    async fn reschedule_job(
        &self,
        job_id: JobId,
        worker: &str,
        failure: JobFailure,
        retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<IngestionJob, RepositoryError> {
        let _lock = self.lock(LockMode::Exclusive).await?;
        let mut job = self.load_job(job_id).await?;
        check_lease(&job, worker)?;

        transition_job(&mut job, JobState::Pending, now)?;
        job.last_error = Some(failure);
        job.next_retry_at = Some(retry_at);
        job.lease = None;

        self.save_job(&job).await?;
        Ok(job)
    }

    async fn attach_artifact(
        &self,
        job_id: JobId,
        worker: &str,
        artifact: AudioArtifact,
        now: DateTime<Utc>,
    ) -> Result<(IngestionJob, Episode), RepositoryError> {
        let _lock = self.lock(LockMode::Exclusive).await?;
        let mut job = self.load_job(job_id).await?;
        check_lease(&job, worker)?;
        let previous = self.load_episode(job.episode_id).await?;
        let mut episode = previous.clone();

        transition_job(&mut job, JobState::Attached, now)?;
        transition_episode(&mut episode, EpisodeState::Published, now)?;

        episode.audio = Some(artifact);
        episode.published_at = Some(now);
        job.lease = None;
        job.next_retry_at = None;
        job.finished_at = Some(now);

        // Episode first: a job file saying Attached implies the audio is on disk
        self.save_episode_then_job(&episode, &previous, &job).await?;
        Ok((job, episode))
    }

    async fn fail_job(
        &self,
        job_id: JobId,
        worker: Option<&str>,
        failure: JobFailure,
        now: DateTime<Utc>,
    ) -> Result<IngestionJob, RepositoryError> {
        let _lock = self.lock(LockMode::Exclusive).await?;
        let mut job = self.load_job(job_id).await?;

        match worker {
            Some(worker) => check_lease(&job, worker)?,
            None => {
                if let Some(lease) = &job.lease
                    && !job.is_lease_expired(now)
                {
                    return Err(RepositoryError::JobLeased {
                        job: job_id,
                        worker: lease.worker.clone(),
                    });
                }
            }
        }

        transition_job(&mut job, JobState::Failed, now)?;
        job.last_error = Some(failure);
        job.lease = None;
        job.next_retry_at = None;
        job.finished_at = Some(now);

        let previous = self.load_episode(job.episode_id).await?;
        if previous.state.can_transition_to(EpisodeState::Failed) {
            let mut episode = previous.clone();
            transition_episode(&mut episode, EpisodeState::Failed, now)?;
            self.save_episode_then_job(&episode, &previous, &job).await?;
        } else {
            self.save_job(&job).await?;
        }

        Ok(job)
    }
}

fn check_lease(job: &IngestionJob, worker: &str) -> Result<(), RepositoryError> {
    if job.state.is_in_flight() && job.is_leased_to(worker) {
        Ok(())
    } else {
        Err(RepositoryError::LeaseLost {
            job: job.id,
            worker: worker.to_string(),
        })
    }
}

fn transition_job(
    job: &mut IngestionJob,
    next: JobState,
    now: DateTime<Utc>,
) -> Result<(), RepositoryError> {
    if !job.state.can_transition_to(next) {
        return Err(RepositoryError::InvalidJobTransition {
            job: job.id,
            from: job.state,
            to: next,
        });
    }
    job.state = next;
    job.updated_at = now;
    Ok(())
}

fn transition_episode(
    episode: &mut Episode,
    next: EpisodeState,
    now: DateTime<Utc>,
) -> Result<(), RepositoryError> {
    if !episode.state.can_transition_to(next) {
        return Err(RepositoryError::InvalidEpisodeTransition {
            episode: episode.id,
            from: episode.state,
            to: next,
        });
    }
    episode.state = next;
    episode.updated_at = now;
    Ok(())
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

/// Write a record as pretty JSON, atomically replacing any previous version
async fn write_record<T: Serialize>(path: &Path, record: &T) -> Result<(), RepositoryError> {
    let json = serde_json::to_string_pretty(record)?;
    let partial = partial_path(path);
    let write_failed = |e| RepositoryError::WriteFailed {
        path: path.to_path_buf(),
        source: e,
    };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(write_failed)?;
    }
    tokio::fs::write(&partial, json).await.map_err(write_failed)?;
    tokio::fs::rename(&partial, path)
        .await
        .map_err(write_failed)?;

    Ok(())
}

/// Read one record, `None` if its file does not exist
async fn read_record<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, RepositoryError> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(RepositoryError::ReadFailed {
                path: path.to_path_buf(),
                source: e,
            });
        }
    };

    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| RepositoryError::JsonParseFailed {
            path: path.to_path_buf(),
            source: e,
        })
}

/// Read every `.json` record in `dir`
async fn read_records<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>, RepositoryError> {
    let read_failed = |e| RepositoryError::ReadFailed {
        path: dir.to_path_buf(),
        source: e,
    };

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(read_failed(e)),
    };

    let mut records = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(read_failed)? {
        let path = entry.path();
        if path.extension().is_none_or(|ext| ext != "json") {
            continue;
        }
        // A record removed between listing and reading is skipped
        if let Some(record) = read_record(&path).await? {
            records.push(record);
        }
    }

    Ok(records)
}

/// Remove `.partial` leftovers in `dir`, returning how many were removed
fn remove_partial_files(dir: &Path) -> Result<usize, RepositoryError> {
    let read_failed = |e| RepositoryError::ReadFailed {
        path: dir.to_path_buf(),
        source: e,
    };

    let mut removed = 0;
    for entry in std::fs::read_dir(dir).map_err(read_failed)? {
        let path = entry.map_err(read_failed)?.path();
        let is_partial = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(".partial"));

        if is_partial && std::fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }

    Ok(removed)
}
