// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info};
use url::Url;

use crate::error::{RepositoryError, ServiceError, ValidationError};
use crate::feed::{FeedPublisher, RenderedFeed};
use crate::model::{
    Episode, EpisodeEdit, EpisodeId, EpisodeState, JobHandle, JobId, JobStatus, NewPodcast,
    Podcast, PodcastId,
};
use crate::queue::JobQueue;
use crate::repo::{Archived, Repository};

/// Longest accepted episode title, in characters
pub const MAX_TITLE_LENGTH: usize = 256;

/// A request to ingest a new episode
#[derive(Debug, Clone, Default)]
pub struct IngestionRequest {
    pub podcast_id: PodcastId,
    pub title: String,
    pub description: Option<String>,
    pub author: Option<String>,
    pub image_url: Option<String>,
    /// Where the media is fetched from (http or https)
    pub source: String,
}

/// Entry point for the API layer: podcasts, episodes, jobs and feeds
pub struct PodcastService {
    repo: Arc<dyn Repository>,
    queue: Arc<JobQueue>,
    publisher: Arc<FeedPublisher>,
}

impl PodcastService {
    pub fn new(
        repo: Arc<dyn Repository>,
        queue: Arc<JobQueue>,
        publisher: Arc<FeedPublisher>,
    ) -> Self {
        Self {
            repo,
            queue,
            publisher,
        }
    }

    /// Create a podcast and publish its (empty) feed
    pub async fn create_podcast(&self, mut new: NewPodcast) -> Result<Podcast, ServiceError> {
        new.name = new.name.trim().to_string();
        if new.name.is_empty() {
            return Err(ValidationError::EmptyName.into());
        }

        let podcast = self
            .repo
            .insert_podcast(Podcast::create(new, Utc::now()))
            .await?;
        info!(podcast = %podcast.id, publish_id = %podcast.publish_id, "created podcast");

        self.publisher.invalidate(podcast.id).await?;
        Ok(podcast)
    }

    pub async fn podcasts(&self) -> Result<Vec<Podcast>, ServiceError> {
        Ok(self.repo.list_podcasts().await?)
    }

    pub async fn episodes(&self, podcast: PodcastId) -> Result<Vec<Episode>, ServiceError> {
        self.podcast(podcast).await?;
        Ok(self.repo.list_episodes(podcast).await?)
    }

    /// Validate a request, store the episode and queue its ingestion.
    ///
    /// Nothing is persisted when validation fails.
    pub async fn submit(&self, request: IngestionRequest) -> Result<JobHandle, ServiceError> {
        let podcast = self.podcast(request.podcast_id).await?;
        let title = validate_title(&request.title)?;
        let source_url = parse_http_url(&request.source)?;
        let image_url = request.image_url.as_deref().map(parse_url).transpose()?;

        let now = Utc::now();
        let episode = self
            .repo
            .insert_episode(Episode {
                id: EpisodeId::new(),
                podcast_id: podcast.id,
                title,
                description: request.description.filter(|s| !s.trim().is_empty()),
                author: request.author.filter(|s| !s.trim().is_empty()),
                image_url,
                source_url,
                audio: None,
                state: EpisodeState::Pending,
                created_at: now,
                updated_at: now,
                published_at: None,
            })
            .await?;

        Ok(self.queue.enqueue(episode.id).await?)
    }

    /// Queue another ingestion of an existing episode
    pub async fn reingest(&self, episode: EpisodeId) -> Result<JobHandle, ServiceError> {
        Ok(self.queue.enqueue(episode).await?)
    }

    /// Edit episode metadata, refreshing the feed if the episode is listed
    pub async fn edit_episode(
        &self,
        id: EpisodeId,
        mut edit: EpisodeEdit,
    ) -> Result<Episode, ServiceError> {
        if let Some(title) = &edit.title {
            edit.title = Some(validate_title(title)?);
        }

        let episode = self.repo.edit_episode(id, &edit, Utc::now()).await?;
        if episode.state == EpisodeState::Published {
            self.publisher.invalidate(episode.podcast_id).await?;
        }

        Ok(episode)
    }

    /// Soft-delete an episode.
    ///
    /// An active job is failed as cancelled; a published episode drops out
    /// of the feed.
    pub async fn delete_episode(&self, id: EpisodeId) -> Result<Archived, ServiceError> {
        let archived = self.repo.archive_episode(id, Utc::now()).await?;

        if let Some(job) = archived.cancelled_job
            && self.queue.interrupt(job).await
        {
            info!(job = %job, episode = %id, "interrupted job of deleted episode");
        }

        if archived.previous_state == EpisodeState::Published
            && let Err(e) = self.publisher.invalidate(archived.episode.podcast_id).await
        {
            error!(episode = %id, "feed not regenerated after delete: {}", e);
            return Err(e.into());
        }

        Ok(archived)
    }

    /// The feed currently served for a podcast, rendering it on first use
    pub async fn feed(&self, podcast: PodcastId) -> Result<Arc<RenderedFeed>, ServiceError> {
        self.podcast(podcast).await?;
        if let Some(feed) = self.publisher.current(podcast).await {
            return Ok(feed);
        }
        Ok(self.publisher.invalidate(podcast).await?)
    }

    /// Re-render every podcast's feed
    pub async fn regenerate_feeds(&self) -> Result<Vec<Arc<RenderedFeed>>, ServiceError> {
        Ok(self.publisher.invalidate_all().await?)
    }

    /// Look up the handle of a job by its id
    pub async fn handle(&self, job: JobId) -> Result<JobHandle, ServiceError> {
        match self.repo.get_job(job).await {
            Ok(job) => Ok(job.handle()),
            Err(RepositoryError::JobNotFound(id)) => {
                Err(crate::error::QueueError::JobNotFound(id).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn status(&self, handle: &JobHandle) -> Result<JobStatus, ServiceError> {
        Ok(self.queue.status(handle).await?)
    }

    pub async fn retry(&self, handle: &JobHandle) -> Result<JobHandle, ServiceError> {
        Ok(self.queue.retry(handle).await?)
    }

    pub async fn cancel(&self, handle: &JobHandle) -> Result<JobStatus, ServiceError> {
        Ok(self.queue.cancel(handle).await?)
    }

    async fn podcast(&self, id: PodcastId) -> Result<Podcast, ServiceError> {
        match self.repo.get_podcast(id).await {
            Ok(podcast) => Ok(podcast),
            Err(RepositoryError::PodcastNotFound(id)) => {
                Err(ValidationError::UnknownPodcast(id).into())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Trim a title and check its length
pub fn validate_title(title: &str) -> Result<String, ValidationError> {
    let title = title.trim();
    if title.is_empty() {
        return Err(ValidationError::EmptyTitle);
    }

    let len = title.chars().count();
    if len > MAX_TITLE_LENGTH {
        return Err(ValidationError::TitleTooLong {
            len,
            max: MAX_TITLE_LENGTH,
        });
    }

    Ok(title.to_string())
}

fn parse_url(value: &str) -> Result<Url, ValidationError> {
    Url::parse(value.trim()).map_err(|e| ValidationError::InvalidUrl {
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// Parse an absolute http or https URL with a host
pub fn parse_http_url(value: &str) -> Result<Url, ValidationError> {
    let url = parse_url(value)?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(ValidationError::UnsupportedScheme {
            value: value.to_string(),
            scheme: url.scheme().to_string(),
        });
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(ValidationError::InvalidUrl {
            value: value.to_string(),
            reason: "missing host".to_string(),
        });
    }

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeedSettings;
    use crate::error::{FailureCode, QueueError};
    use crate::model::{AudioArtifact, JobState};
    use crate::progress::NoopReporter;
    use crate::repo::FileRepository;
    use tempfile::{TempDir, tempdir};

    struct Harness {
        _dir: TempDir,
        repo: Arc<FileRepository>,
        publisher: Arc<FeedPublisher>,
        service: PodcastService,
    }

    impl Harness {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let repo = Arc::new(FileRepository::open(&dir.path().join("data")).unwrap());
            let publisher = Arc::new(FeedPublisher::new(
                repo.clone(),
                FeedSettings::default(),
                NoopReporter::shared(),
            ));
            let queue = Arc::new(JobQueue::new(repo.clone(), NoopReporter::shared()));
            let service = PodcastService::new(repo.clone(), queue, publisher.clone());

            Self {
                _dir: dir,
                repo,
                publisher,
                service,
            }
        }

        async fn podcast(&self) -> Podcast {
            self.service
                .create_podcast(NewPodcast {
                    name: "Show".to_string(),
                    owner: "alice".to_string(),
                    ..Default::default()
                })
                .await
                .unwrap()
        }

        /// Insert an episode that already went through ingestion
        async fn published(&self, podcast: &Podcast, title: &str) -> Episode {
            let now = Utc::now();
            self.repo
                .insert_episode(Episode {
                    id: EpisodeId::new(),
                    podcast_id: podcast.id,
                    title: title.to_string(),
                    description: None,
                    author: None,
                    image_url: None,
                    source_url: Url::parse("https://host/ep.mp3").unwrap(),
                    audio: Some(AudioArtifact {
                        key: "audio/ep.mp3".to_string(),
                        url: Url::parse("https://cdn/ep.mp3").unwrap(),
                        size: 100,
                        content_type: "audio/mpeg".to_string(),
                        checksum: "sha256:00".to_string(),
                        duration_secs: Some(60),
                    }),
                    state: EpisodeState::Published,
                    created_at: now,
                    updated_at: now,
                    published_at: Some(now),
                })
                .await
                .unwrap()
        }
    }

    fn request(podcast: &Podcast, title: &str, source: &str) -> IngestionRequest {
        IngestionRequest {
            podcast_id: podcast.id,
            title: title.to_string(),
            source: source.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn titles_are_trimmed_and_bounded() {
        assert_eq!(validate_title("  Pilot  ").unwrap(), "Pilot");
        assert_eq!(validate_title("   "), Err(ValidationError::EmptyTitle));
        assert!(validate_title(&"é".repeat(MAX_TITLE_LENGTH)).is_ok());
        assert_eq!(
            validate_title(&"a".repeat(MAX_TITLE_LENGTH + 1)),
            Err(ValidationError::TitleTooLong {
                len: MAX_TITLE_LENGTH + 1,
                max: MAX_TITLE_LENGTH
            })
        );
    }

    #[test]
    fn only_http_sources_are_accepted() {
        assert!(parse_http_url("https://host/ep1.mp3").is_ok());
        assert!(parse_http_url("http://host/ep1.mp3").is_ok());
        assert!(matches!(
            parse_http_url("ftp://host/ep1.mp3"),
            Err(ValidationError::UnsupportedScheme { .. })
        ));
        assert!(matches!(
            parse_http_url("not a url"),
            Err(ValidationError::InvalidUrl { .. })
        ));
    }

    #[tokio::test]
    async fn create_podcast_publishes_empty_feed() {
        let harness = Harness::new();
        let podcast = harness.podcast().await;

        let feed = harness.publisher.current(podcast.id).await.unwrap();
        assert_eq!(feed.version, 1);
        assert_eq!(feed.episode_count, 0);
    }

    #[tokio::test]
    async fn blank_podcast_name_is_rejected() {
        let harness = Harness::new();

        let result = harness
            .service
            .create_podcast(NewPodcast {
                name: "  ".to_string(),
                ..Default::default()
            })
            .await;

        assert!(matches!(
            result,
            Err(ServiceError::Validation(ValidationError::EmptyName))
        ));
        assert!(harness.repo.list_podcasts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn submit_stores_pending_episode_and_queues_job() {
        let harness = Harness::new();
        let podcast = harness.podcast().await;

        let handle = harness
            .service
            .submit(request(&podcast, " Pilot ", "https://host/ep1.mp3"))
            .await
            .unwrap();

        let episode = harness.repo.get_episode(handle.episode_id).await.unwrap();
        assert_eq!(episode.title, "Pilot");
        assert_eq!(episode.state, EpisodeState::Pending);
        assert!(episode.audio.is_none());
        let status = harness.service.status(&handle).await.unwrap();
        assert_eq!(status.state, JobState::Pending);
    }

    #[tokio::test]
    async fn invalid_requests_persist_nothing() {
        let harness = Harness::new();
        let podcast = harness.podcast().await;

        let cases = [
            request(&podcast, "", "https://host/ep1.mp3"),
            request(&podcast, "Pilot", "file:///etc/passwd"),
            request(&podcast, "Pilot", "::"),
            IngestionRequest {
                image_url: Some("not a url".to_string()),
                ..request(&podcast, "Pilot", "https://host/ep1.mp3")
            },
        ];
        for case in cases {
            let result = harness.service.submit(case).await;
            assert!(matches!(result, Err(ServiceError::Validation(_))));
        }

        let unknown = IngestionRequest {
            podcast_id: PodcastId::new(),
            ..request(&podcast, "Pilot", "https://host/ep1.mp3")
        };
        assert!(matches!(
            harness.service.submit(unknown).await,
            Err(ServiceError::Validation(ValidationError::UnknownPodcast(_)))
        ));

        assert!(harness.repo.list_episodes(podcast.id).await.unwrap().is_empty());
        assert!(harness.repo.list_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn editing_published_episode_refreshes_feed() {
        let harness = Harness::new();
        let podcast = harness.podcast().await;
        let episode = harness.published(&podcast, "Old title").await;
        harness.publisher.invalidate(podcast.id).await.unwrap();

        let edited = harness
            .service
            .edit_episode(
                episode.id,
                EpisodeEdit {
                    title: Some("New title".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(edited.title, "New title");
        assert_eq!(edited.audio, episode.audio);
        let feed = harness.service.feed(podcast.id).await.unwrap();
        assert!(feed.xml.contains("New title"));
        assert!(!feed.xml.contains("Old title"));
    }

    #[tokio::test]
    async fn deleting_published_episode_removes_it_from_feed() {
        let harness = Harness::new();
        let podcast = harness.podcast().await;
        let episode = harness.published(&podcast, "Going away").await;
        let before = harness.publisher.invalidate(podcast.id).await.unwrap();
        assert_eq!(before.episode_count, 1);

        let archived = harness.service.delete_episode(episode.id).await.unwrap();

        assert_eq!(archived.previous_state, EpisodeState::Published);
        assert_eq!(archived.episode.state, EpisodeState::Archived);
        let after = harness.service.feed(podcast.id).await.unwrap();
        assert_eq!(after.episode_count, 0);
        assert!(!after.xml.contains("Going away"));
        assert!(!after.xml.contains("https://cdn/ep.mp3"));
        assert_eq!(after.version, before.version + 1);
    }

    #[tokio::test]
    async fn deleting_queued_episode_cancels_its_job() {
        let harness = Harness::new();
        let podcast = harness.podcast().await;
        let handle = harness
            .service
            .submit(request(&podcast, "Pilot", "https://host/ep1.mp3"))
            .await
            .unwrap();

        let archived = harness
            .service
            .delete_episode(handle.episode_id)
            .await
            .unwrap();

        assert_eq!(archived.cancelled_job, Some(handle.job_id));
        let status = harness.service.status(&handle).await.unwrap();
        assert_eq!(status.state, JobState::Failed);
        assert_eq!(status.last_error.unwrap().code, FailureCode::Cancelled);
        assert!(matches!(
            harness.service.reingest(handle.episode_id).await,
            Err(ServiceError::Queue(QueueError::NotIngestible { .. }))
        ));
    }

    #[tokio::test]
    async fn handle_lookup_maps_unknown_jobs() {
        let harness = Harness::new();

        assert!(matches!(
            harness.service.handle(JobId::new()).await,
            Err(ServiceError::Queue(QueueError::JobNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn feed_of_unknown_podcast_is_rejected() {
        let harness = Harness::new();

        assert!(matches!(
            harness.service.feed(PodcastId::new()).await,
            Err(ServiceError::Validation(ValidationError::UnknownPodcast(_)))
        ));
    }
}
