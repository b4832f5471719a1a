// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::render::{listed_episodes, render_feed};
use crate::config::FeedSettings;
use crate::error::FeedError;
use crate::model::{Podcast, PodcastId};
use crate::progress::{ProgressEvent, SharedProgressReporter};
use crate::repo::Repository;

/// The document currently served for one podcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedFeed {
    pub podcast_id: PodcastId,
    /// Public identifier, also the feed file name
    pub publish_id: String,
    pub xml: String,
    pub generated_at: DateTime<Utc>,
    /// Bumped whenever the content changes
    pub version: u64,
    /// Digest of the document without its generation timestamp
    pub etag: String,
    pub episode_count: usize,
}

/// What is kept next to a feed file so versions continue across restarts
#[derive(Debug, Serialize, Deserialize)]
struct FeedMeta {
    version: u64,
    etag: String,
    generated_at: DateTime<Utc>,
    episode_count: usize,
}

/// Renders feeds on invalidation and swaps the served document.
///
/// Readers get an `Arc` to a complete document, so they see either the
/// previous or the new feed and never a mix. With a feeds dir the version
/// and etag are stored in `<publish_id>.json` and picked up by the next
/// publisher; without one versions start at 1 in every process.
pub struct FeedPublisher {
    repo: Arc<dyn Repository>,
    settings: FeedSettings,
    feeds_dir: Option<PathBuf>,
    reporter: SharedProgressReporter,
    served: RwLock<HashMap<PodcastId, Arc<RenderedFeed>>>,
    /// Serializes invalidations per podcast
    render_locks: Mutex<HashMap<PodcastId, Arc<Mutex<()>>>>,
}

impl FeedPublisher {
    pub fn new(
        repo: Arc<dyn Repository>,
        settings: FeedSettings,
        reporter: SharedProgressReporter,
    ) -> Self {
        Self {
            repo,
            settings,
            feeds_dir: None,
            reporter,
            served: RwLock::new(HashMap::new()),
            render_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Also write every published document to `<dir>/<publish_id>.xml`,
    /// with its version in `<dir>/<publish_id>.json`
    pub fn with_feeds_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.feeds_dir = Some(dir.into());
        self
    }

    pub fn feeds_dir(&self) -> Option<&Path> {
        self.feeds_dir.as_deref()
    }

    /// The feed currently served for a podcast, if one was rendered
    pub async fn current(&self, podcast: PodcastId) -> Option<Arc<RenderedFeed>> {
        self.served.read().await.get(&podcast).cloned()
    }

    /// Re-render a podcast's feed from the repository and swap it in.
    ///
    /// When the content is unchanged the served document is kept as is.
    pub async fn invalidate(&self, podcast_id: PodcastId) -> Result<Arc<RenderedFeed>, FeedError> {
        let lock = self.render_lock(podcast_id).await;
        let _guard = lock.lock().await;

        let podcast = self.repo.get_podcast(podcast_id).await?;
        let episodes = self.repo.list_episodes(podcast_id).await?;

        let episode_count = match listed_episodes(&podcast, &episodes) {
            Ok(listed) => listed.len(),
            Err(e) => {
                error!(podcast = %podcast_id, "refusing to publish feed: {}", e);
                return Err(e);
            }
        };

        let etag = etag_of(&render_feed(&podcast, &episodes, &self.settings, None)?);
        let previous = match self.current(podcast_id).await {
            Some(feed) => Some(feed),
            None => self.load_published(&podcast).await,
        };

        if let Some(previous) = &previous
            && previous.etag == etag
        {
            debug!(podcast = %podcast_id, version = previous.version, "feed unchanged");
            self.served.write().await.insert(podcast_id, previous.clone());
            return Ok(previous.clone());
        }

        let generated_at = Utc::now();
        let xml = render_feed(&podcast, &episodes, &self.settings, Some(generated_at))?;
        let feed = Arc::new(RenderedFeed {
            podcast_id,
            publish_id: podcast.publish_id.clone(),
            xml,
            generated_at,
            version: previous.map_or(1, |p| p.version + 1),
            etag,
            episode_count,
        });

        if let Some(dir) = &self.feeds_dir {
            write_feed_file(dir, &feed).await?;
        }

        self.served.write().await.insert(podcast_id, feed.clone());

        info!(
            podcast = %podcast_id,
            version = feed.version,
            episodes = episode_count,
            "published feed"
        );
        self.reporter.report(ProgressEvent::FeedPublished {
            podcast_id,
            version: feed.version,
            episode_count,
        });

        Ok(feed)
    }

    /// Regenerate the feed of every podcast.
    ///
    /// A podcast whose feed cannot be rendered is logged and skipped.
    pub async fn invalidate_all(&self) -> Result<Vec<Arc<RenderedFeed>>, FeedError> {
        let podcasts = self.repo.list_podcasts().await?;
        let mut feeds = Vec::with_capacity(podcasts.len());

        for podcast in podcasts {
            match self.invalidate(podcast.id).await {
                Ok(feed) => feeds.push(feed),
                Err(e) => error!(podcast = %podcast.id, "failed to regenerate feed: {}", e),
            }
        }

        Ok(feeds)
    }

    /// The feed a previous publisher left in the feeds dir, if any
    async fn load_published(&self, podcast: &Podcast) -> Option<Arc<RenderedFeed>> {
        let dir = self.feeds_dir.as_ref()?;
        let meta_path = dir.join(format!("{}.json", podcast.publish_id));
        let xml_path = dir.join(format!("{}.xml", podcast.publish_id));

        let loaded = async {
            let meta = tokio::fs::read_to_string(&meta_path).await?;
            let meta: FeedMeta = serde_json::from_str(&meta)?;
            let xml = tokio::fs::read_to_string(&xml_path).await?;
            Ok::<_, std::io::Error>((meta, xml))
        }
        .await;

        match loaded {
            Ok((meta, xml)) => {
                debug!(podcast = %podcast.id, version = meta.version, "loaded published feed");
                Some(Arc::new(RenderedFeed {
                    podcast_id: podcast.id,
                    publish_id: podcast.publish_id.clone(),
                    xml,
                    generated_at: meta.generated_at,
                    version: meta.version,
                    etag: meta.etag,
                    episode_count: meta.episode_count,
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(
                    podcast = %podcast.id,
                    "ignoring published feed in {}: {}",
                    dir.display(),
                    e
                );
                None
            }
        }
    }

    async fn render_lock(&self, podcast: PodcastId) -> Arc<Mutex<()>> {
        self.render_locks
            .lock()
            .await
            .entry(podcast)
            .or_default()
            .clone()
    }
}

fn etag_of(xml: &str) -> String {
    format!("{:x}", Sha256::digest(xml.as_bytes()))
}

/// Write the feed and then its metadata next to their siblings
async fn write_feed_file(dir: &Path, feed: &RenderedFeed) -> Result<(), FeedError> {
    let meta = serde_json::to_string_pretty(&FeedMeta {
        version: feed.version,
        etag: feed.etag.clone(),
        generated_at: feed.generated_at,
        episode_count: feed.episode_count,
    })?;

    write_file(dir, &format!("{}.xml", feed.publish_id), feed.xml.as_bytes()).await?;
    write_file(dir, &format!("{}.json", feed.publish_id), meta.as_bytes()).await
}

/// Swap a file in with a rename
async fn write_file(dir: &Path, name: &str, contents: &[u8]) -> Result<(), FeedError> {
    let path = dir.join(name);
    let partial = dir.join(format!("{}.partial", name));
    let write_failed = |e| FeedError::WriteFailed {
        path: path.clone(),
        source: e,
    };

    tokio::fs::create_dir_all(dir).await.map_err(write_failed)?;
    tokio::fs::write(&partial, contents)
        .await
        .map_err(write_failed)?;
    tokio::fs::rename(&partial, &path)
        .await
        .map_err(write_failed)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        AudioArtifact, Episode, EpisodeId, EpisodeState, NewPodcast, Podcast,
    };
    use crate::progress::NoopReporter;
    use crate::repo::FileRepository;
    use tempfile::{TempDir, tempdir};
    use url::Url;

    async fn setup() -> (TempDir, Arc<FileRepository>, Podcast) {
        let dir = tempdir().unwrap();
        let repo = Arc::new(FileRepository::open(&dir.path().join("data")).unwrap());
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
        (dir, repo, podcast)
    }

    fn publisher(repo: &Arc<FileRepository>) -> FeedPublisher {
        FeedPublisher::new(repo.clone(), FeedSettings::default(), NoopReporter::shared())
    }

    async fn insert_published(repo: &FileRepository, podcast: &Podcast, title: &str) -> Episode {
        let now = Utc::now();
        repo.insert_episode(Episode {
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
                duration_secs: None,
            }),
            state: EpisodeState::Published,
            created_at: now,
            updated_at: now,
            published_at: Some(now),
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn first_invalidation_publishes_version_one() {
        let (_dir, repo, podcast) = setup().await;
        let publisher = publisher(&repo);
        assert!(publisher.current(podcast.id).await.is_none());

        let feed = publisher.invalidate(podcast.id).await.unwrap();

        assert_eq!(feed.version, 1);
        assert_eq!(feed.episode_count, 0);
        assert_eq!(publisher.current(podcast.id).await, Some(feed));
    }

    #[tokio::test]
    async fn unchanged_content_keeps_version_and_etag() {
        let (_dir, repo, podcast) = setup().await;
        let publisher = publisher(&repo);

        let first = publisher.invalidate(podcast.id).await.unwrap();
        let second = publisher.invalidate(podcast.id).await.unwrap();

        assert_eq!(first.version, second.version);
        assert_eq!(first.etag, second.etag);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn changed_content_bumps_version() {
        let (_dir, repo, podcast) = setup().await;
        let publisher = publisher(&repo);
        let first = publisher.invalidate(podcast.id).await.unwrap();

        insert_published(&repo, &podcast, "new").await;
        let second = publisher.invalidate(podcast.id).await.unwrap();

        assert_eq!(second.version, first.version + 1);
        assert_ne!(second.etag, first.etag);
        assert_eq!(second.episode_count, 1);
    }

    #[tokio::test]
    async fn archived_episode_disappears_from_feed() {
        let (_dir, repo, podcast) = setup().await;
        let publisher = publisher(&repo);
        let episode = insert_published(&repo, &podcast, "gone soon").await;
        let before = publisher.invalidate(podcast.id).await.unwrap();
        assert!(before.xml.contains("gone soon"));

        repo.archive_episode(episode.id, Utc::now()).await.unwrap();
        let after = publisher.invalidate(podcast.id).await.unwrap();

        assert!(!after.xml.contains("gone soon"));
        assert!(!after.xml.contains("https://cdn/ep.mp3"));
        assert_eq!(after.episode_count, 0);
        // The earlier snapshot is untouched by the swap
        assert!(before.xml.contains("gone soon"));
    }

    #[tokio::test]
    async fn feed_file_is_written_by_publish_id() {
        let (dir, repo, podcast) = setup().await;
        let feeds = dir.path().join("feeds");
        let publisher = publisher(&repo).with_feeds_dir(&feeds);

        let feed = publisher.invalidate(podcast.id).await.unwrap();

        let path = feeds.join(format!("{}.xml", podcast.publish_id));
        assert_eq!(std::fs::read_to_string(path).unwrap(), feed.xml);
        assert!(feeds.join(format!("{}.json", podcast.publish_id)).exists());
        assert_eq!(std::fs::read_dir(&feeds).unwrap().count(), 2);
    }

    #[tokio::test]
    async fn version_continues_in_a_new_publisher() {
        let (dir, repo, podcast) = setup().await;
        let feeds = dir.path().join("feeds");
        let first = publisher(&repo)
            .with_feeds_dir(&feeds)
            .invalidate(podcast.id)
            .await
            .unwrap();

        // Nothing changed: the stored document is served again
        let unchanged = publisher(&repo)
            .with_feeds_dir(&feeds)
            .invalidate(podcast.id)
            .await
            .unwrap();
        assert_eq!(unchanged.version, 1);
        assert_eq!(unchanged.etag, first.etag);
        assert_eq!(unchanged.xml, first.xml);

        insert_published(&repo, &podcast, "new").await;
        let changed = publisher(&repo)
            .with_feeds_dir(&feeds)
            .invalidate(podcast.id)
            .await
            .unwrap();
        assert_eq!(changed.version, 2);
        assert_ne!(changed.etag, first.etag);
    }

    #[tokio::test]
    async fn unreadable_metadata_starts_over() {
        let (dir, repo, podcast) = setup().await;
        let feeds = dir.path().join("feeds");
        std::fs::create_dir_all(&feeds).unwrap();
        std::fs::write(feeds.join(format!("{}.json", podcast.publish_id)), "{").unwrap();

        let feed = publisher(&repo)
            .with_feeds_dir(&feeds)
            .invalidate(podcast.id)
            .await
            .unwrap();

        assert_eq!(feed.version, 1);
    }

    #[tokio::test]
    async fn unknown_podcast_is_an_error() {
        let (_dir, repo, _) = setup().await;
        let publisher = publisher(&repo);

        let result = publisher.invalidate(PodcastId::new()).await;

        assert!(matches!(result, Err(FeedError::Repository(_))));
    }

    #[tokio::test]
    async fn invalidate_all_covers_every_podcast() {
        let (_dir, repo, _) = setup().await;
        repo.insert_podcast(Podcast::create(
            NewPodcast {
                name: "Other".to_string(),
                owner: "bob".to_string(),
                ..Default::default()
            },
            Utc::now(),
        ))
        .await
        .unwrap();
        let publisher = publisher(&repo);

        let feeds = publisher.invalidate_all().await.unwrap();

        assert_eq!(feeds.len(), 2);
    }
}
