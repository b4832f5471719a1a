// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::error::ConfigError;
use crate::job::RetryPolicy;

/// Options for the ingestion pipeline
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineOptions {
    /// Number of concurrent ingestion workers
    pub workers: usize,
    /// Attempt ceiling for retryable failures
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// How long a claimed job stays invisible to other workers
    pub visibility_timeout_secs: u64,
    /// How often idle workers look for rescheduled or abandoned jobs
    pub poll_interval_ms: u64,
    /// Directory for temporary media files (system temp dir if unset)
    pub work_dir: Option<PathBuf>,
    pub feed: FeedSettings,
    pub store: StoreSettings,
    pub fetcher: FetcherSettings,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            workers: 3,
            max_attempts: 5,
            retry_base_delay_ms: 2_000,
            retry_max_delay_ms: 300_000,
            visibility_timeout_secs: 300,
            poll_interval_ms: 500,
            work_dir: None,
            feed: FeedSettings::default(),
            store: StoreSettings::default(),
            fetcher: FetcherSettings::default(),
        }
    }
}

impl PipelineOptions {
    /// Load options from a JSON file; missing keys keep their defaults
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed {
            path: path.to_path_buf(),
            source: e,
        })?;

        serde_json::from_str(&content).map_err(|e| ConfigError::JsonParseFailed {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn work_dir(&self) -> PathBuf {
        self.work_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Channel-level settings for rendered feeds
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedSettings {
    /// Link used for podcasts that have none of their own
    pub site_url: Url,
    /// Artwork used for podcasts without an image
    pub default_image_url: Url,
    pub language: String,
    pub generator: String,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            site_url: Url::parse("http://localhost:8000/").expect("valid default site URL"),
            default_image_url: Url::parse("http://localhost:8000/static/images/default-podcast.png")
                .expect("valid default image URL"),
            language: "en".to_string(),
            generator: format!("podhost {}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Settings for the filesystem artifact store
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Object root (defaults to `<data dir>/objects`)
    pub root: Option<PathBuf>,
    /// Base URL objects are served from (defaults to a file:// URL of the root)
    pub public_base_url: Option<Url>,
    /// Maximum total bytes held by the store
    pub quota_bytes: Option<u64>,
}

/// Settings for the external download and transcode tools
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetcherSettings {
    pub ytdlp_path: PathBuf,
    pub ffmpeg_path: PathBuf,
    pub ffmpeg_args: Vec<String>,
    pub ffmpeg_timeout_secs: u64,
}

impl Default for FetcherSettings {
    fn default() -> Self {
        Self {
            ytdlp_path: PathBuf::from("yt-dlp"),
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffmpeg_args: ["-vn", "-acodec", "libmp3lame", "-q:a", "5"]
                .into_iter()
                .map(String::from)
                .collect(),
            ffmpeg_timeout_secs: 1_800,
        }
    }
}

impl FetcherSettings {
    pub fn ffmpeg_timeout(&self) -> Duration {
        Duration::from_secs(self.ffmpeg_timeout_secs)
    }
}
