// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{EpisodeId, EpisodeState, JobId, JobState, PodcastId};

/// How an error should be handled by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Bad input, rejected before anything is enqueued
    Validation,
    /// Network or storage hiccup, retried with backoff
    Transient,
    /// Surfaced immediately, the job becomes terminal
    Permanent,
    /// A record was in a state it should never be in
    Consistency,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Transient)
    }
}

/// Errors rejected at the ingestion request boundary
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Title must not be empty")]
    EmptyTitle,

    #[error("Title is {len} characters long, at most {max} are allowed")]
    TitleTooLong { len: usize, max: usize },

    #[error("Podcast name must not be empty")]
    EmptyName,

    #[error("Invalid URL '{value}': {reason}")]
    InvalidUrl { value: String, reason: String },

    #[error("Unsupported URL scheme '{scheme}' in {value}")]
    UnsupportedScheme { value: String, scheme: String },

    #[error("Podcast {0} does not exist")]
    UnknownPodcast(PodcastId),
}

/// Errors reported by a media fetcher
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Source {url} cannot be retrieved: {reason}")]
    UnsupportedSource { url: String, reason: String },

    #[error("Download of {url} failed: {reason}")]
    DownloadFailed { url: String, reason: String },

    #[error("Transcoding of {url} failed: {reason}")]
    TranscodeFailed { url: String, reason: String },

    #[error("Failed to prepare temporary file in {path}: {source}")]
    TempFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Fetch was cancelled")]
    Cancelled,
}

impl FetchError {
    pub fn class(&self) -> ErrorClass {
        match self {
            FetchError::DownloadFailed { .. } | FetchError::TempFile { .. } => {
                ErrorClass::Transient
            }
            FetchError::UnsupportedSource { .. }
            | FetchError::TranscodeFailed { .. }
            | FetchError::Cancelled => ErrorClass::Permanent,
        }
    }

    pub fn code(&self) -> FailureCode {
        match self {
            FetchError::UnsupportedSource { .. } => FailureCode::UnsupportedSource,
            FetchError::DownloadFailed { .. } | FetchError::TempFile { .. } => {
                FailureCode::DownloadFailed
            }
            FetchError::TranscodeFailed { .. } => FailureCode::TranscodeFailed,
            FetchError::Cancelled => FailureCode::Cancelled,
        }
    }
}

/// Errors reported by an artifact store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage backend unavailable for key {key}: {source}")]
    Unavailable {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Key {key} already holds different content")]
    Conflict { key: String },

    #[error("Storing {key} needs {required} bytes, quota allows {available} more")]
    QuotaExceeded {
        key: String,
        required: u64,
        available: u64,
    },

    #[error("Invalid object key '{0}'")]
    InvalidKey(String),
}

impl StoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::Unavailable { .. } => ErrorClass::Transient,
            StoreError::Conflict { .. } | StoreError::QuotaExceeded { .. } => {
                ErrorClass::Permanent
            }
            StoreError::InvalidKey(_) => ErrorClass::Consistency,
        }
    }

    pub fn code(&self) -> FailureCode {
        match self {
            StoreError::Unavailable { .. } => FailureCode::StoreUnavailable,
            StoreError::Conflict { .. } => FailureCode::Conflict,
            StoreError::QuotaExceeded { .. } => FailureCode::QuotaExceeded,
            StoreError::InvalidKey(_) => FailureCode::Consistency,
        }
    }
}

/// Errors reported by the episode repository
#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Podcast {0} not found")]
    PodcastNotFound(PodcastId),

    #[error("Episode {0} not found")]
    EpisodeNotFound(EpisodeId),

    #[error("Job {0} not found")]
    JobNotFound(JobId),

    #[error("Episode {episode} already has active job {job}")]
    ActiveJobExists { episode: EpisodeId, job: JobId },

    #[error("Episode {episode} cannot move from {from} to {to}")]
    InvalidEpisodeTransition {
        episode: EpisodeId,
        from: EpisodeState,
        to: EpisodeState,
    },

    #[error("Job {job} cannot move from {from} to {to}")]
    InvalidJobTransition {
        job: JobId,
        from: JobState,
        to: JobState,
    },

    #[error("Worker {worker} no longer holds the lease on job {job}")]
    LeaseLost { job: JobId, worker: String },

    #[error("Job {job} is leased to worker {worker}")]
    JobLeased { job: JobId, worker: String },

    #[error("Failed to read record {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write record {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to lock repository at {path}: {source}")]
    LockFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse record JSON in {path}: {source}")]
    JsonParseFailed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize record: {0}")]
    JsonSerializeFailed(#[from] serde_json::Error),
}

impl RepositoryError {
    pub fn class(&self) -> ErrorClass {
        match self {
            RepositoryError::ReadFailed { .. }
            | RepositoryError::WriteFailed { .. }
            | RepositoryError::LockFailed { .. } => ErrorClass::Transient,
            RepositoryError::PodcastNotFound(_)
            | RepositoryError::EpisodeNotFound(_)
            | RepositoryError::JobNotFound(_) => ErrorClass::Validation,
            RepositoryError::ActiveJobExists { .. } | RepositoryError::JobLeased { .. } => {
                ErrorClass::Permanent
            }
            RepositoryError::InvalidEpisodeTransition { .. }
            | RepositoryError::InvalidJobTransition { .. }
            | RepositoryError::LeaseLost { .. }
            | RepositoryError::JsonParseFailed { .. }
            | RepositoryError::JsonSerializeFailed(_) => ErrorClass::Consistency,
        }
    }
}

/// Errors that can occur while rendering or publishing a feed
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Failed to serialize RSS document: {0}")]
    Serialize(#[from] rss::Error),

    #[error("Feed for podcast {podcast} is inconsistent: {reason}")]
    Consistency { podcast: PodcastId, reason: String },

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Failed to write feed file {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize feed metadata: {0}")]
    Metadata(#[from] serde_json::Error),
}

impl FeedError {
    pub fn class(&self) -> ErrorClass {
        match self {
            FeedError::Serialize(_) | FeedError::Consistency { .. } | FeedError::Metadata(_) => {
                ErrorClass::Consistency
            }
            FeedError::Repository(e) => e.class(),
            FeedError::WriteFailed { .. } => ErrorClass::Transient,
        }
    }
}

/// Errors returned by the job queue
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Job {0} not found")]
    JobNotFound(JobId),

    #[error("Episode {episode} is {state} and cannot be ingested again")]
    NotIngestible {
        episode: EpisodeId,
        state: EpisodeState,
    },

    #[error("Job {job} is {state}; only failed jobs can be retried")]
    NotRetryable { job: JobId, state: JobState },

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),
}

/// Errors returned by the service facade consumed by the API layer
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),
}

/// Errors that can occur when loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON in {path}: {source}")]
    JsonParseFailed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Machine-readable reason a job failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCode {
    UnsupportedSource,
    DownloadFailed,
    TranscodeFailed,
    StoreUnavailable,
    Conflict,
    QuotaExceeded,
    Repository,
    Consistency,
    Cancelled,
}

/// Failure recorded on a job record, queryable through its handle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub code: FailureCode,
    pub class: ErrorClass,
    pub message: String,
}

impl JobFailure {
    pub fn cancelled() -> Self {
        Self {
            code: FailureCode::Cancelled,
            class: ErrorClass::Permanent,
            message: "Cancelled".to_string(),
        }
    }

    pub fn consistency(message: impl Into<String>) -> Self {
        Self {
            code: FailureCode::Consistency,
            class: ErrorClass::Consistency,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class.is_retryable()
    }
}

impl From<&FetchError> for JobFailure {
    fn from(e: &FetchError) -> Self {
        Self {
            code: e.code(),
            class: e.class(),
            message: e.to_string(),
        }
    }
}

impl From<&StoreError> for JobFailure {
    fn from(e: &StoreError) -> Self {
        Self {
            code: e.code(),
            class: e.class(),
            message: e.to_string(),
        }
    }
}

impl From<&RepositoryError> for JobFailure {
    fn from(e: &RepositoryError) -> Self {
        let class = e.class();
        Self {
            code: if class == ErrorClass::Consistency {
                FailureCode::Consistency
            } else {
                FailureCode::Repository
            },
            class,
            message: e.to_string(),
        }
    }
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_errors_are_classified() {
        let unsupported = FetchError::UnsupportedSource {
            url: "ftp://host/ep.mp3".to_string(),
            reason: "scheme".to_string(),
        };
        let download = FetchError::DownloadFailed {
            url: "https://host/ep.mp3".to_string(),
            reason: "connection reset".to_string(),
        };

        assert_eq!(unsupported.class(), ErrorClass::Permanent);
        assert_eq!(unsupported.code(), FailureCode::UnsupportedSource);
        assert_eq!(download.class(), ErrorClass::Transient);
        assert!(download.class().is_retryable());
    }

    #[test]
    fn store_errors_are_classified() {
        let unavailable = StoreError::Unavailable {
            key: "audio/a.mp3".to_string(),
            source: std::io::Error::other("disk gone"),
        };
        let conflict = StoreError::Conflict {
            key: "audio/a.mp3".to_string(),
        };
        let quota = StoreError::QuotaExceeded {
            key: "audio/a.mp3".to_string(),
            required: 10,
            available: 5,
        };

        assert!(unavailable.class().is_retryable());
        assert!(!conflict.class().is_retryable());
        assert!(!quota.class().is_retryable());
        assert_eq!(JobFailure::from(&conflict).code, FailureCode::Conflict);
    }

    #[test]
    fn lease_loss_is_a_consistency_failure() {
        let err = RepositoryError::LeaseLost {
            job: JobId::new(),
            worker: "w-0".to_string(),
        };
        let failure = JobFailure::from(&err);

        assert_eq!(failure.class, ErrorClass::Consistency);
        assert_eq!(failure.code, FailureCode::Consistency);
    }
}
