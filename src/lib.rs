// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

pub mod config;
pub mod error;
pub mod feed;
pub mod fetch;
pub mod http;
pub mod job;
pub mod model;
pub mod progress;
pub mod queue;
pub mod repo;
pub mod service;
pub mod store;

// Re-export main types for convenience
pub use config::{FeedSettings, FetcherSettings, PipelineOptions, StoreSettings};
pub use error::{
    ConfigError, ErrorClass, FailureCode, FeedError, FetchError, JobFailure, QueueError,
    RepositoryError, ServiceError, StoreError, ValidationError,
};
pub use feed::{FeedPublisher, RenderedFeed, render_feed};
pub use fetch::{CommandFetcher, FetchContext, FetchedMedia, HttpFetcher, MediaFetcher};
pub use http::{HttpClient, HttpResponse, ReqwestClient};
pub use job::{Ingestor, Outcome, RetryPolicy};
pub use model::{
    AudioArtifact, Episode, EpisodeEdit, EpisodeId, EpisodeState, IngestionJob, JobHandle, JobId,
    JobState, JobStatus, NewPodcast, Podcast, PodcastId,
};
pub use progress::{NoopReporter, ProgressEvent, ProgressReporter, SharedProgressReporter};
pub use queue::{JobQueue, WorkerPool};
pub use repo::{Archived, FileRepository, Repository};
pub use service::{IngestionRequest, PodcastService};
pub use store::{ArtifactStore, FsArtifactStore};
