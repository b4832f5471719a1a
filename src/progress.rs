// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::model::{EpisodeId, JobId, JobState, PodcastId};

/// Events emitted by the pipeline for progress reporting
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// A job was created for an episode
    JobEnqueued { job_id: JobId, episode_id: EpisodeId },

    /// An enqueue found an active job and returned it instead
    JobCoalesced { job_id: JobId, episode_id: EpisodeId },

    /// A worker claimed a job
    JobClaimed {
        worker: String,
        job_id: JobId,
        /// 1-based dispatch count
        attempt: u32,
        /// Whether the job was abandoned by another worker
        reclaimed: bool,
    },

    /// A job moved to a new state
    JobStateChanged { job_id: JobId, state: JobState },

    /// Media download progress update
    FetchProgress {
        job_id: JobId,
        bytes_downloaded: u64,
        total_bytes: Option<u64>,
    },

    /// A retryable failure rescheduled the job
    RetryScheduled {
        job_id: JobId,
        attempt: u32,
        delay: Duration,
        error: String,
    },

    /// Audio is stored and attached, the episode is published
    JobAttached {
        job_id: JobId,
        episode_id: EpisodeId,
        audio_url: Url,
    },

    /// The job reached the Failed state
    JobFailed { job_id: JobId, error: String },

    /// A new feed document is being served
    FeedPublished {
        podcast_id: PodcastId,
        version: u64,
        episode_count: usize,
    },

    /// Interrupted writes were cleaned up when the repository was opened
    PartialFilesCleanedUp { count: usize },
}

/// Trait for reporting progress events from the pipeline.
///
/// Implementations can use this to display progress bars, log messages,
/// or collect statistics.
pub trait ProgressReporter: Send + Sync {
    /// Report a progress event
    fn report(&self, event: ProgressEvent);
}

/// A shared reference to a progress reporter
pub type SharedProgressReporter = Arc<dyn ProgressReporter>;

/// A no-op progress reporter that silently ignores all events.
/// Useful for tests or quiet mode.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn report(&self, _event: ProgressEvent) {}
}

impl NoopReporter {
    /// Create a new NoopReporter wrapped in an Arc
    pub fn shared() -> SharedProgressReporter {
        Arc::new(Self)
    }
}
