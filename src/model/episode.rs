// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use super::{EpisodeId, PodcastId};

/// Lifecycle state of an episode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeState {
    /// Ingestion request accepted, waiting for a worker
    Pending,
    /// An ingestion job is working on the audio
    Downloading,
    /// Audio attached and listed in the feed
    Published,
    /// Ingestion failed; only a manual retry moves it on
    Failed,
    /// Soft-deleted
    Archived,
}

impl EpisodeState {
    /// Whether `next` is a permitted move from this state
    pub fn can_transition_to(self, next: EpisodeState) -> bool {
        use EpisodeState::*;
        matches!(
            (self, next),
            (Pending, Downloading)
                | (Pending, Failed)
                | (Pending, Archived)
                | (Downloading, Published)
                | (Downloading, Failed)
                | (Downloading, Archived)
                | (Published, Archived)
                | (Failed, Pending)
                | (Failed, Archived)
        )
    }
}

impl fmt::Display for EpisodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EpisodeState::Pending => "pending",
            EpisodeState::Downloading => "downloading",
            EpisodeState::Published => "published",
            EpisodeState::Failed => "failed",
            EpisodeState::Archived => "archived",
        };
        f.write_str(name)
    }
}

/// Durably stored audio attached to exactly one episode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioArtifact {
    /// Object key in the artifact store
    pub key: String,
    /// Public URL the enclosure points at
    pub url: Url,
    pub size: u64,
    pub content_type: String,
    /// Content checksum, "sha256:<hex>"
    pub checksum: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u32>,
}

/// A podcast episode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub id: EpisodeId,
    pub podcast_id: PodcastId,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<Url>,
    /// Where the media is fetched from
    pub source_url: Url,
    /// Populated only by a successful ingestion
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioArtifact>,
    pub state: EpisodeState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set only on the transition into Published
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
}

impl Episode {
    /// Whether the episode may appear in a rendered feed
    pub fn is_listable(&self) -> bool {
        self.state == EpisodeState::Published
            && self.audio.is_some()
            && self.published_at.is_some()
    }

    /// Apply a metadata edit; audio and state fields are never touched
    pub fn apply_edit(&mut self, edit: &EpisodeEdit, now: DateTime<Utc>) {
        if let Some(title) = &edit.title {
            self.title = title.clone();
        }
        if let Some(description) = &edit.description {
            self.description = Some(description.clone()).filter(|s| !s.is_empty());
        }
        if let Some(author) = &edit.author {
            self.author = Some(author.clone()).filter(|s| !s.is_empty());
        }
        if let Some(image_url) = &edit.image_url {
            self.image_url = Some(image_url.clone());
        }
        self.updated_at = now;
    }
}

/// User edit of episode metadata; `None` leaves a field unchanged
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EpisodeEdit {
    pub title: Option<String>,
    pub description: Option<String>,
    pub author: Option<String>,
    pub image_url: Option<Url>,
}

impl EpisodeEdit {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.author.is_none()
            && self.image_url.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_episode(state: EpisodeState) -> Episode {
        let now = Utc::now();
        Episode {
            id: EpisodeId::new(),
            podcast_id: PodcastId::new(),
            title: "Episode".to_string(),
            description: None,
            author: None,
            image_url: None,
            source_url: Url::parse("https://host/ep1.mp3").unwrap(),
            audio: None,
            state,
            created_at: now,
            updated_at: now,
            published_at: None,
        }
    }

    #[test]
    fn transitions_only_move_forward() {
        use EpisodeState::*;

        assert!(Pending.can_transition_to(Downloading));
        assert!(Downloading.can_transition_to(Published));
        assert!(Published.can_transition_to(Archived));
        assert!(!Published.can_transition_to(Pending));
        assert!(!Published.can_transition_to(Downloading));
        assert!(!Archived.can_transition_to(Published));
        assert!(!Downloading.can_transition_to(Pending));
    }

    #[test]
    fn failed_episodes_can_be_retried_manually() {
        assert!(EpisodeState::Failed.can_transition_to(EpisodeState::Pending));
    }

    #[test]
    fn published_without_audio_is_not_listable() {
        let mut episode = make_episode(EpisodeState::Published);
        episode.published_at = Some(Utc::now());
        assert!(!episode.is_listable());
    }

    #[test]
    fn edit_leaves_audio_and_state_alone() {
        let mut episode = make_episode(EpisodeState::Downloading);
        let edit = EpisodeEdit {
            title: Some("Renamed".to_string()),
            description: Some(String::new()),
            ..Default::default()
        };

        episode.apply_edit(&edit, Utc::now());

        assert_eq!(episode.title, "Renamed");
        assert!(episode.description.is_none());
        assert_eq!(episode.state, EpisodeState::Downloading);
        assert!(episode.audio.is_none());
    }

    #[test]
    fn empty_edit_is_detected() {
        assert!(EpisodeEdit::default().is_empty());
        assert!(
            !EpisodeEdit {
                author: Some("A".to_string()),
                ..Default::default()
            }
            .is_empty()
        );
    }
}
