// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;
use uuid::Uuid;

use super::PodcastId;

/// Length of the public identifier used in feed file names
const PUBLISH_ID_LENGTH: usize = 16;

/// A podcast owned by an account, published as one RSS feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Podcast {
    pub id: PodcastId,
    /// Opaque public identifier, used as the feed file name
    pub publish_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<Url>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<Url>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default)]
    pub explicit: bool,
    pub owner: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields accepted when creating a podcast
#[derive(Debug, Clone, Default)]
pub struct NewPodcast {
    pub name: String,
    pub description: Option<String>,
    pub image_url: Option<Url>,
    pub link: Option<Url>,
    pub author: Option<String>,
    pub language: Option<String>,
    pub explicit: bool,
    pub owner: String,
}

impl Podcast {
    /// Build a new podcast record with fresh identities
    pub fn create(new: NewPodcast, now: DateTime<Utc>) -> Self {
        Self {
            id: PodcastId::new(),
            publish_id: generate_publish_id(),
            name: new.name,
            description: new.description,
            image_url: new.image_url,
            link: new.link,
            author: new.author,
            language: new.language,
            explicit: new.explicit,
            owner: new.owner,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Generate a random public identifier (lowercase hex)
pub fn generate_publish_id() -> String {
    let digest = Sha256::digest(Uuid::new_v4().as_bytes());
    let hex = format!("{:x}", digest);
    hex[..PUBLISH_ID_LENGTH].to_string()
}
