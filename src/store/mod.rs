// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

mod fs;

pub use fs::FsArtifactStore;

use std::path::Component;
use std::path::Path;

use async_trait::async_trait;
use url::Url;

use crate::error::StoreError;
use crate::fetch::FetchedMedia;

/// Durable, path-addressed blob storage for audio artifacts
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Upload `media` under `key` and return its public URL.
    ///
    /// Idempotent: the same content under the same key succeeds again,
    /// different content is a conflict and the stored object is kept.
    async fn put(&self, media: &FetchedMedia, key: &str) -> Result<Url, StoreError>;

    /// Public URL of `key`
    fn resolve(&self, key: &str) -> Result<Url, StoreError>;
}

/// Check that a key is a relative path that stays inside the store
pub fn validate_key(key: &str) -> Result<(), StoreError> {
    let invalid = || StoreError::InvalidKey(key.to_string());

    if key.is_empty() || key.ends_with('/') || key.contains('\\') || key.ends_with(".partial") {
        return Err(invalid());
    }

    let all_normal = Path::new(key)
        .components()
        .all(|component| matches!(component, Component::Normal(_)));
    if !all_normal {
        return Err(invalid());
    }

    Ok(())
}
