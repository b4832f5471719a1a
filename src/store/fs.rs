// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use super::{ArtifactStore, validate_key};
use crate::error::StoreError;
use crate::fetch::{FetchedMedia, hash_file};

/// Artifact store backed by a local directory served from a public base URL
#[derive(Debug)]
pub struct FsArtifactStore {
    root: PathBuf,
    base_url: Url,
    quota_bytes: Option<u64>,
    /// Bytes currently held; also serializes writers
    used_bytes: Mutex<u64>,
}

impl FsArtifactStore {
    /// Open (creating if needed) a store rooted at `root`.
    ///
    /// Leftover `.partial` uploads are removed and the bytes already stored
    /// are counted against the quota.
    pub fn open(
        root: &Path,
        base_url: Url,
        quota_bytes: Option<u64>,
    ) -> Result<Self, StoreError> {
        std::fs::create_dir_all(root).map_err(|e| StoreError::Unavailable {
            key: String::new(),
            source: e,
        })?;

        let used = scan_dir(root).map_err(|e| StoreError::Unavailable {
            key: String::new(),
            source: e,
        })?;

        Ok(Self {
            root: root.to_path_buf(),
            base_url: with_trailing_slash(base_url),
            quota_bytes,
            used_bytes: Mutex::new(used),
        })
    }

    /// Store whose public URLs are file:// URLs of the root directory
    pub fn open_local(root: &Path, quota_bytes: Option<u64>) -> Result<Self, StoreError> {
        std::fs::create_dir_all(root).map_err(|e| StoreError::Unavailable {
            key: String::new(),
            source: e,
        })?;
        let absolute = root.canonicalize().map_err(|e| StoreError::Unavailable {
            key: String::new(),
            source: e,
        })?;
        let base_url = Url::from_directory_path(&absolute).map_err(|_| {
            StoreError::InvalidKey(absolute.display().to_string())
        })?;

        Self::open(&absolute, base_url, quota_bytes)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn used_bytes(&self) -> u64 {
        *self.used_bytes.lock().await
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(&self, media: &FetchedMedia, key: &str) -> Result<Url, StoreError> {
        validate_key(key)?;
        let unavailable = |e: std::io::Error| StoreError::Unavailable {
            key: key.to_string(),
            source: e,
        };

        let target = self.root.join(key);
        let mut used = self.used_bytes.lock().await;

        if tokio::fs::try_exists(&target).await.map_err(unavailable)? {
            let (_, existing) = hash_file(&target).await.map_err(unavailable)?;
            if existing == media.checksum {
                debug!(key, "object already stored with identical content");
                return self.resolve(key);
            }

            warn!(key, stored = %existing, incoming = %media.checksum, "refusing to overwrite object");
            return Err(StoreError::Conflict {
                key: key.to_string(),
            });
        }

        if let Some(quota) = self.quota_bytes
            && *used + media.size > quota
        {
            return Err(StoreError::QuotaExceeded {
                key: key.to_string(),
                required: media.size,
                available: quota.saturating_sub(*used),
            });
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(unavailable)?;
        }

        // Copy under a partial name, then rename, so readers never see half an object
        let partial = partial_path(&target);
        if let Err(e) = tokio::fs::copy(media.path(), &partial).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(unavailable(e));
        }
        if let Err(e) = tokio::fs::rename(&partial, &target).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(unavailable(e));
        }

        *used += media.size;
        info!(key, size = media.size, "stored object");

        self.resolve(key)
    }

    fn resolve(&self, key: &str) -> Result<Url, StoreError> {
        validate_key(key)?;
        self.base_url
            .join(key)
            .map_err(|_| StoreError::InvalidKey(key.to_string()))
    }
}

fn partial_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

/// Sum object sizes below `dir`, removing interrupted uploads
fn scan_dir(dir: &Path) -> std::io::Result<u64> {
    let mut total = 0;

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            total += scan_dir(&path)?;
        } else if path.extension().is_some_and(|ext| ext == "partial") {
            let _ = std::fs::remove_file(&path);
        } else {
            total += entry.metadata()?.len();
        }
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::hash_file;
    use std::io::Write;
    use tempfile::{TempDir, tempdir};

    async fn make_media(dir: &TempDir, content: &[u8]) -> FetchedMedia {
        let mut file = tempfile::NamedTempFile::new_in(dir.path()).unwrap();
        file.write_all(content).unwrap();
        let path = file.into_temp_path();
        let (size, checksum) = hash_file(&path).await.unwrap();
        FetchedMedia::new(path, size, "audio/mpeg", checksum, Some(600))
    }

    fn open_store(dir: &TempDir, quota: Option<u64>) -> FsArtifactStore {
        FsArtifactStore::open(
            &dir.path().join("objects"),
            Url::parse("https://cdn.example.com/media").unwrap(),
            quota,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn put_stores_object_and_returns_public_url() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir, None);
        let media = make_media(&dir, b"audio bytes").await;

        let url = store.put(&media, "audio/ep1.mp3").await.unwrap();

        assert_eq!(url.as_str(), "https://cdn.example.com/media/audio/ep1.mp3");
        let stored = std::fs::read(dir.path().join("objects/audio/ep1.mp3")).unwrap();
        assert_eq!(stored, b"audio bytes");
        assert_eq!(store.used_bytes().await, 11);
    }

    #[tokio::test]
    async fn put_same_content_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir, None);
        let media = make_media(&dir, b"audio bytes").await;

        let first = store.put(&media, "audio/ep1.mp3").await.unwrap();
        let second = store.put(&media, "audio/ep1.mp3").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.used_bytes().await, 11);
    }

    #[tokio::test]
    async fn put_different_content_conflicts_and_keeps_original() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir, None);
        let original = make_media(&dir, b"original").await;
        let replacement = make_media(&dir, b"replacement").await;

        store.put(&original, "audio/ep1.mp3").await.unwrap();
        let result = store.put(&replacement, "audio/ep1.mp3").await;

        assert!(matches!(result, Err(StoreError::Conflict { .. })));
        let stored = std::fs::read(dir.path().join("objects/audio/ep1.mp3")).unwrap();
        assert_eq!(stored, b"original");
    }

    #[tokio::test]
    async fn put_beyond_quota_is_rejected() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir, Some(10));
        let small = make_media(&dir, b"12345678").await;
        let large = make_media(&dir, b"123456").await;

        store.put(&small, "audio/a.mp3").await.unwrap();
        match store.put(&large, "audio/b.mp3").await {
            Err(StoreError::QuotaExceeded {
                required,
                available,
                ..
            }) => {
                assert_eq!(required, 6);
                assert_eq!(available, 2);
            }
            other => panic!("Expected QuotaExceeded, got {:?}", other),
        }
        assert!(!dir.path().join("objects/audio/b.mp3").exists());
    }

    #[tokio::test]
    async fn reopen_counts_existing_objects_and_drops_partials() {
        let dir = tempdir().unwrap();
        {
            let store = open_store(&dir, None);
            let media = make_media(&dir, b"0123456789").await;
            store.put(&media, "audio/a.mp3").await.unwrap();
        }
        std::fs::write(dir.path().join("objects/audio/b.mp3.partial"), b"half").unwrap();

        let store = open_store(&dir, None);

        assert_eq!(store.used_bytes().await, 10);
        assert!(!dir.path().join("objects/audio/b.mp3.partial").exists());
    }

    #[tokio::test]
    async fn invalid_key_is_rejected() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir, None);
        let media = make_media(&dir, b"x").await;

        let result = store.put(&media, "../escape.mp3").await;
        assert!(matches!(result, Err(StoreError::InvalidKey(_))));
    }

    #[test]
    fn local_store_resolves_file_urls() {
        let dir = tempdir().unwrap();
        let store = FsArtifactStore::open_local(&dir.path().join("objects"), None).unwrap();

        let url = store.resolve("audio/a.mp3").unwrap();
        assert_eq!(url.scheme(), "file");
        assert!(url.path().ends_with("/objects/audio/a.mp3"));
    }
}
