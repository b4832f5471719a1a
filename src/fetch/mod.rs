// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

mod command;
mod filename;
mod http;

pub use command::CommandFetcher;
pub use filename::{audio_extension, extension_to_mime, guess_content_type, object_key};
pub use http::HttpFetcher;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tempfile::{TempDir, TempPath};
use tokio::io::AsyncReadExt;
use url::Url;

use crate::error::FetchError;
use crate::model::JobId;
use crate::progress::SharedProgressReporter;

/// Context for one fetch, used for temp file placement and progress
#[derive(Clone)]
pub struct FetchContext {
    pub job_id: JobId,
    /// Directory temporary media files are created in
    pub work_dir: PathBuf,
    pub reporter: SharedProgressReporter,
}

/// Local audio produced by a fetcher.
///
/// The file lives as long as this value; dropping it removes the file on
/// every path, success or failure.
#[derive(Debug)]
pub struct FetchedMedia {
    path: TempPath,
    pub size: u64,
    pub content_type: String,
    /// "sha256:<hex>"
    pub checksum: String,
    pub duration_secs: Option<u32>,
}

impl FetchedMedia {
    pub fn new(
        path: TempPath,
        size: u64,
        content_type: impl Into<String>,
        checksum: impl Into<String>,
        duration_secs: Option<u32>,
    ) -> Self {
        Self {
            path,
            size,
            content_type: content_type.into(),
            checksum: checksum.into(),
            duration_secs,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Turns a source locator into a local audio artifact
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    /// Fetch and normalize the media behind `source`
    async fn fetch(&self, source: &Url, context: &FetchContext) -> Result<FetchedMedia, FetchError>;
}

/// Reject locators the wrapped tools cannot retrieve, before running them
pub fn validate_source(source: &Url) -> Result<(), FetchError> {
    if !matches!(source.scheme(), "http" | "https") {
        return Err(FetchError::UnsupportedSource {
            url: source.to_string(),
            reason: format!("scheme '{}' is not supported", source.scheme()),
        });
    }

    if source.host_str().is_none_or(str::is_empty) {
        return Err(FetchError::UnsupportedSource {
            url: source.to_string(),
            reason: "missing host".to_string(),
        });
    }

    Ok(())
}

/// Create an empty temp file in the work dir, removed when the path drops
pub(crate) fn create_temp_path(
    context: &FetchContext,
    source: &Url,
    suffix: &str,
) -> Result<TempPath, FetchError> {
    create_work_dir(context)?;

    tempfile::Builder::new()
        .prefix(&filename::temp_file_prefix(source))
        .suffix(suffix)
        .tempfile_in(&context.work_dir)
        .map(|file| file.into_temp_path())
        .map_err(|e| FetchError::TempFile {
            path: context.work_dir.clone(),
            source: e,
        })
}

/// Create a private directory in the work dir for one fetch.
///
/// Everything a tool leaves in it goes away when the directory is dropped.
pub(crate) fn create_scratch_dir(
    context: &FetchContext,
    source: &Url,
) -> Result<TempDir, FetchError> {
    create_work_dir(context)?;

    tempfile::Builder::new()
        .prefix(&filename::temp_file_prefix(source))
        .tempdir_in(&context.work_dir)
        .map_err(|e| FetchError::TempFile {
            path: context.work_dir.clone(),
            source: e,
        })
}

fn create_work_dir(context: &FetchContext) -> Result<(), FetchError> {
    std::fs::create_dir_all(&context.work_dir).map_err(|e| FetchError::TempFile {
        path: context.work_dir.clone(),
        source: e,
    })
}

/// Format a finished digest the way checksums are stored
pub(crate) fn format_checksum(hasher: Sha256) -> String {
    format!("sha256:{:x}", hasher.finalize())
}

/// Compute size and checksum of a file on disk
pub async fn hash_file(path: &Path) -> std::io::Result<(u64, String)> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    let mut size: u64 = 0;

    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        size += read as u64;
    }

    Ok((size, format_checksum(hasher)))
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoopReporter;
    use tempfile::tempdir;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn validate_accepts_http_and_https() {
        assert!(validate_source(&url("http://host/ep.mp3")).is_ok());
        assert!(validate_source(&url("https://host/ep.mp3")).is_ok());
    }

    #[test]
    fn validate_rejects_other_schemes() {
        for source in ["ftp://host/ep.mp3", "file:///etc/passwd", "data:text/plain,hi"] {
            match validate_source(&url(source)) {
                Err(FetchError::UnsupportedSource { .. }) => {}
                other => panic!("Expected UnsupportedSource for {}, got {:?}", source, other),
            }
        }
    }

    #[tokio::test]
    async fn hash_file_reports_size_and_sha256() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, b"abc").unwrap();

        let (size, checksum) = hash_file(&path).await.unwrap();

        assert_eq!(size, 3);
        assert_eq!(
            checksum,
            "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn temp_path_is_removed_on_drop() {
        let dir = tempdir().unwrap();
        let context = FetchContext {
            job_id: JobId::new(),
            work_dir: dir.path().join("work"),
            reporter: NoopReporter::shared(),
        };

        let path = create_temp_path(&context, &url("https://host/ep.mp3"), ".mp3").unwrap();
        let owned = path.to_path_buf();
        assert!(owned.exists());

        let media = FetchedMedia::new(path, 0, "audio/mpeg", "sha256:00", None);
        assert_eq!(media.path(), owned.as_path());
        drop(media);
        assert!(!owned.exists());
    }
}
