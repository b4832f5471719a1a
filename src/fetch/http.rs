// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use async_trait::async_trait;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use url::Url;

use super::filename::{audio_extension, guess_content_type};
use super::{FetchContext, FetchedMedia, MediaFetcher, create_temp_path, format_checksum, validate_source};
use crate::error::FetchError;
use crate::http::HttpClient;
use crate::progress::ProgressEvent;

/// Fetches direct audio enclosures over HTTP without transcoding
#[derive(Clone)]
pub struct HttpFetcher<C> {
    client: C,
}

impl<C: HttpClient> HttpFetcher<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<C: HttpClient> MediaFetcher for HttpFetcher<C> {
    async fn fetch(&self, source: &Url, context: &FetchContext) -> Result<FetchedMedia, FetchError> {
        validate_source(source)?;
        let url = source.as_str();

        let response = self
            .client
            .get_stream(url)
            .await
            .map_err(|e| FetchError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        // Server-side and throttling errors may clear up, other client errors will not
        if response.status >= 500 || matches!(response.status, 408 | 429) {
            return Err(FetchError::DownloadFailed {
                url: url.to_string(),
                reason: format!("HTTP error {}", response.status),
            });
        }
        if response.status >= 400 {
            return Err(FetchError::UnsupportedSource {
                url: url.to_string(),
                reason: format!("HTTP error {}", response.status),
            });
        }

        let content_type = response
            .content_type
            .clone()
            .filter(|mime| mime.starts_with("audio/"))
            .or_else(|| guess_content_type(source).map(String::from))
            .ok_or_else(|| FetchError::UnsupportedSource {
                url: url.to_string(),
                reason: format!(
                    "content type {} is not audio",
                    response.content_type.as_deref().unwrap_or("unknown")
                ),
            })?;

        let suffix = format!(".{}", audio_extension(source, Some(&content_type)));
        let path = create_temp_path(context, source, &suffix)?;

        let mut file = File::create(&path).await.map_err(|e| FetchError::TempFile {
            path: path.to_path_buf(),
            source: e,
        })?;

        // Stream body to file, hashing as we go
        let mut hasher = Sha256::new();
        let mut bytes_downloaded: u64 = 0;
        let mut stream = response.body;

        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result.map_err(|e| FetchError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

            file.write_all(&chunk)
                .await
                .map_err(|e| FetchError::TempFile {
                    path: path.to_path_buf(),
                    source: e,
                })?;

            hasher.update(&chunk);
            bytes_downloaded += chunk.len() as u64;

            context.reporter.report(ProgressEvent::FetchProgress {
                job_id: context.job_id,
                bytes_downloaded,
                total_bytes: response.content_length,
            });
        }

        // Ensure all data is flushed to disk
        file.flush().await.map_err(|e| FetchError::TempFile {
            path: path.to_path_buf(),
            source: e,
        })?;

        if let Some(expected) = response.content_length
            && expected != bytes_downloaded
        {
            return Err(FetchError::DownloadFailed {
                url: url.to_string(),
                reason: format!("expected {} bytes, received {}", expected, bytes_downloaded),
            });
        }

        debug!(job = %context.job_id, bytes = bytes_downloaded, "fetched {}", url);

        Ok(FetchedMedia::new(
            path,
            bytes_downloaded,
            content_type,
            format_checksum(hasher),
            None,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{ByteStream, HttpResponse};
    use crate::model::JobId;
    use crate::progress::NoopReporter;
    use bytes::Bytes;
    use tempfile::tempdir;

    struct MockHttpClient {
        response_data: Vec<u8>,
        status: u16,
        content_type: Option<&'static str>,
    }

    #[async_trait]
    impl HttpClient for MockHttpClient {
        async fn get_stream(&self, _url: &str) -> Result<HttpResponse, reqwest::Error> {
            let data = self.response_data.clone();
            let len = data.len() as u64;

            let stream: ByteStream =
                Box::pin(futures::stream::once(async move { Ok(Bytes::from(data)) }));

            Ok(HttpResponse {
                status: self.status,
                content_length: Some(len),
                content_type: self.content_type.map(String::from),
                body: stream,
            })
        }
    }

    fn make_context(dir: &std::path::Path) -> FetchContext {
        FetchContext {
            job_id: JobId::new(),
            work_dir: dir.to_path_buf(),
            reporter: NoopReporter::shared(),
        }
    }

    #[tokio::test]
    async fn fetch_writes_file_and_hashes_it() {
        let dir = tempdir().unwrap();
        let fetcher = HttpFetcher::new(MockHttpClient {
            response_data: b"test audio content".to_vec(),
            status: 200,
            content_type: Some("audio/mpeg"),
        });
        let source = Url::parse("https://example.com/episode.mp3").unwrap();

        let media = fetcher.fetch(&source, &make_context(dir.path())).await.unwrap();

        assert_eq!(media.size, 18);
        assert_eq!(media.content_type, "audio/mpeg");
        assert!(media.checksum.starts_with("sha256:"));
        assert_eq!(std::fs::read(media.path()).unwrap(), b"test audio content");
        assert!(media.duration_secs.is_none());
    }

    #[tokio::test]
    async fn temp_file_is_gone_after_drop() {
        let dir = tempdir().unwrap();
        let fetcher = HttpFetcher::new(MockHttpClient {
            response_data: b"abc".to_vec(),
            status: 200,
            content_type: Some("audio/ogg"),
        });
        let source = Url::parse("https://example.com/episode.ogg").unwrap();

        let media = fetcher.fetch(&source, &make_context(dir.path())).await.unwrap();
        let path = media.path().to_path_buf();
        drop(media);

        assert!(!path.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn not_found_is_unsupported() {
        let dir = tempdir().unwrap();
        let fetcher = HttpFetcher::new(MockHttpClient {
            response_data: b"Not Found".to_vec(),
            status: 404,
            content_type: Some("text/html"),
        });
        let source = Url::parse("https://example.com/episode.mp3").unwrap();

        match fetcher.fetch(&source, &make_context(dir.path())).await {
            Err(FetchError::UnsupportedSource { reason, .. }) => assert!(reason.contains("404")),
            other => panic!("Expected UnsupportedSource, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn server_error_is_retryable() {
        let dir = tempdir().unwrap();
        let fetcher = HttpFetcher::new(MockHttpClient {
            response_data: Vec::new(),
            status: 503,
            content_type: None,
        });
        let source = Url::parse("https://example.com/episode.mp3").unwrap();

        let err = fetcher
            .fetch(&source, &make_context(dir.path()))
            .await
            .unwrap_err();
        assert!(err.class().is_retryable());
    }

    #[tokio::test]
    async fn html_page_is_rejected() {
        let dir = tempdir().unwrap();
        let fetcher = HttpFetcher::new(MockHttpClient {
            response_data: b"<html></html>".to_vec(),
            status: 200,
            content_type: Some("text/html"),
        });
        let source = Url::parse("https://example.com/watch").unwrap();

        let result = fetcher.fetch(&source, &make_context(dir.path())).await;
        assert!(matches!(result, Err(FetchError::UnsupportedSource { .. })));
    }

    #[tokio::test]
    async fn unsupported_scheme_never_reaches_client() {
        let dir = tempdir().unwrap();
        let fetcher = HttpFetcher::new(MockHttpClient {
            response_data: Vec::new(),
            status: 500,
            content_type: None,
        });
        let source = Url::parse("ftp://example.com/episode.mp3").unwrap();

        let result = fetcher.fetch(&source, &make_context(dir.path())).await;
        assert!(matches!(result, Err(FetchError::UnsupportedSource { .. })));
    }
}
