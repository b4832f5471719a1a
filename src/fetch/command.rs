// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::Path;
use std::process::Output;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};
use url::Url;

use super::{
    FetchContext, FetchedMedia, MediaFetcher, create_scratch_dir, create_temp_path, hash_file,
    validate_source,
};
use crate::config::FetcherSettings;
use crate::error::FetchError;

/// Content type of everything the transcode step produces
const OUTPUT_CONTENT_TYPE: &str = "audio/mpeg";
const OUTPUT_SUFFIX: &str = ".mp3";

/// Name of the download inside a fetch's scratch directory
const DOWNLOAD_NAME: &str = "source.download";

/// Lines of tool stderr kept in error messages
const STDERR_TAIL_LINES: usize = 5;

/// Fetches media with yt-dlp and normalizes it with ffmpeg
#[derive(Debug, Clone)]
pub struct CommandFetcher {
    settings: FetcherSettings,
}

/// The parts of yt-dlp's JSON info we use
#[derive(Debug, Deserialize)]
struct MediaInfo {
    #[serde(default)]
    duration: Option<f64>,
}

impl CommandFetcher {
    pub fn new(settings: FetcherSettings) -> Self {
        Self { settings }
    }

    async fn download(&self, source: &Url, output: &Path) -> Result<Option<u32>, FetchError> {
        let url = source.as_str();
        let result = Command::new(&self.settings.ytdlp_path)
            .args([
                "--no-playlist",
                "--no-progress",
                "--force-overwrites",
                "--no-part",
                "--format",
                "bestaudio/best",
                "--dump-json",
                "--no-simulate",
                "--output",
            ])
            .arg(output)
            .arg(url)
            .kill_on_drop(true)
            .output()
            .await;

        let output = result.map_err(|e| FetchError::DownloadFailed {
            url: url.to_string(),
            reason: format!("cannot run {}: {}", self.settings.ytdlp_path.display(), e),
        })?;

        if !output.status.success() {
            return Err(classify_download_failure(url, &output));
        }

        Ok(parse_duration(&output.stdout))
    }

    async fn transcode(&self, source: &Url, input: &Path, output: &Path) -> Result<(), FetchError> {
        let url = source.as_str();
        let run = Command::new(&self.settings.ffmpeg_path)
            .arg("-y")
            .arg("-i")
            .arg(input)
            .args(&self.settings.ffmpeg_args)
            .arg(output)
            .kill_on_drop(true)
            .output();

        let result = tokio::time::timeout(self.settings.ffmpeg_timeout(), run)
            .await
            .map_err(|_| FetchError::TranscodeFailed {
                url: url.to_string(),
                reason: format!(
                    "ffmpeg timed out after {}s",
                    self.settings.ffmpeg_timeout().as_secs()
                ),
            })?;

        let output = result.map_err(|e| FetchError::TranscodeFailed {
            url: url.to_string(),
            reason: format!("cannot run {}: {}", self.settings.ffmpeg_path.display(), e),
        })?;

        if !output.status.success() {
            return Err(FetchError::TranscodeFailed {
                url: url.to_string(),
                reason: format!("ffmpeg exited with {}: {}", output.status, stderr_tail(&output)),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl MediaFetcher for CommandFetcher {
    async fn fetch(&self, source: &Url, context: &FetchContext) -> Result<FetchedMedia, FetchError> {
        validate_source(source)?;

        // yt-dlp may leave side files next to its output; they all live here
        let scratch = create_scratch_dir(context, source)?;
        let downloaded = scratch.path().join(DOWNLOAD_NAME);
        info!(job = %context.job_id, "downloading {}", source);
        let duration_secs = self.download(source, &downloaded).await?;

        let transcoded = create_temp_path(context, source, OUTPUT_SUFFIX)?;
        info!(job = %context.job_id, "transcoding {}", source);
        self.transcode(source, &downloaded, &transcoded).await?;
        drop(scratch);

        let (size, checksum) = hash_file(&transcoded)
            .await
            .map_err(|e| FetchError::TempFile {
                path: transcoded.to_path_buf(),
                source: e,
            })?;

        debug!(job = %context.job_id, size, ?duration_secs, "prepared audio for {}", source);

        Ok(FetchedMedia::new(
            transcoded,
            size,
            OUTPUT_CONTENT_TYPE,
            checksum,
            duration_secs,
        ))
    }
}

/// Decide whether a failed yt-dlp run is worth retrying
fn classify_download_failure(url: &str, output: &Output) -> FetchError {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let unsupported = ["Unsupported URL", "is not a valid URL"]
        .iter()
        .any(|marker| stderr.contains(marker));

    if unsupported {
        FetchError::UnsupportedSource {
            url: url.to_string(),
            reason: stderr_tail(output),
        }
    } else {
        FetchError::DownloadFailed {
            url: url.to_string(),
            reason: format!("yt-dlp exited with {}: {}", output.status, stderr_tail(output)),
        }
    }
}

/// Read the duration from the last JSON line yt-dlp printed
fn parse_duration(stdout: &[u8]) -> Option<u32> {
    String::from_utf8_lossy(stdout)
        .lines()
        .rev()
        .find_map(|line| serde_json::from_str::<MediaInfo>(line.trim()).ok())
        .and_then(|info| info.duration)
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(|secs| secs.round() as u32)
}

fn stderr_tail(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join(" | ")
}
