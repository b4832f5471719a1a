// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use sha2::{Digest, Sha256};
use url::Url;

/// Prefix for all audio objects in the artifact store
const AUDIO_KEY_PREFIX: &str = "audio";

/// Hex characters of the source digest kept in a key
const SOURCE_DIGEST_LENGTH: usize = 16;

/// Maximum length for the readable portion of a key
const MAX_SLUG_LENGTH: usize = 48;

/// Check if a character is allowed in object keys (whitelist approach)
fn is_valid_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ' ')
}

/// Generate the object key for audio fetched from `source`
///
/// Format: "audio/<digest>-<slug>.<ext>". The digest is taken from the full
/// source URL, so one source always maps to one key.
pub fn object_key(source: &Url, content_type: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(source.as_str().as_bytes()));
    let slug = source_slug(source);
    let ext = audio_extension(source, Some(content_type));

    if slug.is_empty() {
        format!(
            "{}/{}.{}",
            AUDIO_KEY_PREFIX,
            &digest[..SOURCE_DIGEST_LENGTH],
            ext
        )
    } else {
        format!(
            "{}/{}-{}.{}",
            AUDIO_KEY_PREFIX,
            &digest[..SOURCE_DIGEST_LENGTH],
            slug,
            ext
        )
    }
}

/// Prefix for temporary files holding media fetched from `source`
pub fn temp_file_prefix(source: &Url) -> String {
    let name = last_segment(source).unwrap_or("media");
    let sanitized = sanitize_filename::sanitize(name);
    let stem = sanitized.rsplit_once('.').map_or(sanitized.as_str(), |(stem, _)| stem);
    format!("podhost-{}-", truncate_at_boundary(stem, MAX_SLUG_LENGTH))
}

/// Get the audio file extension for a source
///
/// Prefers the MIME type, then the URL path, defaults to "mp3"
pub fn audio_extension(source: &Url, content_type: Option<&str>) -> String {
    if let Some(mime) = content_type
        && let Some(ext) = mime_to_extension(mime)
    {
        return ext.to_string();
    }

    if let Some(ext) = last_segment(source)
        .and_then(|filename| filename.rsplit_once('.'))
        .map(|(_, ext)| ext)
        .filter(|ext| is_valid_audio_extension(ext))
    {
        return ext.to_lowercase();
    }

    "mp3".to_string()
}

/// Guess the MIME type of a source from its URL path
pub fn guess_content_type(source: &Url) -> Option<&'static str> {
    last_segment(source)
        .and_then(|filename| filename.rsplit_once('.'))
        .and_then(|(_, ext)| extension_to_mime(ext))
}

fn last_segment(source: &Url) -> Option<&str> {
    source
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|segment| !segment.is_empty())
}

/// Readable key portion derived from the last path segment
fn source_slug(source: &Url) -> String {
    let Some(segment) = last_segment(source) else {
        return String::new();
    };
    let stem = segment.rsplit_once('.').map_or(segment, |(stem, _)| stem);

    let sanitized: String = stem
        .chars()
        .map(|c| if is_valid_key_char(c) { c } else { '-' })
        .collect();

    let collapsed = collapse_separators(&sanitized.to_lowercase());
    let trimmed = collapsed.trim_matches(|c: char| c == '-' || c.is_whitespace());

    truncate_at_boundary(trimmed, MAX_SLUG_LENGTH)
}

/// Collapse multiple spaces and dashes into single dashes
fn collapse_separators(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut last_was_separator = false;

    for c in s.chars() {
        if c == '-' || c.is_whitespace() {
            if !last_was_separator {
                result.push('-');
                last_was_separator = true;
            }
        } else {
            result.push(c);
            last_was_separator = false;
        }
    }

    result
}

/// Truncate string at a word boundary
fn truncate_at_boundary(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }

    let truncated: String = s.chars().take(max_len).collect();
    if let Some(pos) = truncated.rfind('-')
        && pos > max_len / 2
    {
        return truncated[..pos].to_string();
    }

    truncated.trim_end_matches('-').to_string()
}

/// Check if a string is a valid audio file extension
fn is_valid_audio_extension(ext: &str) -> bool {
    matches!(
        ext.to_lowercase().as_str(),
        "mp3" | "m4a" | "mp4" | "aac" | "ogg" | "opus" | "wav" | "flac"
    )
}

/// Map MIME types to file extensions
fn mime_to_extension(mime: &str) -> Option<&'static str> {
    match mime.to_lowercase().as_str() {
        "audio/mpeg" | "audio/mp3" => Some("mp3"),
        "audio/mp4" | "audio/m4a" | "audio/x-m4a" => Some("m4a"),
        "audio/aac" => Some("aac"),
        "audio/ogg" => Some("ogg"),
        "audio/opus" => Some("opus"),
        "audio/wav" | "audio/x-wav" => Some("wav"),
        "audio/flac" | "audio/x-flac" => Some("flac"),
        _ => None,
    }
}

/// Map file extensions to MIME types
pub fn extension_to_mime(ext: &str) -> Option<&'static str> {
    match ext.to_lowercase().as_str() {
        "mp3" => Some("audio/mpeg"),
        "m4a" | "mp4" => Some("audio/mp4"),
        "aac" => Some("audio/aac"),
        "ogg" => Some("audio/ogg"),
        "opus" => Some("audio/opus"),
        "wav" => Some("audio/wav"),
        "flac" => Some("audio/flac"),
        _ => None,
    }
}
