// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use chrono::{DateTime, Utc};
use rss::extension::itunes::{ITunesChannelExtensionBuilder, ITunesItemExtensionBuilder};
use rss::{ChannelBuilder, EnclosureBuilder, GuidBuilder, ImageBuilder, Item, ItemBuilder};
use tracing::error;

use crate::config::FeedSettings;
use crate::error::FeedError;
use crate::model::{Episode, EpisodeState, Podcast};

/// Select the episodes a feed lists, newest first.
///
/// Only published episodes with stored audio are listed; ties on the
/// publish time are broken by id so the order is total. An episode that
/// belongs to another podcast is a consistency error.
pub fn listed_episodes<'a>(
    podcast: &Podcast,
    episodes: &'a [Episode],
) -> Result<Vec<&'a Episode>, FeedError> {
    let mut listed = Vec::new();

    for episode in episodes {
        if episode.podcast_id != podcast.id {
            return Err(FeedError::Consistency {
                podcast: podcast.id,
                reason: format!(
                    "episode {} belongs to podcast {}",
                    episode.id, episode.podcast_id
                ),
            });
        }

        if episode.is_listable() {
            listed.push(episode);
        } else if episode.state == EpisodeState::Published {
            error!(
                podcast = %podcast.id,
                episode = %episode.id,
                "published episode has no audio, leaving it out of the feed"
            );
        }
    }

    listed.sort_by(|a, b| {
        b.published_at
            .cmp(&a.published_at)
            .then_with(|| a.id.cmp(&b.id))
    });

    Ok(listed)
}

/// Render the RSS document for a podcast.
///
/// Output depends only on the arguments: the same podcast and episodes give
/// byte-identical XML. `generated_at` becomes `lastBuildDate` and is left
/// out entirely when `None`.
pub fn render_feed(
    podcast: &Podcast,
    episodes: &[Episode],
    settings: &FeedSettings,
    generated_at: Option<DateTime<Utc>>,
) -> Result<String, FeedError> {
    let listed = listed_episodes(podcast, episodes)?;

    let link = podcast
        .link
        .as_ref()
        .unwrap_or(&settings.site_url)
        .to_string();
    let image_url = podcast
        .image_url
        .as_ref()
        .unwrap_or(&settings.default_image_url)
        .to_string();

    let items: Vec<Item> = listed
        .iter()
        .map(|episode| render_item(podcast, episode, &image_url))
        .collect();

    let image = ImageBuilder::default()
        .url(image_url.clone())
        .title(podcast.name.clone())
        .link(link.clone())
        .build();

    let itunes = ITunesChannelExtensionBuilder::default()
        .author(podcast.author.clone())
        .explicit(Some(explicit_flag(podcast.explicit)))
        .image(Some(image_url))
        .summary(podcast.description.clone())
        .build();

    let channel = ChannelBuilder::default()
        .title(podcast.name.clone())
        .link(link)
        .description(podcast.description.clone().unwrap_or_default())
        .language(Some(
            podcast
                .language
                .clone()
                .unwrap_or_else(|| settings.language.clone()),
        ))
        .generator(Some(settings.generator.clone()))
        .last_build_date(generated_at.map(|at| at.to_rfc2822()))
        .image(Some(image))
        .itunes_ext(Some(itunes))
        .items(items)
        .build();

    let bytes = channel.write_to(Vec::new())?;
    String::from_utf8(bytes).map_err(|e| FeedError::Consistency {
        podcast: podcast.id,
        reason: format!("rendered document is not UTF-8: {}", e),
    })
}

fn render_item(podcast: &Podcast, episode: &Episode, channel_image: &str) -> Item {
    // listed_episodes only lets episodes with audio and a publish time through
    let enclosure = episode.audio.as_ref().map(|audio| {
        EnclosureBuilder::default()
            .url(audio.url.to_string())
            .length(audio.size.to_string())
            .mime_type(audio.content_type.clone())
            .build()
    });
    let duration = episode
        .audio
        .as_ref()
        .and_then(|audio| audio.duration_secs)
        .map(format_duration);

    let image = episode
        .image_url
        .as_ref()
        .map_or_else(|| channel_image.to_string(), |url| url.to_string());

    let itunes = ITunesItemExtensionBuilder::default()
        .author(episode.author.clone().or_else(|| podcast.author.clone()))
        .duration(duration)
        .explicit(Some(explicit_flag(podcast.explicit)))
        .image(Some(image))
        .build();

    let guid = GuidBuilder::default()
        .value(episode.id.to_string())
        .permalink(false)
        .build();

    ItemBuilder::default()
        .title(Some(episode.title.clone()))
        .link(Some(episode.source_url.to_string()))
        .description(Some(episode.description.clone().unwrap_or_default()))
        .guid(Some(guid))
        .pub_date(episode.published_at.map(|at| at.to_rfc2822()))
        .enclosure(enclosure)
        .itunes_ext(Some(itunes))
        .build()
}

fn explicit_flag(explicit: bool) -> String {
    if explicit { "true" } else { "false" }.to_string()
}

/// Format seconds as HH:MM:SS
fn format_duration(secs: u32) -> String {
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}
