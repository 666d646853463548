// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::cmp::Reverse;
use std::collections::HashSet;

use chrono::{DateTime, FixedOffset, Utc};

use crate::collection::{Episode, Podcast};
use crate::error::FeedError;
use crate::transport::LocalHandle;

/// Turns a downloaded feed document into a podcast record
pub trait FeedParser: Send + Sync {
    /// Parse the document stored at `handle`, which was fetched from
    /// `source_location`
    fn parse(&self, handle: &LocalHandle, source_location: &str) -> Result<Podcast, FeedError>;
}

/// Feed parser for RSS 2.0 documents (with iTunes extensions)
#[derive(Debug, Default, Clone, Copy)]
pub struct RssFeedParser;

impl FeedParser for RssFeedParser {
    fn parse(&self, handle: &LocalHandle, source_location: &str) -> Result<Podcast, FeedError> {
        let bytes = std::fs::read(&handle.path).map_err(|e| FeedError::FileReadFailed {
            path: handle.path.clone(),
            source: e,
        })?;
        parse_feed(&bytes, source_location)
    }
}

/// Parse RSS feed XML bytes into a Podcast
///
/// Episodes are ordered newest first (undated ones last) and deduplicated by
/// audio location.
pub fn parse_feed(xml_bytes: &[u8], feed_location: &str) -> Result<Podcast, FeedError> {
    let channel = rss::Channel::read_from(xml_bytes).map_err(|e| FeedError::ParseFailed {
        url: feed_location.to_string(),
        source: e,
    })?;

    let mut seen = HashSet::new();
    let mut episodes: Vec<Episode> = channel
        .items()
        .iter()
        .filter_map(parse_episode)
        .filter(|episode| seen.insert(episode.audio_location.clone()))
        .collect();
    episodes.sort_by_key(|episode| Reverse(episode.publish_date));

    let image_location = channel
        .image()
        .map(|img| img.url().to_string())
        .or_else(|| {
            channel
                .itunes_ext()
                .and_then(|ext| ext.image())
                .map(String::from)
        })
        .filter(|url| !url.is_empty());

    Ok(Podcast {
        feed_location: feed_location.to_string(),
        title: channel.title().to_string(),
        description: Some(channel.description().to_string()).filter(|s| !s.is_empty()),
        image_location,
        episodes,
        last_checked: Utc::now(),
    })
}

fn parse_episode(item: &rss::Item) -> Option<Episode> {
    let enclosure = item.enclosure()?;
    let audio_location = enclosure.url().trim();
    if audio_location.is_empty() {
        return None;
    }

    let title = item
        .title()
        .map(String::from)
        .unwrap_or_else(|| "Untitled Episode".to_string());

    let publish_date = item.pub_date().and_then(|date_str| {
        DateTime::parse_from_rfc2822(date_str)
            .ok()
            .or_else(|| parse_relaxed_date(date_str))
    });

    let duration_seconds = item
        .itunes_ext()
        .and_then(|ext| ext.duration())
        .and_then(parse_duration);

    Some(Episode {
        title,
        audio_location: audio_location.to_string(),
        publish_date,
        duration_seconds,
    })
}

/// Try to parse dates that don't strictly conform to RFC 2822
fn parse_relaxed_date(date_str: &str) -> Option<DateTime<FixedOffset>> {
    let formats = [
        "%a, %d %b %Y %H:%M:%S %z",
        "%Y-%m-%dT%H:%M:%S%:z",
        "%Y-%m-%d %H:%M:%S %z",
    ];

    formats
        .iter()
        .find_map(|format| DateTime::parse_from_str(date_str.trim(), format).ok())
}

/// Parse an `itunes:duration` value (`SS`, `MM:SS` or `HH:MM:SS`) into seconds
pub fn parse_duration(value: &str) -> Option<u64> {
    let parts: Vec<&str> = value.trim().split(':').collect();
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }

    parts.iter().try_fold(0u64, |total, part| {
        // Fractional seconds are dropped
        let whole = part.split('.').next().unwrap_or("");
        let value: u64 = whole.trim().parse().ok()?;
        total.checked_mul(60)?.checked_add(value)
    })
}
