// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

/// All subscribed podcasts, in subscription order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    #[serde(default)]
    pub podcasts: Vec<Podcast>,
    /// Time of the most recent successful sync
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<DateTime<Utc>>,
}

/// Metadata of a single subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Podcast {
    /// Source URL of the feed, the natural key within a collection
    pub feed_location: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_location: Option<String>,
    /// Newest first
    #[serde(default)]
    pub episodes: Vec<Episode>,
    pub last_checked: DateTime<Utc>,
}

/// A single item of a podcast feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub title: String,
    pub audio_location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish_date: Option<DateTime<FixedOffset>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<u64>,
}

impl Collection {
    /// Number of subscribed podcasts
    pub fn len(&self) -> usize {
        self.podcasts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.podcasts.is_empty()
    }

    /// Check whether a feed location is already subscribed (exact match)
    pub fn contains(&self, feed_location: &str) -> bool {
        self.position(feed_location).is_some()
    }

    /// Index of the podcast with the given feed location
    pub fn position(&self, feed_location: &str) -> Option<usize> {
        self.podcasts
            .iter()
            .position(|podcast| podcast.feed_location == feed_location)
    }

    /// Feed locations of all subscriptions, in subscription order
    pub fn feed_locations(&self) -> impl Iterator<Item = &str> {
        self.podcasts.iter().map(|p| p.feed_location.as_str())
    }
}
