// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::model::{Collection, Podcast};

/// How a parsed podcast relates to the collection it is merged into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// New subscription, appended at the end
    Added,
    /// Existing subscription at this index, replaced in place
    Updated(usize),
}

/// Determine whether merging `podcast` would add or update a subscription
pub fn merge_outcome(collection: &Collection, podcast: &Podcast) -> MergeOutcome {
    match collection.position(&podcast.feed_location) {
        Some(index) => MergeOutcome::Updated(index),
        None => MergeOutcome::Added,
    }
}

/// Fold a freshly parsed podcast into a collection
///
/// An existing podcast with the same feed location is replaced entirely,
/// keeping its position. Otherwise the podcast is appended. The input
/// collection is left untouched.
pub fn merge(collection: &Collection, podcast: Podcast) -> Collection {
    let last_update = match collection.last_update {
        Some(previous) if previous >= podcast.last_checked => Some(previous),
        _ => Some(podcast.last_checked),
    };

    let mut podcasts = collection.podcasts.clone();
    match merge_outcome(collection, &podcast) {
        MergeOutcome::Updated(index) => podcasts[index] = podcast,
        MergeOutcome::Added => podcasts.push(podcast),
    }

    Collection {
        podcasts,
        last_update,
    }
}
