// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use url::Url;

use crate::error::FeedError;

/// Check that a feed location can be handed to the transport
///
/// The location itself is kept verbatim as the subscription key; the parsed
/// URL is only returned for inspection.
pub fn validate_feed_url(location: &str) -> Result<Url, FeedError> {
    let url = Url::parse(location)?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(FeedError::UnsupportedScheme {
            scheme: scheme.to_string(),
        }),
    }
}
