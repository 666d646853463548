// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

mod http;

pub use http::HttpTransport;

use std::fmt;
use std::path::PathBuf;

use crate::error::TransportError;

/// Identifier assigned by the transport when a download is enqueued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DownloadId(pub u64);

impl fmt::Display for DownloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where a finished download was stored locally
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalHandle {
    pub id: DownloadId,
    pub path: PathBuf,
}

/// Notifications delivered on a transport's completion channel
#[derive(Debug)]
pub enum TransportEvent {
    Completed(DownloadId),
    Failed {
        id: DownloadId,
        error: TransportError,
    },
}

/// A download facility performing the actual transfers
///
/// All queries are synchronous lookups; the transfers themselves run in the
/// background and report on the channel handed out when the transport is
/// created.
pub trait Transport: Send + Sync {
    /// Start downloading `url`, returning its unique identifier
    fn enqueue(&self, url: &str) -> Result<DownloadId, TransportError>;

    /// Bytes received so far, `None` if the id is unknown
    fn query_progress(&self, id: DownloadId) -> Option<u64>;

    /// Local storage of a finished download
    fn resolve_local_handle(&self, id: DownloadId) -> Option<LocalHandle>;

    /// MIME type of a finished download
    fn resolve_mime_type(&self, handle: &LocalHandle) -> Option<String>;

    /// Forget a finished download and drop its local data
    fn release(&self, _id: DownloadId) {}
}
