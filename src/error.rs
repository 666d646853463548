use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::transport::DownloadId;

/// Errors that can occur when reading or parsing a downloaded feed
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Failed to read feed file {path}: {source}")]
    FileReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse RSS feed from {url}: {source}")]
    ParseFailed {
        url: String,
        #[source]
        source: rss::Error,
    },

    #[error("Invalid feed URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Unsupported feed URL scheme '{scheme}' (expected http or https)")]
    UnsupportedScheme { scheme: String },

    #[error("Feed parser task failed: {0}")]
    TaskFailed(String),
}

/// Errors reported by the download transport
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("HTTP request failed for {url}: {source}")]
    HttpFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP error {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Failed to create file {path}: {source}")]
    FileCreateFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write to file {path}: {source}")]
    FileWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Stream error while downloading {url}: {source}")]
    StreamFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Transport refused download of {url}: {reason}")]
    Rejected { url: String, reason: String },
}

/// Errors raised by the download tracker
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrackerError {
    #[error("Unknown download {0}")]
    UnknownDownload(DownloadId),
}

/// Errors that can occur while loading or saving the collection
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to read collection file {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write collection file {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Collection file {path} is corrupted: {source}")]
    Deserialization {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize collection: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors returned to callers of the download coordinator
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Podcast {0} is already in the collection")]
    DuplicateSubscription(String),

    #[error("Invalid feed URL {url}: {source}")]
    InvalidFeedUrl {
        url: String,
        #[source]
        source: FeedError,
    },

    #[error("No download transport is bound")]
    TransportUnavailable,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Collection was updated recently, next update possible in {remaining:?}")]
    UpdateThrottled { remaining: Duration },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}
