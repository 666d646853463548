pub mod collection;
pub mod coordinator;
pub mod error;
pub mod feed;
pub mod http;
pub mod media_type;
pub mod observer;
pub mod store;
pub mod tracker;
pub mod transport;

// Re-export main types for convenience
pub use collection::{Collection, Episode, MergeOutcome, Podcast, merge};
pub use coordinator::{CoordinatorOptions, DownloadCoordinator};
pub use error::{CoordinatorError, FeedError, StoreError, TrackerError, TransportError};
pub use feed::{FeedParser, RssFeedParser, parse_feed, validate_feed_url};
pub use http::{HttpClient, HttpResponse, ReqwestClient};
pub use observer::{NoopObserver, Observer, ObserverId, SharedObserver, SyncEvent};
pub use store::{CollectionStore, FileStorage, Storage};
pub use tracker::{DownloadKind, DownloadTracker};
pub use transport::{DownloadId, HttpTransport, LocalHandle, Transport, TransportEvent};
