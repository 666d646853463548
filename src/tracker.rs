use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::error::{TrackerError, TransportError};
use crate::transport::{DownloadId, Transport};

/// Purpose of a download, fixed when it is requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DownloadKind {
    Feed,
    Audio,
    Image,
}

impl fmt::Display for DownloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DownloadKind::Feed => "feed",
            DownloadKind::Audio => "audio",
            DownloadKind::Image => "image",
        };
        f.write_str(name)
    }
}

/// Correlation data for one in-flight download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRecord {
    pub id: DownloadId,
    pub kind: DownloadKind,
    /// The remote URL that was requested
    pub source_location: String,
}

#[derive(Debug)]
struct Tracked {
    record: DownloadRecord,
    last_known_bytes: u64,
}

/// Set of in-flight downloads, keyed by transport id
///
/// Holds no podcast data, only what is needed to recover the purpose and
/// origin of a download once the transport reports it finished.
#[derive(Debug, Default)]
pub struct DownloadTracker {
    active: Mutex<HashMap<DownloadId, Tracked>>,
}

impl DownloadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<DownloadId, Tracked>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand `source_location` to the transport and start tracking it
    ///
    /// The record is inserted while the table is locked, so a completion for
    /// the new id cannot be processed before the record exists.
    pub fn register(
        &self,
        transport: &dyn Transport,
        kind: DownloadKind,
        source_location: &str,
    ) -> Result<DownloadId, TransportError> {
        let mut active = self.lock();
        let id = transport.enqueue(source_location)?;

        let record = DownloadRecord {
            id,
            kind,
            source_location: source_location.to_string(),
        };
        if let Some(previous) = active.insert(
            id,
            Tracked {
                record,
                last_known_bytes: 0,
            },
        ) {
            warn!(
                id = %id,
                previous = %previous.record.source_location,
                "Transport reused an active download id"
            );
        }

        debug!(id = %id, %kind, url = source_location, "Download registered");
        Ok(id)
    }

    /// Identifiers of all in-flight downloads
    pub fn active_ids(&self) -> BTreeSet<DownloadId> {
        self.lock().keys().copied().collect()
    }

    pub fn is_idle(&self) -> bool {
        self.lock().is_empty()
    }

    /// Bytes received so far for an in-flight download
    ///
    /// Unknown ids report 0. If the transport no longer knows the id, the last
    /// value seen is returned.
    pub fn progress(&self, transport: &dyn Transport, id: DownloadId) -> u64 {
        let mut active = self.lock();
        let Some(tracked) = active.get_mut(&id) else {
            return 0;
        };

        if let Some(bytes) = transport.query_progress(id) {
            tracked.last_known_bytes = bytes;
        }
        tracked.last_known_bytes
    }

    /// Stop tracking a download and return its record
    pub fn complete(&self, id: DownloadId) -> Result<DownloadRecord, TrackerError> {
        self.lock()
            .remove(&id)
            .map(|tracked| tracked.record)
            .ok_or(TrackerError::UnknownDownload(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalHandle;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct MockTransport {
        next_id: AtomicU64,
        progress: Mutex<HashMap<DownloadId, u64>>,
    }

    impl Transport for MockTransport {
        fn enqueue(&self, url: &str) -> Result<DownloadId, TransportError> {
            if url.starts_with("ftp://") {
                return Err(TransportError::Rejected {
                    url: url.to_string(),
                    reason: "unsupported".to_string(),
                });
            }
            Ok(DownloadId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1))
        }

        fn query_progress(&self, id: DownloadId) -> Option<u64> {
            self.progress.lock().unwrap().get(&id).copied()
        }

        fn resolve_local_handle(&self, _id: DownloadId) -> Option<LocalHandle> {
            None
        }

        fn resolve_mime_type(&self, _handle: &LocalHandle) -> Option<String> {
            None
        }
    }

    #[test]
    fn register_and_complete_pairs_leave_tracker_idle() {
        let transport = MockTransport::default();
        let tracker = DownloadTracker::new();

        let ids: Vec<_> = ["https://a/feed", "https://b/feed", "https://c/img.png"]
            .iter()
            .map(|url| tracker.register(&transport, DownloadKind::Feed, url).unwrap())
            .collect();

        assert_eq!(tracker.active_ids().len(), 3);

        for id in ids.iter().rev() {
            tracker.complete(*id).unwrap();
        }

        assert!(tracker.active_ids().is_empty());
        assert!(tracker.is_idle());
    }

    #[test]
    fn complete_returns_recorded_kind_and_source() {
        let transport = MockTransport::default();
        let tracker = DownloadTracker::new();

        let id = tracker
            .register(&transport, DownloadKind::Image, "https://example.com/cover.jpg")
            .unwrap();
        let record = tracker.complete(id).unwrap();

        assert_eq!(
            record,
            DownloadRecord {
                id,
                kind: DownloadKind::Image,
                source_location: "https://example.com/cover.jpg".to_string(),
            }
        );
    }

    #[test]
    fn complete_twice_fails_with_unknown_download() {
        let transport = MockTransport::default();
        let tracker = DownloadTracker::new();

        let id = tracker
            .register(&transport, DownloadKind::Feed, "https://a/feed")
            .unwrap();
        tracker.complete(id).unwrap();

        assert_eq!(
            tracker.complete(id),
            Err(TrackerError::UnknownDownload(id))
        );
    }

    #[test]
    fn complete_unregistered_fails_with_unknown_download() {
        let tracker = DownloadTracker::new();

        assert_eq!(
            tracker.complete(DownloadId(7)),
            Err(TrackerError::UnknownDownload(DownloadId(7)))
        );
    }

    #[test]
    fn rejected_enqueue_is_not_tracked() {
        let transport = MockTransport::default();
        let tracker = DownloadTracker::new();

        let result = tracker.register(&transport, DownloadKind::Feed, "ftp://a/feed");

        assert!(result.is_err());
        assert!(tracker.is_idle());
    }

    #[test]
    fn progress_of_unknown_id_is_zero() {
        let transport = MockTransport::default();
        let tracker = DownloadTracker::new();

        assert_eq!(tracker.progress(&transport, DownloadId(99)), 0);
    }

    #[test]
    fn progress_keeps_last_known_value() {
        let transport = MockTransport::default();
        let tracker = DownloadTracker::new();
        let id = tracker
            .register(&transport, DownloadKind::Audio, "https://a/ep.mp3")
            .unwrap();

        transport.progress.lock().unwrap().insert(id, 2048);
        assert_eq!(tracker.progress(&transport, id), 2048);

        transport.progress.lock().unwrap().remove(&id);
        assert_eq!(tracker.progress(&transport, id), 2048);

        tracker.complete(id).unwrap();
        assert_eq!(tracker.progress(&transport, id), 0);
    }
}
