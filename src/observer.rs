use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::collection::Collection;
use crate::tracker::DownloadKind;
use crate::transport::DownloadId;

/// Events emitted by the download coordinator
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A download was accepted by the transport
    DownloadRequested {
        id: DownloadId,
        kind: DownloadKind,
        url: String,
    },

    /// The transport refused to start a download
    DownloadRejected { url: String, error: String },

    /// Periodic progress snapshot for an active download
    ProgressUpdate { id: DownloadId, bytes_so_far: u64 },

    /// The transport finished a download
    DownloadComplete { id: DownloadId },

    /// The transport gave up on a download. Not retried.
    DownloadFailed {
        id: DownloadId,
        url: String,
        error: String,
    },

    /// A downloaded feed could not be parsed; nothing was merged for `url`
    FeedFailed { url: String, error: String },

    /// A new collection snapshot was published
    CollectionChanged { collection: Arc<Collection> },
}

/// Receiver of coordinator events.
///
/// Events are delivered on worker tasks. Implementations that drive a UI
/// must hand them over to their own context.
pub trait Observer: Send + Sync {
    fn notify(&self, event: SyncEvent);
}

/// A shared reference to an observer
pub type SharedObserver = Arc<dyn Observer>;

/// An observer that silently ignores all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl Observer for NoopObserver {
    fn notify(&self, _event: SyncEvent) {}
}

impl NoopObserver {
    /// Create a new NoopObserver wrapped in an Arc
    pub fn shared() -> SharedObserver {
        Arc::new(Self)
    }
}

/// Handle returned on registration, used to unregister again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverId(u64);

/// Zero or more registered observers
#[derive(Default)]
pub struct ObserverRegistry {
    next_id: AtomicU64,
    observers: RwLock<Vec<(ObserverId, SharedObserver)>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, observer: SharedObserver) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, observer));
        id
    }

    /// Returns false if the id was not registered
    pub fn unregister(&self, id: ObserverId) -> bool {
        let mut observers = self
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = observers.len();
        observers.retain(|(registered, _)| *registered != id);
        observers.len() != before
    }

    pub fn len(&self) -> usize {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver an event to every registered observer
    pub fn notify(&self, event: SyncEvent) {
        // Snapshot so observers may (un)register from within notify
        let observers: Vec<SharedObserver> = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();

        for observer in observers {
            observer.notify(event.clone());
        }
    }
}
