// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::collection::{Collection, MergeOutcome, Podcast, merge, merge_outcome};
use crate::error::{CoordinatorError, FeedError, StoreError, TransportError};
use crate::feed::{FeedParser, validate_feed_url};
use crate::media_type::resolve_kind;
use crate::observer::{ObserverId, ObserverRegistry, SharedObserver, SyncEvent};
use crate::store::CollectionStore;
use crate::tracker::{DownloadKind, DownloadTracker};
use crate::transport::{DownloadId, LocalHandle, Transport, TransportEvent};

/// Options for the download coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// How often progress of active downloads is polled
    pub progress_interval: Duration,
    /// Minimum time between two collection updates, unless forced
    pub min_update_interval: Duration,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            progress_interval: Duration::from_secs(1),
            min_update_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Orchestrates downloads and keeps the podcast collection in sync
///
/// Requests are handed to the bound transport and tracked by id. Completed
/// feed downloads are parsed on worker tasks and merged one at a time into
/// the collection, which is then published to subscribers and persisted.
pub struct DownloadCoordinator {
    tracker: DownloadTracker,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    parser: Arc<dyn FeedParser>,
    store: Arc<CollectionStore>,
    observers: ObserverRegistry,
    collection: watch::Sender<Arc<Collection>>,
    merge_lock: Mutex<()>,
    ticker: Mutex<Option<JoinHandle<()>>>,
    in_progress: AtomicUsize,
    settled: Notify,
    options: CoordinatorOptions,
}

impl DownloadCoordinator {
    /// Create a coordinator around an already loaded collection
    pub fn new(
        collection: Collection,
        store: Arc<CollectionStore>,
        parser: Arc<dyn FeedParser>,
        options: CoordinatorOptions,
    ) -> Arc<Self> {
        let (collection, _) = watch::channel(Arc::new(collection));
        Arc::new(Self {
            tracker: DownloadTracker::new(),
            transport: RwLock::new(None),
            parser,
            store,
            observers: ObserverRegistry::new(),
            collection,
            merge_lock: Mutex::new(()),
            ticker: Mutex::new(None),
            in_progress: AtomicUsize::new(0),
            settled: Notify::new(),
            options,
        })
    }

    /// Load the persisted collection and create a coordinator for it
    ///
    /// A corrupted collection is an error; the coordinator is not created
    /// rather than starting from an empty collection that would overwrite it.
    pub async fn load(
        store: Arc<CollectionStore>,
        parser: Arc<dyn FeedParser>,
        options: CoordinatorOptions,
    ) -> Result<Arc<Self>, CoordinatorError> {
        let collection = store.load().await?;
        info!(podcasts = collection.len(), "Collection loaded");
        Ok(Self::new(collection, store, parser, options))
    }

    /// Attach the transport that performs downloads
    pub fn bind_transport(&self, transport: Arc<dyn Transport>) {
        *self
            .transport
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(transport);
    }

    /// Detach the transport. Returns false if none was bound.
    pub fn unbind_transport(&self) -> bool {
        self.transport
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }

    fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn register_observer(&self, observer: SharedObserver) -> ObserverId {
        self.observers.register(observer)
    }

    pub fn unregister_observer(&self, id: ObserverId) -> bool {
        self.observers.unregister(id)
    }

    /// Current collection snapshot
    pub fn collection(&self) -> Arc<Collection> {
        self.collection.borrow().clone()
    }

    /// Receiver that sees every published collection snapshot
    pub fn subscribe(&self) -> watch::Receiver<Arc<Collection>> {
        self.collection.subscribe()
    }

    pub fn active_downloads(&self) -> BTreeSet<DownloadId> {
        self.tracker.active_ids()
    }

    /// Whether the periodic progress poll is currently running
    pub fn is_polling_progress(&self) -> bool {
        self.ticker_slot()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Wait until no download is in flight and no feed is being imported
    pub async fn settled(&self) {
        loop {
            let notified = self.settled.notified();
            if self.tracker.is_idle() && self.in_progress.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Subscribe to a new podcast feed
    ///
    /// Rejects locations that are already in the collection before anything
    /// is downloaded.
    pub fn add_podcast(
        self: &Arc<Self>,
        feed_location: &str,
    ) -> Result<DownloadId, CoordinatorError> {
        validate_feed_url(feed_location).map_err(|source| CoordinatorError::InvalidFeedUrl {
            url: feed_location.to_string(),
            source,
        })?;

        if self.collection().contains(feed_location) {
            return Err(CoordinatorError::DuplicateSubscription(
                feed_location.to_string(),
            ));
        }

        let transport = self.transport().ok_or(CoordinatorError::TransportUnavailable)?;
        let id = self.request_one(transport.as_ref(), DownloadKind::Feed, feed_location)?;
        self.ensure_progress_polling();
        Ok(id)
    }

    /// Re-download the feeds of all subscriptions
    ///
    /// Unless `force` is set, refuses to run again before
    /// `min_update_interval` has passed since the last successful sync.
    pub fn update_collection(
        self: &Arc<Self>,
        force: bool,
    ) -> Result<Vec<DownloadId>, CoordinatorError> {
        let collection = self.collection();

        if !force && let Some(last_update) = collection.last_update {
            let elapsed = (Utc::now() - last_update).to_std().unwrap_or(Duration::ZERO);
            if elapsed < self.options.min_update_interval {
                return Err(CoordinatorError::UpdateThrottled {
                    remaining: self.options.min_update_interval - elapsed,
                });
            }
        }

        let feeds: Vec<&str> = collection.feed_locations().collect();
        info!(podcasts = feeds.len(), "Updating collection");
        self.request_download(feeds.as_slice(), DownloadKind::Feed)
    }

    /// Start downloads for `urls`, all of the given kind
    ///
    /// Returns the ids of the downloads the transport accepted. URLs it
    /// refused are reported to observers and left out. Without a bound
    /// transport nothing is requested and `TransportUnavailable` is returned.
    pub fn request_download<S: AsRef<str>>(
        self: &Arc<Self>,
        urls: &[S],
        kind: DownloadKind,
    ) -> Result<Vec<DownloadId>, CoordinatorError> {
        let transport = self.transport().ok_or(CoordinatorError::TransportUnavailable)?;

        let mut ids = Vec::with_capacity(urls.len());
        for url in urls {
            let url = url.as_ref();
            match self.request_one(transport.as_ref(), kind, url) {
                Ok(id) => ids.push(id),
                Err(e) => {
                    warn!(url, error = %e, "Transport refused download");
                    self.observers.notify(SyncEvent::DownloadRejected {
                        url: url.to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }

        if !ids.is_empty() {
            self.ensure_progress_polling();
        }
        Ok(ids)
    }

    fn request_one(
        &self,
        transport: &dyn Transport,
        kind: DownloadKind,
        url: &str,
    ) -> Result<DownloadId, TransportError> {
        let id = self.tracker.register(transport, kind, url)?;
        self.observers.notify(SyncEvent::DownloadRequested {
            id,
            kind,
            url: url.to_string(),
        });
        Ok(id)
    }

    /// Process transport events until the channel closes
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            // Feed imports run detached, merges serialize themselves
            let _ = self.handle_event(event);
        }
        debug!("Transport channel closed");
        self.stop_progress_polling_if_idle();
    }

    /// Dispatch a single transport event
    ///
    /// Returns the worker task if the event started a feed import.
    pub fn handle_event(self: &Arc<Self>, event: TransportEvent) -> Option<JoinHandle<()>> {
        match event {
            TransportEvent::Completed(id) => self.on_completion(id),
            TransportEvent::Failed { id, error } => {
                self.on_failure(id, &error);
                None
            }
        }
    }

    /// Handle a finished download
    ///
    /// Duplicate or late completions for untracked ids are logged and
    /// ignored. Feed downloads are parsed and merged on a worker task, which
    /// is returned.
    pub fn on_completion(self: &Arc<Self>, id: DownloadId) -> Option<JoinHandle<()>> {
        // A feed import registers itself before this guard is released
        let _settle = SettleGuard::enter(self);

        let record = match self.tracker.complete(id) {
            Ok(record) => record,
            Err(e) => {
                debug!(error = %e, "Ignoring completion");
                return None;
            }
        };
        self.stop_progress_polling_if_idle();
        self.observers.notify(SyncEvent::DownloadComplete { id });

        let Some(transport) = self.transport() else {
            warn!(id = %id, "Download completed without a bound transport, discarding");
            return None;
        };
        let Some(handle) = transport.resolve_local_handle(id) else {
            warn!(id = %id, url = %record.source_location, "No local data for completed download");
            return None;
        };
        let mime = transport.resolve_mime_type(&handle);

        match resolve_kind(record.kind, mime.as_deref()) {
            Some(DownloadKind::Feed) => {
                Some(self.spawn_feed_import(transport, handle, record.source_location))
            }
            Some(kind) => {
                debug!(id = %id, %kind, "Media download complete");
                None
            }
            None => {
                warn!(
                    id = %id,
                    requested = %record.kind,
                    mime = mime.as_deref().unwrap_or("unknown"),
                    "Discarding download with unexpected MIME type"
                );
                transport.release(id);
                None
            }
        }
    }

    fn on_failure(&self, id: DownloadId, error: &TransportError) {
        let _settle = SettleGuard::enter(self);

        match self.tracker.complete(id) {
            Ok(record) => {
                warn!(id = %id, url = %record.source_location, %error, "Download failed");
                if let Some(transport) = self.transport() {
                    transport.release(id);
                }
                self.observers.notify(SyncEvent::DownloadFailed {
                    id,
                    url: record.source_location,
                    error: error.to_string(),
                });
            }
            Err(e) => debug!(error = %e, "Ignoring failure"),
        }
        self.stop_progress_polling_if_idle();
    }

    fn spawn_feed_import(
        self: &Arc<Self>,
        transport: Arc<dyn Transport>,
        handle: LocalHandle,
        source_location: String,
    ) -> JoinHandle<()> {
        let this = self.clone();
        self.in_progress.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let id = handle.id;
            match this.parse_download(handle, source_location.clone()).await {
                Ok(podcast) => {
                    this.merge_podcast(podcast);
                }
                Err(e) => {
                    warn!(url = %source_location, error = %e, "Could not parse feed");
                    this.observers.notify(SyncEvent::FeedFailed {
                        url: source_location,
                        error: e.to_string(),
                    });
                }
            }
            transport.release(id);
            this.in_progress.fetch_sub(1, Ordering::SeqCst);
            this.settled.notify_waiters();
        })
    }

    async fn parse_download(
        &self,
        handle: LocalHandle,
        source_location: String,
    ) -> Result<Podcast, FeedError> {
        let parser = self.parser.clone();
        tokio::task::spawn_blocking(move || parser.parse(&handle, &source_location))
            .await
            .map_err(|e| FeedError::TaskFailed(e.to_string()))?
    }

    /// Merge a parsed podcast, publish the result and schedule a save
    ///
    /// Merges are serialized so that each one starts from the snapshot the
    /// previous one published. Observers are notified before the next merge
    /// may start, so they see snapshots in publication order and must not
    /// merge from within `notify`.
    pub fn merge_podcast(&self, podcast: Podcast) -> Arc<Collection> {
        let feed_location = podcast.feed_location.clone();

        let (next, outcome) = {
            let _guard = self
                .merge_lock
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let current = self.collection();
            let outcome = merge_outcome(&current, &podcast);
            let next = Arc::new(merge(&current, podcast));
            self.collection.send_replace(next.clone());
            self.store.stage(next.clone());
            self.observers.notify(SyncEvent::CollectionChanged {
                collection: next.clone(),
            });
            (next, outcome)
        };

        match outcome {
            MergeOutcome::Added => info!(url = %feed_location, "Podcast added"),
            MergeOutcome::Updated(index) => {
                info!(url = %feed_location, index, "Podcast updated")
            }
        }

        self.spawn_save();
        next
    }

    fn spawn_save(&self) {
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = store.flush().await {
                error!(error = %e, "Failed to save collection");
            }
        });
    }

    /// Wait for any outstanding save and write what is still staged
    pub async fn flush(&self) -> Result<bool, StoreError> {
        self.store.flush().await
    }

    fn ticker_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.ticker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_progress_polling(self: &Arc<Self>) {
        let mut slot = self.ticker_slot();
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let coordinator = Arc::downgrade(self);
        let period = self.options.progress_interval;
        *slot = Some(tokio::spawn(poll_progress(coordinator, period)));
        debug!("Progress polling started");
    }

    fn stop_progress_polling_if_idle(&self) {
        let mut slot = self.ticker_slot();
        if self.tracker.is_idle()
            && let Some(handle) = slot.take()
        {
            handle.abort();
            debug!("Progress polling stopped");
        }
    }

    /// Emit one progress snapshot per active download
    ///
    /// Returns false once there is nothing left to poll.
    fn report_progress(&self) -> bool {
        let ids = self.tracker.active_ids();
        if ids.is_empty() {
            let mut slot = self.ticker_slot();
            if self.tracker.is_idle() {
                slot.take();
                return false;
            }
            return true;
        }

        let Some(transport) = self.transport() else {
            return true;
        };
        for id in ids {
            let bytes_so_far = self.tracker.progress(transport.as_ref(), id);
            self.observers
                .notify(SyncEvent::ProgressUpdate { id, bytes_so_far });
        }
        true
    }
}

/// Counts an event as in progress until dropped
struct SettleGuard<'a>(&'a DownloadCoordinator);

impl<'a> SettleGuard<'a> {
    fn enter(coordinator: &'a DownloadCoordinator) -> Self {
        coordinator.in_progress.fetch_add(1, Ordering::SeqCst);
        Self(coordinator)
    }
}

impl Drop for SettleGuard<'_> {
    fn drop(&mut self) {
        self.0.in_progress.fetch_sub(1, Ordering::SeqCst);
        self.0.settled.notify_waiters();
    }
}

async fn poll_progress(coordinator: Weak<DownloadCoordinator>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        interval.tick().await;
        let Some(coordinator) = coordinator.upgrade() else {
            break;
        };
        if !coordinator.report_progress() {
            debug!("No active downloads, progress polling finished");
            break;
        }
    }
}
