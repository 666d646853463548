// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::collection::Collection;
use crate::error::StoreError;

/// Folder holding the collection document
pub const COLLECTION_FOLDER: &str = "collection";

/// File name of the collection document
pub const COLLECTION_FILE: &str = "collection.json";

/// Byte store addressed by folder and file name
#[async_trait]
pub trait Storage: Send + Sync {
    /// Read the whole file, `None` if it does not exist
    async fn read_all(&self, folder: &str, filename: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Replace the whole file
    async fn write_all(&self, folder: &str, filename: &str, bytes: &[u8])
    -> Result<(), StoreError>;

    /// Path used in error messages
    fn location(&self, folder: &str, filename: &str) -> PathBuf;
}

/// Storage rooted in a local directory
///
/// Writes go to a temporary sibling that is renamed over the target, so a
/// crash never leaves a half-written document behind.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn read_all(&self, folder: &str, filename: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.location(folder, filename);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::ReadFailed { path, source: e }),
        }
    }

    async fn write_all(
        &self,
        folder: &str,
        filename: &str,
        bytes: &[u8],
    ) -> Result<(), StoreError> {
        let dir = self.root.join(folder);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::WriteFailed {
                path: dir.clone(),
                source: e,
            })?;

        let path = dir.join(filename);
        let temp_path = dir.join(format!("{filename}.tmp"));
        let write_failed = |source| StoreError::WriteFailed {
            path: temp_path.clone(),
            source,
        };

        let mut file = tokio::fs::File::create(&temp_path)
            .await
            .map_err(write_failed)?;
        file.write_all(bytes).await.map_err(write_failed)?;
        file.sync_all().await.map_err(write_failed)?;
        drop(file);

        tokio::fs::rename(&temp_path, &path)
            .await
            .map_err(|e| StoreError::WriteFailed { path, source: e })
    }

    fn location(&self, folder: &str, filename: &str) -> PathBuf {
        self.root.join(folder).join(filename)
    }
}

/// Loads and saves the collection at a fixed location
///
/// Saves never overlap. A save requested while another one is writing is
/// coalesced: only the most recently staged collection is written.
pub struct CollectionStore {
    storage: Arc<dyn Storage>,
    folder: String,
    filename: String,
    pending: Mutex<Option<Arc<Collection>>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl CollectionStore {
    /// Store using the well-known collection location
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self::with_location(storage, COLLECTION_FOLDER, COLLECTION_FILE)
    }

    pub fn with_location(
        storage: Arc<dyn Storage>,
        folder: impl Into<String>,
        filename: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            folder: folder.into(),
            filename: filename.into(),
            pending: Mutex::new(None),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Path of the collection document
    pub fn location(&self) -> PathBuf {
        self.storage.location(&self.folder, &self.filename)
    }

    fn pending(&self) -> MutexGuard<'_, Option<Arc<Collection>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read the collection
    ///
    /// A missing or blank document is a first run and yields an empty
    /// collection. Anything else that fails to deserialize is an error.
    pub async fn load(&self) -> Result<Collection, StoreError> {
        let Some(bytes) = self.storage.read_all(&self.folder, &self.filename).await? else {
            debug!(path = %self.location().display(), "No collection saved yet");
            return Ok(Collection::default());
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Collection::default());
        }

        serde_json::from_slice(&bytes).map_err(|e| StoreError::Deserialization {
            path: self.location(),
            source: e,
        })
    }

    /// Mark `collection` as the next value to write, replacing any value
    /// that has not been written yet
    pub fn stage(&self, collection: Arc<Collection>) {
        if self.pending().replace(collection).is_some() {
            debug!("Coalesced pending collection save");
        }
    }

    /// Write the staged collection, if any
    ///
    /// Returns `Ok(false)` when there was nothing left to write because a
    /// concurrent flush already wrote the latest value. On failure the
    /// collection stays staged for the next flush, unless a newer one was
    /// staged meanwhile.
    pub async fn flush(&self) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;

        let Some(collection) = self.pending().take() else {
            return Ok(false);
        };

        match self.write(&collection).await {
            Ok(()) => {
                debug!(podcasts = collection.len(), "Collection saved");
                Ok(true)
            }
            Err(e) => {
                warn!(error = %e, "Saving collection failed, keeping it for the next save");
                self.pending().get_or_insert(collection);
                Err(e)
            }
        }
    }

    /// Stage and write a collection, replacing the stored document
    pub async fn save(&self, collection: Arc<Collection>) -> Result<(), StoreError> {
        self.stage(collection);
        self.flush().await.map(|_| ())
    }

    async fn write(&self, collection: &Collection) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(collection)?;
        self.storage
            .write_all(&self.folder, &self.filename, &json)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::{Episode, Podcast};
    use chrono::{DateTime, TimeZone, Utc};
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn make_podcast(feed: &str, episodes: usize) -> Podcast {
        Podcast {
            feed_location: feed.to_string(),
            title: format!("Podcast {feed}"),
            description: Some("About things".to_string()),
            image_location: Some("https://example.com/cover.png".to_string()),
            episodes: (0..episodes)
                .map(|n| Episode {
                    title: format!("Episode {n}"),
                    audio_location: format!("{feed}/ep{n}.mp3"),
                    publish_date: DateTime::parse_from_rfc2822(&format!(
                        "Mon, {:02} Jan 2024 12:00:00 +0100",
                        n + 1
                    ))
                    .ok(),
                    duration_seconds: Some(600 + n as u64),
                })
                .collect(),
            last_checked: Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap(),
        }
    }

    fn make_collection(feeds: &[&str]) -> Collection {
        Collection {
            podcasts: feeds.iter().map(|feed| make_podcast(feed, 3)).collect(),
            last_update: Some(Utc.timestamp_opt(1_700_000_100, 0).unwrap()),
        }
    }

    fn file_store(root: &Path) -> CollectionStore {
        CollectionStore::new(Arc::new(FileStorage::new(root)))
    }

    #[tokio::test]
    async fn load_without_prior_save_returns_empty_collection() {
        let dir = tempdir().unwrap();
        let store = file_store(dir.path());

        let collection = store.load().await.unwrap();

        assert!(collection.is_empty());
    }

    #[tokio::test]
    async fn save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let store = file_store(dir.path());
        let collection = make_collection(&["https://b/feed", "https://a/feed"]);

        store.save(Arc::new(collection.clone())).await.unwrap();
        let loaded = store.load().await.unwrap();

        assert_eq!(loaded, collection);
        assert!(
            dir.path()
                .join(COLLECTION_FOLDER)
                .join(COLLECTION_FILE)
                .exists()
        );
    }

    #[tokio::test]
    async fn empty_collection_roundtrip() {
        let dir = tempdir().unwrap();
        let store = file_store(dir.path());

        store.save(Arc::new(Collection::default())).await.unwrap();

        assert_eq!(store.load().await.unwrap(), Collection::default());
    }

    #[tokio::test]
    async fn save_replaces_previous_content() {
        let dir = tempdir().unwrap();
        let store = file_store(dir.path());

        store
            .save(Arc::new(make_collection(&["https://a/feed", "https://b/feed"])))
            .await
            .unwrap();
        store
            .save(Arc::new(make_collection(&["https://c/feed"])))
            .await
            .unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.podcasts[0].feed_location, "https://c/feed");
        assert!(
            !dir.path()
                .join(COLLECTION_FOLDER)
                .join(format!("{COLLECTION_FILE}.tmp"))
                .exists()
        );
    }

    #[tokio::test]
    async fn blank_file_is_treated_as_first_run() {
        let dir = tempdir().unwrap();
        let folder = dir.path().join(COLLECTION_FOLDER);
        std::fs::create_dir_all(&folder).unwrap();
        std::fs::write(folder.join(COLLECTION_FILE), "\n  \n").unwrap();

        let collection = file_store(dir.path()).load().await.unwrap();

        assert!(collection.is_empty());
    }

    #[tokio::test]
    async fn truncated_file_fails_with_deserialization_error() {
        let dir = tempdir().unwrap();
        let store = file_store(dir.path());
        store
            .save(Arc::new(make_collection(&["https://a/feed"])))
            .await
            .unwrap();

        let path = store.location();
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

        let result = store.load().await;
        assert!(matches!(result, Err(StoreError::Deserialization { .. })));
    }

    /// In-memory storage that records overlapping writes
    #[derive(Default)]
    struct MemoryStorage {
        files: Mutex<HashMap<String, Vec<u8>>>,
        writing: AtomicBool,
        overlaps: AtomicUsize,
        writes: AtomicUsize,
        fail_next: AtomicBool,
    }

    #[async_trait]
    impl Storage for MemoryStorage {
        async fn read_all(
            &self,
            folder: &str,
            filename: &str,
        ) -> Result<Option<Vec<u8>>, StoreError> {
            Ok(self
                .files
                .lock()
                .unwrap()
                .get(&format!("{folder}/{filename}"))
                .cloned())
        }

        async fn write_all(
            &self,
            folder: &str,
            filename: &str,
            bytes: &[u8],
        ) -> Result<(), StoreError> {
            if self.writing.swap(true, Ordering::SeqCst) {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;

            let result = if self.fail_next.swap(false, Ordering::SeqCst) {
                Err(StoreError::WriteFailed {
                    path: self.location(folder, filename),
                    source: std::io::Error::other("disk full"),
                })
            } else {
                self.files
                    .lock()
                    .unwrap()
                    .insert(format!("{folder}/{filename}"), bytes.to_vec());
                self.writes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            };

            self.writing.store(false, Ordering::SeqCst);
            result
        }

        fn location(&self, folder: &str, filename: &str) -> PathBuf {
            PathBuf::from(folder).join(filename)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_saves_never_interleave_and_last_wins() {
        let storage = Arc::new(MemoryStorage::default());
        let store = Arc::new(CollectionStore::new(storage.clone()));

        let feeds: Vec<String> = (0..10).map(|n| format!("https://{n}/feed")).collect();
        let mut handles = Vec::new();
        for feed in &feeds {
            // Stage in order, flush concurrently
            store.stage(Arc::new(make_collection(&[feed.as_str()])));
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.flush().await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(storage.overlaps.load(Ordering::SeqCst), 0);
        assert!(storage.writes.load(Ordering::SeqCst) <= feeds.len());

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.podcasts[0].feed_location, "https://9/feed");
    }

    #[tokio::test]
    async fn failed_save_is_retried_by_next_flush() {
        let storage = Arc::new(MemoryStorage::default());
        let store = CollectionStore::new(storage.clone());
        let collection = make_collection(&["https://a/feed"]);

        storage.fail_next.store(true, Ordering::SeqCst);
        let result = store.save(Arc::new(collection.clone())).await;
        assert!(matches!(result, Err(StoreError::WriteFailed { .. })));
        assert!(store.load().await.unwrap().is_empty());

        assert!(store.flush().await.unwrap());
        assert_eq!(store.load().await.unwrap(), collection);
    }

    #[tokio::test]
    async fn flush_without_staged_value_writes_nothing() {
        let storage = Arc::new(MemoryStorage::default());
        let store = CollectionStore::new(storage.clone());

        assert!(!store.flush().await.unwrap());
        assert_eq!(storage.writes.load(Ordering::SeqCst), 0);
    }
}
