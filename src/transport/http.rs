// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::StreamExt;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{DownloadId, LocalHandle, Transport, TransportEvent};
use crate::error::TransportError;
use crate::http::{ByteStream, HttpClient};
use crate::media_type::{MimeClass, classify, guess_from_location};

type DownloadTable = Arc<Mutex<HashMap<DownloadId, DownloadEntry>>>;

#[derive(Debug)]
struct DownloadEntry {
    url: String,
    bytes_so_far: Arc<AtomicU64>,
    content_type: Option<String>,
    local_path: Option<PathBuf>,
}

/// Transport that streams downloads over HTTP into a local directory
///
/// Each download is written to `<download_dir>/<id>.partial` and renamed to
/// `<download_dir>/<id>` once the body has been received completely.
pub struct HttpTransport<C> {
    client: C,
    download_dir: PathBuf,
    next_id: AtomicU64,
    downloads: DownloadTable,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl<C: HttpClient + Clone + 'static> HttpTransport<C> {
    /// Create a transport together with its completion channel
    pub fn new(
        client: C,
        download_dir: impl Into<PathBuf>,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let transport = Self {
            client,
            download_dir: download_dir.into(),
            next_id: AtomicU64::new(0),
            downloads: Arc::new(Mutex::new(HashMap::new())),
            events,
        };
        (transport, receiver)
    }

    fn table(&self) -> MutexGuard<'_, HashMap<DownloadId, DownloadEntry>> {
        self.downloads.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<C: HttpClient + Clone + 'static> Transport for HttpTransport<C> {
    fn enqueue(&self, url: &str) -> Result<DownloadId, TransportError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| TransportError::Rejected {
                url: url.to_string(),
                reason: "no async runtime available".to_string(),
            })?;

        let id = DownloadId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let bytes_so_far = Arc::new(AtomicU64::new(0));

        self.table().insert(
            id,
            DownloadEntry {
                url: url.to_string(),
                bytes_so_far: bytes_so_far.clone(),
                content_type: None,
                local_path: None,
            },
        );

        let job = DownloadJob {
            id,
            url: url.to_string(),
            download_dir: self.download_dir.clone(),
            client: self.client.clone(),
            bytes_so_far,
            downloads: self.downloads.clone(),
            events: self.events.clone(),
        };
        runtime.spawn(job.run());

        debug!(id = %id, url, "Download enqueued");
        Ok(id)
    }

    fn query_progress(&self, id: DownloadId) -> Option<u64> {
        self.table()
            .get(&id)
            .map(|entry| entry.bytes_so_far.load(Ordering::SeqCst))
    }

    fn resolve_local_handle(&self, id: DownloadId) -> Option<LocalHandle> {
        self.table()
            .get(&id)
            .and_then(|entry| entry.local_path.clone())
            .map(|path| LocalHandle { id, path })
    }

    fn resolve_mime_type(&self, handle: &LocalHandle) -> Option<String> {
        let table = self.table();
        let entry = table.get(&handle.id)?;

        let declared = entry.content_type.clone();
        declared
            .clone()
            .filter(|mime| classify(mime) != MimeClass::Ambiguous)
            .or_else(|| guess_from_location(&entry.url).map(|mime| mime.to_string()))
            .or(declared)
    }

    fn release(&self, id: DownloadId) {
        let Some(path) = self.table().remove(&id).and_then(|entry| entry.local_path) else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(error) = tokio::fs::remove_file(&path).await {
                        debug!(id = %id, path = %path.display(), %error, "Could not remove download");
                    }
                });
            }
            Err(_) => {
                if let Err(error) = std::fs::remove_file(&path) {
                    debug!(id = %id, path = %path.display(), %error, "Could not remove download");
                }
            }
        }
    }
}

struct Fetched {
    path: PathBuf,
    content_type: Option<String>,
    bytes: u64,
}

struct DownloadJob<C> {
    id: DownloadId,
    url: String,
    download_dir: PathBuf,
    client: C,
    bytes_so_far: Arc<AtomicU64>,
    downloads: DownloadTable,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl<C: HttpClient> DownloadJob<C> {
    async fn run(self) {
        let event = match self.fetch().await {
            Ok(fetched) => {
                debug!(id = %self.id, bytes = fetched.bytes, "Download finished");
                let mut table = self.downloads.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(entry) = table.get_mut(&self.id) {
                    entry.content_type = fetched.content_type;
                    entry.local_path = Some(fetched.path);
                }
                TransportEvent::Completed(self.id)
            }
            Err(error) => {
                warn!(id = %self.id, url = %self.url, %error, "Download failed");
                TransportEvent::Failed { id: self.id, error }
            }
        };

        // The receiving side may already be gone
        let _ = self.events.send(event);
    }

    async fn fetch(&self) -> Result<Fetched, TransportError> {
        let url = self.url.as_str();

        let response =
            self.client
                .get_stream(url)
                .await
                .map_err(|e| TransportError::HttpFailed {
                    url: url.to_string(),
                    source: e,
                })?;

        if response.status >= 400 {
            return Err(TransportError::HttpStatus {
                url: url.to_string(),
                status: response.status,
            });
        }

        tokio::fs::create_dir_all(&self.download_dir)
            .await
            .map_err(|e| TransportError::FileCreateFailed {
                path: self.download_dir.clone(),
                source: e,
            })?;

        let final_path = self.download_dir.join(self.id.0.to_string());
        let partial_path = self.download_dir.join(format!("{}.partial", self.id.0));

        let bytes = match self.stream_to(&partial_path, response.body).await {
            Ok(bytes) => bytes,
            Err(e) => {
                if let Err(error) = tokio::fs::remove_file(&partial_path).await
                    && error.kind() != std::io::ErrorKind::NotFound
                {
                    debug!(
                        id = %self.id,
                        path = %partial_path.display(),
                        %error,
                        "Could not remove partial download"
                    );
                }
                return Err(e);
            }
        };

        tokio::fs::rename(&partial_path, &final_path)
            .await
            .map_err(|e| TransportError::FileWriteFailed {
                path: final_path.clone(),
                source: e,
            })?;

        Ok(Fetched {
            path: final_path,
            content_type: response.content_type,
            bytes,
        })
    }

    async fn stream_to(
        &self,
        partial_path: &Path,
        mut stream: ByteStream,
    ) -> Result<u64, TransportError> {
        let url = self.url.as_str();

        let mut file =
            File::create(partial_path)
                .await
                .map_err(|e| TransportError::FileCreateFailed {
                    path: partial_path.to_path_buf(),
                    source: e,
                })?;

        let mut bytes: u64 = 0;

        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result.map_err(|e| TransportError::StreamFailed {
                url: url.to_string(),
                source: e,
            })?;

            file.write_all(&chunk)
                .await
                .map_err(|e| TransportError::FileWriteFailed {
                    path: partial_path.to_path_buf(),
                    source: e,
                })?;

            bytes += chunk.len() as u64;
            self.bytes_so_far.store(bytes, Ordering::SeqCst);
        }

        file.flush()
            .await
            .map_err(|e| TransportError::FileWriteFailed {
                path: partial_path.to_path_buf(),
                source: e,
            })?;

        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpResponse;
    use async_trait::async_trait;
    use bytes::Bytes;
    use tempfile::tempdir;

    #[derive(Clone)]
    struct MockHttpClient {
        response_data: Vec<u8>,
        status: u16,
        content_type: Option<String>,
        break_stream: bool,
    }

    /// A genuine reqwest error, produced without touching the network
    fn broken_connection() -> reqwest::Error {
        match reqwest::Client::new().get("not a url").build() {
            Err(e) => e,
            Ok(_) => panic!("Expected an invalid request"),
        }
    }

    #[async_trait]
    impl HttpClient for MockHttpClient {
        async fn get_stream(&self, _url: &str) -> Result<HttpResponse, reqwest::Error> {
            let data = self.response_data.clone();
            let len = data.len() as u64;

            let mut chunks = vec![Ok(Bytes::from(data))];
            if self.break_stream {
                chunks.push(Err(broken_connection()));
            }
            let stream: ByteStream = Box::pin(futures::stream::iter(chunks));

            Ok(HttpResponse {
                status: self.status,
                content_length: Some(len),
                content_type: self.content_type.clone(),
                body: stream,
            })
        }
    }

    fn client(status: u16, content_type: Option<&str>) -> MockHttpClient {
        MockHttpClient {
            response_data: b"<rss></rss>".to_vec(),
            status,
            content_type: content_type.map(String::from),
            break_stream: false,
        }
    }

    async fn wait_until_gone(path: &Path) {
        for _ in 0..100 {
            if !path.exists() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("{} was not removed", path.display());
    }

    #[tokio::test]
    async fn download_completes_and_resolves_handle() {
        let dir = tempdir().unwrap();
        let (transport, mut events) =
            HttpTransport::new(client(200, Some("application/rss+xml")), dir.path());

        let id = transport.enqueue("https://example.com/feed").unwrap();

        match events.recv().await.unwrap() {
            TransportEvent::Completed(done) => assert_eq!(done, id),
            other => panic!("Expected completion, got {other:?}"),
        }

        let handle = transport.resolve_local_handle(id).unwrap();
        assert_eq!(std::fs::read(&handle.path).unwrap(), b"<rss></rss>");
        assert_eq!(
            transport.resolve_mime_type(&handle),
            Some("application/rss+xml".to_string())
        );
        assert_eq!(transport.query_progress(id), Some(11));
        assert!(!dir.path().join(format!("{}.partial", id.0)).exists());
    }

    #[tokio::test]
    async fn ids_are_unique() {
        let dir = tempdir().unwrap();
        let (transport, _events) = HttpTransport::new(client(200, None), dir.path());

        let first = transport.enqueue("https://example.com/a.xml").unwrap();
        let second = transport.enqueue("https://example.com/b.xml").unwrap();

        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn generic_content_type_falls_back_to_extension() {
        let dir = tempdir().unwrap();
        let (transport, mut events) = HttpTransport::new(
            client(200, Some("application/octet-stream")),
            dir.path(),
        );

        let id = transport.enqueue("https://example.com/episode.mp3").unwrap();
        events.recv().await.unwrap();

        let handle = transport.resolve_local_handle(id).unwrap();
        assert_eq!(
            transport.resolve_mime_type(&handle),
            Some("audio/mpeg".to_string())
        );
    }

    #[tokio::test]
    async fn http_error_is_reported_as_failure() {
        let dir = tempdir().unwrap();
        let (transport, mut events) = HttpTransport::new(client(404, None), dir.path());

        let id = transport.enqueue("https://example.com/feed.xml").unwrap();

        match events.recv().await.unwrap() {
            TransportEvent::Failed {
                id: failed,
                error: TransportError::HttpStatus { status, .. },
            } => {
                assert_eq!(failed, id);
                assert_eq!(status, 404);
            }
            other => panic!("Expected HttpStatus failure, got {other:?}"),
        }
        assert!(transport.resolve_local_handle(id).is_none());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        transport.release(id);
        assert_eq!(transport.query_progress(id), None);
    }

    #[tokio::test]
    async fn release_removes_file_and_entry() {
        let dir = tempdir().unwrap();
        let (transport, mut events) = HttpTransport::new(client(200, None), dir.path());

        let id = transport.enqueue("https://example.com/feed.xml").unwrap();
        events.recv().await.unwrap();
        let handle = transport.resolve_local_handle(id).unwrap();

        transport.release(id);

        assert_eq!(transport.query_progress(id), None);
        wait_until_gone(&handle.path).await;
        transport.release(id);
    }

    #[tokio::test]
    async fn broken_stream_leaves_no_partial_file() {
        let dir = tempdir().unwrap();
        let mut broken = client(200, Some("audio/mpeg"));
        broken.break_stream = true;
        let (transport, mut events) = HttpTransport::new(broken, dir.path());

        let id = transport.enqueue("https://example.com/ep.mp3").unwrap();

        match events.recv().await.unwrap() {
            TransportEvent::Failed {
                id: failed,
                error: TransportError::StreamFailed { .. },
            } => assert_eq!(failed, id),
            other => panic!("Expected StreamFailed, got {other:?}"),
        }
        assert!(!dir.path().join(format!("{}.partial", id.0)).exists());
        assert!(!dir.path().join(id.0.to_string()).exists());

        transport.release(id);
        assert_eq!(transport.query_progress(id), None);
    }

    #[test]
    fn enqueue_without_runtime_is_rejected() {
        let dir = tempdir().unwrap();
        let (transport, _events) = HttpTransport::new(client(200, None), dir.path());

        let result = transport.enqueue("https://example.com/feed.xml");
        assert!(matches!(result, Err(TransportError::Rejected { .. })));
    }

    #[test]
    fn unknown_id_has_no_progress() {
        let dir = tempdir().unwrap();
        let (transport, _events) = HttpTransport::new(client(200, None), dir.path());

        assert_eq!(transport.query_progress(DownloadId(42)), None);
        assert!(transport.resolve_local_handle(DownloadId(42)).is_none());
    }
}
