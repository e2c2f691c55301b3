use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::FetchError;
use crate::resolver::Variant;
use crate::session::{SessionStore, TransferKind};
use crate::storage::delete_file;

pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// An opened variant, ready to be drained into a file.
pub struct VariantStream {
    /// Length reported by the transport, if any
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

/// The byte-transfer primitive: opens a variant as a stream of chunks.
#[async_trait]
pub trait VariantSource: Send + Sync {
    async fn open(&self, variant: &Variant) -> Result<VariantStream, FetchError>;
}

/// Plain HTTP(S) GET of the variant URL.
pub struct HttpVariantSource {
    client: reqwest::Client,
}

impl HttpVariantSource {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl VariantSource for HttpVariantSource {
    async fn open(&self, variant: &Variant) -> Result<VariantStream, FetchError> {
        let mut request = self.client.get(&variant.url);
        for (name, value) in &variant.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let resp = request
            .send()
            .await
            .map_err(|e| FetchError::Transfer(format!("request failed: {}", e)))?;

        if !resp.status().is_success() {
            return Err(FetchError::Transfer(format!("source returned {}", resp.status())));
        }

        let content_length = resp.content_length();
        let body = resp.bytes_stream().map(|chunk| chunk.map_err(io::Error::other));

        Ok(VariantStream {
            content_length,
            body: Box::pin(body),
        })
    }
}

/// Unregisters a transfer handle however the transfer ends, including when
/// its future is dropped mid-flight.
struct Registration<'a> {
    store: &'a SessionStore,
    session_id: &'a str,
    kind: TransferKind,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        let kind = self.kind;
        let _ = self.store.with_session(self.session_id, |s| s.unregister_transfer(kind));
    }
}

/// Drives byte transfers into local files and feeds their progress into the
/// owning session.
#[derive(Clone)]
pub struct TransferCoordinator {
    store: SessionStore,
    source: Arc<dyn VariantSource>,
    merge_weight: f64,
    progress_interval: Duration,
}

impl TransferCoordinator {
    pub fn new(
        store: SessionStore,
        source: Arc<dyn VariantSource>,
        merge_weight: f64,
        progress_interval: Duration,
    ) -> Self {
        Self {
            store,
            source,
            merge_weight,
            progress_interval,
        }
    }

    /// Transfer one variant into `destination`. Returns the bytes written.
    pub async fn start_transfer(
        &self,
        session_id: &str,
        variant: &Variant,
        destination: &Path,
        kind: TransferKind,
    ) -> Result<u64, FetchError> {
        let token = self.store.with_session(session_id, |s| {
            if s.is_request_cancelled() {
                return Err(FetchError::Cancelled);
            }
            Ok(s.register_transfer(kind))
        })??;
        let _registration = Registration {
            store: &self.store,
            session_id,
            kind,
        };

        let written = self.run(session_id, variant, destination, kind, &token).await?;
        info!("Session {}: {} transfer complete ({} bytes)", session_id, kind.as_str(), written);
        Ok(written)
    }

    /// Run the video and audio transfers concurrently. Resolves once both
    /// succeed; the first failure is returned and the other transfer is
    /// dropped, leaving its file to the caller's cleanup.
    pub async fn transfer_pair(
        &self,
        session_id: &str,
        video: (&Variant, &Path),
        audio: (&Variant, &Path),
    ) -> Result<u64, FetchError> {
        let (video_bytes, audio_bytes) = tokio::try_join!(
            self.start_transfer(session_id, video.0, video.1, TransferKind::Video),
            self.start_transfer(session_id, audio.0, audio.1, TransferKind::Audio)
        )?;
        Ok(video_bytes + audio_bytes)
    }

    async fn run(
        &self,
        session_id: &str,
        variant: &Variant,
        destination: &Path,
        kind: TransferKind,
        token: &CancellationToken,
    ) -> Result<u64, FetchError> {
        let opened = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(FetchError::Cancelled),
            opened = self.source.open(variant) => opened?,
        };

        let declared = variant.size.or(opened.content_length).unwrap_or(0);
        self.store.with_session(session_id, |s| s.add_total(declared))?;
        debug!(
            "Session {}: {} transfer opened, {} bytes declared",
            session_id,
            kind.as_str(),
            declared
        );

        let mut file = fs::File::create(destination)
            .await
            .map_err(|e| FetchError::Transfer(format!("cannot create {}: {}", destination.display(), e)))?;

        // Cleanup may have run between registration and create; it cancels
        // before deleting, so a cancelled token here means the file is ours.
        if token.is_cancelled() {
            drop(file);
            delete_file(destination).await;
            return Err(FetchError::Cancelled);
        }

        let mut body = opened.body;
        let mut written: u64 = 0;
        let mut pending: u64 = 0;
        let mut last_report = Instant::now();

        loop {
            let chunk = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(FetchError::Cancelled),
                chunk = body.next() => chunk,
            };

            let data = match chunk {
                Some(Ok(data)) => data,
                Some(Err(e)) => return Err(FetchError::Transfer(format!("stream error: {}", e))),
                None => break,
            };

            file.write_all(&data)
                .await
                .map_err(|e| FetchError::Transfer(format!("write to {} failed: {}", destination.display(), e)))?;

            written += data.len() as u64;
            pending += data.len() as u64;

            if last_report.elapsed() >= self.progress_interval {
                self.report(session_id, pending)?;
                pending = 0;
                last_report = Instant::now();
            }
        }

        file.flush()
            .await
            .map_err(|e| FetchError::Transfer(format!("flush of {} failed: {}", destination.display(), e)))?;

        if pending > 0 {
            self.report(session_id, pending)?;
        }

        Ok(written)
    }

    fn report(&self, session_id: &str, delta: u64) -> Result<(), FetchError> {
        let weight = self.merge_weight;
        self.store.with_session(session_id, |s| {
            s.add_completed(delta);
            s.push_progress(weight);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;
    use std::path::PathBuf;

    use muxfetch_types::events::ControlEvent;
    use tokio::sync::mpsc;

    /// Serves fixed chunks per URL, sleeping `delay` before each one.
    struct FakeSource {
        chunks: HashMap<String, (Vec<usize>, Duration)>,
        fail: Option<String>,
    }

    #[async_trait]
    impl VariantSource for FakeSource {
        async fn open(&self, variant: &Variant) -> Result<VariantStream, FetchError> {
            if self.fail.as_deref() == Some(variant.url.as_str()) {
                return Err(FetchError::Transfer("boom".into()));
            }
            let (sizes, delay) = self.chunks[&variant.url].clone();
            let body = futures_util::stream::iter(sizes).then(move |n| async move {
                tokio::time::sleep(delay).await;
                Ok::<_, io::Error>(Bytes::from(vec![7u8; n]))
            });
            Ok(VariantStream {
                content_length: None,
                body: Box::pin(body),
            })
        }
    }

    fn variant(url: &str, size: u64) -> Variant {
        Variant {
            url: url.into(),
            ext: "mp4".into(),
            size: Some(size),
            headers: HashMap::new(),
        }
    }

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("muxfetch_transfer_{}_{}", name, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn setup(source: FakeSource) -> (TransferCoordinator, String, mpsc::UnboundedReceiver<ControlEvent>) {
        let store = SessionStore::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let id = store.create(tx);
        store.with_session(&id, |s| s.begin_request(Vec::new())).unwrap().unwrap();
        let coordinator = TransferCoordinator::new(store, Arc::new(source), 0.2, Duration::ZERO);
        (coordinator, id, rx)
    }

    async fn run_pair(video_delay: Duration, audio_delay: Duration, dir: &Path) -> u64 {
        let mut chunks = HashMap::new();
        chunks.insert("v".to_string(), (vec![1000; 3], video_delay));
        chunks.insert("a".to_string(), (vec![250; 4], audio_delay));
        let (coordinator, id, _rx) = setup(FakeSource { chunks, fail: None });

        let (v, a) = (variant("v", 3000), variant("a", 1000));
        let (vp, ap) = (dir.join("video"), dir.join("audio"));
        let written = coordinator
            .transfer_pair(&id, (&v, vp.as_path()), (&a, ap.as_path()))
            .await
            .unwrap();
        assert_eq!(written, 4000);

        coordinator
            .store
            .with_session(&id, |s| {
                assert_eq!(s.total_size(), 4000);
                assert_eq!(s.active_transfers(), 0);
                s.completed_size()
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_pair_total_independent_of_order() {
        let dir = test_dir("order");
        let fast = Duration::from_millis(1);
        let slow = Duration::from_millis(15);

        let video_first = run_pair(fast, slow, &dir).await;
        let audio_first = run_pair(slow, fast, &dir).await;
        assert_eq!(video_first, 4000);
        assert_eq!(audio_first, 4000);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_progress_pushed_below_transfer_share() {
        let dir = test_dir("progress");
        let mut chunks = HashMap::new();
        chunks.insert("a".to_string(), (vec![250_000; 4], Duration::ZERO));
        let (coordinator, id, mut rx) = setup(FakeSource { chunks, fail: None });

        let path = dir.join("output");
        coordinator
            .start_transfer(&id, &variant("a", 1_000_000), &path, TransferKind::Audio)
            .await
            .unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 1_000_000);

        let mut pushed = Vec::new();
        while let Ok(ControlEvent::Progress { percentage }) = rx.try_recv() {
            pushed.push(percentage);
        }
        assert_eq!(pushed.len(), 4);
        assert!(pushed.windows(2).all(|w| w[0] < w[1]));
        assert!((pushed[3] - 80.0).abs() < 1e-9);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_failure_propagates_first_error() {
        let dir = test_dir("fail");
        let mut chunks = HashMap::new();
        chunks.insert("v".to_string(), (vec![10; 2], Duration::from_millis(5)));
        let (coordinator, id, _rx) = setup(FakeSource {
            chunks,
            fail: Some("a".into()),
        });

        let (v, a) = (variant("v", 20), variant("a", 20));
        let (vp, ap) = (dir.join("video"), dir.join("audio"));
        let err = coordinator
            .transfer_pair(&id, (&v, vp.as_path()), (&a, ap.as_path()))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Transfer(_)));

        let active = coordinator.store.with_session(&id, |s| s.active_transfers()).unwrap();
        assert_eq!(active, 0);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_cancelled_request_refuses_new_transfer() {
        let mut chunks = HashMap::new();
        chunks.insert("a".to_string(), (vec![10], Duration::ZERO));
        let (coordinator, id, _rx) = setup(FakeSource { chunks, fail: None });
        let teardown = coordinator
            .store
            .with_session(&id, |s| s.finish_request(crate::session::SessionPhase::Connected))
            .unwrap();
        teardown.cancel_handles();

        let dir = test_dir("refuse");
        let path = dir.join("never");
        let err = coordinator
            .start_transfer(&id, &variant("a", 10), &path, TransferKind::Audio)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Cancelled));
        assert!(!path.exists());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
