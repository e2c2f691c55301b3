use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use muxfetch_types::api::{FetchRequest, MediaFormat};
use muxfetch_types::events::ControlEvent;

use crate::config::EngineConfig;
use crate::error::FetchError;
use crate::merge::{MergeCoordinator, MergeJob, Muxer};
use crate::resolver::{MediaInfo, SourceResolver, Variant};
use crate::session::{SessionId, SessionPhase, SessionStore, TransferKind};
use crate::storage::{self, ArtifactPaths, Storage};
use crate::transfer::{TransferCoordinator, VariantSource};

/// Output container of a combined fetch.
const COMBINED_EXT: &str = "mp4";

/// A finished artifact waiting to be handed to the client.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub session_id: SessionId,
    pub path: PathBuf,
    /// Human-readable name, `<title>.<ext>`, not yet percent-encoded
    pub file_name: String,
}

/// Owns every session from connect to teardown.
///
/// Cheap to clone; all clones share one store.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    store: SessionStore,
    storage: Arc<Storage>,
    resolver: Arc<dyn SourceResolver>,
    transfers: TransferCoordinator,
    merges: MergeCoordinator,
}

/// Cleans up a request whose `fetch` future was dropped before it finished.
struct RequestGuard {
    sessions: SessionManager,
    session_id: SessionId,
    armed: bool,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let sessions = self.sessions.clone();
        let session_id = std::mem::take(&mut self.session_id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                info!("Session {}: request abandoned by caller", session_id);
                handle.spawn(async move { sessions.abort_request(&session_id, &FetchError::Cancelled).await });
            }
            Err(_) => warn!("Session {}: no runtime to clean up abandoned request", session_id),
        }
    }
}

/// What one request will produce and where.
struct Plan<'a> {
    paths: ArtifactPaths,
    /// Paths the session is responsible for deleting
    owned: Vec<PathBuf>,
    /// `Some` for a combined fetch
    video: Option<&'a Variant>,
    file_name: String,
}

impl SessionManager {
    pub fn new(
        config: EngineConfig,
        storage: Arc<Storage>,
        resolver: Arc<dyn SourceResolver>,
        source: Arc<dyn VariantSource>,
        muxer: Arc<dyn Muxer>,
    ) -> Self {
        let store = SessionStore::new();
        let merge_weight = config.merge_weight.clamp(0.0, 1.0);
        let transfers = TransferCoordinator::new(store.clone(), source, merge_weight, config.progress_interval);
        let merges = MergeCoordinator::new(store.clone(), muxer, merge_weight);

        Self {
            inner: Arc::new(Inner {
                store,
                storage,
                resolver,
                transfers,
                merges,
            }),
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.inner.store
    }

    /// Create a session for a new control channel and announce its id.
    pub fn on_connect(&self) -> (SessionId, mpsc::UnboundedReceiver<ControlEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.store.create(tx);
        let _ = self
            .inner
            .store
            .with_session(&id, |s| s.notify(ControlEvent::UserId { id: id.clone() }));
        info!("Session {} connected ({} live)", id, self.inner.store.len());
        (id, rx)
    }

    /// The control channel went away. Safe to call for a session that was
    /// already torn down.
    pub async fn on_disconnect(&self, session_id: &str) -> bool {
        self.teardown(session_id, "disconnected").await
    }

    /// The client asked to abort. Same cleanup as a disconnect.
    pub async fn on_cancel(&self, session_id: &str) -> bool {
        self.teardown(session_id, "cancelled").await
    }

    /// The artifact has been streamed (or the client gave up on it): delete
    /// it and retire the session.
    pub async fn on_delivered(&self, artifact: &Artifact, completed: bool) {
        storage::delete_file(&artifact.path).await;
        if completed {
            info!("Session {}: delivered \"{}\"", artifact.session_id, artifact.file_name);
        } else {
            warn!("Session {}: delivery of \"{}\" interrupted", artifact.session_id, artifact.file_name);
        }
        self.teardown(&artifact.session_id, "delivered").await;
    }

    /// Cancel every live session through the regular cleanup path.
    pub async fn shutdown(&self) {
        let ids = self.inner.store.ids();
        if !ids.is_empty() {
            info!("Cancelling {} live sessions", ids.len());
        }
        for id in ids {
            self.teardown(&id, "shut down").await;
        }
    }

    /// Run one fetch request to completion.
    ///
    /// Any failure cleans up every file the request created and returns the
    /// session to `Connected`. If the session vanishes mid-flight the error is
    /// `SessionNotFound` or `Cancelled` and cleanup has already happened.
    pub async fn fetch(&self, request: &FetchRequest) -> Result<Artifact, FetchError> {
        let session_id = request.id.as_str();
        self.inner.store.with_session(session_id, |s| {
            if s.phase().is_busy() {
                Err(FetchError::RequestInProgress(session_id.to_string()))
            } else {
                Ok(())
            }
        })??;

        let media = self.inner.resolver.resolve(&request.url).await?;
        let plan = self.plan(session_id, request.format, &media)?;

        self.inner
            .store
            .with_session(session_id, |s| s.begin_request(plan.owned.clone()))??;
        let mut guard = RequestGuard {
            sessions: self.clone(),
            session_id: session_id.to_string(),
            armed: true,
        };
        info!(
            "Session {}: fetching {:?} of \"{}\"",
            session_id, request.format, media.title
        );

        let output = match self.run(session_id, &plan, &media).await {
            Ok(output) => output,
            Err(e) => {
                self.abort_request(session_id, &e).await;
                guard.armed = false;
                return Err(e);
            }
        };

        let ready = self.inner.store.with_session(session_id, |s| {
            s.set_phase(SessionPhase::Delivered);
            s.push_complete();
        });
        guard.armed = false;
        if let Err(e) = ready {
            debug!("Session {} gone before delivery", session_id);
            storage::delete_file(&output).await;
            return Err(e);
        }

        Ok(Artifact {
            session_id: session_id.to_string(),
            path: output,
            file_name: plan.file_name,
        })
    }

    fn plan<'a>(&self, session_id: &str, format: MediaFormat, media: &'a MediaInfo) -> Result<Plan<'a>, FetchError> {
        let title = storage::sanitize_title(&media.title);
        let audio_ext = media.audio.ext.as_str();

        match format {
            MediaFormat::Audio => {
                // The audio transfer writes straight to the output path.
                let paths = self
                    .inner
                    .storage
                    .artifact_paths(session_id, COMBINED_EXT, audio_ext, audio_ext);
                Ok(Plan {
                    owned: vec![paths.output.clone()],
                    paths,
                    video: None,
                    file_name: format!("{}.{}", title, audio_ext),
                })
            }
            MediaFormat::Video => {
                let video = media
                    .video
                    .as_ref()
                    .ok_or_else(|| FetchError::Resolution(format!("no video variant for \"{}\"", media.title)))?;
                let paths = self
                    .inner
                    .storage
                    .artifact_paths(session_id, &video.ext, audio_ext, COMBINED_EXT);
                Ok(Plan {
                    owned: paths.all(),
                    paths,
                    video: Some(video),
                    file_name: format!("{}.{}", title, COMBINED_EXT),
                })
            }
        }
    }

    async fn run(&self, session_id: &str, plan: &Plan<'_>, media: &MediaInfo) -> Result<PathBuf, FetchError> {
        let paths = &plan.paths;

        let Some(video) = plan.video else {
            self.inner
                .transfers
                .start_transfer(session_id, &media.audio, &paths.output, TransferKind::Audio)
                .await?;
            return Ok(paths.output.clone());
        };

        self.inner
            .transfers
            .transfer_pair(
                session_id,
                (video, paths.video.as_path()),
                (&media.audio, paths.audio.as_path()),
            )
            .await?;

        let job = MergeJob {
            video: paths.video.clone(),
            audio: paths.audio.clone(),
            output: paths.output.clone(),
            duration: media.duration,
        };
        self.inner.merges.start_merge(session_id, &job).await
    }

    /// End a failed request: stop whatever still runs, delete its files and
    /// make the session available again.
    async fn abort_request(&self, session_id: &str, err: &FetchError) {
        let teardown = match self
            .inner
            .store
            .with_session(session_id, |s| s.finish_request(SessionPhase::Connected))
        {
            Ok(teardown) => teardown,
            Err(_) => {
                debug!("Session {}: request ended after teardown ({})", session_id, err);
                return;
            }
        };

        teardown.cancel_handles();
        let deleted = storage::delete_all(&teardown.artifact_paths).await;
        if err.is_session_gone() {
            debug!("Session {}: request stopped ({}), {} files removed", session_id, err, deleted);
        } else {
            warn!("Session {}: request failed: {} ({} files removed)", session_id, err, deleted);
        }
    }

    /// Remove a session, stop its handles and delete its files. Returns
    /// `false` if there was nothing left to tear down.
    async fn teardown(&self, session_id: &str, reason: &str) -> bool {
        let Some(teardown) = self.inner.store.remove(session_id) else {
            debug!("Session {} already gone ({})", session_id, reason);
            return false;
        };

        teardown.cancel_handles();
        let deleted = storage::delete_all(&teardown.artifact_paths).await;
        info!(
            "Session {} {}: {} files removed, {} live",
            session_id,
            reason,
            deleted,
            self.inner.store.len()
        );
        true
    }
}
