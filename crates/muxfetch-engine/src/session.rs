use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use rand::distr::Alphanumeric;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use muxfetch_types::events::ControlEvent;

use crate::error::FetchError;
use crate::progress;

/// Length of generated session identifiers.
pub const SESSION_ID_LEN: usize = 5;

pub type SessionId = String;

/// Which half of a combined fetch a transfer carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferKind {
    Video,
    Audio,
}

impl TransferKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }
}

/// Per-session state machine.
///
/// `Connected -> Transferring -> Merging -> Delivered` on the happy path,
/// `Cancelled` from anywhere. A failed request falls back to `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Connected,
    Transferring,
    Merging,
    Delivered,
    Cancelled,
}

impl SessionPhase {
    /// True while a request owns the session.
    pub fn is_busy(self) -> bool {
        matches!(self, Self::Transferring | Self::Merging | Self::Delivered)
    }
}

/// Server-side state for one connected client.
pub struct Session {
    id: SessionId,
    /// Sole sender of the client's control channel. Dropping the session
    /// closes the channel.
    channel: mpsc::UnboundedSender<ControlEvent>,
    phase: SessionPhase,
    total_size: u64,
    completed_size: u64,
    merge_progress: f64,
    last_pushed: f64,
    /// Parent of every transfer and merge handle of the active request.
    request: CancellationToken,
    transfers: HashMap<TransferKind, CancellationToken>,
    merge: Option<CancellationToken>,
    artifact_paths: Vec<PathBuf>,
}

/// Everything released when a request or a whole session ends.
#[derive(Debug, Default)]
pub struct Teardown {
    pub handles: Vec<CancellationToken>,
    pub artifact_paths: Vec<PathBuf>,
}

impl Teardown {
    /// Signal every transfer and the merge process to stop. Does not wait.
    pub fn cancel_handles(&self) {
        for handle in &self.handles {
            handle.cancel();
        }
    }
}

impl Session {
    fn new(id: SessionId, channel: mpsc::UnboundedSender<ControlEvent>) -> Self {
        Self {
            id,
            channel,
            phase: SessionPhase::Connected,
            total_size: 0,
            completed_size: 0,
            merge_progress: 0.0,
            last_pushed: 0.0,
            request: CancellationToken::new(),
            transfers: HashMap::new(),
            merge: None,
            artifact_paths: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: SessionPhase) {
        trace!("Session {}: {:?} -> {:?}", self.id, self.phase, phase);
        self.phase = phase;
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn completed_size(&self) -> u64 {
        self.completed_size
    }

    pub fn merge_progress(&self) -> f64 {
        self.merge_progress
    }

    pub fn artifact_paths(&self) -> &[PathBuf] {
        &self.artifact_paths
    }

    pub fn active_transfers(&self) -> usize {
        self.transfers.len()
    }

    pub fn has_merge(&self) -> bool {
        self.merge.is_some()
    }

    /// Start a new request: reset counters and claim the artifact paths.
    /// Returns the request's cancellation token.
    pub fn begin_request(&mut self, artifact_paths: Vec<PathBuf>) -> Result<CancellationToken, FetchError> {
        if self.phase.is_busy() {
            return Err(FetchError::RequestInProgress(self.id.clone()));
        }

        self.total_size = 0;
        self.completed_size = 0;
        self.merge_progress = 0.0;
        self.last_pushed = 0.0;
        self.request = CancellationToken::new();
        self.transfers.clear();
        self.merge = None;
        self.artifact_paths = artifact_paths;
        self.set_phase(SessionPhase::Transferring);

        Ok(self.request.clone())
    }

    pub fn add_total(&mut self, bytes: u64) {
        self.total_size = self.total_size.saturating_add(bytes);
    }

    /// Count transferred bytes. Never exceeds a known total.
    pub fn add_completed(&mut self, bytes: u64) {
        let completed = self.completed_size.saturating_add(bytes);
        self.completed_size = if self.total_size > 0 {
            completed.min(self.total_size)
        } else {
            completed
        };
    }

    /// Record merge progress as a fraction. Zero, negative, or regressing
    /// values are ignored. Returns whether the value moved.
    pub fn set_merge_progress(&mut self, fraction: f64) -> bool {
        if !fraction.is_finite() || fraction <= 0.0 {
            return false;
        }
        let next = fraction.min(1.0);
        if next <= self.merge_progress {
            return false;
        }
        self.merge_progress = next;
        true
    }

    pub fn percentage(&self, merge_weight: f64) -> f64 {
        progress::percentage(self.total_size, self.completed_size, self.merge_progress, merge_weight)
    }

    /// Recompute the percentage and push it if it moved forward.
    pub fn push_progress(&mut self, merge_weight: f64) {
        let percentage = self.percentage(merge_weight);
        if percentage <= self.last_pushed {
            return;
        }
        self.send_progress(percentage);
    }

    /// Push the terminal 100% before delivery.
    pub fn push_complete(&mut self) {
        self.send_progress(100.0);
    }

    fn send_progress(&mut self, percentage: f64) {
        self.last_pushed = percentage;
        if self.channel.send(ControlEvent::Progress { percentage }).is_err() {
            debug!("Session {}: control channel closed, progress dropped", self.id);
        }
    }

    /// Send an arbitrary event over the control channel.
    pub fn notify(&self, event: ControlEvent) -> bool {
        self.channel.send(event).is_ok()
    }

    pub fn is_request_cancelled(&self) -> bool {
        self.request.is_cancelled()
    }

    /// Register a transfer handle, replacing any previous one of the same kind.
    pub fn register_transfer(&mut self, kind: TransferKind) -> CancellationToken {
        let token = self.request.child_token();
        if let Some(old) = self.transfers.insert(kind, token.clone()) {
            old.cancel();
        }
        token
    }

    pub fn unregister_transfer(&mut self, kind: TransferKind) {
        self.transfers.remove(&kind);
    }

    pub fn register_merge(&mut self) -> CancellationToken {
        let token = self.request.child_token();
        if let Some(old) = self.merge.replace(token.clone()) {
            old.cancel();
        }
        token
    }

    pub fn unregister_merge(&mut self) {
        self.merge = None;
    }

    /// Forget a path that was already deleted.
    pub fn release_path(&mut self, path: &std::path::Path) {
        self.artifact_paths.retain(|p| p != path);
    }

    /// End the active request, handing over every handle and path exactly once.
    pub fn finish_request(&mut self, phase: SessionPhase) -> Teardown {
        let mut handles: Vec<CancellationToken> = self.transfers.drain().map(|(_, t)| t).collect();
        handles.extend(self.merge.take());
        handles.push(self.request.clone());

        self.set_phase(phase);
        Teardown {
            handles,
            artifact_paths: std::mem::take(&mut self.artifact_paths),
        }
    }
}

/// Registry of live sessions keyed by their assigned identifier.
///
/// Each session sits behind its own lock; the map lock is only held for
/// lookup, insert and remove. Neither lock is held across an await point.
#[derive(Clone, Default)]
pub struct SessionStore {
    inner: Arc<RwLock<HashMap<SessionId, Arc<Mutex<Session>>>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session bound to `channel` under a fresh identifier.
    pub fn create(&self, channel: mpsc::UnboundedSender<ControlEvent>) -> SessionId {
        let mut sessions = self.inner.write();
        let id = loop {
            let candidate = generate_id();
            if !sessions.contains_key(&candidate) {
                break candidate;
            }
        };
        sessions.insert(id.clone(), Arc::new(Mutex::new(Session::new(id.clone(), channel))));
        id
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.inner.read().keys().cloned().collect()
    }

    /// Run `f` with exclusive access to one session.
    pub fn with_session<T>(&self, id: &str, f: impl FnOnce(&mut Session) -> T) -> Result<T, FetchError> {
        let session = self
            .inner
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| FetchError::SessionNotFound(id.to_string()))?;
        let mut guard = session.lock();
        Ok(f(&mut guard))
    }

    /// Remove a session and hand back what must be released. `None` if it
    /// was already gone.
    pub fn remove(&self, id: &str) -> Option<Teardown> {
        let session = self.inner.write().remove(id)?;
        let mut guard = session.lock();
        Some(guard.finish_request(SessionPhase::Cancelled))
    }
}

fn generate_id() -> SessionId {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(SESSION_ID_LEN)
        .map(char::from)
        .collect()
}
