use thiserror::Error;

/// Every way a fetch request can end other than delivery.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The source URL could not be resolved to transferable variants.
    #[error("resolution failed: {0}")]
    Resolution(String),

    /// A byte transfer failed or was interrupted.
    #[error("transfer failed: {0}")]
    Transfer(String),

    /// The external combine step exited non-zero or could not run.
    #[error("merge failed: {0}")]
    Merge(String),

    /// An event referenced a session that no longer exists.
    #[error("session {0} not found")]
    SessionNotFound(String),

    /// A second request arrived while the session was still busy.
    #[error("session {0} already has an active request")]
    RequestInProgress(String),

    /// The session was cancelled while the request was running.
    #[error("request cancelled")]
    Cancelled,

    /// Local filesystem failure outside a transfer or merge.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    /// True when the owning session is gone, either removed or cancelled
    /// underneath the caller. Completion handlers treat this as a no-op.
    pub fn is_session_gone(&self) -> bool {
        matches!(self, Self::SessionNotFound(_) | Self::Cancelled)
    }
}
