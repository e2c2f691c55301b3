use axum::{
    Json, Router,
    body::Body,
    extract::{State, WebSocketUpgrade},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use bytes::Bytes;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use tokio::io::AsyncReadExt;
use tracing::warn;

use muxfetch_engine::{Artifact, FetchError, SessionManager};
use muxfetch_types::api::{ErrorResponse, FetchRequest};

/// Response header carrying the percent-encoded `<title>.<ext>`.
pub const FILE_NAME_HEADER: HeaderName = HeaderName::from_static("file-name");

/// Characters `encodeURIComponent` leaves alone, so browsers can decode the
/// header with `decodeURIComponent`.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Shared application state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionManager,
}

/// Routes without the CORS and tracing layers.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/download", post(download))
        .route("/gateway", get(gateway_ws))
        .route("/health", get(health))
        .with_state(state)
}

// ── Errors ──────────────────────────────────────────────────────────────

/// A `FetchError` rendered as a bounded status with a JSON body.
pub struct ApiError(FetchError);

impl From<FetchError> for ApiError {
    fn from(err: FetchError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let body = ErrorResponse {
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

fn status_for(err: &FetchError) -> StatusCode {
    match err {
        FetchError::Resolution(_) => StatusCode::UNPROCESSABLE_ENTITY,
        FetchError::Transfer(_) => StatusCode::BAD_GATEWAY,
        FetchError::Merge(_) | FetchError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        FetchError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        FetchError::RequestInProgress(_) => StatusCode::CONFLICT,
        FetchError::Cancelled => StatusCode::GONE,
    }
}

// ── Handlers ────────────────────────────────────────────────────────────

/// POST /download: run a fetch for a connected session and stream the
/// artifact back. The file and the session are gone once the body ends.
pub async fn download(
    State(state): State<AppState>,
    Json(req): Json<FetchRequest>,
) -> Result<Response, ApiError> {
    let artifact = state.sessions.fetch(&req).await?;
    let path = artifact.path.clone();
    let file_name = encode_file_name(&artifact.file_name);

    // Armed before the first await so an abandoned request still retires the
    // session and its file.
    let mut guard = DeliveryGuard {
        sessions: state.sessions.clone(),
        artifact: Some(artifact),
        completed: false,
    };

    let opened = match tokio::fs::File::open(&path).await {
        Ok(file) => file.metadata().await.map(|meta| (file, meta.len())),
        Err(e) => Err(e),
    };
    let (mut file, len) = match opened {
        Ok(opened) => opened,
        Err(e) => {
            warn!("Cannot open artifact {}: {}", path.display(), e);
            return Err(FetchError::Io(e).into());
        }
    };

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    if let Ok(value) = HeaderValue::from_str(&file_name) {
        headers.insert(FILE_NAME_HEADER, value);
    }

    // Stream the file from disk
    let stream = async_stream::stream! {
        let mut buf = vec![0u8; 64 * 1024]; // 64 KB read buffer
        loop {
            match file.read(&mut buf).await {
                Ok(0) => {
                    guard.completed = true;
                    break;
                }
                Ok(n) => yield Ok(Bytes::copy_from_slice(&buf[..n])),
                Err(e) => {
                    yield Err(e);
                    break;
                }
            }
        }
        drop(guard);
    };

    Ok((headers, Body::from_stream(stream)).into_response())
}

/// GET /gateway: upgrade to the control channel.
pub async fn gateway_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| muxfetch_gateway::handle_connection(socket, state.sessions))
}

/// GET /health: liveness check.
pub async fn health() -> &'static str {
    "ok"
}

// ── Helpers ─────────────────────────────────────────────────────────────

pub fn encode_file_name(name: &str) -> String {
    utf8_percent_encode(name, URI_COMPONENT).to_string()
}

/// Retires the session once the response body is finished or dropped.
struct DeliveryGuard {
    sessions: SessionManager,
    artifact: Option<Artifact>,
    completed: bool,
}

impl Drop for DeliveryGuard {
    fn drop(&mut self) {
        let Some(artifact) = self.artifact.take() else {
            return;
        };
        let sessions = self.sessions.clone();
        let completed = self.completed;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { sessions.on_delivered(&artifact, completed).await });
            }
            Err(_) => warn!(
                "Session {}: no runtime to clean up {}",
                artifact.session_id,
                artifact.path.display()
            ),
        }
    }
}
