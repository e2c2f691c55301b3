//! Muxfetch engine: session-scoped download and merge orchestration.
//!
//! A client connects over a control channel and receives a session id. A
//! fetch request for that id resolves the source, runs one or two transfers
//! concurrently, merges them when needed, and streams a single blended
//! progress percentage back over the channel. Cancelling or disconnecting
//! tears down every transfer, the merge process, and every file the request
//! created.

pub mod config;
pub mod error;
pub mod ffmpeg;
pub mod lifecycle;
pub mod merge;
pub mod progress;
pub mod resolver;
pub mod session;
pub mod storage;
pub mod transfer;

pub use config::EngineConfig;
pub use error::FetchError;
pub use ffmpeg::FfmpegMuxer;
pub use lifecycle::{Artifact, SessionManager};
pub use merge::{MergeCoordinator, MergeJob, Muxer};
pub use resolver::{MediaInfo, SourceResolver, Variant, YtDlpResolver};
pub use session::{SessionId, SessionPhase, SessionStore, TransferKind};
pub use storage::Storage;
pub use transfer::{HttpVariantSource, TransferCoordinator, VariantSource, VariantStream};
