use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, info, warn};

use crate::session::SESSION_ID_LEN;

/// Transient artifacts of one request, named after the session id so that
/// concurrent sessions never collide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub video: PathBuf,
    pub audio: PathBuf,
    pub output: PathBuf,
}

impl ArtifactPaths {
    /// All paths in creation order, for registration on the session.
    pub fn all(&self) -> Vec<PathBuf> {
        vec![self.video.clone(), self.audio.clone(), self.output.clone()]
    }
}

/// Work directory holding every in-flight artifact.
///
/// Files are flat under `{dir}/{kind}-{session_id}.{ext}` and never outlive
/// the session that created them.
pub struct Storage {
    dir: PathBuf,
}

impl Storage {
    pub async fn new(dir: PathBuf) -> io::Result<Self> {
        fs::create_dir_all(&dir).await?;
        info!("Work directory: {}", dir.display());
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Paths for a request. `audio_ext` and `output_ext` come from the
    /// resolved variants; the video intermediate keeps its source container.
    pub fn artifact_paths(&self, session_id: &str, video_ext: &str, audio_ext: &str, output_ext: &str) -> ArtifactPaths {
        ArtifactPaths {
            video: self.dir.join(format!("video-{}.{}", session_id, video_ext)),
            audio: self.dir.join(format!("audio-{}.{}", session_id, audio_ext)),
            output: self.dir.join(format!("output-{}.{}", session_id, output_ext)),
        }
    }

    /// Remove artifacts left over from a previous run. Only names this
    /// module generates are touched; anything else in the directory is left
    /// alone.
    pub async fn purge_orphans(&self) -> io::Result<usize> {
        let mut entries = fs::read_dir(&self.dir).await?;
        let mut count = 0;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name();
            if !name.to_str().is_some_and(is_artifact_name) {
                continue;
            }
            if delete_file(&entry.path()).await {
                count += 1;
            }
        }
        Ok(count)
    }
}

/// `{video|audio|output}-{session_id}.{ext}`
fn is_artifact_name(name: &str) -> bool {
    let Some((kind, rest)) = name.split_once('-') else {
        return false;
    };
    if !matches!(kind, "video" | "audio" | "output") {
        return false;
    }
    let Some((id, ext)) = rest.split_once('.') else {
        return false;
    };
    id.len() == SESSION_ID_LEN && id.chars().all(|c| c.is_ascii_alphanumeric()) && !ext.is_empty()
}

/// Delete a file, treating "already gone" as success. Failures are logged,
/// never raised: cleanup runs on paths that may or may not exist yet.
pub async fn delete_file(path: &Path) -> bool {
    match fs::remove_file(path).await {
        Ok(()) => {
            debug!("Deleted {}", path.display());
            true
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(e) => {
            warn!("Failed to delete {}: {}", path.display(), e);
            false
        }
    }
}

/// Delete every path in `paths`. Returns how many files actually existed.
pub async fn delete_all(paths: &[PathBuf]) -> usize {
    let mut deleted = 0;
    for path in paths {
        if delete_file(path).await {
            deleted += 1;
        }
    }
    deleted
}

/// Make a media title safe to use as a file name.
pub fn sanitize_title(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim().trim_matches('.');
    if trimmed.is_empty() {
        "download".into()
    } else {
        trimmed.to_string()
    }
}
