use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::FetchError;

/// One transferable rendition of a source.
#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    pub url: String,
    /// Container extension as reported by the source, e.g. `mp4`, `webm`
    pub ext: String,
    /// Declared size in bytes, when the source knows it
    pub size: Option<u64>,
    /// Extra request headers required by the source
    pub headers: HashMap<String, String>,
}

/// A source URL resolved to its best video and audio variants.
#[derive(Debug, Clone)]
pub struct MediaInfo {
    pub title: String,
    /// Duration in seconds, used to turn merge timestamps into a percentage
    pub duration: Option<f64>,
    pub video: Option<Variant>,
    pub audio: Variant,
}

/// Turns a user-supplied URL into selectable variants.
#[async_trait]
pub trait SourceResolver: Send + Sync {
    async fn resolve(&self, url: &str) -> Result<MediaInfo, FetchError>;
}

/// Resolver backed by `yt-dlp --dump-single-json`.
pub struct YtDlpResolver {
    binary: PathBuf,
}

impl YtDlpResolver {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }
}

#[async_trait]
impl SourceResolver for YtDlpResolver {
    async fn resolve(&self, url: &str) -> Result<MediaInfo, FetchError> {
        debug!("Resolving {} with {}", url, self.binary.display());

        let output = Command::new(&self.binary)
            .args(["-J", "--no-warnings", "--no-playlist", "--", url])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| FetchError::Resolution(format!("failed to run {}: {}", self.binary.display(), e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("no output");
            return Err(FetchError::Resolution(format!("{} exited with {}: {}", self.binary.display(), output.status, reason)));
        }

        let info: YtDlpInfo = serde_json::from_slice(&output.stdout)
            .map_err(|e| FetchError::Resolution(format!("unparseable metadata: {}", e)))?;

        let media = select_variants(info)?;
        info!(
            "Resolved \"{}\": video={} audio={}",
            media.title,
            media.video.as_ref().map_or("none", |v| v.ext.as_str()),
            media.audio.ext
        );
        Ok(media)
    }
}

// ── yt-dlp metadata ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    title: Option<String>,
    duration: Option<f64>,
    #[serde(default)]
    formats: Vec<YtDlpFormat>,
}

#[derive(Debug, Deserialize)]
struct YtDlpFormat {
    url: Option<String>,
    ext: Option<String>,
    protocol: Option<String>,
    vcodec: Option<String>,
    acodec: Option<String>,
    height: Option<u32>,
    tbr: Option<f64>,
    abr: Option<f64>,
    filesize: Option<u64>,
    filesize_approx: Option<u64>,
    #[serde(default)]
    http_headers: HashMap<String, String>,
}

impl YtDlpFormat {
    fn has_video(&self) -> bool {
        self.vcodec.as_deref().is_some_and(|c| c != "none")
    }

    fn has_audio(&self) -> bool {
        self.acodec.as_deref().is_some_and(|c| c != "none")
    }

    /// Only plain HTTP downloads; segmented manifests need a different transfer.
    fn is_direct(&self) -> bool {
        self.url.is_some() && matches!(self.protocol.as_deref(), None | Some("https") | Some("http"))
    }

    fn into_variant(self) -> Variant {
        Variant {
            url: self.url.unwrap_or_default(),
            ext: self.ext.unwrap_or_else(|| "bin".into()),
            size: self.filesize.or(self.filesize_approx),
            headers: self.http_headers,
        }
    }
}

fn select_variants(info: YtDlpInfo) -> Result<MediaInfo, FetchError> {
    let title = info.title.unwrap_or_else(|| "download".into());
    let mut video: Option<YtDlpFormat> = None;
    let mut audio: Option<YtDlpFormat> = None;

    for format in info.formats.into_iter().filter(YtDlpFormat::is_direct) {
        if format.has_video() {
            let better = video.as_ref().is_none_or(|best| video_rank(&format) > video_rank(best));
            if better {
                video = Some(format);
            }
        } else if format.has_audio() {
            let better = audio.as_ref().is_none_or(|best| audio_rank(&format) > audio_rank(best));
            if better {
                audio = Some(format);
            }
        }
    }

    let audio = audio
        .ok_or_else(|| FetchError::Resolution(format!("no audio variant for \"{}\"", title)))?
        .into_variant();

    Ok(MediaInfo {
        title,
        duration: info.duration.filter(|d| d.is_finite() && *d > 0.0),
        video: video.map(YtDlpFormat::into_variant),
        audio,
    })
}

/// Highest resolution first, then prefer video-only streams, then bitrate.
fn video_rank(f: &YtDlpFormat) -> (u32, bool, u64) {
    (f.height.unwrap_or(0), !f.has_audio(), bitrate(f.tbr))
}

fn audio_rank(f: &YtDlpFormat) -> u64 {
    bitrate(f.abr.or(f.tbr))
}

fn bitrate(kbps: Option<f64>) -> u64 {
    kbps.filter(|b| b.is_finite() && *b > 0.0)
        .map(|b| (b * 1000.0) as u64)
        .unwrap_or(0)
}
