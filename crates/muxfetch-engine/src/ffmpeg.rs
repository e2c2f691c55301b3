use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::FetchError;
use crate::merge::{MergeJob, Muxer};

/// Lines of stderr kept for error reports.
const STDERR_TAIL_LINES: usize = 6;

/// Combines streams with an external `ffmpeg`: video copied as-is, audio
/// re-encoded to AAC. Progress comes from `-progress pipe:1`.
pub struct FfmpegMuxer {
    binary: PathBuf,
}

impl FfmpegMuxer {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }

    fn command(&self, job: &MergeJob) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["-hide_banner", "-nostdin", "-y", "-i"])
            .arg(&job.video)
            .arg("-i")
            .arg(&job.audio)
            .args(["-c:v", "copy", "-c:a", "aac", "-strict", "experimental"])
            .args(["-progress", "pipe:1", "-nostats"])
            .arg(&job.output)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Muxer for FfmpegMuxer {
    async fn merge(
        &self,
        job: &MergeJob,
        on_progress: &(dyn Fn(f64) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<(), FetchError> {
        let mut child = self
            .command(job)
            .spawn()
            .map_err(|e| FetchError::Merge(format!("failed to run {}: {}", self.binary.display(), e)))?;
        debug!("Spawned {} (pid {:?})", self.binary.display(), child.id());

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FetchError::Merge("ffmpeg stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| FetchError::Merge("ffmpeg stderr not captured".into()))?;
        let stderr_task = tokio::spawn(collect_tail(stderr));

        let mut lines = BufReader::new(stdout).lines();
        let mut parser = ProgressParser::new(job.duration);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let _ = child.start_kill();
                    stderr_task.abort();
                    return Err(FetchError::Cancelled);
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if let Some(percent) = parser.feed(&line) {
                            on_progress(percent);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("ffmpeg progress stream error: {}", e);
                        break;
                    }
                },
            }
        }

        let waited = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            status = child.wait() => Some(status),
        };
        let Some(status) = waited else {
            let _ = child.start_kill();
            stderr_task.abort();
            return Err(FetchError::Cancelled);
        };
        let status = status.map_err(|e| FetchError::Merge(format!("wait failed: {}", e)))?;

        let tail = stderr_task.await.unwrap_or_default();
        if !status.success() {
            let detail = tail.into_iter().collect::<Vec<_>>().join(" | ");
            return Err(FetchError::Merge(format!("ffmpeg exited with {}: {}", status, detail)));
        }

        Ok(())
    }
}

async fn collect_tail<R: AsyncRead + Unpin>(reader: R) -> VecDeque<String> {
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail
}

/// Turns `-progress` key=value blocks into percentages.
///
/// Each block ends with `progress=continue` or `progress=end`. The output
/// timestamp (`out_time_us`, or the misnamed `out_time_ms`, both in
/// microseconds) is divided by the media duration. Without a duration only
/// `progress=end` yields a value.
struct ProgressParser {
    duration_us: Option<f64>,
    out_time_us: Option<i64>,
}

impl ProgressParser {
    fn new(duration_secs: Option<f64>) -> Self {
        Self {
            duration_us: duration_secs.filter(|d| *d > 0.0).map(|d| d * 1_000_000.0),
            out_time_us: None,
        }
    }

    fn feed(&mut self, line: &str) -> Option<f64> {
        let (key, value) = line.trim().split_once('=')?;
        match key {
            "out_time_us" | "out_time_ms" => {
                if let Ok(us) = value.trim().parse::<i64>() {
                    self.out_time_us = Some(us);
                }
                None
            }
            "progress" if value == "end" => Some(100.0),
            "progress" => {
                let duration = self.duration_us?;
                let out = self.out_time_us?;
                Some(out as f64 / duration * 100.0)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(parser: &mut ProgressParser, block: &str) -> Vec<f64> {
        block.lines().filter_map(|l| parser.feed(l)).collect()
    }

    #[test]
    fn test_block_with_known_duration() {
        let mut parser = ProgressParser::new(Some(20.0));
        let out = feed_all(
            &mut parser,
            "frame=120\nout_time_us=5000000\nout_time_ms=5000000\nout_time=00:00:05.000000\nspeed=10x\nprogress=continue\n",
        );
        assert_eq!(out, vec![25.0]);

        let out = feed_all(&mut parser, "out_time_us=20000000\nprogress=end\n");
        assert_eq!(out, vec![100.0]);
    }

    #[test]
    fn test_not_started_reports_negative_or_na() {
        let mut parser = ProgressParser::new(Some(10.0));
        let out = feed_all(&mut parser, "out_time_us=N/A\nprogress=continue\n");
        assert!(out.is_empty());

        let out = feed_all(&mut parser, "out_time_us=-23220\nprogress=continue\n");
        assert_eq!(out.len(), 1);
        assert!(out[0] < 0.0);
    }

    #[test]
    fn test_unknown_duration_only_reports_end() {
        let mut parser = ProgressParser::new(None);
        let out = feed_all(&mut parser, "out_time_us=5000000\nprogress=continue\nprogress=end\n");
        assert_eq!(out, vec![100.0]);
    }

    #[test]
    fn test_command_line() {
        let muxer = FfmpegMuxer::new(PathBuf::from("ffmpeg"));
        let job = MergeJob {
            video: PathBuf::from("/w/video-a.mp4"),
            audio: PathBuf::from("/w/audio-a.webm"),
            output: PathBuf::from("/w/output-a.mp4"),
            duration: None,
        };
        let cmd = muxer.command(&job);
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        let joined = args.join(" ");
        assert!(joined.contains("-i /w/video-a.mp4 -i /w/audio-a.webm"));
        assert!(joined.contains("-c:v copy -c:a aac"));
        assert_eq!(args.last().map(String::as_str), Some("/w/output-a.mp4"));
    }
}
