use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, bail};

use muxfetch_engine::EngineConfig;
use muxfetch_engine::progress::DEFAULT_MERGE_WEIGHT;

/// Server settings, read from `MUXFETCH_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub work_dir: PathBuf,
    pub merge_weight: f64,
    pub progress_interval: Duration,
    pub ytdlp_path: PathBuf,
    pub ffmpeg_path: PathBuf,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let merge_weight: f64 = parse_or(&lookup, "MUXFETCH_MERGE_WEIGHT", DEFAULT_MERGE_WEIGHT)?;
        if !merge_weight.is_finite() {
            bail!("MUXFETCH_MERGE_WEIGHT must be a finite number");
        }
        let interval_ms: u64 = parse_or(&lookup, "MUXFETCH_PROGRESS_INTERVAL_MS", 50)?;

        Ok(Self {
            host: lookup("MUXFETCH_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&lookup, "MUXFETCH_PORT", 5000)?,
            work_dir: lookup("MUXFETCH_WORK_DIR")
                .unwrap_or_else(|| "./muxfetch-work".into())
                .into(),
            merge_weight: merge_weight.clamp(0.0, 1.0),
            progress_interval: Duration::from_millis(interval_ms),
            ytdlp_path: lookup("MUXFETCH_YTDLP_PATH").unwrap_or_else(|| "yt-dlp".into()).into(),
            ffmpeg_path: lookup("MUXFETCH_FFMPEG_PATH").unwrap_or_else(|| "ffmpeg".into()).into(),
        })
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            merge_weight: self.merge_weight,
            progress_interval: self.progress_interval,
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {}: {:?}", key, raw)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 5000);
        assert_eq!(config.work_dir, PathBuf::from("./muxfetch-work"));
        assert_eq!(config.merge_weight, 0.2);
        assert_eq!(config.progress_interval, Duration::from_millis(50));
        assert_eq!(config.ffmpeg_path, PathBuf::from("ffmpeg"));
    }

    #[test]
    fn test_overrides_and_clamping() {
        let config = config(&[
            ("MUXFETCH_PORT", "8080"),
            ("MUXFETCH_MERGE_WEIGHT", "1.5"),
            ("MUXFETCH_PROGRESS_INTERVAL_MS", " 0 "),
            ("MUXFETCH_YTDLP_PATH", "/opt/bin/yt-dlp"),
        ])
        .unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.merge_weight, 1.0);
        assert_eq!(config.engine().progress_interval, Duration::ZERO);
        assert_eq!(config.ytdlp_path, PathBuf::from("/opt/bin/yt-dlp"));
    }

    #[test]
    fn test_invalid_values_fail_startup() {
        let err = config(&[("MUXFETCH_PORT", "http")]).unwrap_err();
        assert!(err.to_string().contains("MUXFETCH_PORT"));
        assert!(config(&[("MUXFETCH_MERGE_WEIGHT", "NaN")]).is_err());
        assert!(config(&[("MUXFETCH_PROGRESS_INTERVAL_MS", "-1")]).is_err());
    }
}
