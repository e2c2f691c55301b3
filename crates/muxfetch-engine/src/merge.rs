use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::FetchError;
use crate::session::{SessionPhase, SessionStore};
use crate::storage::delete_file;

/// Inputs and output of one combine step.
#[derive(Debug, Clone)]
pub struct MergeJob {
    pub video: PathBuf,
    pub audio: PathBuf,
    pub output: PathBuf,
    /// Media duration in seconds, when known
    pub duration: Option<f64>,
}

/// The external multiplexer.
///
/// Implementations call `on_progress` with a percentage whenever they learn
/// something new. Values at or below zero mean "not started yet" and are
/// ignored by the caller. Must stop promptly once `cancel` fires.
#[async_trait]
pub trait Muxer: Send + Sync {
    async fn merge(
        &self,
        job: &MergeJob,
        on_progress: &(dyn Fn(f64) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<(), FetchError>;
}

/// Runs the combine step for a session once both transfers are done.
#[derive(Clone)]
pub struct MergeCoordinator {
    store: SessionStore,
    muxer: Arc<dyn Muxer>,
    merge_weight: f64,
}

impl MergeCoordinator {
    pub fn new(store: SessionStore, muxer: Arc<dyn Muxer>, merge_weight: f64) -> Self {
        Self {
            store,
            muxer,
            merge_weight,
        }
    }

    /// Merge `job.video` and `job.audio` into `job.output`.
    ///
    /// On success the two inputs are deleted and released from the session.
    /// On failure every path stays registered so the caller's cleanup still
    /// finds them.
    pub async fn start_merge(&self, session_id: &str, job: &MergeJob) -> Result<PathBuf, FetchError> {
        let token = self.store.with_session(session_id, |s| {
            if s.is_request_cancelled() {
                return Err(FetchError::Cancelled);
            }
            s.set_phase(SessionPhase::Merging);
            Ok(s.register_merge())
        })??;

        info!("Session {}: merging into {}", session_id, job.output.display());

        let weight = self.merge_weight;
        let store = self.store.clone();
        let on_progress = move |percent: f64| {
            let _ = store.with_session(session_id, |s| {
                if s.set_merge_progress(percent / 100.0) {
                    s.push_progress(weight);
                }
            });
        };

        let result = self.muxer.merge(job, &on_progress, &token).await;

        let live = self.store.with_session(session_id, |s| s.unregister_merge()).is_ok();
        if !live || token.is_cancelled() {
            // The cancellation path may have swept the directory before the
            // process let go of its output.
            delete_file(&job.output).await;
            debug!("Session {}: merge finished after cancellation", session_id);
            return Err(match result {
                Err(e) if !e.is_session_gone() => e,
                _ if live => FetchError::Cancelled,
                _ => FetchError::SessionNotFound(session_id.to_string()),
            });
        }

        if let Err(e) = result {
            warn!("Session {}: merge failed: {}", session_id, e);
            return Err(e);
        }

        delete_file(&job.video).await;
        delete_file(&job.audio).await;

        self.store.with_session(session_id, |s| {
            s.release_path(&job.video);
            s.release_path(&job.audio);
            s.set_merge_progress(1.0);
            s.push_progress(weight);
        })?;

        info!("Session {}: merge complete", session_id);
        Ok(job.output.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use muxfetch_types::events::ControlEvent;
    use tokio::sync::mpsc;

    /// Replays scripted progress values then writes the output.
    struct ScriptedMuxer {
        progress: Vec<f64>,
        fail: bool,
    }

    #[async_trait]
    impl Muxer for ScriptedMuxer {
        async fn merge(
            &self,
            job: &MergeJob,
            on_progress: &(dyn Fn(f64) + Send + Sync),
            _cancel: &CancellationToken,
        ) -> Result<(), FetchError> {
            for p in &self.progress {
                on_progress(*p);
            }
            if self.fail {
                return Err(FetchError::Merge("exit status 1".into()));
            }
            tokio::fs::write(&job.output, b"merged").await?;
            Ok(())
        }
    }

    fn test_job(name: &str) -> MergeJob {
        let dir = std::env::temp_dir().join(format!("muxfetch_merge_{}_{}", name, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("video"), b"v").unwrap();
        std::fs::write(dir.join("audio"), b"a").unwrap();
        MergeJob {
            video: dir.join("video"),
            audio: dir.join("audio"),
            output: dir.join("output"),
            duration: Some(10.0),
        }
    }

    fn setup(muxer: ScriptedMuxer, job: &MergeJob) -> (MergeCoordinator, String, mpsc::UnboundedReceiver<ControlEvent>) {
        let store = SessionStore::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let id = store.create(tx);
        store
            .with_session(&id, |s| {
                s.begin_request(vec![job.video.clone(), job.audio.clone(), job.output.clone()])
                    .unwrap();
                s.add_total(4_000_000);
                s.add_completed(4_000_000);
            })
            .unwrap();
        (MergeCoordinator::new(store, Arc::new(muxer), 0.2), id, rx)
    }

    fn progress_events(rx: &mut mpsc::UnboundedReceiver<ControlEvent>) -> Vec<f64> {
        let mut out = Vec::new();
        while let Ok(ControlEvent::Progress { percentage }) = rx.try_recv() {
            out.push(percentage);
        }
        out
    }

    #[tokio::test]
    async fn test_success_releases_inputs() {
        let job = test_job("ok");
        let (coordinator, id, mut rx) = setup(
            ScriptedMuxer {
                progress: vec![-3.0, 0.0, 50.0, 20.0, 100.0],
                fail: false,
            },
            &job,
        );

        let output = coordinator.start_merge(&id, &job).await.unwrap();
        assert_eq!(output, job.output);
        assert!(job.output.exists());
        assert!(!job.video.exists());
        assert!(!job.audio.exists());

        coordinator
            .store
            .with_session(&id, |s| {
                assert_eq!(s.phase(), SessionPhase::Merging);
                assert!(!s.has_merge());
                assert_eq!(s.artifact_paths(), &[job.output.clone()]);
            })
            .unwrap();

        // Non-positive and regressing values never produce a push.
        let pushed = progress_events(&mut rx);
        assert_eq!(pushed.len(), 2);
        assert!((pushed[0] - 90.0).abs() < 1e-9);
        assert!((pushed[1] - 100.0).abs() < 1e-9);

        let _ = std::fs::remove_dir_all(job.output.parent().unwrap());
    }

    #[tokio::test]
    async fn test_failure_keeps_paths_for_cleanup() {
        let job = test_job("fail");
        let (coordinator, id, _rx) = setup(
            ScriptedMuxer {
                progress: vec![10.0],
                fail: true,
            },
            &job,
        );

        let err = coordinator.start_merge(&id, &job).await.unwrap_err();
        assert!(matches!(err, FetchError::Merge(_)));

        let paths = coordinator
            .store
            .with_session(&id, |s| {
                assert!(!s.has_merge());
                s.artifact_paths().to_vec()
            })
            .unwrap();
        assert_eq!(paths.len(), 3);
        assert!(job.video.exists());

        let _ = std::fs::remove_dir_all(job.output.parent().unwrap());
    }

    #[tokio::test]
    async fn test_session_gone_is_reported() {
        let job = test_job("gone");
        let (coordinator, id, _rx) = setup(
            ScriptedMuxer {
                progress: Vec::new(),
                fail: false,
            },
            &job,
        );
        coordinator.store.remove(&id);

        let err = coordinator.start_merge(&id, &job).await.unwrap_err();
        assert!(err.is_session_gone());
        assert!(!job.output.exists());

        let _ = std::fs::remove_dir_all(job.output.parent().unwrap());
    }
}
