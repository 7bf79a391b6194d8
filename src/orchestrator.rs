//! Download orchestration.
//!
//! One worker per submitted task, spawned at submission and gated by a
//! semaphore so the pool stays bounded. The worker owns its task for the
//! whole run: it drives the attempt loop, draws a fresh outbound identity
//! per attempt, pumps engine progress into the store, and finishes by
//! resolving the produced file into an artifact.
//!
//! Deletion of the task (client request or cleanup eviction) is a request,
//! not a kill: the worker notices the task is gone at its next store access
//! after a suspension point, stops updating, and releases any partial files
//! it left behind.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::engine::events::EngineEvent;
use crate::engine::{EngineOptions, ExtractionEngine};
use crate::error::FetchError;
use crate::identity::IdentityPool;
use crate::resolver;
use crate::task::{MediaKind, ProgressUpdate, TaskId, TaskStage, TaskStore};

/// How one attempt ended, when it didn't error.
enum AttemptOutcome {
    Completed,
    /// The task vanished from the store mid-attempt; stop silently.
    TaskGone,
}

/// How the event pump ended.
enum Pump {
    EngineDone,
    TaskGone,
}

pub struct Orchestrator {
    store: TaskStore,
    engine: Arc<dyn ExtractionEngine>,
    identities: IdentityPool,
    config: Arc<Config>,
    permits: Arc<Semaphore>,
}

impl Orchestrator {
    pub fn new(store: TaskStore, engine: Arc<dyn ExtractionEngine>, config: Arc<Config>) -> Arc<Self> {
        let permits = Arc::new(Semaphore::new(config.max_concurrent));
        Arc::new(Self {
            store,
            engine,
            identities: IdentityPool::new(),
            config,
            permits,
        })
    }

    /// Launch the background worker that owns this task.
    pub fn spawn(self: &Arc<Self>, id: TaskId) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_task(id).await;
        });
    }

    /// Worker entry point: wait for a pool permit, then run the attempt
    /// loop to a terminal state.
    pub async fn run_task(self: Arc<Self>, id: TaskId) {
        let permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        let _permit = permit;

        // The permit wait is a suspension point: the task may have been
        // deleted while still queued.
        let Some(task) = self.store.get(id).await else {
            debug!("task {} deleted before its worker started", id);
            return;
        };
        let url = task.source_url.clone();
        let kind = task.kind;
        let token = id.token();

        for attempt in 0..self.config.max_attempts {
            if attempt > 0 {
                let delay = Duration::from_secs(
                    self.config.backoff_base_secs.saturating_mul(1 << (attempt - 1)),
                );
                info!(
                    "task {}: backing off {:?} before attempt {}/{}",
                    id,
                    delay,
                    attempt + 1,
                    self.config.max_attempts
                );
                tokio::time::sleep(delay).await;
                if !self.store.contains(id).await {
                    resolver::remove_files_with_token(&self.config.storage_dir, &token);
                    return;
                }
            }

            match self.run_attempt(id, &url, kind, &token).await {
                Ok(AttemptOutcome::Completed) => return,
                Ok(AttemptOutcome::TaskGone) => {
                    debug!("task {} deleted mid-attempt, worker exiting", id);
                    resolver::remove_files_with_token(&self.config.storage_dir, &token);
                    return;
                }
                Err(err) if err.is_retryable() && attempt + 1 < self.config.max_attempts => {
                    warn!("task {}: attempt {} failed: {}", id, attempt + 1, err);
                    self.store
                        .mutate(id, |t| {
                            t.status_message =
                                format!("Retrying after error: {}", err.client_message());
                        })
                        .await;
                }
                Err(err) => {
                    warn!("task {}: giving up: {}", id, err);
                    self.fail_task(id, &err, &token).await;
                    return;
                }
            }
        }
    }

    /// One pass through Preparing -> FetchingInfo -> Downloading ->
    /// Processing -> Completed.
    async fn run_attempt(
        &self,
        id: TaskId,
        url: &str,
        kind: MediaKind,
        token: &str,
    ) -> Result<AttemptOutcome, FetchError> {
        // Preparing: fresh identity, engine options with the id token
        // embedded in the output template.
        let identity = self.identities.pick();
        debug!(
            "task {}: attempt identity player_client={}",
            id, identity.player_client
        );

        match self.store.mutate(id, |t| t.begin_attempt()).await {
            None => return Ok(AttemptOutcome::TaskGone),
            Some(Err(e)) => {
                warn!("task {}: cannot start attempt: {}", id, e);
                return Ok(AttemptOutcome::TaskGone);
            }
            Some(Ok(())) => {}
        }

        let output_template = self
            .config
            .storage_dir
            .join(format!("%(title)s [{}].%(ext)s", token))
            .to_string_lossy()
            .into_owned();
        let opts = EngineOptions::new(self.config.storage_dir.clone(), &identity)
            .with_format(kind.format_selector())
            .with_output_template(output_template);

        // FetchingInfo: metadata-only query, bounded.
        let advanced = self
            .store
            .mutate(id, |t| {
                let r = t.advance(TaskStage::FetchingInfo);
                t.status_message = "Fetching media information...".to_string();
                r
            })
            .await;
        if advanced.is_none() {
            return Ok(AttemptOutcome::TaskGone);
        }

        let info = tokio::time::timeout(
            Duration::from_secs(self.config.info_timeout_secs),
            self.engine.probe(url, &opts),
        )
        .await
        .map_err(|_| FetchError::TransientUpstream("metadata query timed out".to_string()))??;

        let title = info.title.clone();
        info!(
            "task {}: starting {} download: {}",
            id,
            kind,
            title.as_deref().unwrap_or("(untitled)")
        );

        // Downloading: snapshot the directory first so the resolver's diff
        // fallback has something to diff against.
        let before = resolver::snapshot(&self.config.storage_dir)?;

        let advanced = self
            .store
            .mutate(id, |t| {
                t.title = title.clone();
                let r = t.advance(TaskStage::Downloading);
                t.status_message = format!("Downloading {}...", kind.label());
                r
            })
            .await;
        if advanced.is_none() {
            return Ok(AttemptOutcome::TaskGone);
        }

        let (mut events, mut engine_result) = self.engine.download(url, &opts).await?;

        let pump = async {
            while let Some(event) = events.recv().await {
                match event {
                    EngineEvent::Downloading {
                        downloaded_bytes,
                        total_bytes,
                        speed,
                        eta,
                    } => {
                        let update = ProgressUpdate::downloading(
                            kind,
                            downloaded_bytes,
                            total_bytes,
                            speed,
                            eta,
                        );
                        let applied = self
                            .store
                            .mutate(id, |t| {
                                t.apply_progress(
                                    update.percent,
                                    update.speed.clone(),
                                    update.eta.clone(),
                                );
                                t.status_message = update.message.clone();
                            })
                            .await;
                        if applied.is_none() {
                            return Ok(Pump::TaskGone);
                        }
                    }
                    EngineEvent::Finished => {
                        // 100 only becomes visible together with Processing,
                        // never while bytes might still be missing.
                        let applied = self
                            .store
                            .mutate(id, |t| {
                                let _ = t.advance(TaskStage::Processing);
                                t.apply_progress(100.0, None, None);
                                t.status_message = "Processing file...".to_string();
                            })
                            .await;
                        if applied.is_none() {
                            return Ok(Pump::TaskGone);
                        }
                    }
                    EngineEvent::Error { message } => {
                        debug!("task {}: engine error event: {}", id, message);
                        // The authoritative outcome is the exit status below.
                    }
                }
            }
            match (&mut engine_result).await {
                Ok(outcome) => outcome.map(|_| Pump::EngineDone),
                Err(e) => Err(FetchError::TransientUpstream(format!(
                    "engine worker failed: {}",
                    e
                ))),
            }
        };

        let pump_result = tokio::time::timeout(
            Duration::from_secs(self.config.download_timeout_secs),
            pump,
        )
        .await;
        let pumped = match pump_result {
            Ok(result) => result?,
            Err(_) => {
                engine_result.abort();
                return Err(FetchError::TransientUpstream(
                    "download timed out".to_string(),
                ));
            }
        };
        if matches!(pumped, Pump::TaskGone) {
            engine_result.abort();
            return Ok(AttemptOutcome::TaskGone);
        }

        // Processing: make sure the stage is set even when the engine never
        // emitted a Finished event, then resolve the artifact.
        let advanced = self
            .store
            .mutate(id, |t| {
                let _ = t.advance(TaskStage::Processing);
                t.status_message = "Processing file...".to_string();
            })
            .await;
        if advanced.is_none() {
            return Ok(AttemptOutcome::TaskGone);
        }

        let artifact = resolver::finalize(
            &self.config.storage_dir,
            token,
            title.as_deref(),
            &before,
        )?;

        match self.store.mutate(id, |t| t.complete(artifact.clone())).await {
            None => {
                // Deleted during processing: release the file we just made.
                match std::fs::remove_file(&artifact.path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!("could not remove {}: {}", artifact.path.display(), e),
                }
                Ok(AttemptOutcome::TaskGone)
            }
            Some(Err(e)) => {
                warn!("task {}: cannot complete: {}", id, e);
                Ok(AttemptOutcome::TaskGone)
            }
            Some(Ok(())) => {
                info!(
                    "task {} completed: {} ({} bytes)",
                    id, artifact.filename, artifact.size_bytes
                );
                Ok(AttemptOutcome::Completed)
            }
        }
    }

    /// Terminal failure: sweep partial files, record the classified error.
    async fn fail_task(&self, id: TaskId, err: &FetchError, token: &str) {
        resolver::remove_files_with_token(&self.config.storage_dir, token);
        if let Some(Err(e)) = self.store.mutate(id, |t| t.fail(err)).await {
            warn!("task {}: {}", id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MediaInfo;
    use crate::error::ErrorKind;
    use crate::task::Task;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    /// Engine stand-in: succeeds by writing a file through the output
    /// template, or fails the metadata probe a configurable number of
    /// times first.
    struct MockEngine {
        title: String,
        ext: &'static str,
        probe_failures_left: AtomicU32,
        probe_error: FetchError,
    }

    impl MockEngine {
        fn ok() -> Self {
            Self {
                title: "Test Clip".to_string(),
                ext: "mp4",
                probe_failures_left: AtomicU32::new(0),
                probe_error: FetchError::TransientUpstream("unused".to_string()),
            }
        }

        fn failing_probe(error: FetchError, times: u32) -> Self {
            Self {
                title: "Test Clip".to_string(),
                ext: "mp4",
                probe_failures_left: AtomicU32::new(times),
                probe_error: error,
            }
        }
    }

    #[async_trait]
    impl ExtractionEngine for MockEngine {
        async fn probe(&self, _url: &str, _opts: &EngineOptions) -> Result<MediaInfo, FetchError> {
            let left = self.probe_failures_left.load(Ordering::SeqCst);
            if left > 0 {
                if left != u32::MAX {
                    self.probe_failures_left.fetch_sub(1, Ordering::SeqCst);
                }
                return Err(self.probe_error.clone());
            }
            Ok(MediaInfo {
                title: Some(self.title.clone()),
                duration: Some(12.0),
                thumbnail: None,
                uploader: None,
            })
        }

        async fn download(
            &self,
            _url: &str,
            opts: &EngineOptions,
        ) -> Result<(mpsc::Receiver<EngineEvent>, JoinHandle<Result<(), FetchError>>), FetchError>
        {
            let (tx, rx) = mpsc::channel(16);
            let path = PathBuf::from(
                opts.output_template
                    .replace("%(title)s", &self.title)
                    .replace("%(ext)s", self.ext),
            );
            let handle = tokio::spawn(async move {
                let _ = tx
                    .send(EngineEvent::Downloading {
                        downloaded_bytes: 512,
                        total_bytes: Some(1024),
                        speed: Some("1.00MiB/s".to_string()),
                        eta: Some("00:01".to_string()),
                    })
                    .await;
                std::fs::write(&path, b"media bytes")
                    .map_err(|e| FetchError::Storage(e.to_string()))?;
                let _ = tx
                    .send(EngineEvent::Downloading {
                        downloaded_bytes: 1024,
                        total_bytes: Some(1024),
                        speed: None,
                        eta: None,
                    })
                    .await;
                let _ = tx.send(EngineEvent::Finished).await;
                Ok(())
            });
            Ok((rx, handle))
        }
    }

    fn setup(
        engine: MockEngine,
    ) -> (TempDir, TaskStore, Arc<Orchestrator>) {
        let tmp = TempDir::new().unwrap();
        let config = Arc::new(Config::for_tests(tmp.path().to_path_buf()));
        let store = TaskStore::new();
        let orchestrator = Orchestrator::new(store.clone(), Arc::new(engine), config);
        (tmp, store, orchestrator)
    }

    #[tokio::test]
    async fn completes_full_lifecycle() {
        let (_tmp, store, orchestrator) = setup(MockEngine::ok());
        let id = store
            .insert(Task::new(
                "https://example.com/watch?v=X".to_string(),
                MediaKind::Video,
            ))
            .await;

        orchestrator.run_task(id).await;

        let task = store.get(id).await.unwrap();
        assert_eq!(task.stage, TaskStage::Completed);
        assert_eq!(task.progress_percent, 100.0);
        assert_eq!(task.attempt_count, 1);
        assert_eq!(task.title.as_deref(), Some("Test Clip"));
        assert!(task.error.is_none());
        let artifact = task.artifact.as_ref().unwrap();
        assert_eq!(artifact.filename, "Test Clip.mp4");
        assert!(artifact.filename.ends_with(".mp4"));
        assert!(artifact.path.exists());
        assert_eq!(artifact.size_bytes, 11);
    }

    #[tokio::test]
    async fn retries_transient_probe_failure_then_succeeds() {
        let (_tmp, store, orchestrator) = setup(MockEngine::failing_probe(
            FetchError::TransientUpstream("HTTP Error 429".to_string()),
            1,
        ));
        let id = store
            .insert(Task::new(
                "https://example.com/watch?v=X".to_string(),
                MediaKind::Video,
            ))
            .await;

        orchestrator.run_task(id).await;

        let task = store.get(id).await.unwrap();
        assert_eq!(task.stage, TaskStage::Completed);
        assert_eq!(task.attempt_count, 2);
        assert!(task.artifact.is_some());
    }

    #[tokio::test]
    async fn nonretryable_failure_is_immediate() {
        let (_tmp, store, orchestrator) = setup(MockEngine::failing_probe(
            FetchError::ContentUnavailable("Private video".to_string()),
            u32::MAX,
        ));
        let id = store
            .insert(Task::new(
                "https://example.com/watch?v=X".to_string(),
                MediaKind::Audio,
            ))
            .await;

        orchestrator.run_task(id).await;

        let task = store.get(id).await.unwrap();
        assert_eq!(task.stage, TaskStage::Failed);
        assert_eq!(task.attempt_count, 1);
        assert!(task.artifact.is_none());
        assert_eq!(
            task.error.as_ref().unwrap().kind,
            ErrorKind::ContentUnavailable
        );
    }

    #[tokio::test]
    async fn exhausted_retry_budget_fails_with_transient_kind() {
        let (_tmp, store, orchestrator) = setup(MockEngine::failing_probe(
            FetchError::TransientUpstream("HTTP Error 403".to_string()),
            u32::MAX,
        ));
        let id = store
            .insert(Task::new(
                "https://example.com/watch?v=X".to_string(),
                MediaKind::Video,
            ))
            .await;

        orchestrator.run_task(id).await;

        let task = store.get(id).await.unwrap();
        assert_eq!(task.stage, TaskStage::Failed);
        assert_eq!(task.attempt_count, 3);
        assert_eq!(
            task.error.as_ref().unwrap().kind,
            ErrorKind::TransientUpstream
        );
    }

    #[tokio::test]
    async fn deleted_while_queued_never_runs() {
        let (tmp, store, orchestrator) = setup(MockEngine::ok());
        let id = store
            .insert(Task::new(
                "https://example.com/watch?v=X".to_string(),
                MediaKind::Video,
            ))
            .await;
        store.remove(id).await;

        orchestrator.run_task(id).await;

        assert!(store.is_empty().await);
        // No stray output either.
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }
}
