//! Core Task type and its lifecycle state machine.
//!
//! # Invariants
//! - Once a task is terminal, exactly one of `artifact`/`error` is set and
//!   no further transition is accepted.
//! - `progress_percent` never decreases within an attempt; it resets to 0
//!   only when a new attempt begins.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::error::{ErrorKind, FetchError};

/// Unique identifier for a task.
///
/// The string form is embedded in the engine's output template, so the
/// produced file can be located by substring match afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Create a new unique task ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Token embedded in engine output filenames.
    pub fn token(&self) -> String {
        self.0.to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TaskId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Requested output kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    /// Engine format selector. Native formats only, no postprocessing.
    pub fn format_selector(&self) -> &'static str {
        match self {
            MediaKind::Audio => {
                "bestaudio[ext=m4a]/bestaudio[ext=webm]/bestaudio[ext=opus]/bestaudio"
            }
            MediaKind::Video => "best[ext=mp4]/best",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl Default for MediaKind {
    fn default() -> Self {
        MediaKind::Video
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Lifecycle stage of a task.
///
/// # State Machine
/// ```text
/// Queued -> Preparing -> FetchingInfo -> Downloading -> Processing -> Completed
///                \------------\-------------\--------------\-------> Failed
/// ```
///
/// A retry re-enters `Preparing`; `Queued` is never re-entered. `Completed`
/// and `Failed` are the only terminal stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStage {
    Queued,
    Preparing,
    FetchingInfo,
    Downloading,
    Processing,
    Completed,
    Failed,
}

impl TaskStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStage::Completed | TaskStage::Failed)
    }

    /// Position in the forward sequence of one attempt.
    fn rank(&self) -> u8 {
        match self {
            TaskStage::Queued => 0,
            TaskStage::Preparing => 1,
            TaskStage::FetchingInfo => 2,
            TaskStage::Downloading => 3,
            TaskStage::Processing => 4,
            TaskStage::Completed => 5,
            TaskStage::Failed => 5,
        }
    }
}

/// The produced media file and its metadata.
#[derive(Debug, Clone, Serialize)]
pub struct Artifact {
    /// Absolute path inside the storage directory
    pub path: PathBuf,

    /// Final file name, as offered to the client
    pub filename: String,

    /// Size on disk in bytes
    pub size_bytes: u64,

    /// Extension including the leading dot, e.g. `.mp4`
    pub extension: String,

    /// Best-effort MIME type derived from the extension
    pub mime_type: String,
}

/// A classified failure, as shown to polling clients.
#[derive(Debug, Clone, Serialize)]
pub struct FailureInfo {
    pub message: String,
    pub kind: ErrorKind,
}

impl From<&FetchError> for FailureInfo {
    fn from(err: &FetchError) -> Self {
        Self {
            message: err.client_message(),
            kind: err.kind(),
        }
    }
}

/// Errors from task state transitions.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    #[error("Invalid state transition from {from:?} to {to:?}")]
    InvalidTransition { from: TaskStage, to: TaskStage },
}

/// One submitted fetch job and its tracked lifecycle state.
///
/// Stored in the [`TaskStore`](super::TaskStore); mutated exclusively by the
/// one worker running its attempt loop, via transition methods that enforce
/// the state machine.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub source_url: String,
    pub kind: MediaKind,
    pub stage: TaskStage,
    pub progress_percent: f64,
    pub status_message: String,
    pub speed: Option<String>,
    pub eta: Option<String>,
    pub title: Option<String>,
    pub artifact: Option<Artifact>,
    pub error: Option<FailureInfo>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
}

impl Task {
    /// Create a queued task for the given URL.
    pub fn new(source_url: String, kind: MediaKind) -> Self {
        Self {
            id: TaskId::new(),
            source_url,
            kind,
            stage: TaskStage::Queued,
            progress_percent: 0.0,
            status_message: "Queued".to_string(),
            speed: None,
            eta: None,
            title: None,
            artifact: None,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
            attempt_count: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    /// Start a fresh attempt: bump the attempt counter, reset progress and
    /// telemetry, enter `Preparing`.
    ///
    /// # Errors
    /// Rejected once the task is terminal.
    pub fn begin_attempt(&mut self) -> Result<(), TaskError> {
        if self.is_terminal() {
            return Err(TaskError::InvalidTransition {
                from: self.stage,
                to: TaskStage::Preparing,
            });
        }
        self.attempt_count += 1;
        self.progress_percent = 0.0;
        self.speed = None;
        self.eta = None;
        self.stage = TaskStage::Preparing;
        self.status_message = format!("Preparing download (attempt {})", self.attempt_count);
        Ok(())
    }

    /// Move forward within the current attempt. Advancing to the current
    /// stage is a no-op; moving backwards or out of a terminal stage is
    /// rejected.
    pub fn advance(&mut self, to: TaskStage) -> Result<(), TaskError> {
        if to == self.stage {
            return Ok(());
        }
        let invalid = self.is_terminal()
            || to.is_terminal()
            || to == TaskStage::Queued
            || to.rank() <= self.stage.rank();
        if invalid {
            return Err(TaskError::InvalidTransition {
                from: self.stage,
                to,
            });
        }
        self.stage = to;
        Ok(())
    }

    /// Apply a normalized progress update. Progress is monotone within an
    /// attempt: a lower percentage than the current one is kept at the
    /// current value, only the telemetry strings refresh.
    pub fn apply_progress(&mut self, percent: f64, speed: Option<String>, eta: Option<String>) {
        self.progress_percent = self.progress_percent.max(percent.clamp(0.0, 100.0));
        self.speed = speed;
        self.eta = eta;
    }

    /// Terminal success: record the artifact, stamp `completed_at`.
    pub fn complete(&mut self, artifact: Artifact) -> Result<(), TaskError> {
        if self.is_terminal() {
            return Err(TaskError::InvalidTransition {
                from: self.stage,
                to: TaskStage::Completed,
            });
        }
        self.status_message = format!("Download complete ({})", artifact.extension);
        self.stage = TaskStage::Completed;
        self.progress_percent = 100.0;
        self.artifact = Some(artifact);
        self.error = None;
        self.speed = None;
        self.eta = None;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Terminal failure: record the classified error, stamp `completed_at`.
    pub fn fail(&mut self, err: &FetchError) -> Result<(), TaskError> {
        if self.is_terminal() {
            return Err(TaskError::InvalidTransition {
                from: self.stage,
                to: TaskStage::Failed,
            });
        }
        let info = FailureInfo::from(err);
        self.status_message = info.message.clone();
        self.stage = TaskStage::Failed;
        self.artifact = None;
        self.error = Some(info);
        self.speed = None;
        self.eta = None;
        self.completed_at = Some(Utc::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new("https://example.com/watch?v=X".to_string(), MediaKind::Video)
    }

    fn artifact() -> Artifact {
        Artifact {
            path: PathBuf::from("/tmp/clip.mp4"),
            filename: "clip.mp4".to_string(),
            size_bytes: 1024,
            extension: ".mp4".to_string(),
            mime_type: "video/mp4".to_string(),
        }
    }

    #[test]
    fn happy_path_trajectory() {
        let mut t = task();
        assert_eq!(t.stage, TaskStage::Queued);
        t.begin_attempt().unwrap();
        assert_eq!(t.stage, TaskStage::Preparing);
        assert_eq!(t.attempt_count, 1);
        t.advance(TaskStage::FetchingInfo).unwrap();
        t.advance(TaskStage::Downloading).unwrap();
        t.advance(TaskStage::Processing).unwrap();
        t.complete(artifact()).unwrap();
        assert_eq!(t.stage, TaskStage::Completed);
        assert_eq!(t.progress_percent, 100.0);
        assert!(t.artifact.is_some());
        assert!(t.error.is_none());
        assert!(t.completed_at.is_some());
    }

    #[test]
    fn advance_rejects_backwards_moves() {
        let mut t = task();
        t.begin_attempt().unwrap();
        t.advance(TaskStage::Downloading).unwrap();
        assert!(t.advance(TaskStage::FetchingInfo).is_err());
        assert!(t.advance(TaskStage::Queued).is_err());
    }

    #[test]
    fn advance_to_current_stage_is_a_noop() {
        let mut t = task();
        t.begin_attempt().unwrap();
        t.advance(TaskStage::Downloading).unwrap();
        t.advance(TaskStage::Downloading).unwrap();
        assert_eq!(t.stage, TaskStage::Downloading);
    }

    #[test]
    fn terminal_stages_absorb() {
        let mut t = task();
        t.begin_attempt().unwrap();
        t.fail(&FetchError::ContentUnavailable("gone".to_string()))
            .unwrap();
        assert!(t.begin_attempt().is_err());
        assert!(t.advance(TaskStage::Downloading).is_err());
        assert!(t.complete(artifact()).is_err());
        assert!(t.fail(&FetchError::Storage("late".to_string())).is_err());
        assert_eq!(t.attempt_count, 1);
    }

    #[test]
    fn failure_records_error_and_clears_artifact() {
        let mut t = task();
        t.begin_attempt().unwrap();
        t.fail(&FetchError::TransientUpstream("HTTP 429".to_string()))
            .unwrap();
        assert!(t.artifact.is_none());
        let err = t.error.as_ref().unwrap();
        assert_eq!(err.kind, crate::error::ErrorKind::TransientUpstream);
        assert!(t.completed_at.is_some());
    }

    #[test]
    fn progress_is_monotone_within_attempt() {
        let mut t = task();
        t.begin_attempt().unwrap();
        t.advance(TaskStage::Downloading).unwrap();
        t.apply_progress(40.0, Some("1MiB/s".to_string()), None);
        t.apply_progress(20.0, Some("2MiB/s".to_string()), None);
        assert_eq!(t.progress_percent, 40.0);
        // Telemetry still refreshes even when the percentage is stale.
        assert_eq!(t.speed.as_deref(), Some("2MiB/s"));
    }

    #[test]
    fn new_attempt_resets_progress() {
        let mut t = task();
        t.begin_attempt().unwrap();
        t.advance(TaskStage::Downloading).unwrap();
        t.apply_progress(80.0, None, None);
        t.begin_attempt().unwrap();
        assert_eq!(t.progress_percent, 0.0);
        assert_eq!(t.attempt_count, 2);
        assert_eq!(t.stage, TaskStage::Preparing);
    }
}
