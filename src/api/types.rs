//! API request and response types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::{Artifact, FailureInfo, MediaKind, Task, TaskId, TaskStage};

/// Request to submit a new download.
#[derive(Debug, Clone, Deserialize)]
pub struct DownloadRequest {
    /// Source media URL
    pub url: String,

    /// Desired output kind; defaults to video
    #[serde(rename = "type", default)]
    pub kind: MediaKind,
}

/// Response after submitting a download.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadResponse {
    /// Handle for polling and retrieval
    pub task_id: TaskId,

    /// Initial stage (always `queued`)
    pub stage: TaskStage,

    pub message: String,
}

/// Request for a metadata probe.
#[derive(Debug, Clone, Deserialize)]
pub struct InfoRequest {
    pub url: String,
}

/// Client-facing view of a finished artifact. The server-side path stays
/// internal; retrieval goes through the file endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactSummary {
    pub filename: String,
    pub size_bytes: u64,
    pub extension: String,
    pub mime_type: String,
}

impl From<&Artifact> for ArtifactSummary {
    fn from(artifact: &Artifact) -> Self {
        Self {
            filename: artifact.filename.clone(),
            size_bytes: artifact.size_bytes,
            extension: artifact.extension.clone(),
            mime_type: artifact.mime_type.clone(),
        }
    }
}

/// Task snapshot returned to polling clients.
#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub task_id: TaskId,
    pub stage: TaskStage,
    pub progress_percent: f64,
    pub message: String,
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactSummary>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureInfo>,
}

impl From<&Task> for StatusResponse {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id,
            stage: task.stage,
            progress_percent: task.progress_percent,
            message: task.status_message.clone(),
            attempt_count: task.attempt_count,
            created_at: task.created_at,
            title: task.title.clone(),
            speed: task.speed.clone(),
            eta: task.eta.clone(),
            artifact: task.artifact.as_ref().map(ArtifactSummary::from),
            error: task.error.clone(),
        }
    }
}

/// Acknowledgment for a delete request.
#[derive(Debug, Clone, Serialize)]
pub struct DeleteResponse {
    /// Whether a task was actually removed (false on repeat deletes)
    pub deleted: bool,
}

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,

    /// Service version
    pub version: String,

    /// Number of tasks not yet in a terminal state
    pub active_tasks: usize,

    /// Where artifacts are kept
    pub storage_dir: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_request_defaults_to_video() {
        let req: DownloadRequest =
            serde_json::from_str(r#"{"url": "https://example.com/watch?v=X"}"#).unwrap();
        assert_eq!(req.kind, MediaKind::Video);

        let req: DownloadRequest =
            serde_json::from_str(r#"{"url": "https://example.com/a", "type": "audio"}"#).unwrap();
        assert_eq!(req.kind, MediaKind::Audio);
    }

    #[test]
    fn status_response_skips_absent_optionals() {
        let task = Task::new("https://example.com/a".to_string(), MediaKind::Video);
        let json = serde_json::to_value(StatusResponse::from(&task)).unwrap();
        assert_eq!(json["stage"], "queued");
        assert!(json.get("artifact").is_none());
        assert!(json.get("error").is_none());
        assert!(json.get("title").is_none());
    }
}
