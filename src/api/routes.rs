//! HTTP route handlers.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use tokio_util::io::ReaderStream;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use url::Url;
use uuid::Uuid;

use crate::cleanup;
use crate::config::Config;
use crate::engine::ytdlp::YtDlpEngine;
use crate::engine::{EngineOptions, ExtractionEngine, MediaInfo};
use crate::error::{ErrorKind, FetchError};
use crate::identity::IdentityPool;
use crate::orchestrator::Orchestrator;
use crate::resolver;
use crate::task::{Task, TaskId, TaskStage, TaskStore};

use super::types::*;

/// Shared application state.
pub struct AppState {
    pub config: Arc<Config>,
    pub store: TaskStore,
    pub engine: Arc<dyn ExtractionEngine>,
    pub orchestrator: Arc<Orchestrator>,
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&config.storage_dir).await?;

    let config = Arc::new(config);
    let store = TaskStore::new();
    let engine: Arc<dyn ExtractionEngine> =
        Arc::new(YtDlpEngine::new(config.ytdlp_path.clone()));
    let orchestrator = Orchestrator::new(store.clone(), Arc::clone(&engine), Arc::clone(&config));

    cleanup::spawn_cleanup_task(store.clone(), Arc::clone(&config));

    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        store,
        engine,
        orchestrator,
    });

    let app = Router::new()
        .route("/api/health", get(health))
        .route("/api/info", post(probe_info))
        .route("/api/download", post(submit_download))
        .route("/api/status/:id", get(task_status))
        .route("/api/file/:id", get(retrieve_file))
        .route("/api/task/:id", delete(delete_task))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Wait for SIGTERM/SIGINT. In-flight workers are abandoned: task state is
/// ephemeral by design and leftover files are reclaimed by the orphan sweep
/// on the next start.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

/// Reject anything that is not an absolute http(s) URL.
fn validate_url(raw: &str) -> Result<Url, FetchError> {
    let parsed =
        Url::parse(raw).map_err(|e| FetchError::InvalidInput(format!("malformed URL: {}", e)))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(FetchError::InvalidInput(format!(
            "unsupported URL scheme '{}'",
            parsed.scheme()
        )));
    }
    Ok(parsed)
}

fn error_status(err: &FetchError) -> StatusCode {
    match err.kind() {
        ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
        ErrorKind::ContentUnavailable => StatusCode::NOT_FOUND,
        ErrorKind::TransientUpstream => StatusCode::BAD_GATEWAY,
        ErrorKind::FileResolution | ErrorKind::Storage => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Health check endpoint.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_tasks: state.store.active_count().await,
        storage_dir: state.config.storage_dir.display().to_string(),
    })
}

/// Submit a new download task.
async fn submit_download(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DownloadRequest>,
) -> Result<Json<DownloadResponse>, (StatusCode, String)> {
    validate_url(&req.url).map_err(|e| (StatusCode::BAD_REQUEST, e.client_message()))?;

    let task = Task::new(req.url.clone(), req.kind);
    let id = state.store.insert(task).await;
    state.orchestrator.spawn(id);

    tracing::info!("accepted {} download task {}", req.kind, id);
    Ok(Json(DownloadResponse {
        task_id: id,
        stage: TaskStage::Queued,
        message: format!("{} download started", req.kind),
    }))
}

/// Poll the state of a task.
async fn task_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<StatusResponse>, (StatusCode, String)> {
    let task = state
        .store
        .get(TaskId::from(id))
        .await
        .ok_or((StatusCode::NOT_FOUND, "task not found".to_string()))?;
    Ok(Json(StatusResponse::from(&task)))
}

/// Stream the finished file as an attachment.
async fn retrieve_file(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Response, (StatusCode, String)> {
    let task = state
        .store
        .get(TaskId::from(id))
        .await
        .ok_or((StatusCode::NOT_FOUND, "task not found".to_string()))?;

    if task.stage != TaskStage::Completed {
        return Err((StatusCode::NOT_FOUND, "file not ready".to_string()));
    }
    let artifact = task
        .artifact
        .as_ref()
        .ok_or((StatusCode::NOT_FOUND, "file not ready".to_string()))?;

    let file = tokio::fs::File::open(&artifact.path)
        .await
        .map_err(|_| (StatusCode::NOT_FOUND, "file missing".to_string()))?;
    let body = Body::from_stream(ReaderStream::new(file));

    let headers = [
        (header::CONTENT_TYPE, artifact.mime_type.clone()),
        (header::CONTENT_LENGTH, artifact.size_bytes.to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", artifact.filename),
        ),
    ];
    Ok((headers, body).into_response())
}

/// Delete a task and its artifact. Idempotent: deleting an unknown task is
/// acknowledged with `deleted: false`.
async fn delete_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Json<DeleteResponse> {
    let id = TaskId::from(id);
    let deleted = match state.store.remove(id).await {
        Some(task) => {
            if let Some(artifact) = &task.artifact {
                cleanup::remove_file_if_exists(&artifact.path);
            }
            // The in-flight worker (if any) notices the missing task at its
            // next store access; sweep whatever it already wrote.
            resolver::remove_files_with_token(&state.config.storage_dir, &id.token());
            tracing::info!("deleted task {}", id);
            true
        }
        None => false,
    };
    Json(DeleteResponse { deleted })
}

/// Probe media metadata without downloading.
async fn probe_info(
    State(state): State<Arc<AppState>>,
    Json(req): Json<InfoRequest>,
) -> Result<Json<MediaInfo>, (StatusCode, String)> {
    validate_url(&req.url).map_err(|e| (StatusCode::BAD_REQUEST, e.client_message()))?;

    let identity = IdentityPool::new().pick();
    let opts = EngineOptions::new(state.config.storage_dir.clone(), &identity);

    let info = tokio::time::timeout(
        Duration::from_secs(state.config.info_timeout_secs),
        state.engine.probe(&req.url, &opts),
    )
    .await
    .map_err(|_| {
        (
            StatusCode::GATEWAY_TIMEOUT,
            "metadata query timed out".to_string(),
        )
    })?
    .map_err(|e| (error_status(&e), e.client_message()))?;

    Ok(Json(info))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_url_accepts_http_and_https() {
        assert!(validate_url("https://example.com/watch?v=X").is_ok());
        assert!(validate_url("http://example.com/clip").is_ok());
    }

    #[test]
    fn validate_url_rejects_missing_scheme() {
        let err = validate_url("example.com/watch?v=X").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(!err.is_retryable());
    }

    #[test]
    fn validate_url_rejects_non_http_schemes() {
        let err = validate_url("ftp://example.com/file").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn error_status_mapping() {
        assert_eq!(
            error_status(&FetchError::InvalidInput("x".to_string())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            error_status(&FetchError::ContentUnavailable("x".to_string())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            error_status(&FetchError::TransientUpstream("x".to_string())),
            StatusCode::BAD_GATEWAY
        );
    }
}
