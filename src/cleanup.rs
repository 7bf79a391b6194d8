//! Time-based resource reclamation.
//!
//! A background task runs a cleanup pass on a fixed interval. Each pass
//! evicts expired tasks (deleting their artifact files first, so a task
//! record never outlives its file) and sweeps orphaned files that no stored
//! task references. Everything here is best effort: a failed delete is
//! logged and retried on the next pass, never raised to callers.

use std::sync::Arc;
use std::time::{Duration as StdDuration, SystemTime};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::Config;
use crate::resolver;
use crate::task::TaskStore;

/// Spawn the periodic cleanup loop.
pub fn spawn_cleanup_task(store: TaskStore, config: Arc<Config>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(StdDuration::from_secs(config.cleanup_interval_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            run_pass(&store, &config).await;
        }
    })
}

/// One idempotent cleanup pass: expired tasks first, then orphaned files.
pub async fn run_pass(store: &TaskStore, config: &Config) {
    evict_expired_tasks(store, config).await;
    sweep_orphaned_files(store, config).await;
}

async fn evict_expired_tasks(store: &TaskStore, config: &Config) {
    let now = chrono::Utc::now();
    let terminal_ttl = chrono::Duration::seconds(config.terminal_ttl_secs as i64);
    let max_age = chrono::Duration::seconds(config.task_max_age_secs as i64);

    for id in store.expired(now, terminal_ttl, max_age).await {
        // File first, record second: a record whose file is already gone
        // must not stay servable.
        let Some(task) = store.remove(id).await else {
            continue;
        };
        if let Some(artifact) = &task.artifact {
            remove_file_if_exists(&artifact.path);
        }
        // Partial files of evicted zombies carry the id token.
        resolver::remove_files_with_token(&config.storage_dir, &id.token());
        debug!("evicted expired task {} ({:?})", id, task.stage);
    }
}

/// Delete unreferenced storage files past the orphan threshold. Files of
/// live tasks are protected twice over: completed artifacts through the
/// store's path set, in-flight partials through the id token in their name.
async fn sweep_orphaned_files(store: &TaskStore, config: &Config) {
    let entries = match std::fs::read_dir(&config.storage_dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("orphan sweep skipped: {}", e);
            return;
        }
    };

    let referenced = store.referenced_paths().await;
    let live_tokens = store.live_tokens().await;
    let max_age = StdDuration::from_secs(config.orphan_ttl_secs);
    let now = SystemTime::now();

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() || referenced.contains(&path) {
            continue;
        }
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if live_tokens.iter().any(|t| name.contains(t)) {
            continue;
        }
        let old_enough = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .map(|age| age > max_age)
            .unwrap_or(false);
        if old_enough {
            debug!("removing orphaned file {}", path.display());
            remove_file_if_exists(&path);
        }
    }
}

pub(crate) fn remove_file_if_exists(path: &std::path::Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("could not delete {}: {}", path.display(), e),
    }
}
