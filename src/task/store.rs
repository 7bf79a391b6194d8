//! Concurrent task registry.
//!
//! The store is the only shared mutable state in the system. All mutation
//! goes through [`TaskStore::mutate`], which holds the write lock for the
//! whole closure, so a mutation is atomic with respect to every other
//! `mutate`/`remove` on the same id. Reads hand out cloned snapshots and can
//! never observe a half-applied update.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::task::{Task, TaskId};

#[derive(Clone, Default)]
pub struct TaskStore {
    tasks: Arc<RwLock<HashMap<Uuid, Task>>>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a task, returning its id.
    pub async fn insert(&self, task: Task) -> TaskId {
        let id = task.id;
        self.tasks.write().await.insert(id.as_uuid(), task);
        id
    }

    /// Snapshot of a task, if present.
    pub async fn get(&self, id: TaskId) -> Option<Task> {
        self.tasks.read().await.get(&id.as_uuid()).cloned()
    }

    pub async fn contains(&self, id: TaskId) -> bool {
        self.tasks.read().await.contains_key(&id.as_uuid())
    }

    /// Atomically apply `f` to the stored task. Returns `None` when the task
    /// no longer exists; workers use this as their deletion signal.
    pub async fn mutate<F, R>(&self, id: TaskId, f: F) -> Option<R>
    where
        F: FnOnce(&mut Task) -> R,
    {
        let mut tasks = self.tasks.write().await;
        tasks.get_mut(&id.as_uuid()).map(f)
    }

    /// Remove a task, returning it so the caller can release its files.
    pub async fn remove(&self, id: TaskId) -> Option<Task> {
        self.tasks.write().await.remove(&id.as_uuid())
    }

    /// Number of tasks not yet in a terminal stage.
    pub async fn active_count(&self) -> usize {
        self.tasks
            .read()
            .await
            .values()
            .filter(|t| !t.is_terminal())
            .count()
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }

    /// Ids of tasks that have outlived their welcome: terminal tasks older
    /// than `terminal_ttl` (from completion) and any task older than
    /// `max_age` (from creation; catches zombies whose worker died).
    pub async fn expired(
        &self,
        now: DateTime<Utc>,
        terminal_ttl: Duration,
        max_age: Duration,
    ) -> Vec<TaskId> {
        self.tasks
            .read()
            .await
            .values()
            .filter(|t| {
                let done_long_ago = t
                    .completed_at
                    .map(|at| now - at > terminal_ttl)
                    .unwrap_or(false);
                let ancient = now - t.created_at > max_age;
                (t.is_terminal() && done_long_ago) || ancient
            })
            .map(|t| t.id)
            .collect()
    }

    /// Artifact paths referenced by any stored task.
    pub async fn referenced_paths(&self) -> HashSet<PathBuf> {
        self.tasks
            .read()
            .await
            .values()
            .filter_map(|t| t.artifact.as_ref().map(|a| a.path.clone()))
            .collect()
    }

    /// Id tokens of all stored tasks (live downloads keep their partial
    /// files out of the orphan sweep through these).
    pub async fn live_tokens(&self) -> Vec<String> {
        self.tasks
            .read()
            .await
            .values()
            .map(|t| t.id.token())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::task::{MediaKind, TaskStage};

    fn task(url: &str) -> Task {
        Task::new(url.to_string(), MediaKind::Video)
    }

    #[tokio::test]
    async fn insert_get_remove_roundtrip() {
        let store = TaskStore::new();
        let id = store.insert(task("https://example.com/a")).await;
        let got = store.get(id).await.unwrap();
        assert_eq!(got.source_url, "https://example.com/a");
        assert_eq!(got.stage, TaskStage::Queued);

        let removed = store.remove(id).await.unwrap();
        assert_eq!(removed.id, id);
        assert!(store.get(id).await.is_none());
        // Idempotent.
        assert!(store.remove(id).await.is_none());
    }

    #[tokio::test]
    async fn mutate_applies_atomically_and_signals_deletion() {
        let store = TaskStore::new();
        let id = store.insert(task("https://example.com/a")).await;

        let attempt = store
            .mutate(id, |t| {
                t.begin_attempt().unwrap();
                t.attempt_count
            })
            .await;
        assert_eq!(attempt, Some(1));

        store.remove(id).await;
        assert_eq!(store.mutate(id, |t| t.attempt_count).await, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_submissions_yield_distinct_ids() {
        let store = TaskStore::new();
        let mut handles = Vec::new();
        for i in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .insert(task(&format!("https://example.com/{}", i)))
                    .await
            }));
        }
        let mut ids = HashSet::new();
        for h in handles {
            ids.insert(h.await.unwrap().as_uuid());
        }
        assert_eq!(ids.len(), 32);
        assert_eq!(store.len().await, 32);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_mutations_are_not_lost() {
        let store = TaskStore::new();
        let id = store.insert(task("https://example.com/a")).await;
        let mut handles = Vec::new();
        for _ in 0..100 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.mutate(id, |t| t.attempt_count += 1).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(store.get(id).await.unwrap().attempt_count, 100);
    }

    #[tokio::test]
    async fn expired_covers_terminal_ttl_and_zombies() {
        let store = TaskStore::new();
        let now = Utc::now();

        // Completed long ago: expired by terminal ttl.
        let mut done = task("https://example.com/done");
        done.begin_attempt().unwrap();
        done.fail(&crate::error::FetchError::Storage("x".to_string()))
            .unwrap();
        done.completed_at = Some(now - Duration::minutes(30));
        let done_id = store.insert(done).await;

        // Stuck non-terminal task created long ago: expired by max age.
        let mut zombie = task("https://example.com/zombie");
        zombie.created_at = now - Duration::hours(3);
        let zombie_id = store.insert(zombie).await;

        // Fresh in-flight task: kept.
        let fresh_id = store.insert(task("https://example.com/fresh")).await;

        let expired = store
            .expired(now, Duration::minutes(10), Duration::hours(1))
            .await;
        assert!(expired.contains(&done_id));
        assert!(expired.contains(&zombie_id));
        assert!(!expired.contains(&fresh_id));
    }

    #[tokio::test]
    async fn active_count_skips_terminal_tasks() {
        let store = TaskStore::new();
        let a = store.insert(task("https://example.com/a")).await;
        store.insert(task("https://example.com/b")).await;
        store
            .mutate(a, |t| {
                t.begin_attempt().unwrap();
                t.fail(&crate::error::FetchError::Storage("x".to_string()))
                    .unwrap();
            })
            .await;
        assert_eq!(store.active_count().await, 1);
    }
}
