//! Task registry - the set of tasks owned by this shim, keyed by id.
//!
//! Each entry sits behind its own mutex; holding it is what serializes
//! state transitions for that task. The registry lock is never held while
//! an entry lock is awaited.

use super::Task;
use crate::error::{Result, TaskError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

pub type TaskEntry = Arc<Mutex<Task>>;

#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, TaskEntry>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a task and hands back its entry already locked, so nobody can
    /// act on it before the creator is done.
    pub(crate) async fn insert(&self, id: &str, task: Task) -> Result<OwnedMutexGuard<Task>> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(id) {
            return Err(TaskError::AlreadyExists(id.to_string()));
        }
        let entry = Arc::new(Mutex::new(task));
        let guard = entry.clone().lock_owned().await;
        tasks.insert(id.to_string(), entry);
        Ok(guard)
    }

    pub async fn get(&self, id: &str) -> Result<TaskEntry> {
        self.tasks
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| TaskError::NotFound(id.to_string()))
    }

    /// Drops the entry. Callers must already have marked the task deleted.
    pub(crate) async fn remove(&self, id: &str) -> Result<TaskEntry> {
        self.tasks
            .write()
            .await
            .remove(id)
            .ok_or_else(|| TaskError::NotFound(id.to_string()))
    }

    /// Sorted ids of all registered tasks.
    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tasks.read().await.keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }
}
