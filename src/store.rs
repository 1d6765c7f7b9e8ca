//! Task persistence seam
//!
//! The scheduler and download queue persist [`BatchTask`] aggregates through
//! the [`TaskStore`] trait: whole-aggregate get-all/upsert/delete, nothing
//! finer-grained. Writes are last-write-wins at aggregate granularity, so
//! components re-fetch before mutating fields the other side owns.
//!
//! Two implementations ship with the crate: [`MemoryTaskStore`] for tests and
//! short-lived embedding, and [`SqliteTaskStore`](crate::sqlite_store::SqliteTaskStore)
//! for durable storage.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::types::{BatchTask, TaskId};

/// Durable key-value store for batch task aggregates
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// List all persisted tasks, oldest first
    async fn list_tasks(&self) -> Result<Vec<BatchTask>>;

    /// Insert or replace a task aggregate
    ///
    /// # Errors
    ///
    /// May fail on storage exhaustion; callers must surface the error rather
    /// than silently dropping the task.
    async fn upsert_task(&self, task: &BatchTask) -> Result<()>;

    /// Delete a task aggregate; deleting an unknown id is a no-op
    async fn delete_task(&self, id: TaskId) -> Result<()>;
}

/// In-memory task store
///
/// Keeps aggregates in a BTreeMap so `list_tasks` returns them in id order.
/// Cloning shares the underlying map.
#[derive(Clone, Default)]
pub struct MemoryTaskStore {
    tasks: Arc<Mutex<BTreeMap<i64, BatchTask>>>,
}

impl MemoryTaskStore {
    /// Create an empty in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored tasks
    pub async fn len(&self) -> usize {
        self.tasks.lock().await.len()
    }

    /// True when no tasks are stored
    pub async fn is_empty(&self) -> bool {
        self.tasks.lock().await.is_empty()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn list_tasks(&self) -> Result<Vec<BatchTask>> {
        Ok(self.tasks.lock().await.values().cloned().collect())
    }

    async fn upsert_task(&self, task: &BatchTask) -> Result<()> {
        self.tasks.lock().await.insert(task.id.get(), task.clone());
        Ok(())
    }

    async fn delete_task(&self, id: TaskId) -> Result<()> {
        self.tasks.lock().await.remove(&id.get());
        Ok(())
    }
}
