//! Task scheduler: owns batch tasks and runs the bounded-concurrency
//! execution loop.
//!
//! Methods on [`TaskScheduler`] are organized by domain:
//! - [`create`] - Task creation and validation
//! - [`control`] - Lifecycle control (start/pause/resume/stop/retry/delete)
//! - [`execution`] - The slot-refill scheduling loop and item resolution

mod control;
mod create;
mod execution;

pub use control::RetryScope;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::backend::{BackendSet, GenerationBackend};
use crate::bus::NotificationBus;
use crate::download::DownloadQueue;
use crate::error::{Result, TaskError};
use crate::store::TaskStore;
use crate::types::{BatchTask, Event, ItemId, ItemStatus, ResultId, TaskId, TaskStatus};

/// One task under scheduler management, plus its runtime-only companions
pub(crate) struct TaskEntry {
    /// The aggregate (authoritative in-memory copy)
    pub(crate) task: BatchTask,
    /// Bumped on pause/stop/reset; in-flight resolutions carrying an older
    /// epoch are discarded
    pub(crate) epoch: u64,
    /// Backend resolved from the task's model family (None only for tasks
    /// reloaded under a registry that no longer knows their family)
    pub(crate) backend: Option<Arc<dyn GenerationBackend>>,
}

/// Shared mutable scheduler state
pub(crate) struct SchedulerState {
    pub(crate) tasks: HashMap<TaskId, TaskEntry>,
}

/// Monotonic id allocation, seeded above the maximum persisted id
pub(crate) struct IdAllocator {
    pub(crate) next_task: AtomicI64,
    pub(crate) next_item: AtomicI64,
    pub(crate) next_result: AtomicI64,
}

impl IdAllocator {
    fn starting_at(task: i64, item: i64, result: i64) -> Self {
        Self {
            next_task: AtomicI64::new(task),
            next_item: AtomicI64::new(item),
            next_result: AtomicI64::new(result),
        }
    }

    pub(crate) fn task_id(&self) -> TaskId {
        TaskId::new(self.next_task.fetch_add(1, Ordering::SeqCst))
    }

    pub(crate) fn item_id(&self) -> ItemId {
        ItemId::new(self.next_item.fetch_add(1, Ordering::SeqCst))
    }

    pub(crate) fn result_id(&self) -> ResultId {
        ResultId::new(self.next_result.fetch_add(1, Ordering::SeqCst))
    }
}

/// Batch task scheduler (cloneable - all fields are Arc-wrapped)
///
/// Constructed with its collaborators injected, so embedders can supply
/// test doubles and run multiple independent instances side by side.
#[derive(Clone)]
pub struct TaskScheduler {
    /// Task map and runtime companions
    pub(crate) state: Arc<tokio::sync::Mutex<SchedulerState>>,
    /// Task persistence
    pub(crate) store: Arc<dyn TaskStore>,
    /// Generation backends keyed by model family
    pub(crate) backends: Arc<BackendSet>,
    /// Per-subject snapshot bus
    pub(crate) bus: NotificationBus,
    /// Event broadcast channel sender (multiple subscribers supported)
    pub(crate) event_tx: tokio::sync::broadcast::Sender<Event>,
    /// Download queue for auto-download of produced artifacts
    pub(crate) downloads: Option<DownloadQueue>,
    /// Id allocation
    pub(crate) ids: Arc<IdAllocator>,
}

impl TaskScheduler {
    /// Create a new scheduler
    ///
    /// Loads all persisted tasks from `store` and deterministically forces
    /// any task or item still marked as processing (an abnormal shutdown
    /// happened mid-run) to failed with an "interrupted" error. Interrupted
    /// work is never resumed silently; the user retries it explicitly.
    pub async fn new(
        store: Arc<dyn TaskStore>,
        backends: BackendSet,
        downloads: Option<DownloadQueue>,
    ) -> Result<Self> {
        let backends = Arc::new(backends);

        // An attached download queue shares one bus and one event stream
        // with the scheduler, so observers subscribe in a single place.
        let (bus, event_tx) = match &downloads {
            Some(queue) => (queue.bus.clone(), queue.event_tx.clone()),
            None => {
                let (event_tx, _rx) = tokio::sync::broadcast::channel(1000);
                (NotificationBus::new(), event_tx)
            }
        };

        let persisted = store.list_tasks().await?;

        let mut tasks = HashMap::new();
        let mut max_task = 0i64;
        let mut max_item = 0i64;
        let mut max_result = 0i64;

        for mut task in persisted {
            max_task = max_task.max(task.id.get());
            for item in &task.items {
                max_item = max_item.max(item.id.get());
            }
            for result in &task.results {
                max_result = max_result.max(result.id.get());
            }

            let interrupted = force_interrupted(&mut task);
            if interrupted {
                tracing::warn!(
                    task_id = task.id.0,
                    "Task was processing at shutdown, forcing to failed"
                );
                store.upsert_task(&task).await?;
            }

            let backend = match backends.select(&task.config.model_family) {
                Ok(backend) => Some(backend),
                Err(_) => {
                    tracing::warn!(
                        task_id = task.id.0,
                        model_family = %task.config.model_family,
                        "No backend registered for reloaded task's model family"
                    );
                    None
                }
            };

            tasks.insert(
                task.id,
                TaskEntry {
                    task,
                    epoch: 0,
                    backend,
                },
            );
        }

        tracing::info!(task_count = tasks.len(), "Scheduler loaded tasks from store");

        Ok(Self {
            state: Arc::new(tokio::sync::Mutex::new(SchedulerState { tasks })),
            store,
            backends,
            bus,
            event_tx,
            downloads,
            ids: Arc::new(IdAllocator::starting_at(
                max_task + 1,
                max_item + 1,
                max_result + 1,
            )),
        })
    }

    /// Subscribe to the scheduler's event stream
    ///
    /// Multiple subscribers are supported. Each subscriber receives all
    /// events independently; a subscriber that falls behind by more than
    /// 1000 events receives a `RecvError::Lagged`.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Per-subject notification bus for task and download-job snapshots
    pub fn bus(&self) -> &NotificationBus {
        &self.bus
    }

    /// Snapshot of one task
    pub async fn get_task(&self, id: TaskId) -> Option<BatchTask> {
        let state = self.state.lock().await;
        state.tasks.get(&id).map(|entry| entry.task.clone())
    }

    /// Snapshots of all tasks, in creation order
    pub async fn list_tasks(&self) -> Vec<BatchTask> {
        let state = self.state.lock().await;
        let mut tasks: Vec<BatchTask> =
            state.tasks.values().map(|entry| entry.task.clone()).collect();
        tasks.sort_by_key(|t| t.id);
        tasks
    }

    /// Emit an event to all subscribers
    ///
    /// If there are no active subscribers the event is dropped; processing
    /// never depends on anyone listening.
    pub(crate) fn emit_event(&self, event: Event) {
        self.event_tx.send(event).ok();
    }

    /// Persist a snapshot and publish it on the bus.
    ///
    /// Mid-run persistence failures are logged rather than propagated; the
    /// scheduling loop must not abort because the store hiccuped.
    pub(crate) async fn persist_and_publish(&self, snapshot: &BatchTask) {
        if let Err(e) = self.store.upsert_task(snapshot).await {
            tracing::error!(task_id = snapshot.id.0, error = %e, "Failed to persist task");
        }
        self.bus.publish_task(snapshot);
    }
}

/// Force any processing state left over from an abnormal shutdown to failed.
/// Returns true if anything changed.
fn force_interrupted(task: &mut BatchTask) -> bool {
    let mut changed = false;

    for item in &mut task.items {
        if item.status == ItemStatus::Processing {
            item.status = ItemStatus::Failed;
            item.error = Some(TaskError::Interrupted.to_string());
            // terminal until explicitly retried
            item.attempt_count = item.attempt_count.max(task.config.retry_attempts + 1);
            changed = true;
        }
    }

    if task.status == TaskStatus::Processing {
        task.status = TaskStatus::Failed;
        task.error = Some(TaskError::Interrupted.to_string());
        task.completed_at = Some(chrono::Utc::now());
        changed = true;
    }

    if changed {
        task.sync_aggregates();
    }

    changed
}
