//! Task lifecycle control - start, pause, resume, stop, retry, delete.

use chrono::Utc;

use super::TaskScheduler;
use crate::error::{Result, TaskError};
use crate::types::{Event, ItemId, ItemStatus, TaskId, TaskStatus};

/// Which items a retry operation resets
///
/// Whole-task retry, failed-only retry, and single-item retry are the same
/// reset operation with different scopes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryScope {
    /// Reset every item and clear all results
    All,
    /// Reset only items currently in Failed state, keeping successes intact
    FailedOnly,
    /// Reset exactly one item (its result, if any, is discarded)
    Item(ItemId),
}

impl TaskScheduler {
    /// Start a pending task
    ///
    /// Transitions the task to `Processing`, records the start time, and
    /// begins dispatching items. A task in any other state is left
    /// untouched (the call is a no-op, not an error).
    pub async fn start_task(&self, id: TaskId) -> Result<()> {
        let snapshot = {
            let mut state = self.state.lock().await;
            let entry = state
                .tasks
                .get_mut(&id)
                .ok_or(TaskError::NotFound { id: id.get() })?;

            if entry.task.status != TaskStatus::Pending {
                tracing::debug!(
                    task_id = id.0,
                    status = ?entry.task.status,
                    "start_task ignored: task is not pending"
                );
                return Ok(());
            }

            if entry.backend.is_none() {
                entry.backend = Some(self.backends.select(&entry.task.config.model_family)?);
            }

            entry.task.status = TaskStatus::Processing;
            entry.task.started_at = Some(Utc::now());
            entry.task.clone()
        };

        tracing::info!(task_id = id.0, "Task started");
        self.emit_event(Event::TaskStarted { id });
        self.persist_and_publish(&snapshot).await;
        self.pump(id).await;

        Ok(())
    }

    /// Pause a processing task
    ///
    /// Items currently in flight are reset to pending and their network
    /// calls abandoned: the epoch bump makes any late-arriving resolution
    /// stale, so it is discarded instead of applied. The rolled-back
    /// attempt count keeps abandoned calls from burning the retry budget.
    /// A task in any state other than `Processing` is left untouched.
    pub async fn pause_task(&self, id: TaskId) -> Result<()> {
        let snapshot = {
            let mut state = self.state.lock().await;
            let entry = state
                .tasks
                .get_mut(&id)
                .ok_or(TaskError::NotFound { id: id.get() })?;

            if entry.task.status != TaskStatus::Processing {
                tracing::debug!(
                    task_id = id.0,
                    status = ?entry.task.status,
                    "pause_task ignored: task is not processing"
                );
                return Ok(());
            }

            entry.epoch += 1;

            for item in &mut entry.task.items {
                if item.status == ItemStatus::Processing {
                    item.status = ItemStatus::Pending;
                    item.attempt_count = item.attempt_count.saturating_sub(1);
                }
            }

            entry.task.status = TaskStatus::Paused;
            entry.task.sync_aggregates();
            entry.task.clone()
        };

        tracing::info!(task_id = id.0, "Task paused");
        self.emit_event(Event::TaskPaused { id });
        self.persist_and_publish(&snapshot).await;

        Ok(())
    }

    /// Resume a paused task
    ///
    /// Recomputes aggregate counts from item states and restarts the
    /// execution loop. Failed items that still have attempts remaining
    /// re-enter the pending pool immediately; their retry timers died with
    /// the pause. A task in any state other than `Paused` is left untouched.
    pub async fn resume_task(&self, id: TaskId) -> Result<()> {
        let snapshot = {
            let mut state = self.state.lock().await;
            let entry = state
                .tasks
                .get_mut(&id)
                .ok_or(TaskError::NotFound { id: id.get() })?;

            if entry.task.status != TaskStatus::Paused {
                tracing::debug!(
                    task_id = id.0,
                    status = ?entry.task.status,
                    "resume_task ignored: task is not paused"
                );
                return Ok(());
            }

            let retry_attempts = entry.task.config.retry_attempts;
            for item in &mut entry.task.items {
                if item.status == ItemStatus::Failed && item.attempt_count < retry_attempts + 1 {
                    item.status = ItemStatus::Pending;
                }
            }

            entry.task.status = TaskStatus::Processing;
            entry.task.sync_aggregates();
            entry.task.clone()
        };

        tracing::info!(task_id = id.0, "Task resumed");
        self.emit_event(Event::TaskResumed { id });
        self.persist_and_publish(&snapshot).await;
        self.finalize_or_pump(id).await;

        Ok(())
    }

    /// Stop a processing or paused task
    ///
    /// Pending and in-flight items move to `Cancelled`; in-flight network
    /// calls are not aborted, their eventual resolutions are discarded.
    ///
    /// # Errors
    ///
    /// [`TaskError::InvalidState`] unless the task is `Processing` or
    /// `Paused`.
    pub async fn stop_task(&self, id: TaskId) -> Result<()> {
        let snapshot = {
            let mut state = self.state.lock().await;
            let entry = state
                .tasks
                .get_mut(&id)
                .ok_or(TaskError::NotFound { id: id.get() })?;

            match entry.task.status {
                TaskStatus::Processing | TaskStatus::Paused => {}
                status => {
                    return Err(TaskError::InvalidState {
                        id: id.get(),
                        operation: "stop".to_string(),
                        current_state: format!("{:?}", status),
                    }
                    .into());
                }
            }

            entry.epoch += 1;

            for item in &mut entry.task.items {
                if matches!(item.status, ItemStatus::Pending | ItemStatus::Processing) {
                    item.status = ItemStatus::Cancelled;
                }
            }

            entry.task.status = TaskStatus::Cancelled;
            entry.task.completed_at = Some(Utc::now());
            entry.task.sync_aggregates();
            entry.task.clone()
        };

        tracing::info!(task_id = id.0, "Task cancelled");
        self.emit_event(Event::TaskCancelled { id });
        self.persist_and_publish(&snapshot).await;

        Ok(())
    }

    /// Retry the whole task: reset every item and counter, clear results,
    /// and restart
    pub async fn retry_task(&self, id: TaskId) -> Result<()> {
        self.retry_items(id, RetryScope::All).await
    }

    /// Retry only failed items, leaving successes intact
    ///
    /// Calling this on a task with zero failed items is a strict no-op: no
    /// state change, no persistence write, no event.
    pub async fn retry_failed_items(&self, id: TaskId) -> Result<()> {
        self.retry_items(id, RetryScope::FailedOnly).await
    }

    /// Retry exactly one item
    pub async fn retry_task_item(&self, id: TaskId, item_id: ItemId) -> Result<()> {
        self.retry_items(id, RetryScope::Item(item_id)).await
    }

    /// Reset the items selected by `scope` to their initial state and
    /// (re)start the execution loop
    pub async fn retry_items(&self, id: TaskId, scope: RetryScope) -> Result<()> {
        let snapshot = {
            let mut state = self.state.lock().await;
            let entry = state
                .tasks
                .get_mut(&id)
                .ok_or(TaskError::NotFound { id: id.get() })?;

            let matched: Vec<ItemId> = match scope {
                RetryScope::All => entry.task.items.iter().map(|i| i.id).collect(),
                RetryScope::FailedOnly => entry
                    .task
                    .items
                    .iter()
                    .filter(|i| i.status == ItemStatus::Failed)
                    .map(|i| i.id)
                    .collect(),
                RetryScope::Item(item_id) => {
                    let Some(item) = entry.task.item(item_id) else {
                        return Err(TaskError::ItemNotFound {
                            task_id: id.get(),
                            item_id: item_id.get(),
                        }
                        .into());
                    };
                    if item.status == ItemStatus::Processing {
                        return Err(TaskError::InvalidState {
                            id: id.get(),
                            operation: "retry item".to_string(),
                            current_state: "processing".to_string(),
                        }
                        .into());
                    }
                    vec![item_id]
                }
            };

            if matched.is_empty() {
                tracing::debug!(task_id = id.0, ?scope, "retry matched no items, no-op");
                return Ok(());
            }

            // A whole-task reset abandons every in-flight call, so the epoch
            // advances. Narrower scopes only touch items that are not in
            // flight; in-flight calls keep resolving under the current epoch.
            if scope == RetryScope::All {
                entry.epoch += 1;
            }

            for item_id in &matched {
                if let Some(item) = entry.task.item_mut(*item_id) {
                    item.status = ItemStatus::Pending;
                    item.attempt_count = 0;
                    item.error = None;
                    item.processed_at = None;
                    item.debug_logs.clear();
                }
            }

            // A reset item's old result no longer corresponds to anything.
            match scope {
                RetryScope::All => entry.task.results.clear(),
                _ => entry
                    .task
                    .results
                    .retain(|r| !matched.contains(&r.item_id)),
            }

            entry.task.status = TaskStatus::Processing;
            if entry.task.started_at.is_none() {
                entry.task.started_at = Some(Utc::now());
            }
            entry.task.completed_at = None;
            entry.task.error = None;
            entry.task.sync_aggregates();
            entry.task.clone()
        };

        tracing::info!(task_id = id.0, ?scope, "Task items reset for retry");
        self.emit_event(Event::TaskStarted { id });
        self.persist_and_publish(&snapshot).await;
        self.pump(id).await;

        Ok(())
    }

    /// Delete a task
    ///
    /// Stops it implicitly if active (in-flight resolutions find no entry
    /// and are discarded), removes the in-memory aggregate, and deletes the
    /// persisted row.
    pub async fn delete_task(&self, id: TaskId) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if state.tasks.remove(&id).is_none() {
                return Err(TaskError::NotFound { id: id.get() }.into());
            }
        }

        self.store.delete_task(id).await?;

        tracing::info!(task_id = id.0, "Task deleted");
        self.emit_event(Event::TaskRemoved { id });

        Ok(())
    }
}
