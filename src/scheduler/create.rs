//! Task creation and validation.

use chrono::Utc;

use super::{TaskEntry, TaskScheduler};
use crate::error::{Error, Result, TaskError};
use crate::types::{
    BatchTask, BatchTaskConfig, Event, NewTaskItem, TaskId, TaskItem, TaskKind, TaskStatus,
};
use crate::types::ItemStatus;

impl TaskScheduler {
    /// Create a new batch task
    ///
    /// Validates the config and item list, expands each submitted item into
    /// `generate_count` task items, persists the aggregate, and returns the
    /// new task id. The task sits in `Pending` until [`start_task`] is
    /// called; creation has no effect on execution.
    ///
    /// [`start_task`]: TaskScheduler::start_task
    ///
    /// # Errors
    ///
    /// - [`TaskError::EmptyItems`] if `items` is empty
    /// - [`Error::Config`] if the config is invalid
    /// - [`TaskError::UnknownModelFamily`] if no backend covers the family
    /// - Store errors propagate; on persistence failure nothing is kept in
    ///   memory, so the scheduler never holds an unpersisted task
    pub async fn create_task(
        &self,
        name: impl Into<String>,
        items: Vec<NewTaskItem>,
        config: BatchTaskConfig,
        kind: TaskKind,
    ) -> Result<TaskId> {
        let name = name.into();

        if items.is_empty() {
            return Err(TaskError::EmptyItems.into());
        }
        validate_config(&config)?;

        // Resolve the backend once; every dispatch for this task uses it.
        let backend = self.backends.select(&config.model_family)?;

        let task_id = self.ids.task_id();
        let now = Utc::now();
        let per_prompt = config.generate_count.unwrap_or(1).max(1);

        let mut task_items = Vec::with_capacity(items.len() * per_prompt as usize);
        for input in &items {
            for _ in 0..per_prompt {
                task_items.push(TaskItem {
                    id: self.ids.item_id(),
                    prompt: input.prompt.clone(),
                    source_images: input.source_images.clone(),
                    mask: input.mask.clone(),
                    priority: 0,
                    status: ItemStatus::Pending,
                    attempt_count: 0,
                    created_at: now,
                    processed_at: None,
                    error: None,
                    debug_logs: Vec::new(),
                });
            }
        }

        let mut task = BatchTask {
            id: task_id,
            name: name.clone(),
            kind,
            status: TaskStatus::Pending,
            progress: 0,
            total_items: 0,
            completed_items: 0,
            failed_items: 0,
            created_at: now,
            started_at: None,
            completed_at: None,
            config,
            items: task_items,
            results: Vec::new(),
            error: None,
        };
        task.sync_aggregates();

        // Persist before inserting in memory; a store failure leaves no trace.
        self.store.upsert_task(&task).await?;

        {
            let mut state = self.state.lock().await;
            state.tasks.insert(
                task_id,
                TaskEntry {
                    task: task.clone(),
                    epoch: 0,
                    backend: Some(backend),
                },
            );
        }

        tracing::info!(
            task_id = task_id.0,
            name = %name,
            items = task.total_items,
            concurrent_limit = task.config.concurrent_limit,
            "Batch task created"
        );

        self.emit_event(Event::TaskQueued { id: task_id, name });
        self.bus.publish_task(&task);

        Ok(task_id)
    }
}

fn validate_config(config: &BatchTaskConfig) -> Result<()> {
    if config.concurrent_limit < 1 {
        return Err(Error::config(
            "concurrent_limit must be at least 1",
            "concurrent_limit",
        ));
    }
    if config.model.is_empty() {
        return Err(Error::config("model must not be empty", "model"));
    }
    Ok(())
}
