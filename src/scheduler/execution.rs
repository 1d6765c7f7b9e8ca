//! The bounded-concurrency scheduling loop.
//!
//! Every trigger (task start, item resolution, retry-timer fire, resume)
//! funnels through [`TaskScheduler::pump`], which refills free concurrency
//! slots with pending items in insertion order. Resolutions are applied
//! under an epoch guard: pause, stop, and reset bump the task's epoch, and
//! any in-flight call that resolves afterwards is discarded rather than
//! applied to state it no longer matches.

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::TaskScheduler;
use crate::backend::{GenerationBackend, GenerationRequest, GenerationOutput};
use crate::download::DownloadContext;
use crate::error::{Error, Result};
use crate::types::{
    BatchTask, DebugLogEntry, DebugPayload, Event, ItemId, ItemStatus, TaskId, TaskResult,
    TaskStatus,
};

/// Everything one dispatched attempt needs, captured under the state lock
struct DispatchPlan {
    item_id: ItemId,
    attempt: u32,
    epoch: u64,
    request: GenerationRequest,
    backend: Arc<dyn GenerationBackend>,
}

/// What a resolution did, for post-lock event emission
enum Applied {
    Completed {
        result: TaskResult,
        download: Option<DownloadContext>,
    },
    Failed {
        error: String,
        will_retry: bool,
        retry_delay: Duration,
    },
}

impl TaskScheduler {
    /// Refill free concurrency slots for a task.
    ///
    /// Selects up to `concurrent_limit - processing` pending items in
    /// insertion order, marks them processing, and dispatches their
    /// generation calls. No-op unless the task is in `Processing`.
    pub(crate) async fn pump(&self, task_id: TaskId) {
        let (plans, snapshot) = {
            let mut state = self.state.lock().await;
            let Some(entry) = state.tasks.get_mut(&task_id) else {
                return;
            };
            if entry.task.status != TaskStatus::Processing {
                return;
            }
            let Some(backend) = entry.backend.clone() else {
                return;
            };

            let limit = entry.task.config.concurrent_limit;
            let active = entry.task.processing_count();
            if active >= limit {
                return;
            }
            let free = limit - active;
            let epoch = entry.epoch;
            let config = entry.task.config.clone();

            let selected: Vec<ItemId> = entry
                .task
                .items
                .iter()
                .filter(|i| i.status == ItemStatus::Pending)
                .take(free)
                .map(|i| i.id)
                .collect();

            if selected.is_empty() {
                return;
            }

            let mut plans = Vec::with_capacity(selected.len());
            for item_id in selected {
                let Some(item) = entry.task.item_mut(item_id) else {
                    continue;
                };
                item.status = ItemStatus::Processing;
                item.attempt_count += 1;
                item.error = None;
                item.debug_logs.push(DebugLogEntry {
                    timestamp: Utc::now(),
                    duration: None,
                    payload: DebugPayload::Request {
                        model: config.model.clone(),
                        attempt: item.attempt_count,
                    },
                });

                plans.push(DispatchPlan {
                    item_id,
                    attempt: item.attempt_count,
                    epoch,
                    request: GenerationRequest {
                        prompt: item.prompt.clone(),
                        model: config.model.clone(),
                        source_images: item.source_images.clone(),
                        mask: item.mask.clone(),
                        aspect_ratio: config.aspect_ratio.clone(),
                        size: config.size.clone(),
                        quality: config.quality.clone(),
                        timeout: config.api_timeout,
                    },
                    backend: Arc::clone(&backend),
                });
            }

            (plans, entry.task.clone())
        };

        for plan in &plans {
            tracing::debug!(
                task_id = task_id.0,
                item_id = plan.item_id.0,
                attempt = plan.attempt,
                "Dispatching generation call"
            );
            self.emit_event(Event::ItemStarted {
                task_id,
                item_id: plan.item_id,
                attempt: plan.attempt,
            });
        }

        self.persist_and_publish(&snapshot).await;

        for plan in plans {
            self.spawn_attempt(task_id, plan);
        }
    }

    /// Spawn one generation call; its resolution re-enters the scheduler
    /// through [`apply_resolution`](Self::apply_resolution).
    fn spawn_attempt(&self, task_id: TaskId, plan: DispatchPlan) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let outcome = match plan.request.timeout {
                Some(timeout) => {
                    match tokio::time::timeout(timeout, plan.backend.generate(&plan.request)).await
                    {
                        Ok(result) => result,
                        Err(_) => Err(Error::generation(format!(
                            "generation call timed out after {} ms",
                            timeout.as_millis()
                        ))),
                    }
                }
                None => plan.backend.generate(&plan.request).await,
            };

            scheduler
                .apply_resolution(task_id, plan.item_id, plan.epoch, outcome, started.elapsed())
                .await;
        });
    }

    /// Apply the outcome of a dispatched generation call.
    ///
    /// Discards stale resolutions (epoch mismatch, task no longer
    /// processing, item no longer processing); otherwise records the result
    /// or the failure, recomputes aggregates, and re-triggers the loop.
    pub(crate) async fn apply_resolution(
        &self,
        task_id: TaskId,
        item_id: ItemId,
        epoch: u64,
        outcome: Result<GenerationOutput>,
        elapsed: Duration,
    ) {
        let (applied, snapshot) = {
            let mut state = self.state.lock().await;
            let Some(entry) = state.tasks.get_mut(&task_id) else {
                tracing::debug!(
                    task_id = task_id.0,
                    item_id = item_id.0,
                    "Resolution for unknown task discarded"
                );
                return;
            };
            if entry.epoch != epoch || entry.task.status != TaskStatus::Processing {
                tracing::debug!(
                    task_id = task_id.0,
                    item_id = item_id.0,
                    "Stale resolution discarded"
                );
                return;
            }

            let config = entry.task.config.clone();
            let task_name = entry.task.name.clone();
            let item_index = entry.task.items.iter().position(|i| i.id == item_id);

            let Some(item) = entry.task.item_mut(item_id) else {
                tracing::warn!(
                    task_id = task_id.0,
                    item_id = item_id.0,
                    "Resolution for unknown item ignored"
                );
                return;
            };
            if item.status != ItemStatus::Processing {
                tracing::debug!(
                    task_id = task_id.0,
                    item_id = item_id.0,
                    status = ?item.status,
                    "Resolution for non-processing item discarded"
                );
                return;
            }

            let applied = match outcome {
                Ok(output) => {
                    item.status = ItemStatus::Completed;
                    item.processed_at = Some(Utc::now());
                    item.debug_logs.push(DebugLogEntry {
                        timestamp: Utc::now(),
                        duration: Some(elapsed),
                        payload: DebugPayload::Response {
                            image_ref: output.image_ref.clone(),
                        },
                    });

                    let result = TaskResult {
                        id: self.ids.result_id(),
                        item_id,
                        image_ref: output.image_ref,
                        downloaded: false,
                        local_path: None,
                        created_at: Utc::now(),
                        duration: Some(elapsed),
                    };
                    entry.task.results.push(result.clone());

                    let download = (config.auto_download && self.downloads.is_some()).then(|| {
                        DownloadContext {
                            task_id,
                            task_name,
                            item_index: item_index.unwrap_or(0),
                        }
                    });

                    Applied::Completed { result, download }
                }
                Err(e) => {
                    let (message, code) = match e {
                        Error::Generation { message, code } => (message, code),
                        other => (other.to_string(), None),
                    };

                    item.status = ItemStatus::Failed;
                    item.processed_at = Some(Utc::now());
                    item.error = Some(message.clone());
                    item.debug_logs.push(DebugLogEntry {
                        timestamp: Utc::now(),
                        duration: Some(elapsed),
                        payload: DebugPayload::Error {
                            message: message.clone(),
                            code,
                        },
                    });

                    let will_retry = item.attempt_count < config.retry_attempts + 1;

                    Applied::Failed {
                        error: message,
                        will_retry,
                        retry_delay: config.retry_delay,
                    }
                }
            };

            entry.task.sync_aggregates();
            (applied, entry.task.clone())
        };

        match &applied {
            Applied::Completed { result, .. } => {
                tracing::info!(
                    task_id = task_id.0,
                    item_id = item_id.0,
                    result_id = result.id.0,
                    duration_ms = elapsed.as_millis() as u64,
                    "Item completed"
                );
                self.emit_event(Event::ItemCompleted {
                    task_id,
                    item_id,
                    result_id: result.id,
                });
            }
            Applied::Failed {
                error, will_retry, ..
            } => {
                tracing::warn!(
                    task_id = task_id.0,
                    item_id = item_id.0,
                    error = %error,
                    will_retry = will_retry,
                    "Item failed"
                );
                self.emit_event(Event::ItemFailed {
                    task_id,
                    item_id,
                    error: error.clone(),
                    will_retry: *will_retry,
                });
            }
        }

        self.emit_event(Event::TaskProgress {
            id: task_id,
            progress: snapshot.progress,
            completed: snapshot.completed_items,
            failed: snapshot.failed_items,
            total: snapshot.total_items,
        });
        self.persist_and_publish(&snapshot).await;

        match applied {
            Applied::Completed { result, download } => {
                if let Some(ctx) = download
                    && let Some(queue) = &self.downloads
                {
                    queue.enqueue(&result, &ctx).await;
                }
            }
            Applied::Failed {
                will_retry: true,
                retry_delay,
                ..
            } => {
                self.schedule_retry(task_id, item_id, epoch, retry_delay);
            }
            Applied::Failed { .. } => {}
        }

        self.finalize_or_pump(task_id).await;
    }

    /// Flip a transiently-failed item back to pending after the configured
    /// delay, unless the task moved underneath the timer.
    fn schedule_retry(&self, task_id: TaskId, item_id: ItemId, epoch: u64, delay: Duration) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let snapshot = {
                let mut state = scheduler.state.lock().await;
                let Some(entry) = state.tasks.get_mut(&task_id) else {
                    return;
                };
                if entry.epoch != epoch || entry.task.status != TaskStatus::Processing {
                    tracing::debug!(
                        task_id = task_id.0,
                        item_id = item_id.0,
                        "Retry timer fired for stale epoch, discarded"
                    );
                    return;
                }
                let Some(item) = entry.task.item_mut(item_id) else {
                    return;
                };
                if item.status != ItemStatus::Failed {
                    return;
                }

                item.status = ItemStatus::Pending;
                entry.task.sync_aggregates();
                entry.task.clone()
            };

            tracing::debug!(
                task_id = task_id.0,
                item_id = item_id.0,
                "Item re-entered pending pool for retry"
            );
            scheduler.persist_and_publish(&snapshot).await;
            scheduler.pump(task_id).await;
        });
    }

    /// Finalize the task if every item is resolved; otherwise refill slots.
    pub(crate) async fn finalize_or_pump(&self, task_id: TaskId) {
        let finalized: Option<BatchTask> = {
            let mut state = self.state.lock().await;
            let Some(entry) = state.tasks.get_mut(&task_id) else {
                return;
            };
            if entry.task.status != TaskStatus::Processing {
                return;
            }

            let retry_attempts = entry.task.config.retry_attempts;
            let all_resolved = entry
                .task
                .items
                .iter()
                .all(|i| i.is_resolved(retry_attempts));

            if !all_resolved {
                None
            } else {
                let succeeded = entry.task.completed_items > 0;
                entry.task.status = if succeeded {
                    TaskStatus::Completed
                } else {
                    TaskStatus::Failed
                };
                entry.task.completed_at = Some(Utc::now());
                if !succeeded {
                    entry.task.error = Some(format!(
                        "all {} items failed",
                        entry.task.failed_items
                    ));
                }
                Some(entry.task.clone())
            }
        };

        match finalized {
            Some(snapshot) => {
                if snapshot.status == TaskStatus::Completed {
                    tracing::info!(
                        task_id = task_id.0,
                        completed = snapshot.completed_items,
                        failed = snapshot.failed_items,
                        "Task completed"
                    );
                    self.emit_event(Event::TaskCompleted {
                        id: task_id,
                        completed: snapshot.completed_items,
                        failed: snapshot.failed_items,
                    });
                } else {
                    tracing::warn!(
                        task_id = task_id.0,
                        failed = snapshot.failed_items,
                        "Task failed: no items succeeded"
                    );
                    self.emit_event(Event::TaskFailed {
                        id: task_id,
                        error: snapshot.error.clone().unwrap_or_default(),
                    });
                }
                self.persist_and_publish(&snapshot).await;
            }
            None => self.pump(task_id).await,
        }
    }
}
