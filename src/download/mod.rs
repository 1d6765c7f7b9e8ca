//! Download queue: persists produced artifacts with bounded concurrency.
//!
//! Mirrors the scheduler's FIFO loop over [`DownloadJob`]s instead of task
//! items. Jobs are offered FIFO but complete out of order; at most one
//! queued-or-in-flight job exists per distinct source reference. A job's
//! destination filename is rendered exactly once, at enqueue time. On
//! success the originating [`TaskResult`] is updated through the task
//! store; on permanent failure the source reference is handed back to
//! observers for manual saving.

mod fetch;
mod naming;


use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use crate::bus::NotificationBus;
use crate::config::DownloadConfig;
use crate::error::Result;
use crate::retry::with_retry;
use crate::storage::ArtifactStorage;
use crate::store::TaskStore;
use crate::types::{
    DownloadJob, DownloadJobUpdate, Event, JobId, JobStatus, ResultId, TaskId, TaskResult,
};

/// Interval between queue polling attempts when the queue is empty
const QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Where an enqueued result came from, for filename rendering and write-back
#[derive(Clone, Debug)]
pub struct DownloadContext {
    /// Task the result belongs to
    pub task_id: TaskId,
    /// Task name (feeds the `{task_name}` template variable)
    pub task_name: String,
    /// Item position within the task (feeds the `{index}` template variable)
    pub item_index: usize,
}

/// Queue state shared between the API surface and the processor loop
struct QueueInner {
    /// FIFO job queue
    queue: VecDeque<DownloadJob>,
    /// Source refs with a queued or in-flight job (the dedup invariant)
    active_sources: HashSet<String>,
}

/// Bounded-concurrency artifact download queue (cloneable - all fields are
/// Arc-wrapped)
#[derive(Clone)]
pub struct DownloadQueue {
    inner: Arc<tokio::sync::Mutex<QueueInner>>,
    config: Arc<DownloadConfig>,
    store: Arc<dyn TaskStore>,
    storage: Arc<dyn ArtifactStorage>,
    client: reqwest::Client,
    /// Semaphore to limit concurrent transfers
    concurrent_limit: Arc<tokio::sync::Semaphore>,
    pub(crate) bus: NotificationBus,
    pub(crate) event_tx: tokio::sync::broadcast::Sender<Event>,
    cancel: tokio_util::sync::CancellationToken,
}

impl DownloadQueue {
    /// Create a new download queue and start its processor loop
    pub fn new(
        config: DownloadConfig,
        store: Arc<dyn TaskStore>,
        storage: Arc<dyn ArtifactStorage>,
    ) -> Self {
        let (event_tx, _rx) = tokio::sync::broadcast::channel(1000);

        let client = match reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to build HTTP client with timeout, using default");
                reqwest::Client::new()
            }
        };

        let queue = Self {
            inner: Arc::new(tokio::sync::Mutex::new(QueueInner {
                queue: VecDeque::new(),
                active_sources: HashSet::new(),
            })),
            concurrent_limit: Arc::new(tokio::sync::Semaphore::new(
                config.max_concurrent_downloads.max(1),
            )),
            config: Arc::new(config),
            store,
            storage,
            client,
            bus: NotificationBus::new(),
            event_tx,
            cancel: tokio_util::sync::CancellationToken::new(),
        };

        // The processor runs until shutdown; the handle is not needed.
        let _ = queue.start_queue_processor();
        queue
    }

    /// Subscribe to the queue's event stream
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Per-subject notification bus (shared with the scheduler when the
    /// queue is attached to one)
    pub fn bus(&self) -> &NotificationBus {
        &self.bus
    }

    /// Stop the processor loop and reject further enqueues
    pub fn shutdown(&self) {
        tracing::info!("Download queue shutting down");
        self.cancel.cancel();
        self.event_tx.send(Event::Shutdown).ok();
    }

    /// Enqueue one task result for download
    ///
    /// Returns false (and enqueues nothing) when a job for the same source
    /// reference is already queued or in flight, or when the queue is shut
    /// down.
    pub async fn enqueue(&self, result: &TaskResult, ctx: &DownloadContext) -> bool {
        if self.cancel.is_cancelled() {
            tracing::debug!(result_id = result.id.0, "enqueue rejected: queue shut down");
            return false;
        }

        let job = {
            let mut inner = self.inner.lock().await;
            if !inner.active_sources.insert(result.image_ref.clone()) {
                tracing::debug!(
                    result_id = result.id.0,
                    "enqueue rejected: source already queued or in flight"
                );
                return false;
            }

            let filename = naming::render(
                &self.config.naming_template,
                &result.image_ref,
                &naming::NamingContext {
                    task_id: ctx.task_id,
                    task_name: &ctx.task_name,
                    index: ctx.item_index,
                    now: chrono::Utc::now(),
                },
            );

            let job = DownloadJob {
                id: JobId::from(result.id),
                task_id: ctx.task_id,
                source: result.image_ref.clone(),
                filename,
                status: JobStatus::Queued,
                retry_count: 0,
                last_error: None,
                fraction: 0.0,
                bytes_per_sec: 0,
            };
            inner.queue.push_back(job.clone());
            job
        };

        tracing::info!(
            job_id = job.id.0,
            task_id = job.task_id.0,
            filename = %job.filename,
            "Download job queued"
        );
        self.event_tx
            .send(Event::DownloadQueued {
                job_id: job.id,
                filename: job.filename.clone(),
            })
            .ok();
        self.publish_update(&job, None, None);

        true
    }

    /// Enqueue several results, returning how many were accepted
    ///
    /// Each result is deduplicated individually; the `{index}` template
    /// variable advances from `ctx.item_index` per accepted result.
    pub async fn enqueue_batch(&self, results: &[TaskResult], ctx: &DownloadContext) -> usize {
        let mut accepted = 0;
        for (offset, result) in results.iter().enumerate() {
            let item_ctx = DownloadContext {
                item_index: ctx.item_index + offset,
                ..ctx.clone()
            };
            if self.enqueue(result, &item_ctx).await {
                accepted += 1;
            }
        }
        accepted
    }

    /// Re-enqueue results that are not yet marked downloaded
    ///
    /// Scoped to one task when `task_id` is given, otherwise across every
    /// persisted task. Already queued or in-flight sources stay
    /// deduplicated.
    pub async fn retry_failed(&self, task_id: Option<TaskId>) -> Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(crate::error::Error::ShuttingDown);
        }

        let tasks = self.store.list_tasks().await?;

        let mut enqueued = 0;
        for task in tasks {
            if let Some(filter) = task_id
                && task.id != filter
            {
                continue;
            }
            for (index, result) in task.results.iter().enumerate() {
                if result.downloaded {
                    continue;
                }
                let ctx = DownloadContext {
                    task_id: task.id,
                    task_name: task.name.clone(),
                    item_index: index,
                };
                if self.enqueue(result, &ctx).await {
                    enqueued += 1;
                }
            }
        }

        tracing::info!(count = enqueued, "Re-enqueued undownloaded results");
        Ok(enqueued)
    }

    /// Re-enqueue every undownloaded result across all tasks
    pub async fn retry_all(&self) -> Result<usize> {
        self.retry_failed(None).await
    }

    /// Number of jobs waiting in the queue (in-flight jobs excluded)
    pub async fn queued_count(&self) -> usize {
        self.inner.lock().await.queue.len()
    }

    /// Start the queue processor task
    ///
    /// The processor continuously pops the next job, acquires a permit from
    /// the concurrency limiter, and spawns a worker for it. FIFO offering
    /// with out-of-order completion, exactly like the scheduler's item loop.
    fn start_queue_processor(&self) -> tokio::task::JoinHandle<()> {
        let queue = self.clone();

        tokio::spawn(async move {
            loop {
                if queue.cancel.is_cancelled() {
                    break;
                }

                let job = {
                    let mut inner = queue.inner.lock().await;
                    inner.queue.pop_front()
                };

                if let Some(job) = job {
                    let permit = match queue.concurrent_limit.clone().acquire_owned().await {
                        Ok(p) => p,
                        Err(_) => {
                            // Semaphore closed - re-push the job so it isn't lost
                            let mut inner = queue.inner.lock().await;
                            inner.queue.push_front(job);
                            break;
                        }
                    };

                    let worker = queue.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        worker.run_job(job).await;
                    });
                } else {
                    tokio::select! {
                        _ = tokio::time::sleep(QUEUE_POLL_INTERVAL) => {}
                        _ = queue.cancel.cancelled() => break,
                    }
                }
            }
        })
    }

    /// Execute one download job to a terminal state.
    async fn run_job(&self, mut job: DownloadJob) {
        job.status = JobStatus::Fetching;
        self.publish_update(&job, None, None);

        let attempts = std::sync::atomic::AtomicU32::new(0);
        let fetched = with_retry(&self.config.retry, || {
            attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let bus = self.bus.clone();
            let event_tx = self.event_tx.clone();
            let job_id = job.id;
            let source = job.source.clone();
            let client = self.client.clone();
            async move {
                fetch::fetch_artifact(&client, &source, |fraction, rate| {
                    event_tx
                        .send(Event::DownloadProgress {
                            job_id,
                            fraction,
                            bytes_per_sec: rate,
                        })
                        .ok();
                    bus.publish_job(&DownloadJobUpdate {
                        job_id,
                        status: JobStatus::Fetching,
                        fraction,
                        bytes_per_sec: rate,
                        error: None,
                        local_path: None,
                    });
                })
                .await
            }
        })
        .await;
        job.retry_count = attempts
            .load(std::sync::atomic::Ordering::SeqCst)
            .saturating_sub(1);

        let saved = match fetched {
            Ok(bytes) => {
                let dest = self.config.download_dir.join(&job.filename);
                self.storage.save(&bytes, &dest).await
            }
            Err(e) => Err(e),
        };

        // The job is terminal either way; free its source before observers
        // hear about the outcome, so a manual retry is never rejected.
        {
            let mut inner = self.inner.lock().await;
            inner.active_sources.remove(&job.source);
        }

        match saved {
            Ok(final_path) => {
                job.status = JobStatus::Complete;
                job.fraction = 1.0;

                tracing::info!(
                    job_id = job.id.0,
                    path = %final_path.display(),
                    retries = job.retry_count,
                    "Download complete"
                );

                self.write_back(&job, &final_path).await;

                self.event_tx
                    .send(Event::DownloadComplete {
                        job_id: job.id,
                        path: final_path.clone(),
                    })
                    .ok();
                self.publish_update(&job, None, Some(final_path));
            }
            Err(e) => {
                let error = e.to_string();
                job.status = JobStatus::Failed;
                job.last_error = Some(error.clone());

                tracing::warn!(
                    job_id = job.id.0,
                    error = %error,
                    "Download failed, handing source back for manual save"
                );

                self.event_tx
                    .send(Event::DownloadFailed {
                        job_id: job.id,
                        error: error.clone(),
                    })
                    .ok();
                self.event_tx
                    .send(Event::DownloadFallback {
                        job_id: job.id,
                        source: job.source.clone(),
                    })
                    .ok();
                self.publish_update(&job, Some(error), None);
            }
        }
    }

    /// Write the final path back onto the originating task result.
    ///
    /// The result is located by id through the task store (the job holds
    /// only a weak, by-id reference). A missing task or result is logged
    /// and skipped; it never fails the download.
    async fn write_back(&self, job: &DownloadJob, final_path: &std::path::Path) {
        let tasks = match self.store.list_tasks().await {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::error!(job_id = job.id.0, error = %e, "Failed to load tasks for write-back");
                return;
            }
        };

        let result_id = ResultId::from(job.id);
        let Some(mut task) = tasks.into_iter().find(|t| t.id == job.task_id) else {
            tracing::warn!(
                job_id = job.id.0,
                task_id = job.task_id.0,
                "Originating task not found, artifact saved but not recorded"
            );
            return;
        };

        let Some(result) = task.result_mut(result_id) else {
            tracing::warn!(
                job_id = job.id.0,
                task_id = job.task_id.0,
                "Originating result not found, artifact saved but not recorded"
            );
            return;
        };

        result.downloaded = true;
        result.local_path = Some(final_path.to_path_buf());

        if let Err(e) = self.store.upsert_task(&task).await {
            tracing::error!(job_id = job.id.0, error = %e, "Failed to persist download write-back");
            return;
        }
        self.bus.publish_task(&task);
    }

    fn publish_update(
        &self,
        job: &DownloadJob,
        error: Option<String>,
        local_path: Option<std::path::PathBuf>,
    ) {
        self.bus.publish_job(&DownloadJobUpdate {
            job_id: job.id,
            status: job.status,
            fraction: job.fraction,
            bytes_per_sec: job.bytes_per_sec,
            error,
            local_path,
        });
    }
}
