//! Shared test helpers for scheduler and download-queue tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::backend::{BackendSet, GenerationBackend, GenerationOutput, GenerationRequest};
use crate::error::{Error, Result};
use crate::scheduler::TaskScheduler;
use crate::store::{MemoryTaskStore, TaskStore};
use crate::types::{BatchTask, BatchTaskConfig, NewTaskItem, TaskId, TaskStatus};

/// Scripted behavior for one prompt
struct Script {
    /// How long the call takes
    delay: Duration,
    /// Failures to serve before succeeding (u32::MAX = fail forever)
    failures_remaining: u32,
}

/// Scripted generation backend for tests.
///
/// Unscripted prompts succeed instantly. Tracks call order and the peak
/// number of concurrent in-flight calls, so tests can assert FIFO offering
/// and the concurrency ceiling.
pub(crate) struct MockBackend {
    scripts: Mutex<HashMap<String, Script>>,
    /// Prompts in dispatch order
    started: Mutex<Vec<String>>,
    /// When set, successful calls return this reference instead of the
    /// default synthetic URL
    image_ref: Mutex<Option<String>>,
    calls: AtomicU32,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl MockBackend {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
            started: Mutex::new(Vec::new()),
            image_ref: Mutex::new(None),
            calls: AtomicU32::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        })
    }

    /// Make every successful call return `image_ref`
    pub(crate) fn respond_with_ref(&self, image_ref: &str) {
        *self.image_ref.lock().unwrap() = Some(image_ref.to_string());
    }

    /// Fail the next `times` calls for `prompt`, then succeed
    pub(crate) fn fail_times(&self, prompt: &str, times: u32) {
        self.scripts.lock().unwrap().insert(
            prompt.to_string(),
            Script {
                delay: Duration::ZERO,
                failures_remaining: times,
            },
        );
    }

    /// Fail every call for `prompt`
    pub(crate) fn fail_always(&self, prompt: &str) {
        self.fail_times(prompt, u32::MAX);
    }

    /// Make calls for `prompt` take `delay` before succeeding
    pub(crate) fn delay(&self, prompt: &str, delay: Duration) {
        self.scripts.lock().unwrap().insert(
            prompt.to_string(),
            Script {
                delay,
                failures_remaining: 0,
            },
        );
    }

    /// Prompts in the order their calls were dispatched
    pub(crate) fn started_order(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    /// Total number of generation calls served
    pub(crate) fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Peak number of concurrent in-flight calls observed
    pub(crate) fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationBackend for MockBackend {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.lock().unwrap().push(request.prompt.clone());

        let current = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(current, Ordering::SeqCst);

        let (delay, fail) = {
            let mut scripts = self.scripts.lock().unwrap();
            match scripts.get_mut(&request.prompt) {
                Some(script) => {
                    let fail = script.failures_remaining > 0;
                    if fail && script.failures_remaining != u32::MAX {
                        script.failures_remaining -= 1;
                    }
                    (script.delay, fail)
                }
                None => (Duration::ZERO, false),
            }
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.active.fetch_sub(1, Ordering::SeqCst);

        if fail {
            Err(Error::Generation {
                message: format!("scripted failure for '{}'", request.prompt),
                code: Some("503".to_string()),
            })
        } else {
            let image_ref = self
                .image_ref
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| format!("https://img.test/{call}.png"));
            Ok(GenerationOutput { image_ref })
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Task store that can be switched into a failing mode
#[derive(Clone, Default)]
pub(crate) struct FailingTaskStore {
    inner: MemoryTaskStore,
    fail_writes: Arc<std::sync::atomic::AtomicBool>,
}

impl FailingTaskStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl TaskStore for FailingTaskStore {
    async fn list_tasks(&self) -> Result<Vec<BatchTask>> {
        self.inner.list_tasks().await
    }

    async fn upsert_task(&self, task: &BatchTask) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Store("storage quota exhausted".to_string()));
        }
        self.inner.upsert_task(task).await
    }

    async fn delete_task(&self, id: TaskId) -> Result<()> {
        self.inner.delete_task(id).await
    }
}

/// Build a scheduler over a fresh memory store and the given mock backend,
/// registered under the "mock" model family.
pub(crate) async fn create_test_scheduler(
    backend: Arc<MockBackend>,
) -> (TaskScheduler, Arc<MemoryTaskStore>) {
    let store = Arc::new(MemoryTaskStore::new());
    let mut backends = BackendSet::new();
    backends.register("mock", backend);

    let scheduler = TaskScheduler::new(store.clone(), backends, None)
        .await
        .unwrap();
    (scheduler, store)
}

/// Task config wired for the "mock" backend family
pub(crate) fn test_config() -> BatchTaskConfig {
    BatchTaskConfig {
        model: "mock-model".to_string(),
        model_family: "mock".to_string(),
        concurrent_limit: 2,
        retry_attempts: 0,
        retry_delay: Duration::from_millis(20),
        auto_download: false,
        ..Default::default()
    }
}

/// One prompt-only item
pub(crate) fn prompt_item(prompt: &str) -> NewTaskItem {
    NewTaskItem {
        prompt: prompt.to_string(),
        ..Default::default()
    }
}

/// Poll until the task reaches `status`, panicking after `timeout`.
pub(crate) async fn wait_for_task_status(
    scheduler: &TaskScheduler,
    id: TaskId,
    status: TaskStatus,
    timeout: Duration,
) -> BatchTask {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let task = scheduler.get_task(id).await.expect("task should exist");
        if task.status == status {
            return task;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "task {} did not reach {:?} within {:?} (currently {:?}, {}/{} done, {} failed)",
                id,
                status,
                timeout,
                task.status,
                task.completed_items,
                task.total_items,
                task.failed_items,
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until `predicate` returns true for the task, panicking after `timeout`.
pub(crate) async fn wait_for_task<F>(
    scheduler: &TaskScheduler,
    id: TaskId,
    timeout: Duration,
    predicate: F,
) -> BatchTask
where
    F: Fn(&BatchTask) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let task = scheduler.get_task(id).await.expect("task should exist");
        if predicate(&task) {
            return task;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "task {} did not satisfy predicate within {:?} (status {:?})",
                id, timeout, task.status
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
