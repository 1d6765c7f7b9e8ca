use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::BackendSet;
use crate::scheduler::TaskScheduler;
use crate::scheduler::test_helpers::{
    MockBackend, prompt_item, test_config, wait_for_task_status,
};
use crate::store::{MemoryTaskStore, TaskStore};
use crate::types::{
    BatchTask, BatchTaskConfig, ItemId, ItemStatus, ResultId, TaskId, TaskItem, TaskKind,
    TaskResult, TaskStatus,
};

fn stored_item(id: i64, status: ItemStatus) -> TaskItem {
    TaskItem {
        id: ItemId::new(id),
        prompt: format!("prompt-{id}"),
        source_images: vec![],
        mask: None,
        priority: 0,
        status,
        attempt_count: if status == ItemStatus::Completed { 1 } else { 0 },
        created_at: Utc::now(),
        processed_at: None,
        error: None,
        debug_logs: vec![],
    }
}

fn stored_task(id: i64, status: TaskStatus, items: Vec<TaskItem>) -> BatchTask {
    let mut task = BatchTask {
        id: TaskId::new(id),
        name: format!("stored-{id}"),
        kind: TaskKind::TextToImage,
        status,
        progress: 0,
        total_items: 0,
        completed_items: 0,
        failed_items: 0,
        created_at: Utc::now(),
        started_at: Some(Utc::now()),
        completed_at: None,
        config: BatchTaskConfig {
            model: "mock-model".to_string(),
            model_family: "mock".to_string(),
            retry_attempts: 2,
            ..Default::default()
        },
        items,
        results: vec![],
        error: None,
    };
    task.sync_aggregates();
    task
}

async fn scheduler_over(store: Arc<MemoryTaskStore>) -> TaskScheduler {
    let mut backends = BackendSet::new();
    backends.register("mock", MockBackend::new());
    TaskScheduler::new(store, backends, None).await.unwrap()
}

// --- abnormal-restart recovery ---

#[tokio::test]
async fn processing_task_is_forced_to_failed_on_reload() {
    let store = Arc::new(MemoryTaskStore::new());
    store
        .upsert_task(&stored_task(
            1,
            TaskStatus::Processing,
            vec![
                stored_item(10, ItemStatus::Completed),
                stored_item(11, ItemStatus::Processing),
                stored_item(12, ItemStatus::Pending),
            ],
        ))
        .await
        .unwrap();

    let scheduler = scheduler_over(store.clone()).await;

    let task = scheduler.get_task(TaskId::new(1)).await.unwrap();
    assert_eq!(
        task.status,
        TaskStatus::Failed,
        "a task processing at shutdown is never resumed silently"
    );
    assert!(task.error.as_deref().unwrap().contains("interrupted"));

    let interrupted = task.item(ItemId::new(11)).unwrap();
    assert_eq!(interrupted.status, ItemStatus::Failed);
    assert!(interrupted.error.as_deref().unwrap().contains("interrupted"));
    assert!(
        interrupted.is_resolved(task.config.retry_attempts),
        "an interrupted item is terminal until explicitly retried"
    );

    // untouched siblings keep their states
    assert_eq!(task.item(ItemId::new(10)).unwrap().status, ItemStatus::Completed);
    assert_eq!(task.item(ItemId::new(12)).unwrap().status, ItemStatus::Pending);

    // the forced state is persisted, not just in memory
    let persisted = store.list_tasks().await.unwrap();
    assert_eq!(persisted[0].status, TaskStatus::Failed);
}

#[tokio::test]
async fn pending_and_paused_tasks_reload_untouched() {
    let store = Arc::new(MemoryTaskStore::new());
    store
        .upsert_task(&stored_task(
            1,
            TaskStatus::Pending,
            vec![stored_item(10, ItemStatus::Pending)],
        ))
        .await
        .unwrap();
    store
        .upsert_task(&stored_task(
            2,
            TaskStatus::Paused,
            vec![stored_item(20, ItemStatus::Pending)],
        ))
        .await
        .unwrap();

    let scheduler = scheduler_over(store).await;

    assert_eq!(
        scheduler.get_task(TaskId::new(1)).await.unwrap().status,
        TaskStatus::Pending
    );
    assert_eq!(
        scheduler.get_task(TaskId::new(2)).await.unwrap().status,
        TaskStatus::Paused
    );
}

#[tokio::test]
async fn reloaded_pending_task_can_run() {
    let store = Arc::new(MemoryTaskStore::new());
    store
        .upsert_task(&stored_task(
            1,
            TaskStatus::Pending,
            vec![stored_item(10, ItemStatus::Pending)],
        ))
        .await
        .unwrap();

    let scheduler = scheduler_over(store).await;
    scheduler.start_task(TaskId::new(1)).await.unwrap();

    let task = wait_for_task_status(
        &scheduler,
        TaskId::new(1),
        TaskStatus::Completed,
        Duration::from_secs(2),
    )
    .await;
    assert_eq!(task.completed_items, 1);
}

#[tokio::test]
async fn interrupted_items_can_be_retried_explicitly() {
    let store = Arc::new(MemoryTaskStore::new());
    store
        .upsert_task(&stored_task(
            1,
            TaskStatus::Processing,
            vec![stored_item(10, ItemStatus::Processing)],
        ))
        .await
        .unwrap();

    let scheduler = scheduler_over(store).await;
    assert_eq!(
        scheduler.get_task(TaskId::new(1)).await.unwrap().status,
        TaskStatus::Failed
    );

    scheduler.retry_failed_items(TaskId::new(1)).await.unwrap();
    let task = wait_for_task_status(
        &scheduler,
        TaskId::new(1),
        TaskStatus::Completed,
        Duration::from_secs(2),
    )
    .await;
    assert_eq!(task.completed_items, 1);
    assert!(task.error.is_none(), "retry clears the interrupted error");
}

// --- id allocation resumes above persisted ids ---

#[tokio::test]
async fn new_ids_never_collide_with_persisted_ones() {
    let store = Arc::new(MemoryTaskStore::new());
    let mut task = stored_task(41, TaskStatus::Completed, vec![stored_item(4100, ItemStatus::Completed)]);
    task.results.push(TaskResult {
        id: ResultId::new(7700),
        item_id: ItemId::new(4100),
        image_ref: "https://img.test/old.png".to_string(),
        downloaded: false,
        local_path: None,
        created_at: Utc::now(),
        duration: None,
    });
    store.upsert_task(&task).await.unwrap();

    let scheduler = scheduler_over(store).await;
    let id = scheduler
        .create_task("new", vec![prompt_item("p")], test_config(), TaskKind::TextToImage)
        .await
        .unwrap();

    assert!(id.get() > 41, "task ids continue above the persisted maximum");
    let created = scheduler.get_task(id).await.unwrap();
    assert!(created.items[0].id.get() > 4100);
}
