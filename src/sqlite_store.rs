//! SQLite-backed task store
//!
//! Persists each [`BatchTask`](crate::types::BatchTask) as one row: scalar
//! columns for the fields worth querying, JSON columns for the config, item,
//! and result collections. Aggregate-granularity writes keep the store honest
//! about the last-write-wins contract in [`TaskStore`].

use async_trait::async_trait;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool};
use std::path::Path;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::store::TaskStore;
use crate::types::{BatchTask, TaskId, TaskKind, TaskStatus};

/// SQLite-backed implementation of [`TaskStore`]
#[derive(Clone)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    /// Open (or create) the task database at the given path
    pub async fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::Store(format!("Failed to create database directory: {}", e))
            })?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(|e| Error::Store(format!("Failed to parse database path: {}", e)))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePool::connect_with(options)
            .await
            .map_err(|e| Error::Store(format!("Failed to connect to database: {}", e)))?;

        let store = Self { pool };
        store.init_schema().await?;

        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS batch_tasks (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                kind INTEGER NOT NULL,
                status INTEGER NOT NULL,
                progress INTEGER NOT NULL,
                total_items INTEGER NOT NULL,
                completed_items INTEGER NOT NULL,
                failed_items INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                config_json TEXT NOT NULL,
                items_json TEXT NOT NULL,
                results_json TEXT NOT NULL,
                error_text TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Close the connection pool
    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn kind_to_i32(kind: TaskKind) -> i32 {
        match kind {
            TaskKind::TextToImage => 0,
            TaskKind::ImageToImage => 1,
            TaskKind::Mixed => 2,
        }
    }

    fn kind_from_i32(kind: i32) -> TaskKind {
        match kind {
            1 => TaskKind::ImageToImage,
            2 => TaskKind::Mixed,
            _ => TaskKind::TextToImage,
        }
    }

    fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> Result<BatchTask> {
        let config_json: String = row.try_get("config_json")?;
        let items_json: String = row.try_get("items_json")?;
        let results_json: String = row.try_get("results_json")?;

        let created_at: String = row.try_get("created_at")?;
        let started_at: Option<String> = row.try_get("started_at")?;
        let completed_at: Option<String> = row.try_get("completed_at")?;

        let parse_ts = |s: &str| {
            chrono::DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&chrono::Utc))
                .map_err(|e| Error::Store(format!("invalid timestamp {}: {}", s, e)))
        };

        Ok(BatchTask {
            id: TaskId::new(row.try_get("id")?),
            name: row.try_get("name")?,
            kind: Self::kind_from_i32(row.try_get("kind")?),
            status: TaskStatus::from_i32(row.try_get("status")?),
            progress: row.try_get::<i64, _>("progress")? as u8,
            total_items: row.try_get::<i64, _>("total_items")? as usize,
            completed_items: row.try_get::<i64, _>("completed_items")? as usize,
            failed_items: row.try_get::<i64, _>("failed_items")? as usize,
            created_at: parse_ts(&created_at)?,
            started_at: started_at.as_deref().map(parse_ts).transpose()?,
            completed_at: completed_at.as_deref().map(parse_ts).transpose()?,
            config: serde_json::from_str(&config_json)?,
            items: serde_json::from_str(&items_json)?,
            results: serde_json::from_str(&results_json)?,
            error: row.try_get("error_text")?,
        })
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn list_tasks(&self) -> Result<Vec<BatchTask>> {
        let rows = sqlx::query("SELECT * FROM batch_tasks ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_task).collect()
    }

    async fn upsert_task(&self, task: &BatchTask) -> Result<()> {
        let config_json = serde_json::to_string(&task.config)?;
        let items_json = serde_json::to_string(&task.items)?;
        let results_json = serde_json::to_string(&task.results)?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO batch_tasks
            (id, name, kind, status, progress, total_items, completed_items, failed_items,
             created_at, started_at, completed_at, config_json, items_json, results_json, error_text)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(task.id.get())
        .bind(&task.name)
        .bind(Self::kind_to_i32(task.kind))
        .bind(task.status.to_i32())
        .bind(task.progress as i64)
        .bind(task.total_items as i64)
        .bind(task.completed_items as i64)
        .bind(task.failed_items as i64)
        .bind(task.created_at.to_rfc3339())
        .bind(task.started_at.map(|t| t.to_rfc3339()))
        .bind(task.completed_at.map(|t| t.to_rfc3339()))
        .bind(config_json)
        .bind(items_json)
        .bind(results_json)
        .bind(&task.error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_task(&self, id: TaskId) -> Result<()> {
        sqlx::query("DELETE FROM batch_tasks WHERE id = ?")
            .bind(id.get())
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        BatchTaskConfig, ItemId, ItemStatus, ResultId, TaskItem, TaskResult,
    };
    use chrono::Utc;

    async fn open_store() -> (SqliteTaskStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteTaskStore::new(&dir.path().join("tasks.db"))
            .await
            .unwrap();
        (store, dir)
    }

    fn sample_task(id: i64) -> BatchTask {
        let item = TaskItem {
            id: ItemId::new(id * 100),
            prompt: "a red bicycle on a cobblestone street".to_string(),
            source_images: vec![],
            mask: None,
            priority: 0,
            status: ItemStatus::Completed,
            attempt_count: 1,
            created_at: Utc::now(),
            processed_at: Some(Utc::now()),
            error: None,
            debug_logs: vec![],
        };
        let result = TaskResult {
            id: ResultId::new(id * 100),
            item_id: item.id,
            image_ref: "https://example.com/out.png".to_string(),
            downloaded: false,
            local_path: None,
            created_at: Utc::now(),
            duration: Some(std::time::Duration::from_millis(1234)),
        };
        let mut task = BatchTask {
            id: TaskId::new(id),
            name: format!("batch-{id}"),
            kind: TaskKind::TextToImage,
            status: TaskStatus::Completed,
            progress: 0,
            total_items: 0,
            completed_items: 0,
            failed_items: 0,
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            completed_at: Some(Utc::now()),
            config: BatchTaskConfig {
                model: "img-3".to_string(),
                model_family: "generic".to_string(),
                ..Default::default()
            },
            items: vec![item],
            results: vec![result],
            error: None,
        };
        task.sync_aggregates();
        task
    }

    #[tokio::test]
    async fn upsert_and_list_round_trip_preserves_aggregate() {
        let (store, _dir) = open_store().await;
        let task = sample_task(1);
        store.upsert_task(&task).await.unwrap();

        let tasks = store.list_tasks().await.unwrap();
        assert_eq!(tasks.len(), 1);

        let loaded = &tasks[0];
        assert_eq!(loaded.id, task.id);
        assert_eq!(loaded.name, task.name);
        assert_eq!(loaded.status, TaskStatus::Completed);
        assert_eq!(loaded.items.len(), 1);
        assert_eq!(loaded.items[0].prompt, task.items[0].prompt);
        assert_eq!(loaded.results.len(), 1);
        assert_eq!(
            loaded.results[0].duration,
            Some(std::time::Duration::from_millis(1234))
        );
        assert_eq!(loaded.config.model, "img-3");
    }

    #[tokio::test]
    async fn upsert_replaces_row() {
        let (store, _dir) = open_store().await;
        let mut task = sample_task(1);
        store.upsert_task(&task).await.unwrap();

        task.results[0].downloaded = true;
        task.results[0].local_path = Some("/tmp/out.png".into());
        store.upsert_task(&task).await.unwrap();

        let tasks = store.list_tasks().await.unwrap();
        assert_eq!(tasks.len(), 1, "upsert must replace, not duplicate");
        assert!(tasks[0].results[0].downloaded);
    }

    #[tokio::test]
    async fn delete_removes_row() {
        let (store, _dir) = open_store().await;
        store.upsert_task(&sample_task(1)).await.unwrap();
        store.upsert_task(&sample_task(2)).await.unwrap();

        store.delete_task(TaskId::new(1)).await.unwrap();

        let tasks = store.list_tasks().await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, TaskId::new(2));
    }

    #[tokio::test]
    async fn list_orders_by_id() {
        let (store, _dir) = open_store().await;
        store.upsert_task(&sample_task(3)).await.unwrap();
        store.upsert_task(&sample_task(1)).await.unwrap();
        store.upsert_task(&sample_task(2)).await.unwrap();

        let ids: Vec<i64> = store
            .list_tasks()
            .await
            .unwrap()
            .iter()
            .map(|t| t.id.get())
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
