//! # imagegen-batch
//!
//! Embeddable batch image-generation engine: queue many independent
//! generation requests and run them to completion with bounded concurrency,
//! automatic retry, progress reporting, and automatic persistence of the
//! produced artifacts.
//!
//! ## Design Philosophy
//!
//! imagegen-batch is designed to be:
//! - **Provider-agnostic** - Generation backends plug in behind a trait,
//!   selected per task by model family
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding
//! - **Event-driven** - Consumers subscribe to events and per-subject
//!   snapshots, no polling required
//! - **Explicitly constructed** - Every collaborator (backend, task store,
//!   artifact storage) is injected, so test doubles and multiple
//!   independent instances are trivial
//!
//! ## Quick Start
//!
//! ```no_run
//! use imagegen_batch::{
//!     BackendSet, BatchTaskConfig, DownloadConfig, DownloadQueue, FsArtifactStorage,
//!     MemoryTaskStore, NewTaskItem, TaskKind, TaskScheduler,
//! };
//! use std::sync::Arc;
//!
//! # fn my_backend() -> Arc<dyn imagegen_batch::GenerationBackend> { unimplemented!() }
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(MemoryTaskStore::new());
//!
//!     let mut backends = BackendSet::new();
//!     backends.register("dalle", my_backend());
//!
//!     let downloads = DownloadQueue::new(
//!         DownloadConfig::default(),
//!         store.clone(),
//!         Arc::new(FsArtifactStorage::new()),
//!     );
//!     let scheduler = TaskScheduler::new(store, backends, Some(downloads)).await?;
//!
//!     // Subscribe to events
//!     let mut events = scheduler.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let config = BatchTaskConfig {
//!         model: "img-3".to_string(),
//!         model_family: "dalle".to_string(),
//!         concurrent_limit: 2,
//!         ..Default::default()
//!     };
//!     let items = vec![NewTaskItem {
//!         prompt: "a lighthouse at dusk".to_string(),
//!         ..Default::default()
//!     }];
//!
//!     let task_id = scheduler
//!         .create_task("lighthouses", items, config, TaskKind::TextToImage)
//!         .await?;
//!     scheduler.start_task(task_id).await?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Generation backend abstraction
pub mod backend;
/// Notification bus (per-subject snapshot pub/sub)
pub mod bus;
/// Configuration types
pub mod config;
/// Artifact download queue
pub mod download;
/// Error types
pub mod error;
/// Retry logic with exponential backoff
pub mod retry;
/// Task scheduler and execution loop
pub mod scheduler;
/// SQLite-backed task store
pub mod sqlite_store;
/// Artifact storage seam
pub mod storage;
/// Task persistence seam
pub mod store;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use backend::{BackendSet, GenerationBackend, GenerationOutput, GenerationRequest};
pub use bus::{NotificationBus, Subscription};
pub use config::{DownloadConfig, RetryConfig};
pub use download::{DownloadContext, DownloadQueue};
pub use error::{DownloadError, Error, Result, TaskError};
pub use scheduler::{RetryScope, TaskScheduler};
pub use sqlite_store::SqliteTaskStore;
pub use storage::{ArtifactStorage, FsArtifactStorage};
pub use store::{MemoryTaskStore, TaskStore};
pub use types::{
    BatchTask, BatchTaskConfig, DownloadJob, DownloadJobUpdate, Event, ItemId, ItemStatus, JobId,
    JobStatus, NewTaskItem, ResultId, TaskId, TaskItem, TaskKind, TaskResult, TaskStatus,
};
