//! Core types and events for imagegen-batch

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{duration_millis, optional_duration_millis};

/// Unique identifier for a batch task
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub i64);

impl TaskId {
    /// Create a new TaskId
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the inner i64 value
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl From<i64> for TaskId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl From<TaskId> for i64 {
    fn from(id: TaskId) -> Self {
        id.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Unique identifier for a task item within a batch task
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub i64);

impl ItemId {
    /// Create a new ItemId
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the inner i64 value
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a task result
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultId(pub i64);

impl ResultId {
    /// Create a new ResultId
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the inner i64 value
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for ResultId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a download job
///
/// A download job mirrors the [`ResultId`] of the task result it persists,
/// so converting between the two is lossless in both directions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl JobId {
    /// Create a new JobId
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the inner i64 value
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl From<ResultId> for JobId {
    fn from(id: ResultId) -> Self {
        Self(id.0)
    }
}

impl From<JobId> for ResultId {
    fn from(id: JobId) -> Self {
        Self(id.0)
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Batch task status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Created but not yet started
    Pending,
    /// Execution loop is running
    Processing,
    /// Paused by user
    Paused,
    /// All items resolved, at least one succeeded
    Completed,
    /// All items resolved, none succeeded
    Failed,
    /// Stopped by user
    Cancelled,
}

impl TaskStatus {
    /// Convert integer status code to TaskStatus enum
    pub fn from_i32(status: i32) -> Self {
        match status {
            0 => TaskStatus::Pending,
            1 => TaskStatus::Processing,
            2 => TaskStatus::Paused,
            3 => TaskStatus::Completed,
            4 => TaskStatus::Failed,
            5 => TaskStatus::Cancelled,
            _ => TaskStatus::Failed, // Default to Failed for unknown status
        }
    }

    /// Convert TaskStatus enum to integer status code
    pub fn to_i32(&self) -> i32 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Processing => 1,
            TaskStatus::Paused => 2,
            TaskStatus::Completed => 3,
            TaskStatus::Failed => 4,
            TaskStatus::Cancelled => 5,
        }
    }

    /// True for Completed, Failed, and Cancelled
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Task item status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    /// Waiting for a free concurrency slot
    Pending,
    /// Generation call in flight
    Processing,
    /// Produced a result
    Completed,
    /// Last attempt failed (terminal once attempts are exhausted)
    Failed,
    /// Removed from the loop by an explicit stop
    Cancelled,
}

impl ItemStatus {
    /// Convert integer status code to ItemStatus enum
    pub fn from_i32(status: i32) -> Self {
        match status {
            0 => ItemStatus::Pending,
            1 => ItemStatus::Processing,
            2 => ItemStatus::Completed,
            3 => ItemStatus::Failed,
            4 => ItemStatus::Cancelled,
            _ => ItemStatus::Failed,
        }
    }

    /// Convert ItemStatus enum to integer status code
    pub fn to_i32(&self) -> i32 {
        match self {
            ItemStatus::Pending => 0,
            ItemStatus::Processing => 1,
            ItemStatus::Completed => 2,
            ItemStatus::Failed => 3,
            ItemStatus::Cancelled => 4,
        }
    }
}

/// What kind of generation requests a batch task carries
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Prompt-only requests
    #[default]
    TextToImage,
    /// Requests that transform one or more source images
    ImageToImage,
    /// Both in one task
    Mixed,
}

/// Immutable per-task settings
///
/// Fixed at task creation; retrying a task reuses the same config.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchTaskConfig {
    /// Model identifier passed through to the generation backend
    pub model: String,

    /// Model family used to select a [`GenerationBackend`](crate::backend::GenerationBackend)
    /// at task creation time
    pub model_family: String,

    /// Maximum number of generation calls in flight at once (must be ≥ 1)
    #[serde(default = "default_concurrent_limit")]
    pub concurrent_limit: usize,

    /// Number of automatic retries per item after the initial attempt
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Fixed delay before a failed item re-enters the pending pool
    #[serde(default = "default_retry_delay", with = "duration_millis")]
    pub retry_delay: Duration,

    /// Hand successful results to the download queue automatically
    #[serde(default = "default_true")]
    pub auto_download: bool,

    /// Requested aspect ratio (backend-specific, passed through)
    #[serde(default)]
    pub aspect_ratio: Option<String>,

    /// Requested image size (backend-specific, passed through)
    #[serde(default)]
    pub size: Option<String>,

    /// Requested quality tier (backend-specific, passed through)
    #[serde(default)]
    pub quality: Option<String>,

    /// Number of task items created per submitted prompt (default: 1)
    #[serde(default)]
    pub generate_count: Option<u32>,

    /// Per-call timeout for the generation backend (None = backend default)
    #[serde(default, with = "optional_duration_millis")]
    pub api_timeout: Option<Duration>,
}

impl Default for BatchTaskConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            model_family: String::new(),
            concurrent_limit: default_concurrent_limit(),
            retry_attempts: default_retry_attempts(),
            retry_delay: default_retry_delay(),
            auto_download: true,
            aspect_ratio: None,
            size: None,
            quality: None,
            generate_count: None,
            api_timeout: None,
        }
    }
}

fn default_concurrent_limit() -> usize {
    2
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay() -> Duration {
    Duration::from_millis(1000)
}

fn default_true() -> bool {
    true
}

/// Input for one generation request when creating a batch task
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NewTaskItem {
    /// Prompt text
    pub prompt: String,

    /// Source image references for image-to-image requests
    #[serde(default)]
    pub source_images: Vec<String>,

    /// Optional mask reference
    #[serde(default)]
    pub mask: Option<String>,
}

/// One unit of scheduled work within a batch task
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskItem {
    /// Item identifier, unique within the scheduler
    pub id: ItemId,

    /// Prompt text
    pub prompt: String,

    /// Source image references (empty for text-to-image)
    #[serde(default)]
    pub source_images: Vec<String>,

    /// Optional mask reference
    #[serde(default)]
    pub mask: Option<String>,

    /// Static priority (reserved; scheduling is FIFO in insertion order)
    #[serde(default)]
    pub priority: i32,

    /// Current lifecycle state
    pub status: ItemStatus,

    /// Number of generation attempts dispatched so far
    pub attempt_count: u32,

    /// When the item was created
    pub created_at: DateTime<Utc>,

    /// When the item last resolved (success or failure)
    pub processed_at: Option<DateTime<Utc>>,

    /// Human-readable error from the most recent failed attempt
    pub error: Option<String>,

    /// Request/response/error records for debugging
    #[serde(default)]
    pub debug_logs: Vec<DebugLogEntry>,
}

impl TaskItem {
    /// True once the item can no longer produce further state changes
    /// under the given retry budget.
    pub fn is_resolved(&self, retry_attempts: u32) -> bool {
        match self.status {
            ItemStatus::Completed | ItemStatus::Cancelled => true,
            ItemStatus::Failed => self.attempt_count >= retry_attempts + 1,
            ItemStatus::Pending | ItemStatus::Processing => false,
        }
    }
}

/// One debug-log record attached to a task item
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DebugLogEntry {
    /// When the record was written
    pub timestamp: DateTime<Utc>,

    /// Wall time of the call the record describes, if it has one
    #[serde(default, with = "optional_duration_millis")]
    pub duration: Option<Duration>,

    /// The typed payload
    pub payload: DebugPayload,
}

/// Typed debug-log payload
///
/// Each kind has its own well-defined shape; there is no untyped
/// catch-all variant.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DebugPayload {
    /// A generation request was dispatched
    Request {
        /// Model identifier the request was sent to
        model: String,
        /// Attempt number (1-based)
        attempt: u32,
    },
    /// The backend returned an image reference
    Response {
        /// The produced image reference
        image_ref: String,
    },
    /// The backend call failed
    Error {
        /// Human-readable failure message
        message: String,
        /// Optional low-level code from the backend
        code: Option<String>,
    },
}

/// The artifact produced by a successfully completed task item
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskResult {
    /// Result identifier (download jobs mirror this id)
    pub id: ResultId,

    /// The task item that produced this result
    pub item_id: ItemId,

    /// Image reference: an HTTP(S) URL or a `data:` URI
    pub image_ref: String,

    /// True once the download queue has persisted the artifact
    pub downloaded: bool,

    /// Local path the artifact was saved to
    pub local_path: Option<PathBuf>,

    /// When the result was recorded
    pub created_at: DateTime<Utc>,

    /// Wall time of the generation call
    #[serde(default, with = "optional_duration_millis")]
    pub duration: Option<Duration>,
}

/// A named collection of generation requests executed under one
/// concurrency/retry policy
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchTask {
    /// Task identifier
    pub id: TaskId,

    /// User-supplied task name
    pub name: String,

    /// What kind of requests the task carries
    pub kind: TaskKind,

    /// Current lifecycle state (transitions only via the scheduler)
    pub status: TaskStatus,

    /// Derived progress percentage, `round(100 * (completed + failed) / total)`
    pub progress: u8,

    /// Total number of task items
    pub total_items: usize,

    /// Number of items in Completed state
    pub completed_items: usize,

    /// Number of items in Failed state
    pub failed_items: usize,

    /// When the task was created
    pub created_at: DateTime<Utc>,

    /// When the task was first started
    pub started_at: Option<DateTime<Utc>>,

    /// When the task reached a terminal state
    pub completed_at: Option<DateTime<Utc>>,

    /// Immutable per-task settings
    pub config: BatchTaskConfig,

    /// Ordered task items (exclusively owned by this task)
    pub items: Vec<TaskItem>,

    /// Ordered results, in completion order
    pub results: Vec<TaskResult>,

    /// Top-level error, set when the task as a whole fails
    pub error: Option<String>,
}

impl BatchTask {
    /// Recompute the derived aggregate fields from item states.
    ///
    /// Counts and progress are never mutated directly anywhere else, which
    /// keeps `completed + failed <= total` and the progress formula true at
    /// every observation point.
    pub fn sync_aggregates(&mut self) {
        self.total_items = self.items.len();
        self.completed_items = self
            .items
            .iter()
            .filter(|i| i.status == ItemStatus::Completed)
            .count();
        self.failed_items = self
            .items
            .iter()
            .filter(|i| i.status == ItemStatus::Failed)
            .count();
        self.progress = if self.total_items == 0 {
            0
        } else {
            let resolved = (self.completed_items + self.failed_items) as f64;
            (100.0 * resolved / self.total_items as f64).round() as u8
        };
    }

    /// Number of items currently in Processing state
    pub fn processing_count(&self) -> usize {
        self.items
            .iter()
            .filter(|i| i.status == ItemStatus::Processing)
            .count()
    }

    /// Look up an item by id
    pub fn item(&self, item_id: ItemId) -> Option<&TaskItem> {
        self.items.iter().find(|i| i.id == item_id)
    }

    /// Look up an item by id, mutably
    pub fn item_mut(&mut self, item_id: ItemId) -> Option<&mut TaskItem> {
        self.items.iter_mut().find(|i| i.id == item_id)
    }

    /// Look up a result by id
    pub fn result(&self, result_id: ResultId) -> Option<&TaskResult> {
        self.results.iter().find(|r| r.id == result_id)
    }

    /// Look up a result by id, mutably
    pub fn result_mut(&mut self, result_id: ResultId) -> Option<&mut TaskResult> {
        self.results.iter_mut().find(|r| r.id == result_id)
    }
}

/// Download job status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting in the FIFO queue
    Queued,
    /// Transfer in progress
    Fetching,
    /// Artifact persisted
    Complete,
    /// Attempts exhausted
    Failed,
}

/// A queued request to persist a task result's artifact
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadJob {
    /// Job identifier (mirrors the originating [`ResultId`])
    pub id: JobId,

    /// Task the originating result belongs to
    pub task_id: TaskId,

    /// Artifact source: HTTP(S) URL or `data:` URI
    pub source: String,

    /// Destination filename, rendered once at enqueue time
    pub filename: String,

    /// Current lifecycle state
    pub status: JobStatus,

    /// Number of fetch attempts exhausted so far
    pub retry_count: u32,

    /// Most recent error, if any
    pub last_error: Option<String>,

    /// In-flight transfer progress, 0.0 to 1.0
    pub fraction: f32,

    /// Instantaneous transfer rate in bytes per second
    pub bytes_per_sec: u64,
}

/// Snapshot of a download job's state, delivered to per-job subscribers
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadJobUpdate {
    /// Job identifier
    pub job_id: JobId,

    /// Current status
    pub status: JobStatus,

    /// Transfer progress, 0.0 to 1.0
    pub fraction: f32,

    /// Instantaneous transfer rate in bytes per second
    pub bytes_per_sec: u64,

    /// Error message, present for failed jobs
    pub error: Option<String>,

    /// Final path, present once the artifact is persisted
    pub local_path: Option<PathBuf>,
}

/// Event emitted during task and download lifecycles
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Batch task created
    TaskQueued {
        /// Task ID
        id: TaskId,
        /// Task name
        name: String,
    },

    /// Batch task started processing
    TaskStarted {
        /// Task ID
        id: TaskId,
    },

    /// Aggregate progress changed
    TaskProgress {
        /// Task ID
        id: TaskId,
        /// Progress percentage (0 to 100)
        progress: u8,
        /// Items completed so far
        completed: usize,
        /// Items failed so far
        failed: usize,
        /// Total items
        total: usize,
    },

    /// A generation call was dispatched for an item
    ItemStarted {
        /// Parent task ID
        task_id: TaskId,
        /// Item ID
        item_id: ItemId,
        /// Attempt number (1-based)
        attempt: u32,
    },

    /// An item produced a result
    ItemCompleted {
        /// Parent task ID
        task_id: TaskId,
        /// Item ID
        item_id: ItemId,
        /// The recorded result
        result_id: ResultId,
    },

    /// An item's generation call failed
    ItemFailed {
        /// Parent task ID
        task_id: TaskId,
        /// Item ID
        item_id: ItemId,
        /// Error message
        error: String,
        /// Whether an automatic retry is scheduled
        will_retry: bool,
    },

    /// Task paused by user
    TaskPaused {
        /// Task ID
        id: TaskId,
    },

    /// Task resumed by user
    TaskResumed {
        /// Task ID
        id: TaskId,
    },

    /// Task finished with at least one success
    TaskCompleted {
        /// Task ID
        id: TaskId,
        /// Items completed
        completed: usize,
        /// Items failed
        failed: usize,
    },

    /// Task finished with no successes
    TaskFailed {
        /// Task ID
        id: TaskId,
        /// Error message
        error: String,
    },

    /// Task stopped by user
    TaskCancelled {
        /// Task ID
        id: TaskId,
    },

    /// Task removed from the scheduler and the store
    TaskRemoved {
        /// Task ID
        id: TaskId,
    },

    /// Download job accepted into the queue
    DownloadQueued {
        /// Job ID
        job_id: JobId,
        /// Rendered destination filename
        filename: String,
    },

    /// Download transfer progress
    DownloadProgress {
        /// Job ID
        job_id: JobId,
        /// Transfer progress, 0.0 to 1.0
        fraction: f32,
        /// Instantaneous rate in bytes per second
        bytes_per_sec: u64,
    },

    /// Download job persisted its artifact
    DownloadComplete {
        /// Job ID
        job_id: JobId,
        /// Final path
        path: PathBuf,
    },

    /// Download job exhausted its attempts
    DownloadFailed {
        /// Job ID
        job_id: JobId,
        /// Error message
        error: String,
    },

    /// Download could not be persisted; observers should offer the source
    /// reference for manual saving
    DownloadFallback {
        /// Job ID
        job_id: JobId,
        /// Original artifact source reference
        source: String,
    },

    /// Graceful shutdown initiated
    Shutdown,
}
