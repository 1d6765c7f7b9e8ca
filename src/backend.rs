//! Generation backend abstraction
//!
//! The scheduler never talks to a provider API directly. It talks to a
//! [`GenerationBackend`] trait object resolved once at task-creation time
//! from a [`BackendSet`] keyed by model family. Call sites dispatch
//! uniformly afterwards; there is no per-call branching on model strings.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, TaskError};

/// One generation request, assembled by the scheduler from a task item and
/// its task's config
#[derive(Clone, Debug)]
pub struct GenerationRequest {
    /// Prompt text
    pub prompt: String,

    /// Model identifier (passed through from the task config)
    pub model: String,

    /// Source image references for image-to-image requests
    pub source_images: Vec<String>,

    /// Optional mask reference
    pub mask: Option<String>,

    /// Requested aspect ratio
    pub aspect_ratio: Option<String>,

    /// Requested image size
    pub size: Option<String>,

    /// Requested quality tier
    pub quality: Option<String>,

    /// Per-call timeout the scheduler will enforce around the call
    pub timeout: Option<Duration>,
}

/// Successful output of a generation call
#[derive(Clone, Debug)]
pub struct GenerationOutput {
    /// The produced image reference: an HTTP(S) URL or a `data:` URI
    pub image_ref: String,
}

/// Trait for image generation backends
///
/// Implementations wrap one provider API (or a test double). Failures are
/// reported through [`Error::Generation`](crate::Error::Generation) with a
/// human-readable message and an optional low-level code; the scheduler
/// treats every failure as an ordinary per-item failure.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Perform one generation call
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput>;

    /// Short implementation name for logging
    fn name(&self) -> &str;
}

/// Registry of generation backends keyed by model family
///
/// The scheduler resolves a task's backend here exactly once, at task
/// creation. Registering a family twice replaces the earlier backend.
///
/// # Examples
///
/// ```no_run
/// use imagegen_batch::backend::BackendSet;
/// # fn backends(dalle: std::sync::Arc<dyn imagegen_batch::backend::GenerationBackend>) {
/// let mut backends = BackendSet::new();
/// backends.register("dalle", dalle);
/// assert!(backends.select("dalle").is_ok());
/// assert!(backends.select("unknown").is_err());
/// # }
/// ```
#[derive(Clone, Default)]
pub struct BackendSet {
    backends: HashMap<String, Arc<dyn GenerationBackend>>,
    fallback: Option<Arc<dyn GenerationBackend>>,
}

impl BackendSet {
    /// Create an empty backend set
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend for a model family
    pub fn register(&mut self, family: impl Into<String>, backend: Arc<dyn GenerationBackend>) {
        self.backends.insert(family.into(), backend);
    }

    /// Register a fallback backend used when no family matches
    pub fn register_fallback(&mut self, backend: Arc<dyn GenerationBackend>) {
        self.fallback = Some(backend);
    }

    /// Resolve the backend for a model family
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::UnknownModelFamily`] when the family has no
    /// registered backend and no fallback is configured.
    pub fn select(&self, family: &str) -> Result<Arc<dyn GenerationBackend>> {
        self.backends
            .get(family)
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or_else(|| {
                TaskError::UnknownModelFamily {
                    family: family.to_string(),
                }
                .into()
            })
    }

    /// Names of all registered model families
    pub fn families(&self) -> Vec<&str> {
        self.backends.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for BackendSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendSet")
            .field("families", &self.families())
            .field("has_fallback", &self.fallback.is_some())
            .finish()
    }
}
