//! Pipeline registry: `job_type` tag → handler.
//!
//! Populated once at boot, then shared read-only by every worker.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::context::JobContext;

/// Pipeline-specific code run inside one attempt.
///
/// `run` must call exactly one terminal primitive on the context before
/// returning. Returning `Err` without one fails the attempt at the current
/// stage; returning `Ok` without one fails it with `no_terminal_call`.
#[async_trait]
pub trait Pipeline: Send + Sync {
    fn job_type(&self) -> &str;

    /// Terminal writes fail when their buffered trace entries cannot be
    /// written in the same transaction.
    fn require_trace(&self) -> bool {
        false
    }

    /// Overrides the worker-wide job timeout.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    async fn run(&self, ctx: &JobContext) -> anyhow::Result<()>;
}

/// Closure adapter.
pub struct PipelineFn<F> {
    job_type: String,
    require_trace: bool,
    timeout: Option<Duration>,
    f: F,
}

impl<F, Fut> PipelineFn<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    pub fn new(job_type: impl Into<String>, f: F) -> Self {
        Self {
            job_type: job_type.into(),
            require_trace: false,
            timeout: None,
            f,
        }
    }

    pub fn with_require_trace(mut self, require: bool) -> Self {
        self.require_trace = require;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl<F, Fut> Pipeline for PipelineFn<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    fn job_type(&self) -> &str {
        &self.job_type
    }

    fn require_trace(&self) -> bool {
        self.require_trace
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn run(&self, ctx: &JobContext) -> anyhow::Result<()> {
        (self.f)(ctx.clone()).await
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("pipeline job_type must not be empty")]
    EmptyType,

    #[error("pipeline already registered for job_type `{0}`")]
    Duplicate(String),

    #[error("pipeline registered as `{registered}` reports job_type `{reported}`")]
    TypeMismatch { registered: String, reported: String },
}

#[derive(Default, Clone)]
pub struct PipelineRegistry {
    pipelines: HashMap<String, Arc<dyn Pipeline>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under the pipeline's own tag.
    pub fn register<P>(&mut self, pipeline: P) -> Result<(), RegistryError>
    where
        P: Pipeline + 'static,
    {
        self.register_arc(Arc::new(pipeline))
    }

    pub fn register_arc(&mut self, pipeline: Arc<dyn Pipeline>) -> Result<(), RegistryError> {
        let tag = pipeline.job_type().to_string();
        self.insert(tag, pipeline)
    }

    /// Register under `job_type`, checking it against the pipeline's own tag.
    pub fn register_as<P>(&mut self, job_type: &str, pipeline: P) -> Result<(), RegistryError>
    where
        P: Pipeline + 'static,
    {
        if pipeline.job_type() != job_type {
            return Err(RegistryError::TypeMismatch {
                registered: job_type.to_string(),
                reported: pipeline.job_type().to_string(),
            });
        }
        self.insert(job_type.to_string(), Arc::new(pipeline))
    }

    pub fn register_fn<F, Fut>(&mut self, job_type: &str, f: F) -> Result<(), RegistryError>
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register(PipelineFn::new(job_type, f))
    }

    fn insert(&mut self, tag: String, pipeline: Arc<dyn Pipeline>) -> Result<(), RegistryError> {
        if tag.trim().is_empty() {
            return Err(RegistryError::EmptyType);
        }
        if self.pipelines.contains_key(&tag) {
            return Err(RegistryError::Duplicate(tag));
        }
        self.pipelines.insert(tag, pipeline);
        Ok(())
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn Pipeline>> {
        self.pipelines.get(job_type).cloned()
    }

    /// Sorted.
    pub fn job_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.pipelines.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }
}

impl core::fmt::Debug for PipelineRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PipelineRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}
