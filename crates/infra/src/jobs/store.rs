//! Job store abstraction and in-memory implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use stagehand_core::{
    ClaimPolicy, Clock, DomainError, EntityKey, Job, JobId, JobPatch, JobStatus, NewJob, OwnerId,
    SystemClock, TraceEntry, WriteGuard,
};

pub type StoreResult<T> = Result<T, StoreError>;

/// Store error, classified so callers know whether to retry.
///
/// The store itself never retries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Serialisation failure, deadlock, lost connection. Safe to retry.
    #[error("transient storage error: {0}")]
    Transient(String),
    #[error("job not found: {0}")]
    NotFound(JobId),
    /// Required field missing or constraint violated.
    #[error("invariant violated: {0}")]
    Invariant(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<DomainError> for StoreError {
    fn from(value: DomainError) -> Self {
        StoreError::Invariant(value.to_string())
    }
}

fn poisoned<T>(_: PoisonError<T>) -> StoreError {
    StoreError::Storage("in-memory store lock poisoned".to_string())
}

/// Per-owner counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub queued: u64,
    pub running: u64,
    pub waiting_user: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub canceled: u64,
    /// `failed` rows that will never be claimed again.
    pub exhausted: u64,
}

impl JobStats {
    pub(crate) fn count(&mut self, status: JobStatus, n: u64) {
        match status {
            JobStatus::Queued => self.queued += n,
            JobStatus::Running => self.running += n,
            JobStatus::WaitingUser => self.waiting_user += n,
            JobStatus::Succeeded => self.succeeded += n,
            JobStatus::Failed => self.failed += n,
            JobStatus::Canceled => self.canceled += n,
        }
    }
}

/// Transactional persistence of job rows.
///
/// Every write bumps `updated_at`. Soft-deleted rows are invisible to every
/// operation: they are never claimed, returned or updated.
#[async_trait]
pub trait JobStore: Send + Sync + core::fmt::Debug {
    /// Current instant as seen by this store (used for every timestamp it writes).
    fn now(&self) -> DateTime<Utc>;

    /// Underlying Postgres pool, when the store has one.
    fn pool(&self) -> Option<&PgPool> {
        None
    }

    /// Insert a new `queued` row. Never deduplicates.
    async fn enqueue(&self, new: NewJob) -> StoreResult<Job>;

    /// Atomically claim the oldest eligible row, or `None`.
    ///
    /// The claimed row is `running` with `attempts + 1` and both lease
    /// timestamps set to the claim instant.
    async fn claim_next_runnable(&self, policy: &ClaimPolicy) -> StoreResult<Option<Job>>;

    /// Conditional partial update.
    ///
    /// Returns `Ok(None)` when the guard rejects the write, `NotFound` when
    /// the row does not exist.
    async fn update_fields_guarded(
        &self,
        id: JobId,
        guard: &WriteGuard,
        patch: &JobPatch,
    ) -> StoreResult<Option<Job>>;

    /// Guarded update plus trace append in one transaction. Traces are only
    /// written when the update applies.
    async fn update_with_traces(
        &self,
        id: JobId,
        guard: &WriteGuard,
        patch: &JobPatch,
        traces: &[TraceEntry],
    ) -> StoreResult<Option<Job>>;

    /// Refresh `heartbeat_at` while the row is `running` (and, when given,
    /// still at `attempt`). Returns whether the heartbeat landed.
    async fn heartbeat_lease(&self, id: JobId, attempt: Option<u32>) -> StoreResult<bool>;

    async fn get_by_ids(&self, ids: &[JobId]) -> StoreResult<Vec<Job>>;

    /// Most recently created row for the entity key.
    async fn get_latest_by_entity(&self, key: &EntityKey) -> StoreResult<Option<Job>>;

    /// Oldest first; `status = None` lists every status.
    async fn list_by_status(
        &self,
        owner: OwnerId,
        status: Option<JobStatus>,
        limit: usize,
    ) -> StoreResult<Vec<Job>>;

    async fn stats(&self, owner: OwnerId, policy: &ClaimPolicy) -> StoreResult<JobStats>;

    async fn append_traces(&self, traces: &[TraceEntry]) -> StoreResult<()>;

    /// Trace entries of a job in recording order.
    async fn list_traces(&self, job_id: JobId) -> StoreResult<Vec<TraceEntry>>;

    /// Soft-delete every row of `owner`. Returns the number of rows touched.
    async fn soft_delete_owner(&self, owner: OwnerId) -> StoreResult<u64>;

    /// Unconditional partial update.
    async fn update_fields(&self, id: JobId, patch: &JobPatch) -> StoreResult<Job> {
        self.update_fields_guarded(id, &WriteGuard::none(), patch)
            .await?
            .ok_or(StoreError::NotFound(id))
    }

    /// No-op (`Ok(None)`) when the current status is in `forbidden`.
    async fn update_fields_unless_status(
        &self,
        id: JobId,
        forbidden: &[JobStatus],
        patch: &JobPatch,
    ) -> StoreResult<Option<Job>> {
        self.update_fields_guarded(id, &WriteGuard::unless(forbidden), patch)
            .await
    }

    /// `heartbeat_at := now` only while `running`.
    async fn heartbeat(&self, id: JobId) -> StoreResult<bool> {
        self.heartbeat_lease(id, None).await
    }

    async fn get(&self, id: JobId) -> StoreResult<Option<Job>> {
        Ok(self.get_by_ids(&[id]).await?.into_iter().next())
    }

    /// Return the latest active row for the same entity key, or enqueue a
    /// fresh one. The boolean is `true` when a row was inserted.
    ///
    /// Check-then-insert: two concurrent callers may both insert.
    async fn enqueue_unless_active(&self, new: NewJob) -> StoreResult<(Job, bool)> {
        if let Some(existing) = self.get_latest_by_entity(&new.entity_key()).await? {
            if existing.status.is_active() {
                return Ok((existing, false));
            }
        }
        Ok((self.enqueue(new).await?, true))
    }
}

/// In-memory job store for tests/dev.
///
/// A single write lock over the job map plays the role of the row lock, so
/// claims are trivially mutually exclusive.
#[derive(Debug)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    traces: RwLock<Vec<TraceEntry>>,
    clock: Arc<dyn Clock>,
    reject_traces: AtomicBool,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            traces: RwLock::new(Vec::new()),
            clock,
            reject_traces: AtomicBool::new(false),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make every subsequent trace write fail (exercises `require_trace`).
    pub fn reject_trace_writes(&self, reject: bool) {
        self.reject_traces.store(reject, Ordering::SeqCst);
    }

    /// Overwrite a row verbatim. For simulating crashes and external writers.
    pub fn put(&self, job: Job) -> StoreResult<()> {
        self.jobs.write().map_err(poisoned)?.insert(job.id, job);
        Ok(())
    }

    fn check_traces(&self, traces: &[TraceEntry]) -> StoreResult<()> {
        if self.reject_traces.load(Ordering::SeqCst) {
            return Err(StoreError::Storage("trace writes rejected".to_string()));
        }
        for trace in traces {
            trace.validate()?;
        }
        Ok(())
    }

    fn apply_guarded(
        jobs: &mut HashMap<JobId, Job>,
        id: JobId,
        guard: &WriteGuard,
        patch: &JobPatch,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Job>> {
        let job = jobs
            .get_mut(&id)
            .filter(|j| !j.is_deleted())
            .ok_or(StoreError::NotFound(id))?;
        if !guard.permits(job) {
            return Ok(None);
        }
        job.apply(patch, now);
        Ok(Some(job.clone()))
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn enqueue(&self, new: NewJob) -> StoreResult<Job> {
        let job = new.into_job(JobId::new(), self.now())?;
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn claim_next_runnable(&self, policy: &ClaimPolicy) -> StoreResult<Option<Job>> {
        let now = self.now();
        let mut jobs = self.jobs.write().map_err(poisoned)?;

        let next = jobs
            .values()
            .filter(|j| policy.is_eligible(j, now))
            .min_by_key(|j| (j.created_at, j.id))
            .map(|j| j.id);

        Ok(next.and_then(|id| jobs.get_mut(&id)).map(|job| {
            job.status = JobStatus::Running;
            job.attempts += 1;
            job.locked_at = Some(now);
            job.heartbeat_at = Some(now);
            job.updated_at = now;
            job.clone()
        }))
    }

    async fn update_fields_guarded(
        &self,
        id: JobId,
        guard: &WriteGuard,
        patch: &JobPatch,
    ) -> StoreResult<Option<Job>> {
        let now = self.now();
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        Self::apply_guarded(&mut jobs, id, guard, patch, now)
    }

    async fn update_with_traces(
        &self,
        id: JobId,
        guard: &WriteGuard,
        patch: &JobPatch,
        traces: &[TraceEntry],
    ) -> StoreResult<Option<Job>> {
        let now = self.now();
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let mut stored = self.traces.write().map_err(poisoned)?;

        let current = jobs
            .get(&id)
            .filter(|j| !j.is_deleted())
            .ok_or(StoreError::NotFound(id))?;
        if !guard.permits(current) {
            return Ok(None);
        }
        // Both locks are held: a rejected trace leaves the row untouched.
        self.check_traces(traces)?;
        let updated = Self::apply_guarded(&mut jobs, id, guard, patch, now)?;
        stored.extend_from_slice(traces);
        Ok(updated)
    }

    async fn heartbeat_lease(&self, id: JobId, attempt: Option<u32>) -> StoreResult<bool> {
        let now = self.now();
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let Some(job) = jobs.get_mut(&id).filter(|j| !j.is_deleted()) else {
            return Ok(false);
        };
        if job.status != JobStatus::Running || attempt.is_some_and(|a| a != job.attempts) {
            return Ok(false);
        }
        job.heartbeat_at = Some(now);
        job.updated_at = now;
        Ok(true)
    }

    async fn get_by_ids(&self, ids: &[JobId]) -> StoreResult<Vec<Job>> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        Ok(ids
            .iter()
            .filter_map(|id| jobs.get(id))
            .filter(|j| !j.is_deleted())
            .cloned()
            .collect())
    }

    async fn get_latest_by_entity(&self, key: &EntityKey) -> StoreResult<Option<Job>> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        Ok(jobs
            .values()
            .filter(|j| !j.is_deleted() && &j.entity_key() == key)
            .max_by_key(|j| (j.created_at, j.id))
            .cloned())
    }

    async fn list_by_status(
        &self,
        owner: OwnerId,
        status: Option<JobStatus>,
        limit: usize,
    ) -> StoreResult<Vec<Job>> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| {
                j.owner_user_id == owner
                    && !j.is_deleted()
                    && status.is_none_or(|s| j.status == s)
            })
            .cloned()
            .collect();

        result.sort_by_key(|j| (j.created_at, j.id));
        result.truncate(limit);
        Ok(result)
    }

    async fn stats(&self, owner: OwnerId, policy: &ClaimPolicy) -> StoreResult<JobStats> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut stats = JobStats::default();
        for job in jobs
            .values()
            .filter(|j| j.owner_user_id == owner && !j.is_deleted())
        {
            stats.count(job.status, 1);
            if policy.is_exhausted(job) {
                stats.exhausted += 1;
            }
        }
        Ok(stats)
    }

    async fn append_traces(&self, traces: &[TraceEntry]) -> StoreResult<()> {
        self.check_traces(traces)?;
        self.traces
            .write()
            .map_err(poisoned)?
            .extend_from_slice(traces);
        Ok(())
    }

    async fn list_traces(&self, job_id: JobId) -> StoreResult<Vec<TraceEntry>> {
        let traces = self.traces.read().map_err(poisoned)?;
        Ok(traces
            .iter()
            .filter(|t| t.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn soft_delete_owner(&self, owner: OwnerId) -> StoreResult<u64> {
        let now = self.now();
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let mut touched = 0;
        for job in jobs
            .values_mut()
            .filter(|j| j.owner_user_id == owner && !j.is_deleted())
        {
            job.deleted_at = Some(now);
            job.updated_at = now;
            touched += 1;
        }
        Ok(touched)
    }
}
