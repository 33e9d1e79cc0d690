//! Postgres-backed job store.
//!
//! ## Error Mapping
//!
//! SQLx errors are mapped to `StoreError` as follows:
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database | `40001`, `40P01` | `Transient` | Serialisation failure, deadlock |
//! | Io, Tls, PoolTimedOut, PoolClosed | N/A | `Transient` | Lost connection, exhausted pool |
//! | Database | `23502`, `23514`, `22P02` | `Invariant` | NOT NULL / CHECK violation, bad input |
//! | Anything else | Any other | `Storage` | Unexpected backend failure |
//!
//! ## Time
//!
//! Timestamps are taken from the store's `Clock` and bound as parameters
//! rather than read from `now()`, so the eligibility cut-offs and the claim
//! stamp come from the same instant.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{Span, instrument};

use stagehand_core::{
    ClaimPolicy, Clock, DecisionMode, DecisionPhase, EntityKey, Job, JobId, JobPatch, JobStatus,
    NewJob, OwnerId, Payload, SystemClock, TraceEntry, TraceId, WriteGuard,
};

use super::sql::{self, JobRow, TraceRow};
use super::store::{JobStats, JobStore, StoreError, StoreResult};

/// Embedded schema, applied by [`PostgresJobStore::install_schema`].
pub const SCHEMA: &str = include_str!("../../migrations/0001_job_runs.sql");

/// Job store over a shared `PgPool`.
///
/// Concurrent claims rely on `FOR UPDATE SKIP LOCKED`: N workers contend on
/// the same table without serialising on one another.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
    clock: Arc<dyn Clock>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self::with_clock(pool, Arc::new(SystemClock))
    }

    pub fn with_clock(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool: Arc::new(pool),
            clock,
        }
    }

    /// Open a pool against `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create tables and indexes if they do not exist yet.
    #[instrument(skip(self), err)]
    pub async fn install_schema(&self) -> StoreResult<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("install_schema", e))?;
        Ok(())
    }

    pub async fn begin(&self) -> StoreResult<Transaction<'static, Postgres>> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }

    /// Guarded update plus trace append inside a caller transaction.
    ///
    /// Does not commit. `Ok(None)` means the guard rejected the write and no
    /// trace was written; the caller decides whether to roll back.
    #[instrument(
        skip(self, tx, guard, patch, traces),
        fields(job_id = %id, trace_count = traces.len()),
        err
    )]
    pub async fn update_in(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: JobId,
        guard: &WriteGuard,
        patch: &JobPatch,
        traces: &[TraceEntry],
    ) -> StoreResult<Option<Job>> {
        update_in_tx(tx, id, guard, patch, traces, self.now()).await
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn pool(&self) -> Option<&PgPool> {
        Some(&self.pool)
    }

    #[instrument(
        skip(self, new),
        fields(job_type = %new.job_type, owner_user_id = %new.owner_user_id),
        err
    )]
    async fn enqueue(&self, new: NewJob) -> StoreResult<Job> {
        let job = new.into_job(JobId::new(), self.now())?;
        let row = sql::insert(&*self.pool, &job)
            .await
            .map_err(|e| map_sqlx_error("enqueue", e))?;
        job_from_row(row)
    }

    #[instrument(skip(self), fields(job_id = tracing::field::Empty), err)]
    async fn claim_next_runnable(&self, policy: &ClaimPolicy) -> StoreResult<Option<Job>> {
        let now = self.now();
        let mut tx = self.begin().await?;

        let row = sql::claim_next(
            &mut *tx,
            policy.max_attempts,
            policy.retry_cutoff(now),
            policy.stale_cutoff(now),
            now,
        )
        .await
        .map_err(|e| map_sqlx_error("claim_next_runnable", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        let job = row.map(job_from_row).transpose()?;
        if let Some(job) = &job {
            Span::current().record("job_id", tracing::field::display(job.id));
        }
        Ok(job)
    }

    #[instrument(skip(self, guard, patch), fields(job_id = %id), err)]
    async fn update_fields_guarded(
        &self,
        id: JobId,
        guard: &WriteGuard,
        patch: &JobPatch,
    ) -> StoreResult<Option<Job>> {
        let row = sql::update_guarded(&*self.pool, *id.as_uuid(), guard, patch, self.now())
            .await
            .map_err(|e| map_sqlx_error("update_guarded", e))?;

        match row {
            Some(row) => job_from_row(row).map(Some),
            None => {
                let found = sql::exists(&*self.pool, *id.as_uuid())
                    .await
                    .map_err(|e| map_sqlx_error("exists", e))?;
                if found {
                    Ok(None)
                } else {
                    Err(StoreError::NotFound(id))
                }
            }
        }
    }

    async fn update_with_traces(
        &self,
        id: JobId,
        guard: &WriteGuard,
        patch: &JobPatch,
        traces: &[TraceEntry],
    ) -> StoreResult<Option<Job>> {
        let mut tx = self.begin().await?;
        let updated = self.update_in(&mut tx, id, guard, patch, traces).await?;
        if updated.is_some() {
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        } else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
        }
        Ok(updated)
    }

    async fn heartbeat_lease(&self, id: JobId, attempt: Option<u32>) -> StoreResult<bool> {
        sql::heartbeat(&*self.pool, *id.as_uuid(), attempt, self.now())
            .await
            .map_err(|e| map_sqlx_error("heartbeat", e))
    }

    async fn get_by_ids(&self, ids: &[JobId]) -> StoreResult<Vec<Job>> {
        let ids: Vec<uuid::Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();
        sql::get_by_ids(&*self.pool, &ids)
            .await
            .map_err(|e| map_sqlx_error("get_by_ids", e))?
            .into_iter()
            .map(job_from_row)
            .collect()
    }

    async fn get_latest_by_entity(&self, key: &EntityKey) -> StoreResult<Option<Job>> {
        sql::get_latest_by_entity(&*self.pool, key)
            .await
            .map_err(|e| map_sqlx_error("get_latest_by_entity", e))?
            .map(job_from_row)
            .transpose()
    }

    async fn list_by_status(
        &self,
        owner: OwnerId,
        status: Option<JobStatus>,
        limit: usize,
    ) -> StoreResult<Vec<Job>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        sql::list_by_status(&*self.pool, owner, status, limit)
            .await
            .map_err(|e| map_sqlx_error("list_by_status", e))?
            .into_iter()
            .map(job_from_row)
            .collect()
    }

    async fn stats(&self, owner: OwnerId, policy: &ClaimPolicy) -> StoreResult<JobStats> {
        let counts = sql::count_by_status(&*self.pool, owner, policy.max_attempts)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for (status, total, exhausted) in counts {
            let status: JobStatus = status
                .parse()
                .map_err(|e| StoreError::Storage(format!("stats: {e}")))?;
            stats.count(status, total.max(0) as u64);
            stats.exhausted += exhausted.max(0) as u64;
        }
        Ok(stats)
    }

    async fn append_traces(&self, traces: &[TraceEntry]) -> StoreResult<()> {
        if traces.is_empty() {
            return Ok(());
        }
        sql::insert_traces(&*self.pool, traces)
            .await
            .map_err(|e| map_sqlx_error("append_traces", e))?;
        Ok(())
    }

    async fn list_traces(&self, job_id: JobId) -> StoreResult<Vec<TraceEntry>> {
        sql::list_traces(&*self.pool, *job_id.as_uuid())
            .await
            .map_err(|e| map_sqlx_error("list_traces", e))?
            .into_iter()
            .map(trace_from_row)
            .collect()
    }

    #[instrument(skip(self), fields(owner_user_id = %owner), err)]
    async fn soft_delete_owner(&self, owner: OwnerId) -> StoreResult<u64> {
        sql::soft_delete_owner(&*self.pool, owner, self.now())
            .await
            .map_err(|e| map_sqlx_error("soft_delete_owner", e))
    }
}

/// Shared by [`PostgresJobStore::update_in`] and the job context's
/// transactional terminal writes.
pub(crate) async fn update_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    id: JobId,
    guard: &WriteGuard,
    patch: &JobPatch,
    traces: &[TraceEntry],
    now: DateTime<Utc>,
) -> StoreResult<Option<Job>> {
    let row = sql::update_guarded(&mut **tx, *id.as_uuid(), guard, patch, now)
        .await
        .map_err(|e| map_sqlx_error("update_guarded", e))?;

    let Some(row) = row else {
        let found = sql::exists(&mut **tx, *id.as_uuid())
            .await
            .map_err(|e| map_sqlx_error("exists", e))?;
        return if found {
            Ok(None)
        } else {
            Err(StoreError::NotFound(id))
        };
    };

    if !traces.is_empty() {
        sql::insert_traces(&mut **tx, traces)
            .await
            .map_err(|e| map_sqlx_error("insert_traces", e))?;
    }

    job_from_row(row).map(Some)
}

fn job_from_row(row: JobRow) -> StoreResult<Job> {
    let status = row
        .status
        .parse()
        .map_err(|e| StoreError::Storage(format!("job {}: {e}", row.id)))?;
    let payload = Payload::from_value(row.payload)
        .map_err(|e| StoreError::Storage(format!("job {}: {e}", row.id)))?;

    Ok(Job {
        id: JobId::from_uuid(row.id),
        owner_user_id: OwnerId::from_uuid(row.owner_user_id),
        entity_type: row.entity_type,
        entity_id: row.entity_id,
        job_type: row.job_type,
        status,
        stage: row.stage,
        progress: row.progress.clamp(0, 100) as u8,
        message: row.message,
        attempts: row.attempts.max(0) as u32,
        error: row.error,
        last_error_at: row.last_error_at,
        locked_at: row.locked_at,
        heartbeat_at: row.heartbeat_at,
        payload,
        result: row.result,
        created_at: row.created_at,
        updated_at: row.updated_at,
        deleted_at: row.deleted_at,
    })
}

fn trace_from_row(row: TraceRow) -> StoreResult<TraceEntry> {
    let phase = DecisionPhase::parse(&row.decision_phase)
        .map_err(|e| StoreError::Storage(format!("trace {}: {e}", row.id)))?;
    let mode = DecisionMode::parse(&row.decision_mode)
        .map_err(|e| StoreError::Storage(format!("trace {}: {e}", row.id)))?;

    Ok(TraceEntry {
        id: TraceId::from_uuid(row.id),
        job_id: JobId::from_uuid(row.job_id),
        owner_user_id: OwnerId::from_uuid(row.owner_user_id),
        decision_type: row.decision_type,
        phase,
        mode,
        actor_ids: row.actor_ids,
        inputs: row.inputs,
        chosen: row.chosen,
        graph_version: row.graph_version,
        occurred_at: row.occurred_at,
        created_at: row.created_at,
    })
}

/// Map SQLx errors to `StoreError`.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // serialization_failure, deadlock_detected
                Some("40001") | Some("40P01") => StoreError::Transient(msg),
                // not_null_violation, check_violation, invalid_text_representation
                Some("23502") | Some("23514") | Some("22P02") => StoreError::Invariant(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::Io(e) => StoreError::Transient(format!("io error in {operation}: {e}")),
        sqlx::Error::Tls(e) => StoreError::Transient(format!("tls error in {operation}: {e}")),
        sqlx::Error::PoolTimedOut => {
            StoreError::Transient(format!("connection pool timed out in {operation}"))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Transient(format!("connection pool closed in {operation}"))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_errors_are_transient() {
        assert!(map_sqlx_error("claim", sqlx::Error::PoolTimedOut).is_transient());
        assert!(map_sqlx_error("claim", sqlx::Error::PoolClosed).is_transient());
        assert!(!map_sqlx_error("claim", sqlx::Error::RowNotFound).is_transient());
    }

    #[test]
    fn schema_is_idempotent() {
        for line in SCHEMA.lines().filter(|l| l.starts_with("CREATE")) {
            assert!(line.contains("IF NOT EXISTS"), "not idempotent: {line}");
        }
    }

    /// Requires a reachable Postgres (`DATABASE_URL`).
    mod live {
        use std::collections::HashSet;

        use serde_json::json;
        use stagehand_core::ManualClock;

        use super::*;

        async fn store() -> Option<(Arc<ManualClock>, PostgresJobStore)> {
            let url = std::env::var("DATABASE_URL").ok()?;
            let pool = PgPoolOptions::new()
                .max_connections(8)
                .connect(&url)
                .await
                .ok()?;
            let clock = Arc::new(ManualClock::default());
            let store = PostgresJobStore::with_clock(pool, clock.clone());
            store.install_schema().await.ok()?;
            Some((clock, store))
        }

        fn new_job(owner: OwnerId) -> NewJob {
            NewJob::new(owner, "material_set", Some(uuid::Uuid::now_v7()), "ingest_chunks")
                .with_payload(Payload::default().with("material_set_id", "m-1"))
        }

        #[tokio::test]
        #[ignore = "requires DATABASE_URL"]
        async fn enqueue_claim_and_succeed() {
            let Some((_, store)) = store().await else { return };
            let owner = OwnerId::new();
            let job = store.enqueue(new_job(owner)).await.unwrap();
            assert_eq!(job.status, JobStatus::Queued);
            assert_eq!(job.stage, "ingest");

            // Other tests share the table; claim until ours shows up.
            let policy = ClaimPolicy::default();
            let mut claimed = None;
            while let Some(next) = store.claim_next_runnable(&policy).await.unwrap() {
                if next.id == job.id {
                    claimed = Some(next);
                    break;
                }
            }
            let claimed = claimed.expect("job was claimable");
            assert_eq!(claimed.attempts, 1);

            let done = store
                .update_with_traces(
                    job.id,
                    &WriteGuard::lease(1),
                    &JobPatch::new()
                        .status(JobStatus::Succeeded)
                        .progress(100)
                        .result(json!({"files_processed": 3}))
                        .clear_lease(),
                    &[TraceEntry::new(
                        job.id,
                        owner,
                        "chunking",
                        DecisionPhase::Runtime,
                        DecisionMode::Deterministic,
                        store.now(),
                    )],
                )
                .await
                .unwrap()
                .unwrap();
            assert_eq!(done.result["files_processed"], 3);
            assert!(done.locked_at.is_none());
            assert_eq!(store.list_traces(job.id).await.unwrap().len(), 1);

            let late = store
                .update_fields_unless_status(
                    job.id,
                    &[JobStatus::Succeeded],
                    &JobPatch::new().status(JobStatus::Failed),
                )
                .await
                .unwrap();
            assert!(late.is_none());
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        #[ignore = "requires DATABASE_URL"]
        async fn concurrent_claims_never_share_a_row() {
            let Some((_, store)) = store().await else { return };
            let owner = OwnerId::new();
            let mut ours = HashSet::new();
            for _ in 0..20 {
                ours.insert(store.enqueue(new_job(owner)).await.unwrap().id);
            }

            let mut handles = Vec::new();
            for _ in 0..4 {
                let store = store.clone();
                handles.push(tokio::spawn(async move {
                    let mut seen = Vec::new();
                    while let Some(job) = store
                        .claim_next_runnable(&ClaimPolicy::default())
                        .await
                        .unwrap()
                    {
                        seen.push(job.id);
                    }
                    seen
                }));
            }

            let mut claimed = HashSet::new();
            for handle in handles {
                for id in handle.await.unwrap() {
                    assert!(claimed.insert(id), "row {id} claimed twice");
                }
            }
            assert!(ours.is_subset(&claimed));
        }
    }
}
