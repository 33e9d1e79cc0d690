//! Internal SQL operations on `job_runs` / `job_decision_traces`.
//!
//! Every function is generic over the executor so it runs the same on a pool
//! or inside a caller-supplied transaction.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Executor, FromRow, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use stagehand_core::{EntityKey, Job, JobPatch, JobStatus, OwnerId, TraceEntry, WriteGuard};

pub(crate) const JOB_COLUMNS: &str = "id, owner_user_id, entity_type, entity_id, job_type, \
     status, stage, progress, message, attempts, error, last_error_at, \
     locked_at, heartbeat_at, payload, result, created_at, updated_at, deleted_at";

/// Raw `job_runs` row.
#[derive(Debug)]
pub(crate) struct JobRow {
    pub id: Uuid,
    pub owner_user_id: Uuid,
    pub entity_type: String,
    pub entity_id: Option<Uuid>,
    pub job_type: String,
    pub status: String,
    pub stage: String,
    pub progress: i16,
    pub message: String,
    pub attempts: i32,
    pub error: String,
    pub last_error_at: Option<DateTime<Utc>>,
    pub locked_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub payload: serde_json::Value,
    pub result: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            owner_user_id: row.try_get("owner_user_id")?,
            entity_type: row.try_get("entity_type")?,
            entity_id: row.try_get("entity_id")?,
            job_type: row.try_get("job_type")?,
            status: row.try_get("status")?,
            stage: row.try_get("stage")?,
            progress: row.try_get("progress")?,
            message: row.try_get("message")?,
            attempts: row.try_get("attempts")?,
            error: row.try_get("error")?,
            last_error_at: row.try_get("last_error_at")?,
            locked_at: row.try_get("locked_at")?,
            heartbeat_at: row.try_get("heartbeat_at")?,
            payload: row.try_get("payload")?,
            result: row.try_get("result")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            deleted_at: row.try_get("deleted_at")?,
        })
    }
}

/// Raw `job_decision_traces` row.
#[derive(Debug)]
pub(crate) struct TraceRow {
    pub id: Uuid,
    pub job_id: Uuid,
    pub owner_user_id: Uuid,
    pub decision_type: String,
    pub decision_phase: String,
    pub decision_mode: String,
    pub actor_ids: Vec<Uuid>,
    pub inputs: serde_json::Value,
    pub chosen: serde_json::Value,
    pub graph_version: String,
    pub occurred_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for TraceRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(TraceRow {
            id: row.try_get("id")?,
            job_id: row.try_get("job_id")?,
            owner_user_id: row.try_get("owner_user_id")?,
            decision_type: row.try_get("decision_type")?,
            decision_phase: row.try_get("decision_phase")?,
            decision_mode: row.try_get("decision_mode")?,
            actor_ids: row.try_get("actor_ids")?,
            inputs: row.try_get("inputs")?,
            chosen: row.try_get("chosen")?,
            graph_version: row.try_get("graph_version")?,
            occurred_at: row.try_get("occurred_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Insert a materialised row.
pub(crate) async fn insert<'c, E>(exe: E, job: &Job) -> Result<JobRow, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let query = format!(
        r#"
        INSERT INTO job_runs (
            id, owner_user_id, entity_type, entity_id, job_type,
            status, stage, progress, message, attempts, error,
            payload, result, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $14)
        RETURNING {JOB_COLUMNS}
        "#
    );
    sqlx::query_as::<_, JobRow>(&query)
        .bind(job.id.as_uuid())
        .bind(job.owner_user_id.as_uuid())
        .bind(&job.entity_type)
        .bind(job.entity_id)
        .bind(&job.job_type)
        .bind(job.status.as_str())
        .bind(&job.stage)
        .bind(job.progress as i16)
        .bind(&job.message)
        .bind(job.attempts as i32)
        .bind(&job.error)
        .bind(job.payload.to_value())
        .bind(&job.result)
        .bind(job.created_at)
        .fetch_one(exe)
        .await
}

/// Claim the oldest eligible row under `FOR UPDATE SKIP LOCKED`.
///
/// The three eligibility branches mirror `ClaimPolicy::is_eligible`; cut-offs
/// are computed by the caller so the predicate sees a single instant.
pub(crate) async fn claim_next<'c, E>(
    exe: E,
    max_attempts: u32,
    retry_cutoff: DateTime<Utc>,
    stale_cutoff: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Option<JobRow>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let query = r#"
        WITH next AS (
            SELECT id
            FROM job_runs
            WHERE deleted_at IS NULL
              AND (
                    status = 'queued'
                 OR (status = 'failed'
                     AND attempts < $1
                     AND (last_error_at IS NULL OR last_error_at < $2))
                 OR (status = 'running'
                     AND COALESCE(heartbeat_at, updated_at) < $3)
              )
            ORDER BY created_at ASC, id ASC
            FOR UPDATE SKIP LOCKED
            LIMIT 1
        )
        UPDATE job_runs j
        SET status = 'running',
            attempts = j.attempts + 1,
            locked_at = $4,
            heartbeat_at = $4,
            updated_at = $4
        FROM next
        WHERE j.id = next.id
        RETURNING j.*
    "#;
    sqlx::query_as::<_, JobRow>(query)
        .bind(max_attempts as i32)
        .bind(retry_cutoff)
        .bind(stale_cutoff)
        .bind(now)
        .fetch_optional(exe)
        .await
}

/// Guarded partial update; `None` when the guard (or a missing row) rejects it.
pub(crate) async fn update_guarded<'c, E>(
    exe: E,
    id: Uuid,
    guard: &WriteGuard,
    patch: &JobPatch,
    now: DateTime<Utc>,
) -> Result<Option<JobRow>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let mut qb = QueryBuilder::<Postgres>::new("UPDATE job_runs SET updated_at = ");
    qb.push_bind(now);

    if let Some(status) = patch.status {
        qb.push(", status = ").push_bind(status.as_str());
    }
    if let Some(stage) = &patch.stage {
        qb.push(", stage = ").push_bind(stage.clone());
    }
    if let Some(progress) = patch.progress {
        qb.push(", progress = ").push_bind(progress.min(100) as i16);
    }
    if let Some(message) = &patch.message {
        qb.push(", message = ").push_bind(message.clone());
    }
    if let Some(error) = &patch.error {
        qb.push(", error = ").push_bind(error.clone());
    }
    if let Some(at) = patch.last_error_at {
        qb.push(", last_error_at = ").push_bind(at);
    }
    if let Some(at) = patch.locked_at {
        qb.push(", locked_at = ").push_bind(at);
    }
    if let Some(at) = patch.heartbeat_at {
        qb.push(", heartbeat_at = ").push_bind(at);
    }
    if let Some(result) = &patch.result {
        qb.push(", result = ").push_bind(result.clone());
    }

    qb.push(" WHERE id = ").push_bind(id);
    qb.push(" AND deleted_at IS NULL");
    if !guard.forbidden.is_empty() {
        let forbidden: Vec<String> = guard
            .forbidden
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        qb.push(" AND status <> ALL(").push_bind(forbidden).push(")");
    }
    if let Some(attempt) = guard.attempt {
        qb.push(" AND attempts = ").push_bind(attempt as i32);
    }
    qb.push(" RETURNING ").push(JOB_COLUMNS);

    qb.build_query_as::<JobRow>().fetch_optional(exe).await
}

pub(crate) async fn exists<'c, E>(exe: E, id: Uuid) -> Result<bool, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let query = r#"
        SELECT EXISTS (
            SELECT 1 FROM job_runs WHERE id = $1 AND deleted_at IS NULL
        )
    "#;
    sqlx::query_scalar::<_, bool>(query)
        .bind(id)
        .fetch_one(exe)
        .await
}

/// `heartbeat_at := now` while running (and at `attempt`, when given).
pub(crate) async fn heartbeat<'c, E>(
    exe: E,
    id: Uuid,
    attempt: Option<u32>,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let query = r#"
        UPDATE job_runs
        SET heartbeat_at = $2, updated_at = $2
        WHERE id = $1
          AND deleted_at IS NULL
          AND status = 'running'
          AND ($3::integer IS NULL OR attempts = $3)
    "#;
    let res = sqlx::query(query)
        .bind(id)
        .bind(now)
        .bind(attempt.map(|a| a as i32))
        .execute(exe)
        .await?;
    Ok(res.rows_affected() == 1)
}

pub(crate) async fn get_by_ids<'c, E>(exe: E, ids: &[Uuid]) -> Result<Vec<JobRow>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let query = format!(
        r#"
        SELECT {JOB_COLUMNS}
        FROM job_runs
        WHERE id = ANY($1) AND deleted_at IS NULL
        ORDER BY created_at ASC
        "#
    );
    sqlx::query_as::<_, JobRow>(&query)
        .bind(ids.to_vec())
        .fetch_all(exe)
        .await
}

pub(crate) async fn get_latest_by_entity<'c, E>(
    exe: E,
    key: &EntityKey,
) -> Result<Option<JobRow>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let query = format!(
        r#"
        SELECT {JOB_COLUMNS}
        FROM job_runs
        WHERE owner_user_id = $1
          AND entity_type = $2
          AND entity_id IS NOT DISTINCT FROM $3
          AND job_type = $4
          AND deleted_at IS NULL
        ORDER BY created_at DESC, id DESC
        LIMIT 1
        "#
    );
    sqlx::query_as::<_, JobRow>(&query)
        .bind(key.owner_user_id.as_uuid())
        .bind(&key.entity_type)
        .bind(key.entity_id)
        .bind(&key.job_type)
        .fetch_optional(exe)
        .await
}

pub(crate) async fn list_by_status<'c, E>(
    exe: E,
    owner: OwnerId,
    status: Option<JobStatus>,
    limit: i64,
) -> Result<Vec<JobRow>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let query = format!(
        r#"
        SELECT {JOB_COLUMNS}
        FROM job_runs
        WHERE owner_user_id = $1
          AND ($2::text IS NULL OR status = $2)
          AND deleted_at IS NULL
        ORDER BY created_at ASC, id ASC
        LIMIT $3
        "#
    );
    sqlx::query_as::<_, JobRow>(&query)
        .bind(owner.as_uuid())
        .bind(status.map(|s| s.as_str()))
        .bind(limit)
        .fetch_all(exe)
        .await
}

/// `(status, total, exhausted)` per status present for the owner.
pub(crate) async fn count_by_status<'c, E>(
    exe: E,
    owner: OwnerId,
    max_attempts: u32,
) -> Result<Vec<(String, i64, i64)>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let query = r#"
        SELECT
            status,
            COUNT(*) AS total,
            COUNT(*) FILTER (WHERE status = 'failed' AND attempts >= $2) AS exhausted
        FROM job_runs
        WHERE owner_user_id = $1 AND deleted_at IS NULL
        GROUP BY status
    "#;
    let rows = sqlx::query(query)
        .bind(owner.as_uuid())
        .bind(max_attempts as i32)
        .fetch_all(exe)
        .await?;

    rows.iter()
        .map(|row| -> Result<(String, i64, i64), sqlx::Error> {
            Ok((
                row.try_get("status")?,
                row.try_get("total")?,
                row.try_get("exhausted")?,
            ))
        })
        .collect()
}

pub(crate) async fn soft_delete_owner<'c, E>(
    exe: E,
    owner: OwnerId,
    now: DateTime<Utc>,
) -> Result<u64, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let query = r#"
        UPDATE job_runs
        SET deleted_at = $2, updated_at = $2
        WHERE owner_user_id = $1 AND deleted_at IS NULL
    "#;
    let res = sqlx::query(query)
        .bind(owner.as_uuid())
        .bind(now)
        .execute(exe)
        .await?;
    Ok(res.rows_affected())
}

/// Bulk insert in one statement. Callers skip the call for an empty slice.
pub(crate) async fn insert_traces<'c, E>(exe: E, traces: &[TraceEntry]) -> Result<u64, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let mut qb = QueryBuilder::<Postgres>::new(
        "INSERT INTO job_decision_traces (id, job_id, owner_user_id, decision_type, \
         decision_phase, decision_mode, actor_ids, inputs, chosen, graph_version, \
         occurred_at, created_at) ",
    );
    qb.push_values(traces, |mut b, t| {
        b.push_bind(*t.id.as_uuid())
            .push_bind(*t.job_id.as_uuid())
            .push_bind(*t.owner_user_id.as_uuid())
            .push_bind(t.decision_type.clone())
            .push_bind(t.phase.as_str())
            .push_bind(t.mode.as_str())
            .push_bind(t.actor_ids.clone())
            .push_bind(t.inputs.clone())
            .push_bind(t.chosen.clone())
            .push_bind(t.graph_version.clone())
            .push_bind(t.occurred_at)
            .push_bind(t.created_at);
    });
    let res = qb.build().execute(exe).await?;
    Ok(res.rows_affected())
}

pub(crate) async fn list_traces<'c, E>(exe: E, job_id: Uuid) -> Result<Vec<TraceRow>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let query = r#"
        SELECT id, job_id, owner_user_id, decision_type, decision_phase, decision_mode,
               actor_ids, inputs, chosen, graph_version, occurred_at, created_at
        FROM job_decision_traces
        WHERE job_id = $1
        ORDER BY occurred_at ASC, id ASC
    "#;
    sqlx::query_as::<_, TraceRow>(query)
        .bind(job_id)
        .fetch_all(exe)
        .await
}
