//! Job row model, partial updates and write guards.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::{DomainError, DomainResult};
use crate::id::{JobId, OwnerId};
use crate::payload::Payload;
use crate::waitpoint::{WaitpointEnvelope, WaitpointError};

/// Stage assigned at enqueue when the caller does not pick one.
pub const DEFAULT_STAGE: &str = "ingest";

/// Highest progress a non-terminal write may report (100 is reserved for success).
pub const MAX_RUNNING_PROGRESS: u8 = 99;

/// Lifecycle status of a job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Eligible for claim.
    Queued,
    /// Claimed by a worker (lease held).
    Running,
    /// Suspended on a waitpoint until an external resume.
    WaitingUser,
    /// Absorbing success.
    Succeeded,
    /// Attempt failed; may be re-claimed per the retry policy.
    Failed,
    /// Absorbing cancellation.
    Canceled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::WaitingUser,
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::Canceled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::WaitingUser => "waiting_user",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }

    /// `succeeded` and `canceled` are never left once reached.
    pub fn is_absorbing(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Canceled)
    }

    /// Work is pending or in flight (used for idempotent enqueue).
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobStatus::Queued | JobStatus::Running | JobStatus::WaitingUser
        )
    }

    /// Every status other than `keep`.
    pub fn all_except(keep: JobStatus) -> Vec<JobStatus> {
        Self::ALL.iter().copied().filter(|s| *s != keep).collect()
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job status: {s}")))
    }
}

/// `(owner, entity_type, entity_id, job_type)`: what kind of work on what target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub owner_user_id: OwnerId,
    pub entity_type: String,
    pub entity_id: Option<Uuid>,
    pub job_type: String,
}

/// A persisted unit of durable work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub owner_user_id: OwnerId,
    pub entity_type: String,
    pub entity_id: Option<Uuid>,
    pub job_type: String,

    pub status: JobStatus,
    pub stage: String,
    /// 0..=100; monotone within an attempt by handler convention only.
    pub progress: u8,
    pub message: String,
    /// Incremented on claim, never on enqueue.
    pub attempts: u32,
    pub error: String,
    pub last_error_at: Option<DateTime<Utc>>,

    pub locked_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,

    /// Immutable after enqueue.
    pub payload: Payload,
    /// Rewritten on success and when suspending (waitpoint envelope).
    pub result: JsonValue,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn entity_key(&self) -> EntityKey {
        EntityKey {
            owner_user_id: self.owner_user_id,
            entity_type: self.entity_type.clone(),
            entity_id: self.entity_id,
            job_type: self.job_type.clone(),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Decode the waitpoint envelope stored in `result`, if any.
    ///
    /// Returns `Ok(None)` when `result` carries no `spec` object (plain results).
    pub fn waitpoint(&self) -> Result<Option<WaitpointEnvelope>, WaitpointError> {
        match self.result.get("spec") {
            Some(JsonValue::Object(_)) => WaitpointEnvelope::decode(&self.result).map(Some),
            _ => Ok(None),
        }
    }

    /// Apply a partial update in place and bump `updated_at`.
    pub fn apply(&mut self, patch: &JobPatch, now: DateTime<Utc>) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(stage) = &patch.stage {
            self.stage = stage.clone();
        }
        if let Some(progress) = patch.progress {
            self.progress = progress.min(100);
        }
        if let Some(message) = &patch.message {
            self.message = message.clone();
        }
        if let Some(error) = &patch.error {
            self.error = error.clone();
        }
        if let Some(at) = patch.last_error_at {
            self.last_error_at = at;
        }
        if let Some(at) = patch.locked_at {
            self.locked_at = at;
        }
        if let Some(at) = patch.heartbeat_at {
            self.heartbeat_at = at;
        }
        if let Some(result) = &patch.result {
            self.result = result.clone();
        }
        self.updated_at = now;
    }
}

/// Input to `Enqueue`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub owner_user_id: OwnerId,
    pub entity_type: String,
    pub entity_id: Option<Uuid>,
    pub job_type: String,
    /// Defaults to [`DEFAULT_STAGE`].
    pub stage: Option<String>,
    pub payload: Payload,
}

impl NewJob {
    pub fn new(
        owner_user_id: OwnerId,
        entity_type: impl Into<String>,
        entity_id: Option<Uuid>,
        job_type: impl Into<String>,
    ) -> Self {
        Self {
            owner_user_id,
            entity_type: entity_type.into(),
            entity_id,
            job_type: job_type.into(),
            stage: None,
            payload: Payload::default(),
        }
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn entity_key(&self) -> EntityKey {
        EntityKey {
            owner_user_id: self.owner_user_id,
            entity_type: self.entity_type.clone(),
            entity_id: self.entity_id,
            job_type: self.job_type.clone(),
        }
    }

    /// Required fields: `job_type`, `entity_type`, and a non-empty stage if one is given.
    pub fn validate(&self) -> DomainResult<()> {
        if self.job_type.trim().is_empty() {
            return Err(DomainError::invariant("job_type is required"));
        }
        if self.entity_type.trim().is_empty() {
            return Err(DomainError::invariant("entity_type is required"));
        }
        if matches!(&self.stage, Some(stage) if stage.trim().is_empty()) {
            return Err(DomainError::invariant("stage must not be blank"));
        }
        Ok(())
    }

    /// Materialise the row with enqueue defaults (`queued`, `attempts=0`, empty result).
    pub fn into_job(self, id: JobId, now: DateTime<Utc>) -> DomainResult<Job> {
        self.validate()?;
        Ok(Job {
            id,
            owner_user_id: self.owner_user_id,
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            job_type: self.job_type,
            status: JobStatus::Queued,
            stage: self.stage.unwrap_or_else(|| DEFAULT_STAGE.to_string()),
            progress: 0,
            message: String::new(),
            attempts: 0,
            error: String::new(),
            last_error_at: None,
            locked_at: None,
            heartbeat_at: None,
            payload: self.payload,
            result: JsonValue::Object(Default::default()),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        })
    }
}

/// Partial update by primary key. `None` leaves a column untouched;
/// `Some(None)` clears a nullable column.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub stage: Option<String>,
    pub progress: Option<u8>,
    pub message: Option<String>,
    pub error: Option<String>,
    pub last_error_at: Option<Option<DateTime<Utc>>>,
    pub locked_at: Option<Option<DateTime<Utc>>>,
    pub heartbeat_at: Option<Option<DateTime<Utc>>>,
    pub result: Option<JsonValue>,
}

impl JobPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn last_error_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.last_error_at = Some(at);
        self
    }

    pub fn locked_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.locked_at = Some(at);
        self
    }

    pub fn heartbeat_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.heartbeat_at = Some(at);
        self
    }

    pub fn result(mut self, result: JsonValue) -> Self {
        self.result = Some(result);
        self
    }

    /// Drop both lease timestamps.
    pub fn clear_lease(self) -> Self {
        self.locked_at(None).heartbeat_at(None)
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Precondition for a conditional write.
///
/// The write is a no-op when the current status is in `forbidden`, or when
/// `attempt` is set and differs from the row's `attempts` (the writer's
/// lease was superseded by a later claim).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteGuard {
    pub forbidden: Vec<JobStatus>,
    pub attempt: Option<u32>,
}

impl WriteGuard {
    /// Unconditional.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn unless(forbidden: &[JobStatus]) -> Self {
        Self {
            forbidden: forbidden.to_vec(),
            attempt: None,
        }
    }

    /// Only while the row is in `status`.
    pub fn only(status: JobStatus) -> Self {
        Self {
            forbidden: JobStatus::all_except(status),
            attempt: None,
        }
    }

    /// Only while the row is `running` under the given claim.
    pub fn lease(attempt: u32) -> Self {
        Self::only(JobStatus::Running).with_attempt(attempt)
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn permits(&self, job: &Job) -> bool {
        !self.forbidden.contains(&job.status)
            && self.attempt.is_none_or(|attempt| attempt == job.attempts)
    }
}

/// Clamp a handler-reported percentage into `0..=99`.
pub fn clamp_progress(pct: i64) -> u8 {
    pct.clamp(0, MAX_RUNNING_PROGRESS as i64) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn new_job() -> NewJob {
        NewJob::new(OwnerId::new(), "material_set", Some(Uuid::now_v7()), "ingest_chunks")
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("paused".parse::<JobStatus>().is_err());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_value(JobStatus::WaitingUser).unwrap();
        assert_eq!(json, json!("waiting_user"));
    }

    #[test]
    fn enqueue_defaults_are_applied() {
        let now = Utc::now();
        let job = new_job().into_job(JobId::new(), now).unwrap();

        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.stage, DEFAULT_STAGE);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.progress, 0);
        assert_eq!(job.result, json!({}));
        assert!(job.locked_at.is_none());
        assert_eq!(job.created_at, now);
    }

    #[test]
    fn caller_supplied_stage_is_kept() {
        let job = new_job()
            .with_stage("embed")
            .into_job(JobId::new(), Utc::now())
            .unwrap();
        assert_eq!(job.stage, "embed");
    }

    #[test]
    fn missing_required_fields_are_rejected() {
        let mut missing_type = new_job();
        missing_type.job_type = "  ".into();
        assert!(matches!(
            missing_type.into_job(JobId::new(), Utc::now()),
            Err(DomainError::InvariantViolation(_))
        ));

        let mut missing_entity = new_job();
        missing_entity.entity_type = String::new();
        assert!(missing_entity.validate().is_err());
    }

    #[test]
    fn patch_touches_only_set_columns() {
        let now = Utc::now();
        let mut job = new_job().into_job(JobId::new(), now).unwrap();
        job.locked_at = Some(now);
        job.heartbeat_at = Some(now);

        let later = now + chrono::Duration::seconds(5);
        job.apply(&JobPatch::new().stage("embed").progress(40).locked_at(None), later);

        assert_eq!(job.stage, "embed");
        assert_eq!(job.progress, 40);
        assert!(job.locked_at.is_none());
        assert_eq!(job.heartbeat_at, Some(now));
        assert_eq!(job.updated_at, later);
        assert_eq!(job.status, JobStatus::Queued);
    }

    #[test]
    fn lease_guard_requires_running_and_matching_attempt() {
        let mut job = new_job().into_job(JobId::new(), Utc::now()).unwrap();
        job.status = JobStatus::Running;
        job.attempts = 2;

        assert!(WriteGuard::lease(2).permits(&job));
        assert!(!WriteGuard::lease(1).permits(&job));

        job.status = JobStatus::Canceled;
        assert!(!WriteGuard::lease(2).permits(&job));
        assert!(WriteGuard::none().permits(&job));
    }

    #[test]
    fn unless_guard_blocks_forbidden_statuses() {
        let mut job = new_job().into_job(JobId::new(), Utc::now()).unwrap();
        job.status = JobStatus::Canceled;
        assert!(!WriteGuard::unless(&[JobStatus::Canceled]).permits(&job));
        job.status = JobStatus::WaitingUser;
        assert!(WriteGuard::unless(&[JobStatus::Canceled]).permits(&job));
    }

    #[test]
    fn plain_result_has_no_waitpoint() {
        let mut job = new_job().into_job(JobId::new(), Utc::now()).unwrap();
        job.result = json!({"files_processed": 3});
        assert_eq!(job.waitpoint().unwrap(), None);
    }

    proptest! {
        #[test]
        fn clamp_never_reports_completion(pct in any::<i64>()) {
            let clamped = clamp_progress(pct);
            prop_assert!(clamped <= MAX_RUNNING_PROGRESS);
            if (0..=99).contains(&pct) {
                prop_assert_eq!(clamped as i64, pct);
            }
        }
    }
}
