//! Out-of-band operations on job rows: cancel, the waitpoint resume gate and
//! owner cleanup.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use stagehand_core::{Job, JobId, JobPatch, JobStatus, OwnerId, WaitpointError, WriteGuard};
use stagehand_events::{JobNotifier, NoopNotifier};

use super::store::{JobStore, StoreError};
use super::worker::RunningJobs;

/// Statuses a cancel never overwrites.
const CANCEL_FORBIDDEN: [JobStatus; 2] = [JobStatus::Succeeded, JobStatus::Canceled];

#[derive(Debug, Error)]
pub enum ResumeError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("job is {0}, not waiting for user input")]
    NotWaiting(JobStatus),

    #[error("job result carries no waitpoint")]
    NoWaitpoint,

    #[error(transparent)]
    Waitpoint(#[from] WaitpointError),

    #[error("event thread `{observed}` does not match waitpoint thread `{expected}`")]
    CorrelationMismatch { expected: String, observed: String },

    #[error("event seq {observed} has not passed waitpoint watermark {min_seq}")]
    NotYet { min_seq: i64, observed: i64 },

    #[error("waitpoint is blocking; resume through a correlated event")]
    Blocking,

    /// The row left `waiting_user` between the read and the write.
    #[error("job {0} changed concurrently")]
    Conflict(JobId),
}

#[derive(Debug, Clone)]
pub struct Supervisor {
    store: Arc<dyn JobStore>,
    notifier: Arc<dyn JobNotifier>,
    running: Option<RunningJobs>,
}

impl Supervisor {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            notifier: Arc::new(NoopNotifier),
            running: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn JobNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Jobs running in this process get their handler signalled on cancel.
    pub fn with_running(mut self, running: RunningJobs) -> Self {
        self.running = Some(running);
        self
    }

    /// Move the row to the absorbing `canceled` status.
    ///
    /// Returns `Ok(None)` when the row is already `succeeded` or `canceled`.
    /// A `running` row's handler keeps running until it observes its token
    /// (signalled here when it runs in this process); its later writes are
    /// refused by the lease guard.
    pub async fn cancel(&self, id: JobId, reason: &str) -> Result<Option<Job>, StoreError> {
        let patch = JobPatch::new()
            .status(JobStatus::Canceled)
            .message(reason)
            .clear_lease();
        let Some(job) = self
            .store
            .update_fields_unless_status(id, &CANCEL_FORBIDDEN, &patch)
            .await?
        else {
            debug!(job_id = %id, "cancel ignored, job already terminal");
            return Ok(None);
        };

        info!(job_id = %id, reason, "job canceled");
        if let Some(running) = &self.running {
            running.cancel(id);
        }
        if let Err(err) = self.notifier.canceled(&job, reason, job.updated_at) {
            warn!(job_id = %id, error = %err, "cancel notification failed");
        }
        Ok(Some(job))
    }

    /// Resume gate: flip `waiting_user` back to `queued` once an event on the
    /// waitpoint's thread has passed its `min_seq` watermark.
    ///
    /// `attempts` and `result` are kept, so the next claim re-reads the
    /// envelope.
    pub async fn resume(
        &self,
        id: JobId,
        thread_id: &str,
        observed_seq: i64,
    ) -> Result<Job, ResumeError> {
        let job = self.waiting(id).await?;
        let envelope = job.waitpoint()?.ok_or(ResumeError::NoWaitpoint)?;

        if envelope.spec.thread_id != thread_id {
            return Err(ResumeError::CorrelationMismatch {
                expected: envelope.spec.thread_id,
                observed: thread_id.to_string(),
            });
        }
        if !envelope.is_satisfied_by(thread_id, observed_seq) {
            return Err(ResumeError::NotYet {
                min_seq: envelope.spec.min_seq,
                observed: observed_seq,
            });
        }

        let job = self.requeue(id).await?;
        info!(job_id = %id, thread_id, observed_seq, "job resumed");
        Ok(job)
    }

    /// Operator override: requeue a non-blocking waitpoint without a
    /// correlated event.
    pub async fn force_resume(&self, id: JobId) -> Result<Job, ResumeError> {
        let job = self.waiting(id).await?;
        if let Some(envelope) = job.waitpoint()? {
            if envelope.spec.blocking {
                return Err(ResumeError::Blocking);
            }
        }

        let job = self.requeue(id).await?;
        info!(job_id = %id, "job force-resumed");
        Ok(job)
    }

    /// Soft-delete every row of `owner`.
    pub async fn purge_owner(&self, owner: OwnerId) -> Result<u64, StoreError> {
        let purged = self.store.soft_delete_owner(owner).await?;
        info!(owner_user_id = %owner, purged, "owner jobs purged");
        Ok(purged)
    }

    async fn waiting(&self, id: JobId) -> Result<Job, ResumeError> {
        let job = self.store.get(id).await?.ok_or(ResumeError::NotFound(id))?;
        if job.status != JobStatus::WaitingUser {
            return Err(ResumeError::NotWaiting(job.status));
        }
        Ok(job)
    }

    async fn requeue(&self, id: JobId) -> Result<Job, ResumeError> {
        let patch = JobPatch::new().status(JobStatus::Queued).error("");
        self.store
            .update_fields_guarded(id, &WriteGuard::only(JobStatus::WaitingUser), &patch)
            .await?
            .ok_or(ResumeError::Conflict(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobStore;
    use serde_json::json;
    use stagehand_core::{
        ClaimPolicy, NewJob, WaitpointEnvelope, WaitpointSpec, WaitpointState,
    };

    async fn waiting_job(store: &InMemoryJobStore, blocking: bool) -> Job {
        let job = store
            .enqueue(NewJob::new(OwnerId::new(), "path", None, "path_intake"))
            .await
            .unwrap();
        store
            .claim_next_runnable(&ClaimPolicy::default())
            .await
            .unwrap()
            .unwrap();
        let envelope = WaitpointEnvelope::new(
            WaitpointSpec::new("path_intake.structure_v1", "path_intake")
                .blocking(blocking)
                .correlated("T", 7),
            WaitpointState::new("awaiting_choice"),
            json!({}),
        );
        store
            .update_fields(
                job.id,
                &JobPatch::new()
                    .status(JobStatus::WaitingUser)
                    .result(envelope.encode().unwrap())
                    .locked_at(None),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn resume_gate_checks_thread_and_watermark() {
        let store = InMemoryJobStore::arc();
        let supervisor = Supervisor::new(store.clone());
        let job = waiting_job(&store, false).await;

        assert!(matches!(
            supervisor.resume(job.id, "other", 9).await,
            Err(ResumeError::CorrelationMismatch { .. })
        ));
        assert!(matches!(
            supervisor.resume(job.id, "T", 7).await,
            Err(ResumeError::NotYet { min_seq: 7, observed: 7 })
        ));

        let resumed = supervisor.resume(job.id, "T", 8).await.unwrap();
        assert_eq!(resumed.status, JobStatus::Queued);
        assert_eq!(resumed.attempts, 1);
        assert!(resumed.waitpoint().unwrap().is_some());

        assert!(matches!(
            supervisor.resume(job.id, "T", 9).await,
            Err(ResumeError::NotWaiting(JobStatus::Queued))
        ));
    }

    #[tokio::test]
    async fn blocking_waitpoints_refuse_force_resume() {
        let store = InMemoryJobStore::arc();
        let supervisor = Supervisor::new(store.clone());

        let blocking = waiting_job(&store, true).await;
        assert!(matches!(
            supervisor.force_resume(blocking.id).await,
            Err(ResumeError::Blocking)
        ));

        let open = waiting_job(&store, false).await;
        let resumed = supervisor.force_resume(open.id).await.unwrap();
        assert_eq!(resumed.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn cancel_is_absorbing() {
        let store = InMemoryJobStore::arc();
        let running = RunningJobs::default();
        let supervisor = Supervisor::new(store.clone()).with_running(running);
        let job = waiting_job(&store, true).await;

        let canceled = supervisor.cancel(job.id, "user_abort").await.unwrap().unwrap();
        assert_eq!(canceled.status, JobStatus::Canceled);
        assert_eq!(canceled.message, "user_abort");

        assert!(supervisor.cancel(job.id, "again").await.unwrap().is_none());
        assert!(matches!(
            supervisor.resume(job.id, "T", 8).await,
            Err(ResumeError::NotWaiting(JobStatus::Canceled))
        ));
    }

    #[tokio::test]
    async fn purge_hides_rows() {
        let store = InMemoryJobStore::arc();
        let supervisor = Supervisor::new(store.clone());
        let job = waiting_job(&store, false).await;

        assert_eq!(supervisor.purge_owner(job.owner_user_id).await.unwrap(), 1);
        assert!(matches!(
            supervisor.force_resume(job.id).await,
            Err(ResumeError::NotFound(_))
        ));
    }
}
