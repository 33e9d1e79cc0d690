//! Per-attempt handle passed to pipeline handlers.
//!
//! Every write a context makes is guarded by the lease it was created under
//! (`status = running AND attempts = <claimed attempt>`). Once a stale-lease
//! reclaim or a supervisor cancel moves the row on, the context's writes are
//! refused with [`ContextError::Superseded`] and its cancellation token fires.
//!
//! A handler calls exactly one terminal primitive (`succeed`, `fail`,
//! `wait_for_user`, `cancel`); a second one is refused with
//! [`ContextError::AlreadyFinished`].

use std::fmt::Display;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{Map, Value as JsonValue};
use sqlx::{PgPool, Postgres, Transaction};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use stagehand_core::{
    DecisionMode, DecisionPhase, Job, JobId, JobPatch, JobStatus, OwnerId, Payload, PayloadError,
    TraceEntry, WaitpointEnvelope, WaitpointError, WaitpointSpec, WaitpointState, WriteGuard,
    clamp_progress,
};
use stagehand_events::JobNotifier;

use super::postgres::{map_sqlx_error, update_in_tx};
use super::store::{JobStore, StoreError, StoreResult};

#[derive(Debug, Error)]
pub enum ContextError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("job {0} already reached a terminal state")]
    AlreadyFinished(JobId),

    /// The row is no longer `running` under this context's attempt.
    #[error("lease on job {job_id} (attempt {attempt}) was lost")]
    Superseded { job_id: JobId, attempt: u32 },

    #[error(transparent)]
    Waitpoint(#[from] WaitpointError),

    #[error("job store has no database attached")]
    NoDatabase,
}

/// How an attempt ended, as seen by its context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed { stage: String, error: String },
    Waiting { step: String },
    Canceled { reason: String },
    /// A write was refused because the lease moved on.
    Superseded,
}

#[derive(Debug)]
struct State {
    stage: String,
    outcome: Option<Outcome>,
    /// A terminal write is in flight.
    finishing: bool,
    traces: Vec<TraceEntry>,
}

#[derive(Debug)]
struct Inner {
    job: Job,
    store: Arc<dyn JobStore>,
    notifier: Arc<dyn JobNotifier>,
    cancel: CancellationToken,
    require_trace: bool,
    state: Mutex<State>,
}

enum Sink {
    Store,
    Tx(Transaction<'static, Postgres>),
}

/// Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct JobContext {
    inner: Arc<Inner>,
}

impl JobContext {
    /// `job` is the row as returned by the claim.
    pub fn new(
        job: Job,
        store: Arc<dyn JobStore>,
        notifier: Arc<dyn JobNotifier>,
        cancel: CancellationToken,
        require_trace: bool,
    ) -> Self {
        let state = State {
            stage: job.stage.clone(),
            outcome: None,
            finishing: false,
            traces: Vec::new(),
        };
        Self {
            inner: Arc::new(Inner {
                job,
                store,
                notifier,
                cancel,
                require_trace,
                state: Mutex::new(state),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the claimed row. Not refreshed by context writes.
    pub fn job(&self) -> &Job {
        &self.inner.job
    }

    pub fn id(&self) -> JobId {
        self.inner.job.id
    }

    pub fn owner(&self) -> OwnerId {
        self.inner.job.owner_user_id
    }

    pub fn attempt(&self) -> u32 {
        self.inner.job.attempts
    }

    pub fn payload(&self) -> &Payload {
        &self.inner.job.payload
    }

    pub fn payload_uuid(&self, key: &str) -> Result<Uuid, PayloadError> {
        self.payload().uuid(key)
    }

    pub fn payload_str(&self, key: &str) -> Result<&str, PayloadError> {
        self.payload().str(key)
    }

    pub fn payload_int(&self, key: &str) -> Result<i64, PayloadError> {
        self.payload().int(key)
    }

    pub fn payload_bool(&self, key: &str) -> Result<bool, PayloadError> {
        self.payload().bool(key)
    }

    pub fn payload_map(&self, key: &str) -> Result<&Map<String, JsonValue>, PayloadError> {
        self.payload().map(key)
    }

    /// Fires on worker shutdown, timeout, supervisor cancel and lost lease.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Stage of the last successful write (or the claimed stage).
    pub fn stage(&self) -> String {
        self.state().stage.clone()
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.state().outcome.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.state().outcome.is_some()
    }

    pub fn require_trace(&self) -> bool {
        self.inner.require_trace
    }

    /// Postgres pool behind the store, for domain writes.
    pub fn db(&self) -> Result<&PgPool, ContextError> {
        self.inner.store.pool().ok_or(ContextError::NoDatabase)
    }

    /// Open a transaction to pass to one of the `*_in` terminal writes.
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>, ContextError> {
        self.db()?
            .begin()
            .await
            .map_err(|e| ContextError::Store(map_sqlx_error("begin_transaction", e)))
    }

    /// Persist stage/progress/message and refresh the heartbeat.
    ///
    /// `pct` is clamped to `0..=99`; 100 is reserved for `succeed`.
    pub async fn progress(
        &self,
        stage: &str,
        pct: i64,
        message: &str,
    ) -> Result<(), ContextError> {
        if self.is_finished() {
            return Err(ContextError::AlreadyFinished(self.id()));
        }
        let progress = clamp_progress(pct);
        let now = self.inner.store.now();
        let patch = JobPatch::new()
            .stage(stage)
            .progress(progress)
            .message(message)
            .heartbeat_at(Some(now));

        let Some(job) = self
            .inner
            .store
            .update_fields_guarded(self.id(), &self.lease(), &patch)
            .await?
        else {
            return Err(self.superseded());
        };

        self.state().stage = stage.to_string();
        if let Err(err) = self
            .inner
            .notifier
            .progress(&job, stage, progress, message, now)
        {
            warn!(job_id = %job.id, error = %err, "progress notification failed");
        }
        Ok(())
    }

    /// Terminal: `succeeded`, progress 100, `result` replaced, lease cleared.
    pub async fn succeed(&self, stage: &str, result: JsonValue) -> Result<Job, ContextError> {
        let (outcome, patch) = succeed_patch(stage, result);
        self.finish(outcome, patch, Sink::Store).await
    }

    /// Terminal for this attempt: `failed` with `error` and `last_error_at`.
    ///
    /// The row re-enters the retry ladder unless attempts are exhausted.
    pub async fn fail(&self, stage: &str, err: impl Display) -> Result<Job, ContextError> {
        let (outcome, patch) = self.fail_patch(stage, err);
        self.finish(outcome, patch, Sink::Store).await
    }

    /// Suspend on a waitpoint. The envelope goes into `result`; `locked_at` is
    /// cleared while `heartbeat_at` is kept.
    pub async fn wait_for_user(
        &self,
        stage: &str,
        pct: i64,
        message: &str,
        spec: WaitpointSpec,
        state: WaitpointState,
        data: JsonValue,
    ) -> Result<Job, ContextError> {
        let (outcome, patch) = wait_patch(stage, pct, message, spec, state, data)?;
        self.finish(outcome, patch, Sink::Store).await
    }

    /// Absorbing `canceled` from inside the handler.
    pub async fn cancel(&self, reason: &str) -> Result<Job, ContextError> {
        let patch = JobPatch::new()
            .status(JobStatus::Canceled)
            .message(reason)
            .clear_lease();
        let outcome = Outcome::Canceled {
            reason: reason.to_string(),
        };
        self.finish(outcome, patch, Sink::Store).await
    }

    /// [`succeed`](Self::succeed), committed together with the handler's
    /// writes in `tx`.
    pub async fn succeed_in(
        &self,
        tx: Transaction<'static, Postgres>,
        stage: &str,
        result: JsonValue,
    ) -> Result<Job, ContextError> {
        let (outcome, patch) = succeed_patch(stage, result);
        self.finish(outcome, patch, Sink::Tx(tx)).await
    }

    pub async fn fail_in(
        &self,
        tx: Transaction<'static, Postgres>,
        stage: &str,
        err: impl Display,
    ) -> Result<Job, ContextError> {
        let (outcome, patch) = self.fail_patch(stage, err);
        self.finish(outcome, patch, Sink::Tx(tx)).await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn wait_for_user_in(
        &self,
        tx: Transaction<'static, Postgres>,
        stage: &str,
        pct: i64,
        message: &str,
        spec: WaitpointSpec,
        state: WaitpointState,
        data: JsonValue,
    ) -> Result<Job, ContextError> {
        let (outcome, patch) = wait_patch(stage, pct, message, spec, state, data)?;
        self.finish(outcome, patch, Sink::Tx(tx)).await
    }

    /// Start a trace entry stamped with this job and the current instant.
    pub fn trace(
        &self,
        decision_type: impl Into<String>,
        phase: DecisionPhase,
        mode: DecisionMode,
    ) -> TraceEntry {
        TraceEntry::new(
            self.id(),
            self.owner(),
            decision_type,
            phase,
            mode,
            self.inner.store.now(),
        )
    }

    /// Buffer a trace entry; it is written with the terminal update.
    pub fn record_trace(&self, mut entry: TraceEntry) -> Result<(), ContextError> {
        entry.validate().map_err(StoreError::from)?;
        entry.job_id = self.id();
        entry.owner_user_id = self.owner();
        self.state().traces.push(entry);
        Ok(())
    }

    fn lease(&self) -> WriteGuard {
        WriteGuard::lease(self.attempt())
    }

    fn superseded(&self) -> ContextError {
        {
            let mut state = self.state();
            if state.outcome.is_none() {
                state.outcome = Some(Outcome::Superseded);
            }
        }
        self.inner.cancel.cancel();
        warn!(job_id = %self.id(), attempt = self.attempt(), "lease lost, write refused");
        ContextError::Superseded {
            job_id: self.id(),
            attempt: self.attempt(),
        }
    }

    fn fail_patch(&self, stage: &str, err: impl Display) -> (Outcome, JobPatch) {
        let error = err.to_string();
        let patch = JobPatch::new()
            .status(JobStatus::Failed)
            .stage(stage)
            .error(error.clone())
            .last_error_at(Some(self.inner.store.now()))
            .clear_lease();
        let outcome = Outcome::Failed {
            stage: stage.to_string(),
            error,
        };
        (outcome, patch)
    }

    async fn finish(
        &self,
        outcome: Outcome,
        patch: JobPatch,
        sink: Sink,
    ) -> Result<Job, ContextError> {
        // Buffered traces are consumed by the attempt even when the write
        // fails, so a fallback `fail` is never blocked by a bad trace.
        let traces = {
            let mut state = self.state();
            if state.outcome.is_some() || state.finishing {
                return Err(ContextError::AlreadyFinished(self.id()));
            }
            state.finishing = true;
            std::mem::take(&mut state.traces)
        };

        let inline: &[TraceEntry] = if self.inner.require_trace {
            &traces
        } else {
            &[]
        };
        let written = self.write(sink, &patch, inline).await;

        let job = match written {
            Ok(Some(job)) => job,
            Ok(None) => {
                self.state().finishing = false;
                return Err(self.superseded());
            }
            Err(err) => {
                self.state().finishing = false;
                return Err(err.into());
            }
        };

        {
            let mut state = self.state();
            state.finishing = false;
            state.stage = job.stage.clone();
            state.outcome = Some(outcome.clone());
        }
        debug!(job_id = %job.id, status = %job.status, "attempt finished");

        if !self.inner.require_trace && !traces.is_empty() {
            self.spawn_trace_write(traces);
        }
        self.notify(&job, &outcome);
        Ok(job)
    }

    async fn write(
        &self,
        sink: Sink,
        patch: &JobPatch,
        traces: &[TraceEntry],
    ) -> StoreResult<Option<Job>> {
        let store = &self.inner.store;
        let guard = self.lease();
        match sink {
            Sink::Store if traces.is_empty() => {
                store.update_fields_guarded(self.id(), &guard, patch).await
            }
            Sink::Store => {
                store
                    .update_with_traces(self.id(), &guard, patch, traces)
                    .await
            }
            Sink::Tx(mut tx) => {
                let updated =
                    update_in_tx(&mut tx, self.id(), &guard, patch, traces, store.now()).await?;
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
        }
    }

    fn spawn_trace_write(&self, traces: Vec<TraceEntry>) {
        let store = self.inner.store.clone();
        let job_id = self.id();
        tokio::spawn(async move {
            if let Err(err) = store.append_traces(&traces).await {
                warn!(%job_id, error = %err, count = traces.len(), "detached trace write failed");
            }
        });
    }

    fn notify(&self, job: &Job, outcome: &Outcome) {
        let notifier = &self.inner.notifier;
        let at = job.updated_at;
        let sent = match outcome {
            Outcome::Succeeded => notifier.done(job, &job.result, at),
            Outcome::Failed { stage, error } => notifier.failed(job, stage, error, at),
            Outcome::Waiting { .. } => match job.waitpoint() {
                Ok(Some(envelope)) => notifier.waiting(job, &job.stage, &envelope.spec, at),
                _ => Ok(()),
            },
            Outcome::Canceled { reason } => notifier.canceled(job, reason, at),
            Outcome::Superseded => Ok(()),
        };
        if let Err(err) = sent {
            warn!(job_id = %job.id, error = %err, "job notification failed");
        }
    }
}

fn succeed_patch(stage: &str, result: JsonValue) -> (Outcome, JobPatch) {
    let patch = JobPatch::new()
        .status(JobStatus::Succeeded)
        .stage(stage)
        .progress(100)
        .error("")
        .result(result)
        .clear_lease();
    (Outcome::Succeeded, patch)
}

fn wait_patch(
    stage: &str,
    pct: i64,
    message: &str,
    spec: WaitpointSpec,
    state: WaitpointState,
    data: JsonValue,
) -> Result<(Outcome, JobPatch), ContextError> {
    let step = spec.step.clone();
    let envelope = WaitpointEnvelope::new(spec, state, data).encode()?;
    let patch = JobPatch::new()
        .status(JobStatus::WaitingUser)
        .stage(stage)
        .progress(clamp_progress(pct))
        .message(message)
        .result(envelope)
        .locked_at(None);
    Ok((Outcome::Waiting { step }, patch))
}
