//! Worker loop and worker pool.
//!
//! A worker claims one job at a time, runs its pipeline on a spawned task
//! under a per-job cancellation token and enforces the terminal-call
//! contract once the handler returns. Workers coordinate only through the
//! store's claim.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use stagehand_core::{ClaimPolicy, Job, JobId, JobStatus};
use stagehand_events::{JobNotifier, NoopNotifier};

use super::context::{ContextError, JobContext, Outcome};
use super::registry::{Pipeline, PipelineRegistry};
use super::store::{JobStore, StoreResult};

/// Stage recorded when no pipeline is registered for the job type.
pub const STAGE_DISPATCH: &str = "dispatch";
pub const STAGE_PANIC: &str = "panic";
pub const STAGE_NO_TERMINAL_CALL: &str = "no_terminal_call";
pub const STAGE_TIMEOUT: &str = "timeout";
pub const STAGE_CANCELED: &str = "canceled";

/// Floor for the heartbeat period; tokio intervals reject a zero period.
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name for logging
    pub name: String,
    /// Sleep between claims while the queue is empty
    pub poll_interval: Duration,
    /// Auxiliary heartbeat cadence while a handler runs
    pub heartbeat_interval: Duration,
    /// Default per-job timeout; pipelines may override it
    pub job_timeout: Option<Duration>,
    /// How long a stopped handler gets to return before its task is aborted
    pub timeout_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "stagehand-worker".to_string(),
            poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(30),
            job_timeout: None,
            timeout_grace: Duration::from_secs(5),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }

    pub fn with_timeout_grace(mut self, grace: Duration) -> Self {
        self.timeout_grace = grace;
        self
    }
}

/// Counters shared by every worker of a pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub claimed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub waiting: u64,
    pub canceled: u64,
    /// Subset of `failed`.
    pub panicked: u64,
    /// Subset of `failed`.
    pub dispatch_misses: u64,
    pub lost_leases: u64,
}

/// Cancellation tokens of the jobs currently executing in this process.
///
/// Keyed by job id; each entry remembers the attempt that registered it, so
/// a worker whose lease was reclaimed cannot unregister the newer attempt.
#[derive(Debug, Clone, Default)]
pub struct RunningJobs(Arc<Mutex<HashMap<JobId, (u32, CancellationToken)>>>);

impl RunningJobs {
    fn insert(&self, id: JobId, attempt: u32, token: CancellationToken) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, (attempt, token));
    }

    fn remove(&self, id: JobId, attempt: u32) {
        let mut running = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if running.get(&id).is_some_and(|(registered, _)| *registered == attempt) {
            running.remove(&id);
        }
    }

    /// Signal the handler of `id`, if it runs here. Returns whether it did.
    pub fn cancel(&self, id: JobId) -> bool {
        match self.0.lock().unwrap_or_else(PoisonError::into_inner).get(&id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Why a handler was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Timeout,
    Canceled,
}

impl Stop {
    fn stage(self) -> &'static str {
        match self {
            Stop::Timeout => STAGE_TIMEOUT,
            Stop::Canceled => STAGE_CANCELED,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Worker {
    store: Arc<dyn JobStore>,
    registry: Arc<PipelineRegistry>,
    notifier: Arc<dyn JobNotifier>,
    config: WorkerConfig,
    policy: ClaimPolicy,
    shutdown: CancellationToken,
    stats: Arc<Mutex<WorkerStats>>,
    running: RunningJobs,
}

impl Worker {
    pub fn new(store: Arc<dyn JobStore>, registry: Arc<PipelineRegistry>) -> Self {
        Self {
            store,
            registry,
            notifier: Arc::new(NoopNotifier),
            config: WorkerConfig::default(),
            policy: ClaimPolicy::default(),
            shutdown: CancellationToken::new(),
            stats: Arc::new(Mutex::new(WorkerStats::default())),
            running: RunningJobs::default(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn JobNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_policy(mut self, policy: ClaimPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn running_jobs(&self) -> RunningJobs {
        self.running.clone()
    }

    fn record(&self, f: impl FnOnce(&mut WorkerStats)) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }

    /// Poll until the shutdown token fires.
    pub async fn run(&self) {
        info!(worker = %self.config.name, "worker started");

        while !self.shutdown.is_cancelled() {
            match self.tick().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(err) if err.is_transient() => {
                    warn!(worker = %self.config.name, error = %err, "claim failed, retrying");
                }
                Err(err) => {
                    error!(worker = %self.config.name, error = %err, "claim failed");
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!(worker = %self.config.name, "worker stopped");
    }

    /// Claim and run at most one job. `Ok(None)` when nothing was eligible.
    pub async fn tick(&self) -> StoreResult<Option<Outcome>> {
        if self.shutdown.is_cancelled() {
            return Ok(None);
        }
        let Some(job) = self.store.claim_next_runnable(&self.policy).await? else {
            return Ok(None);
        };

        debug!(
            worker = %self.config.name,
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempts,
            "claimed job"
        );
        self.record(|s| s.claimed += 1);

        let token = self.shutdown.child_token();
        self.running.insert(job.id, job.attempts, token.clone());
        let result = self.execute(job.clone(), token).await;
        self.running.remove(job.id, job.attempts);

        let outcome = result?;
        self.count(&job, &outcome).await;
        Ok(Some(outcome))
    }

    async fn execute(&self, job: Job, token: CancellationToken) -> StoreResult<Outcome> {
        let Some(pipeline) = self.registry.get(&job.job_type) else {
            warn!(job_id = %job.id, job_type = %job.job_type, "no pipeline registered");
            self.record(|s| s.dispatch_misses += 1);
            let ctx = self.context(job.clone(), token, false);
            let message = format!("no handler for {}", job.job_type);
            return self.conclude(&ctx, STAGE_DISPATCH, message).await;
        };

        let ctx = self.context(job, token.clone(), pipeline.require_trace());
        let heartbeat = self.spawn_heartbeat(&ctx);
        let result = self.run_pipeline(pipeline, &ctx, &token).await;
        heartbeat.abort();

        if let Some(outcome) = ctx.outcome() {
            return Ok(outcome);
        }

        match result {
            (None, Ok(Ok(()))) => {
                self.conclude(
                    &ctx,
                    STAGE_NO_TERMINAL_CALL,
                    "handler returned without a terminal call",
                )
                .await
            }
            (None, Ok(Err(err))) => {
                let stage = ctx.stage();
                self.conclude(&ctx, &stage, format!("{err:#}")).await
            }
            (Some(stop), Ok(Ok(()))) => {
                self.conclude(&ctx, stop.stage(), stop.stage()).await
            }
            (Some(stop), Ok(Err(err))) => {
                self.conclude(&ctx, stop.stage(), format!("{err:#}")).await
            }
            (stop, Err(join)) => self.conclude_join_error(&ctx, stop, join).await,
        }
    }

    /// Run the pipeline on its own task, stopping it on timeout or
    /// cancellation and aborting it after the grace period.
    async fn run_pipeline(
        &self,
        pipeline: Arc<dyn Pipeline>,
        ctx: &JobContext,
        token: &CancellationToken,
    ) -> (Option<Stop>, Result<anyhow::Result<()>, JoinError>) {
        let timeout = pipeline.timeout().or(self.config.job_timeout);
        let task_ctx = ctx.clone();
        let mut handle: JoinHandle<anyhow::Result<()>> =
            tokio::spawn(async move { pipeline.run(&task_ctx).await });

        let stop = tokio::select! {
            res = &mut handle => {
                // The handler may have returned because the token fired.
                return (token.is_cancelled().then_some(Stop::Canceled), res);
            }
            _ = sleep_opt(timeout) => {
                token.cancel();
                Stop::Timeout
            }
            _ = token.cancelled() => Stop::Canceled,
        };

        warn!(
            job_id = %ctx.id(),
            reason = stop.stage(),
            grace_ms = self.config.timeout_grace.as_millis() as u64,
            "stopping handler"
        );
        match tokio::time::timeout(self.config.timeout_grace, &mut handle).await {
            Ok(res) => (Some(stop), res),
            Err(_) => {
                handle.abort();
                (Some(stop), handle.await)
            }
        }
    }

    async fn conclude_join_error(
        &self,
        ctx: &JobContext,
        stop: Option<Stop>,
        err: JoinError,
    ) -> StoreResult<Outcome> {
        if err.is_panic() {
            let message = panic_message(err.into_panic());
            error!(job_id = %ctx.id(), panic = %message, "handler panicked");
            self.record(|s| s.panicked += 1);
            return self.conclude(ctx, STAGE_PANIC, message).await;
        }
        let stage = stop.unwrap_or(Stop::Canceled).stage();
        self.conclude(ctx, stage, "handler did not stop within grace period")
            .await
    }

    /// Worker-synthesised failure.
    async fn conclude(
        &self,
        ctx: &JobContext,
        stage: &str,
        message: impl std::fmt::Display,
    ) -> StoreResult<Outcome> {
        match ctx.fail(stage, message).await {
            Ok(_) => Ok(ctx.outcome().unwrap_or(Outcome::Superseded)),
            Err(ContextError::Superseded { .. }) => Ok(Outcome::Superseded),
            Err(ContextError::Store(err)) => {
                error!(job_id = %ctx.id(), error = %err, "could not record failure");
                Err(err)
            }
            // A racing terminal call from a handler that outlived its task.
            Err(_) => Ok(ctx.outcome().unwrap_or(Outcome::Superseded)),
        }
    }

    async fn count(&self, job: &Job, outcome: &Outcome) {
        let outcome = match outcome {
            // A supervisor cancel also shows up as a refused write.
            Outcome::Superseded => match self.store.get(job.id).await {
                Ok(Some(row)) if row.status == JobStatus::Canceled => Outcome::Canceled {
                    reason: row.message,
                },
                _ => Outcome::Superseded,
            },
            other => other.clone(),
        };
        self.record(|s| match outcome {
            Outcome::Succeeded => s.succeeded += 1,
            Outcome::Failed { .. } => s.failed += 1,
            Outcome::Waiting { .. } => s.waiting += 1,
            Outcome::Canceled { .. } => s.canceled += 1,
            Outcome::Superseded => s.lost_leases += 1,
        });
    }

    fn context(&self, job: Job, token: CancellationToken, require_trace: bool) -> JobContext {
        JobContext::new(
            job,
            self.store.clone(),
            self.notifier.clone(),
            token,
            require_trace,
        )
    }

    /// Refresh the lease while the handler runs; cancel it once the lease is
    /// gone.
    fn spawn_heartbeat(&self, ctx: &JobContext) -> JoinHandle<()> {
        let store = self.store.clone();
        let ctx = ctx.clone();
        let period = self.config.heartbeat_interval.max(MIN_HEARTBEAT_INTERVAL);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ctx.cancellation().cancelled() => return,
                    _ = ticker.tick() => {}
                }
                if ctx.is_finished() {
                    return;
                }
                match store.heartbeat_lease(ctx.id(), Some(ctx.attempt())).await {
                    Ok(true) => {}
                    Ok(false) => {
                        if !ctx.is_finished() {
                            warn!(job_id = %ctx.id(), attempt = ctx.attempt(), "lease lost");
                            ctx.cancellation().cancel();
                        }
                        return;
                    }
                    Err(err) => {
                        warn!(job_id = %ctx.id(), error = %err, "heartbeat failed");
                    }
                }
            }
        })
    }
}

async fn sleep_opt(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// N workers sharing one store, registry, shutdown token and stats.
#[derive(Debug)]
pub struct WorkerPool;

impl WorkerPool {
    /// Spawn `count` clones of `worker`, named `<name>-<i>`.
    pub fn spawn(worker: Worker, count: usize) -> WorkerPoolHandle {
        let base = worker.config.name.clone();
        let joins = (0..count.max(1))
            .map(|i| {
                let mut w = worker.clone();
                w.config.name = format!("{base}-{i}");
                tokio::spawn(async move { w.run().await })
            })
            .collect();

        WorkerPoolHandle {
            shutdown: worker.shutdown.clone(),
            joins,
            stats: worker.stats.clone(),
            running: worker.running.clone(),
        }
    }
}

/// Handle to control a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: CancellationToken,
    joins: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
    running: RunningJobs,
}

impl WorkerPoolHandle {
    /// Signal every worker (and every running handler) and wait for them.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for join in self.joins {
            if let Err(err) = join.await {
                error!(error = %err, "worker task failed");
            }
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn running_jobs(&self) -> RunningJobs {
        self.running.clone()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobStore;
    use stagehand_core::{Clock, ManualClock, NewJob, OwnerId};

    fn worker(store: &Arc<InMemoryJobStore>, registry: PipelineRegistry) -> Worker {
        Worker::new(store.clone(), Arc::new(registry)).with_config(
            WorkerConfig::default()
                .with_poll_interval(Duration::from_millis(10))
                .with_timeout_grace(Duration::from_millis(50)),
        )
    }

    async fn enqueue(store: &InMemoryJobStore, job_type: &str) -> Job {
        store
            .enqueue(NewJob::new(OwnerId::new(), "material_set", None, job_type))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn empty_queue_yields_nothing() {
        let store = InMemoryJobStore::arc();
        let w = worker(&store, PipelineRegistry::new());
        assert_eq!(w.tick().await.unwrap(), None);
        assert_eq!(w.stats(), WorkerStats::default());
    }

    #[tokio::test]
    async fn handler_error_fails_at_current_stage() {
        let store = InMemoryJobStore::arc();
        let mut registry = PipelineRegistry::new();
        registry
            .register_fn("ingest_chunks", |ctx| async move {
                ctx.progress("embed", 40, "embedding").await?;
                anyhow::bail!("upstream 503")
            })
            .unwrap();
        let job = enqueue(&store, "ingest_chunks").await;

        let outcome = worker(&store, registry).tick().await.unwrap().unwrap();
        assert_eq!(
            outcome,
            Outcome::Failed {
                stage: "embed".to_string(),
                error: "upstream 503".to_string()
            }
        );
        let row = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Failed);
        assert!(row.last_error_at.is_some());
    }

    #[tokio::test]
    async fn shutdown_stops_the_handler() {
        let store = InMemoryJobStore::arc();
        let mut registry = PipelineRegistry::new();
        registry
            .register_fn("slow", |ctx| async move {
                ctx.cancellation().cancelled().await;
                anyhow::bail!("interrupted")
            })
            .unwrap();
        let job = enqueue(&store, "slow").await;
        let w = worker(&store, registry);

        let token = w.shutdown_token().clone();
        let running = w.running_jobs();
        let run = tokio::spawn(async move { w.tick().await });
        while !running.contains(job.id) {
            tokio::task::yield_now().await;
        }
        token.cancel();

        let outcome = run.await.unwrap().unwrap().unwrap();
        assert!(matches!(outcome, Outcome::Failed { ref stage, .. } if stage == STAGE_CANCELED));
        assert!(running.is_empty());
    }

    #[tokio::test]
    async fn pool_drains_the_queue_and_shuts_down() {
        let store = InMemoryJobStore::arc();
        let mut registry = PipelineRegistry::new();
        registry
            .register_fn("ingest_chunks", |ctx| async move {
                ctx.succeed("done", serde_json::json!({})).await?;
                Ok(())
            })
            .unwrap();
        for _ in 0..6 {
            enqueue(&store, "ingest_chunks").await;
        }

        let pool = WorkerPool::spawn(worker(&store, registry), 3);
        for _ in 0..200 {
            if pool.stats().succeeded == 6 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let stats = pool.stats();
        pool.shutdown().await;

        assert_eq!(stats.claimed, 6);
        assert_eq!(stats.succeeded, 6);
    }

    #[tokio::test]
    async fn zero_heartbeat_interval_still_refreshes_the_lease() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(InMemoryJobStore::with_clock(clock.clone()));
        let mut registry = PipelineRegistry::new();
        {
            let store = store.clone();
            let clock = clock.clone();
            registry
                .register_fn("long_running", move |ctx| {
                    let store = store.clone();
                    let clock = clock.clone();
                    async move {
                        clock.advance(chrono::Duration::seconds(10));
                        let mut refreshed = false;
                        for _ in 0..200 {
                            tokio::time::sleep(Duration::from_millis(5)).await;
                            let row = store.get(ctx.id()).await?;
                            if row.and_then(|r| r.heartbeat_at) == Some(clock.now()) {
                                refreshed = true;
                                break;
                            }
                        }
                        ctx.succeed("done", serde_json::json!({ "refreshed": refreshed }))
                            .await?;
                        Ok(())
                    }
                })
                .unwrap();
        }
        let job = enqueue(&store, "long_running").await;
        let w = worker(&store, registry).with_config(
            WorkerConfig::default().with_heartbeat_interval(Duration::ZERO),
        );

        assert_eq!(w.tick().await.unwrap(), Some(Outcome::Succeeded));
        let row = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(row.result["refreshed"], true);
    }

    #[test]
    fn reclaimed_attempt_keeps_its_cancellation_entry() {
        let running = RunningJobs::default();
        let id = JobId::new();
        let stale = CancellationToken::new();
        let current = CancellationToken::new();

        running.insert(id, 1, stale.clone());
        running.insert(id, 2, current.clone());
        running.remove(id, 1);

        assert!(running.contains(id));
        assert!(running.cancel(id));
        assert!(current.is_cancelled());
        assert!(!stale.is_cancelled());

        running.remove(id, 2);
        assert!(running.is_empty());
    }

    #[test]
    fn stats_survive_a_poisoned_lock() {
        let store = InMemoryJobStore::arc();
        let w = worker(&store, PipelineRegistry::new());
        let stats = w.stats.clone();
        let _ = std::thread::spawn(move || {
            let _guard = stats.lock().unwrap();
            panic!("poisoning the stats lock");
        })
        .join();

        w.record(|s| s.claimed += 1);
        assert_eq!(w.stats().claimed, 1);
    }
}
