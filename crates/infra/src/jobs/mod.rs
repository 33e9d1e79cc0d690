//! Durable job runtime.
//!
//! ## Design
//!
//! - One row per job; the row is the source of truth
//! - Claims use a skip-locked row lock so N workers never share an attempt
//! - Retry gating and stale-lease reclaim are part of the claim predicate
//! - Handlers suspend by writing a waitpoint envelope and releasing the lease
//! - Every context write is guarded by the lease it was claimed under
//!
//! ## Components
//!
//! - `JobStore`: persistence (in-memory or Postgres)
//! - `JobContext`: per-attempt handle passed to handlers
//! - `PipelineRegistry`: `job_type` → `Pipeline`
//! - `Worker` / `WorkerPool`: claim loop with heartbeat, timeout and panic guard
//! - `Supervisor`: cancel, waitpoint resume gate, owner purge

pub mod context;
pub mod postgres;
pub mod registry;
mod sql;
pub mod store;
pub mod supervisor;
pub mod worker;

pub use context::{ContextError, JobContext, Outcome};
pub use postgres::PostgresJobStore;
pub use registry::{Pipeline, PipelineFn, PipelineRegistry, RegistryError};
pub use store::{InMemoryJobStore, JobStats, JobStore, StoreError, StoreResult};
pub use supervisor::{ResumeError, Supervisor};
pub use worker::{
    RunningJobs, STAGE_CANCELED, STAGE_DISPATCH, STAGE_NO_TERMINAL_CALL, STAGE_PANIC,
    STAGE_TIMEOUT, Worker, WorkerConfig, WorkerPool, WorkerPoolHandle, WorkerStats,
};
