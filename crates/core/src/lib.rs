//! `stagehand-core`: data model of the durable job runtime.
//!
//! This crate contains **pure** primitives (no IO, no async): the job row,
//! partial updates, typed payload access, the claim eligibility predicate,
//! the waitpoint envelope codec and structural trace entries.

pub mod clock;
pub mod error;
pub mod id;
pub mod job;
pub mod payload;
pub mod policy;
pub mod trace;
pub mod waitpoint;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{JobId, OwnerId, TraceId};
pub use job::{
    DEFAULT_STAGE, EntityKey, Job, JobPatch, JobStatus, MAX_RUNNING_PROGRESS, NewJob, WriteGuard,
    clamp_progress,
};
pub use payload::{Payload, PayloadError};
pub use policy::ClaimPolicy;
pub use trace::{DecisionMode, DecisionPhase, TraceEntry};
pub use waitpoint::{WaitpointEnvelope, WaitpointError, WaitpointSpec, WaitpointState};
