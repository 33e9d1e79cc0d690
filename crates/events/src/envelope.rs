use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use stagehand_core::{Job, JobId, OwnerId};

/// Envelope for an outbound event, carrying owner + job metadata.
///
/// Notes:
/// - **Owner scoping** is carried here via `owner_user_id`; transports route on it.
/// - `attempt` lets observers discard events from a superseded attempt.
/// - `payload` is the event body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: Uuid,
    owner_user_id: OwnerId,

    job_id: JobId,
    job_type: String,
    attempt: u32,

    occurred_at: DateTime<Utc>,

    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn new(
        event_id: Uuid,
        owner_user_id: OwnerId,
        job_id: JobId,
        job_type: impl Into<String>,
        attempt: u32,
        occurred_at: DateTime<Utc>,
        payload: E,
    ) -> Self {
        Self {
            event_id,
            owner_user_id,
            job_id,
            job_type: job_type.into(),
            attempt,
            occurred_at,
            payload,
        }
    }

    /// Envelope addressed from a job snapshot.
    pub fn for_job(job: &Job, occurred_at: DateTime<Utc>, payload: E) -> Self {
        Self::new(
            Uuid::now_v7(),
            job.owner_user_id,
            job.id,
            job.job_type.clone(),
            job.attempts,
            occurred_at,
            payload,
        )
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn owner_user_id(&self) -> OwnerId {
        self.owner_user_id
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}
