//! Outbound job notifications.
//!
//! The job context calls a `JobNotifier` after every state-changing write.
//! Delivery is best-effort: a failed emit never fails the transition, the
//! caller logs it and moves on.

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;

use stagehand_core::{Job, WaitpointSpec};

use crate::bus::EventBus;
use crate::envelope::EventEnvelope;
use crate::event::JobEvent;

pub type JobEventEnvelope = EventEnvelope<JobEvent>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NotifyError {
    #[error("publish failed: {0}")]
    Publish(String),

    #[error("encode failed: {0}")]
    Encode(String),
}

/// Narrow outbound sink; implementors only provide `emit`.
pub trait JobNotifier: Send + Sync + core::fmt::Debug {
    fn emit(&self, envelope: JobEventEnvelope) -> Result<(), NotifyError>;

    fn progress(
        &self,
        job: &Job,
        stage: &str,
        progress: u8,
        message: &str,
        at: DateTime<Utc>,
    ) -> Result<(), NotifyError> {
        self.emit(EventEnvelope::for_job(
            job,
            at,
            JobEvent::Progress {
                stage: stage.to_string(),
                progress,
                message: message.to_string(),
            },
        ))
    }

    fn done(&self, job: &Job, result: &JsonValue, at: DateTime<Utc>) -> Result<(), NotifyError> {
        self.emit(EventEnvelope::for_job(
            job,
            at,
            JobEvent::Done {
                result: result.clone(),
            },
        ))
    }

    fn failed(
        &self,
        job: &Job,
        stage: &str,
        message: &str,
        at: DateTime<Utc>,
    ) -> Result<(), NotifyError> {
        self.emit(EventEnvelope::for_job(
            job,
            at,
            JobEvent::Failed {
                stage: stage.to_string(),
                message: message.to_string(),
            },
        ))
    }

    fn waiting(
        &self,
        job: &Job,
        stage: &str,
        spec: &WaitpointSpec,
        at: DateTime<Utc>,
    ) -> Result<(), NotifyError> {
        self.emit(EventEnvelope::for_job(
            job,
            at,
            JobEvent::Waiting {
                stage: stage.to_string(),
                spec: spec.clone(),
            },
        ))
    }

    fn canceled(&self, job: &Job, reason: &str, at: DateTime<Utc>) -> Result<(), NotifyError> {
        self.emit(EventEnvelope::for_job(
            job,
            at,
            JobEvent::Canceled {
                reason: reason.to_string(),
            },
        ))
    }
}

impl<N> JobNotifier for std::sync::Arc<N>
where
    N: JobNotifier + ?Sized,
{
    fn emit(&self, envelope: JobEventEnvelope) -> Result<(), NotifyError> {
        (**self).emit(envelope)
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl JobNotifier for NoopNotifier {
    fn emit(&self, _envelope: JobEventEnvelope) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Publishes onto any [`EventBus`] carrying job event envelopes.
#[derive(Debug)]
pub struct BusNotifier<B> {
    bus: B,
}

impl<B> BusNotifier<B> {
    pub fn new(bus: B) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }
}

impl<B> JobNotifier for BusNotifier<B>
where
    B: EventBus<JobEventEnvelope> + core::fmt::Debug,
{
    fn emit(&self, envelope: JobEventEnvelope) -> Result<(), NotifyError> {
        self.bus
            .publish(envelope)
            .map_err(|e| NotifyError::Publish(format!("{e:?}")))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use serde_json::json;
    use stagehand_core::{JobId, NewJob, OwnerId, WaitpointSpec};

    use super::*;
    use crate::in_memory_bus::InMemoryEventBus;
    use crate::owner::OwnerScoped;

    fn job() -> Job {
        NewJob::new(OwnerId::new(), "material_set", None, "ingest_chunks")
            .into_job(JobId::new(), Utc::now())
            .unwrap()
    }

    #[test]
    fn bus_notifier_publishes_addressed_envelopes() {
        let bus = Arc::new(InMemoryEventBus::<JobEventEnvelope>::new());
        let sub = bus.subscribe();
        let notifier = BusNotifier::new(bus.clone());
        let job = job();
        let now = Utc::now();

        notifier.progress(&job, "ingest", 2, "reading files", now).unwrap();
        notifier.done(&job, &json!({"files_processed": 3}), now).unwrap();

        let events = sub.drain();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.is_owned_by(job.owner_user_id)));
        assert_eq!(events[0].job_id(), job.id);
        assert_eq!(events[0].payload().event_type(), "job.progress");
        assert_eq!(
            events[1].payload(),
            &JobEvent::Done {
                result: json!({"files_processed": 3})
            }
        );
    }

    #[test]
    fn waiting_event_carries_the_spec() {
        let bus = Arc::new(InMemoryEventBus::<JobEventEnvelope>::new());
        let sub = bus.subscribe();
        let notifier = BusNotifier::new(bus);
        let spec = WaitpointSpec::new("yaml_intent_v1", "path_intake").correlated("T", 7);

        notifier
            .waiting(&job(), "waiting_user", &spec, Utc::now())
            .unwrap();

        match sub.try_recv().unwrap().into_payload() {
            JobEvent::Waiting { spec: got, .. } => assert_eq!(got, spec),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn events_serialize_with_kind_tag() {
        let value = serde_json::to_value(JobEvent::Failed {
            stage: "embed".into(),
            message: "upstream 503".into(),
        })
        .unwrap();
        assert_eq!(
            value,
            json!({"kind": "failed", "stage": "embed", "message": "upstream 503"})
        );
    }
}
