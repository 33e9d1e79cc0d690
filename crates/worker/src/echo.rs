//! `runtime.echo`: diagnostic pipeline for deployments.
//!
//! Echoes its payload into `result`. With `wait_thread_id` in the payload it
//! first suspends once on a waitpoint correlated to that thread, which
//! exercises the resume path end to end.

use async_trait::async_trait;
use serde_json::json;

use stagehand_core::{WaitpointSpec, WaitpointState};
use stagehand_infra::jobs::{JobContext, Pipeline};

pub const JOB_TYPE: &str = "runtime.echo";
pub const WAITPOINT_KIND: &str = "runtime.echo_v1";
const STEP: &str = "echo";

#[derive(Debug, Clone, Copy, Default)]
pub struct EchoPipeline;

#[async_trait]
impl Pipeline for EchoPipeline {
    fn job_type(&self) -> &str {
        JOB_TYPE
    }

    async fn run(&self, ctx: &JobContext) -> anyhow::Result<()> {
        let resumed = ctx
            .job()
            .waitpoint()?
            .is_some_and(|w| w.spec.kind == WAITPOINT_KIND && w.spec.step == STEP);

        if !resumed {
            if let Some(thread_id) = ctx.payload().opt_str("wait_thread_id")? {
                let min_seq = ctx.payload().opt_int("wait_min_seq")?.unwrap_or(0);
                ctx.wait_for_user(
                    "waiting_user",
                    50,
                    "waiting for a reply",
                    WaitpointSpec::new(WAITPOINT_KIND, STEP).correlated(thread_id, min_seq),
                    WaitpointState::new("awaiting_reply"),
                    json!({}),
                )
                .await?;
                return Ok(());
            }
        }

        if ctx.is_cancelled() {
            ctx.fail("canceled", "worker shutting down").await?;
            return Ok(());
        }

        ctx.progress(STEP, 50, "echoing payload").await?;
        ctx.succeed(
            "done",
            json!({
                "echo": ctx.payload().to_value(),
                "attempt": ctx.attempt(),
                "resumed": resumed,
            }),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use stagehand_core::{JobStatus, NewJob, OwnerId, Payload};
    use stagehand_infra::jobs::{InMemoryJobStore, JobStore, Outcome, Supervisor, Worker};

    use super::*;
    use crate::builtin_registry;

    fn worker(store: &Arc<InMemoryJobStore>) -> Worker {
        Worker::new(store.clone(), Arc::new(builtin_registry().unwrap()))
    }

    #[tokio::test]
    async fn echoes_the_payload() {
        let store = InMemoryJobStore::arc();
        let job = store
            .enqueue(
                NewJob::new(OwnerId::new(), "diagnostic", None, JOB_TYPE)
                    .with_payload(Payload::new().with("hello", "world")),
            )
            .await
            .unwrap();

        assert_eq!(worker(&store).tick().await.unwrap(), Some(Outcome::Succeeded));
        let row = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(row.result["echo"]["hello"], "world");
        assert_eq!(row.result["resumed"], false);
    }

    #[tokio::test]
    async fn suspends_once_then_finishes_after_resume() {
        let store = InMemoryJobStore::arc();
        let job = store
            .enqueue(
                NewJob::new(OwnerId::new(), "diagnostic", None, JOB_TYPE).with_payload(
                    Payload::new()
                        .with("wait_thread_id", "T")
                        .with("wait_min_seq", 7),
                ),
            )
            .await
            .unwrap();
        let worker = worker(&store);

        worker.tick().await.unwrap();
        let row = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::WaitingUser);

        Supervisor::new(store.clone())
            .resume(job.id, "T", 8)
            .await
            .unwrap();
        assert_eq!(worker.tick().await.unwrap(), Some(Outcome::Succeeded));

        let row = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(row.attempts, 2);
        assert_eq!(row.result["resumed"], true);
    }
}
