use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use serde_json::json;
use stagehand_core::{
    ClaimPolicy, JobId, JobStatus, NewJob, OwnerId, Payload,
};
use stagehand_infra::jobs::{InMemoryJobStore, JobStore, PipelineRegistry, Worker};
use std::sync::Arc;
use tokio::runtime::Runtime;

fn new_job(owner: OwnerId) -> NewJob {
    NewJob::new(owner, "material_set", None, "ingest_chunks")
        .with_payload(Payload::new().with("material_set_id", "m-1"))
}

/// Store with `pending` queued rows plus as many ineligible ones mixed in.
fn seeded_store(pending: usize) -> Arc<InMemoryJobStore> {
    let store = InMemoryJobStore::arc();
    let owner = OwnerId::new();
    for i in 0..pending * 2 {
        let mut job = new_job(owner)
            .into_job(JobId::new(), store.now())
            .unwrap();
        if i % 2 == 1 {
            job.status = JobStatus::WaitingUser;
        }
        store.put(job).unwrap();
    }
    store
}

fn bench_enqueue(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let store = InMemoryJobStore::arc();
    let owner = OwnerId::new();

    c.bench_function("enqueue", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(store.enqueue(new_job(owner)).await.unwrap()) })
    });
}

fn bench_claim(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("claim_next_runnable");

    for backlog in [10usize, 100, 1_000] {
        group.throughput(Throughput::Elements(backlog as u64));
        group.bench_with_input(BenchmarkId::from_parameter(backlog), &backlog, |b, &n| {
            b.to_async(&rt).iter_batched(
                || seeded_store(n),
                |store| async move {
                    let policy = ClaimPolicy::default();
                    while let Some(job) = store.claim_next_runnable(&policy).await.unwrap() {
                        black_box(job);
                    }
                },
                criterion::BatchSize::LargeInput,
            )
        });
    }
    group.finish();
}

fn bench_worker_tick(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut registry = PipelineRegistry::new();
    registry
        .register_fn("ingest_chunks", |ctx| async move {
            ctx.progress("ingest", 50, "halfway").await?;
            ctx.succeed("done", json!({"ok": true})).await?;
            Ok(())
        })
        .unwrap();
    let registry = Arc::new(registry);

    c.bench_function("worker_tick_succeed", |b| {
        b.to_async(&rt).iter_batched(
            || Worker::new(seeded_store(1), registry.clone()),
            |worker| async move { black_box(worker.tick().await.unwrap()) },
            criterion::BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_enqueue, bench_claim, bench_worker_tick);
criterion_main!(benches);
