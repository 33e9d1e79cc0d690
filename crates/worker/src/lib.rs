//! Worker process: runs the job runtime against Postgres until shut down.

use std::future::Future;
use std::sync::Arc;

use tracing::info;

use stagehand_events::JobNotifier;
use stagehand_infra::RuntimeConfig;
use stagehand_infra::jobs::{PipelineRegistry, PostgresJobStore, Worker, WorkerPool};

pub mod echo;

/// Pipelines shipped with the runtime itself.
pub fn builtin_registry() -> anyhow::Result<PipelineRegistry> {
    let mut registry = PipelineRegistry::new();
    registry.register(echo::EchoPipeline)?;
    Ok(registry)
}

#[cfg(feature = "redis")]
fn notifier(config: &RuntimeConfig) -> anyhow::Result<Arc<dyn JobNotifier>> {
    use stagehand_events::{BusNotifier, NoopNotifier};
    use stagehand_infra::notify::RedisPubSubEventBus;

    Ok(match &config.redis_url {
        Some(url) => Arc::new(BusNotifier::new(RedisPubSubEventBus::new(url)?)),
        None => Arc::new(NoopNotifier),
    })
}

#[cfg(not(feature = "redis"))]
fn notifier(config: &RuntimeConfig) -> anyhow::Result<Arc<dyn JobNotifier>> {
    if config.redis_url.is_some() {
        tracing::warn!("REDIS_URL set but built without the `redis` feature; notifications disabled");
    }
    Ok(Arc::new(stagehand_events::NoopNotifier))
}

/// Connect, install the schema, run the pool until `shutdown` resolves.
pub async fn run<S>(config: RuntimeConfig, shutdown: S) -> anyhow::Result<()>
where
    S: Future<Output = ()>,
{
    let max_connections = u32::try_from(config.worker_count + 2).unwrap_or(u32::MAX);
    let store = PostgresJobStore::connect(&config.database_url, max_connections).await?;
    store.install_schema().await?;

    let registry = Arc::new(builtin_registry()?);
    info!(job_types = ?registry.job_types(), "pipelines registered");

    let worker = Worker::new(Arc::new(store), registry)
        .with_notifier(notifier(&config)?)
        .with_config(config.worker.clone())
        .with_policy(config.policy);
    let pool = WorkerPool::spawn(worker, config.worker_count);
    info!(workers = config.worker_count, "worker pool started");

    shutdown.await;
    info!("shutdown requested");

    let stats = pool.stats();
    pool.shutdown().await;
    info!(?stats, "worker pool stopped");
    Ok(())
}
