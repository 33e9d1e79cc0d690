use stagehand_infra::RuntimeConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    stagehand_observability::init();

    let config = RuntimeConfig::from_env()?;
    stagehand_worker::run(config, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
        }
    })
    .await
}
