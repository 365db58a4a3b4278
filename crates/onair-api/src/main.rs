use onair_core::Config;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let config = Config::from_env()?;

    let (_state, router, workers) = onair_api::setup::initialize_app(config.clone()).await?;

    onair_api::setup::server::start_server(&config, router).await?;

    // In-flight pipeline runs finish before the process exits.
    workers.shutdown().await;

    Ok(())
}
