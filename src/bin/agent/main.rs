use anyhow::Result;
use clap::Parser;
use dotenvy::dotenv;
use tracing::info;
use tracing_subscriber::EnvFilter;

use execution_web_agent::{AgentConfig, ChromeDriver, Dispatcher, HttpBackend};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let config = AgentConfig::parse();
    info!(backend = %config.backend_url, "starting execution agent");

    let backend = HttpBackend::new(&config)?;
    let driver = ChromeDriver::new(&config);
    let mut dispatcher = Dispatcher::new(&config, backend, Box::new(driver));

    dispatcher
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("cannot listen for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
            info!("interrupt received");
        })
        .await;

    info!("agent stopped");
    Ok(())
}
