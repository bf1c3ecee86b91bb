use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info};

use vitrine_gateway::{
    cli::{self, Cli, Commands},
    config::GatewayConfig,
    serve, telemetry, AppState,
};

#[tokio::main]
async fn main() -> Result<()> {
    let metrics = telemetry::init()?;

    let mut cli = Cli::parse();
    if let Some(Commands::Watch {
        url,
        tenant,
        token,
        duration,
    }) = cli.command.take()
    {
        if let Err(err) = cli::run_watch(url, tenant, token, duration).await {
            error!(error = %err, "watch client failed");
            std::process::exit(1);
        }
        return Ok(());
    }

    let config = GatewayConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        auth_base = %config.auth_base,
        media_url = config.media_url.as_deref().unwrap_or("in-memory"),
        agents = config.agents.len(),
        ingest_auth = config.require_ingest_auth,
        "starting vitrine gateway"
    );

    let state = AppState::from_config(&config)?.with_metrics(metrics);
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("vitrine gateway listening on {}", config.listen_addr);

    serve(listener, state, shutdown_signal(), config.shutdown_grace).await?;
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
    info!("shutdown signal received");
}
