use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tracing::{error, info};

use mesh_road::{
    cli::{self, Cli, Commands},
    config::Config,
    Registry,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Default to WARN level if RUST_LOG is not set
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "warn");
    }
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Some(Commands::Watch { url, count }) = cli.command {
        if let Err(e) = cli::run_watch_client(url, count).await {
            error!("Watch client error: {}", e);
            std::process::exit(1);
        }
        return Ok(());
    }

    let config = Config::from_env().with_cli(&cli);
    info!("Starting mesh-road relay on {}", config.listen_addr());
    info!(
        "Heartbeat sweep every {}s, timeout {}s",
        config.heartbeat_interval_seconds, config.heartbeat_timeout_seconds
    );

    let metrics = if config.metrics_enabled {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("failed to install Prometheus metrics recorder")?;
        Some(handle)
    } else {
        None
    };

    let registry = Registry::spawn(config.registry());
    let app = mesh_road::router(registry, metrics);

    let listener = tokio::net::TcpListener::bind(config.listen_addr())
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr()))?;
    info!("mesh-road listening on {}", config.listen_addr());

    mesh_road::serve(listener, app, shutdown_signal())
        .await
        .context("server shutdown with error")?;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
