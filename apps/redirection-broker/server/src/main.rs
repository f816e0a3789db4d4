use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use redirection_core::EndpointId;
use redirection_server::admin::{self, AdminState};
use redirection_server::config::{Cli, Command, ServerConfig};
use redirection_server::telemetry::Telemetry;
use redirection_server::{RedirectionService, StaticDirectory, TcpConnector};
use tokio::io::AsyncWriteExt;
use tokio::signal;
use tokio::time::{timeout_at, Instant};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(&cli)?;
    let directory = StaticDirectory::load(&config.directory).with_context(|| {
        format!(
            "failed to load endpoint directory {}",
            config.directory.display()
        )
    })?;
    info!(
        directory = %config.directory.display(),
        endpoints = directory.len(),
        kind = %config.service.kind,
        "loaded endpoint directory"
    );

    let service = RedirectionService::new(
        Arc::new(directory),
        Arc::new(TcpConnector),
        config.service.clone(),
    );

    match cli.command.clone().unwrap_or(Command::Serve) {
        Command::Serve => serve(config, service, telemetry.metrics_handle()).await,
        Command::Probe {
            endpoint,
            hold_secs,
        } => probe(service, EndpointId::new(endpoint), Duration::from_secs(hold_secs)).await,
    }
}

async fn serve(
    config: ServerConfig,
    service: RedirectionService,
    metrics: PrometheusHandle,
) -> Result<()> {
    let reaper = service.spawn_idle_reaper();
    let state = Arc::new(AdminState {
        service: service.clone(),
        metrics,
    });

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind admin listener")?;
    info!("redirection-server admin listening on {}", config.listen_addr);

    axum::serve(listener, admin::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    reaper.abort();
    let closed = service.close_all().await;
    info!(
        closed,
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

async fn probe(service: RedirectionService, endpoint_id: EndpointId, hold: Duration) -> Result<()> {
    let handle = service.open(&endpoint_id).await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&handle).context("failed to render session handle")?
    );

    let deadline = Instant::now() + hold;
    let mut stdout = tokio::io::stdout();
    while !hold.is_zero() {
        match timeout_at(deadline, service.receive(&endpoint_id)).await {
            Ok(Ok(data)) => {
                stdout.write_all(&data).await?;
                stdout.flush().await?;
            }
            Ok(Err(err)) => {
                warn!(endpoint_id = %endpoint_id, error = %err, "probe stopped reading");
                break;
            }
            Err(_) => break,
        }
    }

    service.close(&endpoint_id).await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
