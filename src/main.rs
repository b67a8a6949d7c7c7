use anyhow::Context;
use clap::Parser;
use docvault::{api, config, logging, service::RagService};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Session-scoped document ingestion and retrieval server.
#[derive(Parser)]
#[command(name = "docvault", version, about)]
struct Cli {
    /// Port to bind instead of `SERVER_PORT` or the 4100-4199 scan.
    #[arg(long)]
    port: Option<u16>,
    /// Root directory for session storage (overrides `SESSION_STORAGE_DIR`).
    #[arg(long)]
    storage_dir: Option<PathBuf>,
    /// Seconds of inactivity before a session is reaped (overrides `SESSION_INACTIVITY_SECS`).
    #[arg(long)]
    inactivity_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    config::init_config(|config| {
        if let Some(port) = cli.port {
            config.server_port = Some(port);
        }
        if let Some(dir) = cli.storage_dir {
            config.storage_dir = dir;
        }
        if let Some(secs) = cli.inactivity_secs {
            config.reaper.inactivity_threshold = Duration::from_secs(secs);
        }
    });
    logging::init_tracing();

    let config = config::get_config();
    let service = Arc::new(
        RagService::new(config)
            .await
            .context("Failed to initialize session service")?,
    );

    let shutdown = CancellationToken::new();
    let reaper = service.reaper().spawn(shutdown.clone());
    let app = api::create_router(Arc::clone(&service));

    let (listener, port) = bind_listener().await.context("Failed to bind listener")?;
    tracing::info!("Listening on http://0.0.0.0:{}", port);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .context("HTTP server failed")?;

    shutdown.cancel();
    reaper.await.context("Reaper task panicked")?;
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(error) = result {
                tracing::warn!(error = %error, "Failed to listen for Ctrl-C");
            }
            tracing::info!("Shutdown requested");
        }
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();
}

async fn bind_listener() -> Result<(TcpListener, u16), std::io::Error> {
    use std::net::Ipv4Addr;

    let config = config::get_config();
    if let Some(port) = config.server_port {
        return TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .map(|listener| (listener, port));
    }

    const PORT_RANGE: std::ops::RangeInclusive<u16> = 4100..=4199;
    for port in PORT_RANGE {
        match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            Ok(listener) => {
                tracing::debug!(port, "Bound server port");
                return Ok((listener, port));
            }
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::debug!(port, "Port already in use; trying next");
                continue;
            }
            Err(err) => return Err(err),
        }
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::AddrNotAvailable,
        "No available port found in range 4100-4199",
    ))
}
