//! dockyard-reaper - removes a crashed session's containers and networks.
//!
//! Runs inside the sidecar container with the engine socket mounted.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use dockyard::engine::{ContainerEngine, DockerEngine};
use dockyard_reaper::{ReaperServer, ServerConfig};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(name = "dockyard-reaper")]
#[command(about = "Removes containers and networks of disconnected sessions")]
#[command(version)]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "REAPER_LISTEN", default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Seconds to wait after a disconnect before sweeping
    #[arg(long, env = "REAPER_GRACE_PERIOD_SECS", default_value_t = 10)]
    grace_period: u64,

    /// Exit if no client connects within this many seconds
    #[arg(long, env = "REAPER_CONNECTION_TIMEOUT_SECS", default_value_t = 60)]
    connection_timeout: u64,

    /// Exit after this many idle seconds
    #[arg(long, env = "REAPER_SHUTDOWN_TIMEOUT_SECS", default_value_t = 600)]
    shutdown_timeout: u64,

    /// Emit JSON logs
    #[arg(long, env = "REAPER_LOG_JSON")]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::from_default_env().add_directive("dockyard_reaper=info".parse()?);
    if cli.json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    let config = ServerConfig::new(cli.listen)
        .with_grace_period(Duration::from_secs(cli.grace_period))
        .with_connection_timeout(Duration::from_secs(cli.connection_timeout))
        .with_shutdown_timeout(Duration::from_secs(cli.shutdown_timeout));

    let engine = DockerEngine::connect()?;
    engine.ping().await?;
    info!(host = %engine.host(), "connected to container engine");

    let server = ReaperServer::bind(config, Arc::new(engine)).await?;
    let outcome = server.serve_until(shutdown_signal()).await?;
    info!(?outcome, "reaper stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
