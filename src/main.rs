use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use pggate::config::{normalize_addr, Config};
use pggate::listener::Server;
use pggate::metrics::{self, Metrics};
use pggate::pool::PoolManager;
use pggate::Result;

#[derive(Parser, Debug)]
#[command(name = "pggate", version, about = "Read/write-splitting PostgreSQL gateway")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if let Err(err) = run(args).await {
        error!(%err, "fatal");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let config = Config::load(&args.config)?;
    info!(path = %args.config.display(), "configuration loaded");

    let metrics = Arc::new(Metrics::default());

    let replicas = config.replica_addresses();
    let pools = Arc::new(
        PoolManager::new(
            &config.backend.primary.address,
            &replicas,
            config.pool.primary_size,
            config.pool.replica_size,
            config.pool.idle_timeout,
        )
        .await,
    );

    if let Some(address) = config.metrics.address.clone() {
        let metrics = Arc::clone(&metrics);
        tokio::spawn(async move {
            let address = normalize_addr(&address);
            if let Err(err) = metrics::serve(&address, metrics).await {
                error!(%err, "metrics endpoint failed");
            }
        });
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(handle_signals(shutdown_tx, args.config.clone()));

    info!(
        primary = %config.backend.primary.address,
        replicas = ?replicas,
        "pggate starting"
    );

    let server = Server::bind(
        config.listener.clone(),
        Arc::clone(&pools),
        Arc::clone(&metrics),
    )
    .await?;
    server.run(shutdown_rx).await?;

    pools.close();
    info!("shut down");
    Ok(())
}

/// SIGINT/SIGTERM begin a graceful shutdown; SIGHUP re-reads the
/// configuration file and logs the outcome.
async fn handle_signals(shutdown: watch::Sender<bool>, config_path: PathBuf) {
    use tokio::signal::unix::{signal, SignalKind};

    let Ok(mut interrupt) = signal(SignalKind::interrupt()) else {
        error!("failed to install the interrupt handler");
        return;
    };
    let Ok(mut terminate) = signal(SignalKind::terminate()) else {
        error!("failed to install the terminate handler");
        return;
    };
    let Ok(mut hangup) = signal(SignalKind::hangup()) else {
        error!("failed to install the hangup handler");
        return;
    };

    loop {
        tokio::select! {
            _ = interrupt.recv() => {
                info!("interrupt received, shutting down");
                let _ = shutdown.send(true);
                return;
            }
            _ = terminate.recv() => {
                info!("terminate received, shutting down");
                let _ = shutdown.send(true);
                return;
            }
            _ = hangup.recv() => match Config::load(&config_path) {
                Ok(_) => info!("configuration re-read; restart to apply changes"),
                Err(err) => warn!(%err, "configuration reload failed"),
            },
        }
    }
}
