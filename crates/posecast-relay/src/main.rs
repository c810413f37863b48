#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use posecast_relay::config::{Args, ServerConfig};
use posecast_relay::console::run_console;
use posecast_relay::metrics::{start_metrics_server, HealthState};
use posecast_relay::{run_with_shutdown, RelayState};
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        })
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let no_console = args.no_console;
    let config: ServerConfig = args.into();

    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {}", e);
    }

    let state = Arc::new(RelayState::new(config.clone()));

    let listener = TcpListener::bind(config.listen).await?;
    info!("bound to {}", config.listen);

    let health_state = HealthState::new();

    tokio::spawn({
        let health_state = health_state.clone();
        let state = Arc::clone(&state);
        async move {
            if let Err(e) = start_metrics_server(config.metrics_addr, health_state, state).await {
                warn!("metrics server error: {}", e);
            }
        }
    });

    if !no_console {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let stdin = BufReader::new(tokio::io::stdin());
            if let Err(e) = run_console(state, stdin, tokio::io::stdout()).await {
                warn!("operator console error: {}", e);
            }
        });
        info!("operator console ready, type `help` for commands");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn({
        let health_state = health_state.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received shutdown signal");
            }
            health_state.set_ready(false);
            let _ = shutdown_tx.send(true);
        }
    });

    if let Err(e) = run_with_shutdown(listener, state, shutdown_rx).await {
        tracing::error!("server error: {}", e);
    }

    Ok(())
}
