//! NAT-side agent: dials out to a `tunnel-broker`, registers local services,
//! and relays tunneled traffic to them (spec §1, §4.3, §4.4).

mod config;
mod control;
mod error;
mod tunnel_tcp;
mod tunnel_udp;

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Cli;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnel_agent=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let cfg = match cli.resolve() {
        Ok(cfg) => Arc::new(cfg),
        Err(err) => {
            error!(%err, "invalid configuration");
            std::process::exit(1);
        }
    };

    info!(
        server = %cfg.server_addr(),
        services = cfg.services.len(),
        "starting tunnel-agent",
    );

    let shutdown = CancellationToken::new();
    let supervisor = tokio::spawn(control::run_supervisor(Arc::clone(&cfg), shutdown.clone()));

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");
    shutdown.cancel();
    let _ = supervisor.await;
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
