//! Publicly-reachable side of the reverse tunnel: accepts agent control
//! connections on `server_bind:server_port`, registers their services, and
//! relays public traffic to whichever agent is currently holding each
//! `service_id` (spec §1, §4.5, §4.6).

mod config;
mod control;
mod error;
mod proxy_tcp;
mod proxy_udp;
mod registry;
mod service;
mod user_conn;

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Cli;
use crate::registry::ServiceRegistry;
use crate::service::bind_tuned_udp;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnel_broker=info".into()),
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

    let bind_addr = format!("{}:{}", cfg.server_bind, cfg.server_port);
    let udp_control = match bind_addr
        .parse()
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad bind address"))
        .and_then(bind_tuned_udp)
    {
        Ok(socket) => Arc::new(socket),
        Err(err) => {
            error!(%err, %bind_addr, "failed to bind shared udp control socket");
            std::process::exit(1);
        }
    };

    info!(%bind_addr, "starting tunnel-broker");

    let registry = Arc::new(ServiceRegistry::new());
    let shutdown = CancellationToken::new();

    let control_server = tokio::spawn(control::run_control_server(
        Arc::clone(&cfg),
        Arc::clone(&registry),
        Arc::clone(&udp_control),
        shutdown.child_token(),
    ));
    let udp_reader = tokio::spawn(control::run_udp_control_reader(
        Arc::clone(&udp_control),
        Arc::clone(&cfg),
        Arc::clone(&registry),
        shutdown.child_token(),
    ));

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");
    shutdown.cancel();

    match control_server.await {
        Ok(Err(err)) => error!(%err, "control server exited with an error"),
        Err(err) => error!(%err, "control server task panicked"),
        Ok(Ok(())) => {}
    }
    match udp_reader.await {
        Ok(Err(err)) => error!(%err, "udp control reader exited with an error"),
        Err(err) => error!(%err, "udp control reader task panicked"),
        Ok(Ok(())) => {}
    }
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
