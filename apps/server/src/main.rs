//! Listen Server - standalone headless coordinator for Listen Together.
//!
//! Runs the session coordinator with in-memory collaborators seeded from
//! the YAML config (users, groups, tracks). Production deployments embed
//! `listen-core` next to the real database-backed collaborators instead;
//! this binary is the single-service form for small installs and load
//! tests.

mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use listen_core::{
    bootstrap_services, start_server, Collaborators, InMemoryCatalog, InMemoryMembership,
    InMemoryUserDirectory,
};
use tokio::signal;

use crate::config::ServerConfig;

/// Listen Server - real-time shared playback coordinator.
#[derive(Parser, Debug)]
#[command(name = "listen-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "LISTEN_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Bind port (overrides config file).
    #[arg(short = 'p', long, env = "LISTEN_BIND_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Listen Server v{}", env!("CARGO_PKG_VERSION"));

    let mut server_config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(port) = args.port {
        server_config.bind_port = port;
    }

    // Seed the in-memory collaborators from the config file
    let directory = Arc::new(InMemoryUserDirectory::new());
    for user in server_config.seed_users() {
        directory.insert(user);
    }
    let membership = Arc::new(InMemoryMembership::new());
    for group_id in &server_config.groups {
        membership.create_group(group_id);
    }
    let catalog = Arc::new(InMemoryCatalog::new());
    for track in &server_config.tracks {
        catalog.insert(track.clone());
    }
    log::info!(
        "Seeded {} user(s), {} group(s), {} track(s)",
        server_config.users.len(),
        server_config.groups.len(),
        server_config.tracks.len()
    );
    if server_config.users.is_empty() {
        log::warn!("No users configured - every handshake will be refused");
    }

    let core_config = server_config.to_core_config();
    let services = bootstrap_services(
        &core_config,
        Collaborators {
            directory,
            membership,
            catalog,
        },
    )
    .await
    .context("Failed to bootstrap services")?;

    log::info!("Services bootstrapped successfully");

    let addr = SocketAddr::new(server_config.bind_addr, server_config.bind_port);
    let app_state = services.app_state.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(app_state, addr).await {
            log::error!("Server error: {}", e);
        }
    });

    log::info!("Coordinator listening on {}", addr);

    shutdown_signal().await;
    log::info!("Shutdown signal received, cleaning up...");

    services.shutdown().await;
    server_handle.abort();

    log::info!("Shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
