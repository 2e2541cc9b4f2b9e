mod api;
mod config;
mod hub;
mod remote;
mod services;
mod telemetry;
mod types;

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use api::nodes::AppState;
use config::Config;
use hub::NotificationHub;
use remote::{SessionPool, SshConnector};
use services::{keepalive_worker, prune_worker, save_worker, NodeRegistry, RegistrySettings};

#[derive(Parser, Debug)]
#[command(name = "meshfleet-control")]
#[command(about = "Mesh fleet controller", long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Bind address for HTTP server, overrides the config file
    #[arg(long)]
    bind: Option<String>,

    /// State file path, overrides the config file
    #[arg(long)]
    state_path: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting mesh fleet controller");

    let mut cfg = Config::load(&args.config)?;
    if let Some(bind) = args.bind {
        cfg.bind = bind;
    }
    if let Some(state_path) = args.state_path {
        cfg.state_path = Some(state_path);
    }

    // Remote sessions
    let connector = SshConnector::new(cfg.ssh.user.clone(), cfg.private_key(), cfg.ssh_timeout());
    let sessions = Arc::new(SessionPool::new(Arc::new(connector)));

    // Registry and hub
    if cfg.secret.is_none() {
        warn!("No secret configured, every console may edit nodes");
    }
    let hub = Arc::new(NotificationHub::new().with_secret(cfg.secret.clone()));
    let registry = Arc::new(NodeRegistry::new(
        sessions.clone(),
        hub.clone(),
        RegistrySettings {
            state_path: Some(cfg.state_path()),
            ssh_port: cfg.ssh.port,
            management_interface: cfg.ssh.interface.clone(),
            global_site: cfg.telemetry.site.clone(),
            global_domain: cfg.telemetry.domain.clone(),
        },
    ));
    registry.load();

    // Background workers
    let workers = CancellationToken::new();
    let saver = tokio::spawn(save_worker(
        registry.clone(),
        cfg.save_interval(),
        workers.clone(),
    ));
    let pruner = tokio::spawn(prune_worker(
        registry.clone(),
        cfg.prune_interval(),
        cfg.node_max_age(),
        workers.clone(),
    ));
    let keepalive = tokio::spawn(keepalive_worker(
        sessions.clone(),
        cfg.keepalive_interval(),
        workers.clone(),
    ));

    let state = Arc::new(AppState {
        registry: registry.clone(),
        hub: hub.clone(),
    });
    let app = api::create_router(state, &cfg.webroot);

    let addr: SocketAddr = cfg
        .bind
        .parse()
        .with_context(|| format!("Invalid bind address {}", cfg.bind))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Listening on http://{}", listener.local_addr()?);

    let shutdown_hub = hub.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        info!("Shutting down");
        // Open WebSocket connections would keep the server alive.
        shutdown_hub.close_all();
    })
    .await?;

    workers.cancel();
    let _ = tokio::join!(saver, pruner, keepalive);

    hub.close_all();
    if let Err(e) = registry.save().await {
        tracing::error!("Final state save failed: {:#}", e);
    }
    registry.close_pushes();
    registry.drain_pushes().await;
    sessions.close().await;

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        tokio::select! {
            _ = ctrl_c() => {},
            _ = terminate() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c().await;
    }
}

async fn ctrl_c() {
    if let Err(e) = signal::ctrl_c().await {
        warn!("Failed to install Ctrl+C handler: {}", e);
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            term.recv().await;
        }
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
