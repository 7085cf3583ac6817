//! Pulse daemon
//!
//! The daemon probes the configured targets in bursts, keeps live
//! statistics in memory, persists history into round-robin archive
//! files, and serves both over a local IPC socket (for the terminal
//! front end) and an HTTP/WebSocket API.
// This is the main entry point for the daemon. It is responsible for:
// - Initializing logging and resolving filesystem paths.
// - Loading and validating the configuration.
// - Wiring storage, collector, IPC server and HTTP façade together.
// - Handling graceful shutdown on SIGINT/SIGTERM.

// Use jemalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

mod api;
mod collector;
mod fanout;
mod ipc;
mod probe;
mod probe_icmp;
mod probe_tcp;
mod storage;
#[cfg(test)]
mod tests;

use collector::Collector;
use ipc::IpcServer;
use shared::config::Config;
use shared::paths::Paths;
use storage::{MemoryBuffer, RrdStorage};

/// Command-line arguments for the daemon
#[derive(Parser, Debug)]
#[command(name = "pulsed")]
#[command(about = "SmokePing-style latency monitoring daemon", long_about = None)]
struct CliArgs {
    /// Override the configuration file path
    #[arg(long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long = "log-format", value_enum, default_value = "text")]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    // Logging goes to stderr through a non-blocking writer; the guard
    // must live for the whole process
    let (writer, _guard) = tracing_appender::non_blocking(std::io::stderr());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("daemon=info,shared=info"));
    match cli_args.log_format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(writer)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .with_writer(writer)
            .init(),
    }

    info!("pulse daemon starting up");

    let mut paths = Paths::resolve().context("failed to resolve paths")?;
    if let Some(config_file) = cli_args.config {
        paths.config_file = config_file;
    }
    if let Err(e) = paths.ensure_directories() {
        error!("failed to prepare directories: {}", e);
        std::process::exit(1);
    }

    match paths.create_default_config() {
        Ok(true) => info!(config = %paths.config_file.display(), "created default config"),
        Ok(false) => {}
        Err(e) => warn!("could not create default config: {}", e),
    }

    // Configuration errors are fatal: print and exit non-zero
    let config = match Config::load(&paths.config_file) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!(config = %paths.config_file.display(), "invalid configuration: {:#}", e);
            std::process::exit(1);
        }
    };
    info!(
        config = %paths.config_file.display(),
        targets = config.targets.len(),
        interval = ?config.global.interval,
        enable_tui = config.server.enable_tui,
        "configuration loaded"
    );

    let daemon = match Daemon::start(config, &paths).await {
        Ok(daemon) => daemon,
        Err(e) => {
            error!("failed to start daemon: {:#}", e);
            std::process::exit(1);
        }
    };

    wait_for_shutdown_signal().await;
    daemon.stop().await;

    info!("pulse daemon exited cleanly");
    Ok(())
}

/// A running daemon: collector, IPC server and HTTP façade.
struct Daemon {
    collector: Arc<Collector>,
    ipc_server: Arc<IpcServer>,
    http_shutdown: tokio::sync::oneshot::Sender<()>,
    http_task: tokio::task::JoinHandle<()>,
}

impl Daemon {
    /// Construct storage, start the collector, bind the IPC socket and
    /// the HTTP listener. Any bind failure here aborts startup.
    async fn start(config: Arc<Config>, paths: &Paths) -> Result<Daemon> {
        let data_dir = config
            .global
            .data_dir
            .clone()
            .unwrap_or_else(|| paths.data_dir.clone());

        let archive = RrdStorage::new(
            data_dir.clone(),
            config.global.interval,
            &config.storage.retention,
            config.storage.xff,
            config.storage.aggregation,
        )
        .context("failed to initialize archive storage")?;
        info!(
            data_dir = %data_dir.display(),
            retention = %config.storage.retention,
            consolidation = config.storage.aggregation.as_upper(),
            "archive storage ready"
        );

        let collector = Arc::new(Collector::new(
            Arc::clone(&config),
            Arc::new(MemoryBuffer::default()),
            Some(Arc::new(archive)),
        ));
        collector.start().await;

        let ipc_server = Arc::new(IpcServer::new(
            paths.socket_path.clone(),
            Arc::clone(&collector),
        ));
        Arc::clone(&ipc_server)
            .start()
            .await
            .context("failed to start IPC server")?;

        let listen_addr = api::parse_listen_addr(&config.server.address)?;
        let listener = tokio::net::TcpListener::bind(listen_addr)
            .await
            .with_context(|| format!("failed to bind HTTP listener on {}", listen_addr))?;
        info!(address = %listen_addr, "HTTP API listening");

        let router = api::create_router(api::AppState {
            collector: Arc::clone(&collector),
            started_at: Instant::now(),
        });
        let (http_shutdown, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let http_task = tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = serve.await {
                error!("HTTP server error: {}", e);
            }
        });

        Ok(Daemon {
            collector,
            ipc_server,
            http_shutdown,
            http_task,
        })
    }

    /// Orderly shutdown: stop probing, close the IPC socket, then drain
    /// the HTTP server.
    async fn stop(self) {
        self.collector.stop().await;
        self.ipc_server.stop().await;

        let _ = self.http_shutdown.send(());
        if let Err(e) = self.http_task.await {
            warn!("HTTP task ended abnormally: {}", e);
        }
    }
}

/// Block until SIGINT or SIGTERM arrives.
async fn wait_for_shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!("failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}
