//! Pulse terminal front end
//!
//! Attaches to a running daemon over its IPC socket, prints the target
//! list and then streams live probe results line by line until
//! interrupted. The measurement plane lives entirely in the daemon;
//! this binary is a thin consumer of the IPC client.

// Use jemalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::error;

mod client;
#[cfg(test)]
mod tests;

use client::IpcClient;
use shared::paths::Paths;

/// Command-line arguments for the front end
#[derive(Parser, Debug)]
#[command(name = "pulse-tui")]
#[command(about = "Attach to a running pulse daemon and stream probe results", long_about = None)]
struct CliArgs {
    /// Override the daemon socket path
    #[arg(long = "socket", value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Print live statistics for one target and exit
    #[arg(long = "stats", value_name = "TARGET")]
    stats: Option<String>,

    /// Print the last hour of archived data for one target and exit
    #[arg(long = "history", value_name = "TARGET")]
    history: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tui=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let cli_args = CliArgs::parse();
    let socket_path = match cli_args.socket {
        Some(path) => path,
        None => Paths::resolve().context("failed to resolve paths")?.socket_path,
    };

    let client = IpcClient::connect(&socket_path).await.map_err(|e| {
        error!("is the daemon running? ({:#})", e);
        e
    })?;

    // One-shot queries skip the streaming loop entirely
    if let Some(target) = cli_args.stats {
        let stats = client.get_stats(&target).await?;
        println!(
            "{}: last {:.2} ms, median {:.2} ms, p95 {:.2} ms, avg {:.2} ms (±{:.2}), \
             min {:.2} / max {:.2}, loss {:.1}% over {} samples",
            stats.target,
            stats.last_ms,
            stats.median_ms,
            stats.p95_ms,
            stats.avg_ms,
            stats.stddev_ms,
            stats.min_ms,
            stats.max_ms,
            stats.loss_pct,
            stats.sample_count,
        );
        client.close().await;
        return Ok(());
    }
    if let Some(target) = cli_args.history {
        let to = chrono::Utc::now();
        let from = to - chrono::Duration::hours(1);
        let points = client.get_history(&target, from, to).await?;
        for point in points {
            match (point.value.is_nan(), point.loss.is_nan()) {
                (false, _) => println!(
                    "{}  {:>10.2} ms  loss {:.0}%",
                    point.timestamp.format("%H:%M:%S"),
                    point.value,
                    point.loss * 100.0
                ),
                (true, false) => println!(
                    "{}         lost  loss {:.0}%",
                    point.timestamp.format("%H:%M:%S"),
                    point.loss * 100.0
                ),
                (true, true) => {
                    println!("{}      no data", point.timestamp.format("%H:%M:%S"))
                }
            }
        }
        client.close().await;
        return Ok(());
    }

    let targets = client.get_targets().await?;
    println!("monitoring {} target(s):", targets.len());
    for target in &targets {
        match target.port {
            Some(port) => println!("  {} ({}:{}, {:?})", target.name, target.host, port, target.probe),
            None => println!("  {} ({}, {:?})", target.name, target.host, target.probe),
        }
    }
    println!();

    client.subscribe().await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            result = client.next_result() => match result {
                Some(result) => {
                    if result.success {
                        println!(
                            "{}  {:<20} {:>8.2} ms  (loss {:.0}%, {}/{} pings)",
                            result.timestamp.format("%H:%M:%S"),
                            result.target,
                            result.latency_ms,
                            result.loss_pct,
                            result.pings_recv,
                            result.pings_sent,
                        );
                    } else {
                        println!(
                            "{}  {:<20} FAILED  {}",
                            result.timestamp.format("%H:%M:%S"),
                            result.target,
                            result.error.as_deref().unwrap_or("no response"),
                        );
                    }
                }
                None => {
                    error!("connection to daemon lost");
                    break;
                }
            }
        }
    }

    // Best effort: the daemon also clears the flag when we disconnect
    let _ = client.unsubscribe().await;
    client.close().await;
    Ok(())
}
