use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tabled::settings::{object::Columns, Alignment, Style};
use tabled::{Table, Tabled};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use flowprobe::api::{self, ApiState, DEFAULT_API_ADDR};
use flowprobe::capture::{CaptureManager, InterfaceStats};
use flowprobe::config::Config;
use flowprobe::db::WriteoutHandler;

#[derive(Parser)]
#[command(name = "flowprobe")]
#[command(author, version, about = "Network flow monitor with a columnar on-disk flow database")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the capture daemon
    Run,

    /// Show capture status
    ///
    /// If a list of interfaces is provided, only their statistics are
    /// shown. Otherwise all interfaces are printed.
    Status {
        /// Interfaces to show
        ifaces: Vec<String>,

        /// Address of the daemon's status API
        #[arg(short, long)]
        addr: Option<String>,
    },
}

pub async fn run_command(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };

    match cli.command {
        Commands::Run => run_daemon(config).await,
        Commands::Status { ifaces, addr } => show_status(&config, addr, ifaces).await,
    }
}

async fn run_daemon(config: Config) -> Result<()> {
    if config.interfaces.is_empty() {
        warn!("no interfaces configured; the capture fleet is empty");
    }

    let mut manager = CaptureManager::new();
    manager.update(&config.interfaces).await;
    let manager = Arc::new(tokio::sync::Mutex::new(manager));

    let (writeout_tx, writeout_rx) = mpsc::channel(1);
    let writeout = WriteoutHandler::new(config.db_path.clone());
    let writeout_task = tokio::spawn(writeout.clone().run(writeout_rx));

    if let Some(addr) = config.api_addr.clone() {
        let state = ApiState {
            manager: Arc::clone(&manager),
            writeout: writeout.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = api::serve(&addr, state).await {
                error!("status API failed: {e:#}");
            }
        });
    }

    let mut rotation =
        tokio::time::interval(Duration::from_secs(config.rotation_interval.max(1)));
    rotation.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    rotation.tick().await; // consume the immediate first tick

    info!(interval = config.rotation_interval, "scheduled rotation running");
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = rotation.tick() => {
                manager.lock().await.rotate(&writeout_tx, &[]).await;
            }
            res = &mut shutdown => {
                res.context("failed to listen for shutdown signal")?;
                break;
            }
        }
    }

    // final rotation so the last interval is not lost, then drain
    info!("shutting down");
    {
        let mut manager = manager.lock().await;
        manager.rotate(&writeout_tx, &[]).await;
        manager.close().await;
    }
    drop(writeout_tx);
    let _ = writeout_task.await;

    Ok(())
}

#[derive(Tabled)]
struct StatusRow {
    #[tabled(rename = "iface")]
    iface: String,
    #[tabled(rename = "total received")]
    received_total: String,
    #[tabled(rename = "+ received")]
    received: String,
    #[tabled(rename = "total processed")]
    processed_total: String,
    #[tabled(rename = "+ processed")]
    processed: String,
    #[tabled(rename = "+ dropped")]
    dropped: String,
    #[tabled(rename = "active for")]
    active_for: String,
}

async fn show_status(config: &Config, addr: Option<String>, ifaces: Vec<String>) -> Result<()> {
    let addr = addr
        .or_else(|| config.api_addr.clone())
        .unwrap_or_else(|| DEFAULT_API_ADDR.to_string());

    let response = api::fetch_status(&addr)
        .await
        .with_context(|| format!("failed to fetch status for interfaces {ifaces:?}"))?;

    let mut statuses: Vec<(String, InterfaceStats)> = response
        .statuses
        .into_iter()
        .filter(|(iface, _)| ifaces.is_empty() || ifaces.contains(iface))
        .collect();
    statuses.sort_by(|a, b| a.0.cmp(&b.0));

    let now = Utc::now();
    let mut received_total = 0u64;
    let mut processed_total = 0u64;
    let mut received = 0u64;
    let mut processed = 0u64;
    let mut dropped = 0u64;

    let rows: Vec<StatusRow> = statuses
        .iter()
        .map(|(iface, stats)| {
            received_total += stats.received_total;
            processed_total += stats.processed_total;
            received += stats.received;
            processed += stats.processed;
            dropped += stats.dropped;

            let dropped_cell = if stats.dropped > 0 {
                stats.dropped.to_string().red().bold().to_string()
            } else {
                stats.dropped.to_string()
            };

            StatusRow {
                iface: iface.clone(),
                received_total: countable(stats.received_total),
                received: countable(stats.received),
                processed_total: countable(stats.processed_total),
                processed: countable(stats.processed),
                dropped: dropped_cell,
                active_for: duration_human((now - stats.started_at).num_seconds()),
            }
        })
        .collect();

    println!();
    println!("{}", "Interface Statuses".bold());

    let mut table = Table::new(rows);
    table
        .with(Style::modern())
        .modify(Columns::new(1..), Alignment::right());
    println!("{table}");

    let started = response.started_at_timestamp;
    let (last_writeout, writeout_ago) = match response.last_writeout_timestamp {
        Some(ts) => (
            ts.format("%Y-%m-%d %H:%M:%S").to_string(),
            duration_human((now - ts).num_seconds()),
        ),
        None => ("-".to_string(), "-".to_string()),
    };

    println!(
        r#"
Runtime info:

            Running since: {} ({} ago)
  Last scheduled writeout: {} ({} ago)

Totals:

    Packets
       Received: {} / + {}
      Processed: {} / + {}
        Dropped:      + {}
"#,
        started.format("%Y-%m-%d %H:%M:%S"),
        duration_human((now - started).num_seconds()),
        last_writeout,
        writeout_ago,
        countable(received_total),
        countable(received),
        countable(processed_total),
        countable(processed),
        dropped,
    );

    Ok(())
}

/// Compact human form of a packet count ("2.4 M")
fn countable(n: u64) -> String {
    const UNITS: [&str; 4] = ["", "k", "M", "G"];

    let mut value = n as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        n.to_string()
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// Coarse human duration ("2d4h", "3m20s")
fn duration_human(secs: i64) -> String {
    let secs = secs.max(0);
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let mins = (secs % 3_600) / 60;
    let rest = secs % 60;

    if days > 0 {
        format!("{days}d{hours}h")
    } else if hours > 0 {
        format!("{hours}h{mins}m")
    } else if mins > 0 {
        format!("{mins}m{rest}s")
    } else {
        format!("{rest}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_countable() {
        assert_eq!(countable(0), "0");
        assert_eq!(countable(999), "999");
        assert_eq!(countable(1_000), "1.0 k");
        assert_eq!(countable(1_500), "1.5 k");
        assert_eq!(countable(2_400_000), "2.4 M");
        assert_eq!(countable(3_000_000_000), "3.0 G");
    }

    #[test]
    fn test_duration_human() {
        assert_eq!(duration_human(-5), "0s");
        assert_eq!(duration_human(42), "42s");
        assert_eq!(duration_human(200), "3m20s");
        assert_eq!(duration_human(3 * 3600 + 120), "3h2m");
        assert_eq!(duration_human(2 * 86400 + 4 * 3600), "2d4h");
    }
}
