//! multiwire Daemon - Echo Server and Ping Client
//!
//! Exercises the multiwire carriers end to end.
//!
//! # Usage
//!
//! ```bash
//! # Echo server on TCP
//! multiwire-daemon serve --bind 127.0.0.1:7000
//!
//! # Echo server on UDP
//! multiwire-daemon serve --bind 127.0.0.1:7000 --carrier udp
//!
//! # Ten pings through a reconnecting client
//! multiwire-daemon ping --connect 127.0.0.1:7000 --count 10
//!
//! # Verbose logging
//! RUST_LOG=debug multiwire-daemon serve --bind 0.0.0.0:7000
//! ```
//!
//! Transport settings come from `multiwire.toml` (see `--config`) and
//! `MULTIWIRE_*` environment variables. `Ctrl-C` shuts down cleanly.

mod ping;
mod protocols;
mod server;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use multiwire_core::config::{default_config_path, load_config_from_path, LoadedConfig};

use server::Carrier;

/// multiwire Daemon - echo server and ping client
#[derive(Parser, Debug)]
#[command(name = "multiwire-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(
        short = 'c',
        long,
        env = "MULTIWIRE_CONFIG",
        value_name = "FILE",
        global = true
    )]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        short = 'l',
        long,
        env = "MULTIWIRE_LOG_LEVEL",
        default_value = "info",
        global = true
    )]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Answer every Ping with a Pong
    Serve {
        /// Address to listen on
        #[arg(short = 'b', long, value_name = "ADDR")]
        bind: SocketAddr,

        /// Carrier to listen with
        #[arg(long, value_enum, default_value = "tcp")]
        carrier: Carrier,
    },

    /// Send pings and report round trips
    Ping {
        /// Server address
        #[arg(short = 'a', long, value_name = "ADDR")]
        connect: SocketAddr,

        /// Number of pings
        #[arg(short = 'n', long, default_value_t = 4)]
        count: u64,

        /// Milliseconds between pings
        #[arg(short = 'i', long, default_value_t = 1000)]
        interval_ms: u64,

        /// Carrier to ping over
        #[arg(long, value_enum, default_value = "tcp")]
        carrier: Carrier,
    },
}

/// Initialize logging at `level` unless RUST_LOG is set
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "multiwire_daemon={level},multiwire_core={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

/// Load `--config`, falling back to the per-user default path
fn load_settings(config: Option<PathBuf>) -> Result<LoadedConfig> {
    let config_path = config.or_else(default_config_path);
    load_config_from_path(config_path.as_deref()).context("Failed to load configuration")
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl-C, initiating shutdown"),
        Err(e) => {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    info!("multiwire daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let loaded = load_settings(args.config)?;
    info!(source = %loaded.source, path = ?loaded.config_file_path, "Configuration loaded");

    let registry = protocols::registry()
        .context("Failed to register daemon protocols")?
        .into_shared();

    match args.command {
        Command::Serve { bind, carrier } => {
            server::serve(bind, carrier, loaded.transport, registry, shutdown_signal()).await
        }
        Command::Ping {
            connect,
            count,
            interval_ms,
            carrier,
        } => {
            let run = ping::ping(
                connect,
                carrier,
                count,
                Duration::from_millis(interval_ms),
                loaded.transport,
                registry,
            );
            tokio::select! {
                stats = run => {
                    let stats = stats?;
                    if stats.lost() > 0 {
                        anyhow::bail!("{} of {} pings lost", stats.lost(), stats.sent);
                    }
                    Ok(())
                }
                () = shutdown_signal() => Ok(()),
            }
        }
    }
}
