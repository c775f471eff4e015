//! Tether CLI
//!
//! `probe` heartbeats a remote service through an SSH tunnel that survives
//! drops; `echo` is the matching endpoint to run behind the SSH server.

mod echo;
mod envelope;
mod probe;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tether_core::config::load_config;
use tether_core::tracing_init::{default_filter, init_tracing};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(version, about = "Tether - framed messages over a self-healing SSH tunnel")]
struct Cli {
    /// Config file layered over the global one
    #[arg(short, long, env = "TETHER_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured log level (e.g. "debug")
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send heartbeats through the tunnel and report round trips
    Probe {
        /// Number of heartbeats (runs until Ctrl-C when omitted)
        #[arg(short = 'n', long)]
        count: Option<u64>,

        /// Milliseconds between heartbeats
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
    },
    /// Serve framed echo on a TCP address
    Echo {
        #[arg(long, default_value = "127.0.0.1:9000")]
        listen: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    let level = cli.log_level.as_deref().unwrap_or(&config.log.level);
    init_tracing(&default_filter(level), cli.log_json || config.log.json);
    info!(version = env!("CARGO_PKG_VERSION"), "Starting tether");

    match cli.command {
        Command::Probe { count, interval_ms } => {
            probe::run(
                &config,
                probe::ProbeArgs {
                    count,
                    interval: Duration::from_millis(interval_ms.max(1)),
                },
            )
            .await
        }
        Command::Echo { listen } => echo::run(listen, config.channel.max_frame_bytes).await,
    }
}
