//! consultd - billed consultation sessions on a prepaid wallet ledger.
//!
//! A client reserves funds, a consultant accepts, and the session is billed
//! per increment while both sides talk through a relay room that exists only
//! while the session is active.
//!
//! Architecture:
//! - `consultd serve` owns every wallet, session and room in one process
//! - Ledger commits and session snapshots are journaled and replayed on start
//! - Other subcommands are thin HTTP clients of the running server

mod cli;
mod clock;
mod config;
mod dedup;
mod error;
mod ledger;
mod models;
mod relay;
mod server;
mod session;
mod store;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::{execute, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    execute(cli).await
}
