//! # Conduit
//!
//! Entry point for the `conduit` binary.
//!
//! `conduit run` starts in this order:
//!
//! 1. **Configuration** - file, then `CONDUIT_*` overrides, then validation
//! 2. **NATS** - connect and provision every stream
//! 3. **SurrealDB** - connect and define the knowledge schema
//! 4. **Dispatcher** - consume `stage.started` until SIGTERM/SIGINT
//!
//! Shutdown drains in-flight workers within the configured window, then
//! releases the bus and the store.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    commands::execute_command(cli.command).await
}

/// Initialize tracing subscriber with environment filter.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
