// Path: crates/cli/src/main.rs
#![cfg_attr(
    not(test),
    deny(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::unimplemented,
        clippy::todo
    )
)]

//! # Herd CLI
//!
//! The operator surface: key management, remote execution, master-side
//! runners, and the daemon launcher.

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod util;

use commands::*;

#[derive(Parser, Debug)]
#[clap(
    name = "herd",
    version,
    about = "Remote execution over an authenticated, encrypted message bus.",
    long_about = "herd drives long-lived minion agents from a central master: manage minion \
                  keys, publish jobs to a target set, invoke master-side runners, and run the \
                  daemons in the foreground."
)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage minion keys (list, accept, reject, delete).
    Key(key::KeyArgs),

    /// Publish a job to a target set and stream the returns.
    Publish(publish::PublishArgs),

    /// Invoke a master-side runner function.
    Run(run_cmd::RunArgs),

    /// Run one of the daemons in the foreground.
    Daemon(daemon::DaemonArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    herd_telemetry::init_tracing()?;

    let cli = Cli::parse();
    match cli.command {
        Commands::Key(args) => key::run(args),
        Commands::Publish(args) => publish::run(args).await,
        Commands::Run(args) => run_cmd::run(args).await,
        Commands::Daemon(args) => daemon::run(args).await,
    }
}
