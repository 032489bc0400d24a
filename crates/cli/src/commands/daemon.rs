// Path: crates/cli/src/commands/daemon.rs
//! `herd daemon`: run the master, minion, or syndic in the foreground.

use anyhow::Result;
use clap::{Args, Subcommand};
use herd_master::Master;
use herd_minion::transports::TcpTransports;
use herd_minion::Minion;
use herd_syndic::Syndic;
use herd_types::config::{MasterConfig, MinionConfig, SyndicConfig};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Args, Debug)]
pub struct DaemonArgs {
    #[clap(subcommand)]
    role: DaemonRole,
}

#[derive(Subcommand, Debug)]
enum DaemonRole {
    /// The coordinating master.
    Master {
        /// Config file (defaults to <config_dir>/master).
        #[clap(long)]
        config: Option<PathBuf>,
    },

    /// The agent on a managed host.
    Minion {
        /// Config file (defaults to <config_dir>/minion).
        #[clap(long)]
        config: Option<PathBuf>,
    },

    /// The relay: a minion upstream, a master downstream.
    Syndic {
        /// Config file (defaults to <config_dir>/syndic).
        #[clap(long)]
        config: Option<PathBuf>,
    },
}

pub async fn run(args: DaemonArgs) -> Result<()> {
    match args.role {
        DaemonRole::Master { config } => {
            let config = MasterConfig::load(config.as_deref())?;
            let master = Master::serve(config).await?;
            tracing::info!("master running, ctrl-c to stop");
            tokio::signal::ctrl_c().await?;
            master.shutdown().await;
            Ok(())
        }
        DaemonRole::Minion { config } => {
            let config = MinionConfig::load(config.as_deref())?;
            let minion = Minion::new(config.clone())?;
            let factory = Arc::new(TcpTransports::new(Arc::new(config))?);
            tracing::info!(id = %minion.id(), "minion running, ctrl-c to stop");
            tokio::select! {
                result = minion.run(factory) => {
                    result?;
                }
                _ = tokio::signal::ctrl_c() => {}
            }
            Ok(())
        }
        DaemonRole::Syndic { config } => {
            let config = SyndicConfig::load(config.as_deref())?;
            let syndic = Syndic::serve(config).await?;
            tracing::info!("syndic running, ctrl-c to stop");
            tokio::select! {
                result = syndic.run() => {
                    result?;
                }
                _ = tokio::signal::ctrl_c() => {}
            }
            Ok(())
        }
    }
}
