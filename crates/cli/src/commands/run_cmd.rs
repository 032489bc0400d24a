// Path: crates/cli/src/commands/run_cmd.rs
//! `herd run`: invoke a master-side runner function.

use crate::util::{self, OutputFormat};
use anyhow::{bail, Result};
use clap::Args;
use herd_types::config::MasterConfig;
use herd_types::wire::{ControlReply, ControlRequest};
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// The runner, keyed module.fun (e.g. jobs.list_jobs, manage.up).
    fun: String,

    /// Arguments; JSON is decoded, anything else is a string.
    args: Vec<String>,

    /// Output rendering.
    #[clap(long, value_enum, default_value = "text")]
    output: OutputFormat,

    /// Master config file (defaults to <config_dir>/master).
    #[clap(long)]
    config: Option<PathBuf>,
}

pub async fn run(args: RunArgs) -> Result<()> {
    let config = MasterConfig::load(args.config.as_deref())?;
    let request = ControlRequest::Runner {
        fun: args.fun.clone(),
        arg: args.args.iter().map(|a| util::parse_arg(a)).collect(),
    };

    match util::control_request(&config, &request).await? {
        ControlReply::Runner { value } => {
            print!("{}", util::render(&value, args.output));
            Ok(())
        }
        ControlReply::Error { code, message } => bail!("{} ({})", message, code),
        other => bail!("unexpected control reply: {:?}", other),
    }
}
