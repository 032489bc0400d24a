// Path: crates/cli/src/commands/publish.rs
//! `herd publish`: the primary remote-execution entry point.
//!
//! Publishes through the control channel, then polls the job status and
//! prints each return as it arrives. Exits zero only when every targeted
//! minion returned with retcode zero.

use crate::util::{self, OutputFormat};
use anyhow::{bail, Result};
use clap::Args;
use herd_types::config::MasterConfig;
use herd_types::target::{MatcherKind, TargetSpec};
use herd_types::wire::{ControlReply, ControlRequest};
use herd_types::MinionId;
use serde_json::Map;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Args, Debug)]
pub struct PublishArgs {
    /// The target expression.
    target: String,

    /// The function to invoke, keyed module.fun.
    fun: String,

    /// Arguments; JSON is decoded, anything else is a string.
    args: Vec<String>,

    /// Gather timeout in seconds (default: the master's configured value).
    #[clap(long)]
    timeout: Option<u64>,

    /// Output rendering.
    #[clap(long, value_enum, default_value = "text")]
    output: OutputFormat,

    /// Target matcher kind.
    #[clap(long = "tgt-type", default_value = "glob")]
    tgt_type: String,

    /// Master config file (defaults to <config_dir>/master).
    #[clap(long)]
    config: Option<PathBuf>,
}

pub async fn run(args: PublishArgs) -> Result<()> {
    let config = MasterConfig::load(args.config.as_deref())?;
    let kind: MatcherKind = match args.tgt_type.parse() {
        Ok(kind) => kind,
        Err(e) => bail!("{}", e),
    };

    let request = ControlRequest::Publish {
        target: TargetSpec::new(args.target.clone(), kind),
        fun: args.fun.clone(),
        arg: args.args.iter().map(|a| util::parse_arg(a)).collect(),
        kwarg: Map::new(),
        ret: None,
        user: util::current_user(),
        timeout_secs: args.timeout,
    };

    let jid = match util::control_request(&config, &request).await? {
        ControlReply::Published { jid, minions } => {
            tracing::info!(jid = %jid, targets = minions.len(), "job published");
            jid
        }
        ControlReply::Error { code, message } => bail!("publish failed: {} ({})", message, code),
        other => bail!("unexpected control reply: {:?}", other),
    };

    // Poll the job, printing returns as they land.
    let gather = args.timeout.unwrap_or(config.gather_job_timeout_secs);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(gather + 60);
    let mut printed: HashSet<MinionId> = HashSet::new();
    let mut failed = false;
    let mut missing: Vec<MinionId> = Vec::new();

    loop {
        let status = util::control_request(&config, &ControlRequest::JobStatus { jid: jid.clone() })
            .await?;
        let view = match status {
            ControlReply::Job(view) => view,
            ControlReply::Error { code, message } => bail!("{} ({})", message, code),
            other => bail!("unexpected control reply: {:?}", other),
        };

        for entry in &view.returns {
            if printed.insert(entry.ret.id.clone()) {
                failed |= entry.ret.retcode != 0;
                println!("{}:", entry.ret.id);
                print!("{}", indent(&util::render(&entry.ret.ret, args.output)));
            }
        }

        if view.state == herd_types::job::JobState::Closed {
            missing = view.missing;
            break;
        }
        if tokio::time::Instant::now() > deadline {
            bail!("job {} did not close in time", jid);
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    for id in &missing {
        println!("{}:", id);
        println!("    Minion did not return");
    }
    if failed || !missing.is_empty() {
        bail!("not all targeted minions returned successfully");
    }
    Ok(())
}

fn indent(block: &str) -> String {
    block
        .lines()
        .map(|line| format!("    {}\n", line))
        .collect()
}
