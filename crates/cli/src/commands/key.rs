// Path: crates/cli/src/commands/key.rs
//! `herd key`: manage the minion key registry.

use anyhow::{bail, Result};
use clap::{Args, Subcommand};
use herd_pki::{KeyState, KeyStore};
use herd_types::config::MasterConfig;
use herd_types::MinionId;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct KeyArgs {
    #[clap(subcommand)]
    action: KeyAction,

    /// Master config file (defaults to <config_dir>/master).
    #[clap(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum KeyAction {
    /// List every key by state, with fingerprints.
    List,

    /// Accept a pending (or rejected) key.
    Accept {
        /// The minion id to accept.
        id: Option<String>,
        /// Accept every pending key.
        #[clap(long)]
        all: bool,
    },

    /// Reject a pending or accepted key.
    Reject {
        /// The minion id to reject.
        id: Option<String>,
        /// Reject every pending key.
        #[clap(long)]
        all: bool,
    },

    /// Delete a key from every state.
    Delete {
        /// The minion id to delete.
        id: Option<String>,
        /// Delete every known key.
        #[clap(long)]
        all: bool,
    },
}

pub fn run(args: KeyArgs) -> Result<()> {
    let config = MasterConfig::load(args.config.as_deref())?;
    let store = KeyStore::open(&config.pki_dir)?;

    match args.action {
        KeyAction::List => list(&store),
        KeyAction::Accept { id, all } => {
            each(&store, id, all, KeyState::Pending, |store, id| {
                store.accept(id)?;
                println!("accepted: {}", id);
                Ok(())
            })
        }
        KeyAction::Reject { id, all } => {
            each(&store, id, all, KeyState::Pending, |store, id| {
                store.reject(id)?;
                println!("rejected: {}", id);
                Ok(())
            })
        }
        KeyAction::Delete { id, all } => {
            if all {
                let mut ids = Vec::new();
                for state in KeyState::all() {
                    ids.extend(store.list_by_state(state)?);
                }
                ids.dedup();
                for id in ids {
                    store.delete(&id)?;
                    println!("deleted: {}", id);
                }
                return Ok(());
            }
            let Some(id) = id else {
                bail!("key delete needs a minion id or --all");
            };
            let id = MinionId::new(id);
            store.delete(&id)?;
            println!("deleted: {}", id);
            Ok(())
        }
    }
}

fn each(
    store: &KeyStore,
    id: Option<String>,
    all: bool,
    bulk_state: KeyState,
    op: impl Fn(&KeyStore, &MinionId) -> Result<()>,
) -> Result<()> {
    if all {
        for id in store.list_by_state(bulk_state)? {
            op(store, &id)?;
        }
        return Ok(());
    }
    let Some(id) = id else {
        bail!("need a minion id or --all");
    };
    op(store, &MinionId::new(id))
}

fn list(store: &KeyStore) -> Result<()> {
    let sections = [
        ("Accepted Keys:", KeyState::Accepted),
        ("Unaccepted Keys:", KeyState::Pending),
        ("Rejected Keys:", KeyState::Rejected),
        ("Denied Keys:", KeyState::Denied),
    ];
    for (heading, state) in sections {
        println!("{}", heading);
        for id in store.list_by_state(state)? {
            let finger = store
                .lookup(&id)?
                .and_then(|rec| herd_crypto::keys::fingerprint(&rec.pub_pem).ok())
                .unwrap_or_else(|| "-".to_string());
            println!("  {}  {}", id, finger);
        }
    }
    Ok(())
}
