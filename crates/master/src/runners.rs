// Path: crates/master/src/runners.rs
//! Master-side runner functions, invoked with `herd run <module>.<fun>`.
//!
//! Runners are a fixed registered table, like minion functions: no code is
//! loaded at runtime.

use crate::inventory::MasterInventory;
use crate::jobs::JobCache;
use chrono::Duration as ChronoDuration;
use herd_crypto::SessionKeyring;
use herd_transport::PublishServer;
use herd_types::error::{CoreError, DispatchError};
use herd_types::JobId;
use serde_json::{json, Value};
use std::sync::Arc;

/// What runners get to work with.
pub struct RunnerContext {
    /// The job cache.
    pub cache: Arc<JobCache>,
    /// Inventory and liveness.
    pub inventory: Arc<MasterInventory>,
    /// The publish fan-out, for connection-based liveness.
    pub pub_server: Arc<dyn PublishServer>,
    /// The session keyring, for on-demand rotation.
    pub keyring: Arc<SessionKeyring>,
    /// The liveness window, from the heartbeat interval.
    pub liveness_window: ChronoDuration,
}

/// Dispatches one runner call.
pub fn run(ctx: &RunnerContext, fun: &str, args: &[Value]) -> Result<Value, CoreError> {
    match fun {
        "jobs.list_jobs" => list_jobs(ctx),
        "jobs.lookup_jid" => lookup_jid(ctx, args),
        "manage.up" => Ok(up(ctx)),
        "manage.down" => Ok(down(ctx)),
        "key.rotate_session" => rotate_session(ctx),
        other => Err(DispatchError::NoSuchFunction(other.to_string()).into()),
    }
}

fn list_jobs(ctx: &RunnerContext) -> Result<Value, CoreError> {
    let mut out = serde_json::Map::new();
    for jid in ctx.cache.list_jids() {
        if let Some(job) = ctx.cache.get_load(&jid) {
            out.insert(
                jid.to_string(),
                json!({
                    "fun": job.fun,
                    "user": job.user,
                    "target": job.target.expr,
                    "tgt_type": job.target.kind.to_string(),
                    "timestamp": job.timestamp.to_rfc3339(),
                }),
            );
        }
    }
    Ok(Value::Object(out))
}

fn lookup_jid(ctx: &RunnerContext, args: &[Value]) -> Result<Value, CoreError> {
    let jid = args
        .first()
        .and_then(|v| v.as_str())
        .ok_or_else(|| DispatchError::BadArguments("jobs.lookup_jid needs a jid".into()))?;
    let view = ctx
        .cache
        .status(&JobId::from_existing(jid))
        .ok_or_else(|| DispatchError::JobNotFound(jid.to_string()))?;
    serde_json::to_value(&view)
        .map_err(|e| DispatchError::BadArguments(format!("unencodable job view: {}", e)).into())
}

fn up(ctx: &RunnerContext) -> Value {
    // A minion counts as up if its publish subscription is live or it
    // heartbeated within the window.
    let mut up: Vec<String> = ctx
        .pub_server
        .connected()
        .into_iter()
        .map(|id| id.to_string())
        .collect();
    for id in ctx.inventory.up(ctx.liveness_window) {
        let id = id.to_string();
        if !up.contains(&id) {
            up.push(id);
        }
    }
    up.sort();
    json!(up)
}

fn down(ctx: &RunnerContext) -> Value {
    let up = match up(ctx) {
        Value::Array(values) => values,
        _ => Vec::new(),
    };
    let up: Vec<String> = up
        .into_iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();
    let mut down: Vec<String> = herd_targeting::InventoryView::minion_ids(&*ctx.inventory)
        .into_iter()
        .map(|id| id.to_string())
        .filter(|id| !up.contains(id))
        .collect();
    down.sort();
    json!(down)
}

fn rotate_session(ctx: &RunnerContext) -> Result<Value, CoreError> {
    ctx.keyring.rotate()?;
    Ok(json!({"rotated": true}))
}
