// Path: crates/master/src/dispatcher.rs
//! The job dispatcher: publish, gather, collect.

use crate::inventory::MasterInventory;
use crate::jobs::{JobCache, Returner, ReturnDisposition};
use chrono::Utc;
use herd_bus::EventBus;
use herd_crypto::SessionKeyring;
use herd_targeting::Resolution;
use herd_transport::PublishServer;
use herd_types::codec;
use herd_types::envelope::{Envelope, PublishHint};
use herd_types::error::{CoreError, DispatchError, InternalError};
use herd_types::job::{Job, Return};
use herd_types::target::TargetSpec;
use herd_types::wire::{PublishLoad, RequestReply};
use herd_types::{JobId, MinionId};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const JID_ALLOC_ATTEMPTS: usize = 8;

/// One publish request, from the control channel or a syndic relay.
#[derive(Clone, Debug)]
pub struct PublishCommand {
    /// Target expression and matcher.
    pub target: TargetSpec,
    /// Function to invoke.
    pub fun: String,
    /// Positional arguments.
    pub arg: Vec<Value>,
    /// Keyword arguments.
    pub kwarg: Map<String, Value>,
    /// Optional persistent returner name, forwarded to minions.
    pub ret: Option<String>,
    /// Requesting user.
    pub user: String,
    /// Gather timeout override.
    pub timeout: Option<Duration>,
}

/// Publishes jobs and collects returns.
pub struct Dispatcher {
    cache: Arc<JobCache>,
    inventory: Arc<MasterInventory>,
    keyring: Arc<SessionKeyring>,
    pub_server: Arc<dyn PublishServer>,
    bus: EventBus,
    returner: Option<Arc<dyn Returner>>,
    gather_timeout: Duration,
    draining: AtomicBool,
}

impl Dispatcher {
    /// Wires the dispatcher.
    pub fn new(
        cache: Arc<JobCache>,
        inventory: Arc<MasterInventory>,
        keyring: Arc<SessionKeyring>,
        pub_server: Arc<dyn PublishServer>,
        bus: EventBus,
        returner: Option<Arc<dyn Returner>>,
        gather_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            cache,
            inventory,
            keyring,
            pub_server,
            bus,
            returner,
            gather_timeout,
            draining: AtomicBool::new(false),
        })
    }

    /// Stops accepting new publications; in-flight collections continue.
    pub fn drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    /// Publishes a new job: resolves targets, allocates a jid, records the
    /// job as collecting, emits the publication, and fires the job event.
    pub async fn publish(
        self: &Arc<Self>,
        cmd: PublishCommand,
    ) -> Result<(JobId, Resolution), CoreError> {
        if self.draining.load(Ordering::SeqCst) {
            return Err(InternalError::Shutdown.into());
        }
        let (spec, resolution) = herd_targeting::resolve(&*self.inventory, &cmd.target)?;

        let mut jid = JobId::generate();
        let job = |jid: &JobId| Job {
            jid: jid.clone(),
            target: spec.clone(),
            fun: cmd.fun.clone(),
            arg: cmd.arg.clone(),
            kwarg: cmd.kwarg.clone(),
            user: cmd.user.clone(),
            timestamp: Utc::now(),
            ret: cmd.ret.clone(),
        };

        let mut attempts = 0;
        loop {
            match self.cache.insert(job(&jid), resolution.minions.clone()) {
                Ok(()) => break,
                Err(CoreError::Dispatch(DispatchError::JidCollision)) => {
                    attempts += 1;
                    if attempts >= JID_ALLOC_ATTEMPTS {
                        return Err(DispatchError::JidCollision.into());
                    }
                    jid = JobId::generate();
                }
                Err(e) => return Err(e),
            }
        }

        self.emit(job(&jid), &spec, &resolution, cmd.timeout).await?;
        Ok((jid, resolution))
    }

    /// Re-publishes a job received from an upstream master, preserving its
    /// jid. The syndic relay path.
    pub async fn publish_forwarded(
        self: &Arc<Self>,
        load: PublishLoad,
        timeout: Option<Duration>,
    ) -> Result<Resolution, CoreError> {
        if self.draining.load(Ordering::SeqCst) {
            return Err(InternalError::Shutdown.into());
        }
        let spec = load.target();
        let (spec, resolution) = herd_targeting::resolve(&*self.inventory, &spec)?;
        let job = Job {
            jid: load.jid.clone(),
            target: spec.clone(),
            fun: load.fun.clone(),
            arg: load.arg.clone(),
            kwarg: load.kwarg.clone(),
            user: load.user.clone(),
            timestamp: Utc::now(),
            ret: load.ret.clone(),
        };
        // An upstream jid must keep its identity; a collision here means
        // we already relayed it, which is fine to refuse.
        self.cache.insert(job.clone(), resolution.minions.clone())?;
        self.emit(job, &spec, &resolution, timeout).await?;
        Ok(resolution)
    }

    async fn emit(
        self: &Arc<Self>,
        job: Job,
        spec: &TargetSpec,
        resolution: &Resolution,
        timeout: Option<Duration>,
    ) -> Result<(), CoreError> {
        let jid = job.jid.clone();
        let load = PublishLoad {
            jid: jid.clone(),
            tgt: spec.expr.clone(),
            tgt_type: spec.kind,
            fun: job.fun.clone(),
            arg: job.arg.clone(),
            kwarg: job.kwarg.clone(),
            ret: job.ret.clone(),
            user: job.user.clone(),
        };
        let sealed = self.keyring.handle().seal(&codec::to_bytes(&load)?)?;
        let hint = if resolution.exact {
            PublishHint::Targets(resolution.minions.iter().cloned().collect())
        } else {
            PublishHint::Broadcast
        };
        self.pub_server
            .publish(Envelope::aes(sealed).with_hint(hint))
            .await?;

        self.bus.fire_single(
            format!("herd/job/{}/new", jid),
            "fun",
            json!(job.fun.clone()),
        );
        tracing::info!(jid = %jid, fun = %job.fun, targets = resolution.minions.len(), "job published");

        // Gather deadline; an empty expected set was closed at insert.
        if !resolution.minions.is_empty() {
            let dispatcher = self.clone();
            let deadline = timeout.unwrap_or(self.gather_timeout);
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                if let Some(missing) = dispatcher.cache.close(&jid) {
                    if !missing.is_empty() {
                        tracing::info!(jid = %jid, missing = missing.len(), "job closed with missing returns");
                    }
                }
            });
        }

        // Persistent returner writes are best-effort.
        if let Some(returner) = &self.returner {
            let returner = returner.clone();
            tokio::spawn(async move {
                if let Err(e) = returner.prep_jid(&job).await {
                    tracing::warn!(jid = %job.jid, error = %e, "returner prep failed");
                    return;
                }
                if let Err(e) = returner.save_load(&job.jid, &job).await {
                    tracing::warn!(jid = %job.jid, error = %e, "returner save_load failed");
                }
            });
        }
        Ok(())
    }

    /// Files an authenticated return. Unknown and expired jids are
    /// discarded quietly; the minion did its part.
    pub fn handle_return(&self, ret: Return) -> RequestReply {
        let jid = ret.jid.clone();
        let id = ret.id.clone();
        self.inventory.mark_seen(&id);

        match self.cache.add_return(ret.clone()) {
            Ok(ReturnDisposition::Stored { late, closed_now }) => {
                let mut data = Map::new();
                data.insert("retcode".into(), json!(ret.retcode));
                data.insert("success".into(), json!(ret.success));
                if late {
                    data.insert("late".into(), json!(true));
                }
                self.bus.fire(herd_types::event::Event::new(
                    format!("herd/job/{}/ret/{}", jid, id),
                    data,
                ));
                if closed_now {
                    tracing::debug!(jid = %jid, "all targets returned, job closed");
                }
                if let Some(returner) = &self.returner {
                    let returner = returner.clone();
                    tokio::spawn(async move {
                        if let Err(e) = returner.save_return(&ret.jid.clone(), &ret).await {
                            tracing::warn!(jid = %ret.jid, error = %e, "returner save_return failed");
                        }
                    });
                }
                RequestReply::Ok
            }
            Ok(ReturnDisposition::Duplicate) => {
                tracing::debug!(jid = %jid, id = %id, "duplicate return ignored");
                RequestReply::Ok
            }
            Err(DispatchError::JobNotFound(_)) => {
                tracing::info!(jid = %jid, id = %id, "return for unknown or expired jid discarded");
                RequestReply::Ok
            }
            Err(e) => {
                tracing::warn!(jid = %jid, id = %id, error = %e, "return not stored");
                RequestReply::Ok
            }
        }
    }
}
