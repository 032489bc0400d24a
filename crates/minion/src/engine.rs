// Path: crates/minion/src/engine.rs
//! The minion engine.
//!
//! One long-running loop per process: authenticate against the first
//! responsive master, subscribe, and for every publication verify,
//! decode, match, and dispatch to the worker pool. Session loss (AEAD
//! failure, reconnect, repeated heartbeat failure) re-runs the handshake;
//! fatal auth states end the engine with the error for the operator.

use crate::auth::AuthClient;
use crate::functions::{ExecContext, FunctionRegistry};
use crate::grains;
use crate::transports::TransportFactory;
use crate::workers::{JobRunner, QueuedJob, WorkerPool};
use futures::FutureExt;
use herd_bus::EventBus;
use herd_crypto::{AeadHandle, RsaKeypair};
use herd_targeting::MinionFacts;
use herd_transport::backoff::Backoff;
use herd_transport::{PublishClient, RequestClient, SubEvent};
use herd_types::codec;
use herd_types::envelope::{EncKind, Envelope};
use herd_types::error::{AuthError, CoreError, CryptoError, TransportError, UserError};
use herd_types::job::Return;
use herd_types::wire::{PublishLoad, RequestLoad, RequestReply, KILL_FUNCTION};
use herd_types::{JobId, MinionId};
use herd_types::config::MinionConfig;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map, Value};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// How many publications are remembered for at-most-once execution.
const SEEN_JIDS: usize = 1024;
/// Consecutive heartbeat transport failures before failing over.
const HEARTBEAT_FAILOVER_THRESHOLD: u32 = 3;

fn is_fatal_auth(e: &CoreError) -> bool {
    matches!(
        e,
        CoreError::Auth(AuthError::Rejected)
            | CoreError::Auth(AuthError::Denied)
            | CoreError::Auth(AuthError::MasterNotTrusted)
    )
}

struct SeenJids {
    order: VecDeque<JobId>,
    set: HashSet<JobId>,
}

impl SeenJids {
    fn insert(&mut self, jid: &JobId) -> bool {
        if self.set.contains(jid) {
            return false;
        }
        if self.order.len() >= SEEN_JIDS {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        self.order.push_back(jid.clone());
        self.set.insert(jid.clone());
        true
    }
}

/// The per-session shared state: the current AEAD handle and the path to
/// refresh it.
struct Session {
    id: MinionId,
    req: Arc<dyn RequestClient>,
    handle: RwLock<Arc<AeadHandle>>,
    auth: AuthClient,
    auth_gate: tokio::sync::Mutex<()>,
    acceptance_backoff: (Duration, Duration),
}

impl Session {
    /// Re-runs the handshake and installs the fresh session handle.
    /// Serialised so concurrent AEAD failures trigger one handshake.
    async fn reauth(&self) -> Result<(), CoreError> {
        let _gate = self.auth_gate.lock().await;
        let handle =
            auth_until_accepted(&self.auth, self.req.as_ref(), self.acceptance_backoff).await?;
        *self.handle.write() = Arc::new(handle);
        tracing::info!(id = %self.id, "re-authenticated, new session key installed");
        Ok(())
    }

    fn current(&self) -> Arc<AeadHandle> {
        self.handle.read().clone()
    }

    /// One sealed request/reply round trip.
    async fn request(&self, load: &RequestLoad) -> Result<RequestReply, CoreError> {
        let handle = self.current();
        let sealed = handle.seal(&codec::to_bytes(load)?)?;
        let reply = self.req.request(Envelope::aes(sealed)).await?;
        match reply.enc {
            EncKind::Aes => {
                let bytes = handle.open(&reply.load)?;
                Ok(codec::from_bytes(&bytes)?)
            }
            EncKind::Clear => {
                // The master answers in the clear only to say it could not
                // authenticate us.
                let parsed: RequestReply = reply.open_clear()?;
                match parsed {
                    RequestReply::Error { code, message } => {
                        if code.starts_with("CRYPTO_") {
                            Err(CryptoError::BadHmac.into())
                        } else if code == "USER_NOT_AUTHORIZED" {
                            Err(UserError::NotAuthorized.into())
                        } else {
                            Err(TransportError::ProtocolViolation(format!(
                                "{}: {}",
                                code, message
                            ))
                            .into())
                        }
                    }
                    other => Err(TransportError::ProtocolViolation(format!(
                        "unexpected clear reply: {:?}",
                        other
                    ))
                    .into()),
                }
            }
            EncKind::Pub => Err(TransportError::ProtocolViolation(
                "pub envelope on an established session".into(),
            )
            .into()),
        }
    }

    /// As `request`, re-authenticating once on an authentication failure
    /// (session rotation) and retrying the request that hit it.
    async fn request_with_reauth(&self, load: &RequestLoad) -> Result<RequestReply, CoreError> {
        match self.request(load).await {
            Err(CoreError::Crypto(_)) => {
                self.reauth().await?;
                self.request(load).await
            }
            other => other,
        }
    }
}

async fn auth_until_accepted(
    auth: &AuthClient,
    req: &dyn RequestClient,
    (wait, cap): (Duration, Duration),
) -> Result<AeadHandle, CoreError> {
    let mut backoff = Backoff::new(wait, cap);
    loop {
        match auth.authenticate(req).await {
            Ok(handle) => return Ok(handle),
            Err(CoreError::Auth(AuthError::Pending)) => {
                let delay = backoff.delay();
                tracing::info!(?delay, "key pending acceptance, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

enum ServeEnd {
    /// The transport to the current master is gone; fail over.
    Lost,
}

/// The minion engine.
pub struct Minion {
    config: Arc<MinionConfig>,
    id: MinionId,
    keys: Arc<RsaKeypair>,
    registry: Arc<FunctionRegistry>,
    bus: EventBus,
    grains: Map<String, Value>,
    addrs: Vec<std::net::IpAddr>,
    seen: Mutex<SeenJids>,
}

impl Minion {
    /// Loads (or generates) the identity keypair and collects grains.
    pub fn new(config: MinionConfig) -> Result<Self, CoreError> {
        let id = config.resolved_id();
        let keys = Arc::new(RsaKeypair::load_or_generate(
            &config.pki_dir,
            "minion",
            config.key_size,
        )?);
        let mut grains = grains::collect(&id, &config);
        let addrs = grains::local_addrs(&config.masters, config.master_port);
        if !grains.contains_key("ipv4") && !addrs.is_empty() {
            grains.insert(
                "ipv4".to_string(),
                json!(addrs.iter().map(|a| a.to_string()).collect::<Vec<_>>()),
            );
        }
        Ok(Self {
            config: Arc::new(config),
            id,
            keys,
            registry: Arc::new(FunctionRegistry::builtin()),
            bus: EventBus::new(1024),
            grains,
            addrs,
            seen: Mutex::new(SeenJids {
                order: VecDeque::new(),
                set: HashSet::new(),
            }),
        })
    }

    /// Replaces the function table (embedders register their own modules).
    pub fn with_registry(mut self, registry: FunctionRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    /// This minion's identity.
    pub fn id(&self) -> &MinionId {
        &self.id
    }

    /// The minion-local event bus.
    pub fn bus(&self) -> EventBus {
        self.bus.clone()
    }

    fn facts(&self) -> MinionFacts {
        MinionFacts {
            grains: self.grains.clone(),
            pillar: Map::new(),
            addrs: self.addrs.clone(),
        }
    }

    fn auth_client(&self) -> AuthClient {
        AuthClient::new(
            self.id.clone(),
            self.keys.clone(),
            self.config.pki_dir.clone(),
            self.config.master_finger.clone(),
            self.config.trust_on_first_use,
        )
    }

    /// Runs the engine until a fatal auth state.
    pub async fn run(&self, factory: Arc<dyn TransportFactory>) -> Result<(), CoreError> {
        loop {
            let (session, master) = self.connect(factory.as_ref()).await?;
            tracing::info!(id = %self.id, master = %master, "connected and authenticated");
            let sub = factory.publish_client(&master, self.id.clone());
            match self.serve(session, sub).await {
                Ok(ServeEnd::Lost) => {
                    tracing::warn!(master = %master, "master unresponsive, failing over");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Failover: first responsive master of the ordered list wins.
    async fn connect(
        &self,
        factory: &dyn TransportFactory,
    ) -> Result<(Arc<Session>, String), CoreError> {
        let acceptance = (
            Duration::from_secs(self.config.acceptance_wait_secs),
            Duration::from_secs(self.config.acceptance_wait_cap_secs),
        );
        let mut backoff = Backoff::reconnect();
        loop {
            for master in &self.config.masters {
                let req = factory.request_client(master);
                let auth = self.auth_client();
                match auth_until_accepted(&auth, req.as_ref(), acceptance).await {
                    Ok(handle) => {
                        let session = Arc::new(Session {
                            id: self.id.clone(),
                            req,
                            handle: RwLock::new(Arc::new(handle)),
                            auth,
                            auth_gate: tokio::sync::Mutex::new(()),
                            acceptance_backoff: acceptance,
                        });
                        return Ok((session, master.clone()));
                    }
                    Err(e) if is_fatal_auth(&e) => {
                        tracing::error!(master = %master, error = %e, "authentication is fatal");
                        return Err(e);
                    }
                    Err(e) => {
                        tracing::warn!(master = %master, error = %e, "master not responsive");
                    }
                }
            }
            let delay = backoff.delay();
            tracing::info!(?delay, "no responsive master, retrying list");
            tokio::time::sleep(delay).await;
        }
    }

    async fn serve(
        &self,
        session: Arc<Session>,
        mut sub: Box<dyn PublishClient>,
    ) -> Result<ServeEnd, CoreError> {
        let pool = WorkerPool::new(
            self.config.worker_pool,
            self.config.job_queue,
            self.runner(session.clone()),
        );

        let (lost_tx, mut lost_rx) = tokio::sync::watch::channel(false);
        let heartbeat = tokio::spawn(heartbeat_loop(
            session.clone(),
            self.grains.clone(),
            Duration::from_secs(self.config.heartbeat_secs),
            lost_tx,
        ));

        let mut connected_once = false;
        let end = loop {
            tokio::select! {
                event = sub.next() => match event {
                    Ok(SubEvent::Connected) => {
                        if connected_once {
                            // Everything published while we were away is
                            // gone; re-auth before trusting anything new.
                            if let Err(e) = session.reauth().await {
                                if is_fatal_auth(&e) {
                                    break Err(e);
                                }
                                tracing::warn!(error = %e, "re-auth after reconnect failed");
                                break Ok(ServeEnd::Lost);
                            }
                        }
                        connected_once = true;
                    }
                    Ok(SubEvent::Publication(env)) => {
                        if let Err(e) = self.handle_publication(&session, &pool, env).await {
                            if is_fatal_auth(&e) {
                                break Err(e);
                            }
                            tracing::warn!(error = %e, "publication dropped");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "publish subscription lost");
                        break Ok(ServeEnd::Lost);
                    }
                },
                _ = lost_rx.changed() => {
                    break Ok(ServeEnd::Lost);
                }
            }
        };

        heartbeat.abort();
        pool.shutdown();
        end
    }

    async fn handle_publication(
        &self,
        session: &Arc<Session>,
        pool: &WorkerPool,
        env: Envelope,
    ) -> Result<(), CoreError> {
        if env.enc != EncKind::Aes {
            tracing::warn!(enc = ?env.enc, "non-aes publication dropped");
            return Ok(());
        }

        // AEAD failure means the session key rotated under us: re-auth,
        // then retry this same message under the new key.
        let bytes = match session.current().open(&env.load) {
            Ok(bytes) => bytes,
            Err(_) => {
                session.reauth().await?;
                match session.current().open(&env.load) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::warn!(code = herd_types::error::ErrorCode::code(&e), "publication predates the new session key, dropped");
                        return Ok(());
                    }
                }
            }
        };

        let load: PublishLoad = codec::from_bytes(&bytes)?;
        if !self.seen.lock().insert(&load.jid) {
            tracing::debug!(jid = %load.jid, "duplicate publication ignored");
            return Ok(());
        }

        if load.fun == KILL_FUNCTION {
            let target = load
                .arg
                .first()
                .and_then(|v| v.as_str())
                .map(JobId::from_existing);
            let killed = match &target {
                Some(jid) => pool.cancel(jid),
                None => false,
            };
            let ret = Return {
                jid: load.jid.clone(),
                id: self.id.clone(),
                retcode: 0,
                ret: json!({ "killed": killed }),
                success: true,
                fun: load.fun.clone(),
                stamp: chrono::Utc::now(),
            };
            submit_return(session, &self.config, ret).await;
            return Ok(());
        }

        let spec = load.target();
        match herd_targeting::matches(&self.id, &self.facts(), &spec) {
            Ok(true) => {
                tracing::debug!(jid = %load.jid, fun = %load.fun, "publication matched, queued");
                pool.submit(load);
            }
            Ok(false) => {
                tracing::trace!(jid = %load.jid, "publication does not target this minion");
            }
            Err(e) => {
                tracing::warn!(jid = %load.jid, error = %e, "unevaluable target expression");
            }
        }
        Ok(())
    }

    /// Builds the worker-pool closure executing one job end to end.
    fn runner(&self, session: Arc<Session>) -> JobRunner {
        let registry = self.registry.clone();
        let config = self.config.clone();
        let grains = self.grains.clone();
        let bus = self.bus.clone();
        let id = self.id.clone();

        Arc::new(move |job: QueuedJob| {
            let registry = registry.clone();
            let config = config.clone();
            let grains = grains.clone();
            let bus = bus.clone();
            let id = id.clone();
            let session = session.clone();
            async move {
                let ret = execute_job(&registry, &config, grains, bus, id, &job).await;
                submit_return(&session, &config, ret).await;
            }
            .boxed()
        })
    }
}

async fn execute_job(
    registry: &FunctionRegistry,
    config: &Arc<MinionConfig>,
    grains: Map<String, Value>,
    bus: EventBus,
    id: MinionId,
    job: &QueuedJob,
) -> Return {
    let load = &job.load;
    let Some(fun) = registry.get(&load.fun) else {
        return Return::failure(
            load.jid.clone(),
            id,
            load.fun.clone(),
            format!("'{}' is not available on this minion", load.fun),
        );
    };

    let ctx = ExecContext::new(
        config.clone(),
        grains,
        load.jid.clone(),
        bus,
        job.cancel.clone(),
    );
    let outcome = fun(ctx, load.arg.clone(), load.kwarg.clone()).await;

    if job.cancel.load(std::sync::atomic::Ordering::SeqCst) {
        return Return::failure(load.jid.clone(), id, load.fun.clone(), "job killed".into());
    }

    match outcome {
        Ok(value) => Return {
            jid: load.jid.clone(),
            id,
            retcode: 0,
            ret: value,
            success: true,
            fun: load.fun.clone(),
            stamp: chrono::Utc::now(),
        },
        // Internal failures never propagate; they become a failed return.
        Err(e) => Return::failure(load.jid.clone(), id, load.fun.clone(), e.to_string()),
    }
}

async fn submit_return(session: &Arc<Session>, config: &Arc<MinionConfig>, ret: Return) {
    let load = RequestLoad::Return(ret.clone());
    let mut backoff = Backoff::new(
        Duration::from_secs(1),
        Duration::from_secs(config.return_backoff_cap_secs),
    );
    for attempt in 1..=config.return_retries {
        match session.request_with_reauth(&load).await {
            Ok(RequestReply::Ok) => return,
            Ok(other) => {
                tracing::warn!(jid = %ret.jid, reply = ?other, "master refused return");
                return;
            }
            Err(e) if is_fatal_auth(&e) => {
                tracing::error!(jid = %ret.jid, error = %e, "return dropped, auth is fatal");
                return;
            }
            Err(e) => {
                let delay = backoff.delay();
                tracing::warn!(
                    jid = %ret.jid,
                    attempt,
                    error = %e,
                    ?delay,
                    "return submission failed, backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
    tracing::error!(jid = %ret.jid, attempts = config.return_retries, "return dropped after exhausting retries");
}

async fn heartbeat_loop(
    session: Arc<Session>,
    grains: Map<String, Value>,
    interval: Duration,
    lost: tokio::sync::watch::Sender<bool>,
) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; the master learns our grains
    // right after auth.
    let mut consecutive_failures = 0u32;
    loop {
        tick.tick().await;
        let load = RequestLoad::Heartbeat {
            id: session.id.clone(),
            grains: grains.clone(),
        };
        match session.request_with_reauth(&load).await {
            Ok(_) => consecutive_failures = 0,
            Err(CoreError::Transport(e)) => {
                consecutive_failures += 1;
                tracing::warn!(error = %e, consecutive_failures, "heartbeat failed");
                if consecutive_failures >= HEARTBEAT_FAILOVER_THRESHOLD {
                    let _ = lost.send(true);
                    return;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "heartbeat refused");
            }
        }
    }
}
