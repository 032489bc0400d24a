// Path: crates/syndic/src/lib.rs
//! # Herd Syndic
//!
//! The relay node: a minion to its upstream master and a master to its
//! downstream minions. Publications received from upstream are re-emitted
//! downstream with their jid intact (the relay never allocates one);
//! downstream returns are aggregated for the forward window and sent
//! upstream as one composite return under the syndic's identity.
#![cfg_attr(
    not(test),
    deny(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::todo,
        clippy::unimplemented
    )
)]

use herd_crypto::{AeadHandle, RsaKeypair};
use herd_master::Master;
use herd_minion::auth::AuthClient;
use herd_minion::transports::{TcpTransports, TransportFactory};
use herd_transport::backoff::Backoff;
use herd_transport::{PublishClient, RequestClient, SubEvent};
use herd_types::codec;
use herd_types::config::{MinionConfig, SyndicConfig};
use herd_types::envelope::{EncKind, Envelope};
use herd_types::error::{AuthError, CoreError};
use herd_types::job::Return;
use herd_types::wire::{PublishLoad, RequestLoad, RequestReply};
use herd_types::MinionId;
use parking_lot::RwLock;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn is_fatal_auth(e: &CoreError) -> bool {
    matches!(
        e,
        CoreError::Auth(AuthError::Rejected)
            | CoreError::Auth(AuthError::Denied)
            | CoreError::Auth(AuthError::MasterNotTrusted)
    )
}

/// The relay.
pub struct Syndic {
    master: Master,
    upstream_config: Arc<MinionConfig>,
    upstream_id: MinionId,
    keys: Arc<RsaKeypair>,
    forward_wait: Duration,
}

impl Syndic {
    /// Builds the relay over an already-built downstream master.
    pub fn new(config: SyndicConfig, master: Master) -> Result<Self, CoreError> {
        let upstream_id = config.upstream.resolved_id();
        let keys = Arc::new(RsaKeypair::load_or_generate(
            &config.upstream.pki_dir,
            "syndic",
            config.upstream.key_size,
        )?);
        Ok(Self {
            master,
            upstream_config: Arc::new(config.upstream),
            upstream_id,
            keys,
            forward_wait: Duration::from_secs(config.forward_wait_secs),
        })
    }

    /// Binds the downstream master over TCP and builds the relay.
    pub async fn serve(config: SyndicConfig) -> Result<Self, CoreError> {
        let master = Master::serve(config.master.clone()).await?;
        Self::new(config, master)
    }

    /// The downstream master (for tests and embedding).
    pub fn master(&self) -> &Master {
        &self.master
    }

    /// Runs the upstream side over TCP until a fatal auth state.
    pub async fn run(&self) -> Result<(), CoreError> {
        let factory = Arc::new(TcpTransports::new(self.upstream_config.clone())?);
        self.run_with(factory).await
    }

    /// Runs the upstream side over the given transport factory.
    pub async fn run_with(&self, factory: Arc<dyn TransportFactory>) -> Result<(), CoreError> {
        let auth = AuthClient::new(
            self.upstream_id.clone(),
            self.keys.clone(),
            self.upstream_config.pki_dir.clone(),
            self.upstream_config.master_finger.clone(),
            self.upstream_config.trust_on_first_use,
        );

        loop {
            let (req, handle, master_addr) = self.connect(&auth, factory.as_ref()).await?;
            tracing::info!(id = %self.upstream_id, master = %master_addr, "syndic connected upstream");
            let handle = Arc::new(RwLock::new(Arc::new(handle)));
            let mut sub = factory.publish_client(&master_addr, self.upstream_id.clone());

            let mut connected_once = false;
            loop {
                match sub.next().await {
                    Ok(SubEvent::Connected) => {
                        if connected_once {
                            match auth.authenticate(req.as_ref()).await {
                                Ok(fresh) => *handle.write() = Arc::new(fresh),
                                Err(e) if is_fatal_auth(&e) => return Err(e),
                                Err(e) => {
                                    tracing::warn!(error = %e, "upstream re-auth failed");
                                    break;
                                }
                            }
                        }
                        connected_once = true;
                    }
                    Ok(SubEvent::Publication(env)) => {
                        if let Err(e) = self.relay(&auth, req.clone(), &handle, env).await {
                            if is_fatal_auth(&e) {
                                return Err(e);
                            }
                            tracing::warn!(error = %e, "upstream publication not relayed");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "upstream subscription lost");
                        break;
                    }
                }
            }
        }
    }

    async fn connect(
        &self,
        auth: &AuthClient,
        factory: &dyn TransportFactory,
    ) -> Result<(Arc<dyn RequestClient>, AeadHandle, String), CoreError> {
        let mut backoff = Backoff::reconnect();
        let mut pending = Backoff::new(
            Duration::from_secs(self.upstream_config.acceptance_wait_secs),
            Duration::from_secs(self.upstream_config.acceptance_wait_cap_secs),
        );
        loop {
            for master in &self.upstream_config.masters {
                let req = factory.request_client(master);
                match auth.authenticate(req.as_ref()).await {
                    Ok(handle) => return Ok((req, handle, master.clone())),
                    Err(CoreError::Auth(AuthError::Pending)) => {
                        let delay = pending.delay();
                        tracing::info!(?delay, "syndic key pending upstream");
                        tokio::time::sleep(delay).await;
                    }
                    Err(e) if is_fatal_auth(&e) => return Err(e),
                    Err(e) => {
                        tracing::warn!(master = %master, error = %e, "upstream master not responsive");
                    }
                }
            }
            tokio::time::sleep(backoff.delay()).await;
        }
    }

    /// Relays one upstream publication downstream and schedules the
    /// composite return.
    async fn relay(
        &self,
        auth: &AuthClient,
        req: Arc<dyn RequestClient>,
        handle: &Arc<RwLock<Arc<AeadHandle>>>,
        env: Envelope,
    ) -> Result<(), CoreError> {
        if env.enc != EncKind::Aes {
            return Ok(());
        }
        let open_result = handle.read().clone().open(&env.load);
        let bytes = match open_result {
            Ok(bytes) => bytes,
            Err(_) => {
                let fresh = auth.authenticate(req.as_ref()).await?;
                *handle.write() = Arc::new(fresh);
                let retry_result = handle.read().clone().open(&env.load);
                match retry_result {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::warn!(error = %e, "publication predates new upstream session");
                        return Ok(());
                    }
                }
            }
        };
        let load: PublishLoad = codec::from_bytes(&bytes)?;
        let jid = load.jid.clone();
        let fun = load.fun.clone();

        // Verbatim re-publication: same load, same jid. The downstream
        // dispatcher re-resolves targets against its own inventory.
        self.master
            .dispatcher()
            .publish_forwarded(load, Some(self.forward_wait))
            .await?;
        tracing::info!(jid = %jid, "publication relayed downstream");

        // After the forward window, aggregate whatever came back and send
        // it upstream as one composite return.
        let cache = self.master.cache();
        let wait = self.forward_wait + Duration::from_millis(250);
        let upstream_handle = handle.clone();
        let upstream_id = self.upstream_id.clone();
        let retries = self.upstream_config.return_retries;
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let Some(view) = cache.status(&jid) else {
                return;
            };
            let mut aggregate = serde_json::Map::new();
            let mut all_ok = true;
            for entry in &view.returns {
                all_ok &= entry.ret.success;
                aggregate.insert(
                    entry.ret.id.to_string(),
                    json!({
                        "retcode": entry.ret.retcode,
                        "return": entry.ret.ret,
                        "success": entry.ret.success,
                    }),
                );
            }
            let composite = Return {
                jid: jid.clone(),
                id: upstream_id,
                retcode: if all_ok { 0 } else { 1 },
                ret: serde_json::Value::Object(aggregate),
                success: all_ok,
                fun,
                stamp: chrono::Utc::now(),
            };
            let load = RequestLoad::Return(composite);
            for attempt in 1..=retries.max(1) {
                let sealed = {
                    let h = upstream_handle.read().clone();
                    match codec::to_bytes(&load).map_err(CoreError::from).and_then(|b| Ok(h.seal(&b)?)) {
                        Ok(sealed) => sealed,
                        Err(e) => {
                            tracing::error!(error = %e, "composite return not sealable");
                            return;
                        }
                    }
                };
                match req.request(Envelope::aes(sealed)).await {
                    Ok(reply) if reply.enc == EncKind::Aes => {
                        let h = upstream_handle.read().clone();
                        if let Ok(bytes) = h.open(&reply.load) {
                            if matches!(codec::from_bytes::<RequestReply>(&bytes), Ok(RequestReply::Ok)) {
                                tracing::info!(jid = %jid, "composite return forwarded upstream");
                                return;
                            }
                        }
                    }
                    Ok(_) | Err(_) => {}
                }
                tracing::warn!(jid = %jid, attempt, "composite forward failed, retrying");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            tracing::error!(jid = %jid, "composite return dropped");
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herd_minion::transports::MemTransports;
    use herd_minion::Minion;
    use herd_transport::mem::MemBroker;
    use herd_types::config::MasterConfig;
    use herd_types::target::TargetSpec;
    use serde_json::Map;

    async fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + timeout;
        while !cond() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not met within {:?}",
                timeout
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    fn master_config(dir: &std::path::Path, name: &str) -> MasterConfig {
        MasterConfig {
            pki_dir: dir.join(name).join("pki"),
            cache_dir: dir.join(name).join("cache"),
            file_root: dir.join(name).join("files"),
            key_size: 2048,
            gather_job_timeout_secs: 5,
            auto_accept: true,
            ..MasterConfig::default()
        }
    }

    fn minion_config(dir: &std::path::Path, id: &str) -> MinionConfig {
        MinionConfig {
            id: Some(id.to_string()),
            masters: vec!["mem".to_string()],
            pki_dir: dir.join(id).join("pki"),
            cache_dir: dir.join(id).join("cache"),
            key_size: 2048,
            heartbeat_secs: 1,
            acceptance_wait_secs: 1,
            acceptance_wait_cap_secs: 2,
            ..MinionConfig::default()
        }
    }

    /// Full chain: upstream master → syndic → downstream minion and back.
    /// The upstream jid must survive the relay end to end.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_relay_preserves_jid_and_aggregates() {
        let dir = tempfile::tempdir().unwrap();

        let broker_up = MemBroker::new();
        let up_master = Master::build(master_config(dir.path(), "up"), broker_up.clone()).unwrap();
        broker_up.set_handler(up_master.request_handler());

        let broker_down = MemBroker::new();
        let down_master =
            Master::build(master_config(dir.path(), "down"), broker_down.clone()).unwrap();
        broker_down.set_handler(down_master.request_handler());

        let syndic_config = SyndicConfig {
            master: master_config(dir.path(), "down"),
            upstream: minion_config(dir.path(), "syn1"),
            forward_wait_secs: 1,
        };
        let syndic = Arc::new(Syndic::new(syndic_config, down_master).unwrap());
        let syndic_task = {
            let syndic = syndic.clone();
            let factory = Arc::new(MemTransports::new(broker_up.clone()));
            tokio::spawn(async move {
                let _ = syndic.run_with(factory).await;
            })
        };

        let minion = Arc::new(Minion::new(minion_config(dir.path(), "m1")).unwrap());
        let minion_task = {
            let minion = minion.clone();
            let factory = Arc::new(MemTransports::new(broker_down.clone()));
            tokio::spawn(async move {
                let _ = minion.run(factory).await;
            })
        };

        wait_for(Duration::from_secs(10), || {
            herd_transport::PublishServer::connected(&*broker_up)
                .contains(&MinionId::new("syn1"))
                && herd_transport::PublishServer::connected(&*broker_down)
                    .contains(&MinionId::new("m1"))
        })
        .await;

        let (jid, _) = up_master
            .dispatcher()
            .publish(herd_master::PublishCommand {
                target: TargetSpec::glob("*"),
                fun: "test.echo".to_string(),
                arg: vec![json!("relayed")],
                kwarg: Map::new(),
                ret: None,
                user: "root".to_string(),
                timeout: None,
            })
            .await
            .unwrap();

        // The downstream master records the job under the upstream jid.
        let down_cache = syndic.master().cache();
        wait_for(Duration::from_secs(5), {
            let jid = jid.clone();
            move || down_cache.status(&jid).is_some()
        })
        .await;

        // The composite return lands upstream under the syndic identity.
        let up_cache = up_master.cache();
        wait_for(Duration::from_secs(8), {
            let jid = jid.clone();
            let up_cache = up_cache.clone();
            move || {
                up_cache
                    .status(&jid)
                    .map(|v| !v.returns.is_empty())
                    .unwrap_or(false)
            }
        })
        .await;

        let view = up_cache.status(&jid).unwrap();
        assert_eq!(view.returns.len(), 1);
        let composite = &view.returns[0].ret;
        assert_eq!(composite.id, MinionId::new("syn1"));
        assert!(composite.success);
        assert_eq!(
            composite.ret["m1"]["return"],
            json!("relayed"),
            "downstream result must appear in the aggregate"
        );

        syndic_task.abort();
        minion_task.abort();
    }
}
