// Path: crates/minion/src/tests/mod.rs
//! End-to-end master/minion scenarios over the in-process broker, with
//! real keys, real session crypto, and the real dispatch path.

use crate::transports::MemTransports;
use crate::Minion;
use herd_master::dispatcher::PublishCommand;
use herd_master::Master;
use herd_transport::mem::MemBroker;
use herd_transport::RequestClient;
use herd_types::config::{MasterConfig, MinionConfig};
use herd_types::envelope::Envelope;
use herd_types::job::JobState;
use herd_types::target::{MatcherKind, TargetSpec};
use herd_types::wire::{AuthRefusal, AuthRequest};
use herd_types::{JobId, MinionId};
use serde_json::{json, Map};
use std::sync::Arc;
use std::time::Duration;

const DUMMY_PEM: &str = "-----BEGIN PUBLIC KEY-----\nDUMMY\n-----END PUBLIC KEY-----\n";

struct Rig {
    master: Master,
    broker: Arc<MemBroker>,
    _dir: tempfile::TempDir,
    minion_tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Rig {
    fn new(auto_accept: bool, gather_secs: u64) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = MasterConfig {
            pki_dir: dir.path().join("pki/master"),
            cache_dir: dir.path().join("cache"),
            file_root: dir.path().join("files"),
            key_size: 2048,
            gather_job_timeout_secs: gather_secs,
            auto_accept,
            ..MasterConfig::default()
        };
        let broker = MemBroker::new();
        let master = Master::build(config, broker.clone()).unwrap();
        broker.set_handler(master.request_handler());
        Self {
            master,
            broker,
            _dir: dir,
            minion_tasks: Vec::new(),
        }
    }

    fn minion_config(&self, id: &str) -> MinionConfig {
        MinionConfig {
            id: Some(id.to_string()),
            masters: vec!["mem".to_string()],
            pki_dir: self._dir.path().join("pki").join(id),
            cache_dir: self._dir.path().join("cache").join(id),
            key_size: 2048,
            heartbeat_secs: 1,
            acceptance_wait_secs: 1,
            acceptance_wait_cap_secs: 2,
            ..MinionConfig::default()
        }
    }

    /// Starts a minion engine in the background.
    fn spawn_minion(&mut self, config: MinionConfig) -> Arc<Minion> {
        let minion = Arc::new(Minion::new(config).unwrap());
        let factory = Arc::new(MemTransports::new(self.broker.clone()));
        let task_minion = minion.clone();
        self.minion_tasks.push(tokio::spawn(async move {
            if let Err(e) = task_minion.run(factory).await {
                tracing::warn!(error = %e, "minion engine ended");
            }
        }));
        minion
    }

    /// Enrols and accepts an id that never actually connects.
    fn accept_offline(&self, id: &str) {
        let keystore = self.master.keystore();
        keystore
            .enroll_pending(&MinionId::new(id), DUMMY_PEM)
            .unwrap();
        keystore.accept(&MinionId::new(id)).unwrap();
    }

    /// Waits until `id` is pending, then accepts it.
    async fn accept_when_pending(&self, id: &str) {
        let keystore = self.master.keystore();
        let minion_id = MinionId::new(id);
        wait_for(Duration::from_secs(10), || {
            keystore
                .lookup(&minion_id)
                .ok()
                .flatten()
                .map(|r| r.state == herd_pki::KeyState::Pending)
                .unwrap_or(false)
        })
        .await;
        keystore.accept(&minion_id).unwrap();
    }

    /// Waits until every named minion is subscribed to the publish
    /// channel (i.e. fully authed and serving).
    async fn wait_connected(&self, ids: &[&str]) {
        wait_for(Duration::from_secs(15), || {
            let connected = herd_transport::PublishServer::connected(&*self.broker);
            ids.iter().all(|id| connected.contains(&MinionId::new(*id)))
        })
        .await;
    }

    fn publish_cmd(target: TargetSpec, fun: &str, arg: Vec<serde_json::Value>) -> PublishCommand {
        PublishCommand {
            target,
            fun: fun.to_string(),
            arg,
            kwarg: Map::new(),
            ret: None,
            user: "root".to_string(),
            timeout: None,
        }
    }

    async fn wait_closed(&self, jid: &JobId, secs: u64) -> herd_types::wire::JobStatusView {
        let cache = self.master.cache();
        wait_for(Duration::from_secs(secs), || {
            cache
                .status(jid)
                .map(|v| v.state == JobState::Closed)
                .unwrap_or(false)
        })
        .await;
        cache.status(jid).unwrap()
    }
}

impl Drop for Rig {
    fn drop(&mut self) {
        for task in &self.minion_tasks {
            task.abort();
        }
    }
}

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

/// S1: first contact, operator accept, then a targeted echo.
#[tokio::test(flavor = "multi_thread")]
async fn test_first_contact_auth_then_echo() {
    let mut rig = Rig::new(false, 10);
    rig.spawn_minion(rig.minion_config("m1"));
    rig.accept_when_pending("m1").await;
    rig.wait_connected(&["m1"]).await;

    let (jid, resolution) = rig
        .master
        .dispatcher()
        .publish(Rig::publish_cmd(
            TargetSpec::glob("m1"),
            "test.echo",
            vec![json!("hello")],
        ))
        .await
        .unwrap();
    assert!(resolution.exact);

    let view = rig.wait_closed(&jid, 8).await;
    assert_eq!(view.returns.len(), 1);
    let entry = &view.returns[0];
    assert_eq!(entry.ret.id, MinionId::new("m1"));
    assert_eq!(entry.ret.ret, json!("hello"));
    assert_eq!(entry.ret.retcode, 0);
    assert!(entry.ret.success);
    assert!(!entry.late);
    assert!(view.missing.is_empty());
}

/// S2: an imposter submitting a different key for an accepted id is
/// denied with no state transition, and the denial event fires.
#[tokio::test(flavor = "multi_thread")]
async fn test_denied_on_mismatched_key() {
    let mut rig = Rig::new(false, 10);
    rig.spawn_minion(rig.minion_config("m1"));
    rig.accept_when_pending("m1").await;
    rig.wait_connected(&["m1"]).await;

    let mut denied_events = rig.master.bus().subscribe("herd/auth/denied/m1").unwrap();

    let imposter_keys = herd_crypto::RsaKeypair::generate(2048).unwrap();
    let req = AuthRequest {
        id: MinionId::new("m1"),
        pub_pem: imposter_keys.public_pem().unwrap(),
        token: vec![0u8; 16],
    };
    let client = rig.broker.request_client();
    let reply = client.request(Envelope::clear(&req).unwrap()).await.unwrap();
    assert_eq!(
        reply.open_clear::<AuthRefusal>().unwrap(),
        AuthRefusal::Denied
    );

    // No state transition: the real key is still accepted.
    let rec = rig
        .master
        .keystore()
        .lookup(&MinionId::new("m1"))
        .unwrap()
        .unwrap();
    assert_eq!(rec.state, herd_pki::KeyState::Accepted);

    let event = tokio::time::timeout(Duration::from_secs(2), denied_events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.tag, "herd/auth/denied/m1");
}

/// S3: the session key rotates while a job is in flight; minions re-auth
/// and all returns still arrive inside the gather window.
#[tokio::test(flavor = "multi_thread")]
async fn test_session_rotation_mid_job() {
    let mut rig = Rig::new(true, 10);
    for id in ["m1", "m2", "m3"] {
        rig.spawn_minion(rig.minion_config(id));
    }
    rig.wait_connected(&["m1", "m2", "m3"]).await;

    let (jid, _) = rig
        .master
        .dispatcher()
        .publish(Rig::publish_cmd(
            TargetSpec::glob("m*"),
            "test.sleep",
            vec![json!(2)],
        ))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    rig.master.rotate_session().unwrap();

    let view = rig.wait_closed(&jid, 9).await;
    assert_eq!(view.returns.len(), 3);
    assert!(view.missing.is_empty());
    assert!(view.returns.iter().all(|e| e.ret.success && !e.late));
}

/// S4: five accepted minions, three connected, short gather timeout:
/// three returns, two flagged missing.
#[tokio::test(flavor = "multi_thread")]
async fn test_unreachable_target_subset() {
    let mut rig = Rig::new(true, 2);
    for id in ["m1", "m2", "m3"] {
        rig.spawn_minion(rig.minion_config(id));
    }
    rig.accept_offline("m4");
    rig.accept_offline("m5");
    rig.wait_connected(&["m1", "m2", "m3"]).await;

    let (jid, resolution) = rig
        .master
        .dispatcher()
        .publish(Rig::publish_cmd(
            TargetSpec::glob("*"),
            "test.ping",
            vec![],
        ))
        .await
        .unwrap();
    assert_eq!(resolution.minions.len(), 5);

    let view = rig.wait_closed(&jid, 6).await;
    assert_eq!(view.returns.len(), 3);
    assert_eq!(
        view.missing,
        vec![MinionId::new("m4"), MinionId::new("m5")]
    );
}

/// S5: a compound target pre-filters server-side from the grain cache;
/// only the matched minions receive the publication at all.
#[tokio::test(flavor = "multi_thread")]
async fn test_compound_prefilter() {
    let mut rig = Rig::new(true, 3);
    for id in ["m1", "m2", "m4"] {
        let mut config = rig.minion_config(id);
        config.grains.insert("role".to_string(), json!("web"));
        rig.spawn_minion(config);
    }
    rig.spawn_minion(rig.minion_config("m5"));
    rig.accept_offline("m3");
    rig.wait_connected(&["m1", "m2", "m4", "m5"]).await;

    // Heartbeats feed the grain cache; wait until the master holds the
    // role grain for the web minions.
    let inventory = rig.master.inventory();
    wait_for(Duration::from_secs(10), || {
        ["m1", "m2", "m4"].iter().all(|id| {
            herd_targeting::InventoryView::facts(&*inventory, &MinionId::new(*id))
                .map(|f| f.grains.contains_key("role"))
                .unwrap_or(false)
        })
    })
    .await;

    let (jid, resolution) = rig
        .master
        .dispatcher()
        .publish(Rig::publish_cmd(
            TargetSpec::new("G@role:web and L@m1,m2", MatcherKind::Compound),
            "test.ping",
            vec![],
        ))
        .await
        .unwrap();

    assert!(resolution.exact);
    let targeted: Vec<&str> = resolution.minions.iter().map(|m| m.as_str()).collect();
    assert_eq!(targeted, vec!["m1", "m2"]);

    let view = rig.wait_closed(&jid, 6).await;
    assert_eq!(view.returns.len(), 2);
    let ids: Vec<&str> = view.returns.iter().map(|e| e.ret.id.as_str()).collect();
    assert!(ids.contains(&"m1") && ids.contains(&"m2"));
    assert!(view.missing.is_empty());
}

/// S6: a return arriving after the gather deadline is appended with the
/// late flag and the return event carries it.
#[tokio::test(flavor = "multi_thread")]
async fn test_late_return_after_close() {
    let mut rig = Rig::new(true, 1);
    rig.spawn_minion(rig.minion_config("m1"));
    rig.wait_connected(&["m1"]).await;

    let mut ret_events = rig.master.bus().subscribe("herd/job/*/ret/*").unwrap();

    let (jid, _) = rig
        .master
        .dispatcher()
        .publish(Rig::publish_cmd(
            TargetSpec::glob("m1"),
            "test.sleep",
            vec![json!(1.5)],
        ))
        .await
        .unwrap();

    // The job closes at the deadline with the minion still sleeping.
    let view = rig.wait_closed(&jid, 3).await;
    assert_eq!(view.missing, vec![MinionId::new("m1")]);
    assert!(view.returns.is_empty());

    // The return lands late and supersedes the missing flag.
    let cache = rig.master.cache();
    wait_for(Duration::from_secs(5), || {
        cache
            .status(&jid)
            .map(|v| v.returns.len() == 1)
            .unwrap_or(false)
    })
    .await;
    let view = cache.status(&jid).unwrap();
    assert!(view.returns[0].late);
    assert!(view.missing.is_empty());

    let event = tokio::time::timeout(Duration::from_secs(2), ret_events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.tag, format!("herd/job/{}/ret/m1", jid));
    assert_eq!(event.data.get("late"), Some(&json!(true)));
}

/// Property 5 backstop: a duplicate return from the same minion leaves a
/// single cache entry equal to the first copy.
#[tokio::test(flavor = "multi_thread")]
async fn test_return_idempotence_end_to_end() {
    let mut rig = Rig::new(true, 5);
    rig.spawn_minion(rig.minion_config("m1"));
    rig.wait_connected(&["m1"]).await;

    let (jid, _) = rig
        .master
        .dispatcher()
        .publish(Rig::publish_cmd(
            TargetSpec::glob("m1"),
            "test.echo",
            vec![json!("first")],
        ))
        .await
        .unwrap();
    let view = rig.wait_closed(&jid, 6).await;
    assert_eq!(view.returns.len(), 1);

    // Replay the same return through the dispatcher with altered data.
    let mut replay = view.returns[0].ret.clone();
    replay.ret = json!("second");
    rig.master.dispatcher().handle_return(replay);

    let view = rig.master.cache().status(&jid).unwrap();
    assert_eq!(view.returns.len(), 1);
    assert_eq!(view.returns[0].ret.ret, json!("first"));
}

/// A terminate-job publication cancels a running worker cooperatively.
#[tokio::test(flavor = "multi_thread")]
async fn test_kill_job_cancels_worker() {
    let mut rig = Rig::new(true, 30);
    rig.spawn_minion(rig.minion_config("m1"));
    rig.wait_connected(&["m1"]).await;

    let (victim, _) = rig
        .master
        .dispatcher()
        .publish(Rig::publish_cmd(
            TargetSpec::glob("m1"),
            "test.sleep",
            vec![json!(30)],
        ))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let (_kill_jid, _) = rig
        .master
        .dispatcher()
        .publish(Rig::publish_cmd(
            TargetSpec::glob("m1"),
            herd_types::wire::KILL_FUNCTION,
            vec![json!(victim.as_str())],
        ))
        .await
        .unwrap();

    // The victim's return arrives promptly as a failure, not after 30 s.
    let cache = rig.master.cache();
    wait_for(Duration::from_secs(5), || {
        cache
            .status(&victim)
            .map(|v| !v.returns.is_empty())
            .unwrap_or(false)
    })
    .await;
    let view = cache.status(&victim).unwrap();
    assert!(!view.returns[0].ret.success);
}
