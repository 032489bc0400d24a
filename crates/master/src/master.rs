// Path: crates/master/src/master.rs
//! Master daemon wiring.

use crate::auth::AuthHandler;
use crate::control::ControlHandler;
use crate::dispatcher::Dispatcher;
use crate::files::LocalFiles;
use crate::inventory::MasterInventory;
use crate::jobs::{JobCache, LocalCacheReturner};
use crate::request::MasterRequestHandler;
use crate::runners::RunnerContext;
use chrono::Duration as ChronoDuration;
use herd_bus::EventBus;
use herd_crypto::{RsaKeypair, SessionKeyring};
use herd_pki::KeyStore;
use herd_transport::tcp::{TcpPublishServer, TcpRequestServer};
use herd_transport::{PublishServer, RequestServer};
use herd_types::config::MasterConfig;
use herd_types::error::CoreError;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// How recent a heartbeat keeps a minion in `manage.up`.
const LIVENESS_WINDOW_SECS: i64 = 150;
/// Upper bound on cached jobs.
const MAX_CACHED_JOBS: usize = 100_000;
/// Cadence of the retention sweep.
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// A fully wired master.
pub struct Master {
    config: MasterConfig,
    keystore: Arc<KeyStore>,
    keyring: Arc<SessionKeyring>,
    bus: EventBus,
    cache: Arc<JobCache>,
    inventory: Arc<MasterInventory>,
    dispatcher: Arc<Dispatcher>,
    request_handler: Arc<MasterRequestHandler>,
    control_handler: Arc<ControlHandler>,
    pub_server: Arc<dyn PublishServer>,
    servers: Vec<Box<dyn RequestServer>>,
    prune_task: JoinHandle<()>,
}

impl Master {
    /// Builds every component over an existing publish server. Used
    /// directly by the syndic (which brings its own transports) and by
    /// in-process deployments; `serve` is the TCP entry point.
    ///
    /// Must run inside a tokio runtime (the retention sweep is spawned
    /// here).
    pub fn build(
        config: MasterConfig,
        pub_server: Arc<dyn PublishServer>,
    ) -> Result<Self, CoreError> {
        let keystore = Arc::new(KeyStore::open(&config.pki_dir)?);
        let keys = Arc::new(RsaKeypair::load_or_generate(
            &config.pki_dir,
            "master",
            config.key_size,
        )?);
        let keyring = Arc::new(SessionKeyring::new()?);
        let bus = EventBus::new(config.event_buffer);
        let cache = Arc::new(JobCache::new(config.keep_jobs_hours, MAX_CACHED_JOBS));
        let inventory = Arc::new(MasterInventory::new(
            keystore.clone(),
            config.nodegroups.clone(),
        ));
        let returner = Arc::new(LocalCacheReturner::new(&config.cache_dir));

        let dispatcher = Dispatcher::new(
            cache.clone(),
            inventory.clone(),
            keyring.clone(),
            pub_server.clone(),
            bus.clone(),
            Some(returner),
            Duration::from_secs(config.gather_job_timeout_secs),
        );

        let auth = AuthHandler::new(
            keystore.clone(),
            keys,
            keyring.clone(),
            bus.clone(),
            config.auto_accept,
        );
        let files = Arc::new(LocalFiles::new(&config.file_root));
        let request_handler = MasterRequestHandler::new(
            auth,
            dispatcher.clone(),
            keyring.clone(),
            keystore.clone(),
            inventory.clone(),
            files,
            pub_server.clone(),
            bus.clone(),
        );

        let runner_ctx = RunnerContext {
            cache: cache.clone(),
            inventory: inventory.clone(),
            pub_server: pub_server.clone(),
            keyring: keyring.clone(),
            liveness_window: ChronoDuration::seconds(LIVENESS_WINDOW_SECS),
        };
        let control_handler = ControlHandler::new(dispatcher.clone(), cache.clone(), runner_ctx);

        let prune_cache = cache.clone();
        let prune_task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(PRUNE_INTERVAL);
            loop {
                tick.tick().await;
                prune_cache.prune(chrono::Utc::now());
            }
        });

        Ok(Self {
            config,
            keystore,
            keyring,
            bus,
            cache,
            inventory,
            dispatcher,
            request_handler,
            control_handler,
            pub_server,
            servers: Vec::new(),
            prune_task,
        })
    }

    /// Binds the TCP publish, request, and control channels and starts
    /// serving.
    pub async fn serve(config: MasterConfig) -> Result<Self, CoreError> {
        let tls = config
            .tls
            .as_ref()
            .map(herd_transport::tls::server_config)
            .transpose()?;

        let pub_addr = format!("{}:{}", config.interface, config.publish_port);
        let pub_server = Arc::new(
            TcpPublishServer::bind(&pub_addr, tls.clone(), config.max_frame_size).await?,
        );
        tracing::info!(addr = %pub_addr, "publish channel listening");

        let mut master = Self::build(config, pub_server)?;

        let req_addr = format!(
            "{}:{}",
            master.config.interface, master.config.ret_port
        );
        let req_server = TcpRequestServer::bind(
            &req_addr,
            master.request_handler.clone(),
            tls,
            master.config.max_frame_size,
        )
        .await?;
        tracing::info!(addr = %req_addr, "request channel listening");

        let ctl_addr = format!("127.0.0.1:{}", master.config.control_port);
        let ctl_server = TcpRequestServer::bind(
            &ctl_addr,
            master.control_handler.clone(),
            None,
            master.config.max_frame_size,
        )
        .await?;
        tracing::info!(addr = %ctl_addr, "control channel listening");

        master.servers = vec![Box::new(req_server), Box::new(ctl_server)];
        Ok(master)
    }

    /// The request-channel handler, for wiring onto a non-TCP transport.
    pub fn request_handler(&self) -> Arc<MasterRequestHandler> {
        self.request_handler.clone()
    }

    /// The control-channel handler, for wiring onto a non-TCP transport.
    pub fn control_handler(&self) -> Arc<ControlHandler> {
        self.control_handler.clone()
    }

    /// The dispatcher, for in-process publication (syndic relay).
    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    /// The job cache.
    pub fn cache(&self) -> Arc<JobCache> {
        self.cache.clone()
    }

    /// The event bus.
    pub fn bus(&self) -> EventBus {
        self.bus.clone()
    }

    /// The key store.
    pub fn keystore(&self) -> Arc<KeyStore> {
        self.keystore.clone()
    }

    /// The inventory.
    pub fn inventory(&self) -> Arc<MasterInventory> {
        self.inventory.clone()
    }

    /// Rotates the session key. Minions re-auth on their next failed
    /// decrypt.
    pub fn rotate_session(&self) -> Result<(), CoreError> {
        Ok(self.keyring.rotate()?)
    }

    /// Graceful shutdown: stop accepting publications, let in-flight
    /// collections expire, then close the transports.
    pub async fn shutdown(self) {
        self.dispatcher.drain();

        let grace = Duration::from_secs(self.config.gather_job_timeout_secs + 1);
        let deadline = tokio::time::Instant::now() + grace;
        while self.cache.has_collecting() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        self.prune_task.abort();
        for server in &self.servers {
            server.shutdown().await;
        }
        self.pub_server.shutdown().await;
        tracing::info!("master shut down");
    }
}
