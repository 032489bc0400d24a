// Path: crates/minion/src/transports.rs
//! Transport selection for the minion engine.
//!
//! The engine is written against the channel traits; this factory maps a
//! master address to concrete clients so the same engine runs over TCP,
//! TLS, or the in-process broker.

use herd_transport::mem::MemBroker;
use herd_transport::tcp::{TcpPublishClient, TcpRequestClient};
use herd_transport::{PublishClient, RequestClient};
use herd_types::config::MinionConfig;
use herd_types::error::CoreError;
use herd_types::MinionId;
use std::sync::Arc;
use std::time::Duration;

/// Builds channel clients for one master address.
pub trait TransportFactory: Send + Sync {
    /// A request-channel client for `master`.
    fn request_client(&self, master: &str) -> Arc<dyn RequestClient>;
    /// A publish-channel subscription for `master`.
    fn publish_client(&self, master: &str, id: MinionId) -> Box<dyn PublishClient>;
}

/// The TCP (optionally TLS) factory.
pub struct TcpTransports {
    config: Arc<MinionConfig>,
    tls: Option<Arc<rustls::ClientConfig>>,
}

impl TcpTransports {
    /// Builds the factory, loading TLS material if configured.
    pub fn new(config: Arc<MinionConfig>) -> Result<Self, CoreError> {
        let tls = config
            .tls
            .as_ref()
            .map(herd_transport::tls::client_config)
            .transpose()?;
        Ok(Self { config, tls })
    }
}

impl TransportFactory for TcpTransports {
    fn request_client(&self, master: &str) -> Arc<dyn RequestClient> {
        Arc::new(TcpRequestClient::new(
            format!("{}:{}", master, self.config.master_port),
            self.tls.clone(),
            self.config.max_frame_size,
            Duration::from_secs(self.config.request_timeout_secs),
        ))
    }

    fn publish_client(&self, master: &str, id: MinionId) -> Box<dyn PublishClient> {
        Box::new(TcpPublishClient::new(
            format!("{}:{}", master, self.config.publish_port),
            id,
            self.tls.clone(),
            self.config.max_frame_size,
        ))
    }
}

/// The in-process factory over a [`MemBroker`]. The master address is
/// ignored; there is exactly one broker.
pub struct MemTransports {
    broker: Arc<MemBroker>,
}

impl MemTransports {
    /// Wraps a broker.
    pub fn new(broker: Arc<MemBroker>) -> Self {
        Self { broker }
    }
}

impl TransportFactory for MemTransports {
    fn request_client(&self, _master: &str) -> Arc<dyn RequestClient> {
        Arc::new(self.broker.request_client())
    }

    fn publish_client(&self, _master: &str, id: MinionId) -> Box<dyn PublishClient> {
        Box::new(self.broker.subscribe(id))
    }
}
