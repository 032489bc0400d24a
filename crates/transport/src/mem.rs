// Path: crates/transport/src/mem.rs
//! In-process broker adapter.
//!
//! Implements both channel pairs over plain channels, standing in the
//! pluggable transport seam for single-process deployments and for
//! end-to-end tests that want real crypto and dispatch without sockets.

use crate::traits::{
    PeerInfo, PublishClient, PublishServer, RequestClient, RequestHandler, RequestServer, SubEvent,
};
use async_trait::async_trait;
use herd_types::envelope::Envelope;
use herd_types::error::TransportError;
use herd_types::MinionId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

const SUBSCRIBER_QUEUE: usize = 1024;

/// A broker connecting both channels inside one process.
pub struct MemBroker {
    subs: Mutex<HashMap<MinionId, mpsc::Sender<Envelope>>>,
    handler: Mutex<Option<Arc<dyn RequestHandler>>>,
    conn_counter: AtomicU64,
}

impl MemBroker {
    /// Creates an empty broker.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subs: Mutex::new(HashMap::new()),
            handler: Mutex::new(None),
            conn_counter: AtomicU64::new(1),
        })
    }

    /// Installs the request handler; requests before this fail with
    /// `Disconnected`, exactly like a not-yet-listening TCP server.
    pub fn set_handler(&self, handler: Arc<dyn RequestHandler>) {
        *self.handler.lock() = Some(handler);
    }

    /// Opens a subscription for `id`.
    pub fn subscribe(&self, id: MinionId) -> MemPublishClient {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        self.subs.lock().insert(id, tx);
        MemPublishClient {
            rx,
            announced: false,
        }
    }

    /// Opens a request client against this broker.
    pub fn request_client(self: &Arc<Self>) -> MemRequestClient {
        MemRequestClient {
            broker: self.clone(),
            peer: PeerInfo {
                conn_id: self.conn_counter.fetch_add(1, Ordering::Relaxed),
                remote: "mem".to_string(),
            },
        }
    }
}

#[async_trait]
impl PublishServer for MemBroker {
    async fn publish(&self, env: Envelope) -> Result<(), TransportError> {
        let subs = self.subs.lock();
        for (id, tx) in subs.iter() {
            if let Some(hint) = &env.hint {
                if !hint.includes(id) {
                    continue;
                }
            }
            if tx.try_send(env.clone()).is_err() {
                tracing::warn!(id = %id, "mem subscriber queue full, publication dropped");
            }
        }
        Ok(())
    }

    fn connected(&self) -> Vec<MinionId> {
        self.subs.lock().keys().cloned().collect()
    }

    fn disconnect(&self, id: &MinionId) {
        self.subs.lock().remove(id);
    }

    async fn shutdown(&self) {
        self.subs.lock().clear();
        *self.handler.lock() = None;
    }
}

#[async_trait]
impl RequestServer for MemBroker {
    async fn shutdown(&self) {
        *self.handler.lock() = None;
    }
}

/// The subscriber half handed out by [`MemBroker::subscribe`].
pub struct MemPublishClient {
    rx: mpsc::Receiver<Envelope>,
    announced: bool,
}

#[async_trait]
impl PublishClient for MemPublishClient {
    async fn next(&mut self) -> Result<SubEvent, TransportError> {
        if !self.announced {
            self.announced = true;
            return Ok(SubEvent::Connected);
        }
        match self.rx.recv().await {
            Some(env) => Ok(SubEvent::Publication(env)),
            None => Err(TransportError::Disconnected),
        }
    }
}

/// The requesting half handed out by [`MemBroker::request_client`].
pub struct MemRequestClient {
    broker: Arc<MemBroker>,
    peer: PeerInfo,
}

#[async_trait]
impl RequestClient for MemRequestClient {
    async fn request(&self, env: Envelope) -> Result<Envelope, TransportError> {
        let handler = self
            .broker
            .handler
            .lock()
            .clone()
            .ok_or(TransportError::Disconnected)?;
        Ok(handler.handle(&self.peer, env).await.envelope)
    }
}
