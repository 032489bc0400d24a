// Path: crates/transport/src/tcp.rs
//! The framed-TCP adapter for both channels.
//!
//! Publish side: the server keeps one writer task per subscriber; a
//! subscriber announces its id in the clear right after connecting and
//! then only ever reads. Request side: one task per connection runs the
//! strict read-request/write-reply loop, so ordering is correlation.

use crate::backoff::Backoff;
use crate::frame::{read_frame, write_frame};
use crate::tls::{accept_stream, connect_stream, MaybeTls};
use crate::traits::{
    PeerInfo, PublishClient, PublishServer, RequestClient, RequestHandler, RequestServer, SubEvent,
};
use async_trait::async_trait;
use herd_types::envelope::Envelope;
use herd_types::error::TransportError;
use herd_types::wire::SubscribeAnnounce;
use herd_types::MinionId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// How long a fresh publish-channel connection gets to announce itself.
const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(5);
/// Per-subscriber publication queue; a subscriber this far behind starts
/// losing messages, which the best-effort contract allows.
const SUBSCRIBER_QUEUE: usize = 1024;

struct Subscriber {
    tx: mpsc::Sender<Arc<Vec<u8>>>,
    writer: JoinHandle<()>,
}

/// The master-side publish fan-out over TCP.
pub struct TcpPublishServer {
    subs: Arc<Mutex<HashMap<MinionId, Subscriber>>>,
    local_addr: SocketAddr,
    max_frame: usize,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

impl TcpPublishServer {
    /// Binds the publish channel and starts accepting subscribers.
    pub async fn bind(
        addr: &str,
        tls: Option<Arc<rustls::ServerConfig>>,
        max_frame: usize,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::ProtocolViolation(format!("bind {}: {}", addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|_| TransportError::Disconnected)?;
        let subs: Arc<Mutex<HashMap<MinionId, Subscriber>>> = Arc::new(Mutex::new(HashMap::new()));
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let acceptor = tls.map(TlsAcceptor::from);

        let accept_subs = subs.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    accepted = listener.accept() => {
                        let Ok((stream, peer)) = accepted else { continue };
                        let subs = accept_subs.clone();
                        let acceptor = acceptor.clone();
                        tokio::spawn(async move {
                            if let Err(e) =
                                register_subscriber(stream, peer, acceptor, subs, max_frame).await
                            {
                                tracing::debug!(%peer, error = %e, "subscriber setup failed");
                            }
                        });
                    }
                }
            }
        });

        Ok(Self {
            subs,
            local_addr,
            max_frame,
            shutdown,
            accept_task,
        })
    }

    /// The bound address, useful when binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

async fn register_subscriber(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    subs: Arc<Mutex<HashMap<MinionId, Subscriber>>>,
    max_frame: usize,
) -> Result<(), TransportError> {
    let mut stream = accept_stream(stream, acceptor.as_ref()).await?;

    let announce = tokio::time::timeout(ANNOUNCE_TIMEOUT, read_frame(&mut stream, max_frame))
        .await
        .map_err(|_| TransportError::Timeout)??;
    let announce: SubscribeAnnounce = Envelope::from_bytes(&announce)?.open_clear()?;
    let id = announce.id;

    let (tx, mut rx) = mpsc::channel::<Arc<Vec<u8>>>(SUBSCRIBER_QUEUE);
    let writer_subs = subs.clone();
    let writer_id = id.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if write_frame(&mut stream, &frame, max_frame).await.is_err() {
                break;
            }
        }
        drop(rx);
        // Only deregister if the entry is still ours; a reconnect may have
        // already replaced it with a live channel.
        let mut subs = writer_subs.lock();
        if subs.get(&writer_id).map(|s| s.tx.is_closed()) == Some(true) {
            subs.remove(&writer_id);
        }
    });

    tracing::debug!(id = %id, %peer, "publish subscriber connected");
    if let Some(old) = subs.lock().insert(id, Subscriber { tx, writer }) {
        old.writer.abort();
    }
    Ok(())
}

#[async_trait]
impl PublishServer for TcpPublishServer {
    async fn publish(&self, env: Envelope) -> Result<(), TransportError> {
        let bytes = Arc::new(env.to_bytes()?);
        if bytes.len() > self.max_frame {
            return Err(TransportError::FrameTooLarge {
                size: bytes.len(),
                max: self.max_frame,
            });
        }
        let subs = self.subs.lock();
        for (id, sub) in subs.iter() {
            if let Some(hint) = &env.hint {
                if !hint.includes(id) {
                    continue;
                }
            }
            if sub.tx.try_send(bytes.clone()).is_err() {
                tracing::warn!(id = %id, "subscriber queue full, publication dropped");
            }
        }
        Ok(())
    }

    fn connected(&self) -> Vec<MinionId> {
        self.subs.lock().keys().cloned().collect()
    }

    fn disconnect(&self, id: &MinionId) {
        if let Some(sub) = self.subs.lock().remove(id) {
            sub.writer.abort();
        }
    }

    async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.accept_task.abort();
        let mut subs = self.subs.lock();
        for (_, sub) in subs.drain() {
            sub.writer.abort();
        }
    }
}

/// The minion-side subscription over TCP, reconnecting with backoff.
pub struct TcpPublishClient {
    addr: String,
    sni_host: String,
    id: MinionId,
    tls: Option<TlsConnector>,
    max_frame: usize,
    backoff: Backoff,
    stream: Option<MaybeTls>,
}

impl TcpPublishClient {
    /// Prepares a subscription to `addr` (`host:port`). Nothing connects
    /// until the first [`PublishClient::next`] call.
    pub fn new(
        addr: impl Into<String>,
        id: MinionId,
        tls: Option<Arc<rustls::ClientConfig>>,
        max_frame: usize,
    ) -> Self {
        let addr = addr.into();
        let sni_host = addr.rsplit_once(':').map(|(h, _)| h.to_string()).unwrap_or_else(|| addr.clone());
        Self {
            addr,
            sni_host,
            id,
            tls: tls.map(TlsConnector::from),
            max_frame,
            backoff: Backoff::reconnect(),
            stream: None,
        }
    }

    async fn try_connect(&self) -> Result<MaybeTls, TransportError> {
        let tcp = TcpStream::connect(&self.addr)
            .await
            .map_err(|_| TransportError::Disconnected)?;
        let mut stream = connect_stream(tcp, &self.sni_host, self.tls.as_ref()).await?;
        let announce = Envelope::clear(&SubscribeAnnounce {
            id: self.id.clone(),
        })?;
        write_frame(&mut stream, &announce.to_bytes()?, self.max_frame).await?;
        Ok(stream)
    }
}

#[async_trait]
impl PublishClient for TcpPublishClient {
    async fn next(&mut self) -> Result<SubEvent, TransportError> {
        loop {
            let Some(stream) = self.stream.as_mut() else {
                match self.try_connect().await {
                    Ok(stream) => {
                        self.stream = Some(stream);
                        self.backoff.reset();
                        return Ok(SubEvent::Connected);
                    }
                    Err(e) => {
                        let delay = self.backoff.delay();
                        tracing::debug!(addr = %self.addr, error = %e, ?delay, "publish connect failed");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                }
            };

            match read_frame(stream, self.max_frame).await {
                Ok(bytes) => match Envelope::from_bytes(&bytes) {
                    Ok(env) => return Ok(SubEvent::Publication(env)),
                    Err(e) => {
                        tracing::warn!(error = %e, "bad publication frame, reconnecting");
                        self.stream = None;
                    }
                },
                Err(e) => {
                    tracing::debug!(error = %e, "publish channel lost, reconnecting");
                    self.stream = None;
                }
            }
        }
    }
}

/// The master-side request-channel listener over TCP.
pub struct TcpRequestServer {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

impl TcpRequestServer {
    /// Binds the request channel and serves `handler`.
    pub async fn bind(
        addr: &str,
        handler: Arc<dyn RequestHandler>,
        tls: Option<Arc<rustls::ServerConfig>>,
        max_frame: usize,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::ProtocolViolation(format!("bind {}: {}", addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|_| TransportError::Disconnected)?;
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let acceptor = tls.map(TlsAcceptor::from);
        let conn_counter = Arc::new(AtomicU64::new(1));

        let accept_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    accepted = listener.accept() => {
                        let Ok((stream, peer)) = accepted else { continue };
                        let handler = handler.clone();
                        let acceptor = acceptor.clone();
                        let peer = PeerInfo {
                            conn_id: conn_counter.fetch_add(1, Ordering::Relaxed),
                            remote: peer.to_string(),
                        };
                        tokio::spawn(async move {
                            serve_connection(stream, peer, acceptor, handler, max_frame).await;
                        });
                    }
                }
            }
        });

        Ok(Self {
            local_addr,
            shutdown,
            accept_task,
        })
    }

    /// The bound address, useful when binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: PeerInfo,
    acceptor: Option<TlsAcceptor>,
    handler: Arc<dyn RequestHandler>,
    max_frame: usize,
) {
    let Ok(mut stream) = accept_stream(stream, acceptor.as_ref()).await else {
        return;
    };
    loop {
        let env = match read_frame(&mut stream, max_frame).await {
            Ok(bytes) => match Envelope::from_bytes(&bytes) {
                Ok(env) => env,
                Err(e) => {
                    tracing::warn!(remote = %peer.remote, error = %e, "bad request frame");
                    break;
                }
            },
            Err(TransportError::FrameTooLarge { size, max }) => {
                tracing::warn!(remote = %peer.remote, size, max, "oversized request frame");
                break;
            }
            Err(_) => break,
        };

        let reply = handler.handle(&peer, env).await;
        let Ok(bytes) = reply.envelope.to_bytes() else { break };
        if write_frame(&mut stream, &bytes, max_frame).await.is_err() {
            break;
        }
        if reply.close {
            tracing::debug!(remote = %peer.remote, "handler requested connection close");
            break;
        }
    }
    handler.connection_closed(&peer).await;
}

#[async_trait]
impl RequestServer for TcpRequestServer {
    async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.accept_task.abort();
    }
}

/// The connecting half of the request channel over TCP.
///
/// The stream lives under an async mutex: holding it across the full
/// write/read exchange is what enforces one-in-flight correlation.
pub struct TcpRequestClient {
    addr: String,
    sni_host: String,
    tls: Option<TlsConnector>,
    max_frame: usize,
    timeout: Duration,
    stream: tokio::sync::Mutex<Option<MaybeTls>>,
}

impl TcpRequestClient {
    /// Prepares a request client for `addr` (`host:port`). Connects lazily.
    pub fn new(
        addr: impl Into<String>,
        tls: Option<Arc<rustls::ClientConfig>>,
        max_frame: usize,
        timeout: Duration,
    ) -> Self {
        let addr = addr.into();
        let sni_host = addr.rsplit_once(':').map(|(h, _)| h.to_string()).unwrap_or_else(|| addr.clone());
        Self {
            addr,
            sni_host,
            tls: tls.map(TlsConnector::from),
            max_frame,
            timeout,
            stream: tokio::sync::Mutex::new(None),
        }
    }

    async fn connect(&self) -> Result<MaybeTls, TransportError> {
        let tcp = TcpStream::connect(&self.addr)
            .await
            .map_err(|_| TransportError::Disconnected)?;
        connect_stream(tcp, &self.sni_host, self.tls.as_ref()).await
    }
}

#[async_trait]
impl RequestClient for TcpRequestClient {
    async fn request(&self, env: Envelope) -> Result<Envelope, TransportError> {
        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }
        let Some(stream) = guard.as_mut() else {
            return Err(TransportError::Disconnected);
        };

        let max = self.max_frame;
        let exchange = async {
            write_frame(stream, &env.to_bytes()?, max).await?;
            let bytes = read_frame(stream, max).await?;
            Envelope::from_bytes(&bytes)
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => {
                // The stream is in an unknown state; force a reconnect.
                // An established exchange dying mid-flight is a reset, not
                // a plain connect failure.
                *guard = None;
                Err(match e {
                    TransportError::Disconnected => TransportError::Reset,
                    other => other,
                })
            }
            Err(_) => {
                // A reply may still be in flight; reusing the stream would
                // answer the next request with this one's reply.
                *guard = None;
                Err(TransportError::Timeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::Response;
    use herd_types::envelope::PublishHint;

    struct EchoHandler;

    #[async_trait]
    impl RequestHandler for EchoHandler {
        async fn handle(&self, _peer: &PeerInfo, env: Envelope) -> Response {
            env.into()
        }
    }

    struct SlowHandler;

    #[async_trait]
    impl RequestHandler for SlowHandler {
        async fn handle(&self, _peer: &PeerInfo, env: Envelope) -> Response {
            tokio::time::sleep(Duration::from_secs(5)).await;
            env.into()
        }
    }

    #[tokio::test]
    async fn test_request_roundtrip() {
        let server = TcpRequestServer::bind("127.0.0.1:0", Arc::new(EchoHandler), None, 1 << 20)
            .await
            .unwrap();
        let client = TcpRequestClient::new(
            server.local_addr().to_string(),
            None,
            1 << 20,
            Duration::from_secs(5),
        );

        let env = Envelope::aes(vec![1, 2, 3]);
        let reply = client.request(env.clone()).await.unwrap();
        assert_eq!(reply, env);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_request_timeout_closes_stream() {
        let server = TcpRequestServer::bind("127.0.0.1:0", Arc::new(SlowHandler), None, 1 << 20)
            .await
            .unwrap();
        let client = TcpRequestClient::new(
            server.local_addr().to_string(),
            None,
            1 << 20,
            Duration::from_millis(100),
        );

        let err = client.request(Envelope::aes(vec![9])).await.unwrap_err();
        assert_eq!(err, TransportError::Timeout);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_publish_fanout_honours_hint() {
        let server = TcpPublishServer::bind("127.0.0.1:0", None, 1 << 20)
            .await
            .unwrap();
        let addr = server.local_addr().to_string();

        let mut m1 = TcpPublishClient::new(addr.clone(), MinionId::new("m1"), None, 1 << 20);
        let mut m2 = TcpPublishClient::new(addr, MinionId::new("m2"), None, 1 << 20);
        assert_eq!(m1.next().await.unwrap(), SubEvent::Connected);
        assert_eq!(m2.next().await.unwrap(), SubEvent::Connected);

        // Wait until the server has registered both subscribers.
        for _ in 0..100 {
            if server.connected().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server.connected().len(), 2);

        let only_m1 = Envelope::aes(vec![1]).with_hint(PublishHint::Targets(vec![
            MinionId::new("m1"),
        ]));
        let broadcast = Envelope::aes(vec![2]).with_hint(PublishHint::Broadcast);
        server.publish(only_m1.clone()).await.unwrap();
        server.publish(broadcast.clone()).await.unwrap();

        // m1 sees both, in order.
        assert_eq!(m1.next().await.unwrap(), SubEvent::Publication(only_m1));
        assert_eq!(
            m1.next().await.unwrap(),
            SubEvent::Publication(broadcast.clone())
        );
        // m2's first publication is the broadcast; the targeted one was
        // filtered server-side.
        assert_eq!(m2.next().await.unwrap(), SubEvent::Publication(broadcast));
        server.shutdown().await;
    }
}
