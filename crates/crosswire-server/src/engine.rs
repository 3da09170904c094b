//! Server RPC engine.

use crate::config::ServerConfig;
use crate::peer::{PeerContext, PeerHandle};
use crosswire_core::{Caller, Inbound, Parameters, RpcError, Serializer, ServiceRegistry, WireType, decode, handle_request};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as UpgradeRequest, Response as UpgradeResponse,
};
use tokio_tungstenite::tungstenite::http::StatusCode;

/// Peer lifecycle notifications.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    PeerConnected { client_id: String },
    PeerDisconnected { client_id: String, reason: String },
}

struct Inner {
    config: ServerConfig,
    serializer: Arc<Serializer>,
    services: Arc<ServiceRegistry>,
    peers: Mutex<HashMap<String, Arc<PeerContext>>>,
    events: broadcast::Sender<ServerEvent>,
    next_peer_seq: AtomicU64,
    shutdown: watch::Sender<bool>,
}

/// Server-role engine: N inbound peer connections, a per-peer in-flight call
/// table, and one global service registry.
#[derive(Clone)]
pub struct ServerEngine {
    inner: Arc<Inner>,
}

impl ServerEngine {
    pub fn new(
        config: ServerConfig,
        serializer: Arc<Serializer>,
        services: Arc<ServiceRegistry>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                serializer,
                services,
                peers: Mutex::new(HashMap::new()),
                events,
                next_peer_seq: AtomicU64::new(1),
                shutdown,
            }),
        }
    }

    /// Bind the listener and start accepting peers. Returns the bound
    /// address (useful with port 0).
    pub async fn bind(&self, addr: &str) -> io::Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!("listening on ws://{}", local_addr);
        tokio::spawn(accept_loop(Arc::clone(&self.inner), listener));
        Ok(local_addr)
    }

    /// Stop accepting and close every peer connection.
    pub fn shutdown(&self) {
        tracing::info!("server shutting down");
        let _ = self.inner.shutdown.send(true);
    }

    pub fn events(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.events.subscribe()
    }

    pub fn serializer(&self) -> &Arc<Serializer> {
        &self.inner.serializer
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peers.lock().unwrap().len()
    }

    pub fn peer_ids(&self) -> Vec<String> {
        self.inner.peers.lock().unwrap().keys().cloned().collect()
    }

    /// Resolve a connected peer — typically from the `Caller` a service
    /// method received — into its caller-context handle.
    pub fn peer(&self, client_id: &str) -> Option<PeerHandle> {
        let ctx = self.inner.peers.lock().unwrap().get(client_id).cloned()?;
        Some(self.handle(ctx))
    }

    /// Fire-and-forget call to one named peer.
    pub fn notify_peer(
        &self,
        client_id: &str,
        service: &str,
        method: &str,
        parameters: Parameters,
    ) -> Result<(), RpcError> {
        self.peer(client_id)
            .ok_or_else(|| RpcError::PeerNotFound {
                peer: client_id.to_string(),
            })?
            .notify(service, method, parameters)
    }

    /// Invoke a method on one named peer and await its typed result.
    pub async fn call_peer<T: WireType>(
        &self,
        client_id: &str,
        service: &str,
        method: &str,
        parameters: Parameters,
    ) -> Result<T, RpcError> {
        self.peer(client_id)
            .ok_or_else(|| RpcError::PeerNotFound {
                peer: client_id.to_string(),
            })?
            .call(service, method, parameters)
            .await
    }

    /// Fire-and-forget to every connected peer whose id satisfies the
    /// predicate. Returns how many peers were sent to.
    pub fn send_to_where<P>(
        &self,
        predicate: P,
        service: &str,
        method: &str,
        parameters: Parameters,
    ) -> Result<usize, RpcError>
    where
        P: Fn(&str) -> bool,
    {
        let targets: Vec<PeerHandle> = {
            let peers = self.inner.peers.lock().unwrap();
            peers
                .values()
                .filter(|ctx| predicate(&ctx.client_id))
                .cloned()
                .map(|ctx| self.handle(ctx))
                .collect()
        };
        let count = targets.len();
        for peer in targets {
            peer.notify(service, method, parameters.clone())?;
        }
        Ok(count)
    }

    /// [`send_to_where`](ServerEngine::send_to_where) with an always-true
    /// predicate.
    pub fn broadcast(
        &self,
        service: &str,
        method: &str,
        parameters: Parameters,
    ) -> Result<usize, RpcError> {
        self.send_to_where(|_| true, service, method, parameters)
    }

    fn handle(&self, ctx: Arc<PeerContext>) -> PeerHandle {
        PeerHandle {
            ctx,
            serializer: Arc::clone(&self.inner.serializer),
            default_timeout: Duration::from_millis(self.inner.config.call_timeout_ms),
        }
    }
}

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener) {
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    tokio::spawn(handle_connection(Arc::clone(&inner), stream, addr));
                }
                Err(e) => {
                    tracing::warn!("accept failed: {}", e);
                }
            },
        }
    }
    tracing::debug!("accept loop stopped");
}

async fn handle_connection(inner: Arc<Inner>, stream: TcpStream, addr: SocketAddr) {
    // Admission control runs in the upgrade callback: a server at capacity
    // rejects the handshake before any peer context is created.
    let admission = Arc::clone(&inner);
    let callback = move |_request: &UpgradeRequest, response: UpgradeResponse| {
        let connected = admission.peers.lock().unwrap().len();
        if connected >= admission.config.max_peers {
            tracing::warn!(
                "rejecting connection from {}: at capacity ({}/{})",
                addr,
                connected,
                admission.config.max_peers
            );
            let mut rejection = ErrorResponse::new(Some("server at capacity".into()));
            *rejection.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
            Err(rejection)
        } else {
            Ok(response)
        }
    };
    let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::debug!("handshake with {} failed: {}", addr, e);
            return;
        }
    };

    let client_id = format!("peer-{}", inner.next_peer_seq.fetch_add(1, Ordering::Relaxed));
    let (sink, stream) = ws.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let peer = Arc::new(PeerContext::new(client_id.clone(), addr, tx));

    {
        let mut peers = inner.peers.lock().unwrap();
        if peers.len() >= inner.config.max_peers {
            // Lost an admission race between handshake and registration.
            drop(peers);
            tracing::warn!("dropping {} from {}: capacity filled mid-handshake", client_id, addr);
            peer.close();
            return;
        }
        peers.insert(client_id.clone(), Arc::clone(&peer));
    }
    tracing::info!("peer {} connected from {}", client_id, addr);
    let _ = inner.events.send(ServerEvent::PeerConnected {
        client_id: client_id.clone(),
    });

    tokio::spawn(write_loop(sink, rx));
    let reason = read_loop(&inner, &peer, stream).await;
    cleanup(&inner, &peer, reason);
}

async fn write_loop(
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = sink.send(message).await {
            tracing::debug!("send failed: {}", e);
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(
    inner: &Arc<Inner>,
    peer: &Arc<PeerContext>,
    mut stream: SplitStream<WebSocketStream<TcpStream>>,
) -> String {
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break "server shutting down".to_string(),
            message = stream.next() => match message {
                Some(Ok(Message::Binary(data))) => {
                    peer.touch();
                    handle_frame(inner, peer, data.as_ref());
                }
                Some(Ok(Message::Close(_))) => break "closed by peer".to_string(),
                Some(Ok(_)) => {} // text/ping/pong are not part of the protocol
                Some(Err(e)) => break e.to_string(),
                None => break "connection closed".to_string(),
            },
        }
    }
}

fn handle_frame(inner: &Arc<Inner>, peer: &Arc<PeerContext>, frame: &[u8]) {
    match decode(&inner.serializer, frame) {
        Ok(Inbound::Response(response)) => peer.calls.complete(response),
        Ok(Inbound::Request(request)) => {
            // Dispatch off the read loop; asynchronously-completing method
            // bodies are awaited before the response is composed.
            let inner = Arc::clone(inner);
            let peer = Arc::clone(peer);
            tokio::spawn(async move {
                let caller = Caller::new(peer.client_id.as_str());
                if let Some(frame) =
                    handle_request(&inner.serializer, &inner.services, caller, request).await
                {
                    peer.send_frame(frame);
                }
            });
        }
        Err(e) => {
            // Isolated to this message; the connection stays up.
            tracing::warn!("dropping malformed frame from {}: {}", peer.client_id, e);
        }
    }
}

/// Destroy the peer context exactly once: the map removal decides the
/// winner, and only the winner faults that peer's pending calls.
fn cleanup(inner: &Arc<Inner>, peer: &Arc<PeerContext>, reason: String) {
    let removed = inner.peers.lock().unwrap().remove(&peer.client_id);
    if removed.is_none() {
        return;
    }
    peer.close();
    peer.calls.fail_all(&reason);
    tracing::info!("peer {} disconnected: {}", peer.client_id, reason);
    let _ = inner.events.send(ServerEvent::PeerDisconnected {
        client_id: peer.client_id.clone(),
        reason,
    });
}
