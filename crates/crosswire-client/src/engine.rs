//! Client RPC engine.

use crate::config::ClientConfig;
use crate::session::SessionTracker;
use crosswire_core::{
    CallTable, Caller, ConnectionState, ConnectionTracker, Inbound, InvalidTransition, Parameters,
    Request, RpcError, Serializer, ServiceRegistry, WireType, decode, decode_result,
    encode_request, handle_request,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// Caller id the local service registry sees for calls arriving from the
/// connected server.
const SERVER_CALLER_ID: &str = "server";

/// Lifecycle notifications exposed upward. This is the complete contract a
/// consuming application needs to drive its UI/session state; both
/// synchronous and asynchronous connect failures arrive here, so one failure
/// handler suffices.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected,
    ConnectFailed { reason: String },
    Disconnected { reason: String },
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

struct Inner {
    config: ClientConfig,
    serializer: Arc<Serializer>,
    services: Arc<ServiceRegistry>,
    connection: ConnectionTracker,
    session: SessionTracker,
    calls: CallTable,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    events: broadcast::Sender<ClientEvent>,
}

/// Client-role engine: one outbound connection, one in-flight call table,
/// and a local service registry the server may call into.
#[derive(Clone)]
pub struct ClientEngine {
    inner: Arc<Inner>,
}

impl ClientEngine {
    pub fn new(
        config: ClientConfig,
        serializer: Arc<Serializer>,
        services: Arc<ServiceRegistry>,
    ) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            inner: Arc::new(Inner {
                config,
                serializer,
                services,
                connection: ConnectionTracker::new(),
                session: SessionTracker::new(),
                calls: CallTable::new(),
                outbound: Mutex::new(None),
                events,
            }),
        }
    }

    /// Subscribe to lifecycle notifications.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.get()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.subscribe()
    }

    pub fn session(&self) -> &SessionTracker {
        &self.inner.session
    }

    pub fn serializer(&self) -> &Arc<Serializer> {
        &self.inner.serializer
    }

    /// Calls currently awaiting a response.
    pub fn pending_call_count(&self) -> usize {
        self.inner.calls.pending_count()
    }

    /// Start connecting to `url` (e.g. `ws://127.0.0.1:9000`).
    ///
    /// Returns immediately after entering `Connecting`; the outcome arrives
    /// as a [`ClientEvent`]. The whole attempt is bounded by
    /// `connect_timeout_ms`, independent of per-call timeouts; an attempt
    /// that does not reach `Connected` within the bound force-transitions
    /// back to `Disconnected` and emits `ConnectFailed`.
    pub fn connect(&self, url: &str) -> Result<(), InvalidTransition> {
        self.inner.connection.set(ConnectionState::Connecting)?;
        let inner = Arc::clone(&self.inner);
        let url = url.to_string();
        tokio::spawn(async move {
            let bound = Duration::from_millis(inner.config.connect_timeout_ms);
            let attempt = tokio::time::timeout(bound, tokio_tungstenite::connect_async(&url)).await;
            match attempt {
                Err(_) => connect_failed(&inner, "connection timed out".into()),
                Ok(Err(e)) => connect_failed(&inner, e.to_string()),
                Ok(Ok((ws, _response))) => {
                    let (sink, stream) = ws.split();
                    let (tx, rx) = mpsc::unbounded_channel();
                    *inner.outbound.lock().unwrap() = Some(tx);
                    if inner.connection.set(ConnectionState::Connected).is_err() {
                        // Disconnected under us while the handshake finished.
                        inner.outbound.lock().unwrap().take();
                        return;
                    }
                    tracing::info!("connected to {}", url);
                    let _ = inner.events.send(ClientEvent::Connected);
                    tokio::spawn(write_loop(sink, rx));
                    tokio::spawn(read_loop(Arc::clone(&inner), stream));
                }
            }
        });
        Ok(())
    }

    /// Stop the transport and clear every pending call's timeout.
    ///
    /// In-flight futures are not faulted here; the transport's disconnect
    /// event is the single source of truth that faults them, which avoids
    /// double-resolution races.
    pub fn disconnect(&self) {
        if self
            .inner
            .connection
            .set(ConnectionState::Disconnecting)
            .is_err()
        {
            tracing::debug!("disconnect ignored: not connected");
            return;
        }
        self.inner.calls.timeouts().clear_all();
        // Dropping the sender ends the writer task, which closes the socket;
        // the read loop then observes the close and faults pending calls.
        self.inner.outbound.lock().unwrap().take();
    }

    /// Fire-and-forget call: serialize and send immediately, expect no
    /// result. Best-effort — silently logs and returns when not connected.
    pub fn notify(
        &self,
        service: &str,
        method: &str,
        parameters: Parameters,
    ) -> Result<(), RpcError> {
        let inner = &self.inner;
        if inner.connection.get() != ConnectionState::Connected {
            tracing::debug!("notify {}/{} skipped: not connected", service, method);
            return Ok(());
        }
        let request = Request {
            id: inner.calls.next_id(),
            service: service.to_string(),
            method: method.to_string(),
            parameters: inner.serializer.serialize_parameters(&parameters)?,
        };
        let frame = encode_request(&inner.serializer, &request)?;
        send_frame(inner, frame);
        Ok(())
    }

    /// Invoke a remote method and await its typed result, bounded by the
    /// configured default call timeout.
    pub async fn call<T: WireType>(
        &self,
        service: &str,
        method: &str,
        parameters: Parameters,
    ) -> Result<T, RpcError> {
        let timeout = Duration::from_millis(self.inner.config.call_timeout_ms);
        self.call_with_timeout(service, method, parameters, timeout).await
    }

    /// Invoke a remote method with an explicit per-call timeout.
    ///
    /// Resolves with exactly one of: the decoded result, a remote error
    /// carrying the peer's message text, a timeout, or a disconnection.
    pub async fn call_with_timeout<T: WireType>(
        &self,
        service: &str,
        method: &str,
        parameters: Parameters,
        timeout: Duration,
    ) -> Result<T, RpcError> {
        let inner = &self.inner;
        if inner.connection.get() != ConnectionState::Connected {
            return Err(RpcError::NotConnected);
        }
        let prepared = inner
            .calls
            .prepare(&inner.serializer, service, method, &parameters, timeout)?;
        if !send_frame(inner, prepared.frame) {
            inner.calls.abandon(prepared.id);
            return Err(RpcError::NotConnected);
        }
        tracing::debug!("call {} -> {}/{}", prepared.id, service, method);

        let outcome = prepared.receiver.await.map_err(|_| RpcError::Disconnected {
            reason: "engine dropped".into(),
        })?;
        decode_result(&inner.serializer, outcome?)
    }
}

fn send_frame(inner: &Inner, frame: Vec<u8>) -> bool {
    let guard = inner.outbound.lock().unwrap();
    match guard.as_ref() {
        Some(tx) => tx.send(Message::Binary(frame.into())).is_ok(),
        None => false,
    }
}

fn connect_failed(inner: &Arc<Inner>, reason: String) {
    tracing::warn!("connect failed: {}", reason);
    inner.connection.set_if_legal(ConnectionState::Disconnected);
    inner.outbound.lock().unwrap().take();
    let _ = inner.events.send(ClientEvent::ConnectFailed { reason });
}

async fn write_loop(mut sink: WsSink, mut rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = sink.send(message).await {
            tracing::debug!("send failed: {}", e);
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(
    inner: Arc<Inner>,
    mut stream: futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
) {
    let reason = loop {
        match stream.next().await {
            Some(Ok(Message::Binary(data))) => handle_frame(&inner, data.as_ref()),
            Some(Ok(Message::Close(_))) => break "closed by peer".to_string(),
            Some(Ok(_)) => {} // text/ping/pong are not part of the protocol
            Some(Err(e)) => break e.to_string(),
            None => break "connection closed".to_string(),
        }
    };
    on_disconnected(&inner, reason);
}

fn handle_frame(inner: &Arc<Inner>, frame: &[u8]) {
    match decode(&inner.serializer, frame) {
        Ok(Inbound::Response(response)) => inner.calls.complete(response),
        Ok(Inbound::Request(request)) => {
            // The server is calling us. Dispatch off the read loop so a slow
            // method body never stalls inbound traffic.
            let inner = Arc::clone(inner);
            tokio::spawn(async move {
                let caller = Caller::new(SERVER_CALLER_ID);
                if let Some(frame) =
                    handle_request(&inner.serializer, &inner.services, caller, request).await
                {
                    send_frame(&inner, frame);
                }
            });
        }
        Err(e) => {
            // Isolated to this message; never tears down the connection.
            tracing::warn!("dropping malformed inbound frame: {}", e);
        }
    }
}

fn on_disconnected(inner: &Arc<Inner>, reason: String) {
    inner.outbound.lock().unwrap().take();
    inner.connection.set_if_legal(ConnectionState::Disconnected);
    inner.session.reset();
    inner.calls.fail_all(&reason);
    tracing::info!("disconnected: {}", reason);
    let _ = inner.events.send(ClientEvent::Disconnected { reason });
}
