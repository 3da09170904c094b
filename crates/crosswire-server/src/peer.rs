//! Per-peer context and the caller-context handle.

use crosswire_core::{
    CallTable, InvalidSessionTransition, Parameters, RpcError, Serializer, SessionState, WireType,
    decode_result,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// Server-side record for one connected peer: identity, session phase,
/// liveness, and that peer's in-flight call table. Created on connect,
/// destroyed on disconnect; the `client_id` is stable for the life of the
/// connection only — identity persistence across reconnects is an
/// application concern.
pub(crate) struct PeerContext {
    pub(crate) client_id: String,
    pub(crate) addr: SocketAddr,
    pub(crate) calls: CallTable,
    session: Mutex<SessionState>,
    last_heartbeat: Mutex<Instant>,
    reconnect_count: AtomicU32,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
}

impl PeerContext {
    pub(crate) fn new(
        client_id: String,
        addr: SocketAddr,
        outbound: mpsc::UnboundedSender<Message>,
    ) -> Self {
        Self {
            client_id,
            addr,
            calls: CallTable::new(),
            session: Mutex::new(SessionState::NotLoggedIn),
            last_heartbeat: Mutex::new(Instant::now()),
            reconnect_count: AtomicU32::new(0),
            outbound: Mutex::new(Some(outbound)),
        }
    }

    /// Refresh liveness; called for every inbound frame.
    pub(crate) fn touch(&self) {
        *self.last_heartbeat.lock().unwrap() = Instant::now();
    }

    pub(crate) fn send_frame(&self, frame: Vec<u8>) -> bool {
        let guard = self.outbound.lock().unwrap();
        match guard.as_ref() {
            Some(tx) => tx.send(Message::Binary(frame.into())).is_ok(),
            None => false,
        }
    }

    /// Drop the outbound sender, ending the writer task.
    pub(crate) fn close(&self) {
        self.outbound.lock().unwrap().take();
    }
}

/// Read-only view of one connected peer plus the operations to call back
/// into it. This is the handle a service implementation resolves from the
/// `Caller` it received, to talk to "the peer that is talking to me".
#[derive(Clone)]
pub struct PeerHandle {
    pub(crate) ctx: Arc<PeerContext>,
    pub(crate) serializer: Arc<Serializer>,
    pub(crate) default_timeout: Duration,
}

impl PeerHandle {
    pub fn client_id(&self) -> &str {
        &self.ctx.client_id
    }

    pub fn addr(&self) -> SocketAddr {
        self.ctx.addr
    }

    pub fn session_state(&self) -> SessionState {
        *self.ctx.session.lock().unwrap()
    }

    /// Advance this peer's session phase, enforcing the transition table.
    pub fn set_session_state(&self, next: SessionState) -> Result<(), InvalidSessionTransition> {
        let mut current = self.ctx.session.lock().unwrap();
        if !current.can_transition_to(next) {
            return Err(InvalidSessionTransition {
                from: *current,
                to: next,
            });
        }
        tracing::debug!("peer {} session: {:?} -> {:?}", self.ctx.client_id, *current, next);
        *current = next;
        Ok(())
    }

    /// Instant of the last inbound frame from this peer.
    pub fn last_heartbeat(&self) -> Instant {
        *self.ctx.last_heartbeat.lock().unwrap()
    }

    pub fn reconnect_count(&self) -> u32 {
        self.ctx.reconnect_count.load(Ordering::Relaxed)
    }

    /// Bump the reconnect counter; for applications that correlate a new
    /// connection with a previously seen identity.
    pub fn note_reconnect(&self) -> u32 {
        self.ctx.reconnect_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn pending_call_count(&self) -> usize {
        self.ctx.calls.pending_count()
    }

    /// Fire-and-forget call to this peer.
    pub fn notify(
        &self,
        service: &str,
        method: &str,
        parameters: Parameters,
    ) -> Result<(), RpcError> {
        let request = crosswire_core::Request {
            id: self.ctx.calls.next_id(),
            service: service.to_string(),
            method: method.to_string(),
            parameters: self.serializer.serialize_parameters(&parameters)?,
        };
        let frame = crosswire_core::encode_request(&self.serializer, &request)?;
        if !self.ctx.send_frame(frame) {
            tracing::debug!(
                "notify {}/{} to {} skipped: peer gone",
                service,
                method,
                self.ctx.client_id
            );
        }
        Ok(())
    }

    /// Invoke a method on this peer and await its typed result, bounded by
    /// the engine's default call timeout.
    pub async fn call<T: WireType>(
        &self,
        service: &str,
        method: &str,
        parameters: Parameters,
    ) -> Result<T, RpcError> {
        self.call_with_timeout(service, method, parameters, self.default_timeout)
            .await
    }

    /// Invoke a method on this peer with an explicit per-call timeout.
    pub async fn call_with_timeout<T: WireType>(
        &self,
        service: &str,
        method: &str,
        parameters: Parameters,
        timeout: Duration,
    ) -> Result<T, RpcError> {
        let prepared =
            self.ctx
                .calls
                .prepare(&self.serializer, service, method, &parameters, timeout)?;
        if !self.ctx.send_frame(prepared.frame) {
            self.ctx.calls.abandon(prepared.id);
            return Err(RpcError::Disconnected {
                reason: "peer disconnected".into(),
            });
        }
        tracing::debug!(
            "call {} -> {}/{} on {}",
            prepared.id,
            service,
            method,
            self.ctx.client_id
        );
        let outcome = prepared.receiver.await.map_err(|_| RpcError::Disconnected {
            reason: "engine dropped".into(),
        })?;
        decode_result(&self.serializer, outcome?)
    }
}
