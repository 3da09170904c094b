//! In-flight call table.
//!
//! One `CallTable` per connection: it allocates message ids, holds the
//! oneshot senders of awaiting callers, and owns the timeout manager for
//! those calls. Response, timeout, and disconnect all resolve a call by
//! *removing* its entry, so exactly one of them ever delivers.

use crate::error::RpcError;
use crate::registry::WireType;
use crate::serializer::{Parameters, SerializeError, Serializer};
use crate::timeout::TimeoutManager;
use crate::wire::{Request, Response, encode_request};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

/// How one awaited call ended: the raw result payload on success, or a
/// transient/remote error.
pub type CallOutcome = Result<Option<Vec<u8>>, RpcError>;

#[derive(Debug)]
struct Shared {
    pending: Mutex<HashMap<u64, oneshot::Sender<CallOutcome>>>,
}

/// Table of calls awaiting responses on one connection.
#[derive(Debug, Clone)]
pub struct CallTable {
    next_id: Arc<AtomicU64>,
    shared: Arc<Shared>,
    timeouts: TimeoutManager,
}

impl CallTable {
    pub fn new() -> Self {
        Self {
            next_id: Arc::new(AtomicU64::new(1)),
            shared: Arc::new(Shared {
                pending: Mutex::new(HashMap::new()),
            }),
            timeouts: TimeoutManager::new(),
        }
    }

    /// Allocate the next message id. Ids are strictly increasing and start
    /// at 1; concurrent callers never receive the same id.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a pending call and arm its timeout. Returns the receiver the
    /// caller awaits; it resolves with exactly one of response, timeout, or
    /// disconnect.
    pub fn begin(&self, call_id: u64, timeout: Duration) -> oneshot::Receiver<CallOutcome> {
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().unwrap().insert(call_id, tx);

        let shared = Arc::clone(&self.shared);
        self.timeouts.set(call_id, timeout, move |id| {
            if let Some(tx) = shared.pending.lock().unwrap().remove(&id) {
                let _ = tx.send(Err(RpcError::Timeout));
            }
        });
        rx
    }

    /// Allocate an id, encode the [`Request`] frame, and register the
    /// pending call with its timeout armed. The caller sends the frame and
    /// awaits the receiver; if the send fails it must [`abandon`] the call.
    ///
    /// [`abandon`]: CallTable::abandon
    pub fn prepare(
        &self,
        serializer: &Serializer,
        service: &str,
        method: &str,
        parameters: &Parameters,
        timeout: Duration,
    ) -> Result<PreparedCall, SerializeError> {
        let id = self.next_id();
        let request = Request {
            id,
            service: service.to_string(),
            method: method.to_string(),
            parameters: serializer.serialize_parameters(parameters)?,
        };
        let frame = encode_request(serializer, &request)?;
        let receiver = self.begin(id, timeout);
        Ok(PreparedCall {
            id,
            frame,
            receiver,
        })
    }

    /// Abandon a call that never made it onto the wire (send failure).
    pub fn abandon(&self, call_id: u64) {
        self.timeouts.clear(call_id);
        self.shared.pending.lock().unwrap().remove(&call_id);
    }

    /// Resolve the pending call matching an inbound [`Response`].
    ///
    /// Unmatched responses — already timed out, or duplicates — are logged
    /// and dropped; an already-resolved future is never completed twice.
    pub fn complete(&self, response: Response) {
        let id = response.id;
        let waiter = self.shared.pending.lock().unwrap().remove(&id);
        let Some(tx) = waiter else {
            if self.timeouts.is_timed_out(id) {
                tracing::debug!("dropping late response for timed-out call {}", id);
                self.timeouts.acknowledge(id);
            } else {
                tracing::debug!("dropping response for unknown call {}", id);
            }
            return;
        };
        self.timeouts.clear(id);
        let outcome = if response.success {
            Ok(response.result)
        } else {
            Err(RpcError::Remote {
                message: response.error.unwrap_or_else(|| "unknown remote error".into()),
            })
        };
        let _ = tx.send(outcome);
    }

    /// Fault every pending call with a disconnection error, in one pass, and
    /// clear every timeout. Safe to call more than once.
    pub fn fail_all(&self, reason: &str) -> usize {
        self.timeouts.clear_all();
        let drained: Vec<_> = {
            let mut pending = self.shared.pending.lock().unwrap();
            pending.drain().collect()
        };
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(RpcError::Disconnected {
                reason: reason.to_string(),
            }));
        }
        if count > 0 {
            tracing::debug!("faulted {} pending call(s): {}", count, reason);
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().unwrap().len()
    }

    pub fn timeouts(&self) -> &TimeoutManager {
        &self.timeouts
    }
}

impl Default for CallTable {
    fn default() -> Self {
        Self::new()
    }
}

/// A call registered in the table, ready to be sent.
#[derive(Debug)]
pub struct PreparedCall {
    pub id: u64,
    pub frame: Vec<u8>,
    pub receiver: oneshot::Receiver<CallOutcome>,
}

/// Decode a successful [`CallOutcome`] payload as `T`. A void result ("no
/// payload") decodes only into zero-sized types such as `()`.
pub fn decode_result<T: WireType>(
    serializer: &Serializer,
    result: Option<Vec<u8>>,
) -> Result<T, RpcError> {
    let bytes = result.unwrap_or_default();
    Ok(serializer.deserialize(&bytes)?)
}
