//! Caller-facing error taxonomy.

use crate::serializer::SerializeError;

/// What an awaited call (or an engine operation) can fail with.
///
/// Timeout and disconnection are transient, delivered only to the affected
/// caller; `Remote` carries the message text of an error thrown by the
/// invoked method on the other side; the rest are local conditions.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RpcError {
    #[error("call timed out")]
    Timeout,
    #[error("connection lost: {reason}")]
    Disconnected { reason: String },
    #[error("not connected")]
    NotConnected,
    #[error("remote call failed: {message}")]
    Remote { message: String },
    #[error("no connected peer `{peer}`")]
    PeerNotFound { peer: String },
    #[error(transparent)]
    Serialize(#[from] SerializeError),
}
