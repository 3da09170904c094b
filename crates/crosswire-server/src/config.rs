//! Server engine settings.

use serde::{Deserialize, Serialize};

/// Tunables for [`ServerEngine`](crate::ServerEngine).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Connection admission capacity; handshakes beyond it are rejected
    /// before a peer context is created.
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,
    /// Default per-call timeout for awaited calls to peers.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

fn default_max_peers() -> usize {
    64
}

fn default_call_timeout_ms() -> u64 {
    30_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_peers: default_max_peers(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}
