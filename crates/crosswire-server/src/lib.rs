//! Server-role crosswire engine.
//!
//! Accepts N inbound peer connections, each with its own peer context and
//! in-flight call table. Service registrations are global; pending calls and
//! peer identity are per-peer. Supports unicast, multicast-by-predicate, and
//! broadcast sends, and admission control against a configured capacity.

mod config;
mod engine;
mod peer;

pub use config::ServerConfig;
pub use engine::{ServerEngine, ServerEvent};
pub use peer::PeerHandle;
