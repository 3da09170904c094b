//! Client-role crosswire engine.
//!
//! Owns one outbound WebSocket connection, a table of in-flight calls, and a
//! local service registry so the peer can call back into this process. The
//! application drives it through [`ClientEngine`]; connection lifecycle is
//! reported through [`ClientEvent`]s.

mod config;
mod engine;
mod session;

pub use config::ClientConfig;
pub use engine::{ClientEngine, ClientEvent};
pub use session::SessionTracker;
