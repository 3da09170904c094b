//! Core types and role-shared machinery for crosswire.
//!
//! This crate provides the protocol primitives: the wire message format, the
//! closed type registry and binary serializer, the service invocation
//! registry, the pending-call table, the timeout manager, and the
//! connection/session state machines. The client and server engine crates
//! build on these; applications mostly interact with the serializer and the
//! service registry.

mod calls;
mod error;
mod registry;
mod serializer;
mod service;
mod state;
mod timeout;
mod wire;

pub use calls::{CallOutcome, CallTable, PreparedCall, decode_result};
pub use error::RpcError;
pub use registry::{RegistryBuilder, RegistryError, TypeRegistry, WireType};
pub use serializer::{Parameters, SerializeError, Serializer};
pub use service::{
    Caller, DuplicateService, HandlerError, InvokeError, ServiceBuilder, ServiceRegistry,
    ServiceRegistryBuilder, handle_request,
};
pub use state::{
    ConnectionState, ConnectionTracker, InvalidSessionTransition, InvalidTransition, SessionState,
};
pub use timeout::TimeoutManager;
pub use wire::{
    CodecError, Inbound, MessageKind, Request, Response, TAG_REQUEST, TAG_RESPONSE, decode,
    detect_kind, encode_request, encode_response,
};
