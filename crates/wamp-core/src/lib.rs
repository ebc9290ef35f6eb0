//! # wamp-core
//!
//! Shared vocabulary for the WAMP client crates.
//!
//! - **Wire messages**: [`MessageType`] tags and the typed [`Message`] codec
//!   for the compact JSON-array encoding (`[tag, ...fields]`)
//! - **Branded IDs**: [`SessionId`] and [`CallId`] newtypes
//! - **Errors**: protocol, transport, call, and session failures via `thiserror`
//! - **Transport contract**: the [`Transport`] trait and [`TransportEvent`]
//!   stream the session consumes
//! - **Logging**: `tracing` subscriber setup and log capture for tests

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod logging;
pub mod message;
pub mod transport;

pub use errors::{CallError, PrefixError, ProtocolError, SessionError, TransportError};
pub use ids::{CALL_ID_LENGTH, CallId, SessionId};
pub use message::{Message, MessageType, PROTOCOL_VERSION, decode_stream};
pub use transport::{InboundReceiver, InboundSender, Transport, TransportEvent, inbound_channel};
