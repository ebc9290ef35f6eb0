//! # wamp-transport
//!
//! [`wamp_core::Transport`] implementations.
//!
//! - [`WebSocketTransport`]: a real connection via `tokio-tungstenite`
//! - [`MemoryTransport`]: an in-process pair, driven from the other end by a
//!   [`MemoryPeer`]

#![deny(unsafe_code)]

pub mod memory;
pub mod websocket;

pub use memory::{MemoryPeer, MemoryTransport};
pub use websocket::{DEFAULT_SUBPROTOCOL, WebSocketConfig, WebSocketTransport};
