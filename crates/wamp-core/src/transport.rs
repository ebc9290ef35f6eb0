//! Transport contract consumed by the session.
//!
//! A transport owns the socket. The session never parses bytes: it receives
//! decoded JSON arrays as [`TransportEvent::Message`] on an unbounded channel
//! handed over at construction, and gives outbound arrays to
//! [`Transport::send`].

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::errors::TransportError;

/// Something the transport observed on the connection.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    /// One decoded inbound message.
    Message(Value),
    /// The connection closed (by either side).
    Closed,
    /// A non-fatal read error the transport wants surfaced.
    Error(String),
}

/// Sending half of the inbound event channel, held by the transport.
pub type InboundSender = mpsc::UnboundedSender<TransportEvent>;

/// Receiving half of the inbound event channel, handed to the session.
pub type InboundReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Create an inbound event channel.
pub fn inbound_channel() -> (InboundSender, InboundReceiver) {
    mpsc::unbounded_channel()
}

/// Bidirectional message transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the connection. Completes when messages can be exchanged.
    async fn connect(&self, url: &str) -> Result<(), TransportError>;

    /// Queue one outbound message.
    ///
    /// Must not block, and must deliver messages in call order.
    fn send(&self, message: Value) -> Result<(), TransportError>;

    /// Close the connection. Later sends fail with [`TransportError::Closed`].
    fn close(&self) {}
}
