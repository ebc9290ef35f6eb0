//! In-process transport.
//!
//! [`MemoryTransport`] is the session's side; [`MemoryPeer`] plays the server.
//! Everything the session sends lands in the peer's outbound queue, and
//! everything the peer delivers reaches the session's inbound channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;
use wamp_core::{
    InboundReceiver, InboundSender, Message, Transport, TransportError, TransportEvent,
    inbound_channel,
};

struct Shared {
    inbound: InboundSender,
    outbound: mpsc::UnboundedSender<Value>,
    connected: AtomicBool,
    closed: AtomicBool,
    url: Mutex<Option<String>>,
    greeting: Mutex<Option<Value>>,
}

impl Shared {
    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.inbound.send(TransportEvent::Closed);
        }
    }
}

/// Session side of an in-process connection.
pub struct MemoryTransport {
    shared: Arc<Shared>,
}

impl MemoryTransport {
    /// Create a connected pair: the transport, its inbound event stream, and
    /// the peer that drives it.
    pub fn pair() -> (Self, InboundReceiver, MemoryPeer) {
        let (inbound, inbound_rx) = inbound_channel();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            inbound,
            outbound,
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            url: Mutex::new(None),
            greeting: Mutex::new(None),
        });
        let peer = MemoryPeer {
            shared: shared.clone(),
            outbound: outbound_rx,
        };
        (Self { shared }, inbound_rx, peer)
    }

    /// Deliver `welcome` as soon as `connect` is called, before it returns.
    pub fn with_welcome(self, welcome: &Message) -> Self {
        *self.shared.greeting.lock() = Some(welcome.to_value());
        self
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, url: &str) -> Result<(), TransportError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        *self.shared.url.lock() = Some(url.to_owned());
        self.shared.connected.store(true, Ordering::SeqCst);
        debug!(url, "memory transport connected");

        let greeting = self.shared.greeting.lock().clone();
        if let Some(greeting) = greeting {
            let _ = self.shared.inbound.send(TransportEvent::Message(greeting));
        }
        Ok(())
    }

    fn send(&self, message: Value) -> Result<(), TransportError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if !self.shared.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.shared
            .outbound
            .send(message)
            .map_err(|_| TransportError::Closed)
    }

    fn close(&self) {
        self.shared.close();
    }
}

/// Server side of an in-process connection.
pub struct MemoryPeer {
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedReceiver<Value>,
}

impl MemoryPeer {
    /// Hand `message` to the session.
    pub fn deliver(&self, message: Value) {
        let _ = self.shared.inbound.send(TransportEvent::Message(message));
    }

    /// Report a non-fatal transport error to the session.
    pub fn fail(&self, reason: impl Into<String>) {
        let _ = self.shared.inbound.send(TransportEvent::Error(reason.into()));
    }

    /// Close the connection from the server side.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Whether either side closed the connection.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// URL passed to `connect`, if it has been called.
    pub fn connected_url(&self) -> Option<String> {
        self.shared.url.lock().clone()
    }

    /// Wait for the next message the session sent.
    pub async fn next_outbound(&mut self) -> Option<Value> {
        self.outbound.recv().await
    }

    /// Next message the session sent, if one is queued.
    pub fn try_next_outbound(&mut self) -> Option<Value> {
        self.outbound.try_recv().ok()
    }

    /// Every queued outbound message, oldest first.
    pub fn drain(&mut self) -> Vec<Value> {
        std::iter::from_fn(|| self.outbound.try_recv().ok()).collect()
    }
}
