//! WebSocket transport over `tokio-tungstenite`.
//!
//! One connection task owns the socket: it writes queued outbound messages
//! as text frames and decodes inbound text frames, which may carry several
//! JSON arrays back to back.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as Frame;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use wamp_core::{
    InboundReceiver, InboundSender, Transport, TransportError, TransportEvent, decode_stream,
    inbound_channel,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Subprotocol requested when none is configured explicitly.
pub const DEFAULT_SUBPROTOCOL: &str = "wamp";

/// WebSocket connection options.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WebSocketConfig {
    /// `Sec-WebSocket-Protocol` to request. `None` sends no header.
    pub subprotocol: Option<String>,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            subprotocol: Some(DEFAULT_SUBPROTOCOL.to_owned()),
        }
    }
}

/// Client transport over a single WebSocket connection.
pub struct WebSocketTransport {
    config: WebSocketConfig,
    inbound: InboundSender,
    outbound: Mutex<Option<mpsc::UnboundedSender<Value>>>,
    closed: AtomicBool,
    handler: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketTransport {
    /// Create an unconnected transport and the stream of events it will
    /// produce once connected.
    pub fn new(config: WebSocketConfig) -> (Self, InboundReceiver) {
        let (inbound, inbound_rx) = inbound_channel();
        let transport = Self {
            config,
            inbound,
            outbound: Mutex::new(None),
            closed: AtomicBool::new(false),
            handler: Mutex::new(None),
        };
        (transport, inbound_rx)
    }

    /// Wait for the connection task to finish.
    ///
    /// After [`Transport::close`] this returns once queued messages and the
    /// close frame have been written.
    pub async fn wait_closed(&self) {
        let handle = self.handler.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, url: &str) -> Result<(), TransportError> {
        let connect_error = |reason: String| TransportError::Connect {
            url: url.to_owned(),
            reason,
        };

        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.outbound.lock().is_some() {
            return Err(connect_error("already connected".into()));
        }

        let mut request = url
            .into_client_request()
            .map_err(|e| connect_error(e.to_string()))?;
        if let Some(protocol) = &self.config.subprotocol {
            let value = HeaderValue::from_str(protocol)
                .map_err(|e| connect_error(format!("invalid subprotocol: {e}")))?;
            let _ = request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
        }

        let (ws, response) = connect_async(request)
            .await
            .map_err(|e| connect_error(e.to_string()))?;
        let negotiated = response
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("none");
        info!(url, subprotocol = negotiated, "websocket connected");

        let (tx, rx) = mpsc::unbounded_channel();
        *self.outbound.lock() = Some(tx);
        let handle = tokio::spawn(connection_loop(ws, rx, self.inbound.clone()));
        *self.handler.lock() = Some(handle);
        Ok(())
    }

    fn send(&self, message: Value) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let outbound = self.outbound.lock();
        let tx = outbound.as_ref().ok_or(TransportError::NotConnected)?;
        tx.send(message).map_err(|_| TransportError::Closed)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // Dropping the queue makes the connection task send a close frame.
        if self.outbound.lock().take().is_some() {
            debug!("websocket close requested");
        }
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Some(handle) = self.handler.lock().take() {
            handle.abort();
        }
    }
}

/// Owns the socket for the lifetime of the connection.
async fn connection_loop(
    ws: WsStream,
    mut outbound: mpsc::UnboundedReceiver<Value>,
    inbound: InboundSender,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    loop {
        tokio::select! {
            message = outbound.recv() => {
                let Some(message) = message else {
                    let _ = ws_tx.send(Frame::Close(None)).await;
                    break;
                };
                if let Err(error) = ws_tx.send(Frame::Text(message.to_string().into())).await {
                    warn!(%error, "websocket write failed");
                    let _ = inbound.send(TransportEvent::Error(error.to_string()));
                    break;
                }
            }
            frame = ws_rx.next() => {
                match frame {
                    Some(Ok(Frame::Text(text))) => forward_payload(text.as_str(), &inbound),
                    Some(Ok(Frame::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => forward_payload(text, &inbound),
                        Err(error) => {
                            warn!(%error, "dropping non-UTF-8 binary frame");
                            let _ = inbound.send(TransportEvent::Error(error.to_string()));
                        }
                    },
                    Some(Ok(Frame::Close(frame))) => {
                        debug!(?frame, "peer closed websocket");
                        break;
                    }
                    // Ping/pong replies are handled by tungstenite.
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        warn!(%error, "websocket read failed");
                        let _ = inbound.send(TransportEvent::Error(error.to_string()));
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    let _ = inbound.send(TransportEvent::Closed);
    debug!("websocket connection task finished");
}

/// Decode every JSON value in `payload` and forward it.
fn forward_payload(payload: &str, inbound: &InboundSender) {
    for value in decode_stream(payload) {
        match value {
            Ok(value) => {
                let _ = inbound.send(TransportEvent::Message(value));
            }
            Err(error) => {
                warn!(%error, "dropping undecodable websocket payload");
                let _ = inbound.send(TransportEvent::Error(format!("invalid JSON: {error}")));
                break;
            }
        }
    }
}
