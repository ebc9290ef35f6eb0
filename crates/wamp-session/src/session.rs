//! Session orchestrator.
//!
//! [`WampSession`] owns the prefix table, call correlator, and subscription
//! registry, and a single task that processes inbound transport events one at
//! a time. Inbound messages are classified by their leading tag and routed
//! through a dispatch table built at construction.
//!
//! Lock order is subscriptions, then prefixes. Outbound messages that carry a
//! shrunk URI are sent while the prefix lock is held, so a PREFIX
//! announcement always precedes the first message that relies on it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use wamp_core::{
    CallError, InboundReceiver, Message, MessageType, PrefixError, ProtocolError, SessionError,
    SessionId, Transport, TransportError, TransportEvent,
};

use crate::calls::{CallCorrelator, PendingCall};
use crate::config::SessionConfig;
use crate::diagnostics::{DIAGNOSTIC_CAPACITY, Diagnostic, SessionStats, StatsCounters};
use crate::prefix::PrefixTable;
use crate::subscriptions::{ListenerId, ListenerRemoval, Subscriber, SubscriptionRegistry};

/// Lifecycle of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Waiting for the server's WELCOME.
    Connecting,
    /// WELCOME received; `connect` has not returned yet.
    Welcomed,
    /// `connect` returned; the session is in use.
    Active,
    /// The transport closed. Terminal.
    Closed,
}

/// What the server said in its WELCOME.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Welcome {
    /// Server-assigned session ID.
    pub session_id: SessionId,
    /// Protocol version the server speaks.
    pub protocol_version: u64,
    /// Server identification string.
    pub server_ident: String,
}

type Handler = fn(&SessionInner, Message);

/// State shared between the session handle, the inbound task, and
/// subscriber handles.
pub(crate) struct SessionInner {
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    calls: Arc<CallCorrelator>,
    subscriptions: Mutex<SubscriptionRegistry>,
    prefixes: Mutex<PrefixTable>,
    welcome: OnceLock<Welcome>,
    state: watch::Sender<SessionState>,
    connect_started: AtomicBool,
    transport_connected: AtomicBool,
    handlers: HashMap<MessageType, Handler>,
    stats: StatsCounters,
    diagnostics: broadcast::Sender<Diagnostic>,
}

impl SessionInner {
    fn new(transport: Arc<dyn Transport>, config: SessionConfig) -> Self {
        let mut handlers: HashMap<MessageType, Handler> = HashMap::new();
        let _ = handlers.insert(MessageType::Welcome, Self::on_welcome);
        let _ = handlers.insert(MessageType::CallResult, Self::on_call_result);
        let _ = handlers.insert(MessageType::CallError, Self::on_call_error);
        let _ = handlers.insert(MessageType::Event, Self::on_event);

        let (state, _) = watch::channel(SessionState::Connecting);
        let (diagnostics, _) = broadcast::channel(DIAGNOSTIC_CAPACITY);

        Self {
            transport,
            calls: Arc::new(CallCorrelator::new(config.call_id_length)),
            config,
            subscriptions: Mutex::new(SubscriptionRegistry::new()),
            prefixes: Mutex::new(PrefixTable::new()),
            welcome: OnceLock::new(),
            state,
            connect_started: AtomicBool::new(false),
            transport_connected: AtomicBool::new(false),
            handlers,
            stats: StatsCounters::default(),
            diagnostics,
        }
    }

    // ─── Inbound ─────────────────────────────────────────────────────────

    fn handle_message(&self, raw: Value) {
        self.stats.record_received();

        let message_type = match MessageType::of(&raw) {
            Ok(message_type) => message_type,
            Err(ProtocolError::UnknownType(tag)) => {
                warn!(tag, "dropping message with unknown type");
                self.drop_message(Diagnostic::UnknownType { tag, raw });
                return;
            }
            Err(error) => {
                warn!(%error, "dropping malformed message");
                self.drop_message(Diagnostic::Malformed { error, raw });
                return;
            }
        };

        let Some(handler) = self.handlers.get(&message_type).copied() else {
            warn!(%message_type, "dropping message this client does not accept");
            self.drop_message(Diagnostic::Unhandled { message_type, raw });
            return;
        };

        match Message::from_value(&raw) {
            Ok(message) => {
                trace!(%message_type, "inbound message");
                handler(self, message);
            }
            Err(error) => {
                warn!(%message_type, %error, "dropping malformed message");
                self.drop_message(Diagnostic::Malformed { error, raw });
            }
        }
    }

    fn on_welcome(&self, message: Message) {
        let Message::Welcome {
            session_id,
            protocol_version,
            server_ident,
        } = message
        else {
            return;
        };

        let welcome = Welcome {
            session_id: session_id.clone(),
            protocol_version,
            server_ident,
        };
        if self.welcome.set(welcome).is_err() {
            warn!(session_id = %session_id, "ignoring repeated WELCOME");
            self.drop_message(Diagnostic::DuplicateWelcome { session_id });
            return;
        }

        info!(session_id = %session_id, protocol_version, "session welcomed");
        let _ = self.state.send_if_modified(|state| {
            let connecting = *state == SessionState::Connecting;
            if connecting {
                *state = SessionState::Welcomed;
            }
            connecting
        });
    }

    fn on_call_result(&self, message: Message) {
        let Message::CallResult { call_id, result } = message else {
            return;
        };
        if !self.calls.resolve(&call_id, result) {
            debug!(call_id = %call_id, "CALLRESULT for unknown call");
            self.stats.record_unmatched_result();
        }
    }

    fn on_call_error(&self, message: Message) {
        let Message::CallError {
            call_id,
            error,
            details,
        } = message
        else {
            return;
        };
        if !self.calls.reject(&call_id, CallError::Remote { error, details }) {
            debug!(call_id = %call_id, "CALLERROR for unknown call");
            self.stats.record_unmatched_result();
        }
    }

    fn on_event(&self, message: Message) {
        let Message::Event { topic, event } = message else {
            return;
        };
        let delivered = {
            let subscriptions = self.subscriptions.lock();
            let prefixes = self.prefixes.lock();
            subscriptions.dispatch_event(&topic, &event, &prefixes)
        };
        if delivered == 0 {
            debug!(topic = %topic, "EVENT for topic with no listeners");
            self.stats.record_unmatched_event();
        } else {
            trace!(topic = %topic, delivered, "event dispatched");
        }
    }

    fn handle_transport_error(&self, reason: String) {
        warn!(reason = %reason, "transport error");
        let _ = self.diagnostics.send(Diagnostic::Transport { reason });
    }

    fn handle_closed(&self) {
        if self.state.send_replace(SessionState::Closed) == SessionState::Closed {
            return;
        }
        let rejected = self.calls.reject_all(|| CallError::SessionClosed);
        self.subscriptions.lock().clear();
        info!(rejected_calls = rejected, "session closed");
    }

    fn drop_message(&self, diagnostic: Diagnostic) {
        self.stats.record_dropped();
        let _ = self.diagnostics.send(diagnostic);
    }

    // ─── Outbound ────────────────────────────────────────────────────────

    fn send(&self, message: Message) -> Result<(), TransportError> {
        let message_type = message.message_type();
        self.transport.send(message.to_value())?;
        self.stats.record_sent();
        trace!(%message_type, "outbound message");
        Ok(())
    }

    /// Send a message whose URI goes through the prefix table, holding the
    /// prefix lock until the transport has the message.
    fn send_shrunk(
        &self,
        uri: &str,
        build: impl FnOnce(String) -> Message,
    ) -> Result<(), TransportError> {
        let prefixes = self.prefixes.lock();
        self.send(build(prefixes.shrink(uri)))
    }

    /// Called when a [`Subscriber`] is dropped.
    pub(crate) fn release_listener(&self, topic: &str, listener: ListenerId) {
        let mut subscriptions = self.subscriptions.lock();
        if subscriptions.remove_listener(topic, listener) != ListenerRemoval::TopicEmptied {
            return;
        }
        debug!(topic, "last listener dropped, unsubscribing");
        if let Err(error) = self.send(Message::Unsubscribe {
            topic: topic.to_owned(),
        }) {
            warn!(topic, %error, "failed to send UNSUBSCRIBE");
        }
    }

    fn is_closed(&self) -> bool {
        *self.state.borrow() == SessionState::Closed
    }
}

/// A client session over one transport.
pub struct WampSession {
    inner: Arc<SessionInner>,
    inbound_task: JoinHandle<()>,
}

impl WampSession {
    /// Create a session and start processing `inbound`.
    ///
    /// Must be called within a Tokio runtime.
    pub fn new(
        transport: Arc<dyn Transport>,
        inbound: InboundReceiver,
        config: SessionConfig,
    ) -> Self {
        let inner = Arc::new(SessionInner::new(transport, config));
        let inbound_task = tokio::spawn(run_inbound(Arc::downgrade(&inner), inbound));
        Self {
            inner,
            inbound_task,
        }
    }

    /// Connect the transport and wait for the server's WELCOME.
    ///
    /// A WELCOME that arrives while the transport is still connecting counts.
    /// After a [`SessionError::ConnectTimeout`] the transport stays connected
    /// and `connect` may be called again to keep waiting.
    pub async fn connect(&self, url: &str) -> Result<Welcome, SessionError> {
        if self.inner.is_closed() {
            return Err(match self.inner.welcome.get() {
                Some(_) => TransportError::Closed.into(),
                None => SessionError::ClosedBeforeWelcome,
            });
        }
        if self.inner.connect_started.swap(true, Ordering::SeqCst) {
            return Err(SessionError::AlreadyConnected);
        }

        if !self.inner.transport_connected.load(Ordering::SeqCst) {
            info!(url, "connecting");
            if let Err(error) = self.inner.transport.connect(url).await {
                self.inner.connect_started.store(false, Ordering::SeqCst);
                return Err(error.into());
            }
            self.inner.transport_connected.store(true, Ordering::SeqCst);
        } else {
            debug!(url, "transport already connected, waiting for WELCOME");
        }

        let mut state = self.inner.state.subscribe();
        let reached = match self.inner.config.connect_timeout {
            Some(timeout) => {
                let welcomed = state.wait_for(|s| *s != SessionState::Connecting);
                let waited = tokio::time::timeout(timeout, welcomed).await;
                let Ok(reached) = waited else {
                    self.inner.connect_started.store(false, Ordering::SeqCst);
                    let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                    warn!(url, timeout_ms, "no WELCOME before deadline");
                    return Err(SessionError::ConnectTimeout { timeout_ms });
                };
                reached.map(|s| *s)
            }
            None => state
                .wait_for(|s| *s != SessionState::Connecting)
                .await
                .map(|s| *s),
        }
        .map_err(|_| SessionError::ClosedBeforeWelcome)?;

        if reached == SessionState::Closed {
            return Err(SessionError::ClosedBeforeWelcome);
        }

        let _ = self.inner.state.send_if_modified(|s| {
            let welcomed = *s == SessionState::Welcomed;
            if welcomed {
                *s = SessionState::Active;
            }
            welcomed
        });

        let welcome = self
            .inner
            .welcome
            .get()
            .cloned()
            .ok_or(SessionError::ClosedBeforeWelcome)?;
        info!(session_id = %welcome.session_id, server = %welcome.server_ident, "connected");
        Ok(welcome)
    }

    /// Call `procedure` with the configured default deadline.
    ///
    /// The CALL is sent before this returns; await the result to get `T`.
    pub fn call<T: DeserializeOwned>(&self, procedure: &str, args: Vec<Value>) -> PendingCall<T> {
        self.start_call(procedure, args, self.inner.config.call_timeout)
    }

    /// Call `procedure`, failing with [`CallError::Timeout`] after `timeout`.
    pub fn call_with_timeout<T: DeserializeOwned>(
        &self,
        procedure: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> PendingCall<T> {
        self.start_call(procedure, args, Some(timeout))
    }

    fn start_call<T: DeserializeOwned>(
        &self,
        procedure: &str,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> PendingCall<T> {
        let (call_id, completion) = self.inner.calls.begin_call();
        let pending = PendingCall::new(
            call_id.clone(),
            completion,
            Arc::downgrade(&self.inner.calls),
            timeout,
        );

        // Registered before the state check so a concurrent close either
        // rejects this call or is observed here.
        if self.inner.is_closed() {
            return pending.fail(CallError::SessionClosed);
        }

        let sent = self.inner.send_shrunk(procedure, |procedure| Message::Call {
            call_id: call_id.clone(),
            procedure,
            args,
        });
        match sent {
            Ok(()) => {
                debug!(call_id = %call_id, procedure, "call sent");
                pending
            }
            Err(error) => {
                warn!(call_id = %call_id, procedure, %error, "failed to send CALL");
                pending.fail(error.into())
            }
        }
    }

    /// Listen for events on `topic`.
    ///
    /// `topic` may be a full URI or a `prefix:suffix` reference; either way
    /// the subscription is kept under the full URI. The first listener for a
    /// topic sends SUBSCRIBE; later ones share the existing subscription.
    pub fn subscribe<T: DeserializeOwned>(
        &self,
        topic: &str,
    ) -> Result<Subscriber<T>, TransportError> {
        let mut subscriptions = self.inner.subscriptions.lock();
        let prefixes = self.inner.prefixes.lock();
        let topic = prefixes.expand(topic);
        let registration = subscriptions.add_listener(&topic);
        if registration.created {
            let sent = self.inner.send(Message::Subscribe {
                topic: prefixes.shrink(&topic),
            });
            if let Err(error) = sent {
                let _ = subscriptions.remove_listener(&topic, registration.listener);
                return Err(error);
            }
            debug!(topic = %topic, "subscribed");
        }
        drop(prefixes);
        drop(subscriptions);

        Ok(Subscriber::new(topic, registration, Arc::downgrade(&self.inner)))
    }

    /// Publish `event` to `topic`.
    pub fn publish(&self, topic: &str, event: impl Serialize) -> Result<(), TransportError> {
        let event = serde_json::to_value(event)?;
        self.inner
            .send_shrunk(topic, |topic| Message::Publish { topic, event })?;
        debug!(topic, "published");
        Ok(())
    }

    /// Tear down the subscription for `topic`, closing every listener.
    ///
    /// `topic` is expanded like in [`WampSession::subscribe`]. Returns
    /// `false` without sending anything if it had no live subscription.
    pub fn unsubscribe(&self, topic: &str) -> Result<bool, TransportError> {
        let mut subscriptions = self.inner.subscriptions.lock();
        let topic = self.inner.prefixes.lock().expand(topic);
        if !subscriptions.unsubscribe(&topic) {
            debug!(topic = %topic, "unsubscribe for topic with no subscription");
            return Ok(false);
        }
        debug!(topic = %topic, "unsubscribing");
        self.inner.send(Message::Unsubscribe { topic })?;
        Ok(true)
    }

    /// Define (or redefine) `prefix` as an abbreviation of `uri` and announce
    /// it to the peer.
    ///
    /// Prefixes must be non-empty and free of `:`. If the announcement cannot
    /// be sent the previous mapping is restored.
    pub fn define_prefix(&self, prefix: &str, uri: &str) -> Result<(), PrefixError> {
        if !PrefixTable::is_valid_prefix(prefix) {
            return Err(PrefixError::Invalid(prefix.to_owned()));
        }
        let mut prefixes = self.inner.prefixes.lock();
        let previous = prefixes.get(prefix).map(str::to_owned);
        let announcement = prefixes.define(prefix, uri);

        if let Err(error) = self.inner.send(announcement) {
            match previous {
                Some(previous) => {
                    let _ = prefixes.define(prefix, previous);
                }
                None => {
                    let _ = prefixes.undefine(prefix);
                }
            }
            return Err(error.into());
        }
        debug!(prefix, uri, "prefix defined");
        Ok(())
    }

    /// Expand a `prefix:suffix` reference with the current table.
    pub fn resolve_uri(&self, reference: &str) -> String {
        self.inner.prefixes.lock().expand(reference)
    }

    /// Server-assigned session ID, once welcomed.
    pub fn session_id(&self) -> Option<&SessionId> {
        self.inner.welcome.get().map(|w| &w.session_id)
    }

    /// The server's WELCOME, once received.
    pub fn welcome(&self) -> Option<&Welcome> {
        self.inner.welcome.get()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Topics with a live subscription, sorted.
    pub fn subscriptions(&self) -> Vec<String> {
        self.inner.subscriptions.lock().topics()
    }

    /// Snapshot of the prefix table.
    pub fn prefixes(&self) -> PrefixTable {
        self.inner.prefixes.lock().clone()
    }

    /// Number of calls awaiting an answer.
    pub fn pending_calls(&self) -> usize {
        self.inner.calls.pending_count()
    }

    /// Traffic counters.
    pub fn stats(&self) -> SessionStats {
        self.inner.stats.snapshot()
    }

    /// Receive diagnostics for dropped inbound traffic from now on.
    pub fn diagnostics(&self) -> broadcast::Receiver<Diagnostic> {
        self.inner.diagnostics.subscribe()
    }

    /// Close the transport and the session.
    ///
    /// Pending calls fail with [`CallError::SessionClosed`] and subscribers
    /// stop receiving.
    pub fn close(&self) {
        self.inner.transport.close();
        self.inner.handle_closed();
    }
}

impl Drop for WampSession {
    fn drop(&mut self) {
        self.inbound_task.abort();
    }
}

async fn run_inbound(session: Weak<SessionInner>, mut inbound: InboundReceiver) {
    while let Some(event) = inbound.recv().await {
        let Some(inner) = session.upgrade() else {
            return;
        };
        match event {
            TransportEvent::Message(raw) => inner.handle_message(raw),
            TransportEvent::Error(reason) => inner.handle_transport_error(reason),
            TransportEvent::Closed => {
                inner.handle_closed();
                return;
            }
        }
    }

    // Transport dropped its sender without reporting Closed.
    if let Some(inner) = session.upgrade() {
        inner.handle_closed();
    }
}
