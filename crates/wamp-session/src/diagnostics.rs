//! Observability for inbound traffic the session could not use.
//!
//! Dropped messages are logged, counted, and broadcast as [`Diagnostic`]s.
//! Unmatched results and events for unknown topics are expected under normal
//! operation (late answers, racing unsubscribes) and are only counted.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use wamp_core::{MessageType, ProtocolError, SessionId};

/// Buffered diagnostics per receiver before the oldest are dropped.
pub const DIAGNOSTIC_CAPACITY: usize = 64;

/// Something the session dropped instead of processing.
#[derive(Clone, Debug, PartialEq)]
pub enum Diagnostic {
    /// The message did not have a valid shape.
    Malformed {
        /// What was wrong with it.
        error: ProtocolError,
        /// The message as received.
        raw: Value,
    },
    /// The leading tag is not a known message type.
    UnknownType {
        /// The tag received.
        tag: u64,
        /// The message as received.
        raw: Value,
    },
    /// A known message type this client never receives (e.g. CALL).
    Unhandled {
        /// Type of the dropped message.
        message_type: MessageType,
        /// The message as received.
        raw: Value,
    },
    /// A WELCOME arrived after the session was already welcomed.
    DuplicateWelcome {
        /// Session ID carried by the repeated WELCOME.
        session_id: SessionId,
    },
    /// The transport reported a non-fatal error.
    Transport {
        /// Transport's description of the error.
        reason: String,
    },
}

/// Point-in-time traffic counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Inbound messages handed over by the transport.
    pub messages_received: u64,
    /// Outbound messages accepted by the transport.
    pub messages_sent: u64,
    /// Inbound messages dropped (malformed, unknown, unhandled, duplicate WELCOME).
    pub messages_dropped: u64,
    /// CALLRESULT/CALLERROR for call IDs that were not pending.
    pub unmatched_results: u64,
    /// EVENTs for topics with no live subscription.
    pub unmatched_events: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    received: AtomicU64,
    sent: AtomicU64,
    dropped: AtomicU64,
    unmatched_results: AtomicU64,
    unmatched_events: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn record_received(&self) {
        let _ = self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_sent(&self) {
        let _ = self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_unmatched_result(&self) {
        let _ = self.unmatched_results.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_unmatched_event(&self) {
        let _ = self.unmatched_events.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> SessionStats {
        SessionStats {
            messages_received: self.received.load(Ordering::Relaxed),
            messages_sent: self.sent.load(Ordering::Relaxed),
            messages_dropped: self.dropped.load(Ordering::Relaxed),
            unmatched_results: self.unmatched_results.load(Ordering::Relaxed),
            unmatched_events: self.unmatched_events.load(Ordering::Relaxed),
        }
    }
}
