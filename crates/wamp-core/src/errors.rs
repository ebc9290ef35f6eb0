//! Error taxonomy for the WAMP client.
//!
//! - [`ProtocolError`]: an inbound message had the wrong shape. Never fatal to
//!   the session; the message is dropped and reported.
//! - [`TransportError`]: the transport collaborator refused to connect or send.
//! - [`CallError`]: why a pending call did not produce a value.
//! - [`SessionError`]: why `connect` did not reach the welcomed state.
//! - [`PrefixError`]: why a prefix definition was refused.

use serde_json::Value;
use thiserror::Error;

use crate::message::MessageType;

/// Malformed or unexpected inbound message shape.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtocolError {
    /// The message was not a JSON array.
    #[error("message is not a JSON array")]
    NotAnArray,

    /// The message was an empty array.
    #[error("message array is empty")]
    Empty,

    /// The first element was not an unsigned integer.
    #[error("message type tag is not an unsigned integer: {0}")]
    InvalidTag(Value),

    /// The tag is outside the known message types.
    #[error("unknown message type {0}")]
    UnknownType(u64),

    /// A required positional field is absent.
    #[error("{message_type} message is missing field {index}")]
    MissingField {
        /// Message being decoded.
        message_type: MessageType,
        /// Array index of the absent field.
        index: usize,
    },

    /// A positional field has the wrong JSON type.
    #[error("{message_type} message field {index} must be {expected}")]
    InvalidField {
        /// Message being decoded.
        message_type: MessageType,
        /// Array index of the bad field.
        index: usize,
        /// Expected JSON type.
        expected: &'static str,
    },
}

/// Failures reported by a transport collaborator.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Opening the connection failed.
    #[error("failed to connect to {url}: {reason}")]
    Connect {
        /// Address we tried to reach.
        url: String,
        /// Why it failed.
        reason: String,
    },

    /// `send` was called before `connect` completed.
    #[error("transport is not connected")]
    NotConnected,

    /// The connection is gone.
    #[error("transport closed")]
    Closed,

    /// The outbound message could not be written.
    #[error("send failed: {0}")]
    Send(String),

    /// The outbound message could not be serialized.
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Why a call did not resolve to a value.
#[derive(Debug, Error)]
pub enum CallError {
    /// The peer answered with CALLERROR.
    #[error("call failed: {error}")]
    Remote {
        /// Error payload the peer sent (element 2 of CALLERROR).
        error: Value,
        /// Any further elements the peer appended.
        details: Vec<Value>,
    },

    /// The result arrived but did not decode to the requested type.
    #[error("failed to decode call result: {0}")]
    Decode(#[source] serde_json::Error),

    /// No answer arrived before the call deadline.
    #[error("call timed out after {timeout_ms}ms")]
    Timeout {
        /// Deadline that elapsed.
        timeout_ms: u64,
    },

    /// The session closed while the call was outstanding.
    #[error("session closed before the call completed")]
    SessionClosed,

    /// The CALL message could not be handed to the transport.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl CallError {
    /// Whether the peer itself rejected the call.
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }
}

/// Why a session could not be established.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The transport failed to connect or send.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The socket connected but no WELCOME arrived in time.
    #[error("no WELCOME within {timeout_ms}ms")]
    ConnectTimeout {
        /// Deadline that elapsed.
        timeout_ms: u64,
    },

    /// The transport closed before the server sent WELCOME.
    #[error("transport closed before WELCOME")]
    ClosedBeforeWelcome,

    /// `connect` was called while another `connect` was in progress or after
    /// one succeeded.
    #[error("session is already connected")]
    AlreadyConnected,
}

/// Why a prefix definition was refused.
#[derive(Debug, Error)]
pub enum PrefixError {
    /// The prefix is empty or contains `:`, so references to it would not
    /// expand back.
    #[error("invalid prefix {0:?}: must be non-empty and must not contain ':'")]
    Invalid(String),

    /// The PREFIX announcement could not be sent.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_field_display() {
        let err = ProtocolError::MissingField {
            message_type: MessageType::CallResult,
            index: 2,
        };
        assert_eq!(err.to_string(), "CALLRESULT message is missing field 2");
    }

    #[test]
    fn invalid_field_display() {
        let err = ProtocolError::InvalidField {
            message_type: MessageType::Event,
            index: 1,
            expected: "a string",
        };
        assert_eq!(err.to_string(), "EVENT message field 1 must be a string");
    }

    #[test]
    fn remote_call_error_carries_payload() {
        let err = CallError::Remote {
            error: json!("bad args"),
            details: vec![],
        };
        assert!(err.is_remote());
        assert!(err.to_string().contains("bad args"));
    }

    #[test]
    fn timeout_is_not_remote() {
        let err = CallError::Timeout { timeout_ms: 500 };
        assert!(!err.is_remote());
        assert_eq!(err.to_string(), "call timed out after 500ms");
    }

    #[test]
    fn transport_error_into_session_error() {
        let err: SessionError = TransportError::Closed.into();
        assert!(matches!(err, SessionError::Transport(TransportError::Closed)));
        assert_eq!(err.to_string(), "transport closed");
    }

    #[test]
    fn invalid_prefix_display() {
        let err = PrefixError::Invalid("a:b".into());
        assert_eq!(
            err.to_string(),
            "invalid prefix \"a:b\": must be non-empty and must not contain ':'"
        );
    }

    #[test]
    fn connect_error_display() {
        let err = TransportError::Connect {
            url: "ws://localhost:9000".into(),
            reason: "refused".into(),
        };
        assert_eq!(err.to_string(), "failed to connect to ws://localhost:9000: refused");
    }
}
