//! Wire messages.
//!
//! Every message is a JSON array whose first element is an integer type tag:
//!
//! | Tag | Name        | Shape                                           |
//! |-----|-------------|-------------------------------------------------|
//! | 0   | WELCOME     | `[0, sessionId, protocolVersion, serverIdent]`  |
//! | 1   | PREFIX      | `[1, prefix, uri]`                              |
//! | 2   | CALL        | `[2, callId, procedure, arg1, arg2, ...]`       |
//! | 3   | CALLRESULT  | `[3, callId, result]`                           |
//! | 4   | CALLERROR   | `[4, callId, error, ...details]`                |
//! | 5   | SUBSCRIBE   | `[5, topic]`                                    |
//! | 6   | UNSUBSCRIBE | `[6, topic]`                                    |
//! | 7   | PUBLISH     | `[7, topic, event]`                             |
//! | 8   | EVENT       | `[8, topic, event]`                             |

use std::fmt;

use serde_json::Value;

use crate::errors::ProtocolError;
use crate::ids::{CallId, SessionId};

/// Numeric message type tag (element 0 of every message).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageType {
    /// Server greeting carrying the session ID.
    Welcome = 0,
    /// Announces a URI prefix abbreviation.
    Prefix = 1,
    /// Remote procedure call.
    Call = 2,
    /// Successful call result.
    CallResult = 3,
    /// Failed call result.
    CallError = 4,
    /// Subscribe to a topic.
    Subscribe = 5,
    /// Unsubscribe from a topic.
    Unsubscribe = 6,
    /// Publish an event to a topic.
    Publish = 7,
    /// Event delivered for a subscribed topic.
    Event = 8,
}

impl MessageType {
    /// All message types in tag order.
    pub const ALL: [Self; 9] = [
        Self::Welcome,
        Self::Prefix,
        Self::Call,
        Self::CallResult,
        Self::CallError,
        Self::Subscribe,
        Self::Unsubscribe,
        Self::Publish,
        Self::Event,
    ];

    /// Numeric tag as sent on the wire.
    pub fn code(self) -> u64 {
        self as u64
    }

    /// Upper-case protocol name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Welcome => "WELCOME",
            Self::Prefix => "PREFIX",
            Self::Call => "CALL",
            Self::CallResult => "CALLRESULT",
            Self::CallError => "CALLERROR",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Publish => "PUBLISH",
            Self::Event => "EVENT",
        }
    }

    /// Whether a client expects to receive this type from the server.
    pub fn is_inbound(self) -> bool {
        matches!(
            self,
            Self::Welcome | Self::CallResult | Self::CallError | Self::Event
        )
    }

    /// Classify a raw message by its leading tag without decoding the rest.
    pub fn of(raw: &Value) -> Result<Self, ProtocolError> {
        let items = raw.as_array().ok_or(ProtocolError::NotAnArray)?;
        let tag = items.first().ok_or(ProtocolError::Empty)?;
        let code = tag
            .as_u64()
            .ok_or_else(|| ProtocolError::InvalidTag(tag.clone()))?;
        Self::try_from(code)
    }
}

impl TryFrom<u64> for MessageType {
    type Error = ProtocolError;

    fn try_from(code: u64) -> Result<Self, Self::Error> {
        usize::try_from(code)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
            .ok_or(ProtocolError::UnknownType(code))
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Protocol version assumed when WELCOME omits it.
pub const PROTOCOL_VERSION: u64 = 1;

/// A decoded protocol message.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// `[0, sessionId, protocolVersion, serverIdent]`
    ///
    /// The trailing fields may be omitted; they decode to
    /// [`PROTOCOL_VERSION`] and an empty ident.
    Welcome {
        /// Server-assigned session ID.
        session_id: SessionId,
        /// Protocol version the server speaks.
        protocol_version: u64,
        /// Free-form server identification.
        server_ident: String,
    },
    /// `[1, prefix, uri]`
    Prefix {
        /// Short alias.
        prefix: String,
        /// Full URI the alias expands to.
        uri: String,
    },
    /// `[2, callId, procedure, args...]`
    Call {
        /// Correlation ID.
        call_id: CallId,
        /// Procedure URI, possibly in `prefix:suffix` form.
        procedure: String,
        /// Positional arguments.
        args: Vec<Value>,
    },
    /// `[3, callId, result]`
    CallResult {
        /// Correlation ID of the originating CALL.
        call_id: CallId,
        /// Result payload.
        result: Value,
    },
    /// `[4, callId, error, details...]`
    CallError {
        /// Correlation ID of the originating CALL.
        call_id: CallId,
        /// Error payload.
        error: Value,
        /// Trailing elements after the error payload.
        details: Vec<Value>,
    },
    /// `[5, topic]`
    Subscribe {
        /// Topic URI, possibly shrunk.
        topic: String,
    },
    /// `[6, topic]`
    Unsubscribe {
        /// Topic URI.
        topic: String,
    },
    /// `[7, topic, event]`
    Publish {
        /// Topic URI, possibly shrunk.
        topic: String,
        /// Event payload.
        event: Value,
    },
    /// `[8, topic, event]`
    Event {
        /// Topic URI as sent by the server, possibly shrunk.
        topic: String,
        /// Event payload.
        event: Value,
    },
}

impl Message {
    /// Tag of this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Welcome { .. } => MessageType::Welcome,
            Self::Prefix { .. } => MessageType::Prefix,
            Self::Call { .. } => MessageType::Call,
            Self::CallResult { .. } => MessageType::CallResult,
            Self::CallError { .. } => MessageType::CallError,
            Self::Subscribe { .. } => MessageType::Subscribe,
            Self::Unsubscribe { .. } => MessageType::Unsubscribe,
            Self::Publish { .. } => MessageType::Publish,
            Self::Event { .. } => MessageType::Event,
        }
    }

    /// Encode as the wire JSON array.
    pub fn to_value(&self) -> Value {
        let tag = Value::from(self.message_type().code());
        let items = match self {
            Self::Welcome {
                session_id,
                protocol_version,
                server_ident,
            } => vec![
                tag,
                Value::from(session_id.as_str()),
                Value::from(*protocol_version),
                Value::from(server_ident.as_str()),
            ],
            Self::Prefix { prefix, uri } => {
                vec![tag, Value::from(prefix.as_str()), Value::from(uri.as_str())]
            }
            Self::Call {
                call_id,
                procedure,
                args,
            } => {
                let mut items = Vec::with_capacity(3 + args.len());
                items.push(tag);
                items.push(Value::from(call_id.as_str()));
                items.push(Value::from(procedure.as_str()));
                items.extend(args.iter().cloned());
                items
            }
            Self::CallResult { call_id, result } => {
                vec![tag, Value::from(call_id.as_str()), result.clone()]
            }
            Self::CallError {
                call_id,
                error,
                details,
            } => {
                let mut items = vec![tag, Value::from(call_id.as_str()), error.clone()];
                items.extend(details.iter().cloned());
                items
            }
            Self::Subscribe { topic } | Self::Unsubscribe { topic } => {
                vec![tag, Value::from(topic.as_str())]
            }
            Self::Publish { topic, event } | Self::Event { topic, event } => {
                vec![tag, Value::from(topic.as_str()), event.clone()]
            }
        };
        Value::Array(items)
    }

    /// Decode and validate a wire JSON array.
    pub fn from_value(raw: &Value) -> Result<Self, ProtocolError> {
        let message_type = MessageType::of(raw)?;
        let items = raw.as_array().ok_or(ProtocolError::NotAnArray)?;
        let fields = Fields {
            message_type,
            items,
        };

        let message = match message_type {
            MessageType::Welcome => Self::Welcome {
                session_id: SessionId::from(fields.string(1)?),
                protocol_version: fields.optional_unsigned(2)?.unwrap_or(PROTOCOL_VERSION),
                server_ident: fields.optional_string(3)?.unwrap_or_default(),
            },
            MessageType::Prefix => Self::Prefix {
                prefix: fields.string(1)?,
                uri: fields.string(2)?,
            },
            MessageType::Call => Self::Call {
                call_id: CallId::from(fields.string(1)?),
                procedure: fields.string(2)?,
                args: fields.rest(3),
            },
            MessageType::CallResult => Self::CallResult {
                call_id: CallId::from(fields.string(1)?),
                result: fields.value(2)?,
            },
            MessageType::CallError => Self::CallError {
                call_id: CallId::from(fields.string(1)?),
                error: fields.value(2)?,
                details: fields.rest(3),
            },
            MessageType::Subscribe => Self::Subscribe {
                topic: fields.string(1)?,
            },
            MessageType::Unsubscribe => Self::Unsubscribe {
                topic: fields.string(1)?,
            },
            MessageType::Publish => Self::Publish {
                topic: fields.string(1)?,
                event: fields.value(2)?,
            },
            MessageType::Event => Self::Event {
                topic: fields.string(1)?,
                event: fields.value(2)?,
            },
        };
        Ok(message)
    }
}

/// Positional field access with shape errors tagged by message type.
struct Fields<'a> {
    message_type: MessageType,
    items: &'a [Value],
}

impl Fields<'_> {
    fn value(&self, index: usize) -> Result<Value, ProtocolError> {
        self.items.get(index).cloned().ok_or_else(|| self.missing(index))
    }

    fn string(&self, index: usize) -> Result<String, ProtocolError> {
        match self.items.get(index) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(_) => Err(self.invalid(index, "a string")),
            None => Err(self.missing(index)),
        }
    }

    fn unsigned(&self, index: usize) -> Result<u64, ProtocolError> {
        self.items
            .get(index)
            .ok_or_else(|| self.missing(index))?
            .as_u64()
            .ok_or_else(|| self.invalid(index, "an unsigned integer"))
    }

    fn optional_string(&self, index: usize) -> Result<Option<String>, ProtocolError> {
        match self.items.get(index) {
            None => Ok(None),
            Some(_) => self.string(index).map(Some),
        }
    }

    fn optional_unsigned(&self, index: usize) -> Result<Option<u64>, ProtocolError> {
        match self.items.get(index) {
            None => Ok(None),
            Some(_) => self.unsigned(index).map(Some),
        }
    }

    fn rest(&self, from: usize) -> Vec<Value> {
        self.items.iter().skip(from).cloned().collect()
    }

    fn missing(&self, index: usize) -> ProtocolError {
        ProtocolError::MissingField {
            message_type: self.message_type,
            index,
        }
    }

    fn invalid(&self, index: usize, expected: &'static str) -> ProtocolError {
        ProtocolError::InvalidField {
            message_type: self.message_type,
            index,
            expected,
        }
    }
}

/// Decode JSON values that arrive back-to-back in one payload.
///
/// `[3]["test"]` yields two arrays. Whitespace between values is allowed.
/// Decoding stops at the first malformed value.
pub fn decode_stream(payload: &str) -> impl Iterator<Item = Result<Value, serde_json::Error>> + '_ {
    serde_json::Deserializer::from_str(payload).into_iter::<Value>()
}
