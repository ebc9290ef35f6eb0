//! Session tuning knobs.

use std::time::Duration;

use wamp_core::CALL_ID_LENGTH;

/// Per-session configuration.
///
/// Both deadlines default to `None`: calls and connects wait until the peer
/// answers or the transport closes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// Deadline applied to every `call` that does not pass its own.
    pub call_timeout: Option<Duration>,
    /// How long `connect` waits for WELCOME after the transport connects.
    pub connect_timeout: Option<Duration>,
    /// Length of generated call IDs.
    pub call_id_length: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            call_timeout: None,
            connect_timeout: None,
            call_id_length: CALL_ID_LENGTH,
        }
    }
}

impl SessionConfig {
    /// Set the default call deadline.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Set the WELCOME deadline.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set the generated call ID length (at least 1).
    pub fn with_call_id_length(mut self, length: usize) -> Self {
        self.call_id_length = length.max(1);
        self
    }
}
