//! Settings schema.
//!
//! Field names are camelCase on disk. Missing fields take their defaults.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use wamp_session::SessionConfig;

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WampSettings {
    /// Connection and call behavior.
    pub client: ClientSettings,
    /// Prefixes announced right after connecting (`prefix -> uri`).
    pub prefixes: BTreeMap<String, String>,
    /// Log output.
    pub logging: LoggingSettings,
}

impl WampSettings {
    /// Reject values the client cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.client.url.trim().is_empty() {
            return Err(SettingsError::InvalidValue("client.url is empty".into()));
        }
        if self.client.call_id_length == 0 {
            return Err(SettingsError::InvalidValue(
                "client.callIdLength must be at least 1".into(),
            ));
        }
        if let Some(prefix) = self
            .prefixes
            .keys()
            .find(|p| p.is_empty() || p.contains(':'))
        {
            return Err(SettingsError::InvalidValue(format!(
                "prefix {prefix:?} must be non-empty and contain no ':'"
            )));
        }
        Ok(())
    }
}

/// Connection and call behavior.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    /// Server address.
    pub url: String,
    /// How long to wait for WELCOME after connecting. `0` waits forever.
    pub connect_timeout_ms: u64,
    /// Default call deadline. `0` waits forever.
    pub call_timeout_ms: u64,
    /// Length of generated call IDs.
    pub call_id_length: usize,
    /// WebSocket subprotocol to request. Empty requests none.
    pub subprotocol: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9000".to_string(),
            connect_timeout_ms: 10_000,
            call_timeout_ms: 0,
            call_id_length: SessionConfig::default().call_id_length,
            subprotocol: "wamp".to_string(),
        }
    }
}

impl ClientSettings {
    /// Session configuration for these settings.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            call_timeout: millis(self.call_timeout_ms),
            connect_timeout: millis(self.connect_timeout_ms),
            call_id_length: self.call_id_length.max(1),
        }
    }

    /// Subprotocol to request, if any.
    pub fn subprotocol(&self) -> Option<&str> {
        Some(self.subprotocol.as_str()).filter(|p| !p.is_empty())
    }
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// Log output settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
