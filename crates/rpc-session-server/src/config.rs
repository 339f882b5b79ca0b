//! Orchestrator configuration.

use std::time::Duration;

use rpc_session_core::protocol::{Implementation, LATEST_PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Default inactivity window before a live session is reaped.
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_millis(300_000);

/// Settings for a [`SessionManager`](crate::SessionManager).
///
/// Durations are (de)serialized as milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ManagerConfig {
    /// Identity advertised in the `initialize` result.
    pub server_info: Implementation,
    /// Optional usage instructions for the client.
    pub instructions: Option<String>,
    /// Capabilities advertised in the `initialize` result.
    pub capabilities: Value,
    /// Version offered when the client asks for one we do not support.
    pub protocol_version: String,
    /// Items per page for `*/list` methods.
    pub page_size: usize,
    /// Interval between store polls when resuming on a pull-only store.
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// Idle time after which the cleanup task reaps a session.
    #[serde(with = "duration_ms")]
    pub inactivity_timeout: Duration,
    /// Interval between cleanup runs.
    #[serde(with = "duration_ms")]
    pub cleanup_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            server_info: Implementation::new(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            instructions: None,
            capabilities: json!({
                "tools": { "listChanged": true },
                "prompts": { "listChanged": true },
                "resources": { "subscribe": true, "listChanged": true },
            }),
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            page_size: 50,
            poll_interval: Duration::from_secs(1),
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl ManagerConfig {
    #[must_use]
    pub fn with_server_info(mut self, server_info: Implementation) -> Self {
        self.server_info = server_info;
        self
    }

    #[must_use]
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    #[must_use]
    pub const fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    #[must_use]
    pub const fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
