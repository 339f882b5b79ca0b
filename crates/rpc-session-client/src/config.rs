//! Connector configuration.

use rpc_session_core::protocol::{Implementation, LATEST_PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// What a [`Connector`](crate::Connector) announces in its handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectorConfig {
    pub client_info: Implementation,
    pub capabilities: Value,
    /// Version requested in `initialize`.
    pub protocol_version: String,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            client_info: Implementation::new(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            capabilities: json!({}),
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
        }
    }
}

impl ConnectorConfig {
    #[must_use]
    pub fn with_client_info(mut self, client_info: Implementation) -> Self {
        self.client_info = client_info;
        self
    }

    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Value) -> Self {
        self.capabilities = capabilities;
        self
    }

    #[must_use]
    pub fn with_protocol_version(mut self, version: impl Into<String>) -> Self {
        self.protocol_version = version.into();
        self
    }
}
