//! Handling of server-initiated traffic.

use async_trait::async_trait;
use rpc_session_core::protocol::{ErrorObject, Message};
use serde_json::Value;

use crate::connector::ServerPeer;

/// Trait for reacting to what the server sends on its own initiative.
///
/// Implement this trait to integrate server notifications and
/// server-to-client requests with your application.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Called once the handshake completed.
    async fn on_connect(&self, _server: &ServerPeer) {}

    /// A notification from the server.
    async fn on_notification(&self, _notification: Message) {}

    /// A request from the server. The result or error is sent back as-is.
    ///
    /// # Errors
    /// The default refuses every request.
    async fn on_request(&self, request: Message) -> Result<Value, ErrorObject> {
        Err(ErrorObject::new(
            ErrorObject::METHOD_NOT_FOUND,
            format!(
                "Server requests are not enabled: {}",
                request.method().unwrap_or_default()
            ),
        ))
    }
}

/// Handler that ignores notifications and refuses server requests.
#[derive(Debug, Default, Clone)]
pub struct DefaultHandler;

#[async_trait]
impl MessageHandler for DefaultHandler {}
