//! Client-side transport capability.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{error::TransportError, protocol::Message};

/// Where a transport delivers messages received from the server.
pub type InboundSender = mpsc::UnboundedSender<Message>;

/// A physical connection a connector drives.
///
/// Implementations only move messages; correlation, handshake and lifecycle
/// belong to the connector.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the connection. Received messages go to `inbound`.
    async fn connect(&self, inbound: InboundSender) -> Result<(), TransportError>;

    /// Close the connection.
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Send one message to the server.
    async fn send(&self, message: Message) -> Result<(), TransportError>;
}
