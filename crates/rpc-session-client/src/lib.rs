//! Client side of resumable RPC sessions.
//!
//! Provides:
//! - `Connector` - Handshake, request correlation and cancellation
//! - `MessageHandler` - Hook for server notifications and requests
//! - `ConnectorConfig` - What the client announces

pub mod config;
pub mod connector;
pub mod handler;

pub use config::ConnectorConfig;
pub use connector::{ConnectionState, Connector, ConnectorError, ServerPeer};
pub use handler::{DefaultHandler, MessageHandler};
