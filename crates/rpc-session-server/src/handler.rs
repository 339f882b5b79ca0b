//! Extension points for application logic.

use std::sync::Arc;

use async_trait::async_trait;
use rpc_session_core::{
    error::SessionError,
    protocol::{ErrorObject, Message},
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::session::Session;

/// Application logic behind a [`SessionManager`](crate::SessionManager).
///
/// Built-in methods (`ping`, the `*/list` family, resource subscriptions,
/// cancellation) never reach the handler.
#[async_trait]
pub trait ServerHandler: Send + Sync {
    /// Runs in the background after a session is created.
    async fn on_session_initialized(&self, _session: Arc<Session>) -> Result<(), SessionError> {
        Ok(())
    }

    /// Answer a request. `cancel` fires if the client cancels it.
    async fn handle_request(
        &self,
        _session: Arc<Session>,
        request: Message,
        _cancel: CancellationToken,
    ) -> Result<Value, SessionError> {
        Err(ErrorObject::method_not_found(request.method().unwrap_or_default()).into())
    }

    /// React to a notification.
    async fn handle_notification(
        &self,
        _session: Arc<Session>,
        _notification: Message,
    ) -> Result<(), SessionError> {
        Ok(())
    }
}

/// Handler that only serves built-in methods.
pub struct DefaultHandler;

#[async_trait]
impl ServerHandler for DefaultHandler {}

/// Source of new session identifiers.
pub trait SessionIdGenerator: Send + Sync {
    /// # Errors
    /// Returns error if no identifier can be produced.
    fn generate(&self) -> Result<String, SessionError>;
}

/// Random UUID v4 identifiers.
pub struct UuidGenerator;

impl SessionIdGenerator for UuidGenerator {
    fn generate(&self) -> Result<String, SessionError> {
        Ok(Uuid::new_v4().to_string())
    }
}
