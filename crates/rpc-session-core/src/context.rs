//! Binding between a session and one physical connection.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    error::ChannelError,
    event::{ChannelId, EventId},
    protocol::Message,
    store::SessionId,
};

/// A message leaving through a channel, tagged with its log event id.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub event_id: Option<EventId>,
    pub message: Message,
}

/// Write side of a physical connection.
#[async_trait]
pub trait ChannelWriter: Send + Sync {
    /// Write one message. `event_id` lets the peer resume after it.
    async fn write(&self, message: Message, event_id: Option<EventId>) -> Result<(), ChannelError>;
}

#[async_trait]
impl ChannelWriter for mpsc::UnboundedSender<Outbound> {
    async fn write(&self, message: Message, event_id: Option<EventId>) -> Result<(), ChannelError> {
        self.send(Outbound { event_id, message })
            .map_err(|_| ChannelError::Closed)
    }
}

#[async_trait]
impl ChannelWriter for mpsc::UnboundedSender<Message> {
    async fn write(&self, message: Message, _event_id: Option<EventId>) -> Result<(), ChannelError> {
        self.send(message).map_err(|_| ChannelError::Closed)
    }
}

/// Everything the server knows about the connection a message arrived on.
#[derive(Clone)]
pub struct ConnectionContext {
    /// Physical connection identifier.
    pub channel_id: ChannelId,
    /// Session the caller claims, if any.
    pub session_id: Option<SessionId>,
    /// Authenticated caller identity, if any.
    pub user_id: Option<String>,
    /// Last event the caller has seen, for resumption.
    pub last_event_id: Option<EventId>,
    /// Fires when the caller gives up on this connection.
    pub cancellation: CancellationToken,
    /// Fires when the physical connection ends.
    pub closed: CancellationToken,
    writer: Arc<dyn ChannelWriter>,
}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("channel_id", &self.channel_id)
            .field("session_id", &self.session_id)
            .field("user_id", &self.user_id)
            .field("last_event_id", &self.last_event_id)
            .field("closed", &self.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl ConnectionContext {
    /// Create a context with a fresh channel id.
    #[must_use]
    pub fn new(writer: Arc<dyn ChannelWriter>) -> Self {
        Self::with_channel_id(Uuid::new_v4().to_string(), writer)
    }

    /// Create a context for a known channel id.
    #[must_use]
    pub fn with_channel_id(channel_id: impl Into<ChannelId>, writer: Arc<dyn ChannelWriter>) -> Self {
        Self {
            channel_id: channel_id.into(),
            session_id: None,
            user_id: None,
            last_event_id: None,
            cancellation: CancellationToken::new(),
            closed: CancellationToken::new(),
            writer,
        }
    }

    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<SessionId>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    #[must_use]
    pub fn with_last_event_id(mut self, last_event_id: impl Into<EventId>) -> Self {
        self.last_event_id = Some(last_event_id.into());
        self
    }

    /// Shared handle to the channel writer.
    #[must_use]
    pub fn writer(&self) -> Arc<dyn ChannelWriter> {
        Arc::clone(&self.writer)
    }

    /// Write through the channel.
    ///
    /// # Errors
    /// Returns error if the channel is closed or the write fails.
    pub async fn write(&self, message: Message, event_id: Option<EventId>) -> Result<(), ChannelError> {
        if self.closed.is_cancelled() {
            return Err(ChannelError::Closed);
        }
        self.writer.write(message, event_id).await
    }

    /// Signal that the physical connection ended.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// True once either the connection closed or the caller cancelled.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.closed.is_cancelled() || self.cancellation.is_cancelled()
    }
}
