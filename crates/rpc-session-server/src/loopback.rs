//! In-process transport bridging a connector to a [`SessionManager`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use rpc_session_core::{
    ConnectionContext, Outbound, Transport,
    error::TransportError,
    event::EventId,
    protocol::{Message, methods},
    store::SessionId,
    transport::InboundSender,
};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::manager::{ResumeHandle, SessionManager};

struct Link {
    ctx: ConnectionContext,
    pump: JoinHandle<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Loopback bridge for driving a session manager without a network.
///
/// Every connection gets its own channel id; the session id assigned by the
/// handshake and the last delivered event id are remembered across
/// connections so a later [`resume`](Self::resume) can pick up where the
/// previous connection stopped.
pub struct LoopbackTransport {
    manager: Arc<SessionManager>,
    user_id: Option<String>,
    link: Mutex<Option<Link>>,
    session_id: Mutex<Option<SessionId>>,
    last_event_id: Arc<Mutex<Option<EventId>>>,
}

impl LoopbackTransport {
    /// Create a bridge to `manager`.
    #[must_use]
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self {
            manager,
            user_id: None,
            link: Mutex::new(None),
            session_id: Mutex::new(None),
            last_event_id: Arc::new(Mutex::new(None)),
        }
    }

    /// Authenticate every connection as `user_id`.
    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Session assigned by the last handshake.
    #[must_use]
    pub fn session_id(&self) -> Option<SessionId> {
        lock(&self.session_id).clone()
    }

    /// Last event delivered to the client.
    #[must_use]
    pub fn last_event_id(&self) -> Option<EventId> {
        lock(&self.last_event_id).clone()
    }

    /// Open a fresh link; the previous one, if any, is closed.
    fn open(&self, inbound: InboundSender) -> ConnectionContext {
        let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
        let last_event_id = Arc::clone(&self.last_event_id);
        let pump = tokio::spawn(async move {
            while let Some(out) = rx.recv().await {
                if let Some(id) = out.event_id {
                    *lock(&last_event_id) = Some(id);
                }
                if inbound.send(out.message).is_err() {
                    break;
                }
            }
        });

        let mut ctx = ConnectionContext::new(Arc::new(tx));
        ctx.user_id.clone_from(&self.user_id);
        let previous = lock(&self.link).replace(Link {
            ctx: ctx.clone(),
            pump,
        });
        if let Some(previous) = previous {
            previous.ctx.close();
            previous.pump.abort();
        }
        ctx
    }

    /// Reconnect to the last session and replay what was missed.
    ///
    /// # Errors
    /// Returns error if there is no session to resume or the manager refuses.
    pub async fn resume(&self, inbound: InboundSender) -> Result<ResumeHandle, TransportError> {
        let session_id = self
            .session_id()
            .ok_or_else(|| TransportError::Connect("no session to resume".into()))?;
        let mut ctx = self.open(inbound).with_session(session_id);
        ctx.last_event_id = self.last_event_id();

        self.manager
            .resume_message(ctx)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(&self, inbound: InboundSender) -> Result<(), TransportError> {
        let ctx = self.open(inbound);
        tracing::debug!(channel_id = %ctx.channel_id, "Loopback connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let link = lock(&self.link).take();
        let Some(link) = link else {
            return Ok(());
        };
        link.ctx.close();
        link.pump.abort();

        if let Some(id) = self.session_id() {
            if let Err(e) = self.manager.pause_session(&id).await {
                tracing::warn!(session_id = %id, "Failed to pause session: {e}");
            }
        }
        tracing::debug!(channel_id = %link.ctx.channel_id, "Loopback disconnected");
        Ok(())
    }

    async fn send(&self, message: Message) -> Result<(), TransportError> {
        let ctx = lock(&self.link)
            .as_ref()
            .map(|link| link.ctx.clone())
            .ok_or(TransportError::NotConnected)?;
        let ctx = match self.session_id() {
            Some(id) => ctx.with_session(id),
            None => ctx,
        };

        // The handshake runs inline so later messages carry the session id.
        if message.method() == Some(methods::INITIALIZE) {
            let session = self
                .manager
                .handle_message(message, ctx)
                .await
                .map_err(|e| TransportError::Send(e.to_string()))?;
            *lock(&self.session_id) = Some(session.id().to_string());
            return Ok(());
        }

        let manager = Arc::clone(&self.manager);
        tokio::spawn(async move {
            if let Err(e) = manager.handle_message(message, ctx).await {
                tracing::warn!("Loopback message rejected: {e}");
            }
        });
        Ok(())
    }
}
