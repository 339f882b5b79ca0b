//! Session manager for orchestrating live and stored sessions.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use futures::StreamExt;
use rpc_session_core::{
    ConnectionContext,
    error::SessionError,
    event::{EventId, NewEvent, SessionEvent, Side, now_ms},
    protocol::{
        CancelledParams, ErrorObject, InitializeParams, InitializeResult, Message, MessageKind,
        PaginatedParams, ResourceUriParams, SUPPORTED_PROTOCOL_VERSIONS, methods,
    },
    store::{EventStream, SessionId, SessionStore},
};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    config::ManagerConfig,
    cursor,
    handler::{DefaultHandler, ServerHandler, SessionIdGenerator, UuidGenerator},
    session::{Handshake, NoopHooks, Session, SessionHooks},
};

/// A running resumption: replayed events plus live delivery.
pub struct ResumeHandle {
    session: Arc<Session>,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl ResumeHandle {
    /// The resumed session.
    #[must_use]
    pub fn session(&self) -> Arc<Session> {
        Arc::clone(&self.session)
    }

    /// Stop live delivery.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Wait for live delivery to end.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            tracing::error!("Resume delivery task failed: {e}");
        }
    }
}

enum LiveSource {
    Stream(EventStream),
    Poll(Arc<dyn SessionStore>),
}

/// Session manager for orchestrating sessions across channels.
pub struct SessionManager {
    config: ManagerConfig,
    store: Option<Arc<dyn SessionStore>>,
    handler: Arc<dyn ServerHandler>,
    hooks: Arc<dyn SessionHooks>,
    id_generator: Arc<dyn SessionIdGenerator>,
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    subscriptions: RwLock<HashMap<String, HashSet<SessionId>>>,
}

impl SessionManager {
    /// Create a manager with no store and the default handler.
    #[must_use]
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            store: None,
            handler: Arc::new(DefaultHandler),
            hooks: Arc::new(NoopHooks),
            id_generator: Arc::new(UuidGenerator),
            sessions: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn ServerHandler>) -> Self {
        self.handler = handler;
        self
    }

    #[must_use]
    pub fn with_hooks(mut self, hooks: Arc<dyn SessionHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    #[must_use]
    pub fn with_id_generator(mut self, generator: Arc<dyn SessionIdGenerator>) -> Self {
        self.id_generator = generator;
        self
    }

    #[must_use]
    pub const fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Get a live session.
    pub async fn get_session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Live sessions subscribed to `uri`.
    pub async fn subscribers(&self, uri: &str) -> Vec<SessionId> {
        self.subscriptions
            .read()
            .await
            .get(uri)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn generate_id(&self) -> SessionId {
        match self.id_generator.generate() {
            Ok(id) if !id.is_empty() => id,
            Ok(_) => {
                tracing::error!("Session id generator returned an empty id, using UUID");
                UuidGenerator.generate().unwrap_or_default()
            }
            Err(e) => {
                tracing::error!("Session id generator failed, using UUID: {e}");
                UuidGenerator.generate().unwrap_or_default()
            }
        }
    }

    fn negotiate_version(&self, requested: &str) -> String {
        if SUPPORTED_PROTOCOL_VERSIONS.contains(&requested) {
            requested.to_string()
        } else {
            self.config.protocol_version.clone()
        }
    }

    /// Create a brand-new session bound to the calling channel.
    ///
    /// A session id carried by `ctx` is never reused.
    ///
    /// # Errors
    /// Returns error if the session cannot be stored.
    pub async fn initialize_session(
        &self,
        params: InitializeParams,
        ctx: &ConnectionContext,
    ) -> Result<Arc<Session>, SessionError> {
        let id = self.generate_id();
        let handshake = Handshake {
            protocol_version: self.negotiate_version(&params.protocol_version),
            client_info: params.client_info,
            client_capabilities: params.capabilities,
            server_info: self.config.server_info.clone(),
            server_capabilities: self.config.capabilities.clone(),
        };

        let mut session = Session::new(id.clone())
            .with_hooks(Arc::clone(&self.hooks))
            .with_user(ctx.user_id.clone())
            .with_handshake(handshake);
        if let Some(store) = &self.store {
            session = session.with_store(Arc::clone(store));
        }
        let session = Arc::new(session);

        // The durable record must exist before any events are pushed.
        session.save().await?;
        self.sessions
            .write()
            .await
            .insert(id.clone(), Arc::clone(&session));
        session.attach_channel(ctx.clone()).await?;
        tracing::info!(session_id = %id, channel_id = %ctx.channel_id, "Session initialized");

        let handler = Arc::clone(&self.handler);
        let spawned = Arc::clone(&session);
        tokio::spawn(async move {
            if let Err(e) = handler.on_session_initialized(Arc::clone(&spawned)).await {
                tracing::error!(session_id = %spawned.id(), "Post-initialize hook failed: {e}");
            }
        });

        Ok(session)
    }

    /// Find the session `ctx` names, loading it from the store if needed.
    async fn resolve_session(&self, ctx: &ConnectionContext) -> Result<Arc<Session>, SessionError> {
        let id = ctx
            .session_id
            .as_deref()
            .ok_or_else(|| SessionError::InvalidRequest("missing session id".into()))?;

        let live = self.get_session(id).await;
        let session = match live {
            Some(session) => session,
            None => {
                let snapshot = match &self.store {
                    Some(store) => store.get(Some(id)).await?,
                    None => None,
                };
                let snapshot = snapshot.ok_or_else(|| SessionError::NotFound(id.to_string()))?;
                let mut session = Session::from_snapshot(snapshot).with_hooks(Arc::clone(&self.hooks));
                if let Some(store) = &self.store {
                    session = session.with_store(Arc::clone(store));
                }
                let session = Arc::new(session);

                // Another task may have loaded it meanwhile.
                let session = Arc::clone(
                    self.sessions
                        .write()
                        .await
                        .entry(id.to_string())
                        .or_insert(session),
                );
                self.index_subscriptions(&session).await;
                tracing::debug!(session_id = %id, "Session loaded from store");
                session
            }
        };

        if session.user_id() != ctx.user_id {
            return Err(SessionError::Forbidden(format!(
                "session {id} belongs to another user"
            )));
        }
        Ok(session)
    }

    /// Dispatch one inbound message.
    ///
    /// Only handshake and session validation failures are returned; any
    /// other failure is logged and answered with an error reply.
    ///
    /// # Errors
    /// Returns `InvalidRequest`, `NotFound` or `Forbidden`.
    pub async fn handle_message(
        &self,
        message: Message,
        ctx: ConnectionContext,
    ) -> Result<Arc<Session>, SessionError> {
        if message.method() == Some(methods::INITIALIZE) {
            return self.handle_initialize(message, &ctx).await;
        }

        let session = self.resolve_session(&ctx).await?;
        if session.channel_id().as_deref() != Some(ctx.channel_id.as_str()) {
            if let Err(e) = session.attach_channel(ctx.clone()).await {
                tracing::warn!(session_id = %session.id(), "Failed to attach channel: {e}");
            }
        }

        let request_id = if message.is_request() {
            message.id.clone()
        } else {
            None
        };
        if let Err(error) = self.dispatch(&session, message, &ctx).await {
            tracing::error!(session_id = %session.id(), "Message handling failed: {error}");
            if let Some(id) = request_id {
                let reply = Message::error_response(Some(id), error.to_error_object());
                if let Err(e) = session.reply(reply).await {
                    tracing::warn!(session_id = %session.id(), "Failed to send error reply: {e}");
                }
            }
        }
        Ok(session)
    }

    async fn handle_initialize(
        &self,
        message: Message,
        ctx: &ConnectionContext,
    ) -> Result<Arc<Session>, SessionError> {
        let Some(id) = message.id.clone() else {
            return Err(SessionError::InvalidRequest(
                "initialize must be a request".into(),
            ));
        };
        let params: InitializeParams = message
            .params_as()
            .map_err(|e| SessionError::InvalidRequest(format!("invalid initialize params: {e}")))?;

        let session = self.initialize_session(params, ctx).await?;
        session
            .add_event(NewEvent::message(Side::Client, message))
            .await?;

        let result = InitializeResult {
            protocol_version: session.protocol_version(),
            capabilities: self.config.capabilities.clone(),
            server_info: self.config.server_info.clone(),
            instructions: self.config.instructions.clone(),
        };
        let result = serde_json::to_value(result)
            .map_err(|e| SessionError::Internal(e.to_string()))?;
        if let Err(e) = session.reply(Message::response(id, result)).await {
            tracing::warn!(session_id = %session.id(), "Failed to send initialize result: {e}");
        }
        Ok(session)
    }

    async fn dispatch(
        &self,
        session: &Arc<Session>,
        message: Message,
        ctx: &ConnectionContext,
    ) -> Result<(), SessionError> {
        match message.kind() {
            MessageKind::Request => self.handle_request(session, message, ctx).await,
            MessageKind::Notification => {
                session
                    .add_event(NewEvent::message(Side::Client, message.clone()))
                    .await?;
                self.handle_notification(session, message).await
            }
            MessageKind::Response | MessageKind::Error => {
                session
                    .add_event(NewEvent::message(Side::Client, message.clone()))
                    .await?;
                if !session.handle_response(&message) {
                    tracing::debug!(session_id = %session.id(), "Response to unknown request");
                }
                Ok(())
            }
            MessageKind::Invalid => Err(SessionError::InvalidRequest(
                "message is neither a request, a notification nor a response".into(),
            )),
        }
    }

    async fn handle_request(
        &self,
        session: &Arc<Session>,
        message: Message,
        ctx: &ConnectionContext,
    ) -> Result<(), SessionError> {
        let Some(id) = message.id.clone() else {
            return Err(SessionError::InvalidRequest("request without id".into()));
        };
        session
            .add_event(NewEvent::message(Side::Client, message.clone()))
            .await?;

        let token = session.start_request(id.clone());
        let outcome = tokio::select! {
            biased;
            () = token.cancelled() => None,
            () = ctx.cancellation.cancelled() => {
                session.cancel_request(&id, Some("connection cancelled".into())).await?;
                None
            }
            result = self.route_request(session, &message, token.clone()) => Some(result),
        };
        session.end_request(&id);

        match outcome {
            Some(Ok(result)) => session.reply(Message::response(id, result)).await,
            Some(Err(e)) => Err(e),
            None => {
                tracing::debug!(session_id = %session.id(), request_id = %id, "Request cancelled, no reply");
                Ok(())
            }
        }
    }

    async fn route_request(
        &self,
        session: &Arc<Session>,
        message: &Message,
        cancel: CancellationToken,
    ) -> Result<Value, SessionError> {
        match message.method().unwrap_or_default() {
            methods::PING => Ok(json!({})),
            methods::TOOLS_LIST => self.list_page(message, "tools", &session.tools()),
            methods::PROMPTS_LIST => self.list_page(message, "prompts", &session.prompts()),
            methods::RESOURCES_LIST => self.list_page(message, "resources", &session.resources()),
            methods::RESOURCES_TEMPLATES_LIST => {
                self.list_page(message, "resourceTemplates", &session.resource_templates())
            }
            methods::RESOURCES_SUBSCRIBE => {
                let params: ResourceUriParams = params(message)?;
                self.subscribe(session, &params.uri).await?;
                Ok(json!({}))
            }
            methods::RESOURCES_UNSUBSCRIBE => {
                let params: ResourceUriParams = params(message)?;
                self.unsubscribe(session, &params.uri).await?;
                Ok(json!({}))
            }
            methods::INITIALIZE => Err(SessionError::InvalidRequest(
                "session already initialized".into(),
            )),
            _ => {
                self.handler
                    .handle_request(Arc::clone(session), message.clone(), cancel)
                    .await
            }
        }
    }

    fn list_page<T: Serialize>(
        &self,
        message: &Message,
        key: &str,
        items: &[T],
    ) -> Result<Value, SessionError> {
        let params: PaginatedParams = if message.params.is_some() {
            params(message)?
        } else {
            PaginatedParams::default()
        };
        let start = match params.cursor.as_deref() {
            Some(c) => cursor::decode(c).ok_or_else(|| {
                SessionError::Remote(ErrorObject::new(ErrorObject::INVALID_PARAMS, "invalid cursor"))
            })?,
            None => 0,
        };
        let page_size = self.config.page_size.max(1);
        let start = start.min(items.len());
        let end = (start + page_size).min(items.len());

        let page = serde_json::to_value(&items[start..end])
            .map_err(|e| SessionError::Internal(e.to_string()))?;
        let mut result = serde_json::Map::new();
        result.insert(key.to_string(), page);
        if end < items.len() {
            result.insert("nextCursor".into(), Value::String(cursor::encode(end)));
        }
        Ok(Value::Object(result))
    }

    async fn handle_notification(
        &self,
        session: &Arc<Session>,
        message: Message,
    ) -> Result<(), SessionError> {
        match message.method().unwrap_or_default() {
            methods::NOTIFICATION_INITIALIZED => {
                session.mark_initialized();
                Ok(())
            }
            methods::NOTIFICATION_CANCELLED => {
                let params: CancelledParams = params(&message)?;
                if !session.cancel_request(&params.request_id, params.reason).await? {
                    tracing::debug!(
                        session_id = %session.id(),
                        request_id = %params.request_id,
                        "Cancellation for unknown request"
                    );
                }
                Ok(())
            }
            _ => {
                self.handler
                    .handle_notification(Arc::clone(session), message)
                    .await
            }
        }
    }

    /// Subscribe a session to `uri` and index it.
    ///
    /// # Errors
    /// Returns the subscription hook's refusal or a store failure.
    pub async fn subscribe(&self, session: &Arc<Session>, uri: &str) -> Result<(), SessionError> {
        session.subscribe_resource(uri).await?;
        self.subscriptions
            .write()
            .await
            .entry(uri.to_string())
            .or_default()
            .insert(session.id().to_string());
        Ok(())
    }

    /// Unsubscribing from a URI nobody watches is a no-op.
    ///
    /// # Errors
    /// Returns the unsubscription hook's refusal or a store failure.
    pub async fn unsubscribe(&self, session: &Arc<Session>, uri: &str) -> Result<(), SessionError> {
        session.unsubscribe_resource(uri).await?;
        let mut index = self.subscriptions.write().await;
        if let Some(ids) = index.get_mut(uri) {
            ids.remove(session.id());
            if ids.is_empty() {
                index.remove(uri);
            }
        }
        Ok(())
    }

    async fn index_subscriptions(&self, session: &Session) {
        let uris = session.subscriptions();
        if uris.is_empty() {
            return;
        }
        let mut index = self.subscriptions.write().await;
        for uri in uris {
            index.entry(uri).or_default().insert(session.id().to_string());
        }
    }

    async fn unindex_subscriptions(&self, session: &Session) {
        let mut index = self.subscriptions.write().await;
        index.retain(|_, ids| {
            ids.remove(session.id());
            !ids.is_empty()
        });
    }

    /// Send `notifications/resources/updated` to every subscribed live session.
    ///
    /// Returns how many sessions were notified. Delivery failures are logged.
    pub async fn notify_resource_update(&self, uri: &str) -> usize {
        let ids = self.subscribers(uri).await;
        let sessions: Vec<Arc<Session>> = {
            let live = self.sessions.read().await;
            ids.iter().filter_map(|id| live.get(id).cloned()).collect()
        };

        let mut notified = 0;
        for session in sessions {
            // The index can lag an unsubscribe that is still in flight.
            if !session.is_subscribed(uri) {
                continue;
            }
            let notification = Message::notification(
                methods::NOTIFICATION_RESOURCES_UPDATED,
                Some(json!({ "uri": uri })),
            );
            match session.reply(notification).await {
                Ok(()) => notified += 1,
                Err(e) => {
                    tracing::warn!(session_id = %session.id(), "Failed to notify resource update: {e}");
                }
            }
        }
        notified
    }

    /// Reattach a channel to an existing session.
    ///
    /// Replays server messages after `ctx.last_event_id`, then keeps
    /// forwarding new ones until the channel closes, the caller cancels, or
    /// the returned handle is stopped.
    ///
    /// # Errors
    /// Returns `InvalidRequest`, `NotFound` or `Forbidden`.
    pub async fn resume_message(&self, ctx: ConnectionContext) -> Result<ResumeHandle, SessionError> {
        let session = self.resolve_session(&ctx).await?;
        if let Err(e) = session.sync().await {
            tracing::warn!(session_id = %session.id(), "Sync before resume failed: {e}");
        }

        // Subscribe before replaying so nothing falls in between.
        let source = match &self.store {
            Some(store) if store.capabilities().push => match store.subscribe(session.id()) {
                Ok(stream) => LiveSource::Stream(stream),
                Err(e) => {
                    tracing::warn!(session_id = %session.id(), "Store subscribe failed, polling: {e}");
                    LiveSource::Poll(Arc::clone(store))
                }
            },
            Some(store) => LiveSource::Poll(Arc::clone(store)),
            None => LiveSource::Stream(session.event_stream()),
        };

        let events = session.events();
        let mut seen: HashSet<EventId> = events.iter().map(|e| e.id.clone()).collect();
        let replay = match ctx.last_event_id.as_deref() {
            Some(last) => session.events_after(Some(last)),
            None => Vec::new(),
        };
        let side = session.side();
        for event in replay.iter().filter(|e| e.is_message_from(side)) {
            if let Err(e) = forward(&ctx, event).await {
                tracing::warn!(session_id = %session.id(), "Replay interrupted: {e}");
                break;
            }
        }
        tracing::info!(
            session_id = %session.id(),
            channel_id = %ctx.channel_id,
            replayed = replay.len(),
            "Session resumed"
        );

        let stop = ctx.cancellation.child_token();
        let cursor = events.last().map(|e| e.id.clone());
        let poll_interval = self.config.poll_interval;
        let session_id = session.id().to_string();
        let task_stop = stop.clone();
        let task = tokio::spawn(async move {
            match source {
                LiveSource::Stream(stream) => {
                    deliver_stream(stream, &ctx, &task_stop, side, &mut seen).await;
                }
                LiveSource::Poll(store) => {
                    let poll = Poll {
                        store,
                        session_id,
                        cursor,
                        interval: poll_interval,
                    };
                    deliver_polled(poll, &ctx, &task_stop, side, &mut seen).await;
                }
            }
        });

        Ok(ResumeHandle {
            session,
            stop,
            task,
        })
    }

    /// Delete a session on the caller's behalf.
    ///
    /// # Errors
    /// Returns `InvalidRequest`, `NotFound` or `Forbidden`, or a store failure.
    pub async fn terminate_session(&self, ctx: &ConnectionContext) -> Result<(), SessionError> {
        let session = self.resolve_session(ctx).await?;
        self.destroy(&session).await?;
        tracing::info!(session_id = %session.id(), "Session terminated");
        Ok(())
    }

    /// Detach a live session, keeping its durable record.
    ///
    /// Returns whether the session was live.
    ///
    /// # Errors
    /// Returns error if recording the detach fails.
    pub async fn pause_session(&self, id: &str) -> Result<bool, SessionError> {
        let removed = self.sessions.write().await.remove(id);
        let Some(session) = removed else {
            return Ok(false);
        };
        self.unindex_subscriptions(&session).await;
        session.detach_channel().await?;
        tracing::info!(session_id = %id, "Session paused");
        Ok(true)
    }

    async fn destroy(&self, session: &Arc<Session>) -> Result<(), SessionError> {
        self.unindex_subscriptions(session).await;
        self.sessions.write().await.remove(session.id());
        session.close();
        if let Some(store) = &self.store {
            store.delete(session.id()).await?;
        }
        Ok(())
    }

    /// Destroy live sessions idle for longer than `timeout`.
    ///
    /// Sessions without any activity are kept. Returns how many were removed.
    pub async fn cleanup_inactive_sessions(&self, timeout: Duration) -> usize {
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let now = now_ms();
        let stale: Vec<Arc<Session>> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| {
                s.last_activity()
                    .is_some_and(|last| now.saturating_sub(last) > timeout_ms)
            })
            .cloned()
            .collect();

        let mut removed = 0;
        for session in stale {
            match self.destroy(&session).await {
                Ok(()) => removed += 1,
                Err(e) => tracing::error!(session_id = %session.id(), "Cleanup failed: {e}"),
            }
        }
        if removed > 0 {
            tracing::info!(removed, "Cleaned up inactive sessions");
        }
        removed
    }

    /// Run [`cleanup_inactive_sessions`](Self::cleanup_inactive_sessions)
    /// every `interval` until the task is aborted.
    #[must_use]
    pub fn spawn_cleanup_task(self: &Arc<Self>, interval: Duration, timeout: Duration) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                manager.cleanup_inactive_sessions(timeout).await;
            }
        })
    }
}

fn params<T: DeserializeOwned>(message: &Message) -> Result<T, SessionError> {
    message.params_as().map_err(|e| {
        SessionError::Remote(ErrorObject::new(
            ErrorObject::INVALID_PARAMS,
            format!("invalid params: {e}"),
        ))
    })
}

async fn forward(ctx: &ConnectionContext, event: &SessionEvent) -> Result<(), SessionError> {
    let Some(message) = event.message() else {
        return Ok(());
    };
    ctx.write(message.clone(), Some(event.id.clone())).await?;
    Ok(())
}

/// Forward `event` unless it was delivered already or is not outbound.
///
/// Events recorded on `ctx`'s own channel were written to it by the reply
/// path and are skipped.
async fn forward_new(
    ctx: &ConnectionContext,
    event: &SessionEvent,
    side: Side,
    seen: &mut HashSet<EventId>,
) -> Result<(), SessionError> {
    if !event.is_message_from(side)
        || event.channel_id == ctx.channel_id
        || !seen.insert(event.id.clone())
    {
        return Ok(());
    }
    forward(ctx, event).await
}

async fn deliver_stream(
    mut stream: EventStream,
    ctx: &ConnectionContext,
    stop: &CancellationToken,
    side: Side,
    seen: &mut HashSet<EventId>,
) {
    loop {
        tokio::select! {
            () = ctx.closed.cancelled() => break,
            () = stop.cancelled() => break,
            next = stream.next() => {
                let Some(event) = next else { break };
                if let Err(e) = forward_new(ctx, &event, side, seen).await {
                    tracing::warn!(channel_id = %ctx.channel_id, "Live delivery stopped: {e}");
                    break;
                }
            }
        }
    }
}

struct Poll {
    store: Arc<dyn SessionStore>,
    session_id: SessionId,
    cursor: Option<EventId>,
    interval: Duration,
}

async fn deliver_polled(
    mut poll: Poll,
    ctx: &ConnectionContext,
    stop: &CancellationToken,
    side: Side,
    seen: &mut HashSet<EventId>,
) {
    let mut ticker = tokio::time::interval(poll.interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            () = ctx.closed.cancelled() => break,
            () = stop.cancelled() => break,
            _ = ticker.tick() => {
                let pulled = match poll.store.pull_events(&poll.session_id, poll.cursor.as_deref()).await {
                    Ok(events) => events,
                    Err(e) => {
                        tracing::warn!(session_id = %poll.session_id, "Poll failed: {e}");
                        continue;
                    }
                };
                if let Some(last) = pulled.last() {
                    poll.cursor = Some(last.id.clone());
                }
                for event in &pulled {
                    if let Err(e) = forward_new(ctx, event, side, seen).await {
                        tracing::warn!(channel_id = %ctx.channel_id, "Live delivery stopped: {e}");
                        return;
                    }
                }
            }
        }
    }
}
