//! The session aggregate.
//!
//! A [`Session`] is a fold over its event log: request state, activity
//! window and sync position are all derived from events. The log is kept
//! sorted by occurrence and synchronized with an optional [`SessionStore`]
//! so several processes can serve the same session.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use rpc_session_core::{
    Catalog, ConnectionContext, EventFeed, RequestManager,
    error::{RequestError, SessionError},
    event::{DETACHED_CHANNEL, EventId, EventPayload, NewEvent, SessionEvent, Side},
    protocol::{
        Implementation, LATEST_PROTOCOL_VERSION, Message, Prompt, RequestId, Resource,
        ResourceTemplate, Tool, methods,
    },
    request::{RequestTable, SessionRequest},
    store::{EventStream, SessionId, SessionSnapshot, SessionStore},
    sync::{insert_sorted, merge_events, unsynced_events, update_activity_timestamps},
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Callbacks observing a session.
#[async_trait]
pub trait SessionHooks: Send + Sync {
    /// Called once for every event that enters the log.
    fn on_event(&self, _session_id: &str, _event: &SessionEvent) {}

    /// Approve a resource subscription. An error refuses it.
    async fn on_subscribe(&self, _session_id: &str, _uri: &str) -> Result<(), SessionError> {
        Ok(())
    }

    /// Observe a resource unsubscription. An error refuses it.
    async fn on_unsubscribe(&self, _session_id: &str, _uri: &str) -> Result<(), SessionError> {
        Ok(())
    }
}

/// Hooks that do nothing.
pub struct NoopHooks;

#[async_trait]
impl SessionHooks for NoopHooks {}

/// Fields settled by the `initialize` handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct Handshake {
    pub protocol_version: String,
    pub client_info: Implementation,
    pub client_capabilities: Value,
    pub server_info: Implementation,
    pub server_capabilities: Value,
}

struct SessionState {
    user_id: Option<String>,
    protocol_version: String,
    client_info: Option<Implementation>,
    server_info: Option<Implementation>,
    client_capabilities: Value,
    server_capabilities: Value,
    tools: Catalog<Tool>,
    prompts: Catalog<Prompt>,
    resources: Catalog<Resource>,
    resource_templates: Catalog<ResourceTemplate>,
    subscriptions: HashSet<String>,
    events: Vec<SessionEvent>,
    event_ids: HashSet<EventId>,
    requests: RequestTable,
    active: HashMap<RequestId, CancellationToken>,
    first_activity: Option<u64>,
    last_activity: Option<u64>,
    last_synced_event_id: Option<EventId>,
    // Local events not yet accepted by the store, in append order.
    unpushed: Vec<EventId>,
    channel: Option<ConnectionContext>,
    initialized: bool,
}

impl SessionState {
    fn new() -> Self {
        Self {
            user_id: None,
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            client_info: None,
            server_info: None,
            client_capabilities: Value::Null,
            server_capabilities: Value::Null,
            tools: Catalog::new(),
            prompts: Catalog::new(),
            resources: Catalog::new(),
            resource_templates: Catalog::new(),
            subscriptions: HashSet::new(),
            events: Vec::new(),
            event_ids: HashSet::new(),
            requests: RequestTable::new(),
            active: HashMap::new(),
            first_activity: None,
            last_activity: None,
            last_synced_event_id: None,
            unpushed: Vec::new(),
            channel: None,
            initialized: false,
        }
    }

    fn default_channel(&self) -> String {
        self.channel
            .as_ref()
            .map_or_else(|| DETACHED_CHANNEL.to_string(), |c| c.channel_id.clone())
    }
}

/// One logical session, shared as `Arc<Session>`.
///
/// Synchronous state lives behind a std mutex that is never held across an
/// await; sync rounds are serialized by a separate async lock.
pub struct Session {
    id: SessionId,
    side: Side,
    store: Option<Arc<dyn SessionStore>>,
    hooks: Arc<dyn SessionHooks>,
    feed: EventFeed,
    outbound: RequestManager,
    sync_lock: tokio::sync::Mutex<()>,
    closed: CancellationToken,
    state: Mutex<SessionState>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("side", &self.side)
            .field("closed", &self.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create an empty server-side session.
    #[must_use]
    pub fn new(id: impl Into<SessionId>) -> Self {
        Self {
            id: id.into(),
            side: Side::Server,
            store: None,
            hooks: Arc::new(NoopHooks),
            feed: EventFeed::new(),
            outbound: RequestManager::new(),
            sync_lock: tokio::sync::Mutex::new(()),
            closed: CancellationToken::new(),
            state: Mutex::new(SessionState::new()),
        }
    }

    /// Rebuild a session from a stored snapshot.
    ///
    /// Request state and the activity window are re-derived from the events.
    #[must_use]
    pub fn from_snapshot(snapshot: SessionSnapshot) -> Self {
        let SessionSnapshot {
            id,
            user_id,
            protocol_version,
            client_info,
            server_info,
            client_capabilities,
            server_capabilities,
            tools,
            prompts,
            resources,
            resource_templates,
            subscriptions,
            events,
        } = snapshot;

        let (events, last) = merge_events(events, Vec::new());
        let mut session = Self::new(id);
        let state = session.state_mut();
        state.user_id = user_id;
        state.protocol_version = protocol_version;
        state.client_info = client_info;
        state.server_info = server_info;
        state.client_capabilities = client_capabilities;
        state.server_capabilities = server_capabilities;
        state.tools = tools;
        state.prompts = prompts;
        state.resources = resources;
        state.resource_templates = resource_templates;
        state.subscriptions = subscriptions.into_iter().collect();
        state.requests = RequestTable::from_events(&events);
        for event in &events {
            let (first, last) =
                update_activity_timestamps(event, state.first_activity, state.last_activity);
            state.first_activity = Some(first);
            state.last_activity = Some(last);
        }
        state.event_ids = events.iter().map(|e| e.id.clone()).collect();
        state.events = events;
        state.last_synced_event_id = last;
        state.initialized = true;
        session
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn with_hooks(mut self, hooks: Arc<dyn SessionHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    #[must_use]
    pub const fn with_side(mut self, side: Side) -> Self {
        self.side = side;
        self
    }

    #[must_use]
    pub fn with_user(mut self, user_id: Option<String>) -> Self {
        self.state_mut().user_id = user_id;
        self
    }

    #[must_use]
    pub fn with_handshake(mut self, handshake: Handshake) -> Self {
        let state = self.state_mut();
        state.protocol_version = handshake.protocol_version;
        state.client_info = Some(handshake.client_info);
        state.client_capabilities = handshake.client_capabilities;
        state.server_info = Some(handshake.server_info);
        state.server_capabilities = handshake.server_capabilities;
        self
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state_mut(&mut self) -> &mut SessionState {
        self.state.get_mut().unwrap_or_else(PoisonError::into_inner)
    }

    // ---- event log ------------------------------------------------------

    /// Append an event and run a sync round.
    ///
    /// Returns `None` if an event with the same id is already in the log.
    ///
    /// # Errors
    /// Returns error if the sync round fails. The event stays in the log.
    pub async fn add_event(&self, event: NewEvent) -> Result<Option<SessionEvent>, SessionError> {
        let added = self.append(event, true);
        self.sync().await?;
        Ok(added)
    }

    /// Append an event without saving it, as when replaying stored events.
    pub fn replay_event(&self, event: NewEvent) -> Option<SessionEvent> {
        self.append(event, false)
    }

    fn append(&self, event: NewEvent, local: bool) -> Option<SessionEvent> {
        let event = {
            let mut state = self.state();
            let event = event.complete(&state.default_channel());
            if !state.event_ids.insert(event.id.clone()) {
                return None;
            }
            let (first, last) =
                update_activity_timestamps(&event, state.first_activity, state.last_activity);
            state.first_activity = Some(first);
            state.last_activity = Some(last);
            state.requests.apply(&event);
            if local {
                state.unpushed.push(event.id.clone());
            }
            insert_sorted(&mut state.events, event.clone());
            event
        };
        self.hooks.on_event(&self.id, &event);
        self.feed.push(event.clone());
        Some(event)
    }

    /// Reconcile the log with the store: pull first, then push.
    ///
    /// A round that finds nothing new on either side transfers nothing.
    ///
    /// # Errors
    /// Returns error if the store fails.
    pub async fn sync(&self) -> Result<(), SessionError> {
        let store = match &self.store {
            Some(store) if !self.is_closed() => Arc::clone(store),
            _ => {
                let mut state = self.state();
                state.last_synced_event_id = state.events.last().map(|e| e.id.clone());
                state.unpushed.clear();
                return Ok(());
            }
        };
        let _round = self.sync_lock.lock().await;

        let latest = self.state().events.last().map(|e| e.id.clone());
        let pulled = store.pull_events(&self.id, latest.as_deref()).await?;
        let pulled_ids: HashSet<EventId> = pulled.iter().map(|e| e.id.clone()).collect();
        for event in pulled {
            self.append(event.into(), false);
        }

        let outgoing: Vec<SessionEvent> = {
            let state = self.state();
            let mut seen = HashSet::new();
            let suffix = unsynced_events(&state.events, state.last_synced_event_id.as_deref());
            let mut outgoing: Vec<SessionEvent> = suffix
                .iter()
                .filter(|e| !pulled_ids.contains(&e.id) && seen.insert(e.id.clone()))
                .cloned()
                .collect();
            // Local events that sort before the sync mark are not in the suffix.
            for id in &state.unpushed {
                if !seen.contains(id) {
                    if let Some(event) = state.events.iter().find(|e| &e.id == id) {
                        seen.insert(id.clone());
                        outgoing.push(event.clone());
                    }
                }
            }
            outgoing
        };

        let accepted = if outgoing.is_empty() {
            Vec::new()
        } else {
            tracing::debug!(session_id = %self.id, count = outgoing.len(), "Pushing events");
            store.push_events(&self.id, outgoing.clone()).await?
        };

        let mut state = self.state();
        let local = std::mem::take(&mut state.events);
        let (merged, last) = merge_events(accepted, local);
        state.events = merged;
        state.last_synced_event_id = last;
        let pushed: HashSet<&EventId> = outgoing.iter().map(|e| &e.id).collect();
        state.unpushed.retain(|id| !pushed.contains(id));
        Ok(())
    }

    /// Persist the session's durable fields.
    ///
    /// # Errors
    /// Returns error if the store fails.
    pub async fn save(&self) -> Result<(), SessionError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        if self.is_closed() {
            return Ok(());
        }
        store.set(self.snapshot()).await?;
        Ok(())
    }

    /// Send a message to the client through the current channel.
    ///
    /// The message is appended to the log before it is written, so it can be
    /// replayed even when the write fails or no channel is attached.
    ///
    /// # Errors
    /// Returns the channel write error, or a sync failure.
    pub async fn reply(&self, message: Message) -> Result<(), SessionError> {
        let message = message.with_version_tag();
        let channel = self.state().channel.clone();
        let event = self.append(NewEvent::message(self.side, message.clone()), true);

        let written = match (channel, event) {
            (Some(channel), Some(event)) => channel
                .write(message, Some(event.id))
                .await
                .map_err(SessionError::from),
            _ => Ok(()),
        };
        self.sync().await?;
        written
    }

    // ---- capabilities ---------------------------------------------------

    async fn catalog_changed(&self, method: &str) -> Result<(), SessionError> {
        self.save().await?;
        self.reply(Message::notification(method, None)).await
    }

    /// Add or replace a tool by name.
    ///
    /// # Errors
    /// Returns error if saving or notifying the client fails.
    pub async fn add_tool(&self, tool: Tool) -> Result<(), SessionError> {
        self.state().tools.upsert(tool);
        self.catalog_changed(methods::NOTIFICATION_TOOLS_LIST_CHANGED)
            .await
    }

    /// Remove a tool. Returns whether it existed.
    ///
    /// # Errors
    /// Returns error if saving or notifying the client fails.
    pub async fn drop_tool(&self, name: &str) -> Result<bool, SessionError> {
        let removed = self.state().tools.remove(name);
        if removed {
            self.catalog_changed(methods::NOTIFICATION_TOOLS_LIST_CHANGED)
                .await?;
        }
        Ok(removed)
    }

    /// # Errors
    /// Returns error if saving or notifying the client fails.
    pub async fn add_prompt(&self, prompt: Prompt) -> Result<(), SessionError> {
        self.state().prompts.upsert(prompt);
        self.catalog_changed(methods::NOTIFICATION_PROMPTS_LIST_CHANGED)
            .await
    }

    /// # Errors
    /// Returns error if saving or notifying the client fails.
    pub async fn drop_prompt(&self, name: &str) -> Result<bool, SessionError> {
        let removed = self.state().prompts.remove(name);
        if removed {
            self.catalog_changed(methods::NOTIFICATION_PROMPTS_LIST_CHANGED)
                .await?;
        }
        Ok(removed)
    }

    /// # Errors
    /// Returns error if saving or notifying the client fails.
    pub async fn add_resource(&self, resource: Resource) -> Result<(), SessionError> {
        self.state().resources.upsert(resource);
        self.catalog_changed(methods::NOTIFICATION_RESOURCES_LIST_CHANGED)
            .await
    }

    /// # Errors
    /// Returns error if saving or notifying the client fails.
    pub async fn drop_resource(&self, uri: &str) -> Result<bool, SessionError> {
        let removed = self.state().resources.remove(uri);
        if removed {
            self.catalog_changed(methods::NOTIFICATION_RESOURCES_LIST_CHANGED)
                .await?;
        }
        Ok(removed)
    }

    /// Templates share the resources list-changed notification.
    ///
    /// # Errors
    /// Returns error if saving or notifying the client fails.
    pub async fn add_resource_template(&self, template: ResourceTemplate) -> Result<(), SessionError> {
        self.state().resource_templates.upsert(template);
        self.catalog_changed(methods::NOTIFICATION_RESOURCES_LIST_CHANGED)
            .await
    }

    /// # Errors
    /// Returns error if saving or notifying the client fails.
    pub async fn drop_resource_template(&self, uri_template: &str) -> Result<bool, SessionError> {
        let removed = self.state().resource_templates.remove(uri_template);
        if removed {
            self.catalog_changed(methods::NOTIFICATION_RESOURCES_LIST_CHANGED)
                .await?;
        }
        Ok(removed)
    }

    /// Subscribe to change notifications for `uri`.
    ///
    /// # Errors
    /// Returns the hook's refusal, or a store failure.
    pub async fn subscribe_resource(&self, uri: &str) -> Result<(), SessionError> {
        self.hooks.on_subscribe(&self.id, uri).await?;
        self.state().subscriptions.insert(uri.to_string());
        self.save().await
    }

    /// Returns whether a subscription existed.
    ///
    /// # Errors
    /// Returns the hook's refusal, or a store failure.
    pub async fn unsubscribe_resource(&self, uri: &str) -> Result<bool, SessionError> {
        self.hooks.on_unsubscribe(&self.id, uri).await?;
        let removed = self.state().subscriptions.remove(uri);
        if removed {
            self.save().await?;
        }
        Ok(removed)
    }

    // ---- requests -------------------------------------------------------

    /// Mark an inbound request as in flight and get its cancellation token.
    pub fn start_request(&self, id: RequestId) -> CancellationToken {
        let token = self.closed.child_token();
        self.state().active.insert(id, token.clone());
        token
    }

    /// Forget an in-flight request. Returns whether it was tracked.
    pub fn end_request(&self, id: &RequestId) -> bool {
        self.state().active.remove(id).is_some()
    }

    /// Cancel an in-flight request and record an abort event.
    ///
    /// Unknown or already finished ids are ignored and return `false`.
    ///
    /// # Errors
    /// Returns error if recording the abort fails.
    pub async fn cancel_request(
        &self,
        id: &RequestId,
        reason: Option<String>,
    ) -> Result<bool, SessionError> {
        let token = self.state().active.remove(id);
        let Some(token) = token else {
            return Ok(false);
        };
        token.cancel();
        tracing::debug!(session_id = %self.id, request_id = %id, "Request cancelled");
        self.add_event(NewEvent::new(EventPayload::Abort {
            request_id: id.clone(),
            origin: self.side.peer(),
            reason,
        }))
        .await?;
        Ok(true)
    }

    /// Send a request to the client and wait for its response.
    ///
    /// # Errors
    /// Returns the client's error, or `Hanged` if the session closes first.
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, SessionError> {
        let pending = self.outbound.register();
        let id = pending.id().clone();
        if let Err(e) = self.reply(Message::request(id.clone(), method, params)).await {
            self.outbound
                .reject(&id, RequestError::Hanged(e.to_string()));
            return Err(e);
        }
        Ok(pending.wait().await?)
    }

    /// Settle a server-originated request. Returns `false` if nothing waited.
    pub fn handle_response(&self, message: &Message) -> bool {
        self.outbound.settle(message)
    }

    // ---- channel --------------------------------------------------------

    /// Bind the reply channel and record a channel-started event.
    ///
    /// # Errors
    /// Returns error if recording the event fails.
    pub async fn attach_channel(&self, ctx: ConnectionContext) -> Result<(), SessionError> {
        let channel_id = ctx.channel_id.clone();
        self.state().channel = Some(ctx);
        self.add_event(NewEvent::new(EventPayload::ChannelStarted).with_channel(channel_id))
            .await?;
        Ok(())
    }

    /// Unbind the reply channel and record a channel-ended event.
    ///
    /// Requests still processing on that channel become hanged.
    ///
    /// # Errors
    /// Returns error if recording the event fails.
    pub async fn detach_channel(&self) -> Result<bool, SessionError> {
        let previous = self.state().channel.take();
        let Some(ctx) = previous else {
            return Ok(false);
        };
        self.add_event(NewEvent::new(EventPayload::ChannelEnded).with_channel(ctx.channel_id))
            .await?;
        Ok(true)
    }

    /// Cancel in-flight work and stop persisting.
    pub fn close(&self) {
        self.closed.cancel();
        let rejected = self.outbound.clear("session closed");
        if rejected > 0 {
            tracing::debug!(session_id = %self.id, rejected, "Rejected pending requests");
        }
        let mut state = self.state();
        state.active.clear();
        state.channel = None;
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    // ---- accessors ------------------------------------------------------

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub const fn side(&self) -> Side {
        self.side
    }

    #[must_use]
    pub fn user_id(&self) -> Option<String> {
        self.state().user_id.clone()
    }

    #[must_use]
    pub fn protocol_version(&self) -> String {
        self.state().protocol_version.clone()
    }

    #[must_use]
    pub fn client_info(&self) -> Option<Implementation> {
        self.state().client_info.clone()
    }

    #[must_use]
    pub fn server_info(&self) -> Option<Implementation> {
        self.state().server_info.clone()
    }

    #[must_use]
    pub fn client_capabilities(&self) -> Value {
        self.state().client_capabilities.clone()
    }

    #[must_use]
    pub fn tools(&self) -> Vec<Tool> {
        self.state().tools.as_slice().to_vec()
    }

    #[must_use]
    pub fn prompts(&self) -> Vec<Prompt> {
        self.state().prompts.as_slice().to_vec()
    }

    #[must_use]
    pub fn resources(&self) -> Vec<Resource> {
        self.state().resources.as_slice().to_vec()
    }

    #[must_use]
    pub fn resource_templates(&self) -> Vec<ResourceTemplate> {
        self.state().resource_templates.as_slice().to_vec()
    }

    /// Subscribed URIs, sorted.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<String> {
        let mut uris: Vec<String> = self.state().subscriptions.iter().cloned().collect();
        uris.sort();
        uris
    }

    #[must_use]
    pub fn is_subscribed(&self, uri: &str) -> bool {
        self.state().subscriptions.contains(uri)
    }

    /// The full log in occurrence order.
    #[must_use]
    pub fn events(&self) -> Vec<SessionEvent> {
        self.state().events.clone()
    }

    /// Events after `last_event_id`; all of them if the id is absent or unknown.
    #[must_use]
    pub fn events_after(&self, last_event_id: Option<&str>) -> Vec<SessionEvent> {
        unsynced_events(&self.state().events, last_event_id).to_vec()
    }

    /// Live feed of events appended to this session from now on.
    #[must_use]
    pub fn event_stream(&self) -> EventStream {
        self.feed.stream()
    }

    #[must_use]
    pub fn requests(&self) -> Vec<SessionRequest> {
        self.state().requests.iter().cloned().collect()
    }

    #[must_use]
    pub fn request(&self, origin: Side, id: &RequestId) -> Option<SessionRequest> {
        self.state().requests.get(origin, id).cloned()
    }

    #[must_use]
    pub fn is_request_active(&self, id: &RequestId) -> bool {
        self.state().active.contains_key(id)
    }

    #[must_use]
    pub fn first_activity(&self) -> Option<u64> {
        self.state().first_activity
    }

    #[must_use]
    pub fn last_activity(&self) -> Option<u64> {
        self.state().last_activity
    }

    #[must_use]
    pub fn last_synced_event_id(&self) -> Option<EventId> {
        self.state().last_synced_event_id.clone()
    }

    /// Id of the channel replies currently go to.
    #[must_use]
    pub fn channel_id(&self) -> Option<String> {
        self.state().channel.as_ref().map(|c| c.channel_id.clone())
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.state().initialized
    }

    /// Record that the client sent `notifications/initialized`.
    pub fn mark_initialized(&self) {
        self.state().initialized = true;
    }

    /// Durable fields plus the full log.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        let subscriptions = self.subscriptions();
        let state = self.state();
        SessionSnapshot {
            id: self.id.clone(),
            user_id: state.user_id.clone(),
            protocol_version: state.protocol_version.clone(),
            client_info: state.client_info.clone(),
            server_info: state.server_info.clone(),
            client_capabilities: state.client_capabilities.clone(),
            server_capabilities: state.server_capabilities.clone(),
            tools: state.tools.clone(),
            prompts: state.prompts.clone(),
            resources: state.resources.clone(),
            resource_templates: state.resource_templates.clone(),
            subscriptions,
            events: state.events.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use rpc_session_core::{
        Outbound, RequestStatus,
        store::{StoreCapabilities, StoreError},
    };
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::storage::MemoryStore;

    #[derive(Default)]
    struct CountingStore {
        inner: MemoryStore,
        pushes: AtomicUsize,
    }

    #[async_trait]
    impl SessionStore for CountingStore {
        async fn get(&self, id: Option<&str>) -> Result<Option<SessionSnapshot>, StoreError> {
            self.inner.get(id).await
        }

        async fn set(&self, snapshot: SessionSnapshot) -> Result<(), StoreError> {
            self.inner.set(snapshot).await
        }

        async fn delete(&self, id: &str) -> Result<(), StoreError> {
            self.inner.delete(id).await
        }

        async fn pull_events(
            &self,
            id: &str,
            last_event_id: Option<&str>,
        ) -> Result<Vec<SessionEvent>, StoreError> {
            self.inner.pull_events(id, last_event_id).await
        }

        async fn push_events(
            &self,
            id: &str,
            events: Vec<SessionEvent>,
        ) -> Result<Vec<SessionEvent>, StoreError> {
            self.pushes.fetch_add(1, Ordering::SeqCst);
            self.inner.push_events(id, events).await
        }

        fn capabilities(&self) -> StoreCapabilities {
            self.inner.capabilities()
        }
    }

    fn marker(id: &str, at: u64) -> NewEvent {
        NewEvent::new(EventPayload::ChannelStarted)
            .with_id(id)
            .with_occurred_at(at)
    }

    fn ids(events: &[SessionEvent]) -> Vec<String> {
        events.iter().map(|e| e.id.clone()).collect()
    }

    fn attached(session: &Session) -> (ConnectionContext, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel::<Outbound>();
        let ctx = ConnectionContext::with_channel_id("chan-1", Arc::new(tx));
        session.state().channel = Some(ctx.clone());
        (ctx, rx)
    }

    #[tokio::test]
    async fn test_log_stays_sorted() {
        let session = Session::new("s1");
        for (id, at) in [("c", 30), ("a", 10), ("b", 20)] {
            session.add_event(marker(id, at)).await.unwrap();
        }
        assert_eq!(ids(&session.events()), ["a", "b", "c"]);
        assert_eq!(session.first_activity(), Some(10));
        assert_eq!(session.last_activity(), Some(30));
    }

    #[tokio::test]
    async fn test_duplicate_event_id_is_ignored() {
        let session = Session::new("s1");
        assert!(session.add_event(marker("a", 1)).await.unwrap().is_some());
        assert!(session.add_event(marker("a", 2)).await.unwrap().is_none());
        assert_eq!(session.events().len(), 1);
        assert_eq!(session.events()[0].occurred_at, 1);
    }

    #[tokio::test]
    async fn test_sync_round_without_changes_pushes_nothing() {
        let store = Arc::new(CountingStore::default());
        let session = Session::new("s1").with_store(store.clone());
        session.save().await.unwrap();

        session.add_event(marker("a", 1)).await.unwrap();
        session.add_event(marker("b", 2)).await.unwrap();
        let pushes = store.pushes.load(Ordering::SeqCst);

        session.sync().await.unwrap();
        session.sync().await.unwrap();
        assert_eq!(store.pushes.load(Ordering::SeqCst), pushes);
        assert_eq!(session.last_synced_event_id().as_deref(), Some("b"));
        assert_eq!(store.pull_events("s1", None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_sync_pulls_events_from_other_processes() {
        let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
        let a = Session::new("s1").with_store(Arc::clone(&store));
        a.save().await.unwrap();
        let b = Session::new("s1").with_store(Arc::clone(&store));

        a.add_event(marker("from-a", 1)).await.unwrap();
        b.add_event(marker("from-b", 2)).await.unwrap();
        assert_eq!(ids(&b.events()), ["from-a", "from-b"]);

        a.sync().await.unwrap();
        assert_eq!(ids(&a.events()), ["from-a", "from-b"]);
        // Pulled copies keep the store's record time.
        assert!(b.events().iter().all(|e| e.recorded_at.is_some()));
        assert!(a.events().iter().all(|e| e.recorded_at.is_some()));
    }

    #[tokio::test]
    async fn test_activity_follows_the_log() {
        let session = Session::new("s1");
        session.add_event(marker("a", 10)).await.unwrap();
        session.subscribe_resource("file:///a").await.unwrap();
        assert!(session.unsubscribe_resource("file:///a").await.unwrap());
        assert_eq!(session.last_activity(), Some(10));

        session.add_tool(Tool::new("t", "d")).await.unwrap();
        assert_eq!(
            session.last_activity(),
            session.events().last().map(|e| e.occurred_at)
        );
    }

    #[tokio::test]
    async fn test_local_event_before_sync_mark_is_pushed() {
        let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
        let session = Session::new("s1").with_store(Arc::clone(&store));
        session.save().await.unwrap();

        session.add_event(marker("late", 50)).await.unwrap();
        session.add_event(marker("early", 5)).await.unwrap();

        let stored = ids(&store.pull_events("s1", None).await.unwrap());
        assert!(stored.contains(&"early".to_string()));
        assert!(stored.contains(&"late".to_string()));
    }

    #[tokio::test]
    async fn test_add_tool_upserts_and_notifies() {
        let session = Session::new("s1");
        session.add_tool(Tool::new("a", "v1")).await.unwrap();
        session.add_tool(Tool::new("b", "v1")).await.unwrap();
        session.add_tool(Tool::new("a", "v2")).await.unwrap();

        let tools = session.tools();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, "a");
        assert_eq!(tools[0].description.as_deref(), Some("v2"));

        let notified = session
            .events()
            .iter()
            .filter(|e| {
                e.message().and_then(Message::method)
                    == Some(methods::NOTIFICATION_TOOLS_LIST_CHANGED)
            })
            .count();
        assert_eq!(notified, 3);
    }

    #[tokio::test]
    async fn test_removing_unknown_entries_is_silent() {
        let session = Session::new("s1");
        assert!(!session.drop_tool("ghost").await.unwrap());
        assert!(!session.drop_resource_template("x://{id}").await.unwrap());
        assert!(session.events().is_empty());
    }

    #[tokio::test]
    async fn test_resource_template_uses_resources_notification() {
        let session = Session::new("s1");
        session
            .add_resource_template(ResourceTemplate::new("file:///{path}", "files"))
            .await
            .unwrap();
        let last = session.events().pop().unwrap();
        assert_eq!(
            last.message().and_then(Message::method),
            Some(methods::NOTIFICATION_RESOURCES_LIST_CHANGED)
        );
    }

    #[tokio::test]
    async fn test_cancel_request_records_abort() {
        let session = Session::new("s1");
        let id = RequestId::from(7);
        session
            .add_event(NewEvent::message(
                Side::Client,
                Message::request(7, methods::TOOLS_CALL, None),
            ))
            .await
            .unwrap();
        let token = session.start_request(id.clone());

        assert!(session.cancel_request(&id, Some("user".into())).await.unwrap());
        assert!(token.is_cancelled());
        assert!(!session.is_request_active(&id));
        assert_eq!(
            session.request(Side::Client, &id).unwrap().status,
            RequestStatus::Cancelled
        );
        assert!(matches!(
            session.events().last().unwrap().payload,
            EventPayload::Abort { .. }
        ));

        let before = session.events().len();
        assert!(!session.cancel_request(&id, None).await.unwrap());
        assert_eq!(session.events().len(), before);
    }

    #[tokio::test]
    async fn test_reply_without_channel_is_kept_for_replay() {
        let session = Session::new("s1");
        session
            .reply(Message::notification("notifications/message", None))
            .await
            .unwrap();
        let events = session.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].channel_id, DETACHED_CHANNEL);
        assert!(events[0].is_message_from(Side::Server));
    }

    #[tokio::test]
    async fn test_reply_writes_with_event_id() {
        let session = Session::new("s1");
        let (_ctx, mut rx) = attached(&session);

        session
            .reply(Message::response(RequestId::from(1), json!({})))
            .await
            .unwrap();
        let out = rx.recv().await.unwrap();
        let last = session.events().pop().unwrap();
        assert_eq!(out.event_id.as_deref(), Some(last.id.as_str()));
        assert_eq!(out.message.jsonrpc, "2.0");
        assert_eq!(last.channel_id, "chan-1");
    }

    #[tokio::test]
    async fn test_failed_write_still_logs_reply() {
        let session = Session::new("s1");
        let (ctx, _rx) = attached(&session);
        ctx.close();

        let result = session
            .reply(Message::notification("notifications/message", None))
            .await;
        assert!(matches!(result, Err(SessionError::Channel(_))));
        assert_eq!(session.events().len(), 1);
    }

    #[tokio::test]
    async fn test_send_request_settles_on_response() {
        let session = Arc::new(Session::new("s1"));
        let (_ctx, mut rx) = attached(&session);

        let caller = Arc::clone(&session);
        let handle = tokio::spawn(async move {
            caller
                .send_request("sampling/createMessage", Some(json!({ "q": 1 })))
                .await
        });

        let out = rx.recv().await.unwrap();
        let id = out.message.id.clone().unwrap();
        assert!(session.handle_response(&Message::response(id, json!({ "a": 2 }))));
        assert_eq!(handle.await.unwrap().unwrap(), json!({ "a": 2 }));
    }

    #[tokio::test]
    async fn test_close_rejects_outbound_and_cancels_work() {
        let session = Arc::new(Session::new("s1"));
        let token = session.start_request(RequestId::from(1));

        let caller = Arc::clone(&session);
        let handle = tokio::spawn(async move { caller.send_request("roots/list", None).await });
        tokio::task::yield_now().await;
        while session.events().is_empty() {
            tokio::task::yield_now().await;
        }

        session.close();
        assert!(token.is_cancelled());
        assert!(matches!(handle.await.unwrap(), Err(SessionError::Hanged(_))));
    }

    #[tokio::test]
    async fn test_detach_hangs_processing_requests() {
        let session = Session::new("s1");
        let (tx, _rx) = mpsc::unbounded_channel::<Outbound>();
        session
            .attach_channel(ConnectionContext::with_channel_id("chan-9", Arc::new(tx)))
            .await
            .unwrap();
        session
            .add_event(NewEvent::message(
                Side::Client,
                Message::request(3, methods::TOOLS_CALL, None),
            ))
            .await
            .unwrap();

        assert!(session.detach_channel().await.unwrap());
        assert!(!session.detach_channel().await.unwrap());
        assert_eq!(
            session.request(Side::Client, &RequestId::from(3)).unwrap().status,
            RequestStatus::Hanged
        );
        assert!(session.channel_id().is_none());
    }

    #[tokio::test]
    async fn test_snapshot_round_trip_rebuilds_requests() {
        let session = Session::new("s1").with_user(Some("alice".into()));
        session.add_tool(Tool::new("echo", "")).await.unwrap();
        session.subscribe_resource("file:///a").await.unwrap();
        session
            .add_event(NewEvent::message(
                Side::Client,
                Message::request(5, methods::TOOLS_CALL, None),
            ))
            .await
            .unwrap();

        let restored = Session::from_snapshot(session.snapshot());
        assert_eq!(restored.user_id().as_deref(), Some("alice"));
        assert_eq!(restored.tools().len(), 1);
        assert!(restored.is_subscribed("file:///a"));
        assert_eq!(
            restored.request(Side::Client, &RequestId::from(5)).unwrap().status,
            RequestStatus::Processing
        );
        assert_eq!(restored.events(), session.events());
        assert_eq!(restored.last_activity(), session.events().last().map(|e| e.occurred_at));
    }
}
