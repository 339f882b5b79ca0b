//! Connector lifecycle: handshake, correlation and inbound dispatch.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rpc_session_core::{
    HANDSHAKE_REQUEST_ID, PendingRequest, RequestManager, Transport,
    error::{RequestError, TransportError},
    protocol::{
        CancelledParams, Implementation, InitializeParams, InitializeResult, Message, MessageKind,
        Prompt, RequestId, Resource, ResourceTemplate, SUPPORTED_PROTOCOL_VERSIONS, Tool, methods,
    },
};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::ConnectorConfig,
    handler::{DefaultHandler, MessageHandler},
};

/// Connector error.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("Not connected")]
    NotConnected,
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// What the server told us during the handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerPeer {
    pub server_info: Implementation,
    pub capabilities: Value,
    pub protocol_version: String,
    pub instructions: Option<String>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Client end of a session.
///
/// Drives a [`Transport`] through `disconnected → connecting → connected`,
/// correlates requests with responses and routes server-initiated traffic
/// to a [`MessageHandler`].
pub struct Connector {
    config: ConnectorConfig,
    transport: Arc<dyn Transport>,
    handler: Arc<dyn MessageHandler>,
    requests: Arc<RequestManager>,
    state: watch::Sender<ConnectionState>,
    peer: Mutex<Option<ServerPeer>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Connector {
    /// Create a disconnected connector.
    #[must_use]
    pub fn new(config: ConnectorConfig, transport: Arc<dyn Transport>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            transport,
            handler: Arc::new(DefaultHandler),
            requests: Arc::new(RequestManager::new()),
            state,
            peer: Mutex::new(None),
            pump: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handler = handler;
        self
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Server details from the last successful handshake.
    #[must_use]
    pub fn server(&self) -> Option<ServerPeer> {
        lock(&self.peer).clone()
    }

    /// Requests awaiting a response, the handshake included.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.requests.pending_count()
    }

    /// Connect and run the `initialize` handshake.
    ///
    /// Calling this while a connection exists or is being set up waits for
    /// that one instead.
    ///
    /// # Errors
    /// Returns error if the transport fails, the server rejects the
    /// handshake, or it answers with an unsupported protocol version.
    pub async fn connect(&self) -> Result<ServerPeer, ConnectorError> {
        let claimed = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });
        if !claimed {
            tracing::warn!(state = ?self.state(), "Connect called while not disconnected");
            return self.wait_connected().await;
        }

        let handshake_id = RequestId::Number(HANDSHAKE_REQUEST_ID);
        let Some(pending) = self.requests.register_with_id(handshake_id) else {
            self.state.send_replace(ConnectionState::Disconnected);
            return Err(ConnectorError::Protocol("handshake already pending".into()));
        };

        match self.handshake(pending).await {
            Ok(peer) => {
                *lock(&self.peer) = Some(peer.clone());
                self.state.send_replace(ConnectionState::Connected);
                tracing::info!(
                    server = %peer.server_info.name,
                    protocol_version = %peer.protocol_version,
                    "Connected"
                );
                self.handler.on_connect(&peer).await;
                let initialized = Message::notification(methods::NOTIFICATION_INITIALIZED, None);
                if let Err(e) = self.transport.send(initialized).await {
                    tracing::warn!("Failed to send initialized notification: {e}");
                }
                Ok(peer)
            }
            Err(e) => {
                tracing::error!("Handshake failed: {e}");
                if let Err(e) = self.teardown().await {
                    tracing::warn!("Failed to close transport: {e}");
                }
                Err(e)
            }
        }
    }

    async fn handshake(&self, pending: PendingRequest) -> Result<ServerPeer, ConnectorError> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        self.transport.connect(inbound_tx).await?;
        let pump = tokio::spawn(pump(
            inbound_rx,
            Arc::clone(&self.requests),
            Arc::clone(&self.handler),
            Arc::clone(&self.transport),
        ));
        if let Some(previous) = lock(&self.pump).replace(pump) {
            previous.abort();
        }

        let params = InitializeParams {
            protocol_version: self.config.protocol_version.clone(),
            capabilities: self.config.capabilities.clone(),
            client_info: self.config.client_info.clone(),
        };
        let params = serde_json::to_value(params).map_err(|e| ConnectorError::Protocol(e.to_string()))?;
        let id = pending.id().clone();
        let request = Message::request(id.clone(), methods::INITIALIZE, Some(params));
        if let Err(e) = self.transport.send(request).await {
            self.requests.reject(&id, RequestError::Hanged(e.to_string()));
            return Err(e.into());
        }

        let result: InitializeResult = serde_json::from_value(pending.wait().await?)
            .map_err(|e| ConnectorError::Protocol(format!("invalid initialize result: {e}")))?;
        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&result.protocol_version.as_str()) {
            return Err(ConnectorError::Protocol(format!(
                "unsupported protocol version: {}",
                result.protocol_version
            )));
        }
        Ok(ServerPeer {
            server_info: result.server_info,
            capabilities: result.capabilities,
            protocol_version: result.protocol_version,
            instructions: result.instructions,
        })
    }

    async fn wait_connected(&self) -> Result<ServerPeer, ConnectorError> {
        let mut rx = self.state.subscribe();
        let state = *rx
            .wait_for(|state| *state != ConnectionState::Connecting)
            .await
            .map_err(|_| ConnectorError::NotConnected)?;
        match state {
            ConnectionState::Connected => self.server().ok_or(ConnectorError::NotConnected),
            _ => Err(ConnectorError::NotConnected),
        }
    }

    /// Stop the pump, close the transport and reject everything pending.
    async fn teardown(&self) -> Result<(), TransportError> {
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
        let result = self.transport.disconnect().await;
        let rejected = self.requests.clear("connector disconnected");
        if rejected > 0 {
            tracing::debug!(rejected, "Rejected pending requests");
        }
        self.requests.reset_id_counter();
        *lock(&self.peer) = None;
        self.state.send_replace(ConnectionState::Disconnected);
        result
    }

    /// Close the connection.
    ///
    /// Pending requests, including an in-flight handshake, are rejected.
    ///
    /// # Errors
    /// Returns error if the transport fails to disconnect.
    pub async fn disconnect(&self) -> Result<(), ConnectorError> {
        match self.state() {
            ConnectionState::Disconnected => {
                tracing::warn!("Disconnect called while already disconnected");
                return Ok(());
            }
            ConnectionState::Connecting => {
                self.requests.reject(
                    &RequestId::Number(HANDSHAKE_REQUEST_ID),
                    RequestError::Cancelled("disconnected during handshake".into()),
                );
            }
            ConnectionState::Connected => {}
        }
        self.teardown().await?;
        tracing::info!("Disconnected");
        Ok(())
    }

    fn ensure_connected(&self) -> Result<(), ConnectorError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ConnectorError::NotConnected)
        }
    }

    /// Register and write a request. A failed write drops the registration.
    async fn start_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<PendingRequest, ConnectorError> {
        self.ensure_connected()?;
        let pending = self.requests.register();
        let id = pending.id().clone();
        if let Err(e) = self
            .transport
            .send(Message::request(id.clone(), method, params))
            .await
        {
            self.requests.reject(&id, RequestError::Hanged(e.to_string()));
            return Err(e.into());
        }
        Ok(pending)
    }

    /// Send a request and wait for its result.
    ///
    /// # Errors
    /// Returns error if not connected, the write fails, or the server answers
    /// with an error.
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, ConnectorError> {
        let pending = self.start_request(method, params).await?;
        Ok(pending.wait().await?)
    }

    /// Like [`send_request`](Self::send_request), but gives up when `cancel`
    /// fires and tells the server with `notifications/cancelled`.
    ///
    /// # Errors
    /// Returns `Cancelled` if `cancel` fired first.
    pub async fn send_request_with_cancel(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: CancellationToken,
    ) -> Result<Value, ConnectorError> {
        let pending = self.start_request(method, params).await?;
        let id = pending.id().clone();
        tokio::select! {
            result = pending.wait() => Ok(result?),
            () = cancel.cancelled() => {
                let reason = "cancelled by caller".to_string();
                self.requests.reject(&id, RequestError::Cancelled(reason.clone()));
                let params = CancelledParams { request_id: id, reason: Some(reason.clone()) };
                if let Err(e) = self
                    .send_notification(methods::NOTIFICATION_CANCELLED, serde_json::to_value(params).ok())
                    .await
                {
                    tracing::warn!("Failed to send cancellation: {e}");
                }
                Err(RequestError::Cancelled(reason).into())
            }
        }
    }

    /// Send a notification.
    ///
    /// # Errors
    /// Returns error if not connected or the write fails.
    pub async fn send_notification(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), ConnectorError> {
        self.ensure_connected()?;
        self.transport
            .send(Message::notification(method, params))
            .await?;
        Ok(())
    }

    /// Collect every page of a cursor-paginated list method.
    ///
    /// # Errors
    /// Returns the first failing page's error.
    pub async fn paginate<T: DeserializeOwned>(
        &self,
        method: &str,
        key: &str,
    ) -> Result<Vec<T>, ConnectorError> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.take().map(|c| json!({ "cursor": c }));
            let mut page = self.send_request(method, params).await?;
            if let Some(list) = page.get_mut(key).map(Value::take) {
                let batch: Vec<T> = serde_json::from_value(list)
                    .map_err(|e| ConnectorError::Protocol(format!("invalid {method} page: {e}")))?;
                items.extend(batch);
            }
            match page.get("nextCursor").and_then(Value::as_str) {
                Some(next) => cursor = Some(next.to_string()),
                None => break,
            }
        }
        Ok(items)
    }

    /// # Errors
    /// Returns error if the request fails.
    pub async fn ping(&self) -> Result<(), ConnectorError> {
        self.send_request(methods::PING, None).await.map(|_| ())
    }

    /// # Errors
    /// Returns error if any page fails.
    pub async fn list_tools(&self) -> Result<Vec<Tool>, ConnectorError> {
        self.paginate(methods::TOOLS_LIST, "tools").await
    }

    /// # Errors
    /// Returns error if any page fails.
    pub async fn list_prompts(&self) -> Result<Vec<Prompt>, ConnectorError> {
        self.paginate(methods::PROMPTS_LIST, "prompts").await
    }

    /// # Errors
    /// Returns error if any page fails.
    pub async fn list_resources(&self) -> Result<Vec<Resource>, ConnectorError> {
        self.paginate(methods::RESOURCES_LIST, "resources").await
    }

    /// # Errors
    /// Returns error if any page fails.
    pub async fn list_resource_templates(&self) -> Result<Vec<ResourceTemplate>, ConnectorError> {
        self.paginate(methods::RESOURCES_TEMPLATES_LIST, "resourceTemplates")
            .await
    }

    /// # Errors
    /// Returns error if the request fails.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, ConnectorError> {
        self.send_request(
            methods::TOOLS_CALL,
            Some(json!({ "name": name, "arguments": arguments })),
        )
        .await
    }

    /// # Errors
    /// Returns error if the request fails.
    pub async fn get_prompt(&self, name: &str, arguments: Value) -> Result<Value, ConnectorError> {
        self.send_request(
            methods::PROMPTS_GET,
            Some(json!({ "name": name, "arguments": arguments })),
        )
        .await
    }

    /// # Errors
    /// Returns error if the request fails.
    pub async fn read_resource(&self, uri: &str) -> Result<Value, ConnectorError> {
        self.send_request(methods::RESOURCES_READ, Some(json!({ "uri": uri })))
            .await
    }

    /// # Errors
    /// Returns error if the request fails.
    pub async fn subscribe_resource(&self, uri: &str) -> Result<(), ConnectorError> {
        self.send_request(methods::RESOURCES_SUBSCRIBE, Some(json!({ "uri": uri })))
            .await
            .map(|_| ())
    }

    /// # Errors
    /// Returns error if the request fails.
    pub async fn unsubscribe_resource(&self, uri: &str) -> Result<(), ConnectorError> {
        self.send_request(methods::RESOURCES_UNSUBSCRIBE, Some(json!({ "uri": uri })))
            .await
            .map(|_| ())
    }

    /// # Errors
    /// Returns error if the request fails.
    pub async fn complete(&self, params: Value) -> Result<Value, ConnectorError> {
        self.send_request(methods::COMPLETION_COMPLETE, Some(params))
            .await
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
        self.requests.clear("connector dropped");
    }
}

/// Route inbound messages until the transport goes away.
async fn pump(
    mut inbound: mpsc::UnboundedReceiver<Message>,
    requests: Arc<RequestManager>,
    handler: Arc<dyn MessageHandler>,
    transport: Arc<dyn Transport>,
) {
    while let Some(message) = inbound.recv().await {
        match message.kind() {
            MessageKind::Response | MessageKind::Error => {
                if !requests.settle(&message) {
                    tracing::debug!(id = ?message.id, "Response to unknown request");
                }
            }
            MessageKind::Request => {
                let handler = Arc::clone(&handler);
                let transport = Arc::clone(&transport);
                tokio::spawn(async move {
                    let Some(id) = message.id.clone() else {
                        return;
                    };
                    let reply = match handler.on_request(message).await {
                        Ok(result) => Message::response(id, result),
                        Err(error) => Message::error_response(Some(id), error),
                    };
                    if let Err(e) = transport.send(reply).await {
                        tracing::error!("Failed to answer server request: {e}");
                    }
                });
            }
            MessageKind::Notification => handler.on_notification(message).await,
            MessageKind::Invalid => {
                tracing::warn!(id = ?message.id, "Dropping malformed message");
            }
        }
    }
    tracing::debug!("Inbound stream ended");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use rpc_session_core::{
        protocol::{ErrorObject, LATEST_PROTOCOL_VERSION},
        transport::InboundSender,
    };

    use super::*;

    /// Answers a fixed script of methods and records everything sent.
    struct ScriptedTransport {
        version: String,
        inbound: Mutex<Option<InboundSender>>,
        sent: Mutex<Vec<Message>>,
    }

    impl ScriptedTransport {
        fn new() -> Arc<Self> {
            Self::with_version(LATEST_PROTOCOL_VERSION)
        }

        fn with_version(version: &str) -> Arc<Self> {
            Arc::new(Self {
                version: version.to_string(),
                inbound: Mutex::new(None),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<Message> {
            lock(&self.sent).clone()
        }

        fn sent_methods(&self) -> Vec<String> {
            self.sent()
                .iter()
                .filter_map(|m| m.method().map(str::to_string))
                .collect()
        }

        fn inject(&self, message: Message) {
            let inbound = lock(&self.inbound).clone().unwrap();
            inbound.send(message).unwrap();
        }

        fn answer(&self, request: &Message) -> Option<Message> {
            let id = request.id.clone()?;
            let result = match request.method()? {
                methods::INITIALIZE => json!({
                    "protocolVersion": self.version,
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": "scripted", "version": "1" },
                }),
                methods::PING => json!({}),
                methods::TOOLS_LIST => {
                    let cursor = request
                        .params
                        .as_ref()
                        .and_then(|p| p.get("cursor"))
                        .and_then(Value::as_str);
                    match cursor {
                        None => json!({ "tools": [{ "name": "a", "inputSchema": {} }], "nextCursor": "p2" }),
                        Some("p2") => json!({ "tools": [{ "name": "b", "inputSchema": {} }], "nextCursor": "p3" }),
                        _ => json!({ "tools": [{ "name": "c", "inputSchema": {} }] }),
                    }
                }
                "fail" => {
                    return Some(Message::error_response(
                        Some(id),
                        ErrorObject::new(ErrorObject::INTERNAL_ERROR, "nope"),
                    ));
                }
                _ => return None,
            };
            Some(Message::response(id, result))
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn connect(&self, inbound: InboundSender) -> Result<(), TransportError> {
            *lock(&self.inbound) = Some(inbound);
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), TransportError> {
            *lock(&self.inbound) = None;
            Ok(())
        }

        async fn send(&self, message: Message) -> Result<(), TransportError> {
            if message.method() == Some("boom") {
                return Err(TransportError::Send("boom".into()));
            }
            let inbound = lock(&self.inbound)
                .clone()
                .ok_or(TransportError::NotConnected)?;
            lock(&self.sent).push(message.clone());
            if let Some(reply) = self.answer(&message) {
                let _ = inbound.send(reply);
            }
            Ok(())
        }
    }

    fn connector(transport: &Arc<ScriptedTransport>) -> Connector {
        Connector::new(ConnectorConfig::default(), Arc::clone(transport) as Arc<dyn Transport>)
    }

    #[tokio::test]
    async fn test_connect_runs_handshake() {
        let transport = ScriptedTransport::new();
        let connector = connector(&transport);
        assert_eq!(connector.state(), ConnectionState::Disconnected);

        let peer = connector.connect().await.unwrap();
        assert_eq!(peer.server_info.name, "scripted");
        assert_eq!(peer.protocol_version, LATEST_PROTOCOL_VERSION);
        assert!(connector.is_connected());
        assert_eq!(connector.server(), Some(peer));

        let sent = transport.sent();
        assert_eq!(sent[0].id, Some(RequestId::Number(HANDSHAKE_REQUEST_ID)));
        assert_eq!(
            transport.sent_methods(),
            vec![methods::INITIALIZE, methods::NOTIFICATION_INITIALIZED]
        );
    }

    #[tokio::test]
    async fn test_connect_twice_reuses_connection() {
        let transport = ScriptedTransport::new();
        let connector = connector(&transport);
        connector.connect().await.unwrap();
        let peer = connector.connect().await.unwrap();
        assert_eq!(peer.server_info.name, "scripted");
        assert_eq!(
            transport
                .sent_methods()
                .iter()
                .filter(|m| *m == methods::INITIALIZE)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_requests_need_connection() {
        let transport = ScriptedTransport::new();
        let connector = connector(&transport);
        let err = tokio_test::assert_err!(connector.ping().await);
        assert!(matches!(err, ConnectorError::NotConnected));
        assert!(matches!(
            connector.send_notification("x", None).await,
            Err(ConnectorError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_paginate_follows_cursors() {
        let transport = ScriptedTransport::new();
        let connector = connector(&transport);
        connector.connect().await.unwrap();

        let tools = connector.list_tools().await.unwrap();
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        let calls = transport
            .sent_methods()
            .iter()
            .filter(|m| *m == methods::TOOLS_LIST)
            .count();
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_remote_error_is_returned() {
        let transport = ScriptedTransport::new();
        let connector = connector(&transport);
        connector.connect().await.unwrap();

        let err = connector.send_request("fail", None).await.unwrap_err();
        assert!(matches!(
            err,
            ConnectorError::Request(RequestError::Rpc(ref e)) if e.message == "nope"
        ));
        assert_eq!(connector.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_failed_write_drops_pending() {
        let transport = ScriptedTransport::new();
        let connector = connector(&transport);
        connector.connect().await.unwrap();

        assert!(matches!(
            connector.send_request("boom", None).await,
            Err(ConnectorError::Transport(_))
        ));
        assert_eq!(connector.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_cancel_notifies_server() {
        let transport = ScriptedTransport::new();
        let connector = connector(&transport);
        connector.connect().await.unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = connector
            .send_request_with_cancel("slow", None, cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::Request(RequestError::Cancelled(_))));
        assert_eq!(connector.pending_requests(), 0);

        let sent = transport.sent();
        let slow_id = sent
            .iter()
            .find(|m| m.method() == Some("slow"))
            .and_then(|m| m.id.clone())
            .unwrap();
        let notice = sent.last().unwrap();
        assert_eq!(notice.method(), Some(methods::NOTIFICATION_CANCELLED));
        let params: CancelledParams = notice.params_as().unwrap();
        assert_eq!(params.request_id, slow_id);
    }

    #[tokio::test]
    async fn test_disconnect_rejects_pending_and_resets_ids() {
        let transport = ScriptedTransport::new();
        let connector = Arc::new(connector(&transport));
        connector.connect().await.unwrap();

        let waiting = {
            let connector = Arc::clone(&connector);
            tokio::spawn(async move { connector.send_request("slow", None).await })
        };
        while connector.pending_requests() == 0 {
            tokio::task::yield_now().await;
        }
        connector.disconnect().await.unwrap();
        assert_eq!(connector.state(), ConnectionState::Disconnected);
        assert!(connector.server().is_none());
        assert!(matches!(
            waiting.await.unwrap(),
            Err(ConnectorError::Request(RequestError::Hanged(_)))
        ));

        connector.connect().await.unwrap();
        tokio_test::assert_ok!(connector.ping().await);
        let ping = transport
            .sent()
            .into_iter()
            .rev()
            .find(|m| m.method() == Some(methods::PING))
            .unwrap();
        assert_eq!(ping.id, Some(RequestId::Number(1)));
    }

    #[tokio::test]
    async fn test_disconnect_when_disconnected_is_noop() {
        let transport = ScriptedTransport::new();
        let connector = connector(&transport);
        connector.disconnect().await.unwrap();
        assert_eq!(connector.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_unsupported_version_fails_handshake() {
        let transport = ScriptedTransport::with_version("1999-01-01");
        let connector = connector(&transport);
        assert!(matches!(
            connector.connect().await,
            Err(ConnectorError::Protocol(_))
        ));
        assert_eq!(connector.state(), ConnectionState::Disconnected);
        assert_eq!(connector.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_server_request_refused_by_default() {
        let transport = ScriptedTransport::new();
        let connector = connector(&transport);
        connector.connect().await.unwrap();

        transport.inject(Message::request("srv-1", "sampling/createMessage", None));
        let reply = loop {
            let found = transport
                .sent()
                .into_iter()
                .find(|m| m.id == Some(RequestId::from("srv-1")));
            if let Some(reply) = found {
                break reply;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert_eq!(reply.error.unwrap().code, ErrorObject::METHOD_NOT_FOUND);
    }

    struct Recorder(mpsc::UnboundedSender<Message>);

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn on_notification(&self, notification: Message) {
            let _ = self.0.send(notification);
        }
    }

    #[tokio::test]
    async fn test_notifications_reach_handler() {
        let transport = ScriptedTransport::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let connector = connector(&transport).with_handler(Arc::new(Recorder(tx)));
        connector.connect().await.unwrap();

        transport.inject(Message::notification(
            methods::NOTIFICATION_TOOLS_LIST_CHANGED,
            None,
        ));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.method(), Some(methods::NOTIFICATION_TOOLS_LIST_CHANGED));
    }
}
