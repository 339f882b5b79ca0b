//! Loopback session demo.
//!
//! Run with: cargo run -p loopback-demo
//!
//! Starts a session manager with an echo tool, connects to it in-process,
//! drops the connection and resumes the session.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use rpc_session_client::{Connector, ConnectorConfig};
use rpc_session_core::{
    SessionError, Transport,
    protocol::{Implementation, Message, Tool},
};
use rpc_session_server::{
    LoopbackTransport, ManagerConfig, ServerHandler, Session, SessionManager, storage::MemoryStore,
};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

struct EchoServer;

#[async_trait]
impl ServerHandler for EchoServer {
    async fn on_session_initialized(&self, session: Arc<Session>) -> Result<(), SessionError> {
        session.add_tool(Tool::new("echo", "Echo the text back")).await
    }

    async fn handle_request(
        &self,
        session: Arc<Session>,
        request: Message,
        _cancel: CancellationToken,
    ) -> Result<Value, SessionError> {
        let params = request.params.unwrap_or_default();
        let text = params["arguments"]["text"].as_str().unwrap_or_default();
        tracing::info!(session_id = %session.id(), text, "Echo called");
        Ok(json!({ "content": [{ "type": "text", "text": text }] }))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_env("RPC_SESSION_LOG")
                .or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = ManagerConfig::default()
        .with_server_info(Implementation::new("loopback-demo", env!("CARGO_PKG_VERSION")))
        .with_instructions("Call the echo tool.");
    let cleanup_interval = config.cleanup_interval;
    let inactivity_timeout = config.inactivity_timeout;
    let manager = Arc::new(
        SessionManager::new(config)
            .with_store(Arc::new(MemoryStore::new()))
            .with_handler(Arc::new(EchoServer)),
    );
    let cleanup = manager.spawn_cleanup_task(cleanup_interval, inactivity_timeout);

    let transport = Arc::new(LoopbackTransport::new(Arc::clone(&manager)).with_user("demo"));
    let connector = Connector::new(
        ConnectorConfig::default(),
        Arc::clone(&transport) as Arc<dyn Transport>,
    );

    let server = connector.connect().await?;
    tracing::info!(server = %server.server_info.name, version = %server.server_info.version, "Connected");

    // The tool is registered right after the handshake.
    tokio::time::sleep(Duration::from_millis(50)).await;
    for tool in connector.list_tools().await? {
        tracing::info!(name = %tool.name, description = ?tool.description, "Tool available");
    }
    let result = connector.call_tool("echo", json!({ "text": "hello" })).await?;
    tracing::info!(reply = %result["content"][0]["text"], "Echo answered");

    connector.disconnect().await?;
    tracing::info!("Disconnected, session paused");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = transport.resume(tx).await?;
    handle
        .session()
        .add_tool(Tool::new("reverse", "Reverse the text"))
        .await?;
    if let Ok(Some(message)) = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
        tracing::info!(method = ?message.method(), "Received after resume");
    }
    handle.stop();
    handle.join().await;

    cleanup.abort();
    Ok(())
}
