//! Durable session storage contract.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{
    catalog::Catalog,
    event::SessionEvent,
    protocol::{Implementation, Prompt, Resource, ResourceTemplate, Tool},
};

/// Session identifier.
pub type SessionId = String;

/// Durable fields of a session plus its event list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub protocol_version: String,
    #[serde(default)]
    pub client_info: Option<Implementation>,
    #[serde(default)]
    pub server_info: Option<Implementation>,
    #[serde(default)]
    pub client_capabilities: Value,
    #[serde(default)]
    pub server_capabilities: Value,
    #[serde(default)]
    pub tools: Catalog<Tool>,
    #[serde(default)]
    pub prompts: Catalog<Prompt>,
    #[serde(default)]
    pub resources: Catalog<Resource>,
    #[serde(default)]
    pub resource_templates: Catalog<ResourceTemplate>,
    #[serde(default)]
    pub subscriptions: Vec<String>,
    #[serde(default)]
    pub events: Vec<SessionEvent>,
}

/// What a store can do beyond the required operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCapabilities {
    /// `subscribe` delivers pushed events without polling.
    pub push: bool,
}

/// Live feed of events pushed to a session. Dropping it unsubscribes.
pub type EventStream = BoxStream<'static, SessionEvent>;

/// Storage error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Session not found: {0}")]
    NotFound(SessionId),
    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Storage error: {0}")]
    Internal(String),
}

/// Trait for session storage backends.
///
/// Several processes may read and write the same session concurrently; the
/// only coordination is event-id de-duplication in `push_events`.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load a snapshot. `None` id always yields `None`.
    async fn get(&self, id: Option<&str>) -> Result<Option<SessionSnapshot>, StoreError>;

    /// Upsert a full snapshot, stamping undated events with a record time.
    async fn set(&self, snapshot: SessionSnapshot) -> Result<(), StoreError>;

    /// Delete a snapshot. Deleting an unknown session succeeds.
    async fn delete(&self, id: &str) -> Result<(), StoreError>;

    /// Durable events strictly after `last_event_id`, sorted by occurrence.
    ///
    /// Returns every event when `last_event_id` is absent or unknown.
    async fn pull_events(
        &self,
        id: &str,
        last_event_id: Option<&str>,
    ) -> Result<Vec<SessionEvent>, StoreError>;

    /// Merge events, skipping ids already stored.
    ///
    /// Returns only the newly accepted events, sorted, and fans them out to
    /// live subscribers.
    async fn push_events(
        &self,
        id: &str,
        events: Vec<SessionEvent>,
    ) -> Result<Vec<SessionEvent>, StoreError>;

    /// Subscribe to events pushed for `id`.
    ///
    /// # Errors
    /// Returns `Unsupported` for pull-only stores.
    fn subscribe(&self, _id: &str) -> Result<EventStream, StoreError> {
        Err(StoreError::Unsupported("subscribe"))
    }

    /// Advertised capabilities.
    fn capabilities(&self) -> StoreCapabilities;
}
