//! In-memory session storage.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use rpc_session_core::{
    EventFeed,
    event::{SessionEvent, now_ms},
    store::{EventStream, SessionSnapshot, SessionStore, StoreCapabilities, StoreError},
    sync::{merge_events, unsynced_events},
};

/// In-memory storage implementation.
///
/// Useful for development and single-process deployments.
/// Data is lost on restart.
pub struct MemoryStore {
    sessions: RwLock<HashMap<String, SessionSnapshot>>,
    feeds: RwLock<HashMap<String, Arc<EventFeed>>>,
    push: bool,
}

impl MemoryStore {
    /// Create a store that pushes new events to subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            feeds: RwLock::new(HashMap::new()),
            push: true,
        }
    }

    /// Create a pull-only store. Resumed channels have to poll it.
    #[must_use]
    pub fn polling() -> Self {
        Self {
            push: false,
            ..Self::new()
        }
    }

    /// Number of stored sessions.
    ///
    /// # Errors
    /// Returns error if the lock is poisoned.
    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self
            .sessions
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?
            .len())
    }

    /// # Errors
    /// Returns error if the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool, StoreError> {
        self.len().map(|n| n == 0)
    }

    fn feed(&self, id: &str) -> Result<Arc<EventFeed>, StoreError> {
        let mut feeds = self
            .feeds
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(Arc::clone(
            feeds
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(EventFeed::new())),
        ))
    }

    fn existing_feed(&self, id: &str) -> Result<Option<Arc<EventFeed>>, StoreError> {
        Ok(self
            .feeds
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?
            .get(id)
            .cloned())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn stamp(events: &mut [SessionEvent], at: u64) {
    for event in events.iter_mut().filter(|e| e.recorded_at.is_none()) {
        event.recorded_at = Some(at);
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn get(&self, id: Option<&str>) -> Result<Option<SessionSnapshot>, StoreError> {
        let Some(id) = id else {
            return Ok(None);
        };
        Ok(self
            .sessions
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?
            .get(id)
            .cloned())
    }

    async fn set(&self, mut snapshot: SessionSnapshot) -> Result<(), StoreError> {
        stamp(&mut snapshot.events, now_ms());

        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;

        // Events already stored keep their original record time.
        if let Some(existing) = sessions.remove(&snapshot.id) {
            let (events, _) = merge_events(existing.events, std::mem::take(&mut snapshot.events));
            snapshot.events = events;
        }
        sessions.insert(snapshot.id.clone(), snapshot);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.sessions
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?
            .remove(id);
        self.feeds
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?
            .remove(id);
        Ok(())
    }

    async fn pull_events(
        &self,
        id: &str,
        last_event_id: Option<&str>,
    ) -> Result<Vec<SessionEvent>, StoreError> {
        let sessions = self
            .sessions
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(sessions
            .get(id)
            .map(|s| unsynced_events(&s.events, last_event_id).to_vec())
            .unwrap_or_default())
    }

    async fn push_events(
        &self,
        id: &str,
        events: Vec<SessionEvent>,
    ) -> Result<Vec<SessionEvent>, StoreError> {
        let accepted = {
            let mut sessions = self
                .sessions
                .write()
                .map_err(|e| StoreError::Internal(e.to_string()))?;
            let session = sessions
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

            let mut known: HashSet<String> = session.events.iter().map(|e| e.id.clone()).collect();
            let mut accepted: Vec<SessionEvent> =
                events.into_iter().filter(|e| known.insert(e.id.clone())).collect();
            if accepted.is_empty() {
                return Ok(accepted);
            }
            stamp(&mut accepted, now_ms());

            let (merged, _) = merge_events(std::mem::take(&mut session.events), accepted.clone());
            session.events = merged;
            let (sorted, _) = merge_events(accepted, Vec::new());
            sorted
        };

        if let Some(feed) = self.existing_feed(id)? {
            for event in &accepted {
                feed.push(event.clone());
            }
        }
        Ok(accepted)
    }

    fn subscribe(&self, id: &str) -> Result<EventStream, StoreError> {
        if !self.push {
            return Err(StoreError::Unsupported("subscribe"));
        }
        Ok(self.feed(id)?.stream())
    }

    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities { push: self.push }
    }
}
