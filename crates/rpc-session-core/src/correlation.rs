//! Correlation of outbound requests with their responses.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::{
    error::RequestError,
    protocol::{ErrorObject, Message, MessageKind, RequestId},
};

/// Identifier reserved for the `initialize` handshake.
pub const HANDSHAKE_REQUEST_ID: i64 = 0;

type Completion = oneshot::Sender<Result<Value, RequestError>>;

/// Handle to an outstanding request.
#[derive(Debug)]
pub struct PendingRequest {
    id: RequestId,
    rx: oneshot::Receiver<Result<Value, RequestError>>,
}

impl PendingRequest {
    /// The correlated identifier.
    #[must_use]
    pub const fn id(&self) -> &RequestId {
        &self.id
    }

    /// Wait for the response.
    ///
    /// # Errors
    /// Returns the rejection, or `Hanged` if the manager dropped the entry
    /// without settling it.
    pub async fn wait(self) -> Result<Value, RequestError> {
        self.rx
            .await
            .unwrap_or_else(|_| Err(RequestError::Hanged(format!("request {} dropped", self.id))))
    }
}

struct Inner {
    next_id: i64,
    pending: HashMap<RequestId, Completion>,
}

/// Table of requests awaiting a response.
///
/// Ids increase monotonically from `first_id` and are never handed out
/// while an entry with the same id is pending.
pub struct RequestManager {
    first_id: i64,
    inner: Mutex<Inner>,
}

impl Default for RequestManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestManager {
    /// Manager whose ids start just above the handshake id.
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(HANDSHAKE_REQUEST_ID + 1)
    }

    #[must_use]
    pub fn starting_at(first_id: i64) -> Self {
        Self {
            first_id,
            inner: Mutex::new(Inner {
                next_id: first_id,
                pending: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate the next id and register a pending completion for it.
    #[must_use]
    pub fn register(&self) -> PendingRequest {
        let mut inner = self.lock();
        let mut id = RequestId::Number(inner.next_id);
        while inner.pending.contains_key(&id) {
            inner.next_id += 1;
            id = RequestId::Number(inner.next_id);
        }
        inner.next_id += 1;
        let (tx, rx) = oneshot::channel();
        inner.pending.insert(id.clone(), tx);
        PendingRequest { id, rx }
    }

    /// Register a caller-chosen id. Returns `None` if that id is pending.
    #[must_use]
    pub fn register_with_id(&self, id: RequestId) -> Option<PendingRequest> {
        let mut inner = self.lock();
        if inner.pending.contains_key(&id) {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        inner.pending.insert(id.clone(), tx);
        Some(PendingRequest { id, rx })
    }

    fn take(&self, id: &RequestId) -> Option<Completion> {
        self.lock().pending.remove(id)
    }

    /// Complete a pending request successfully.
    pub fn resolve(&self, id: &RequestId, result: Value) -> bool {
        self.take(id).is_some_and(|tx| {
            let _ = tx.send(Ok(result));
            true
        })
    }

    /// Fail a pending request and drop its entry.
    pub fn reject(&self, id: &RequestId, error: RequestError) -> bool {
        self.take(id).is_some_and(|tx| {
            let _ = tx.send(Err(error));
            true
        })
    }

    /// Settle the request a response or error message answers.
    ///
    /// Returns `false` for other message kinds or unknown ids.
    pub fn settle(&self, message: &Message) -> bool {
        let Some(id) = &message.id else {
            return false;
        };
        match message.kind() {
            MessageKind::Error => {
                let error = message
                    .error
                    .clone()
                    .unwrap_or_else(|| ErrorObject::new(ErrorObject::INTERNAL_ERROR, "missing error"));
                self.reject(id, RequestError::Rpc(error))
            }
            MessageKind::Response => {
                self.resolve(id, message.result.clone().unwrap_or(Value::Null))
            }
            _ => false,
        }
    }

    /// Reject every pending request. Returns how many were rejected.
    pub fn clear(&self, reason: &str) -> usize {
        let drained: Vec<_> = self.lock().pending.drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(RequestError::Hanged(reason.to_string())));
        }
        count
    }

    /// Restore the id counter. Refused while requests are outstanding.
    pub fn reset_id_counter(&self) -> bool {
        let mut inner = self.lock();
        if !inner.pending.is_empty() {
            return false;
        }
        inner.next_id = self.first_id;
        true
    }

    #[must_use]
    pub fn is_pending(&self, id: &RequestId) -> bool {
        self.lock().pending.contains_key(id)
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }
}
