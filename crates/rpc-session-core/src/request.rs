//! Request state derived by folding session events.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    event::{ChannelId, EventPayload, SessionEvent, Side},
    protocol::{ErrorObject, Message, MessageKind, RequestId},
};

/// Request lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Awaiting a result or error.
    Processing,
    /// Completed with a result.
    Fulfilled,
    /// Completed with an error.
    Error,
    /// The channel it arrived on ended before it completed.
    Hanged,
    /// Explicitly aborted.
    Cancelled,
}

/// How a request completed. Result and error are mutually exclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestOutcome {
    Result(Value),
    Error(ErrorObject),
}

/// One request as seen through the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRequest {
    pub id: RequestId,
    pub origin: Side,
    pub channel_id: ChannelId,
    pub status: RequestStatus,
    pub created_at: u64,
    pub last_activity: u64,
    pub request: Message,
    pub notifications: Vec<Message>,
    pub outcome: Option<RequestOutcome>,
}

impl SessionRequest {
    /// True while the request can still complete.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self.status, RequestStatus::Processing | RequestStatus::Hanged)
    }

    fn complete(&mut self, message: &Message, at: u64) -> bool {
        if !self.is_open() {
            return false;
        }
        let (status, outcome) = match (&message.error, &message.result) {
            (Some(error), _) => (RequestStatus::Error, RequestOutcome::Error(error.clone())),
            (None, Some(result)) => (RequestStatus::Fulfilled, RequestOutcome::Result(result.clone())),
            (None, None) => return false,
        };
        self.status = status;
        self.outcome = Some(outcome);
        self.last_activity = self.last_activity.max(at);
        true
    }
}

/// Requests keyed by originating side and identifier.
///
/// Both peers number their own requests, so the same id may exist once per
/// side.
#[derive(Debug, Clone, Default)]
pub struct RequestTable {
    requests: HashMap<(Side, RequestId), SessionRequest>,
}

impl RequestTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a table from a full log.
    #[must_use]
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a SessionEvent>) -> Self {
        let mut table = Self::new();
        for event in events {
            table.apply(event);
        }
        table
    }

    /// Fold one event into the table. Returns whether anything changed.
    ///
    /// Applying the same event twice is a no-op the second time for request
    /// creation and completion.
    pub fn apply(&mut self, event: &SessionEvent) -> bool {
        match &event.payload {
            EventPayload::Abort {
                request_id, origin, ..
            } => self.abort(*origin, request_id, event.occurred_at),
            EventPayload::ChannelEnded => self.hang_channel(&event.channel_id, event.occurred_at),
            EventPayload::ChannelStarted | EventPayload::AssistantMessage { .. } => false,
            EventPayload::ServerMessage { message, .. }
            | EventPayload::ClientMessage { message, .. } => {
                let Some(sender) = event.payload.sender() else {
                    return false;
                };
                self.apply_message(sender, message, event)
            }
        }
    }

    fn apply_message(&mut self, sender: Side, message: &Message, event: &SessionEvent) -> bool {
        match (message.kind(), &message.id) {
            (MessageKind::Request, Some(id)) => {
                let key = (sender, id.clone());
                if self.requests.contains_key(&key) {
                    return false;
                }
                self.requests.insert(
                    key,
                    SessionRequest {
                        id: id.clone(),
                        origin: sender,
                        channel_id: event.channel_id.clone(),
                        status: RequestStatus::Processing,
                        created_at: event.occurred_at,
                        last_activity: event.occurred_at,
                        request: message.clone(),
                        notifications: Vec::new(),
                        outcome: None,
                    },
                );
                true
            }
            (MessageKind::Response | MessageKind::Error, Some(id)) => self
                .requests
                .get_mut(&(sender.peer(), id.clone()))
                .is_some_and(|req| req.complete(message, event.occurred_at)),
            (MessageKind::Notification, _) => {
                let mut changed = false;
                for req in self.requests.values_mut() {
                    if req.origin == sender.peer() && req.status == RequestStatus::Processing {
                        req.notifications.push(message.clone());
                        req.last_activity = req.last_activity.max(event.occurred_at);
                        changed = true;
                    }
                }
                changed
            }
            _ => false,
        }
    }

    fn abort(&mut self, origin: Side, id: &RequestId, at: u64) -> bool {
        let Some(req) = self.requests.get_mut(&(origin, id.clone())) else {
            return false;
        };
        if !req.is_open() {
            return false;
        }
        req.status = RequestStatus::Cancelled;
        req.last_activity = req.last_activity.max(at);
        true
    }

    fn hang_channel(&mut self, channel_id: &str, at: u64) -> bool {
        let mut changed = false;
        for req in self.requests.values_mut() {
            if req.channel_id == channel_id && req.status == RequestStatus::Processing {
                req.status = RequestStatus::Hanged;
                req.last_activity = req.last_activity.max(at);
                changed = true;
            }
        }
        changed
    }

    /// Look up a request by originating side.
    #[must_use]
    pub fn get(&self, origin: Side, id: &RequestId) -> Option<&SessionRequest> {
        self.requests.get(&(origin, id.clone()))
    }

    /// Look up a request by id alone, preferring client-originated ones.
    #[must_use]
    pub fn find(&self, id: &RequestId) -> Option<&SessionRequest> {
        self.get(Side::Client, id).or_else(|| self.get(Side::Server, id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &SessionRequest> {
        self.requests.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{event::NewEvent, protocol::methods};

    fn event(side: Side, message: Message, at: u64) -> SessionEvent {
        NewEvent::message(side, message)
            .with_occurred_at(at)
            .complete("chan-1")
    }

    #[test]
    fn test_request_then_response_fulfils() {
        let mut table = RequestTable::new();
        let req = event(Side::Client, Message::request(1, methods::TOOLS_CALL, None), 1);
        let progress = event(
            Side::Server,
            Message::notification("notifications/progress", Some(json!({ "progress": 1 }))),
            2,
        );
        let resp = event(
            Side::Server,
            Message::response(RequestId::from(1), json!({ "ok": true })),
            3,
        );

        assert!(table.apply(&req));
        assert!(table.apply(&progress));
        assert!(table.apply(&resp));

        let entry = table.get(Side::Client, &RequestId::from(1)).unwrap();
        assert_eq!(entry.status, RequestStatus::Fulfilled);
        assert_eq!(entry.notifications.len(), 1);
        assert_eq!(entry.outcome, Some(RequestOutcome::Result(json!({ "ok": true }))));
        assert_eq!(entry.last_activity, 3);
    }

    #[test]
    fn test_replaying_events_is_idempotent() {
        let mut table = RequestTable::new();
        let req = event(Side::Client, Message::request(1, methods::PING, None), 1);
        let resp = event(Side::Server, Message::response(RequestId::from(1), json!({})), 2);
        let err = event(
            Side::Server,
            Message::error_response(Some(RequestId::from(1)), ErrorObject::new(-1, "late")),
            3,
        );

        table.apply(&req);
        table.apply(&resp);
        assert!(!table.apply(&req));
        assert!(!table.apply(&resp));
        assert!(!table.apply(&err));

        let entry = table.find(&RequestId::from(1)).unwrap();
        assert_eq!(entry.status, RequestStatus::Fulfilled);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_error_response() {
        let mut table = RequestTable::new();
        table.apply(&event(Side::Server, Message::request(9, "sampling/createMessage", None), 1));
        table.apply(&event(
            Side::Client,
            Message::error_response(Some(RequestId::from(9)), ErrorObject::new(-5, "nope")),
            2,
        ));
        let entry = table.get(Side::Server, &RequestId::from(9)).unwrap();
        assert_eq!(entry.status, RequestStatus::Error);
        assert!(matches!(entry.outcome, Some(RequestOutcome::Error(_))));
    }

    #[test]
    fn test_abort_wins_over_late_completion() {
        let mut table = RequestTable::new();
        table.apply(&event(Side::Client, Message::request(2, methods::TOOLS_CALL, None), 1));
        let abort = NewEvent::new(EventPayload::Abort {
            request_id: RequestId::from(2),
            origin: Side::Client,
            reason: None,
        })
        .with_occurred_at(2)
        .complete("chan-1");
        assert!(table.apply(&abort));
        assert!(!table.apply(&event(
            Side::Server,
            Message::response(RequestId::from(2), json!({})),
            3
        )));
        assert_eq!(table.find(&RequestId::from(2)).unwrap().status, RequestStatus::Cancelled);
    }

    #[test]
    fn test_abort_only_touches_its_own_side() {
        let mut table = RequestTable::new();
        table.apply(&event(Side::Server, Message::request(1, "sampling/createMessage", None), 1));
        table.apply(&event(Side::Client, Message::request(1, methods::TOOLS_CALL, None), 2));
        let abort = NewEvent::new(EventPayload::Abort {
            request_id: RequestId::from(1),
            origin: Side::Client,
            reason: None,
        })
        .with_occurred_at(3)
        .complete("chan-1");
        assert!(table.apply(&abort));

        table.apply(&event(Side::Client, Message::response(RequestId::from(1), json!({})), 4));
        let server = table.get(Side::Server, &RequestId::from(1)).unwrap();
        assert_eq!(server.status, RequestStatus::Fulfilled);
        let client = table.get(Side::Client, &RequestId::from(1)).unwrap();
        assert_eq!(client.status, RequestStatus::Cancelled);
    }

    #[test]
    fn test_abort_defaults_to_client_origin() {
        let payload: EventPayload =
            serde_json::from_value(json!({ "type": "abort", "requestId": 5 })).unwrap();
        assert!(matches!(payload, EventPayload::Abort { origin: Side::Client, .. }));
    }

    #[test]
    fn test_channel_end_hangs_open_requests() {
        let mut table = RequestTable::new();
        table.apply(&event(Side::Client, Message::request(3, methods::TOOLS_CALL, None), 1));
        let ended = NewEvent::new(EventPayload::ChannelEnded)
            .with_occurred_at(2)
            .complete("chan-1");
        table.apply(&ended);
        assert_eq!(table.find(&RequestId::from(3)).unwrap().status, RequestStatus::Hanged);

        // A late answer still settles a hanged request.
        table.apply(&event(Side::Server, Message::response(RequestId::from(3), json!(1)), 3));
        assert_eq!(table.find(&RequestId::from(3)).unwrap().status, RequestStatus::Fulfilled);
    }

    #[test]
    fn test_orphan_response_is_ignored() {
        let mut table = RequestTable::new();
        let orphan = event(Side::Server, Message::response(RequestId::from(42), json!({})), 1);
        assert!(!table.apply(&orphan));
        assert!(table.is_empty());
    }
}
