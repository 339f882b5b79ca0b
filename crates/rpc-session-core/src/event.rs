//! Session events: the append-only log every session is folded from.

use std::{
    cmp::Ordering,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::{Message, MessageKind, RequestId};

/// Event identifier.
pub type EventId = String;

/// Identifier of the physical connection that produced an event.
pub type ChannelId = String;

/// Channel id used for events produced outside any connection.
pub const DETACHED_CHANNEL: &str = "detached";

/// Current wall-clock time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Generate a fresh event identifier.
#[must_use]
pub fn new_event_id() -> EventId {
    Uuid::new_v4().to_string()
}

/// Which end of a session authored a message or originated a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Client,
    Server,
}

impl Side {
    const fn client() -> Self {
        Self::Client
    }

    /// The other end.
    #[must_use]
    pub const fn peer(self) -> Self {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
        }
    }
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EventPayload {
    ServerMessage {
        message: Message,
        #[serde(default, rename = "responseTo", skip_serializing_if = "Option::is_none")]
        response_to: Option<RequestId>,
    },
    ClientMessage {
        message: Message,
        #[serde(default, rename = "responseTo", skip_serializing_if = "Option::is_none")]
        response_to: Option<RequestId>,
    },
    AssistantMessage {
        message: Message,
    },
    ChannelStarted,
    ChannelEnded,
    Abort {
        #[serde(rename = "requestId")]
        request_id: RequestId,
        /// Side that originated the aborted request.
        #[serde(default = "Side::client")]
        origin: Side,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl EventPayload {
    /// Wrap a message sent by `side`, filling `response_to` for responses.
    #[must_use]
    pub fn message(side: Side, message: Message) -> Self {
        let response_to = if message.is_response() {
            message.id.clone()
        } else {
            None
        };
        match side {
            Side::Server => Self::ServerMessage {
                message,
                response_to,
            },
            Side::Client => Self::ClientMessage {
                message,
                response_to,
            },
        }
    }

    /// The carried protocol message, if any.
    #[must_use]
    pub const fn as_message(&self) -> Option<&Message> {
        match self {
            Self::ServerMessage { message, .. }
            | Self::ClientMessage { message, .. }
            | Self::AssistantMessage { message } => Some(message),
            Self::ChannelStarted | Self::ChannelEnded | Self::Abort { .. } => None,
        }
    }

    /// The side that authored the carried message.
    ///
    /// Assistant messages are not attributed to either protocol side.
    #[must_use]
    pub const fn sender(&self) -> Option<Side> {
        match self {
            Self::ServerMessage { .. } => Some(Side::Server),
            Self::ClientMessage { .. } => Some(Side::Client),
            _ => None,
        }
    }
}

/// One immutable entry in a session log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
    pub id: EventId,
    pub channel_id: ChannelId,
    pub occurred_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_at: Option<u64>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl SessionEvent {
    /// The carried protocol message, if any.
    #[must_use]
    pub const fn message(&self) -> Option<&Message> {
        self.payload.as_message()
    }

    /// True when this event carries a message authored by `side`.
    #[must_use]
    pub fn is_message_from(&self, side: Side) -> bool {
        self.payload.sender() == Some(side)
    }

    /// True when this event carries a request.
    #[must_use]
    pub fn is_request(&self) -> bool {
        self.message()
            .is_some_and(|m| m.kind() == MessageKind::Request)
    }
}

/// Log ordering: `occurred_at`, then `recorded_at` (unrecorded last).
///
/// Equal keys compare equal so stable sorts keep arrival order.
#[must_use]
pub fn compare_events(a: &SessionEvent, b: &SessionEvent) -> Ordering {
    a.occurred_at.cmp(&b.occurred_at).then_with(|| {
        a.recorded_at
            .unwrap_or(u64::MAX)
            .cmp(&b.recorded_at.unwrap_or(u64::MAX))
    })
}

/// A partially specified event; missing fields are filled on append.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub id: Option<EventId>,
    pub channel_id: Option<ChannelId>,
    pub occurred_at: Option<u64>,
    /// Kept when replaying an event the store already stamped.
    pub recorded_at: Option<u64>,
    pub payload: EventPayload,
}

impl NewEvent {
    #[must_use]
    pub const fn new(payload: EventPayload) -> Self {
        Self {
            id: None,
            channel_id: None,
            occurred_at: None,
            recorded_at: None,
            payload,
        }
    }

    /// Event wrapping a message authored by `side`.
    #[must_use]
    pub fn message(side: Side, message: Message) -> Self {
        Self::new(EventPayload::message(side, message))
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<EventId>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_channel(mut self, channel_id: impl Into<ChannelId>) -> Self {
        self.channel_id = Some(channel_id.into());
        self
    }

    #[must_use]
    pub const fn with_occurred_at(mut self, occurred_at: u64) -> Self {
        self.occurred_at = Some(occurred_at);
        self
    }

    /// Fill defaults and produce the final event.
    #[must_use]
    pub fn complete(self, default_channel: &str) -> SessionEvent {
        SessionEvent {
            id: self.id.unwrap_or_else(new_event_id),
            channel_id: self
                .channel_id
                .unwrap_or_else(|| default_channel.to_string()),
            occurred_at: self.occurred_at.unwrap_or_else(now_ms),
            recorded_at: self.recorded_at,
            payload: self.payload,
        }
    }
}

impl From<SessionEvent> for NewEvent {
    fn from(event: SessionEvent) -> Self {
        Self {
            id: Some(event.id),
            channel_id: Some(event.channel_id),
            occurred_at: Some(event.occurred_at),
            recorded_at: event.recorded_at,
            payload: event.payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::methods;

    #[test]
    fn test_stored_event_keeps_record_time() {
        let mut stored = NewEvent::message(Side::Client, Message::notification(methods::PING, None))
            .with_id("e1")
            .with_occurred_at(5)
            .complete("c1");
        stored.recorded_at = Some(9);

        let replayed = NewEvent::from(stored.clone()).complete(DETACHED_CHANNEL);
        assert_eq!(replayed, stored);
    }

    #[test]
    fn test_event_serialization_shape() {
        let event = NewEvent::message(Side::Server, Message::notification(methods::PING, None))
            .with_id("e1")
            .with_channel("c1")
            .with_occurred_at(10)
            .complete(DETACHED_CHANNEL);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "server-message");
        assert_eq!(json["channelId"], "c1");
        assert_eq!(json["occurredAt"], 10);
        assert!(json.get("recordedAt").is_none());

        let back: SessionEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_response_events_record_request_id() {
        let payload = EventPayload::message(
            Side::Client,
            Message::response(RequestId::from(4), serde_json::json!({})),
        );
        let EventPayload::ClientMessage { response_to, .. } = payload else {
            panic!("expected client message");
        };
        assert_eq!(response_to, Some(RequestId::from(4)));
    }

    #[test]
    fn test_compare_events_tie_breaks() {
        let mk = |id: &str, at: u64, rec: Option<u64>| SessionEvent {
            recorded_at: rec,
            ..NewEvent::new(EventPayload::ChannelStarted)
                .with_id(id)
                .with_occurred_at(at)
                .complete("c")
        };
        assert_eq!(compare_events(&mk("a", 1, None), &mk("b", 2, None)), Ordering::Less);
        assert_eq!(
            compare_events(&mk("a", 1, Some(5)), &mk("b", 1, Some(3))),
            Ordering::Greater
        );
        assert_eq!(
            compare_events(&mk("a", 1, Some(5)), &mk("b", 1, None)),
            Ordering::Less
        );
        assert_eq!(compare_events(&mk("a", 1, None), &mk("b", 1, None)), Ordering::Equal);
    }

    #[test]
    fn test_missing_fields_are_filled() {
        let event = NewEvent::new(EventPayload::ChannelEnded).complete("chan");
        assert_eq!(event.channel_id, "chan");
        assert!(!event.id.is_empty());
        assert!(event.occurred_at > 0);
    }
}
