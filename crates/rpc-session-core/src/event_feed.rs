//! Broadcast feed of session events for live delivery.

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};

use crate::{event::SessionEvent, store::EventStream};

/// Buffered events per feed before slow subscribers start lagging.
const FEED_CAPACITY: usize = 1024;

/// Fan-out of newly appended events to any number of listeners.
///
/// Listeners that fall behind skip the missed events; the session log stays
/// the source of truth for replay.
pub struct EventFeed {
    sender: broadcast::Sender<SessionEvent>,
}

impl Default for EventFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl EventFeed {
    /// Create a new feed.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(FEED_CAPACITY);
        Self { sender }
    }

    /// Push an event to live listeners.
    pub fn push(&self, event: SessionEvent) {
        let _ = self.sender.send(event);
    }

    /// Get a receiver for live updates.
    #[must_use]
    pub fn receiver(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    /// Number of live listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Stream of events pushed from now on.
    #[must_use]
    pub fn stream(&self) -> EventStream {
        BroadcastStream::new(self.receiver())
            .filter_map(|res| async move {
                match res {
                    Ok(event) => Some(event),
                    Err(BroadcastStreamRecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Event feed listener lagged");
                        None
                    }
                }
            })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventPayload, NewEvent};

    #[tokio::test]
    async fn test_stream_receives_pushed_events() {
        let feed = EventFeed::new();
        let mut stream = feed.stream();
        assert_eq!(feed.listener_count(), 1);

        feed.push(NewEvent::new(EventPayload::ChannelStarted).with_id("e1").complete("c"));
        let got = stream.next().await.unwrap();
        assert_eq!(got.id, "e1");

        drop(stream);
        assert_eq!(feed.listener_count(), 0);
    }
}
