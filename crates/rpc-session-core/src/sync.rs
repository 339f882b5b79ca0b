//! Pure helpers for reconciling a session log with its store.

use std::collections::HashSet;

use crate::event::{EventId, SessionEvent, compare_events};

/// Events strictly after the one with id `last_synced_id`.
///
/// Returns the whole slice if `last_synced_id` is absent or unknown.
#[must_use]
pub fn unsynced_events<'a>(
    events: &'a [SessionEvent],
    last_synced_id: Option<&str>,
) -> &'a [SessionEvent] {
    let Some(last) = last_synced_id else {
        return events;
    };
    events
        .iter()
        .position(|e| e.id == last)
        .map_or(events, |idx| &events[idx + 1..])
}

/// Concatenate, stable-sort and de-duplicate two event lists.
///
/// The first occurrence of an id wins. Returns the merged log and the id of
/// its last element.
#[must_use]
pub fn merge_events(
    existing: Vec<SessionEvent>,
    incoming: Vec<SessionEvent>,
) -> (Vec<SessionEvent>, Option<EventId>) {
    let mut seen = HashSet::with_capacity(existing.len() + incoming.len());
    let mut merged: Vec<SessionEvent> = existing
        .into_iter()
        .chain(incoming)
        .filter(|e| seen.insert(e.id.clone()))
        .collect();
    merged.sort_by(compare_events);
    let last = merged.last().map(|e| e.id.clone());
    (merged, last)
}

/// Insert `event` keeping `events` sorted; equal keys go after existing ones.
///
/// Returns the insertion index.
pub fn insert_sorted(events: &mut Vec<SessionEvent>, event: SessionEvent) -> usize {
    let idx = events.partition_point(|e| compare_events(e, &event).is_le());
    events.insert(idx, event);
    idx
}

/// Widen the `(first, last)` activity window to include `event`.
#[must_use]
pub fn update_activity_timestamps(
    event: &SessionEvent,
    first: Option<u64>,
    last: Option<u64>,
) -> (u64, u64) {
    let at = event.occurred_at;
    (
        first.map_or(at, |f| f.min(at)),
        last.map_or(at, |l| l.max(at)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventPayload, NewEvent};

    fn ev(id: &str, at: u64) -> SessionEvent {
        NewEvent::new(EventPayload::ChannelStarted)
            .with_id(id)
            .with_occurred_at(at)
            .complete("c")
    }

    fn ids(events: &[SessionEvent]) -> Vec<&str> {
        events.iter().map(|e| e.id.as_str()).collect()
    }

    #[test]
    fn test_unsynced_suffix() {
        let events = vec![ev("a", 1), ev("b", 2), ev("c", 3)];
        assert_eq!(ids(unsynced_events(&events, Some("a"))), ["b", "c"]);
        assert!(unsynced_events(&events, Some("c")).is_empty());
        assert_eq!(ids(unsynced_events(&events, None)), ["a", "b", "c"]);
        assert_eq!(ids(unsynced_events(&events, Some("zz"))), ["a", "b", "c"]);
    }

    #[test]
    fn test_merge_sorts_and_reports_last() {
        let (merged, last) = merge_events(vec![ev("a", 1), ev("c", 5)], vec![ev("b", 3)]);
        assert_eq!(ids(&merged), ["a", "b", "c"]);
        assert_eq!(last.as_deref(), Some("c"));

        let (empty, none) = merge_events(Vec::new(), Vec::new());
        assert!(empty.is_empty());
        assert!(none.is_none());
    }

    #[test]
    fn test_merge_drops_duplicate_ids() {
        let (merged, _) = merge_events(vec![ev("a", 1), ev("b", 2)], vec![ev("b", 2), ev("c", 3)]);
        assert_eq!(ids(&merged), ["a", "b", "c"]);
    }

    #[test]
    fn test_insert_sorted_keeps_arrival_order_for_ties() {
        let mut events = Vec::new();
        for (id, at) in [("x", 5), ("y", 1), ("z", 5), ("w", 3)] {
            insert_sorted(&mut events, ev(id, at));
        }
        assert_eq!(ids(&events), ["y", "w", "x", "z"]);
    }

    #[test]
    fn test_activity_window() {
        assert_eq!(update_activity_timestamps(&ev("a", 7), None, None), (7, 7));
        assert_eq!(update_activity_timestamps(&ev("a", 7), Some(3), Some(5)), (3, 7));
        assert_eq!(update_activity_timestamps(&ev("a", 2), Some(3), Some(5)), (2, 5));
    }
}
