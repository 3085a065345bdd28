//! The output event sequence and the deferred-resolution buffer.
//!
//! Events referencing an inner id whose outer identity is not yet known are
//! parked here, keyed by that inner id, and replayed in arrival order the
//! moment the mapping is established. Whatever is still parked when the
//! stream ends is either relocated onto a synthetic track at finalization or
//! silently dropped.
//!
//! Timestamps arrive in nanoseconds and the viewer wants microseconds; the
//! conversion happens exactly once, when an event enters this buffer.

use std::collections::BTreeMap;
use std::mem;

use crate::pid_map::PidMapper;
use crate::trace_event::Event;

/// The recorder thinks in ns, the trace viewer in µs. This conversion does
/// mean the viewer gets some things wrong (adjacent sub-µs events spill into
/// multiple rows because it mistakenly thinks they overlap) but it is the
/// easiest way to get something sensible on screen.
const TIME_CONVERSION: f64 = 1000.0;

#[derive(Debug, Default)]
pub struct EventList {
    events: Vec<Event>,
    /// Events awaiting outer identity, keyed by inner id (or by virtual
    /// track id, which never resolves and is relocated at finalization).
    pending: BTreeMap<i64, Vec<Event>>,
}

impl EventList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event that already carries its outer identity (or needs
    /// none). Converts the timestamp if one is present.
    pub fn append(&mut self, mut event: Event) {
        if let Some(ts) = event.ts.as_mut() {
            *ts /= TIME_CONVERSION;
        }
        self.events.push(event);
    }

    /// Append an event whose timestamp was already converted (a replayed
    /// pending event being relocated at finalization).
    pub fn append_converted(&mut self, event: Event) {
        self.events.push(event);
    }

    /// Append an event identified only by an inner id. If the id's outer
    /// pair is known the event lands immediately; otherwise it is parked
    /// until [`EventList::resolve_mapping`] learns the mapping.
    pub fn append_by_inner(&mut self, inner: i64, mut event: Event, ids: &mut PidMapper) {
        if let Some(ts) = event.ts.as_mut() {
            *ts /= TIME_CONVERSION;
        }
        match ids.lookup_outer(inner) {
            Some((opid, otid)) => {
                event.pid = Some(opid);
                event.tid = Some(otid);
                self.events.push(event);
            }
            None => self.pending.entry(inner).or_default().push(event),
        }
    }

    /// Offer an inner → outer association. If it is new, every event parked
    /// against that inner id is stamped with the pair and appended, in its
    /// original order.
    pub fn resolve_mapping(&mut self, inner: i64, opid: i64, otid: i64, ids: &mut PidMapper) {
        if !ids.resolve(inner, opid, otid) {
            return;
        }
        if let Some(parked) = self.pending.remove(&inner) {
            for mut event in parked {
                event.pid = Some(opid);
                event.tid = Some(otid);
                self.events.push(event);
            }
        }
    }

    /// Apply a mutation to every thread-name metadata event appended so far.
    /// Never reorders the sequence.
    pub fn for_each_thread_name(&mut self, mut f: impl FnMut(&mut Event)) {
        for event in self.events.iter_mut().filter(|ev| ev.is_thread_name()) {
            f(event);
        }
    }

    /// Apply a mutation to every event appended so far.
    pub fn for_each_event(&mut self, mut f: impl FnMut(&mut Event)) {
        for event in self.events.iter_mut() {
            f(event);
        }
    }

    /// Take the still-unresolved events for finalization, keyed by track id
    /// in sorted order.
    pub fn take_pending(&mut self) -> BTreeMap<i64, Vec<Event>> {
        mem::take(&mut self.pending)
    }

    /// Consume the buffer, discarding anything still pending.
    pub fn into_events(self) -> Vec<Event> {
        self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_converts_ns_to_us() {
        let mut events = EventList::new();
        events.append(Event::begin("Running", 100_000_000, None));
        let out = events.into_events();
        assert_eq!(out[0].ts, Some(100_000.0));
    }

    #[test]
    fn test_deferred_events_replay_in_order() {
        let mut events = EventList::new();
        let mut ids = PidMapper::new();
        events.append_by_inner(5, Event::begin("Running", 1_000, None), &mut ids);
        events.append_by_inner(5, Event::end("Running", 2_000, None), &mut ids);
        assert!(events.into_events().is_empty());

        let mut events = EventList::new();
        let mut ids = PidMapper::new();
        events.append_by_inner(5, Event::begin("Running", 1_000, None), &mut ids);
        events.append_by_inner(5, Event::end("Running", 2_000, None), &mut ids);
        events.resolve_mapping(5, 10, 11, &mut ids);
        let out = events.into_events();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].ts, Some(1.0));
        assert_eq!(out[0].pid, Some(10));
        assert_eq!(out[0].tid, Some(11));
        assert_eq!(out[1].ts, Some(2.0));
    }

    #[test]
    fn test_known_mapping_appends_immediately() {
        let mut events = EventList::new();
        let mut ids = PidMapper::new();
        ids.resolve(5, 10, 11);
        events.append_by_inner(5, Event::begin("Running", 3_000, None), &mut ids);
        let out = events.into_events();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].pid, Some(10));
    }

    #[test]
    fn test_resolve_mapping_is_idempotent() {
        let mut events = EventList::new();
        let mut ids = PidMapper::new();
        events.append_by_inner(5, Event::begin("Running", 1_000, None), &mut ids);
        events.resolve_mapping(5, 10, 11, &mut ids);
        // The established identity survives a conflicting late mapping.
        events.append_by_inner(5, Event::end("Running", 2_000, None), &mut ids);
        events.resolve_mapping(5, 20, 21, &mut ids);
        let out = events.into_events();
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].pid, Some(10));
    }
}
