//! Begin/End span pairing.
//!
//! The legacy trace viewer expects a span to arrive as a contiguous pair of
//! adjacent Begin/End events on its track, so Begins are held back until the
//! matching End shows up and the two are emitted together. Tracks are keyed
//! by a single id: an inner thread id for real threads, a negated CPU index
//! for the per-CPU occupancy tracks, or the long-wait sentinel. Zero-length
//! (and backwards) spans are dropped outright; they are invisible in the UI
//! at any zoom level.

use std::collections::HashMap;

use crate::trace_event::{Event, Phase};

#[derive(Debug, Default)]
pub struct SpanTracker {
    begins: HashMap<i64, Event>,
}

impl SpanTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one Begin or End event for `track`. Returns the completed
    /// (begin, end) pair when an End closes a pending Begin at a strictly
    /// later timestamp. A Begin while another is pending replaces it; an End
    /// with nothing pending, or one that does not advance time, is dropped.
    pub fn add(&mut self, track: i64, event: Event) -> Option<(Event, Event)> {
        match event.ph {
            Phase::Begin => {
                self.begins.insert(track, event);
                None
            }
            Phase::End => {
                let begin = self.begins.remove(&track)?;
                let (Some(begin_ts), Some(end_ts)) = (begin.ts, event.ts) else {
                    return None;
                };
                (begin_ts < end_ts).then_some((begin, event))
            }
            _ => None,
        }
    }
}
