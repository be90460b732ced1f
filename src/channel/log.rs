//! Time-ordered audit log of one channel

use crate::events::EventEnvelope;

/// Append-only envelope sequence kept sorted by event timestamp
///
/// Envelopes with equal timestamps keep their arrival order.
#[derive(Debug, Default, Clone)]
pub struct OrderedEventLog {
    entries: Vec<EventEnvelope>,
}

impl OrderedEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert after every entry whose timestamp is not later than the new one.
    /// Returns the position the envelope landed at.
    pub fn insert(&mut self, envelope: EventEnvelope) -> usize {
        let position = self
            .entries
            .partition_point(|existing| existing.timestamp <= envelope.timestamp);
        self.entries.insert(position, envelope);
        position
    }

    /// Entries in ascending timestamp order; may be called any number of times
    pub fn iter(&self) -> impl Iterator<Item = &EventEnvelope> + '_ {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn latest(&self) -> Option<&EventEnvelope> {
        self.entries.last()
    }
}
