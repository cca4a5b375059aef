//! Inbound reordering: the gap buffer and the missing-index tracker.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::core::{INDEX_EPOCH_BIT, INDEX_MASK};
use crate::transport::Frame;

/// Where an inbound index falls relative to the receive cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// Already delivered, or from another index epoch.
    Stale,
    /// Exactly the next expected index.
    Next,
    /// Ahead of the cursor, inside the window.
    Future,
    /// Absurdly far ahead; dropped.
    TooFar,
}

/// A frame parked in the gap buffer.
#[derive(Debug, Clone)]
pub struct GapEntry {
    /// The buffered frame.
    pub frame: Frame,
    /// Already handed over ahead of order.
    pub delivered: bool,
}

/// Gap buffer keyed by connection-level index.
///
/// Keys and the cursor are epoch-local; wire indices carry the epoch parity
/// in [`INDEX_EPOCH_BIT`].
#[derive(Debug)]
pub struct ReorderBuffer {
    recv_index: u32,
    epoch: u32,
    window: u32,
    gap: BTreeMap<u32, GapEntry>,
}

impl ReorderBuffer {
    /// Create a buffer expecting index 1.
    pub fn new(window: u32) -> Self {
        Self {
            recv_index: 1,
            epoch: 0,
            window,
            gap: BTreeMap::new(),
        }
    }

    /// Next index expected in order.
    pub fn recv_index(&self) -> u32 {
        self.recv_index
    }

    /// Highest contiguous index received, the value piggy-backed as `ack`.
    pub fn ack_index(&self) -> u32 {
        self.recv_index - 1
    }

    /// Epoch parity bit of the current index epoch.
    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// `ack_index` stamped with the epoch bit, as sent on the wire.
    pub fn wire_ack(&self) -> u32 {
        self.ack_index() | self.epoch
    }

    /// Classify an inbound wire index.
    pub fn classify(&self, wire_index: u32) -> Slot {
        if wire_index & INDEX_EPOCH_BIT != self.epoch {
            return Slot::Stale;
        }
        let index = wire_index & INDEX_MASK;
        if index < self.recv_index {
            Slot::Stale
        } else if index == self.recv_index {
            Slot::Next
        } else if index - self.recv_index > self.window {
            Slot::TooFar
        } else {
            Slot::Future
        }
    }

    /// Check if an index is already parked.
    pub fn contains(&self, index: u32) -> bool {
        self.gap.contains_key(&index)
    }

    /// Park a future frame. Returns `false` if the index was already parked.
    pub fn insert(&mut self, frame: Frame, delivered: bool) -> bool {
        let index = frame.index;
        if self.gap.contains_key(&index) {
            return false;
        }
        self.gap.insert(index, GapEntry { frame, delivered });
        true
    }

    /// Move the cursor past an index delivered straight from the wire.
    pub fn advance(&mut self) {
        self.recv_index += 1;
    }

    /// Check if the head of the gap buffer has become contiguous.
    pub fn has_ready(&self) -> bool {
        self.gap
            .first_key_value()
            .is_some_and(|(index, _)| *index == self.recv_index)
    }

    /// Pop the next contiguous parked frame and advance the cursor.
    pub fn pop_ready(&mut self) -> Option<GapEntry> {
        if !self.has_ready() {
            return None;
        }
        let (_, entry) = self.gap.pop_first()?;
        self.recv_index += 1;
        Some(entry)
    }

    /// Parked frames.
    pub fn len(&self) -> usize {
        self.gap.len()
    }

    /// Check if nothing is parked.
    pub fn is_empty(&self) -> bool {
        self.gap.is_empty()
    }

    /// Up to `limit` parked indices, lowest first (selective ACK payload).
    pub fn buffered_indices(&self, limit: usize) -> Vec<u32> {
        self.gap.keys().take(limit).copied().collect()
    }

    /// Up to `limit` indices below the highest parked one that have not
    /// arrived yet.
    pub fn missing(&self, limit: usize) -> Vec<u32> {
        let mut missing = Vec::new();
        let mut expected = self.recv_index;
        for index in self.gap.keys() {
            while expected < *index {
                if missing.len() >= limit {
                    return missing;
                }
                missing.push(expected);
                expected += 1;
            }
            expected = index + 1;
        }
        missing
    }

    /// Start a new index epoch.
    pub fn reset(&mut self) {
        self.recv_index = 1;
        self.epoch ^= INDEX_EPOCH_BIT;
        self.gap.clear();
    }
}

#[derive(Debug, Clone, Copy)]
struct MissingEntry {
    since: Instant,
    requested_at: Option<Instant>,
}

/// Remembers since when each gap index has been missing and when it was
/// last requested, so a lost frame is asked for once per window.
#[derive(Debug, Default)]
pub struct MissingTracker {
    entries: BTreeMap<u32, MissingEntry>,
}

impl MissingTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the tracked set with the currently missing indices.
    pub fn update(&mut self, missing: &[u32], now: Instant) {
        self.entries.retain(|index, _| missing.binary_search(index).is_ok());
        for index in missing {
            self.entries.entry(*index).or_insert(MissingEntry {
                since: now,
                requested_at: None,
            });
        }
    }

    /// Forget an index that arrived.
    pub fn remove(&mut self, index: u32) {
        self.entries.remove(&index);
    }

    /// Indices missing for at least `threshold` and not requested within
    /// `window`; they are marked requested at `now`.
    pub fn due(&mut self, now: Instant, threshold: Duration, window: Duration) -> Vec<u32> {
        let mut due = Vec::new();
        for (index, entry) in self.entries.iter_mut() {
            if now.saturating_duration_since(entry.since) < threshold {
                continue;
            }
            if entry
                .requested_at
                .is_some_and(|at| now.saturating_duration_since(at) < window)
            {
                continue;
            }
            entry.requested_at = Some(now);
            due.push(*index);
        }
        due
    }

    /// Tracked indices.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
