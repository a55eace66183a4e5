//! Time-ordered queue of delayed events and suspended script callbacks.
//!
//! Entries are keyed by absolute engine time in frames. Dispatch happens
//! once per fragment and fires everything due before the fragment end in
//! time order; entries sharing a time fire in insertion order.

use alloc::vec::Vec;

/// Absolute engine time in frames since the engine started.
pub type SchedTime = u64;

/// Lifecycle of a scheduled item, as seen by its owner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScheduleState {
    Queued,
    Dispatched,
    Cancelled,
}

#[derive(Clone, Copy, Debug)]
struct Entry<T> {
    time: SchedTime,
    item: T,
}

/// A bounded priority queue of `(time, item)` entries.
///
/// Entries are kept sorted by descending time so the next due entry sits
/// at the end of the vector and dispatch pops without shifting. Capacity
/// is reserved up front; scheduling into a full queue fails instead of
/// growing.
#[derive(Clone, Debug)]
pub struct Scheduler<T> {
    entries: Vec<Entry<T>>,
}

impl<T: Copy + PartialEq> Scheduler<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self { entries: Vec::with_capacity(capacity) }
    }

    /// Queue `item` for `time`. Returns false if the queue is full.
    pub fn schedule(&mut self, time: SchedTime, item: T) -> bool {
        if self.entries.len() == self.entries.capacity() {
            return false;
        }
        // New entries go in front of existing ones with the same time,
        // which puts them later in dispatch order.
        let idx = self.entries.partition_point(|e| e.time > time);
        self.entries.insert(idx, Entry { time, item });
        true
    }

    /// Remove the earliest entry due strictly before `end`.
    pub fn pop_due(&mut self, end: SchedTime) -> Option<(SchedTime, T)> {
        match self.entries.last() {
            Some(e) if e.time < end => self.entries.pop().map(|e| (e.time, e.item)),
            _ => None,
        }
    }

    /// Time of the next entry.
    pub fn next_time(&self) -> Option<SchedTime> {
        self.entries.last().map(|e| e.time)
    }

    /// Remove the entry holding `item`. Returns false if it was not queued.
    pub fn cancel(&mut self, item: T) -> bool {
        match self.entries.iter().position(|e| e.item == item) {
            Some(idx) => {
                self.entries.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Move an already queued `item` to a new time.
    pub fn reschedule(&mut self, item: T, time: SchedTime) -> bool {
        self.cancel(item) && self.schedule(time, item)
    }

    /// Scheduled time of `item`, if queued.
    pub fn time_of(&self, item: T) -> Option<SchedTime> {
        self.entries.iter().find(|e| e.item == item).map(|e| e.time)
    }

    pub fn contains(&self, item: T) -> bool {
        self.entries.iter().any(|e| e.item == item)
    }

    /// Remove all entries for which `keep` returns false.
    pub fn retain(&mut self, mut keep: impl FnMut(SchedTime, T) -> bool) {
        self.entries.retain(|e| keep(e.time, e.item));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.capacity()
    }
}

/// Convert a delay in microseconds to frames, rounding down.
pub fn micros_to_frames(us: u64, sample_rate: u32) -> u64 {
    us.saturating_mul(sample_rate as u64) / 1_000_000
}

/// Convert frames to microseconds, rounding down.
pub fn frames_to_micros(frames: u64, sample_rate: u32) -> u64 {
    if sample_rate == 0 {
        return 0;
    }
    frames.saturating_mul(1_000_000) / sample_rate as u64
}
