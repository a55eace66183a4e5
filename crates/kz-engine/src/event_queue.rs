//! Per-fragment event list ordered by frame position.

use alloc::vec::Vec;

use crate::pool::PoolId;

/// One entry of the fragment event list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueuedEvent {
    /// Frame offset within the fragment.
    pub pos: u32,
    /// Event in the channel's event pool.
    pub id: PoolId,
}

/// Events of the current fragment sorted by position.
///
/// Events with equal positions keep their insertion order. Consumption
/// goes through a cursor that advances without removing elements, so the
/// drain path never shifts memory; the list is cleared once the fragment
/// is done.
#[derive(Clone, Debug)]
pub struct EventQueue {
    events: Vec<QueuedEvent>,
    /// Next event index to process.
    cursor: usize,
}

impl EventQueue {
    /// Create a queue holding at most `capacity` events per fragment.
    pub fn with_capacity(capacity: usize) -> Self {
        Self { events: Vec::with_capacity(capacity), cursor: 0 }
    }

    /// Insert an event. Returns false if the queue is full.
    ///
    /// Events inserted behind the cursor are placed right after it, so
    /// an event generated while processing position `p` still runs in this
    /// fragment.
    pub fn push(&mut self, pos: u32, id: PoolId) -> bool {
        if self.events.len() == self.events.capacity() {
            return false;
        }
        // Upper bound keeps equal positions in insertion order.
        let idx = self.events[self.cursor..].partition_point(|e| e.pos <= pos) + self.cursor;
        self.events.insert(idx, QueuedEvent { pos, id });
        true
    }

    /// Peek at the next unconsumed event.
    pub fn peek(&self) -> Option<&QueuedEvent> {
        self.events.get(self.cursor)
    }

    /// Consume the next event if it is at or before `pos`.
    pub fn next_until(&mut self, pos: u32) -> Option<QueuedEvent> {
        let ev = *self.events.get(self.cursor)?;
        if ev.pos <= pos {
            self.cursor += 1;
            Some(ev)
        } else {
            None
        }
    }

    /// Consume the next event regardless of position.
    pub fn next(&mut self) -> Option<QueuedEvent> {
        let ev = *self.events.get(self.cursor)?;
        self.cursor += 1;
        Some(ev)
    }

    /// Return the index range of events at or before `pos` and advance past them.
    pub fn drain_until(&mut self, pos: u32) -> core::ops::Range<usize> {
        let start = self.cursor;
        while self.cursor < self.events.len() && self.events[self.cursor].pos <= pos {
            self.cursor += 1;
        }
        start..self.cursor
    }

    /// Get an event by index (for use with `drain_until` ranges).
    pub fn get(&self, index: usize) -> Option<&QueuedEvent> {
        self.events.get(index)
    }

    /// All events of the fragment, consumed or not.
    pub fn as_slice(&self) -> &[QueuedEvent] {
        &self.events
    }

    /// Reset cursor to the beginning.
    pub fn reset_cursor(&mut self) {
        self.cursor = 0;
    }

    /// Clear all events and reset cursor.
    pub fn clear(&mut self) {
        self.events.clear();
        self.cursor = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Retain only events matching the predicate.
    pub fn retain<F: FnMut(&QueuedEvent) -> bool>(&mut self, f: F) {
        self.events.retain(f);
        self.cursor = self.cursor.min(self.events.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Pool;

    fn ids(n: usize) -> Vec<PoolId> {
        let mut pool: Pool<()> = Pool::with_capacity(n, || ());
        (0..n).map(|_| pool.allocate().unwrap()).collect()
    }

    #[test]
    fn events_sorted_by_position() {
        let id = ids(3);
        let mut queue = EventQueue::with_capacity(8);
        queue.push(10, id[0]);
        queue.push(5, id[1]);
        queue.push(15, id[2]);

        assert_eq!(queue.next().unwrap().id, id[1]);
        assert_eq!(queue.next().unwrap().id, id[0]);
        assert_eq!(queue.next().unwrap().id, id[2]);
        assert!(queue.next().is_none());
    }

    #[test]
    fn equal_positions_keep_insertion_order() {
        let id = ids(3);
        let mut queue = EventQueue::with_capacity(8);
        for &i in &id {
            queue.push(4, i);
        }
        let order: Vec<_> = core::iter::from_fn(|| queue.next()).map(|e| e.id).collect();
        assert_eq!(order, id);
    }

    #[test]
    fn full_queue_rejects() {
        let id = ids(2);
        let mut queue = EventQueue::with_capacity(1);
        assert!(queue.push(0, id[0]));
        assert!(!queue.push(0, id[1]));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn push_behind_cursor_lands_next() {
        let id = ids(3);
        let mut queue = EventQueue::with_capacity(8);
        queue.push(0, id[0]);
        queue.push(20, id[1]);
        assert_eq!(queue.next_until(10).unwrap().id, id[0]);
        // Generated while handling position 0.
        queue.push(0, id[2]);
        assert_eq!(queue.next_until(10).unwrap().id, id[2]);
        assert!(queue.next_until(10).is_none());
        assert_eq!(queue.next_until(20).unwrap().id, id[1]);
    }

    #[test]
    fn drain_until_returns_range() {
        let id = ids(3);
        let mut queue = EventQueue::with_capacity(8);
        queue.push(5, id[0]);
        queue.push(10, id[1]);
        queue.push(15, id[2]);

        let range = queue.drain_until(12);
        assert_eq!(range, 0..2);
        assert_eq!(queue.drain_until(20), 2..3);
    }

    #[test]
    fn reset_cursor_allows_replay() {
        let id = ids(1);
        let mut queue = EventQueue::with_capacity(2);
        queue.push(1, id[0]);
        assert_eq!(queue.drain_until(5).len(), 1);
        queue.reset_cursor();
        assert_eq!(queue.drain_until(5).len(), 1);
    }
}
