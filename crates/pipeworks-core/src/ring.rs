//! Fixed-capacity ring buffer. When full, the oldest entry is overwritten.
//!
//! Backs the event bus and the sink's drain ring.

use serde::{Deserialize, Serialize};

/// A pre-allocated ring buffer of `T`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingBuffer<T> {
    /// Pre-allocated storage.
    slots: Vec<Option<T>>,
    /// Write position (wraps around).
    head: usize,
    /// Number of entries currently stored.
    len: usize,
    /// Total entries ever written (including overwritten ones).
    total_written: u64,
    /// Entries overwritten before anyone read them.
    dropped: u64,
}

impl<T> RingBuffer<T> {
    /// Create a ring with the given capacity. A capacity of 0 is clamped to 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            head: 0,
            len: 0,
            total_written: 0,
            dropped: 0,
        }
    }

    /// Push an entry. If full, the oldest entry is dropped.
    pub fn push(&mut self, value: T) {
        let full = self.len == self.capacity();
        self.slots[self.head] = Some(value);
        self.head = (self.head + 1) % self.capacity();
        if full {
            self.dropped += 1;
        } else {
            self.len += 1;
        }
        self.total_written += 1;
    }

    /// False when the write position or length falls outside the slots,
    /// which only a corrupt blob can produce.
    pub fn is_consistent(&self) -> bool {
        !self.slots.is_empty() && self.head < self.slots.len() && self.len <= self.slots.len()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total entries written since creation (including dropped).
    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    /// Number of entries that were overwritten because the ring was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }

    fn start(&self) -> usize {
        if self.len < self.capacity() {
            (self.head + self.capacity() - self.len) % self.capacity()
        } else {
            // head points to the next write position, which is the oldest entry
            self.head
        }
    }

    /// Iterate from oldest to newest.
    pub fn iter(&self) -> RingIter<'_, T> {
        RingIter {
            ring: self,
            index: self.start(),
            remaining: self.len,
        }
    }

    /// The most recently pushed entry.
    pub fn latest(&self) -> Option<&T> {
        if self.len == 0 {
            return None;
        }
        let index = (self.head + self.capacity() - 1) % self.capacity();
        self.slots[index].as_ref()
    }

    /// Remove and return every entry, oldest first.
    pub fn drain(&mut self) -> Vec<T> {
        let start = self.start();
        let capacity = self.capacity();
        let out = (0..self.len)
            .filter_map(|i| self.slots[(start + i) % capacity].take())
            .collect();
        self.head = 0;
        self.len = 0;
        out
    }

    /// Remove all entries. `total_written` is preserved.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.head = 0;
        self.len = 0;
    }
}

impl<T: Clone> RingBuffer<T> {
    /// Copy out the contents, oldest first.
    pub fn to_vec(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }
}

/// Iterator over a [`RingBuffer`], from oldest to newest.
pub struct RingIter<'a, T> {
    ring: &'a RingBuffer<T>,
    index: usize,
    remaining: usize,
}

impl<'a, T> Iterator for RingIter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let value = self.ring.slots[self.index].as_ref();
        self.index = (self.index + 1) % self.ring.capacity();
        self.remaining -= 1;
        value
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<T> ExactSizeIterator for RingIter<'_, T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_iterate_in_order() {
        let mut ring = RingBuffer::new(4);
        ring.push('a');
        ring.push('b');
        assert_eq!(ring.to_vec(), vec!['a', 'b']);
        assert_eq!(ring.latest(), Some(&'b'));
    }

    #[test]
    fn overwrites_oldest_when_full() {
        let mut ring = RingBuffer::new(3);
        for c in ['a', 'b', 'c', 'd', 'e'] {
            ring.push(c);
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.to_vec(), vec!['c', 'd', 'e']);
        assert_eq!(ring.total_written(), 5);
        assert_eq!(ring.dropped_count(), 2);
    }

    #[test]
    fn consistency_checks_slots_head_and_len() {
        assert!(RingBuffer::<u8>::new(0).is_consistent());
        let empty: RingBuffer<u8> = RingBuffer {
            slots: Vec::new(),
            head: 0,
            len: 0,
            total_written: 0,
            dropped: 0,
        };
        assert!(!empty.is_consistent());
        let mut ring = RingBuffer::<u8>::new(2);
        ring.head = 2;
        assert!(!ring.is_consistent());
        ring.head = 0;
        ring.len = 3;
        assert!(!ring.is_consistent());
    }

    #[test]
    fn zero_capacity_clamped() {
        let mut ring = RingBuffer::new(0);
        ring.push(1);
        ring.push(2);
        assert_eq!(ring.capacity(), 1);
        assert_eq!(ring.to_vec(), vec![2]);
    }

    #[test]
    fn drain_empties_ring() {
        let mut ring = RingBuffer::new(3);
        for n in 0..5 {
            ring.push(n);
        }
        assert_eq!(ring.drain(), vec![2, 3, 4]);
        assert!(ring.is_empty());
        ring.push(9);
        assert_eq!(ring.to_vec(), vec![9]);
    }

    #[test]
    fn clear_keeps_write_count() {
        let mut ring = RingBuffer::new(2);
        ring.push("x");
        ring.clear();
        assert!(ring.is_empty());
        assert!(ring.latest().is_none());
        assert_eq!(ring.total_written(), 1);
    }
}
