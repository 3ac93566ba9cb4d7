//! Bounded circular buffer for per-connection outbound messages.
//!
//! A full queue either overwrites its oldest element or rejects the push,
//! depending on how it was constructed. Absence is always represented as
//! `None` or a short `Vec`; nothing here panics.

use serde::Serialize;

/// Diagnostic counters exposed to flow control and health reporting.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    /// Elements currently held.
    pub size: usize,
    /// Maximum elements held.
    pub capacity: usize,
    /// Elements ever accepted.
    pub total_added: u64,
    /// Elements dropped to make room (overwrite mode).
    pub total_overwritten: u64,
    /// Pushes refused (reject mode).
    pub total_rejected: u64,
}

/// Fixed-capacity FIFO that never grows past `capacity`.
#[derive(Debug)]
pub struct RingQueue<T> {
    slots: Vec<Option<T>>,
    head: usize,
    len: usize,
    overwrite: bool,
    total_added: u64,
    total_overwritten: u64,
    total_rejected: u64,
}

impl<T> RingQueue<T> {
    /// Create a queue holding at most `capacity` elements (minimum 1).
    #[must_use]
    pub fn new(capacity: usize, overwrite: bool) -> Self {
        let capacity = capacity.max(1);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            head: 0,
            len: 0,
            overwrite,
            total_added: 0,
            total_overwritten: 0,
            total_rejected: 0,
        }
    }

    /// Append `item`.
    ///
    /// Returns `false` when the queue is full in reject mode; the queue is
    /// left unchanged apart from the rejected counter.
    pub fn push(&mut self, item: T) -> bool {
        let capacity = self.capacity();
        if self.len == capacity {
            if !self.overwrite {
                self.total_rejected += 1;
                return false;
            }
            // Drop the oldest element by advancing the read cursor.
            self.slots[self.head] = None;
            self.head = (self.head + 1) % capacity;
            self.len -= 1;
            self.total_overwritten += 1;
        }

        let tail = (self.head + self.len) % capacity;
        self.slots[tail] = Some(item);
        self.len += 1;
        self.total_added += 1;
        true
    }

    /// Remove and return the oldest element.
    pub fn shift(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let item = self.slots[self.head].take();
        self.head = (self.head + 1) % self.capacity();
        self.len -= 1;
        item
    }

    /// Remove up to `count` oldest elements, oldest first.
    pub fn shift_n(&mut self, count: usize) -> Vec<T> {
        let take = count.min(self.len);
        let mut out = Vec::with_capacity(take);
        for _ in 0..take {
            if let Some(item) = self.shift() {
                out.push(item);
            }
        }
        out
    }

    /// Oldest element without removing it.
    #[must_use]
    pub fn peek(&self) -> Option<&T> {
        if self.len == 0 {
            return None;
        }
        self.slots[self.head].as_ref()
    }

    /// Newest element without removing it.
    #[must_use]
    pub fn peek_last(&self) -> Option<&T> {
        if self.len == 0 {
            return None;
        }
        let last = (self.head + self.len - 1) % self.capacity();
        self.slots[last].as_ref()
    }

    /// Drop every element; counters are kept.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.head = 0;
        self.len = 0;
    }

    /// Elements currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the next push overwrites or is rejected.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    /// Maximum elements held.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Fill level in percent, `0.0..=100.0`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)] // queue sizes are far below 2^52
    pub fn usage_percent(&self) -> f64 {
        self.len as f64 / self.capacity() as f64 * 100.0
    }

    /// Elements ever accepted.
    #[must_use]
    pub fn total_added(&self) -> u64 {
        self.total_added
    }

    /// Elements dropped to make room.
    #[must_use]
    pub fn total_overwritten(&self) -> u64 {
        self.total_overwritten
    }

    /// Snapshot of all counters.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            size: self.len,
            capacity: self.capacity(),
            total_added: self.total_added,
            total_overwritten: self.total_overwritten,
            total_rejected: self.total_rejected,
        }
    }

    fn iter(&self) -> impl Iterator<Item = &T> {
        let capacity = self.capacity();
        (0..self.len).filter_map(move |offset| self.slots[(self.head + offset) % capacity].as_ref())
    }
}

impl<T: Clone> RingQueue<T> {
    /// Copy of the queued elements, oldest first.
    #[must_use]
    pub fn to_vec(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }
}
