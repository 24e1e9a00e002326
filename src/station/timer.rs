use std::fmt::Debug;

use tracing::trace;

use super::rt::Ustime;

/// Single-threaded deadline queue. At most one pending deadline per key,
/// entries with equal deadlines fire in the order they were armed.
#[derive(Debug)]
pub struct TimerQueue<K> {
    entries: Vec<(Ustime, u64, K)>,
    seq: u64,
}

impl<K: Copy + PartialEq + Debug> TimerQueue<K> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            seq: 0,
        }
    }

    /// Arms `key` at `deadline`, replacing a pending deadline of the same key.
    pub fn set(&mut self, key: K, deadline: Ustime) {
        self.clear(key);
        self.seq += 1;
        let pos = self.entries.partition_point(|e| e.0 <= deadline);
        self.entries.insert(pos, (deadline, self.seq, key));
        trace!(?key, deadline, "timer armed");
    }

    pub fn clear(&mut self, key: K) -> bool {
        match self.entries.iter().position(|e| e.2 == key) {
            Some(i) => {
                self.entries.remove(i);
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self, key: K) -> bool {
        self.entries.iter().any(|e| e.2 == key)
    }

    pub fn deadline(&self, key: K) -> Option<Ustime> {
        self.entries.iter().find(|e| e.2 == key).map(|e| e.0)
    }

    pub fn next_deadline(&self) -> Option<Ustime> {
        self.entries.first().map(|e| e.0)
    }

    /// Removes and returns the earliest key whose deadline is not after `now`.
    pub fn pop_due(&mut self, now: Ustime) -> Option<K> {
        if self.entries.first().map_or(false, |e| e.0 <= now) {
            Some(self.entries.remove(0).2)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Copy + PartialEq + Debug> Default for TimerQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}
