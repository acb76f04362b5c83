//! Bounded history of dispatched command fingerprints.

use std::collections::VecDeque;

use crate::command::Fingerprint;

/// Fixed-capacity, insertion-ordered set of already-dispatched fingerprints.
///
/// Once a fingerprint is recorded it must never be dispatched again while it
/// remains in the ledger. At capacity the oldest entry is evicted first —
/// the remote \Seen flag is the durable de-dup mechanism, this only guards
/// against reprocessing within a single run.
#[derive(Debug)]
pub struct ExecutionLedger {
    entries: VecDeque<Fingerprint>,
    capacity: usize,
}

impl ExecutionLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Whether this fingerprint has already been dispatched.
    pub fn contains(&self, fingerprint: Fingerprint) -> bool {
        self.entries.contains(&fingerprint)
    }

    /// Record a dispatched fingerprint, evicting the oldest entry at capacity.
    pub fn record(&mut self, fingerprint: Fingerprint) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(fingerprint);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
