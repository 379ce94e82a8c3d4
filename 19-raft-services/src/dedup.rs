//! Request deduplication tables.
//!
//! Both tables live inside a service's state machine, so they are only
//! mutated by the apply loop, under the same lock as the data they protect.
//! Entries are never removed while the server runs.

use std::collections::{HashMap, HashSet};

use crate::command::RequestId;

/// Binary idempotence: a request id is either executed or not.
#[derive(Debug, Default, Clone)]
pub struct ExecutedSet {
    executed: HashSet<RequestId>,
}

impl ExecutedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, id: &str) -> bool {
        self.executed.contains(id)
    }

    pub fn record(&mut self, id: RequestId) {
        self.executed.insert(id);
    }

    pub fn len(&self) -> usize {
        self.executed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executed.is_empty()
    }
}

/// Monotonic idempotence: one growing counter per client covers every
/// write that client ever issues.
#[derive(Debug, Default, Clone)]
pub struct SequenceTable {
    last_applied: HashMap<RequestId, u64>,
}

impl SequenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest sequence number applied for `id`, if any.
    pub fn lookup(&self, id: &str) -> Option<u64> {
        self.last_applied.get(id).copied()
    }

    /// True when `seq` has already been applied (or overtaken) for `id`.
    pub fn is_duplicate(&self, id: &str, seq: u64) -> bool {
        self.lookup(id).is_some_and(|last| seq <= last)
    }

    /// Records `seq` for `id`. A smaller number never lowers the watermark.
    pub fn record(&mut self, id: RequestId, seq: u64) {
        let last = self.last_applied.entry(id).or_insert(0);
        *last = (*last).max(seq);
    }
}
