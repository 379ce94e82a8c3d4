//! In-memory key-value storage for the KV state machine.
//!
//! This is the data that the log replicates. It has no lock of its own: the
//! owning replica guards it together with the dedup table, so the two change
//! atomically.

use std::collections::BTreeMap;

/// BTreeMap keeps iteration order deterministic, which keeps snapshots of
/// different replicas directly comparable.
#[derive(Debug, Default, Clone)]
pub struct KvStore {
    data: BTreeMap<String, String>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a key-value pair, overwriting any existing value.
    pub fn put(&mut self, key: String, value: String) {
        self.data.insert(key, value);
    }

    /// Concatenates `value` onto the current value; a missing key acts as "".
    pub fn append(&mut self, key: String, value: &str) {
        self.data.entry(key).or_default().push_str(value);
    }

    /// Returns `None` if the key doesn't exist.
    pub fn get(&self, key: &str) -> Option<String> {
        self.data.get(key).cloned()
    }

    /// Clones the entire map so callers never hold the replica lock while
    /// iterating.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.data.clone()
    }
}
