//! KeyDir implementation
//!
//! HashMap-based key index with RwLock for concurrency.

use std::collections::HashMap;

use parking_lot::RwLock;

use super::KeyDirEntry;

/// Concurrent key → location map
///
/// Every method is atomic on its own; there is no multi-key transaction.
/// Writers for the same key must be serialized by the caller (last call wins,
/// regardless of timestamps).
#[derive(Debug, Default)]
pub struct KeyDir {
    entries: RwLock<HashMap<Vec<u8>, KeyDirEntry>>,
}

impl KeyDir {
    /// Create a new empty KeyDir
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the entry for `key`
    ///
    /// Returns the entry it replaced, if any.
    pub fn add(&self, key: Vec<u8>, entry: KeyDirEntry) -> Option<KeyDirEntry> {
        self.entries.write().insert(key, entry)
    }

    /// Point lookup (read lock)
    pub fn get(&self, key: &[u8]) -> Option<KeyDirEntry> {
        self.entries.read().get(key).copied()
    }

    /// Check whether `key` is live
    pub fn contains(&self, key: &[u8]) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Remove the entry for `key`; no-op if absent
    pub fn delete(&self, key: &[u8]) -> Option<KeyDirEntry> {
        self.entries.write().remove(key)
    }

    /// Iterate over the keys present at call time
    ///
    /// The key set is copied under the read lock, so iteration always
    /// terminates and never observes concurrent mutation.
    pub fn keys(&self) -> Keys {
        let snapshot: Vec<Vec<u8>> = self.entries.read().keys().cloned().collect();
        Keys {
            inner: snapshot.into_iter(),
        }
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Iterator over a snapshot of the KeyDir's keys
#[derive(Debug)]
pub struct Keys {
    inner: std::vec::IntoIter<Vec<u8>>,
}

impl Iterator for Keys {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for Keys {}
