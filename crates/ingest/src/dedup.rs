//! Seen-key tracking for checkpoint reads.
//!
//! While a bucket list is streamed newest to oldest, every key that has been
//! emitted (or deleted) is recorded so older versions of it are skipped.
//! Only keys are kept, never values.

use std::collections::HashSet;

use crate::keys::KeyBytes;
use crate::{IngestError, Result};

/// A membership set scoped to one checkpoint read.
///
/// The checkpoint reader drives it from a single task: `open`, then any
/// number of `preload`/`add`/`exist` calls, then `close`.
pub trait DedupSet: Send + Sync {
    /// Acquire whatever the set needs. Called once before use.
    fn open(&mut self) -> Result<()>;

    /// Warm the set for a batch of upcoming lookups. Doing nothing is a
    /// valid implementation.
    fn preload(&mut self, keys: &[&[u8]]) -> Result<()>;

    /// Record `key` as seen. Adding a key twice is harmless.
    fn add(&mut self, key: &[u8]) -> Result<()>;

    /// Returns `true` if `key` has been added.
    fn exist(&mut self, key: &[u8]) -> Result<bool>;

    /// Release the set. The contents are discarded.
    fn close(&mut self) -> Result<()>;
}

/// A [`DedupSet`] holding every key in memory.
#[derive(Debug, Default)]
pub struct MemoryDedupSet {
    keys: Option<HashSet<KeyBytes>>,
}

impl MemoryDedupSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys recorded so far.
    pub fn len(&self) -> usize {
        self.keys.as_ref().map_or(0, HashSet::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn keys(&mut self) -> Result<&mut HashSet<KeyBytes>> {
        self.keys
            .as_mut()
            .ok_or_else(|| IngestError::Dedup("set used before open".to_string()))
    }
}

impl DedupSet for MemoryDedupSet {
    fn open(&mut self) -> Result<()> {
        self.keys = Some(HashSet::new());
        Ok(())
    }

    fn preload(&mut self, _keys: &[&[u8]]) -> Result<()> {
        Ok(())
    }

    fn add(&mut self, key: &[u8]) -> Result<()> {
        let keys = self.keys()?;
        if !keys.contains(key) {
            keys.insert(key.to_vec());
        }
        Ok(())
    }

    fn exist(&mut self, key: &[u8]) -> Result<bool> {
        Ok(self.keys()?.contains(key))
    }

    fn close(&mut self) -> Result<()> {
        self.keys = None;
        Ok(())
    }
}
