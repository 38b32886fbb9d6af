//! Squashing of per-ledger entry changes.
//!
//! A ledger can touch the same entry many times. [`ChangeCompactor`] folds
//! those changes into at most one net change per entry, and rejects
//! sequences that could not have happened (creating an entry twice,
//! updating a removed entry, and so on) with a [`StateError`].
//!
//! Transitions, keyed by the cached change and the incoming one:
//!
//! | cached \ incoming | Created | Updated | Removed | Restored |
//! |---|---|---|---|---|
//! | none | insert | insert | insert | insert |
//! | Created | error | Created, new post | dropped | error |
//! | Updated | error | Updated, new post | Removed, original pre | error |
//! | Removed | Updated, original pre | error | error | Restored |
//! | Restored | error | Restored, new post | dropped or Removed | error |
//!
//! Whether a restore followed by a removal is dropped or reported depends
//! on [`ChangeCompactorConfig::suppress_remove_after_restore_change`].
//!
//! When a TTL entry is updated on top of a cached Created, Updated or
//! Restored change, the merged entry keeps the larger `live_until_ledger_seq`
//! of the two.

use std::collections::HashMap;

use stellar_xdr::curr::{LedgerEntry, LedgerEntryData};

use crate::change::{Change, ChangeKind};
use crate::config::ChangeCompactorConfig;
use crate::keys::{key_base64, KeyBytes};
use crate::{Result, StateError};

/// Folds a ledger's changes into one net change per entry.
///
/// Not thread safe; feed it from the task that drives ingestion of the
/// ledger. If the cache grows too large, drain it with
/// [`get_changes`](Self::get_changes), apply the result and keep going with
/// the same (now empty) compactor.
#[derive(Debug, Default)]
pub struct ChangeCompactor {
    cache: HashMap<KeyBytes, Change>,
    config: ChangeCompactorConfig,
}

impl ChangeCompactor {
    pub fn new(config: ChangeCompactorConfig) -> Self {
        Self {
            cache: HashMap::new(),
            config,
        }
    }

    /// Fold `change` into the cache.
    ///
    /// On error the cache is left as it was.
    pub fn add_change(&mut self, change: Change) -> Result<()> {
        let incoming = change.kind()?;
        let key = change.key_bytes()?;

        let Some(existing) = self.cache.get(&key) else {
            self.cache.insert(key, change);
            return Ok(());
        };

        use ChangeKind::*;
        let merged = match (existing.kind()?, incoming) {
            (Created | Updated | Restored, Created) => {
                return Err(state_error("can't create an entry that already exists", &key))
            }
            (Removed, Created) => {
                // The entry existed before this ledger, so the pair is an update.
                let pre = existing.pre.clone();
                Some(Change { pre, ..change })
            }

            (Removed, Updated) => {
                return Err(state_error(
                    "can't update an entry that was previously removed",
                    &key,
                ))
            }
            (Created | Updated | Restored, Updated) => {
                let mut post = change.post;
                if let (Some(post), Some(previous)) = (post.as_mut(), existing.post.as_ref()) {
                    keep_longest_ttl(post, previous);
                }
                Some(Change {
                    pre: existing.pre.clone(),
                    post,
                    restored: existing.restored,
                    ..change
                })
            }

            (Created, Removed) => None,
            (Updated, Removed) => {
                let pre = existing.pre.clone();
                Some(Change { pre, ..change })
            }
            (Removed, Removed) => {
                return Err(state_error(
                    "can't remove an entry that was previously removed",
                    &key,
                ))
            }
            (Restored, Removed) => {
                if self.config.suppress_remove_after_restore_change {
                    None
                } else {
                    Some(change)
                }
            }

            (Created | Updated | Restored, Restored) => {
                return Err(state_error(
                    "can't restore an entry that is already active",
                    &key,
                ))
            }
            (Removed, Restored) => Some(change),
        };

        match merged {
            Some(change) => {
                self.cache.insert(key, change);
            }
            None => {
                self.cache.remove(&key);
            }
        }
        Ok(())
    }

    /// Drain the net changes, one per entry, in no particular order.
    pub fn get_changes(&mut self) -> Vec<Change> {
        self.cache.drain().map(|(_, change)| change).collect()
    }

    /// Number of entries currently cached.
    pub fn size(&self) -> usize {
        self.cache.len()
    }
}

fn state_error(what: &str, key: &[u8]) -> crate::IngestError {
    StateError(format!("{} (ledger key = {})", what, key_base64(key))).into()
}

/// TTL bumps within a ledger never shorten an entry's lifetime.
fn keep_longest_ttl(post: &mut LedgerEntry, previous: &LedgerEntry) {
    if let (LedgerEntryData::Ttl(next), LedgerEntryData::Ttl(prev)) = (&mut post.data, &previous.data) {
        next.live_until_ledger_seq = next.live_until_ledger_seq.max(prev.live_until_ledger_seq);
    }
}
