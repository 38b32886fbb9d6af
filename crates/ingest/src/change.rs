//! The [`Change`] data model.
//!
//! A `Change` describes one ledger entry before and after a mutation. Both
//! reconstruction paths (checkpoint snapshots and per-ledger meta) produce
//! changes, so downstream code does not care where they came from.

use std::fmt;

use stellar_xdr::curr::{
    LedgerEntry, LedgerEntryChange, LedgerEntryChanges, LedgerEntryType, LedgerKey, LedgerUpgrade,
};

use crate::keys::{key_bytes, ledger_entry_key, KeyBytes};
use crate::{IngestError, Result};

/// Net effect of a change, derived from its `pre`/`post` shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// `pre` absent, `post` present.
    Created,
    /// Both present.
    Updated,
    /// `pre` present, `post` absent.
    Removed,
    /// An archived entry became active again. Shaped like `Created` but
    /// compacted differently.
    Restored,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeKind::Created => "created",
            ChangeKind::Updated => "updated",
            ChangeKind::Removed => "removed",
            ChangeKind::Restored => "restored",
        };
        f.write_str(name)
    }
}

/// Why a change happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChangeReason {
    #[default]
    Unknown,
    /// Entry state observed in a checkpoint snapshot. The entry may or may
    /// not have been created at that point.
    Snapshot,
    /// Fee charged (or refunded) for a transaction.
    Fee,
    /// Transaction-level change outside any operation.
    Transaction,
    /// Change made by an operation.
    Operation,
    /// Protocol or network upgrade.
    Upgrade,
    /// Entry evicted from the live state.
    Eviction,
}

/// One entry's state before and after a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    /// Type of the entry.
    pub entry_type: LedgerEntryType,
    /// Entry before the change; `None` if it did not exist.
    pub pre: Option<LedgerEntry>,
    /// Entry after the change; `None` if it no longer exists.
    pub post: Option<LedgerEntry>,
    /// Set by producers when an archived entry was restored.
    pub restored: bool,
    /// Why the change happened.
    pub reason: ChangeReason,
    /// Ledger the change belongs to, when known.
    pub ledger_sequence: Option<u32>,
    /// Index of the transaction within the ledger's apply order.
    pub transaction_index: Option<u32>,
    /// Index of the operation within its transaction.
    pub operation_index: Option<u32>,
    /// Upgrade that caused the change, for [`ChangeReason::Upgrade`].
    pub upgrade: Option<LedgerUpgrade>,
}

impl Change {
    fn new(entry_type: LedgerEntryType, pre: Option<LedgerEntry>, post: Option<LedgerEntry>) -> Self {
        Self {
            entry_type,
            pre,
            post,
            restored: false,
            reason: ChangeReason::Unknown,
            ledger_sequence: None,
            transaction_index: None,
            operation_index: None,
            upgrade: None,
        }
    }

    /// An entry that did not exist before.
    pub fn created(post: LedgerEntry) -> Self {
        Self::new(post.data.discriminant(), None, Some(post))
    }

    /// An entry that existed before and after.
    pub fn updated(pre: LedgerEntry, post: LedgerEntry) -> Self {
        Self::new(pre.data.discriminant(), Some(pre), Some(post))
    }

    /// An entry that no longer exists.
    pub fn removed(pre: LedgerEntry) -> Self {
        Self::new(pre.data.discriminant(), Some(pre), None)
    }

    /// An archived entry that became active again.
    pub fn restored(post: LedgerEntry) -> Self {
        let mut change = Self::created(post);
        change.restored = true;
        change
    }

    /// An entry's state as observed in a checkpoint snapshot.
    pub fn snapshot(entry: LedgerEntry) -> Self {
        Self::created(entry).with_reason(ChangeReason::Snapshot)
    }

    pub fn with_reason(mut self, reason: ChangeReason) -> Self {
        self.reason = reason;
        self
    }

    pub fn with_ledger(mut self, sequence: u32) -> Self {
        self.ledger_sequence = Some(sequence);
        self
    }

    pub fn with_transaction(mut self, index: u32) -> Self {
        self.transaction_index = Some(index);
        self
    }

    pub fn with_operation(mut self, index: u32) -> Self {
        self.operation_index = Some(index);
        self
    }

    pub fn with_upgrade(mut self, upgrade: LedgerUpgrade) -> Self {
        self.upgrade = Some(upgrade);
        self
    }

    /// Classify the change.
    ///
    /// Fails for a change with neither `pre` nor `post`, and for a restored
    /// change that is not shaped like a creation.
    pub fn kind(&self) -> Result<ChangeKind> {
        match (&self.pre, &self.post, self.restored) {
            (None, Some(_), true) => Ok(ChangeKind::Restored),
            (_, _, true) => Err(IngestError::InvalidChange(
                "restored change must have a post and no pre".to_string(),
            )),
            (None, Some(_), false) => Ok(ChangeKind::Created),
            (Some(_), Some(_), false) => Ok(ChangeKind::Updated),
            (Some(_), None, false) => Ok(ChangeKind::Removed),
            (None, None, false) => Err(IngestError::InvalidChange(
                "change has neither pre nor post".to_string(),
            )),
        }
    }

    /// Key of the changed entry, taken from `pre` if present.
    pub fn ledger_key(&self) -> Result<LedgerKey> {
        self.pre
            .as_ref()
            .or(self.post.as_ref())
            .map(ledger_entry_key)
            .ok_or_else(|| IngestError::InvalidChange("change has neither pre nor post".to_string()))
    }

    /// Canonical encoding of [`ledger_key`](Self::ledger_key).
    pub fn key_bytes(&self) -> Result<KeyBytes> {
        key_bytes(&self.ledger_key()?)
    }
}

/// Convert raw meta changes into [`Change`]s, sorted by ledger key.
///
/// `Updated` and `Removed` records take their `pre` from the `State`
/// record immediately before them. The sort is stable, so several changes
/// to one key keep their meta order.
pub fn changes_from_ledger_entry_changes(raw: &LedgerEntryChanges) -> Result<Vec<Change>> {
    let mut changes = Vec::with_capacity(raw.0.len());
    let mut state: Option<&LedgerEntry> = None;
    for record in raw.0.iter() {
        match record {
            LedgerEntryChange::State(entry) => {
                state = Some(entry);
                continue;
            }
            LedgerEntryChange::Created(entry) => changes.push(Change::created(entry.clone())),
            LedgerEntryChange::Restored(entry) => changes.push(Change::restored(entry.clone())),
            LedgerEntryChange::Updated(entry) => {
                let pre = state.take().ok_or_else(|| missing_state("updated"))?;
                changes.push(Change::updated(pre.clone(), entry.clone()));
            }
            LedgerEntryChange::Removed(_) => {
                let pre = state.take().ok_or_else(|| missing_state("removed"))?;
                changes.push(Change::removed(pre.clone()));
            }
        }
        state = None;
    }
    sort_changes(&mut changes)?;
    Ok(changes)
}

fn missing_state(what: &str) -> IngestError {
    IngestError::InvalidChange(format!("{} record without a preceding state record", what))
}

/// Stable sort of `changes` by canonical ledger key bytes.
pub fn sort_changes(changes: &mut Vec<Change>) -> Result<()> {
    let mut keyed = changes
        .drain(..)
        .map(|change| Ok((change.key_bytes()?, change)))
        .collect::<Result<Vec<_>>>()?;
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    changes.extend(keyed.into_iter().map(|(_, change)| change));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{account_entry, ttl_entry};
    use stellar_xdr::curr::{LedgerKeyAccount, VecM};

    fn raw(records: Vec<LedgerEntryChange>) -> LedgerEntryChanges {
        LedgerEntryChanges(records.try_into().unwrap_or_default())
    }

    #[test]
    fn test_kind_from_shape() {
        let a = account_entry(1, 10);
        let b = account_entry(1, 20);
        assert_eq!(Change::created(a.clone()).kind().unwrap(), ChangeKind::Created);
        assert_eq!(Change::updated(a.clone(), b).kind().unwrap(), ChangeKind::Updated);
        assert_eq!(Change::removed(a.clone()).kind().unwrap(), ChangeKind::Removed);
        assert_eq!(Change::restored(a.clone()).kind().unwrap(), ChangeKind::Restored);
        assert_eq!(Change::snapshot(a).kind().unwrap(), ChangeKind::Created);
    }

    #[test]
    fn test_empty_change_is_invalid() {
        let mut change = Change::created(account_entry(1, 10));
        change.post = None;
        assert!(matches!(change.kind(), Err(IngestError::InvalidChange(_))));
        assert!(change.ledger_key().is_err());

        let mut restored = Change::restored(account_entry(1, 10));
        restored.pre = Some(account_entry(1, 5));
        assert!(restored.kind().is_err());
    }

    #[test]
    fn test_ledger_key_prefers_pre() {
        let change = Change::removed(account_entry(3, 10));
        let LedgerKey::Account(LedgerKeyAccount { account_id }) = change.ledger_key().unwrap() else {
            panic!("expected account key");
        };
        let LedgerKey::Account(expected) = ledger_entry_key(&account_entry(3, 0)) else {
            unreachable!()
        };
        assert_eq!(account_id, expected.account_id);
        assert_eq!(change.entry_type, LedgerEntryType::Account);
    }

    #[test]
    fn test_state_pairs_with_following_record() {
        let changes = changes_from_ledger_entry_changes(&raw(vec![
            LedgerEntryChange::State(account_entry(1, 100)),
            LedgerEntryChange::Updated(account_entry(1, 90)),
            LedgerEntryChange::State(ttl_entry(2, 50)),
            LedgerEntryChange::Removed(ledger_entry_key(&ttl_entry(2, 50))),
            LedgerEntryChange::Created(account_entry(3, 5)),
        ]))
        .unwrap();

        assert_eq!(changes.len(), 3);
        let updated = changes
            .iter()
            .find(|c| c.kind().unwrap() == ChangeKind::Updated)
            .unwrap();
        assert_eq!(updated.pre, Some(account_entry(1, 100)));
        assert_eq!(updated.post, Some(account_entry(1, 90)));
        let removed = changes
            .iter()
            .find(|c| c.kind().unwrap() == ChangeKind::Removed)
            .unwrap();
        assert_eq!(removed.pre, Some(ttl_entry(2, 50)));
    }

    #[test]
    fn test_sorted_by_key_and_stable() {
        let changes = changes_from_ledger_entry_changes(&raw(vec![
            LedgerEntryChange::Created(ttl_entry(9, 1)),
            LedgerEntryChange::State(account_entry(2, 10)),
            LedgerEntryChange::Updated(account_entry(2, 11)),
            LedgerEntryChange::State(account_entry(2, 11)),
            LedgerEntryChange::Updated(account_entry(2, 12)),
            LedgerEntryChange::Restored(account_entry(1, 7)),
        ]))
        .unwrap();

        let keys: Vec<_> = changes.iter().map(|c| c.key_bytes().unwrap()).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);

        // Two updates of account 2 keep their relative order.
        let posts: Vec<_> = changes
            .iter()
            .filter(|c| c.kind().unwrap() == ChangeKind::Updated)
            .map(|c| c.post.clone().unwrap())
            .collect();
        assert_eq!(posts, vec![account_entry(2, 11), account_entry(2, 12)]);
        assert!(changes.iter().any(|c| c.restored));
    }

    #[test]
    fn test_update_without_state_is_rejected() {
        let err = changes_from_ledger_entry_changes(&raw(vec![LedgerEntryChange::Updated(
            account_entry(1, 1),
        )]))
        .unwrap_err();
        assert!(err.to_string().contains("without a preceding state"));

        let empty = changes_from_ledger_entry_changes(&LedgerEntryChanges(VecM::default())).unwrap();
        assert!(empty.is_empty());
    }
}
