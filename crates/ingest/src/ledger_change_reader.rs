//! Every change of a single ledger, in application order.
//!
//! [`LedgerChangeReader`] walks a ledger's close meta in four phases:
//!
//! 1. fee changes of every transaction, in apply order
//! 2. apply-time changes of every transaction (transaction-level before,
//!    per-operation, transaction-level after, then fee refunds)
//! 3. entries evicted at the end of the ledger
//! 4. changes made by protocol and network upgrades
//!
//! Nothing is compacted; feed the output to a
//! [`ChangeCompactor`](crate::ChangeCompactor) for net effects.

use std::collections::VecDeque;

use async_trait::async_trait;
use stellar_xdr::curr::{LedgerCloseMeta, LedgerKey, UpgradeEntryMeta};
use tracing::debug;

use crate::change::{changes_from_ledger_entry_changes, Change, ChangeReason};
use crate::keys::evicted_entry_from_key;
use crate::ledger_backend::{ledger_sequence, LedgerBackend};
use crate::ledger_transaction::LedgerTransactionReader;
use crate::reader::ChangeReader;
use crate::{IngestError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    FeeChanges,
    MetaChanges,
    EvictionChanges,
    UpgradeChanges,
    Done,
}

/// Reads the changes of one ledger. Not thread safe.
#[derive(Debug)]
pub struct LedgerChangeReader {
    sequence: u32,
    transactions: LedgerTransactionReader,
    evicted_keys: Vec<LedgerKey>,
    upgrades: Vec<UpgradeEntryMeta>,
    next_upgrade: usize,
    phase: Phase,
    pending: VecDeque<Change>,
    closed: bool,
}

impl LedgerChangeReader {
    /// Fetch ledger `sequence` from `backend`.
    ///
    /// Fails with [`IngestError::LedgerNotFound`] if the backend does not
    /// have it.
    pub async fn new(backend: &dyn LedgerBackend, sequence: u32) -> Result<Self> {
        let meta = backend
            .get_ledger(sequence)
            .await?
            .ok_or(IngestError::LedgerNotFound(sequence))?;
        Ok(Self::from_meta(&meta))
    }

    pub fn from_meta(meta: &LedgerCloseMeta) -> Self {
        let (evicted_keys, upgrades) = match meta {
            LedgerCloseMeta::V0(v0) => (Vec::new(), v0.upgrades_processing.to_vec()),
            LedgerCloseMeta::V1(v1) => (Vec::new(), v1.upgrades_processing.to_vec()),
            LedgerCloseMeta::V2(v2) => (v2.evicted_keys.to_vec(), v2.upgrades_processing.to_vec()),
        };
        let transactions = LedgerTransactionReader::new(meta);
        let sequence = ledger_sequence(meta);
        debug!(
            ledger_seq = sequence,
            transactions = transactions.len(),
            evicted = evicted_keys.len(),
            upgrades = upgrades.len(),
            "Reading ledger changes"
        );
        Self {
            sequence,
            transactions,
            evicted_keys,
            upgrades,
            next_upgrade: 0,
            phase: Phase::FeeChanges,
            pending: VecDeque::new(),
            closed: false,
        }
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Next change, or `None` once the ledger is exhausted.
    pub fn read(&mut self) -> Result<Option<Change>> {
        if self.closed {
            return Err(IngestError::Closed);
        }
        loop {
            if let Some(change) = self.pending.pop_front() {
                return Ok(Some(change));
            }
            match self.phase {
                Phase::FeeChanges => {
                    match self.transactions.read().map(|tx| tx.get_fee_changes()) {
                        Some(changes) => self.pending.extend(changes?),
                        None => {
                            self.transactions.rewind();
                            self.phase = Phase::MetaChanges;
                        }
                    }
                }
                Phase::MetaChanges => {
                    let next = self.transactions.read().map(|tx| {
                        let mut changes = tx.get_changes()?;
                        changes.extend(tx.get_post_apply_fee_changes()?);
                        Ok::<_, IngestError>(changes)
                    });
                    match next {
                        Some(changes) => self.pending.extend(changes?),
                        None => self.phase = Phase::EvictionChanges,
                    }
                }
                Phase::EvictionChanges => {
                    for key in &self.evicted_keys {
                        let change = Change::removed(evicted_entry_from_key(key)?)
                            .with_reason(ChangeReason::Eviction)
                            .with_ledger(self.sequence);
                        self.pending.push_back(change);
                    }
                    self.phase = Phase::UpgradeChanges;
                }
                Phase::UpgradeChanges => match self.upgrades.get(self.next_upgrade) {
                    Some(upgrade) => {
                        self.next_upgrade += 1;
                        let changes = changes_from_ledger_entry_changes(&upgrade.changes)?;
                        self.pending.extend(changes.into_iter().map(|change| {
                            change
                                .with_reason(ChangeReason::Upgrade)
                                .with_ledger(self.sequence)
                                .with_upgrade(upgrade.upgrade.clone())
                        }));
                    }
                    None => self.phase = Phase::Done,
                },
                Phase::Done => return Ok(None),
            }
        }
    }

    /// Further reads fail with [`IngestError::Closed`].
    pub fn close(&mut self) {
        self.closed = true;
        self.pending.clear();
    }
}

#[async_trait]
impl ChangeReader for LedgerChangeReader {
    async fn read(&mut self) -> Result<Option<Change>> {
        LedgerChangeReader::read(self)
    }

    async fn close(&mut self) -> Result<()> {
        LedgerChangeReader::close(self);
        Ok(())
    }
}
