//! Fixtures shared by unit and integration tests.
//!
//! Compiled for this crate's own tests and, with the `test-utils` feature,
//! for the integration tests under `tests/`.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Cursor, Read};
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use henyey_common::xdr_stream::encode_framed;
use henyey_common::{BucketStream, Hash256};
use parking_lot::Mutex;
use stellar_xdr::curr::{
    AccountEntry, AccountEntryExt, AccountId, BucketEntry, BucketListType, BucketMetadata,
    BucketMetadataExt, ContractDataDurability, ContractDataEntry, ContractId, ExtensionPoint,
    GeneralizedTransactionSet, Hash, HotArchiveBucketEntry, LedgerCloseMeta, LedgerCloseMetaExt,
    LedgerCloseMetaV0, LedgerCloseMetaV2, LedgerEntry, LedgerEntryChange, LedgerEntryChanges,
    LedgerEntryData, LedgerEntryExt, LedgerHeader, LedgerHeaderExt, LedgerHeaderHistoryEntry,
    LedgerHeaderHistoryEntryExt, LedgerKey, LedgerUpgrade, OperationMeta, PublicKey, ScAddress,
    ScVal, SequenceNumber, StellarValue, StellarValueExt, String32, Thresholds, TimePoint,
    TransactionMeta, TransactionMetaV3, TransactionResult, TransactionResultExt,
    TransactionResultMeta, TransactionResultMetaV1, TransactionResultPair,
    TransactionResultResult, TransactionSet, TransactionSetV1, TtlEntry, Uint256,
    UpgradeEntryMeta, VecM, WriteXdr,
};

use crate::archive::{CheckpointManager, HistoryArchive, HistoryArchiveState};
use crate::keys::ledger_entry_key;
use crate::{IngestError, Result};

// ---------------------------------------------------------------------------
// Ledger entries
// ---------------------------------------------------------------------------

pub fn account_id(id: u8) -> AccountId {
    AccountId(PublicKey::PublicKeyTypeEd25519(Uint256([id; 32])))
}

pub fn account_entry(id: u8, balance: i64) -> LedgerEntry {
    LedgerEntry {
        last_modified_ledger_seq: 1,
        data: LedgerEntryData::Account(AccountEntry {
            account_id: account_id(id),
            balance,
            seq_num: SequenceNumber(1),
            num_sub_entries: 0,
            inflation_dest: None,
            flags: 0,
            home_domain: String32::default(),
            thresholds: Thresholds([1, 0, 0, 0]),
            signers: VecM::default(),
            ext: AccountEntryExt::V0,
        }),
        ext: LedgerEntryExt::V0,
    }
}

pub fn contract_data_entry(id: u8) -> LedgerEntry {
    LedgerEntry {
        last_modified_ledger_seq: 1,
        data: LedgerEntryData::ContractData(ContractDataEntry {
            ext: ExtensionPoint::V0,
            contract: ScAddress::Contract(ContractId(Hash([id; 32]))),
            key: ScVal::U32(u32::from(id)),
            durability: ContractDataDurability::Persistent,
            val: ScVal::I64(100),
        }),
        ext: LedgerEntryExt::V0,
    }
}

pub fn ttl_entry(id: u8, live_until: u32) -> LedgerEntry {
    LedgerEntry {
        last_modified_ledger_seq: 1,
        data: LedgerEntryData::Ttl(TtlEntry {
            key_hash: Hash([id; 32]),
            live_until_ledger_seq: live_until,
        }),
        ext: LedgerEntryExt::V0,
    }
}

/// `live_until_ledger_seq` of a TTL entry.
pub fn live_until(entry: &LedgerEntry) -> u32 {
    match &entry.data {
        LedgerEntryData::Ttl(ttl) => ttl.live_until_ledger_seq,
        other => panic!("not a TTL entry: {:?}", other.discriminant()),
    }
}

pub fn key_of(entry: &LedgerEntry) -> LedgerKey {
    ledger_entry_key(entry)
}

// ---------------------------------------------------------------------------
// Bucket entries
// ---------------------------------------------------------------------------

pub fn live(entry: LedgerEntry) -> BucketEntry {
    BucketEntry::Liveentry(entry)
}

pub fn init(entry: LedgerEntry) -> BucketEntry {
    BucketEntry::Initentry(entry)
}

pub fn dead(entry: &LedgerEntry) -> BucketEntry {
    BucketEntry::Deadentry(ledger_entry_key(entry))
}

pub fn meta(ledger_version: u32) -> BucketEntry {
    BucketEntry::Metaentry(BucketMetadata {
        ledger_version,
        ext: BucketMetadataExt::V0,
    })
}

pub fn archived(entry: LedgerEntry) -> HotArchiveBucketEntry {
    HotArchiveBucketEntry::Archived(entry)
}

pub fn unarchived(entry: &LedgerEntry) -> HotArchiveBucketEntry {
    HotArchiveBucketEntry::Live(ledger_entry_key(entry))
}

pub fn hot_meta(ledger_version: u32) -> HotArchiveBucketEntry {
    HotArchiveBucketEntry::Metaentry(BucketMetadata {
        ledger_version,
        ext: BucketMetadataExt::V1(BucketListType::HotArchive),
    })
}

// ---------------------------------------------------------------------------
// Ledger close meta
// ---------------------------------------------------------------------------

pub fn state_record(entry: LedgerEntry) -> LedgerEntryChange {
    LedgerEntryChange::State(entry)
}

pub fn created_record(entry: LedgerEntry) -> LedgerEntryChange {
    LedgerEntryChange::Created(entry)
}

pub fn updated_record(entry: LedgerEntry) -> LedgerEntryChange {
    LedgerEntryChange::Updated(entry)
}

pub fn removed_record(entry: &LedgerEntry) -> LedgerEntryChange {
    LedgerEntryChange::Removed(ledger_entry_key(entry))
}

pub fn restored_record(entry: LedgerEntry) -> LedgerEntryChange {
    LedgerEntryChange::Restored(entry)
}

pub fn entry_changes(records: Vec<LedgerEntryChange>) -> LedgerEntryChanges {
    LedgerEntryChanges(records.try_into().unwrap())
}

/// The changes of one transaction, by phase.
#[derive(Debug, Clone, Default)]
pub struct TxFixture {
    pub fee: Vec<LedgerEntryChange>,
    pub before: Vec<LedgerEntryChange>,
    pub operations: Vec<Vec<LedgerEntryChange>>,
    pub after: Vec<LedgerEntryChange>,
    /// Only representable in V2 close meta.
    pub post_apply_fee: Vec<LedgerEntryChange>,
}

impl TxFixture {
    fn meta(&self) -> TransactionMeta {
        let operations: Vec<OperationMeta> = self
            .operations
            .iter()
            .map(|changes| OperationMeta {
                changes: entry_changes(changes.clone()),
            })
            .collect();
        TransactionMeta::V3(TransactionMetaV3 {
            ext: ExtensionPoint::V0,
            tx_changes_before: entry_changes(self.before.clone()),
            operations: operations.try_into().unwrap(),
            tx_changes_after: entry_changes(self.after.clone()),
            soroban_meta: None,
        })
    }

    fn result(index: usize) -> TransactionResultPair {
        TransactionResultPair {
            transaction_hash: Hash([index as u8; 32]),
            result: TransactionResult {
                fee_charged: 100,
                result: TransactionResultResult::TxSuccess(VecM::default()),
                ext: TransactionResultExt::V0,
            },
        }
    }
}

pub fn upgrade(version: u32, changes: Vec<LedgerEntryChange>) -> UpgradeEntryMeta {
    UpgradeEntryMeta {
        upgrade: LedgerUpgrade::Version(version),
        changes: entry_changes(changes),
    }
}

pub fn ledger_header(sequence: u32) -> LedgerHeaderHistoryEntry {
    LedgerHeaderHistoryEntry {
        hash: Hash([0u8; 32]),
        header: LedgerHeader {
            ledger_version: 23,
            previous_ledger_hash: Hash([0u8; 32]),
            scp_value: StellarValue {
                tx_set_hash: Hash([0u8; 32]),
                close_time: TimePoint(0),
                upgrades: VecM::default(),
                ext: StellarValueExt::Basic,
            },
            tx_set_result_hash: Hash([0u8; 32]),
            bucket_list_hash: Hash([0u8; 32]),
            ledger_seq: sequence,
            total_coins: 0,
            fee_pool: 0,
            inflation_seq: 0,
            id_pool: 0,
            base_fee: 100,
            base_reserve: 5_000_000,
            max_tx_set_size: 1000,
            skip_list: std::array::from_fn(|_| Hash([0u8; 32])),
            ext: LedgerHeaderExt::V0,
        },
        ext: LedgerHeaderHistoryEntryExt::V0,
    }
}

pub fn close_meta_v0(
    sequence: u32,
    txs: &[TxFixture],
    upgrades: Vec<UpgradeEntryMeta>,
) -> LedgerCloseMeta {
    let tx_processing: Vec<TransactionResultMeta> = txs
        .iter()
        .enumerate()
        .map(|(i, tx)| TransactionResultMeta {
            result: TxFixture::result(i),
            fee_processing: entry_changes(tx.fee.clone()),
            tx_apply_processing: tx.meta(),
        })
        .collect();
    LedgerCloseMeta::V0(LedgerCloseMetaV0 {
        ledger_header: ledger_header(sequence),
        tx_set: TransactionSet {
            previous_ledger_hash: Hash([0u8; 32]),
            txs: VecM::default(),
        },
        tx_processing: tx_processing.try_into().unwrap(),
        upgrades_processing: upgrades.try_into().unwrap(),
        scp_info: VecM::default(),
    })
}

pub fn close_meta_v2(
    sequence: u32,
    txs: &[TxFixture],
    evicted: Vec<LedgerKey>,
    upgrades: Vec<UpgradeEntryMeta>,
) -> LedgerCloseMeta {
    let tx_processing: Vec<TransactionResultMetaV1> = txs
        .iter()
        .enumerate()
        .map(|(i, tx)| TransactionResultMetaV1 {
            ext: ExtensionPoint::V0,
            result: TxFixture::result(i),
            fee_processing: entry_changes(tx.fee.clone()),
            tx_apply_processing: tx.meta(),
            post_tx_apply_fee_processing: entry_changes(tx.post_apply_fee.clone()),
        })
        .collect();
    LedgerCloseMeta::V2(LedgerCloseMetaV2 {
        ext: LedgerCloseMetaExt::V0,
        ledger_header: ledger_header(sequence),
        tx_set: GeneralizedTransactionSet::V1(TransactionSetV1 {
            previous_ledger_hash: Hash([0u8; 32]),
            phases: VecM::default(),
        }),
        tx_processing: tx_processing.try_into().unwrap(),
        upgrades_processing: upgrades.try_into().unwrap(),
        scp_info: VecM::default(),
        total_byte_size_of_live_soroban_state: 0,
        evicted_keys: evicted.try_into().unwrap(),
    })
}

// ---------------------------------------------------------------------------
// In-memory archive
// ---------------------------------------------------------------------------

/// Reader that fails once `fail_at` bytes have been returned.
struct FailingReader {
    inner: Cursor<Vec<u8>>,
    fail_at: u64,
}

impl Read for FailingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let position = self.inner.position();
        if position >= self.fail_at {
            return Err(io::Error::other("injected read failure"));
        }
        let max = ((self.fail_at - position) as usize).min(buf.len());
        self.inner.read(&mut buf[..max])
    }
}

/// A [`HistoryArchive`] held in memory, with uncompressed buckets and
/// injectable failures.
#[derive(Default)]
pub struct MemoryArchive {
    checkpoints: CheckpointManager,
    states: Mutex<HashMap<u32, HistoryArchiveState>>,
    buckets: Mutex<HashMap<Hash256, Vec<u8>>>,
    read_failures: Mutex<HashMap<Hash256, VecDeque<u64>>>,
    has_failures: AtomicU32,
    exists_failures: AtomicU32,
    size_failures: AtomicU32,
    open_failures: AtomicU32,
    opens: AtomicU32,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_has(&self, has: HistoryArchiveState) {
        self.states.lock().insert(has.current_ledger, has);
    }

    /// Store a bucket and return its hash. An empty bucket hashes to zero
    /// and is not stored.
    pub fn put_bucket<T: WriteXdr>(&self, entries: &[T]) -> Hash256 {
        if entries.is_empty() {
            return Hash256::ZERO;
        }
        let bytes = encode_framed(entries).unwrap();
        let hash = Hash256::hash(&bytes);
        self.buckets.lock().insert(hash, bytes);
        hash
    }

    /// Store raw bytes under `hash`, whatever they hash to.
    pub fn put_raw_bucket(&self, hash: Hash256, bytes: Vec<u8>) {
        self.buckets.lock().insert(hash, bytes);
    }

    pub fn remove_bucket(&self, hash: &Hash256) {
        self.buckets.lock().remove(hash);
    }

    pub fn fail_has(&self, times: u32) {
        self.has_failures.store(times, Ordering::SeqCst);
    }

    pub fn fail_exists(&self, times: u32) {
        self.exists_failures.store(times, Ordering::SeqCst);
    }

    pub fn fail_size(&self, times: u32) {
        self.size_failures.store(times, Ordering::SeqCst);
    }

    pub fn fail_open(&self, times: u32) {
        self.open_failures.store(times, Ordering::SeqCst);
    }

    /// Make the next stream opened for `hash` fail after `offset` bytes.
    /// Each call queues one more failing stream.
    pub fn fail_read_at(&self, hash: Hash256, offset: u64) {
        self.read_failures
            .lock()
            .entry(hash)
            .or_default()
            .push_back(offset);
    }

    /// Streams opened so far.
    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    fn injected(counter: &AtomicU32, what: &str) -> Result<()> {
        let remaining = counter.load(Ordering::SeqCst);
        if remaining > 0 {
            counter.store(remaining - 1, Ordering::SeqCst);
            return Err(IngestError::Archive(format!("injected {} failure", what)));
        }
        Ok(())
    }
}

#[async_trait]
impl HistoryArchive for MemoryArchive {
    async fn get_checkpoint_has(&self, sequence: u32) -> Result<HistoryArchiveState> {
        Self::injected(&self.has_failures, "history archive state")?;
        self.states
            .lock()
            .get(&sequence)
            .cloned()
            .ok_or_else(|| IngestError::Archive(format!("no state for ledger {}", sequence)))
    }

    async fn bucket_exists(&self, hash: &Hash256) -> Result<bool> {
        Self::injected(&self.exists_failures, "exists")?;
        Ok(self.buckets.lock().contains_key(hash))
    }

    async fn bucket_size(&self, hash: &Hash256) -> Result<u64> {
        Self::injected(&self.size_failures, "size")?;
        self.buckets
            .lock()
            .get(hash)
            .map(|bytes| bytes.len() as u64)
            .ok_or(IngestError::BucketNotFound(*hash))
    }

    async fn get_xdr_stream_for_hash(&self, hash: &Hash256) -> Result<BucketStream> {
        Self::injected(&self.open_failures, "open")?;
        let bytes = self
            .buckets
            .lock()
            .get(hash)
            .cloned()
            .ok_or(IngestError::BucketNotFound(*hash))?;
        self.opens.fetch_add(1, Ordering::SeqCst);
        let fail_at = self
            .read_failures
            .lock()
            .get_mut(hash)
            .and_then(VecDeque::pop_front);
        let stream = match fail_at {
            Some(fail_at) => BucketStream::new(Box::new(FailingReader {
                inner: Cursor::new(bytes),
                fail_at,
            })),
            None => BucketStream::new(Box::new(Cursor::new(bytes))),
        };
        Ok(stream)
    }

    fn checkpoint_manager(&self) -> CheckpointManager {
        self.checkpoints
    }
}
