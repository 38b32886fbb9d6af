use henyey_ingest::test_utils::{
    account_entry, close_meta_v0, close_meta_v2, contract_data_entry, created_record, key_of,
    removed_record, restored_record, state_record, ttl_entry, updated_record, upgrade, TxFixture,
};
use henyey_ingest::{
    Change, ChangeCompactor, ChangeCompactorConfig, ChangeKind, ChangeReader, ChangeReason,
    IngestError, LedgerBackend, LedgerChangeReader, MemoryLedgerBackend,
};
use stellar_xdr::curr::{LedgerCloseMeta, LedgerEntryChange, LedgerKey};
use tracing_subscriber::EnvFilter;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn fee(id: u8, before: i64, after: i64) -> Vec<LedgerEntryChange> {
    vec![
        state_record(account_entry(id, before)),
        updated_record(account_entry(id, after)),
    ]
}

fn find(changes: &[Change], key: LedgerKey) -> &Change {
    changes
        .iter()
        .find(|c| c.ledger_key().unwrap() == key)
        .unwrap_or_else(|| panic!("no change for {:?}", key))
}

fn sample_ledger() -> LedgerCloseMeta {
    let payment = TxFixture {
        fee: fee(1, 1_000, 900),
        operations: vec![vec![
            state_record(account_entry(1, 900)),
            updated_record(account_entry(1, 800)),
            state_record(account_entry(2, 0)),
            updated_record(account_entry(2, 100)),
        ]],
        ..Default::default()
    };
    let restore = TxFixture {
        fee: fee(3, 500, 400),
        operations: vec![vec![
            restored_record(contract_data_entry(9)),
            restored_record(ttl_entry(9, 1_000)),
        ]],
        post_apply_fee: fee(3, 400, 450),
        ..Default::default()
    };
    let cleanup = TxFixture {
        fee: fee(4, 10, 5),
        before: vec![created_record(account_entry(5, 1))],
        after: vec![state_record(account_entry(5, 1)), removed_record(&account_entry(5, 1))],
        ..Default::default()
    };
    close_meta_v2(
        100,
        &[payment, restore, cleanup],
        vec![key_of(&contract_data_entry(8)), key_of(&ttl_entry(8, 0))],
        vec![upgrade(
            24,
            vec![state_record(account_entry(6, 1)), updated_record(account_entry(6, 2))],
        )],
    )
}

#[tokio::test]
async fn test_ledger_stream_order() {
    init_logging();
    let backend = MemoryLedgerBackend::new();
    backend.insert(sample_ledger());

    let mut reader = LedgerChangeReader::new(&backend, 100).await.unwrap();
    let mut order = Vec::new();
    while let Some(change) = ChangeReader::read(&mut reader).await.unwrap() {
        order.push((change.reason, change.transaction_index, change.operation_index));
    }

    assert_eq!(
        order,
        vec![
            (ChangeReason::Fee, Some(1), None),
            (ChangeReason::Fee, Some(2), None),
            (ChangeReason::Fee, Some(3), None),
            (ChangeReason::Operation, Some(1), Some(0)),
            (ChangeReason::Operation, Some(1), Some(0)),
            (ChangeReason::Operation, Some(2), Some(0)),
            (ChangeReason::Operation, Some(2), Some(0)),
            (ChangeReason::Fee, Some(2), None),
            (ChangeReason::Transaction, Some(3), None),
            (ChangeReason::Transaction, Some(3), None),
            (ChangeReason::Eviction, None, None),
            (ChangeReason::Eviction, None, None),
            (ChangeReason::Upgrade, None, None),
        ]
    );
    ChangeReader::close(&mut reader).await.unwrap();
}

#[tokio::test]
async fn test_compacting_a_ledger() {
    let backend = MemoryLedgerBackend::new();
    backend.insert(sample_ledger());
    let mut reader = LedgerChangeReader::new(&backend, 100).await.unwrap();

    let mut compactor = ChangeCompactor::new(ChangeCompactorConfig::default());
    while let Some(change) = reader.read().unwrap() {
        compactor.add_change(change).unwrap();
    }
    let changes = compactor.get_changes();

    // Fee and payment fold into one update of the source account.
    let source = find(&changes, key_of(&account_entry(1, 0)));
    assert_eq!(source.kind().unwrap(), ChangeKind::Updated);
    assert_eq!(source.pre, Some(account_entry(1, 1_000)));
    assert_eq!(source.post, Some(account_entry(1, 800)));

    // Restored entries stay restored; the refund lands on the fee update.
    let data = find(&changes, key_of(&contract_data_entry(9)));
    assert_eq!(data.kind().unwrap(), ChangeKind::Restored);
    let refunded = find(&changes, key_of(&account_entry(3, 0)));
    assert_eq!(refunded.post, Some(account_entry(3, 450)));

    // Created and removed within the ledger: nothing.
    assert!(changes
        .iter()
        .all(|c| c.ledger_key().unwrap() != key_of(&account_entry(5, 0))));

    let evicted = find(&changes, key_of(&ttl_entry(8, 0)));
    assert_eq!(evicted.kind().unwrap(), ChangeKind::Removed);
    let upgraded = find(&changes, key_of(&account_entry(6, 0)));
    assert_eq!(upgraded.reason, ChangeReason::Upgrade);
    // 1, 2, 3, 4, 6 accounts; data 9, ttl 9; evicted data 8, ttl 8.
    assert_eq!(changes.len(), 9);
}

#[tokio::test]
async fn test_legacy_close_meta() {
    let backend = MemoryLedgerBackend::new();
    let tx = TxFixture {
        fee: fee(1, 100, 90),
        operations: vec![vec![created_record(account_entry(2, 10))]],
        ..Default::default()
    };
    backend.insert(close_meta_v0(7, &[tx], vec![]));
    assert!(backend.get_ledger(7).await.unwrap().is_some());

    let mut reader = LedgerChangeReader::new(&backend, 7).await.unwrap();
    let first = reader.read().unwrap().unwrap();
    let second = reader.read().unwrap().unwrap();
    assert_eq!(first.reason, ChangeReason::Fee);
    assert_eq!(second.kind().unwrap(), ChangeKind::Created);
    assert!(reader.read().unwrap().is_none());
}

#[tokio::test]
async fn test_unknown_ledger() {
    let backend = MemoryLedgerBackend::new();
    let err = LedgerChangeReader::new(&backend, 1).await.unwrap_err();
    assert!(matches!(err, IngestError::LedgerNotFound(1)));
    assert_eq!(err.to_string(), "ledger 1 not found in backend");
}
