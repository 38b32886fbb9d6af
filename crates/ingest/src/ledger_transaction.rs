//! Per-transaction access to a ledger's close meta.

use stellar_xdr::curr::{
    LedgerCloseMeta, LedgerEntryChanges, OperationMeta, OperationMetaV2, TransactionMeta,
    TransactionResultPair,
};

use crate::change::{changes_from_ledger_entry_changes, Change, ChangeReason};
use crate::ledger_backend::ledger_sequence;
use crate::Result;

/// One transaction's processing record, in apply order.
#[derive(Debug, Clone)]
pub struct LedgerTransaction {
    /// 1-based position in the ledger's apply order.
    pub index: u32,
    pub ledger_sequence: u32,
    pub result: TransactionResultPair,
    /// Changes from charging the fee, applied before the transaction body.
    pub fee_changes: LedgerEntryChanges,
    /// Fee refunds applied after the body (V2 close meta only).
    pub post_apply_fee_changes: LedgerEntryChanges,
    pub meta: TransactionMeta,
}

impl LedgerTransaction {
    fn tag(&self, changes: Vec<Change>, reason: ChangeReason) -> Vec<Change> {
        changes
            .into_iter()
            .map(|change| {
                change
                    .with_reason(reason)
                    .with_ledger(self.ledger_sequence)
                    .with_transaction(self.index)
            })
            .collect()
    }

    /// Changes from charging the transaction's fee.
    pub fn get_fee_changes(&self) -> Result<Vec<Change>> {
        let changes = changes_from_ledger_entry_changes(&self.fee_changes)?;
        Ok(self.tag(changes, ChangeReason::Fee))
    }

    /// Changes from fee refunds after the transaction was applied.
    pub fn get_post_apply_fee_changes(&self) -> Result<Vec<Change>> {
        let changes = changes_from_ledger_entry_changes(&self.post_apply_fee_changes)?;
        Ok(self.tag(changes, ChangeReason::Fee))
    }

    /// Changes made while applying the transaction: transaction-level
    /// changes before the operations, each operation's changes in order,
    /// then transaction-level changes after the operations.
    pub fn get_changes(&self) -> Result<Vec<Change>> {
        let mut changes = Vec::new();
        match &self.meta {
            TransactionMeta::V0(operations) => {
                self.push_operations(&mut changes, operations.iter().map(|op| &op.changes))?;
            }
            TransactionMeta::V1(v1) => {
                self.push_transaction(&mut changes, &v1.tx_changes)?;
                self.push_operations(&mut changes, v1.operations.iter().map(|op| &op.changes))?;
            }
            TransactionMeta::V2(v2) => {
                self.push_transaction(&mut changes, &v2.tx_changes_before)?;
                self.push_operations(&mut changes, operation_changes(&v2.operations))?;
                self.push_transaction(&mut changes, &v2.tx_changes_after)?;
            }
            TransactionMeta::V3(v3) => {
                self.push_transaction(&mut changes, &v3.tx_changes_before)?;
                self.push_operations(&mut changes, operation_changes(&v3.operations))?;
                self.push_transaction(&mut changes, &v3.tx_changes_after)?;
            }
            TransactionMeta::V4(v4) => {
                self.push_transaction(&mut changes, &v4.tx_changes_before)?;
                self.push_operations(&mut changes, v4_operation_changes(&v4.operations))?;
                self.push_transaction(&mut changes, &v4.tx_changes_after)?;
            }
        }
        Ok(changes)
    }

    /// Changes made by operation `index` alone.
    pub fn get_operation_changes(&self, index: u32) -> Result<Vec<Change>> {
        let raw = match &self.meta {
            TransactionMeta::V0(operations) => operations.get(index as usize).map(|op| &op.changes),
            TransactionMeta::V1(v1) => v1.operations.get(index as usize).map(|op| &op.changes),
            TransactionMeta::V2(v2) => v2.operations.get(index as usize).map(|op| &op.changes),
            TransactionMeta::V3(v3) => v3.operations.get(index as usize).map(|op| &op.changes),
            TransactionMeta::V4(v4) => v4.operations.get(index as usize).map(|op| &op.changes),
        };
        match raw {
            Some(raw) => Ok(self.operation(index, raw)?),
            None => Ok(Vec::new()),
        }
    }

    fn push_transaction(&self, out: &mut Vec<Change>, raw: &LedgerEntryChanges) -> Result<()> {
        let changes = changes_from_ledger_entry_changes(raw)?;
        out.extend(self.tag(changes, ChangeReason::Transaction));
        Ok(())
    }

    fn push_operations<'a>(
        &self,
        out: &mut Vec<Change>,
        operations: impl Iterator<Item = &'a LedgerEntryChanges>,
    ) -> Result<()> {
        for (index, raw) in operations.enumerate() {
            out.extend(self.operation(index as u32, raw)?);
        }
        Ok(())
    }

    fn operation(&self, index: u32, raw: &LedgerEntryChanges) -> Result<Vec<Change>> {
        let changes = changes_from_ledger_entry_changes(raw)?;
        Ok(self
            .tag(changes, ChangeReason::Operation)
            .into_iter()
            .map(|change| change.with_operation(index))
            .collect())
    }
}

fn operation_changes(operations: &[OperationMeta]) -> impl Iterator<Item = &LedgerEntryChanges> {
    operations.iter().map(|op| &op.changes)
}

fn v4_operation_changes(
    operations: &[OperationMetaV2],
) -> impl Iterator<Item = &LedgerEntryChanges> {
    operations.iter().map(|op| &op.changes)
}

/// Iterates the transactions of one ledger in apply order.
#[derive(Debug, Clone)]
pub struct LedgerTransactionReader {
    transactions: Vec<LedgerTransaction>,
    position: usize,
}

impl LedgerTransactionReader {
    pub fn new(meta: &LedgerCloseMeta) -> Self {
        let sequence = ledger_sequence(meta);
        let transaction = |i: usize,
                           result: &TransactionResultPair,
                           fee: &LedgerEntryChanges,
                           post_apply_fee: Option<&LedgerEntryChanges>,
                           meta: &TransactionMeta| LedgerTransaction {
            index: i as u32 + 1,
            ledger_sequence: sequence,
            result: result.clone(),
            fee_changes: fee.clone(),
            post_apply_fee_changes: post_apply_fee.cloned().unwrap_or_default(),
            meta: meta.clone(),
        };
        let transactions = match meta {
            LedgerCloseMeta::V0(v0) => v0
                .tx_processing
                .iter()
                .enumerate()
                .map(|(i, tp)| {
                    transaction(i, &tp.result, &tp.fee_processing, None, &tp.tx_apply_processing)
                })
                .collect(),
            LedgerCloseMeta::V1(v1) => v1
                .tx_processing
                .iter()
                .enumerate()
                .map(|(i, tp)| {
                    transaction(i, &tp.result, &tp.fee_processing, None, &tp.tx_apply_processing)
                })
                .collect(),
            LedgerCloseMeta::V2(v2) => v2
                .tx_processing
                .iter()
                .enumerate()
                .map(|(i, tp)| {
                    transaction(
                        i,
                        &tp.result,
                        &tp.fee_processing,
                        Some(&tp.post_tx_apply_fee_processing),
                        &tp.tx_apply_processing,
                    )
                })
                .collect(),
        };
        Self {
            transactions,
            position: 0,
        }
    }

    /// Next transaction, or `None` once all have been returned.
    pub fn read(&mut self) -> Option<&LedgerTransaction> {
        let tx = self.transactions.get(self.position)?;
        self.position += 1;
        Some(tx)
    }

    /// Start again from the first transaction.
    pub fn rewind(&mut self) {
        self.position = 0;
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeKind;
    use crate::test_utils::{
        account_entry, close_meta_v0, close_meta_v2, created_record, state_record,
        updated_record, TxFixture,
    };

    fn payment_tx() -> TxFixture {
        TxFixture {
            fee: vec![state_record(account_entry(1, 1000)), updated_record(account_entry(1, 900))],
            before: vec![state_record(account_entry(1, 900)), updated_record(account_entry(1, 899))],
            operations: vec![
                vec![created_record(account_entry(2, 10))],
                vec![state_record(account_entry(1, 899)), updated_record(account_entry(1, 889))],
            ],
            after: vec![state_record(account_entry(1, 889)), updated_record(account_entry(1, 890))],
            post_apply_fee: vec![
                state_record(account_entry(1, 890)),
                updated_record(account_entry(1, 895)),
            ],
        }
    }

    #[test]
    fn test_changes_follow_apply_order() {
        let meta = close_meta_v2(20, &[payment_tx()], vec![], vec![]);
        let mut reader = LedgerTransactionReader::new(&meta);
        let tx = reader.read().unwrap();
        assert_eq!(tx.index, 1);

        let changes = tx.get_changes().unwrap();
        let reasons: Vec<_> = changes.iter().map(|c| (c.reason, c.operation_index)).collect();
        assert_eq!(
            reasons,
            vec![
                (ChangeReason::Transaction, None),
                (ChangeReason::Operation, Some(0)),
                (ChangeReason::Operation, Some(1)),
                (ChangeReason::Transaction, None),
            ]
        );
        assert_eq!(changes[1].kind().unwrap(), ChangeKind::Created);
        assert!(changes
            .iter()
            .all(|c| c.transaction_index == Some(1) && c.ledger_sequence == Some(20)));
    }

    #[test]
    fn test_fee_changes() {
        let meta = close_meta_v2(20, &[payment_tx()], vec![], vec![]);
        let mut reader = LedgerTransactionReader::new(&meta);
        let tx = reader.read().unwrap();

        let fee = tx.get_fee_changes().unwrap();
        assert_eq!(fee.len(), 1);
        assert_eq!(fee[0].reason, ChangeReason::Fee);
        assert_eq!(fee[0].pre, Some(account_entry(1, 1000)));

        let refund = tx.get_post_apply_fee_changes().unwrap();
        assert_eq!(refund.len(), 1);
        assert_eq!(refund[0].post, Some(account_entry(1, 895)));
    }

    #[test]
    fn test_v0_meta_has_no_post_apply_fees() {
        let meta = close_meta_v0(20, &[payment_tx()], vec![]);
        let mut reader = LedgerTransactionReader::new(&meta);
        let tx = reader.read().unwrap();
        assert!(tx.get_post_apply_fee_changes().unwrap().is_empty());
        assert_eq!(tx.get_fee_changes().unwrap().len(), 1);
    }

    #[test]
    fn test_operation_changes() {
        let meta = close_meta_v2(20, &[payment_tx()], vec![], vec![]);
        let mut reader = LedgerTransactionReader::new(&meta);
        let tx = reader.read().unwrap();

        let op = tx.get_operation_changes(1).unwrap();
        assert_eq!(op.len(), 1);
        assert_eq!(op[0].operation_index, Some(1));
        assert!(tx.get_operation_changes(7).unwrap().is_empty());
    }

    #[test]
    fn test_read_and_rewind() {
        let meta = close_meta_v2(20, &[payment_tx(), TxFixture::default()], vec![], vec![]);
        let mut reader = LedgerTransactionReader::new(&meta);
        assert_eq!(reader.len(), 2);
        assert_eq!(reader.read().unwrap().index, 1);
        assert_eq!(reader.read().unwrap().index, 2);
        assert!(reader.read().is_none());

        reader.rewind();
        assert_eq!(reader.read().unwrap().index, 1);
    }
}
