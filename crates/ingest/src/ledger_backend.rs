//! Sources of `LedgerCloseMeta`.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use henyey_common::XdrInputStream;
use parking_lot::RwLock;
use stellar_xdr::curr::{LedgerCloseMeta, LedgerHeader};
use tracing::debug;

use crate::Result;

/// Header of a close meta, whatever its version.
pub fn ledger_header(meta: &LedgerCloseMeta) -> &LedgerHeader {
    match meta {
        LedgerCloseMeta::V0(v0) => &v0.ledger_header.header,
        LedgerCloseMeta::V1(v1) => &v1.ledger_header.header,
        LedgerCloseMeta::V2(v2) => &v2.ledger_header.header,
    }
}

pub fn ledger_sequence(meta: &LedgerCloseMeta) -> u32 {
    ledger_header(meta).ledger_seq
}

/// Somewhere closed ledgers can be fetched from.
#[async_trait]
pub trait LedgerBackend: Send + Sync {
    /// Close meta of ledger `sequence`, or `None` if the backend does not
    /// have it.
    async fn get_ledger(&self, sequence: u32) -> Result<Option<LedgerCloseMeta>>;
}

/// Close metas held in memory, keyed by ledger sequence.
#[derive(Debug, Default)]
pub struct MemoryLedgerBackend {
    ledgers: RwLock<BTreeMap<u32, LedgerCloseMeta>>,
}

impl MemoryLedgerBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every close meta from a file of size-framed XDR records, the
    /// format of a captive core meta pipe dump.
    pub fn from_file(path: &Path) -> Result<Self> {
        let mut stream = XdrInputStream::open(path)?;
        let metas: Vec<LedgerCloseMeta> = stream.read_all()?;
        debug!(path = %path.display(), ledgers = metas.len(), "Loaded ledger close metas");
        let backend = Self::new();
        for meta in metas {
            backend.insert(meta);
        }
        Ok(backend)
    }

    /// Add or replace the close meta for its ledger.
    pub fn insert(&self, meta: LedgerCloseMeta) {
        self.ledgers.write().insert(ledger_sequence(&meta), meta);
    }

    pub fn len(&self) -> usize {
        self.ledgers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ledgers.read().is_empty()
    }

    /// Lowest and highest ledger held.
    pub fn range(&self) -> Option<(u32, u32)> {
        let ledgers = self.ledgers.read();
        let first = *ledgers.keys().next()?;
        let last = *ledgers.keys().next_back()?;
        Some((first, last))
    }
}

#[async_trait]
impl LedgerBackend for MemoryLedgerBackend {
    async fn get_ledger(&self, sequence: u32) -> Result<Option<LedgerCloseMeta>> {
        Ok(self.ledgers.read().get(&sequence).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{close_meta_v0, close_meta_v2};
    use henyey_common::XdrOutputStream;

    #[tokio::test]
    async fn test_memory_backend_lookup() {
        let backend = MemoryLedgerBackend::new();
        assert!(backend.is_empty());
        assert_eq!(backend.range(), None);

        backend.insert(close_meta_v0(10, &[], vec![]));
        backend.insert(close_meta_v2(12, &[], vec![], vec![]));

        assert_eq!(backend.len(), 2);
        assert_eq!(backend.range(), Some((10, 12)));
        let meta = backend.get_ledger(12).await.unwrap().unwrap();
        assert_eq!(ledger_sequence(&meta), 12);
        assert!(backend.get_ledger(11).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_load_from_framed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledgers.xdr");
        {
            let mut out = XdrOutputStream::create(&path).unwrap();
            out.write_one(&close_meta_v2(5, &[], vec![], vec![])).unwrap();
            out.write_one(&close_meta_v2(6, &[], vec![], vec![])).unwrap();
            out.flush().unwrap();
        }

        let backend = MemoryLedgerBackend::from_file(&path).unwrap();
        assert_eq!(backend.range(), Some((5, 6)));
        assert!(backend.get_ledger(6).await.unwrap().is_some());
    }
}
