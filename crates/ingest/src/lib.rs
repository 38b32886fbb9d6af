//! Ledger state reconstruction for henyey.
//!
//! This crate turns Stellar history into streams of entry-level
//! [`Change`]s. There are two sources:
//!
//! - **Checkpoint snapshots.** [`CheckpointChangeReader`] walks the bucket
//!   files of a checkpoint ledger, newest first, and emits the live state of
//!   every entry exactly once. Shadowed versions and deleted entries are
//!   skipped by remembering keys (not values) in a [`DedupSet`].
//! - **Single ledgers.** [`LedgerChangeReader`] replays one ledger's
//!   `LedgerCloseMeta` as fee changes, apply-time changes, evictions and
//!   upgrade changes, in that order.
//!
//! A [`ChangeCompactor`] folds many changes to the same entry into one net
//! change, rejecting impossible histories with a [`StateError`].
//!
//! # Checkpoint walk
//!
//! | Record | Key already seen | Key not seen |
//! |--------|------------------|--------------|
//! | `LIVEENTRY` | skipped | emitted, key recorded |
//! | `INITENTRY` | skipped | emitted |
//! | `DEADENTRY` | key recorded | key recorded |
//! | `METAENTRY` | must be the first record | |
//!
//! `LIVEENTRY` keys of the oldest bucket are not recorded; nothing older
//! could be shadowed by them.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use henyey_ingest::{ChangeCompactor, ChangeCompactorConfig, CheckpointChangeReader, FsArchive};
//!
//! # async fn example() -> henyey_ingest::Result<()> {
//! let archive = Arc::new(FsArchive::new("/var/lib/stellar/archive"));
//! let reader = CheckpointChangeReader::builder(archive, 63).build().await?;
//!
//! let mut compactor = ChangeCompactor::new(ChangeCompactorConfig::default());
//! while let Some(change) = reader.read().await? {
//!     compactor.add_change(change)?;
//! }
//! println!("{} entries at ledger 63", compactor.size());
//! # Ok(())
//! # }
//! ```

mod change;
mod checkpoint_reader;
mod compactor;
mod config;
mod dedup;
mod error;
mod keys;
mod ledger_backend;
mod ledger_change_reader;
mod ledger_transaction;
mod reader;

pub mod archive;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

// ============================================================================
// Change model
// ============================================================================

pub use change::{
    changes_from_ledger_entry_changes, sort_changes, Change, ChangeKind, ChangeReason,
};
pub use keys::{
    entry_key_bytes, evicted_entry_from_key, key_base64, key_bytes, ledger_entry_key, KeyBytes,
};

// ============================================================================
// Readers
// ============================================================================

pub use checkpoint_reader::{
    tokio_sleep, CheckpointChangeReader, CheckpointReaderBuilder, SleepFn,
};
pub use dedup::{DedupSet, MemoryDedupSet};
pub use ledger_backend::{ledger_header, ledger_sequence, LedgerBackend, MemoryLedgerBackend};
pub use ledger_change_reader::LedgerChangeReader;
pub use ledger_transaction::{LedgerTransaction, LedgerTransactionReader};
pub use reader::ChangeReader;

// ============================================================================
// Compaction
// ============================================================================

pub use compactor::ChangeCompactor;

// ============================================================================
// Archives
// ============================================================================

pub use archive::{
    CheckpointManager, FsArchive, HistoryArchive, HistoryArchiveState, CHECKPOINT_FREQUENCY,
};

// ============================================================================
// Configuration and errors
// ============================================================================

pub use config::{ChangeCompactorConfig, CheckpointReaderConfig, IngestConfig};
pub use error::{IngestError, Result, StateError};

// Re-exported so callers can name the token passed to
// `CheckpointReaderBuilder::cancellation`.
pub use tokio_util::sync::CancellationToken;
