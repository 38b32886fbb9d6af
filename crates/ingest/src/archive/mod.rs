//! History archive access.
//!
//! The checkpoint reader talks to an archive through the [`HistoryArchive`]
//! trait: fetch a checkpoint's [`HistoryArchiveState`], check that buckets
//! exist and how large they are, and open a framed stream over a bucket.
//! [`FsArchive`] implements it over a local directory laid out like a
//! published archive.

mod fs;
mod paths;
mod state;

pub use fs::FsArchive;
pub use paths::{bucket_path, has_path};
pub use state::{BucketLevel, BucketNext, HistoryArchiveState};

use async_trait::async_trait;
use henyey_common::{BucketStream, Hash256};

use crate::{IngestError, Result};

/// Default number of ledgers per checkpoint.
pub const CHECKPOINT_FREQUENCY: u32 = 64;

/// Checkpoint arithmetic for a given checkpoint frequency.
///
/// A sequence `s` is a checkpoint iff `(s + 1) % frequency == 0`, so with
/// the default frequency checkpoints are 63, 127, 191, ...
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointManager {
    frequency: u32,
}

impl Default for CheckpointManager {
    fn default() -> Self {
        Self {
            frequency: CHECKPOINT_FREQUENCY,
        }
    }
}

impl CheckpointManager {
    /// Create a manager for `frequency` ledgers per checkpoint.
    ///
    /// A frequency of zero falls back to the default.
    pub fn new(frequency: u32) -> Self {
        if frequency == 0 {
            return Self::default();
        }
        Self { frequency }
    }

    /// Ledgers per checkpoint.
    pub fn frequency(&self) -> u32 {
        self.frequency
    }

    /// Returns `true` if `seq` is a checkpoint ledger.
    pub fn is_checkpoint(&self, seq: u32) -> bool {
        (u64::from(seq) + 1) % u64::from(self.frequency) == 0
    }

    /// The checkpoint ledger whose range contains `seq`.
    pub fn checkpoint_containing(&self, seq: u32) -> u32 {
        (seq / self.frequency) * self.frequency + (self.frequency - 1)
    }

    /// The latest checkpoint strictly before `seq`, if any.
    pub fn prev_checkpoint(&self, seq: u32) -> Option<u32> {
        let containing = self.checkpoint_containing(seq);
        containing.checked_sub(self.frequency)
    }

    /// The earliest checkpoint strictly after `seq`.
    pub fn next_checkpoint(&self, seq: u32) -> u32 {
        let containing = self.checkpoint_containing(seq);
        if seq < containing {
            containing
        } else {
            containing.saturating_add(self.frequency)
        }
    }

    /// Fails with [`IngestError::InvalidCheckpoint`] unless `seq` is a
    /// checkpoint ledger.
    pub fn validate(&self, seq: u32) -> Result<()> {
        if self.is_checkpoint(seq) {
            return Ok(());
        }
        Err(IngestError::InvalidCheckpoint {
            sequence: seq,
            prev: self.prev_checkpoint(seq),
            next: self.next_checkpoint(seq),
            frequency: self.frequency,
        })
    }
}

/// Read access to a history archive.
#[async_trait]
pub trait HistoryArchive: Send + Sync {
    /// Fetch the bucket list descriptor published at checkpoint `sequence`.
    async fn get_checkpoint_has(&self, sequence: u32) -> Result<HistoryArchiveState>;

    /// Returns `true` if the archive holds the bucket.
    async fn bucket_exists(&self, hash: &Hash256) -> Result<bool>;

    /// Size of the bucket as stored (compressed) in the archive.
    async fn bucket_size(&self, hash: &Hash256) -> Result<u64>;

    /// Open a framed stream over the uncompressed bucket contents.
    async fn get_xdr_stream_for_hash(&self, hash: &Hash256) -> Result<BucketStream>;

    /// Checkpoint arithmetic for this archive.
    fn checkpoint_manager(&self) -> CheckpointManager {
        CheckpointManager::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_validity() {
        let manager = CheckpointManager::default();
        for seq in [63, 127, 191] {
            assert!(manager.is_checkpoint(seq), "{seq} should be a checkpoint");
            assert!(manager.validate(seq).is_ok());
        }
        for seq in [64, 100, 1] {
            assert!(!manager.is_checkpoint(seq), "{seq} should not be a checkpoint");
        }
        assert!(manager.is_checkpoint(u32::MAX));
    }

    #[test]
    fn test_invalid_checkpoint_names_neighbours() {
        let manager = CheckpointManager::default();
        let cases = [(64, Some(63), 127), (100, Some(63), 127), (1, None, 63)];
        for (seq, want_prev, want_next) in cases {
            match manager.validate(seq) {
                Err(IngestError::InvalidCheckpoint {
                    sequence,
                    prev,
                    next,
                    frequency,
                }) => {
                    assert_eq!(sequence, seq);
                    assert_eq!(prev, want_prev);
                    assert_eq!(next, want_next);
                    assert_eq!(frequency, 64);
                }
                other => panic!("unexpected result for {seq}: {other:?}"),
            }
        }
    }

    #[test]
    fn test_neighbours_of_checkpoints() {
        let manager = CheckpointManager::default();
        assert_eq!(manager.prev_checkpoint(63), None);
        assert_eq!(manager.prev_checkpoint(127), Some(63));
        assert_eq!(manager.prev_checkpoint(128), Some(127));
        assert_eq!(manager.next_checkpoint(0), 63);
        assert_eq!(manager.next_checkpoint(63), 127);
        assert_eq!(manager.checkpoint_containing(1_000_000), 1_000_063);
    }

    #[test]
    fn test_custom_frequency() {
        let manager = CheckpointManager::new(8);
        assert!(manager.is_checkpoint(7));
        assert!(manager.is_checkpoint(15));
        assert!(!manager.is_checkpoint(8));
        assert_eq!(manager.prev_checkpoint(10), Some(7));
        assert_eq!(manager.next_checkpoint(10), 15);
        assert_eq!(CheckpointManager::new(0).frequency(), CHECKPOINT_FREQUENCY);
    }
}
