//! The common interface of the change readers.

use async_trait::async_trait;

use crate::change::Change;
use crate::Result;

/// A source of [`Change`]s.
///
/// Implemented by [`CheckpointChangeReader`](crate::CheckpointChangeReader)
/// for checkpoint snapshots and by
/// [`LedgerChangeReader`](crate::LedgerChangeReader) for single ledgers, so
/// downstream consumers can drain either the same way:
///
/// ```rust,no_run
/// # use henyey_ingest::{ChangeCompactor, ChangeReader, Result};
/// async fn compact(reader: &mut dyn ChangeReader, compactor: &mut ChangeCompactor) -> Result<()> {
///     while let Some(change) = reader.read().await? {
///         compactor.add_change(change)?;
///     }
///     reader.close().await
/// }
/// ```
#[async_trait]
pub trait ChangeReader: Send {
    /// The next change, or `None` at end of stream.
    async fn read(&mut self) -> Result<Option<Change>>;

    /// Release the reader. Idempotent.
    async fn close(&mut self) -> Result<()>;
}
