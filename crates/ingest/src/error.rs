//! Error types for ingestion.
//!
//! Errors fall into a few groups that callers treat differently:
//!
//! - [`StateError`]: the compactor was fed a self-contradictory history
//!   (double create, double remove, update after remove, restore of an
//!   active entry). This is an upstream data problem.
//! - [`IngestError::MalformedBucket`] and [`IngestError::InvalidChange`]:
//!   corrupt or unsupported input. Never retried.
//! - [`IngestError::Cancelled`]: the caller's cancellation token tripped.
//!   Never wrapped in context, never retried.
//! - Everything else is I/O-shaped and may have gone through retries
//!   before surfacing.
//!
//! End of stream is not an error: every `read` API returns `Ok(None)`.

use henyey_common::Hash256;
use thiserror::Error;

/// Result type for ingestion operations.
pub type Result<T> = std::result::Result<T, IngestError>;

/// An internally inconsistent sequence of entry changes.
///
/// Raised only by [`ChangeCompactor`](crate::ChangeCompactor). The message
/// names the offending ledger key in base64 XDR.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct StateError(pub String);

/// Errors that can occur while reading ledger state.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Requested sequence is not a checkpoint ledger.
    #[error(
        "sequence {sequence} is not a checkpoint ledger (frequency {frequency}); nearest checkpoints are {} and {next}",
        describe_prev(.prev)
    )]
    InvalidCheckpoint {
        /// The rejected sequence.
        sequence: u32,
        /// Nearest checkpoint below the sequence, if there is one.
        prev: Option<u32>,
        /// Nearest checkpoint above the sequence.
        next: u32,
        /// Checkpoint frequency of the archive.
        frequency: u32,
    },

    /// A bucket file violated the bucket format.
    #[error("malformed bucket {hash}: {reason}")]
    MalformedBucket {
        /// Hash of the offending bucket.
        hash: Hash256,
        /// What was wrong, including the record index.
        reason: String,
    },

    /// A bucket named by the checkpoint is missing from the archive.
    #[error("bucket not found in archive: {0}")]
    BucketNotFound(Hash256),

    /// Recomputed bucket list hash differs from the expected one.
    #[error("bucket list hash mismatch: expected {expected}, got {actual}")]
    BucketListHashMismatch {
        /// Hash the caller expected (usually from the ledger header).
        expected: Hash256,
        /// Hash computed from the checkpoint's bucket hashes.
        actual: Hash256,
    },

    /// Compactor state violation.
    #[error(transparent)]
    State(#[from] StateError),

    /// Archive access failed.
    #[error("archive error: {0}")]
    Archive(String),

    /// A change has a shape no producer should emit.
    #[error("invalid change: {0}")]
    InvalidChange(String),

    /// The dedup set failed.
    #[error("dedup set error: {0}")]
    Dedup(String),

    /// Ledger is not available from the backend.
    #[error("ledger {0} not found in backend")]
    LedgerNotFound(u32),

    /// The caller's cancellation token tripped.
    #[error("operation cancelled")]
    Cancelled,

    /// The reader was closed.
    #[error("reader is closed")]
    Closed,

    /// Configuration could not be parsed or is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Error from the shared stream primitives.
    #[error(transparent)]
    Common(#[from] henyey_common::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// XDR error.
    #[error("XDR error: {0}")]
    Xdr(#[from] stellar_xdr::curr::Error),

    /// JSON parse error.
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// An error annotated with the operation that produced it.
    #[error("{context}: {source}")]
    Context {
        /// Operation, bucket hash and record index where applicable.
        context: String,
        /// Underlying failure.
        #[source]
        source: Box<IngestError>,
    },
}

fn describe_prev(prev: &Option<u32>) -> String {
    match prev {
        Some(seq) => seq.to_string(),
        None => "none".to_string(),
    }
}

impl IngestError {
    /// Annotate this error with where it happened.
    ///
    /// Cancellation and close are passed through untouched so callers can
    /// match on them directly.
    pub fn context(self, context: impl Into<String>) -> Self {
        match self {
            IngestError::Cancelled | IngestError::Closed => self,
            other => IngestError::Context {
                context: context.into(),
                source: Box::new(other),
            },
        }
    }

    /// Returns the innermost error, looking through context wrappers.
    pub fn root(&self) -> &IngestError {
        match self {
            IngestError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Returns `true` if this is (or wraps) a compactor [`StateError`].
    pub fn is_state_error(&self) -> bool {
        matches!(self.root(), IngestError::State(_))
    }

    /// Returns `true` if the operation was cancelled by the caller.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), IngestError::Cancelled)
    }
}
