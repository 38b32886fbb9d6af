//! Common error types for henyey.
//!
//! This module provides the unified error type [`enum@Error`] and the convenience
//! type alias [`Result`] used by the shared primitives in this crate.
//!
//! # Example
//!
//! ```rust
//! use henyey_common::{Error, Result};
//!
//! fn validate_frame(data: &[u8]) -> Result<()> {
//!     if data.len() < 4 {
//!         return Err(Error::InvalidData("frame shorter than its header".to_string()));
//!     }
//!     Ok(())
//! }
//! ```

use thiserror::Error;

/// A type alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for henyey primitives.
#[derive(Error, Debug)]
pub enum Error {
    /// XDR encoding/decoding error.
    #[error("XDR error: {0}")]
    Xdr(#[from] stellar_xdr::curr::Error),

    /// I/O error.
    ///
    /// Wraps standard I/O errors from file or stream operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid data error.
    ///
    /// Occurs when data fails validation (wrong format, bad hex, etc.).
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Content hash of a stream did not match the hash it was opened for.
    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        /// Hash the stream was expected to have.
        expected: String,
        /// Hash actually computed over the stream contents.
        actual: String,
    },
}
