//! Shared primitives for henyey ingestion.
//!
//! This crate holds the small set of building blocks that the ingestion
//! crates lean on:
//!
//! - [`Hash256`]: the SHA-256 digest type used for bucket and ledger hashes
//! - [`xdr_stream`]: size-prefixed XDR framing, including the hashing
//!   [`BucketStream`] used to read history archive bucket files
//! - [`protocol`]: protocol version gating helpers
//! - [`Error`] / [`Result`]: the common error type

pub mod error;
pub mod protocol;
pub mod types;
pub mod xdr_stream;

pub use error::{Error, Result};
pub use types::Hash256;
pub use xdr_stream::{BucketStream, XdrInputStream, XdrOutputStream};
