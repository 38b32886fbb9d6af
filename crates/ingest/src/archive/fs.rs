//! A history archive stored in a local directory.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use henyey_common::xdr_stream::encode_framed;
use henyey_common::{BucketStream, Hash256};
use stellar_xdr::curr::WriteXdr;
use tracing::debug;

use super::{bucket_path, has_path, CheckpointManager, HistoryArchive, HistoryArchiveState};
use crate::{IngestConfig, IngestError, Result};

/// An archive rooted at a local directory, using the published layout
/// (`history/..`, `bucket/..`) with gzipped buckets.
///
/// Besides serving reads it can publish states and buckets, which makes it
/// handy for building fixtures and mirrors.
#[derive(Debug, Clone)]
pub struct FsArchive {
    root: PathBuf,
    checkpoints: CheckpointManager,
}

impl FsArchive {
    /// Open an archive rooted at `root` with the default checkpoint frequency.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_checkpoint_manager(root, CheckpointManager::default())
    }

    /// Open an archive rooted at `root` using the checkpoint frequency of
    /// `config`.
    pub fn from_config(root: impl Into<PathBuf>, config: &IngestConfig) -> Self {
        Self::with_checkpoint_manager(root, config.checkpoint_manager())
    }

    /// Open an archive rooted at `root` with custom checkpoint arithmetic.
    pub fn with_checkpoint_manager(root: impl Into<PathBuf>, checkpoints: CheckpointManager) -> Self {
        Self {
            root: root.into(),
            checkpoints,
        }
    }

    /// Root directory of the archive.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_file(&self, hash: &Hash256) -> PathBuf {
        self.root.join(bucket_path(hash))
    }

    /// Publish a HAS at its checkpoint path.
    pub fn put_has(&self, has: &HistoryArchiveState) -> Result<()> {
        let path = self.root.join(has_path(has.current_ledger));
        write_file(&path, has.to_json()?.as_bytes())
    }

    /// Publish a bucket from its uncompressed contents and return its hash.
    ///
    /// Empty contents are the empty bucket: nothing is written and the zero
    /// hash is returned.
    pub fn put_bucket(&self, contents: &[u8]) -> Result<Hash256> {
        if contents.is_empty() {
            return Ok(Hash256::ZERO);
        }
        let hash = Hash256::hash(contents);
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(contents)?;
        write_file(&self.bucket_file(&hash), &encoder.finish()?)?;
        debug!(hash = %hash, bytes = contents.len(), "Published bucket");
        Ok(hash)
    }

    /// Frame `entries` and publish them as one bucket.
    pub fn put_bucket_entries<T: WriteXdr>(&self, entries: &[T]) -> Result<Hash256> {
        self.put_bucket(&encode_framed(entries)?)
    }
}

fn write_file(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, contents)?;
    Ok(())
}

#[async_trait]
impl HistoryArchive for FsArchive {
    async fn get_checkpoint_has(&self, sequence: u32) -> Result<HistoryArchiveState> {
        let path = self.root.join(has_path(sequence));
        let json = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| IngestError::Io(e).context(format!("reading {}", path.display())))?;
        HistoryArchiveState::from_json(&json)
    }

    async fn bucket_exists(&self, hash: &Hash256) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.bucket_file(hash)).await?)
    }

    async fn bucket_size(&self, hash: &Hash256) -> Result<u64> {
        match tokio::fs::metadata(self.bucket_file(hash)).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(IngestError::BucketNotFound(*hash)),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_xdr_stream_for_hash(&self, hash: &Hash256) -> Result<BucketStream> {
        match File::open(self.bucket_file(hash)) {
            Ok(file) => Ok(BucketStream::gzip(Box::new(file))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(IngestError::BucketNotFound(*hash)),
            Err(e) => Err(e.into()),
        }
    }

    fn checkpoint_manager(&self) -> CheckpointManager {
        self.checkpoints
    }
}
