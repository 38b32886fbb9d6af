//! Checkpoint snapshot reconstruction.
//!
//! [`CheckpointChangeReader`] streams the live state of every ledger entry
//! at a checkpoint out of the archive's bucket files. Buckets are walked
//! newest to oldest (level 0 `curr`, level 0 `snap`, level 1 `curr`, ...),
//! so the first version of a key that is encountered is its live state:
//!
//! - `LIVEENTRY` / `INITENTRY`: emitted unless the key was already seen.
//! - `DEADENTRY`: marks the key seen and emits nothing, which hides every
//!   older version.
//! - `METAENTRY`: only allowed as the first record of a bucket; carries the
//!   bucket's protocol version.
//!
//! Only keys are remembered (in a [`DedupSet`]), never values. `INITENTRY`
//! keys are not recorded since CAP-0020 guarantees nothing older than them
//! can be live, and `LIVEENTRY` keys of the oldest bucket are not recorded
//! since nothing older is left to read.
//!
//! A producer task reads the buckets and feeds a bounded queue; [`read`]
//! pops from it. The producer is started on the first `read`.
//!
//! [`read`]: CheckpointChangeReader::read

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use henyey_common::protocol::{
    protocol_version_is_before, FIRST_PROTOCOL_SUPPORTING_INITENTRY_AND_METAENTRY,
};
use henyey_common::{BucketStream, Hash256};
use parking_lot::Mutex;
use stellar_xdr::curr::{
    BucketEntry, BucketListType, BucketMetadata, BucketMetadataExt, HotArchiveBucketEntry,
    LedgerEntry, ReadXdr,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::archive::{HistoryArchive, HistoryArchiveState};
use crate::change::Change;
use crate::config::CheckpointReaderConfig;
use crate::dedup::{DedupSet, MemoryDedupSet};
use crate::keys::{entry_key_bytes, key_bytes, KeyBytes};
use crate::reader::ChangeReader;
use crate::{IngestError, Result};

/// Sleep used between retries. Injectable so tests run without waiting.
pub type SleepFn = Arc<dyn Fn(Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// The default [`SleepFn`], backed by the tokio timer.
pub fn tokio_sleep() -> SleepFn {
    Arc::new(|delay| Box::pin(tokio::time::sleep(delay)))
}

/// Bounded exponential backoff for archive I/O.
#[derive(Clone)]
struct Retry {
    max_retries: u32,
    base_delay: Duration,
    sleep: SleepFn,
    cancel: CancellationToken,
}

impl Retry {
    /// Run `op` until it succeeds, sleeping `base_delay * 2^n` between
    /// attempts. Cancellation is never retried.
    async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut delay = self.base_delay;
        let mut attempt = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                return Err(IngestError::Cancelled);
            }
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => e,
            };
            if attempt >= self.max_retries {
                return Err(err.context(format!("{} failed after {} attempts", operation, attempt + 1)));
            }
            attempt += 1;
            warn!(
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Archive operation failed, retrying"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(IngestError::Cancelled),
                _ = (self.sleep)(delay) => {}
            }
            delay = delay.saturating_mul(2);
        }
    }
}

/// A bucket record reduced to what the dedup walk needs.
enum Record {
    Meta(BucketMetadata),
    Entry { key: KeyBytes, kind: EntryRecord },
}

enum EntryRecord {
    Live(LedgerEntry),
    Init(LedgerEntry),
    Dead,
    /// Hot archive: entry evicted to the archive.
    Archived(LedgerEntry),
    /// Hot archive: entry restored to the live list since.
    Unarchived,
}

/// Record types of the two bucket lists.
trait BucketRecord: ReadXdr + Send + 'static {
    const LIST: BucketListType;

    fn into_record(self) -> Result<Record>;
}

impl BucketRecord for BucketEntry {
    const LIST: BucketListType = BucketListType::Live;

    fn into_record(self) -> Result<Record> {
        let (key, kind) = match self {
            BucketEntry::Metaentry(meta) => return Ok(Record::Meta(meta)),
            BucketEntry::Liveentry(entry) => (entry_key_bytes(&entry)?, EntryRecord::Live(entry)),
            BucketEntry::Initentry(entry) => (entry_key_bytes(&entry)?, EntryRecord::Init(entry)),
            BucketEntry::Deadentry(key) => (key_bytes(&key)?, EntryRecord::Dead),
        };
        Ok(Record::Entry { key, kind })
    }
}

impl BucketRecord for HotArchiveBucketEntry {
    const LIST: BucketListType = BucketListType::HotArchive;

    fn into_record(self) -> Result<Record> {
        let (key, kind) = match self {
            HotArchiveBucketEntry::Metaentry(meta) => return Ok(Record::Meta(meta)),
            HotArchiveBucketEntry::Archived(entry) => {
                (entry_key_bytes(&entry)?, EntryRecord::Archived(entry))
            }
            HotArchiveBucketEntry::Live(key) => (key_bytes(&key)?, EntryRecord::Unarchived),
        };
        Ok(Record::Entry { key, kind })
    }
}

/// Why a blocking batch read stopped.
enum ReadOutcome {
    Full,
    Eof,
    Cancelled,
    /// Transport failure; the stream can be reopened and resumed.
    Failed(io::Error),
    /// A complete frame that is not a valid record.
    Undecodable(stellar_xdr::curr::Error),
}

fn read_records<R: ReadXdr>(
    stream: &mut BucketStream,
    limit: usize,
    cancel: &CancellationToken,
) -> (Vec<R>, ReadOutcome) {
    let mut records = Vec::new();
    while records.len() < limit {
        if cancel.is_cancelled() {
            return (records, ReadOutcome::Cancelled);
        }
        match stream.read_one::<R>() {
            Ok(Some(record)) => records.push(record),
            Ok(None) => return (records, ReadOutcome::Eof),
            Err(henyey_common::Error::Xdr(e)) => return (records, ReadOutcome::Undecodable(e)),
            Err(henyey_common::Error::Io(e)) => return (records, ReadOutcome::Failed(e)),
            Err(e) => return (records, ReadOutcome::Failed(io::Error::other(e))),
        }
    }
    (records, ReadOutcome::Full)
}

fn join_error(e: tokio::task::JoinError) -> IngestError {
    IngestError::Io(io::Error::other(e))
}

/// Per-bucket walk state.
#[derive(Default)]
struct BucketCursor {
    /// Index of the next record.
    index: u64,
    /// Protocol version from the bucket's METAENTRY; 0 without one.
    protocol_version: u32,
    emitted: u64,
}

/// The background half of a checkpoint read.
struct BucketProducer {
    archive: Arc<dyn HistoryArchive>,
    /// Non-empty buckets, newest first, with their archive sizes.
    buckets: Vec<(Hash256, u64)>,
    list_type: BucketListType,
    config: CheckpointReaderConfig,
    retry: Retry,
    dedup: Box<dyn DedupSet>,
    sender: mpsc::Sender<Result<LedgerEntry>>,
    bytes_read: Arc<AtomicU64>,
    cancel: CancellationToken,
    closed: CancellationToken,
}

impl BucketProducer {
    async fn run(mut self) {
        let start = Instant::now();
        let streamed = self.stream_buckets().await;
        let closed = self.dedup.close();
        match streamed.and_then(|finished| closed.map(|()| finished)) {
            Ok(true) => info!(
                buckets = self.buckets.len(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Finished streaming checkpoint buckets"
            ),
            Ok(false) => debug!(
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Checkpoint bucket stream stopped before the last bucket"
            ),
            Err(IngestError::Cancelled) => debug!("Checkpoint bucket stream cancelled"),
            Err(e) => {
                warn!(error = %e, "Checkpoint bucket stream failed");
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = self.closed.cancelled() => {}
                    _ = self.sender.send(Err(e)) => {}
                }
            }
        }
    }

    /// Stream every bucket in order. Returns `false` if the reader was
    /// closed or dropped first.
    async fn stream_buckets(&mut self) -> Result<bool> {
        self.dedup.open()?;
        let buckets = self.buckets.clone();
        for (i, (hash, size)) in buckets.iter().enumerate() {
            if self.closed.is_cancelled() {
                return Ok(false);
            }
            let oldest = i + 1 == buckets.len();
            let more = match self.list_type {
                BucketListType::Live => {
                    self.stream_bucket::<BucketEntry>(hash, *size, oldest).await
                }
                BucketListType::HotArchive => {
                    self.stream_bucket::<HotArchiveBucketEntry>(hash, *size, oldest)
                        .await
                }
            }
            .map_err(|e| e.context(format!("bucket {} of {}", i + 1, buckets.len())))?;
            if !more {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Stream one bucket. Returns `false` if the reader went away or was
    /// closed and streaming should stop.
    async fn stream_bucket<R: BucketRecord>(
        &mut self,
        hash: &Hash256,
        size: u64,
        oldest: bool,
    ) -> Result<bool> {
        debug!(hash = %hash, oldest, "Streaming bucket");
        let mut stream = self.open_stream(hash, 0).await?;
        let mut cursor = BucketCursor::default();
        let mut counted = 0u64;

        loop {
            let (next, records, eof) = self.read_batch::<R>(hash, stream, cursor.index).await?;
            stream = next;
            counted = self.count_progress(&stream, counted);

            let records = records
                .into_iter()
                .map(R::into_record)
                .collect::<Result<Vec<_>>>()?;
            {
                let keys: Vec<&[u8]> = records
                    .iter()
                    .filter_map(|record| match record {
                        Record::Entry { key, .. } => Some(key.as_slice()),
                        Record::Meta(_) => None,
                    })
                    .collect();
                self.dedup.preload(&keys)?;
            }

            for record in records {
                if let Some(entry) = self.apply::<R>(hash, record, &mut cursor, oldest)? {
                    if !self.emit(entry).await? {
                        return Ok(false);
                    }
                    cursor.emitted += 1;
                }
                cursor.index += 1;
                if self.closed.is_cancelled() {
                    return Ok(false);
                }
            }
            if eof {
                break;
            }
        }

        if self.config.verify_bucket_hashes {
            tokio::task::spawn_blocking(move || stream.close())
                .await
                .map_err(join_error)?
                .map_err(|e| IngestError::Common(e).context(format!("verifying bucket {}", hash)))?;
        }
        self.bytes_read
            .fetch_add(size.saturating_sub(counted), Ordering::Relaxed);

        debug!(
            hash = %hash,
            records = cursor.index,
            emitted = cursor.emitted,
            "Finished bucket"
        );
        Ok(true)
    }

    fn count_progress(&self, stream: &BucketStream, counted: u64) -> u64 {
        let now = stream.compressed_bytes_read();
        self.bytes_read
            .fetch_add(now.saturating_sub(counted), Ordering::Relaxed);
        counted.max(now)
    }

    /// Open a stream over `hash` positioned `position` bytes in.
    async fn open_stream(&self, hash: &Hash256, position: u64) -> Result<BucketStream> {
        let archive = &self.archive;
        let verify = self.config.verify_bucket_hashes;
        let operation = if position == 0 {
            format!("opening bucket {}", hash)
        } else {
            format!("reopening bucket {} at byte {}", hash, position)
        };
        self.retry
            .run(&operation, || async move {
                let mut stream = archive.get_xdr_stream_for_hash(hash).await?;
                if verify {
                    stream.set_expected_hash(*hash);
                }
                if position == 0 {
                    return Ok(stream);
                }
                let (stream, discarded) = tokio::task::spawn_blocking(move || {
                    let discarded = stream.discard(position);
                    (stream, discarded)
                })
                .await
                .map_err(join_error)?;
                discarded?;
                Ok(stream)
            })
            .await
    }

    /// Read up to one preload batch of records.
    ///
    /// A failed read reopens the bucket and skips to the end of the last
    /// decoded record; after `max_retries` consecutive failures without
    /// progress the error is returned. A record that does not decode is
    /// malformed and never retried. Returns the stream, the records and
    /// whether the bucket is exhausted.
    async fn read_batch<R: BucketRecord>(
        &self,
        hash: &Hash256,
        mut stream: BucketStream,
        first_index: u64,
    ) -> Result<(BucketStream, Vec<R>, bool)> {
        let limit = self.config.preload_batch_size.max(1);
        let mut records: Vec<R> = Vec::new();
        let mut failures = 0u32;
        loop {
            let cancel = self.cancel.clone();
            let want = limit - records.len();
            let (next, (mut got, outcome)) = tokio::task::spawn_blocking(move || {
                let outcome = read_records::<R>(&mut stream, want, &cancel);
                (stream, outcome)
            })
            .await
            .map_err(join_error)?;
            stream = next;
            if !got.is_empty() {
                failures = 0;
            }
            records.append(&mut got);

            match outcome {
                ReadOutcome::Full => return Ok((stream, records, false)),
                ReadOutcome::Eof => return Ok((stream, records, true)),
                ReadOutcome::Cancelled => return Err(IngestError::Cancelled),
                ReadOutcome::Undecodable(e) => {
                    let record = first_index + records.len() as u64;
                    return Err(IngestError::MalformedBucket {
                        hash: *hash,
                        reason: format!("undecodable record (n={}): {}", record, e),
                    });
                }
                ReadOutcome::Failed(e) => {
                    let record = first_index + records.len() as u64;
                    if failures >= self.retry.max_retries {
                        return Err(IngestError::Io(e)
                            .context(format!("reading record {} of bucket {}", record, hash)));
                    }
                    failures += 1;
                    warn!(
                        hash = %hash,
                        record,
                        attempt = failures,
                        error = %e,
                        "Bucket read failed, reopening stream"
                    );
                    // `bytes_read` only covers frames that were returned.
                    let position = stream.bytes_read();
                    stream = self.open_stream(hash, position).await?;
                }
            }
        }
    }

    /// Apply one record to the dedup set; returns the entry to emit, if any.
    fn apply<R: BucketRecord>(
        &mut self,
        hash: &Hash256,
        record: Record,
        cursor: &mut BucketCursor,
        oldest: bool,
    ) -> Result<Option<LedgerEntry>> {
        let malformed = |reason: String| IngestError::MalformedBucket { hash: *hash, reason };
        let (key, kind) = match record {
            Record::Meta(meta) => {
                if cursor.index != 0 {
                    return Err(malformed(format!(
                        "METAENTRY not the first entry (n={})",
                        cursor.index
                    )));
                }
                match meta.ext {
                    BucketMetadataExt::V1(list) if list != R::LIST => {
                        return Err(malformed(format!(
                            "METAENTRY declares a {:?} bucket list while reading the {:?} list",
                            list,
                            R::LIST
                        )))
                    }
                    BucketMetadataExt::V0 if R::LIST == BucketListType::HotArchive => {
                        return Err(malformed(
                            "hot archive METAENTRY does not declare a bucket list type".to_string(),
                        ))
                    }
                    _ => {}
                }
                cursor.protocol_version = meta.ledger_version;
                return Ok(None);
            }
            Record::Entry { key, kind } => (key, kind),
        };

        match kind {
            EntryRecord::Init(entry) => {
                if protocol_version_is_before(
                    cursor.protocol_version,
                    FIRST_PROTOCOL_SUPPORTING_INITENTRY_AND_METAENTRY,
                ) {
                    return Err(malformed(format!(
                        "INITENTRY in a bucket of protocol version {} (n={})",
                        cursor.protocol_version, cursor.index
                    )));
                }
                self.observe(&key, entry, false)
            }
            EntryRecord::Live(entry) | EntryRecord::Archived(entry) => {
                self.observe(&key, entry, !oldest)
            }
            EntryRecord::Dead => {
                self.dedup.add(&key)?;
                Ok(None)
            }
            EntryRecord::Unarchived => {
                if !oldest {
                    self.dedup.add(&key)?;
                }
                Ok(None)
            }
        }
    }

    fn observe(&mut self, key: &[u8], entry: LedgerEntry, mark: bool) -> Result<Option<LedgerEntry>> {
        if self.dedup.exist(key)? {
            return Ok(None);
        }
        if mark {
            self.dedup.add(key)?;
        }
        Ok(Some(entry))
    }

    /// Queue an entry. Returns `false` if nobody is reading any more.
    async fn emit(&self, entry: LedgerEntry) -> Result<bool> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(IngestError::Cancelled),
            _ = self.closed.cancelled() => Ok(false),
            sent = self.sender.send(Ok(entry)) => Ok(sent.is_ok()),
        }
    }
}

/// Builder for [`CheckpointChangeReader`].
pub struct CheckpointReaderBuilder {
    archive: Arc<dyn HistoryArchive>,
    sequence: u32,
    config: CheckpointReaderConfig,
    list_type: BucketListType,
    cancel: CancellationToken,
    dedup: Option<Box<dyn DedupSet>>,
    sleep: SleepFn,
}

impl CheckpointReaderBuilder {
    pub fn config(mut self, config: CheckpointReaderConfig) -> Self {
        self.config = config;
        self
    }

    /// Stream the hot archive bucket list instead of the live one.
    pub fn hot_archive(mut self) -> Self {
        self.list_type = BucketListType::HotArchive;
        self
    }

    /// Abort everything when `token` is cancelled.
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Use `dedup` instead of an in-memory set.
    pub fn dedup_set(mut self, dedup: Box<dyn DedupSet>) -> Self {
        self.dedup = Some(dedup);
        self
    }

    pub fn sleep_fn(mut self, sleep: SleepFn) -> Self {
        self.sleep = sleep;
        self
    }

    /// Validate the checkpoint, fetch its HAS and check every bucket.
    ///
    /// Fails with [`IngestError::InvalidCheckpoint`] for a non-checkpoint
    /// sequence and [`IngestError::BucketNotFound`] if a bucket is missing.
    pub async fn build(self) -> Result<CheckpointChangeReader> {
        let sequence = self.sequence;
        self.archive.checkpoint_manager().validate(sequence)?;

        let retry = Retry {
            max_retries: self.config.max_retries,
            base_delay: self.config.retry_base_delay(),
            sleep: self.sleep,
            cancel: self.cancel.clone(),
        };
        let archive = &self.archive;

        let has = retry
            .run(&format!("fetching history archive state {}", sequence), || {
                archive.get_checkpoint_has(sequence)
            })
            .await?;
        if has.current_ledger != sequence {
            return Err(IngestError::Archive(format!(
                "history archive state for {} describes ledger {}",
                sequence, has.current_ledger
            )));
        }

        let hashes: Vec<Hash256> = has
            .bucket_hashes(self.list_type)?
            .into_iter()
            .filter(|hash| !hash.is_zero())
            .collect();

        let mut buckets = Vec::with_capacity(hashes.len());
        let mut total_size = 0u64;
        for hash in hashes {
            let exists = retry
                .run(&format!("checking bucket {}", hash), || archive.bucket_exists(&hash))
                .await?;
            if !exists {
                return Err(IngestError::BucketNotFound(hash));
            }
            let size = retry
                .run(&format!("sizing bucket {}", hash), || archive.bucket_size(&hash))
                .await?;
            total_size += size;
            buckets.push((hash, size));
        }
        info!(
            sequence,
            list = ?self.list_type,
            buckets = buckets.len(),
            total_size,
            "Prepared checkpoint reader"
        );

        let (sender, receiver) = mpsc::channel(self.config.queue_capacity.max(1));
        let bytes_read = Arc::new(AtomicU64::new(0));
        let closed = CancellationToken::new();
        let producer = BucketProducer {
            archive: Arc::clone(&self.archive),
            buckets,
            list_type: self.list_type,
            config: self.config,
            retry,
            dedup: self.dedup.unwrap_or_else(|| Box::new(MemoryDedupSet::new())),
            sender,
            bytes_read: Arc::clone(&bytes_read),
            cancel: self.cancel.clone(),
            closed: closed.clone(),
        };

        Ok(CheckpointChangeReader {
            sequence,
            has,
            list_type: self.list_type,
            receiver: tokio::sync::Mutex::new(receiver),
            producer: Mutex::new(Some(producer)),
            started: Once::new(),
            bytes_read,
            total_size,
            cancel: self.cancel,
            closed,
        })
    }
}

/// Streams the state of every entry at a checkpoint ledger, each exactly
/// once, as [`Change`]s with only a `post` and
/// [`ChangeReason::Snapshot`](crate::ChangeReason::Snapshot).
///
/// ```rust,no_run
/// # use std::sync::Arc;
/// # use henyey_ingest::{CheckpointChangeReader, FsArchive};
/// # async fn example() -> henyey_ingest::Result<()> {
/// let archive = Arc::new(FsArchive::new("/var/lib/stellar/archive"));
/// let reader = CheckpointChangeReader::builder(archive, 127).build().await?;
/// while let Some(change) = reader.read().await? {
///     println!("{:?}", change.entry_type);
/// }
/// reader.close();
/// # Ok(())
/// # }
/// ```
pub struct CheckpointChangeReader {
    sequence: u32,
    has: HistoryArchiveState,
    list_type: BucketListType,
    receiver: tokio::sync::Mutex<mpsc::Receiver<Result<LedgerEntry>>>,
    producer: Mutex<Option<BucketProducer>>,
    started: Once,
    bytes_read: Arc<AtomicU64>,
    total_size: u64,
    cancel: CancellationToken,
    closed: CancellationToken,
}

impl CheckpointChangeReader {
    /// Start configuring a reader for checkpoint `sequence`.
    pub fn builder(archive: Arc<dyn HistoryArchive>, sequence: u32) -> CheckpointReaderBuilder {
        CheckpointReaderBuilder {
            archive,
            sequence,
            config: CheckpointReaderConfig::default(),
            list_type: BucketListType::Live,
            cancel: CancellationToken::new(),
            dedup: None,
            sleep: tokio_sleep(),
        }
    }

    /// Checkpoint ledger being read.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Bucket list being read.
    pub fn bucket_list_type(&self) -> BucketListType {
        self.list_type
    }

    /// The checkpoint's bucket list descriptor.
    pub fn history_archive_state(&self) -> &HistoryArchiveState {
        &self.has
    }

    fn start(&self) {
        self.started.call_once(|| {
            if let Some(producer) = self.producer.lock().take() {
                tokio::spawn(producer.run());
            }
        });
    }

    /// Next entry, or `None` once every bucket has been streamed.
    ///
    /// Safe to call from several tasks at once; each entry goes to exactly
    /// one caller. After a terminal error has been returned, further calls
    /// report end of stream.
    pub async fn read(&self) -> Result<Option<Change>> {
        if self.closed.is_cancelled() {
            return Err(IngestError::Closed);
        }
        self.start();

        let mut receiver = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(IngestError::Cancelled),
            _ = self.closed.cancelled() => return Err(IngestError::Closed),
            guard = self.receiver.lock() => guard,
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(IngestError::Cancelled),
            _ = self.closed.cancelled() => Err(IngestError::Closed),
            item = receiver.recv() => match item {
                Some(Ok(entry)) => Ok(Some(Change::snapshot(entry).with_ledger(self.sequence))),
                Some(Err(e)) => Err(e),
                None => Ok(None),
            },
        }
    }

    /// Percentage of the checkpoint's bucket bytes read so far.
    ///
    /// Advisory only. A checkpoint without buckets reports 100.
    pub fn progress(&self) -> f64 {
        if self.total_size == 0 {
            return 100.0;
        }
        let read = self.bytes_read.load(Ordering::Relaxed) as f64;
        (read / self.total_size as f64 * 100.0).min(100.0)
    }

    /// Stop the producer after the entry it is working on. Further reads
    /// fail with [`IngestError::Closed`]. Safe to call any number of times.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Check the checkpoint's bucket hashes against the bucket list hash
    /// committed to by the ledger header.
    pub fn verify_bucket_list(&self, expected: Hash256) -> Result<()> {
        let actual = self.has.bucket_list_hash(self.list_type)?;
        if actual != expected {
            return Err(IngestError::BucketListHashMismatch { expected, actual });
        }
        Ok(())
    }
}

impl Drop for CheckpointChangeReader {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

#[async_trait]
impl ChangeReader for CheckpointChangeReader {
    async fn read(&mut self) -> Result<Option<Change>> {
        CheckpointChangeReader::read(self).await
    }

    async fn close(&mut self) -> Result<()> {
        CheckpointChangeReader::close(self);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn recording_sleep() -> (SleepFn, Arc<Mutex<Vec<Duration>>>) {
        let sleeps = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&sleeps);
        let sleep: SleepFn = Arc::new(move |delay| {
            recorded.lock().push(delay);
            Box::pin(async {})
        });
        (sleep, sleeps)
    }

    fn retry(sleep: SleepFn) -> Retry {
        Retry {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            sleep,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_retry_backs_off_exponentially() {
        let (sleep, sleeps) = recording_sleep();
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let result: Result<u32> = retry(sleep)
            .run("flaky", || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 3 {
                    Err(IngestError::Archive("unavailable".into()))
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(
            *sleeps.lock(),
            vec![Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)]
        );
    }

    #[tokio::test]
    async fn test_retry_gives_up() {
        let (sleep, sleeps) = recording_sleep();
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = retry(sleep)
            .run("doomed", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(IngestError::Archive("unavailable".into()))
            })
            .await
            .unwrap_err();

        assert_eq!(counter.load(Ordering::SeqCst), 4);
        assert_eq!(sleeps.lock().len(), 3);
        assert!(err.to_string().contains("doomed failed after 4 attempts"));
        assert!(matches!(err.root(), IngestError::Archive(_)));
    }

    #[tokio::test]
    async fn test_retry_stops_on_cancel() {
        let (sleep, sleeps) = recording_sleep();
        let retry = retry(sleep);
        retry.cancel.cancel();
        let err = retry
            .run("cancelled", || async { Ok::<_, IngestError>(()) })
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(sleeps.lock().is_empty());
    }

    async fn reader_with_bucket(
        entries: &[BucketEntry],
    ) -> (CheckpointChangeReader, BucketProducer) {
        use crate::archive::BucketLevel;
        use crate::test_utils::MemoryArchive;

        let archive = MemoryArchive::new();
        let hash = archive.put_bucket(entries);
        let level = BucketLevel::new(hash, Hash256::ZERO);
        archive.put_has(HistoryArchiveState::new(63, vec![level]));
        let reader = CheckpointChangeReader::builder(Arc::new(archive), 63)
            .build()
            .await
            .unwrap();
        let producer = reader.producer.lock().take().unwrap();
        (reader, producer)
    }

    #[tokio::test]
    async fn test_stream_reports_whether_it_finished() {
        use crate::test_utils::{account_entry, live, meta};
        let entries = [meta(23), live(account_entry(1, 1)), live(account_entry(2, 2))];

        let (_reader, mut producer) = reader_with_bucket(&entries).await;
        assert!(producer.stream_buckets().await.unwrap());

        let (reader, mut producer) = reader_with_bucket(&entries).await;
        reader.close();
        assert!(!producer.stream_buckets().await.unwrap());
    }

    #[test]
    fn test_read_records_stops_at_limit_and_eof() {
        use crate::test_utils::{account_entry, live};
        use henyey_common::xdr_stream::encode_framed;
        use std::io::Cursor;

        let entries: Vec<BucketEntry> = (1..=5).map(|i| live(account_entry(i, 1))).collect();
        let bytes = encode_framed(&entries).unwrap();
        let mut stream = BucketStream::new(Box::new(Cursor::new(bytes)));
        let cancel = CancellationToken::new();

        let (first, outcome) = read_records::<BucketEntry>(&mut stream, 3, &cancel);
        assert_eq!(first.len(), 3);
        assert!(matches!(outcome, ReadOutcome::Full));

        let (rest, outcome) = read_records::<BucketEntry>(&mut stream, 3, &cancel);
        assert_eq!(rest.len(), 2);
        assert!(matches!(outcome, ReadOutcome::Eof));

        let mut garbled = encode_framed(&entries[..2]).unwrap();
        garbled.extend_from_slice(&[0x80, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x63]);
        let mut bad = BucketStream::new(Box::new(Cursor::new(garbled)));
        let (good, outcome) = read_records::<BucketEntry>(&mut bad, 5, &cancel);
        assert_eq!(good.len(), 2);
        assert!(matches!(outcome, ReadOutcome::Undecodable(_)));

        cancel.cancel();
        let (none, outcome) = read_records::<BucketEntry>(&mut stream, 3, &cancel);
        assert!(none.is_empty());
        assert!(matches!(outcome, ReadOutcome::Cancelled));
    }
}
