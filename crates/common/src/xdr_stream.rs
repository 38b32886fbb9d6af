//! Size-prefixed XDR framing.
//!
//! History archive bucket files and ledger meta streams share one wire
//! format (XDR record marking, RFC 4506):
//!
//! ```text
//! [4-byte big-endian size with continuation bit] [XDR payload]
//! ```
//!
//! Three types live here:
//!
//! - [`XdrOutputStream`] writes frames.
//! - [`XdrInputStream`] reads frames from a plain reader.
//! - [`BucketStream`] reads frames from a (usually gzipped) bucket file while
//!   tracking how far it has read, so a failed read can be resumed from a
//!   fresh stream, and hashing the uncompressed contents so the bucket can
//!   be checked against its content address on close.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use stellar_xdr::curr::{Limits, ReadXdr, WriteXdr};

use crate::{Error, Hash256, Result};

const CONTINUATION_BIT: u8 = 0x80;
const DISCARD_CHUNK: usize = 64 * 1024;

fn frame_header(len: usize) -> io::Result<[u8; 4]> {
    let sz = u32::try_from(len)
        .ok()
        .filter(|sz| *sz < 0x8000_0000)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("XDR payload size {} exceeds maximum (0x80000000)", len),
            )
        })?;
    let mut header = sz.to_be_bytes();
    header[0] |= CONTINUATION_BIT;
    Ok(header)
}

fn frame_size(header: [u8; 4]) -> usize {
    let sz = u32::from_be_bytes([header[0] & !CONTINUATION_BIT, header[1], header[2], header[3]]);
    sz as usize
}

/// Encode a sequence of values as back-to-back frames.
pub fn encode_framed<T: WriteXdr>(values: &[T]) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    for value in values {
        let payload = value
            .to_xdr(Limits::none())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        out.extend_from_slice(&frame_header(payload.len())?);
        out.extend_from_slice(&payload);
    }
    Ok(out)
}

/// An output stream that writes XDR values with size-prefix framing.
pub struct XdrOutputStream {
    writer: BufWriter<Box<dyn Write + Send>>,
}

impl XdrOutputStream {
    /// Create (or truncate) a file and write frames to it.
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self::from_writer(Box::new(file)))
    }

    /// Create an XDR output stream from any writer.
    pub fn from_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: BufWriter::new(writer),
        }
    }

    /// Serialize a value and write it as one frame.
    ///
    /// Returns the number of bytes written (header plus payload).
    pub fn write_one<T: WriteXdr>(&mut self, value: &T) -> io::Result<usize> {
        let payload = value
            .to_xdr(Limits::none())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.writer.write_all(&frame_header(payload.len())?)?;
        self.writer.write_all(&payload)?;
        Ok(4 + payload.len())
    }

    /// Flush buffered frames to the underlying writer.
    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// An input stream that reads XDR values with size-prefix framing.
pub struct XdrInputStream {
    reader: BufReader<Box<dyn Read + Send>>,
}

impl XdrInputStream {
    /// Open an XDR input stream from a file path.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        Ok(Self::from_reader(Box::new(file)))
    }

    /// Create an XDR input stream from any reader.
    pub fn from_reader(reader: Box<dyn Read + Send>) -> Self {
        Self {
            reader: BufReader::new(reader),
        }
    }

    /// Read one XDR value. Returns `None` at a clean end of stream.
    pub fn read_one<T: ReadXdr>(&mut self) -> io::Result<Option<T>> {
        let Some(header) = read_header(&mut self.reader)? else {
            return Ok(None);
        };
        let mut payload = vec![0u8; frame_size(header)];
        self.reader.read_exact(&mut payload)?;
        T::from_xdr(&payload, Limits::none())
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Read every remaining value until end of stream.
    pub fn read_all<T: ReadXdr>(&mut self) -> io::Result<Vec<T>> {
        let mut values = Vec::new();
        while let Some(value) = self.read_one()? {
            values.push(value);
        }
        Ok(values)
    }
}

/// Reads a frame header, distinguishing a clean end of stream (no bytes at
/// all) from a header cut short.
fn read_header<R: Read>(reader: &mut R) -> io::Result<Option<[u8; 4]>> {
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated frame header",
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(Some(header))
}

/// Counts bytes pulled from the raw (possibly compressed) source.
struct CountingReader<R> {
    inner: R,
    count: Arc<AtomicU64>,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

/// A framed reader over one bucket file.
///
/// `bytes_read` counts uncompressed bytes of the frames returned (or skipped
/// by [`discard`](Self::discard)); a freshly opened stream can be advanced to
/// the same position with `discard(bytes_read)`. Every consumed byte also
/// feeds a SHA-256 hasher, and [`close`](Self::close) compares the final
/// digest against the expected hash if one was set.
pub struct BucketStream {
    reader: BufReader<Box<dyn Read + Send>>,
    compressed_read: Arc<AtomicU64>,
    bytes_read: u64,
    hasher: Sha256,
    expected_hash: Option<Hash256>,
}

impl BucketStream {
    /// Stream frames from an uncompressed reader.
    pub fn new(reader: Box<dyn Read + Send>) -> Self {
        Self::build(reader, false)
    }

    /// Stream frames from a gzip-compressed reader.
    pub fn gzip(reader: Box<dyn Read + Send>) -> Self {
        Self::build(reader, true)
    }

    /// Open a gzipped bucket file such as `bucket-<hex>.xdr.gz`.
    pub fn open_gzip(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        Ok(Self::gzip(Box::new(file)))
    }

    fn build(reader: Box<dyn Read + Send>, compressed: bool) -> Self {
        let compressed_read = Arc::new(AtomicU64::new(0));
        let counting = CountingReader {
            inner: reader,
            count: Arc::clone(&compressed_read),
        };
        let decoded: Box<dyn Read + Send> = if compressed {
            Box::new(GzDecoder::new(counting))
        } else {
            Box::new(counting)
        };
        Self {
            reader: BufReader::new(decoded),
            compressed_read,
            bytes_read: 0,
            hasher: Sha256::new(),
            expected_hash: None,
        }
    }

    /// Require the uncompressed contents to hash to `hash` when closed.
    pub fn set_expected_hash(&mut self, hash: Hash256) {
        self.expected_hash = Some(hash);
    }

    /// Uncompressed bytes consumed so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Raw bytes pulled from the underlying source so far.
    ///
    /// Decompression reads ahead, so this runs slightly ahead of the frames
    /// actually returned. Good enough for progress reporting.
    pub fn compressed_bytes_read(&self) -> u64 {
        self.compressed_read.load(Ordering::Relaxed)
    }

    /// Read one XDR value. Returns `None` at a clean end of stream.
    ///
    /// Transport failures come back as [`Error::Io`] and a frame that does
    /// not decode as [`Error::Xdr`]. Either way `bytes_read` is left at the
    /// end of the last value returned.
    pub fn read_one<T: ReadXdr>(&mut self) -> Result<Option<T>> {
        let Some(header) = read_header(&mut self.reader)? else {
            return Ok(None);
        };
        let mut payload = vec![0u8; frame_size(header)];
        self.reader.read_exact(&mut payload)?;
        let value = T::from_xdr(&payload, Limits::none())?;

        self.hasher.update(header);
        self.hasher.update(&payload);
        self.bytes_read += 4 + payload.len() as u64;
        Ok(Some(value))
    }

    /// Skip `n` uncompressed bytes, hashing them as if they had been read.
    ///
    /// Fails with `UnexpectedEof` if the stream ends first.
    pub fn discard(&mut self, n: u64) -> io::Result<u64> {
        let mut buf = vec![0u8; DISCARD_CHUNK];
        let mut remaining = n;
        while remaining > 0 {
            let want = remaining.min(DISCARD_CHUNK as u64) as usize;
            let got = match self.reader.read(&mut buf[..want]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("stream ended after discarding {} of {} bytes", n - remaining, n),
                    ))
                }
                Ok(got) => got,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            self.hasher.update(&buf[..got]);
            self.bytes_read += got as u64;
            remaining -= got as u64;
        }
        Ok(n)
    }

    /// Finish the stream, verifying its content hash if one was expected.
    ///
    /// Any unread bytes are consumed first so the digest covers the whole
    /// file.
    pub fn close(mut self) -> Result<()> {
        let Some(expected) = self.expected_hash else {
            return Ok(());
        };
        let mut buf = vec![0u8; DISCARD_CHUNK];
        loop {
            match self.reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => self.hasher.update(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
        let actual = Hash256::from_digest(self.hasher);
        if actual != expected {
            return Err(Error::HashMismatch {
                expected: expected.to_hex(),
                actual: actual.to_hex(),
            });
        }
        Ok(())
    }
}
