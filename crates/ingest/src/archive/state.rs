//! History Archive State (HAS).
//!
//! The HAS is the JSON file published with every checkpoint. Its
//! `currentBuckets` array lists the live bucket list levels newest first;
//! protocol 23 archives also carry `hotArchiveBuckets`.

use henyey_common::Hash256;
use serde::{Deserialize, Serialize};
use stellar_xdr::curr::BucketListType;

use crate::{IngestError, Result};

/// The bucket list descriptor of one checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryArchiveState {
    /// Format version.
    pub version: u32,

    /// Server that published the archive (e.g. "stellar-core 25.0.1").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,

    /// Checkpoint ledger this state describes.
    pub current_ledger: u32,

    /// Network passphrase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_passphrase: Option<String>,

    /// Live bucket list levels, level 0 first.
    pub current_buckets: Vec<BucketLevel>,

    /// Hot archive bucket list levels, if the archive publishes them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hot_archive_buckets: Option<Vec<BucketLevel>>,
}

/// One level of a bucket list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketLevel {
    /// Newer bucket of the level (hex hash).
    pub curr: String,

    /// Older bucket of the level (hex hash).
    pub snap: String,

    /// Pending merge state. Not needed to read the level.
    #[serde(default)]
    pub next: BucketNext,
}

/// Pending merge of a level (`FutureBucket` in stellar-core).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketNext {
    /// 0 = clear, 1 = output known, 2 = inputs known.
    pub state: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl BucketLevel {
    /// A level with the given buckets and no pending merge.
    pub fn new(curr: Hash256, snap: Hash256) -> Self {
        Self {
            curr: curr.to_hex(),
            snap: snap.to_hex(),
            next: BucketNext::default(),
        }
    }

    fn hashes(&self) -> Result<(Hash256, Hash256)> {
        Ok((parse_hash(&self.curr)?, parse_hash(&self.snap)?))
    }
}

fn parse_hash(hex: &str) -> Result<Hash256> {
    Hash256::from_hex(hex)
        .map_err(|e| IngestError::Archive(format!("invalid bucket hash {:?} in HAS: {}", hex, e)))
}

impl HistoryArchiveState {
    /// Build a state for `ledger` from live bucket levels.
    pub fn new(ledger: u32, levels: Vec<BucketLevel>) -> Self {
        Self {
            version: 2,
            server: None,
            current_ledger: ledger,
            network_passphrase: None,
            current_buckets: levels,
            hot_archive_buckets: None,
        }
    }

    /// Parse a HAS from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize the HAS to pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    fn levels(&self, list: BucketListType) -> &[BucketLevel] {
        match list {
            BucketListType::Live => &self.current_buckets,
            BucketListType::HotArchive => self.hot_archive_buckets.as_deref().unwrap_or(&[]),
        }
    }

    /// Every bucket hash of `list` in processing order: level 0 `curr`,
    /// level 0 `snap`, level 1 `curr`, ... Empty (zero) buckets included.
    pub fn bucket_hashes(&self, list: BucketListType) -> Result<Vec<Hash256>> {
        let mut hashes = Vec::new();
        for level in self.levels(list) {
            let (curr, snap) = level.hashes()?;
            hashes.push(curr);
            hashes.push(snap);
        }
        Ok(hashes)
    }

    /// Hash of the whole bucket list.
    ///
    /// Each level hashes to `SHA256(curr || snap)`; the list hashes to the
    /// SHA-256 of all level hashes concatenated. This is the value a ledger
    /// header commits to.
    pub fn bucket_list_hash(&self, list: BucketListType) -> Result<Hash256> {
        let mut level_hashes = Vec::new();
        for level in self.levels(list) {
            let (curr, snap) = level.hashes()?;
            level_hashes.push(Hash256::hash_parts(&[&curr.0[..], &snap.0[..]]));
        }
        let parts: Vec<&[u8]> = level_hashes.iter().map(|h| h.as_ref()).collect();
        Ok(Hash256::hash_parts(&parts))
    }
}
