//! Archive-relative paths.
//!
//! Files are sharded by the first three bytes of their hex name:
//!
//! ```text
//! history/00/00/00/history-0000003f.json
//! bucket/e1/13/f8/bucket-e113f8cc....xdr.gz
//! ```

use henyey_common::Hash256;

/// Path of the HAS file published at `checkpoint`.
pub fn has_path(checkpoint: u32) -> String {
    let hex = format!("{:08x}", checkpoint);
    format!(
        "history/{}/{}/{}/history-{}.json",
        &hex[0..2],
        &hex[2..4],
        &hex[4..6],
        hex
    )
}

/// Path of the gzipped bucket file named by `hash`.
pub fn bucket_path(hash: &Hash256) -> String {
    let hex = hash.to_hex();
    format!(
        "bucket/{}/{}/{}/bucket-{}.xdr.gz",
        &hex[0..2],
        &hex[2..4],
        &hex[4..6],
        hex
    )
}
