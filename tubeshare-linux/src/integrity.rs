//! Integrity: SHA-256 digest over a chunk's encoded records, verified on receive.

use sha2::{Digest, Sha256};

use crate::protocol::TrackRecord;

/// Digest of the bincode encoding of `records`.
pub fn hash_records(records: &[TrackRecord]) -> Result<[u8; 32], bincode::Error> {
    let encoded = bincode::serialize(records)?;
    let mut hasher = Sha256::new();
    hasher.update(&encoded);
    Ok(hasher.finalize().into())
}

pub fn verify_records(records: &[TrackRecord], expected: &[u8; 32]) -> bool {
    matches!(hash_records(records), Ok(h) if h == *expected)
}
