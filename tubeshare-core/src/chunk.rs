//! Chunk deliveries: provider-side splitting of a record set into sequence-numbered chunks.

use serde::{Deserialize, Serialize};

/// Default chunk length in records.
pub const DEFAULT_CHUNK_LENGTH: usize = 250;

/// One chunk of a logical payload, as handed to the chunk-delivery callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDelivery<P> {
    /// Provider path the payload belongs to (download key).
    pub path: String,
    /// Origin timestamp shared by every chunk of one download.
    pub timestamp: u64,
    /// 1-based.
    pub sequence: u64,
    /// Declared total units of the whole download.
    pub total: u64,
    pub payload: Vec<P>,
}

impl<P> ChunkDelivery<P> {
    pub fn units(&self) -> u64 {
        self.payload.len() as u64
    }

    pub fn is_last(&self, chunk_length: usize) -> bool {
        let len = effective_length(chunk_length) as u64;
        self.sequence
            .saturating_sub(1)
            .saturating_mul(len)
            .saturating_add(self.units())
            >= self.total
    }
}

fn effective_length(chunk_length: usize) -> usize {
    if chunk_length == 0 {
        DEFAULT_CHUNK_LENGTH
    } else {
        chunk_length
    }
}

/// Split `records` into chunks of `chunk_length` (0 = default), sequence numbers 1..=n.
/// An empty record set yields one empty chunk so the consumer still finishes.
pub fn split_into_chunks<P: Clone>(
    path: &str,
    records: &[P],
    chunk_length: usize,
    timestamp: u64,
) -> Vec<ChunkDelivery<P>> {
    let len = effective_length(chunk_length);
    let total = records.len() as u64;
    if records.is_empty() {
        return vec![ChunkDelivery {
            path: path.to_string(),
            timestamp,
            sequence: 1,
            total: 0,
            payload: Vec::new(),
        }];
    }
    records
        .chunks(len)
        .enumerate()
        .map(|(i, part)| ChunkDelivery {
            path: path.to_string(),
            timestamp,
            sequence: i as u64 + 1,
            total,
            payload: part.to_vec(),
        })
        .collect()
}
