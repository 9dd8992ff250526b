//! Reassembly tracking for one sequence-numbered chunked download.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identity of a download, independent of its key in a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DownloadId(Uuid);

impl DownloadId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DownloadId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DownloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Ordering violations. Any of these aborts the download.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SequenceError {
    #[error("transfer failed, please retry (unexpected timestamp {got}, expected {expected})")]
    UnexpectedTimestamp { expected: u64, got: u64 },
    #[error("transfer failed, please retry (chunk {got} out of sequence, expected {expected})")]
    OutOfSequence { expected: u64, got: u64 },
    #[error("transfer failed, please retry (invalid timestamp 0)")]
    InvalidTimestamp,
    #[error("transfer failed, please retry ({received} units exceed declared total {expected})")]
    Overrun { expected: u64, received: u64 },
}

/// Result of an accepted chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Partial { received: u64, expected: Option<u64> },
    /// This chunk completed the download. Reported once.
    Finished { received: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedDownload {
    id: DownloadId,
    /// 0 until the first chunk.
    timestamp: u64,
    expected: Option<u64>,
    last_sequence: u64,
    received: u64,
    finished_reported: bool,
    processed: bool,
}

impl ChunkedDownload {
    /// Download whose total is declared by its first chunk.
    pub fn new() -> Self {
        Self {
            id: DownloadId::new(),
            timestamp: 0,
            expected: None,
            last_sequence: 0,
            received: 0,
            finished_reported: false,
            processed: false,
        }
    }

    pub fn with_expected(expected: u64) -> Self {
        Self {
            expected: Some(expected),
            ..Self::new()
        }
    }

    /// Apply one chunk. On error nothing changes.
    pub fn update(&mut self, timestamp: u64, sequence: u64, units: u64) -> Result<Progress, SequenceError> {
        self.apply(timestamp, sequence, units, None)
    }

    /// Like `update`, seeding the expected total from `total` when not yet started.
    pub fn update_with_total(
        &mut self,
        timestamp: u64,
        sequence: u64,
        total: u64,
        units: u64,
    ) -> Result<Progress, SequenceError> {
        self.apply(timestamp, sequence, units, Some(total))
    }

    fn apply(
        &mut self,
        timestamp: u64,
        sequence: u64,
        units: u64,
        declared: Option<u64>,
    ) -> Result<Progress, SequenceError> {
        if timestamp == 0 {
            return Err(SequenceError::InvalidTimestamp);
        }
        let mut expected = self.expected;
        if self.is_started() {
            if timestamp != self.timestamp {
                return Err(SequenceError::UnexpectedTimestamp {
                    expected: self.timestamp,
                    got: timestamp,
                });
            }
        } else if expected.is_none() {
            expected = declared;
        }
        if sequence != self.last_sequence + 1 {
            return Err(SequenceError::OutOfSequence {
                expected: self.last_sequence + 1,
                got: sequence,
            });
        }
        let Some(received) = self.received.checked_add(units) else {
            return Err(SequenceError::Overrun {
                expected: expected.unwrap_or(u64::MAX),
                received: u64::MAX,
            });
        };
        if let Some(total) = expected {
            if received > total {
                return Err(SequenceError::Overrun {
                    expected: total,
                    received,
                });
            }
        }

        self.timestamp = timestamp;
        self.expected = expected;
        self.last_sequence = sequence;
        self.received = received;
        if self.is_finished() && !self.finished_reported {
            self.finished_reported = true;
            return Ok(Progress::Finished { received });
        }
        Ok(Progress::Partial { received, expected })
    }

    /// Record that consumer-side work on the finished data is done. False if not finished or already marked.
    pub fn mark_processed(&mut self) -> bool {
        if !self.is_finished() || self.processed {
            return false;
        }
        self.processed = true;
        true
    }

    pub fn id(&self) -> DownloadId {
        self.id
    }

    pub fn is_started(&self) -> bool {
        self.timestamp != 0
    }

    pub fn is_finished(&self) -> bool {
        self.is_started() && self.expected == Some(self.received)
    }

    pub fn is_processed(&self) -> bool {
        self.processed
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn expected(&self) -> Option<u64> {
        self.expected
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }
}

impl Default for ChunkedDownload {
    fn default() -> Self {
        Self::new()
    }
}
