//! Library bridge protocol carried over an open stream tube.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Current protocol version. Sent in Hello.
pub const PROTOCOL_VERSION: u8 = 1;

/// Service name the tube is offered under.
pub const SERVICE: &str = "tubeshare-library";

/// One media record: field name to value.
pub type TrackRecord = BTreeMap<String, String>;

/// All bridge message types. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Hello {
        protocol_version: u8,
        service: String,
    },
    /// Ask the provider to send the records under `path` as chunks.
    GetChunks {
        path: String,
        chunk_length: u32,
    },
    /// One chunk of `path`. `hash` is the SHA-256 of the encoded records.
    ChunkReady {
        path: String,
        timestamp: u64,
        sequence: u64,
        total: u64,
        hash: [u8; 32],
        records: Vec<TrackRecord>,
    },
    ListPlaylists,
    Playlists {
        paths: Vec<String>,
    },
    /// Ask for the file behind the track with this id.
    GetFile {
        id: String,
    },
    /// The file waits for one reader on `address` (raw Unix socket path).
    FileOffered {
        id: String,
        filename: String,
        content_type: String,
        size: u64,
        address: Vec<u8>,
    },
    /// Receiver is done with the file channel, finished or not.
    CloseFile {
        id: String,
    },
    /// `path` is the provider path or file id the failure belongs to.
    Error {
        path: String,
        message: String,
    },
}

pub fn hello() -> Message {
    Message::Hello {
        protocol_version: PROTOCOL_VERSION,
        service: SERVICE.to_string(),
    }
}
