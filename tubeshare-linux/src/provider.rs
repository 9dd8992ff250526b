//! Library provider: serves chunked library and playlist records on the tube's server socket.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tubeshare_core::{split_into_chunks, BridgeAddress, LIBRARY_PATH};

use crate::integrity::hash_records;
use crate::protocol::{hello, Message, TrackRecord, PROTOCOL_VERSION, SERVICE};
use crate::wire::{read_message, write_message};

const PLAYLIST_PREFIX: &str = "/playlist/";

/// Track field holding the local path of the media file.
const FILE_FIELD: &str = "file";
const CONTENT_TYPE_FIELD: &str = "mime_type";
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Library file: track records plus named playlists of track ids.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Library {
    pub tracks: Vec<TrackRecord>,
    #[serde(default)]
    pub playlists: BTreeMap<String, Vec<String>>,
}

impl Library {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("reading library {}", path.display()))?;
        serde_json::from_str(&s).with_context(|| format!("parsing library {}", path.display()))
    }

    pub fn playlist_paths(&self) -> Vec<String> {
        self.playlists
            .keys()
            .map(|name| format!("{}{}", PLAYLIST_PREFIX, name))
            .collect()
    }

    /// Records served under a provider path.
    pub fn records_for(&self, path: &str) -> Option<Vec<TrackRecord>> {
        if path == LIBRARY_PATH {
            return Some(self.tracks.clone());
        }
        let name = path.strip_prefix(PLAYLIST_PREFIX)?;
        let ids = self.playlists.get(name)?;
        Some(
            ids.iter()
                .map(|id| {
                    let mut r = TrackRecord::new();
                    r.insert("id".into(), id.clone());
                    r.insert("playlist".into(), name.to_string());
                    r
                })
                .collect(),
        )
    }
}

/// Library plus the directory its per-file bridge sockets are bound in.
pub struct Provider {
    library: Library,
    file_dir: PathBuf,
    next_offer: AtomicU64,
}

/// File behind a track, ready to be offered.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TrackFile {
    path: PathBuf,
    filename: String,
    content_type: String,
    size: u64,
}

/// One offered file: the task waiting for its reader and the socket it listens on.
struct Offer {
    task: JoinHandle<()>,
    socket: PathBuf,
}

impl Offer {
    fn withdraw(self) {
        self.task.abort();
        let _ = std::fs::remove_file(&self.socket);
    }
}

impl Provider {
    pub fn new(library: Library, file_dir: PathBuf) -> Self {
        Self {
            library,
            file_dir,
            next_offer: AtomicU64::new(1),
        }
    }

    pub fn library(&self) -> &Library {
        &self.library
    }

    async fn track_file(&self, id: &str) -> anyhow::Result<TrackFile> {
        let track = self
            .library
            .tracks
            .iter()
            .find(|t| t.get("id").map(String::as_str) == Some(id))
            .with_context(|| format!("no track {}", id))?;
        let path = PathBuf::from(
            track
                .get(FILE_FIELD)
                .with_context(|| format!("track {} has no file", id))?,
        );
        let meta = tokio::fs::metadata(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        if !meta.is_file() || meta.len() == 0 {
            anyhow::bail!("{} is not a non-empty file", path.display());
        }
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| id.to_string());
        let content_type = track
            .get(CONTENT_TYPE_FIELD)
            .cloned()
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
        Ok(TrackFile {
            path,
            filename,
            content_type,
            size: meta.len(),
        })
    }

    /// Bind a one-reader socket for the track's file and stream the file to whoever connects first.
    async fn offer(&self, id: &str) -> anyhow::Result<(Message, Offer)> {
        let file = self.track_file(id).await?;
        tokio::fs::create_dir_all(&self.file_dir)
            .await
            .with_context(|| format!("creating {}", self.file_dir.display()))?;
        let n = self.next_offer.fetch_add(1, Ordering::Relaxed);
        let socket = self
            .file_dir
            .join(format!("file-{}-{}.sock", std::process::id(), n));
        if socket.exists() {
            std::fs::remove_file(&socket)?;
        }
        let listener =
            UnixListener::bind(&socket).with_context(|| format!("binding {}", socket.display()))?;
        let address = BridgeAddress::Unix(socket.clone());
        info!(event = "file_offered", id, address = %address, size = file.size);
        let msg = Message::FileOffered {
            id: id.to_string(),
            filename: file.filename.clone(),
            content_type: file.content_type.clone(),
            size: file.size,
            address: address.to_bytes(),
        };
        let id = id.to_string();
        let cleanup = socket.clone();
        let task = tokio::spawn(async move {
            match send_file(listener, &file.path).await {
                Ok(sent) => debug!(event = "file_sent", id = %id, bytes = sent),
                Err(e) => warn!(event = "file_send_failed", id = %id, error = %e),
            }
            let _ = tokio::fs::remove_file(&cleanup).await;
        });
        Ok((msg, Offer { task, socket }))
    }
}

async fn send_file(listener: UnixListener, path: &Path) -> std::io::Result<u64> {
    let (mut stream, _) = listener.accept().await?;
    drop(listener);
    let mut file = tokio::fs::File::open(path).await?;
    let sent = tokio::io::copy(&mut file, &mut stream).await?;
    stream.shutdown().await?;
    Ok(sent)
}

/// Non-zero origin timestamp for a fresh download.
fn origin_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
        .max(1)
}

/// Bind the server socket, replacing a stale one, and serve until cancelled.
pub async fn serve(provider: Provider, socket: PathBuf) -> anyhow::Result<()> {
    if let Some(dir) = socket.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    if socket.exists() {
        std::fs::remove_file(&socket).with_context(|| format!("removing stale {}", socket.display()))?;
    }
    let listener = UnixListener::bind(&socket).with_context(|| format!("binding {}", socket.display()))?;
    let address = BridgeAddress::Unix(socket);
    let library = provider.library();
    info!(event = "serving", address = %address, tracks = library.tracks.len(), playlists = library.playlists.len());
    let provider = Arc::new(provider);
    loop {
        let (stream, _) = listener.accept().await?;
        let provider = provider.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, &provider).await {
                warn!(event = "connection_failed", error = %e);
            }
        });
    }
}

/// Answer requests on one bridged connection until the peer hangs up.
/// Offers still open are withdrawn when it returns.
pub async fn handle_connection<S>(stream: S, provider: &Provider) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut offers = HashMap::new();
    let result = answer(stream, provider, &mut offers).await;
    for (_, offer) in offers.drain() {
        offer.withdraw();
    }
    result
}

async fn answer<S>(
    stream: S,
    provider: &Provider,
    offers: &mut HashMap<String, Offer>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let library = provider.library();
    let (mut reader, mut writer) = tokio::io::split(stream);
    while let Some(msg) = read_message(&mut reader).await? {
        match msg {
            Message::Hello {
                protocol_version,
                service,
            } => {
                debug!(event = "hello", protocol_version, service = %service);
                if protocol_version != PROTOCOL_VERSION || service != SERVICE {
                    anyhow::bail!("unsupported peer {} v{}", service, protocol_version);
                }
                write_message(&mut writer, &hello()).await?;
            }
            Message::GetChunks { path, chunk_length } => {
                let Some(records) = library.records_for(&path) else {
                    warn!(event = "unknown_path", path = %path);
                    let err = Message::Error {
                        path,
                        message: "no such path".into(),
                    };
                    write_message(&mut writer, &err).await?;
                    continue;
                };
                let chunks = split_into_chunks(&path, &records, chunk_length as usize, origin_timestamp());
                debug!(event = "sending_chunks", path = %path, chunks = chunks.len(), records = records.len());
                for c in chunks {
                    let hash = hash_records(&c.payload)?;
                    let msg = Message::ChunkReady {
                        path: c.path,
                        timestamp: c.timestamp,
                        sequence: c.sequence,
                        total: c.total,
                        hash,
                        records: c.payload,
                    };
                    write_message(&mut writer, &msg).await?;
                }
            }
            Message::ListPlaylists => {
                let msg = Message::Playlists {
                    paths: library.playlist_paths(),
                };
                write_message(&mut writer, &msg).await?;
            }
            Message::GetFile { id } => match provider.offer(&id).await {
                Ok((msg, offer)) => {
                    if let Some(old) = offers.insert(id, offer) {
                        old.withdraw();
                    }
                    write_message(&mut writer, &msg).await?;
                }
                Err(e) => {
                    warn!(event = "file_unavailable", id = %id, error = %e);
                    let err = Message::Error {
                        path: id,
                        message: format!("{:#}", e),
                    };
                    write_message(&mut writer, &err).await?;
                }
            },
            Message::CloseFile { id } => {
                if let Some(offer) = offers.remove(&id) {
                    debug!(event = "file_closed", id = %id);
                    offer.withdraw();
                }
            }
            other => warn!(event = "unexpected_message", message = ?other),
        }
    }
    debug!(event = "connection_closed");
    Ok(())
}
