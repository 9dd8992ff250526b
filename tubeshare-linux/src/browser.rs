//! Library browser: consumes the provider over the tube's local bridge address,
//! driving `LibraryCore` and writing received records as JSON lines.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{bail, Context};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tubeshare_core::{
    BrowseAction, BrowseState, ChunkDelivery, Contexts, LibraryCore, PayloadQueue, SchedulerEvent,
    Transfer, TransferScheduler, TransferState,
};

use crate::integrity::verify_records;
use crate::protocol::{hello, Message, TrackRecord, PROTOCOL_VERSION, SERVICE};
use crate::wire::{spawn_reader, write_message, Inbound};

pub type Sink = Arc<Mutex<Box<dyn Write + Send>>>;

#[derive(Debug, Clone, Copy)]
pub struct Options {
    pub chunk_length: usize,
    pub max_downloads: usize,
}

/// Records received per provider path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrowseSummary {
    pub records: BTreeMap<String, u64>,
}

/// One outstanding `GetChunks` request.
struct Fetch {
    path: String,
    state: TransferState,
    received: u64,
}

impl Fetch {
    fn new(path: String) -> Self {
        Self {
            path,
            state: TransferState::Queued,
            received: 0,
        }
    }
}

impl Transfer for Fetch {
    type Key = String;

    fn key(&self) -> &String {
        &self.path
    }

    fn state(&self) -> TransferState {
        self.state
    }

    fn set_state(&mut self, state: TransferState) {
        self.state = state;
    }

    fn cancel(&mut self) {
        self.state = TransferState::Cancelled;
    }

    fn bytes_transferred(&self) -> u64 {
        self.received
    }
}

fn record_writer(sink: Sink) -> impl FnMut(Vec<TrackRecord>) -> std::io::Result<()> + Send + 'static {
    move |records| {
        let mut out = sink.lock().unwrap_or_else(PoisonError::into_inner);
        for r in &records {
            serde_json::to_writer(&mut *out, r)?;
            out.write_all(b"\n")?;
        }
        Ok(())
    }
}

struct Session<W> {
    writer: W,
    core: LibraryCore<TrackRecord>,
    scheduler: TransferScheduler<Fetch>,
    queues: HashMap<String, PayloadQueue<Vec<TrackRecord>>>,
    contexts: Contexts,
    sink: Sink,
    processed_tx: mpsc::UnboundedSender<String>,
    summary: BrowseSummary,
}

impl<W: AsyncWrite + Unpin> Session<W> {
    /// Carry out core actions. True once the browse is loaded.
    async fn apply(&mut self, actions: Vec<BrowseAction<TrackRecord>>) -> anyhow::Result<bool> {
        let mut loaded = false;
        for action in actions {
            match action {
                BrowseAction::RequestTube => warn!(event = "tube_already_bridged"),
                BrowseAction::FetchChunks { path, .. } => {
                    let tx = self.processed_tx.clone();
                    let done_path = path.clone();
                    let queue = PayloadQueue::spawn(
                        &self.contexts,
                        record_writer(self.sink.clone()),
                        move |handled| {
                            debug!(event = "download_processed", path = %done_path, payloads = handled);
                            let _ = tx.send(done_path);
                        },
                    );
                    self.queues.insert(path.clone(), queue);
                    self.scheduler.queue(Fetch::new(path.clone()))?;
                    let events = self.scheduler.mark_ready(&path);
                    self.on_scheduler(events).await?;
                }
                BrowseAction::ProcessPayload {
                    path,
                    sequence,
                    payload,
                } => {
                    let n = payload.len() as u64;
                    self.scheduler.registry().with(&path, |f| f.received += n);
                    self.scheduler.progress(n);
                    *self.summary.records.entry(path.clone()).or_default() += n;
                    let pushed = self.queues.get(&path).map(|q| q.push(payload)).unwrap_or(false);
                    if !pushed {
                        warn!(event = "payload_dropped", path = %path, sequence);
                    }
                }
                BrowseAction::DownloadFinished { path } => {
                    if let Some(mut queue) = self.queues.remove(&path) {
                        queue.finish();
                    }
                    let events = self.scheduler.finish(&path, TransferState::Completed);
                    self.on_scheduler(events).await?;
                }
                BrowseAction::ListPlaylists => {
                    write_message(&mut self.writer, &Message::ListPlaylists).await?;
                }
                BrowseAction::StateChanged(state) => {
                    debug!(event = "browse_state", state = ?state);
                    loaded = state == BrowseState::Loaded;
                }
                BrowseAction::Failed(e) => {
                    self.scheduler.cancel_all();
                    return Err(e.into());
                }
            }
        }
        Ok(loaded)
    }

    async fn on_scheduler(&mut self, events: Vec<SchedulerEvent<String>>) -> anyhow::Result<()> {
        for event in events {
            match event {
                SchedulerEvent::Start(path) => {
                    let chunk_length = u32::try_from(self.core.chunk_length()).unwrap_or(u32::MAX);
                    write_message(&mut self.writer, &Message::GetChunks { path, chunk_length }).await?;
                }
                SchedulerEvent::Finished(path, state) => {
                    debug!(event = "fetch_finished", path = %path, state = ?state)
                }
                SchedulerEvent::Completed => {
                    let stats = self.scheduler.stats();
                    debug!(event = "fetches_completed", total = stats.total, records = stats.bytes_transferred);
                }
            }
        }
        Ok(())
    }

    fn on_message(&mut self, msg: Message) -> anyhow::Result<Vec<BrowseAction<TrackRecord>>> {
        match msg {
            Message::ChunkReady {
                path,
                timestamp,
                sequence,
                total,
                hash,
                records,
            } => {
                if !verify_records(&records, &hash) {
                    self.scheduler.finish(&path, TransferState::Failed);
                    bail!("digest mismatch in {} chunk {}", path, sequence);
                }
                Ok(self.core.on_chunk(ChunkDelivery {
                    path,
                    timestamp,
                    sequence,
                    total,
                    payload: records,
                }))
            }
            Message::Playlists { paths } => Ok(self.core.load_playlists(&paths)),
            Message::Error { path, message } => {
                self.scheduler.finish(&path, TransferState::Failed);
                bail!("provider failed {}: {}", path, message);
            }
            other => {
                warn!(event = "unexpected_message", message = ?other);
                Ok(Vec::new())
            }
        }
    }
}

/// Wait for the provider's answer to our Hello.
pub(crate) async fn expect_hello(inbound: &mut Inbound) -> anyhow::Result<()> {
    match inbound.recv().await {
        Some(Ok(Message::Hello {
            protocol_version,
            service,
        })) if protocol_version == PROTOCOL_VERSION && service == SERVICE => Ok(()),
        Some(Ok(other)) => bail!("unexpected handshake {:?}", other),
        Some(Err(e)) => Err(e.into()),
        None => bail!("provider closed before handshake"),
    }
}

/// Browse the library over `stream`, writing every received record to `sink`.
pub async fn browse<S>(stream: S, opts: Options, sink: Sink) -> anyhow::Result<BrowseSummary>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let (mut inbound, reader_task) = spawn_reader(reader);
    write_message(&mut writer, &hello()).await?;
    expect_hello(&mut inbound).await?;

    let (processed_tx, mut processed_rx) = mpsc::unbounded_channel::<String>();
    let mut session = Session {
        writer,
        core: LibraryCore::new(opts.chunk_length),
        scheduler: TransferScheduler::new(opts.max_downloads),
        queues: HashMap::new(),
        contexts: crate::executor::contexts(),
        sink: sink.clone(),
        processed_tx,
        summary: BrowseSummary::default(),
    };

    let actions = session.core.browse(true);
    let mut loaded = session.apply(actions).await?;
    while !loaded {
        let actions = tokio::select! {
            msg = inbound.recv() => match msg {
                Some(Ok(msg)) => session.on_message(msg)?,
                Some(Err(e)) => return Err(e).context("reading from provider"),
                None => {
                    session.core.on_tube_closed(false);
                    session.scheduler.cancel_all();
                    bail!("provider closed the tube before the library was loaded");
                }
            },
            Some(path) = processed_rx.recv() => session.core.on_processed(&path),
        };
        loaded = session.apply(actions).await?;
    }

    session.core.on_tube_closed(true);
    reader_task.abort();
    let _ = session.writer.shutdown().await;
    sink.lock()
        .unwrap_or_else(PoisonError::into_inner)
        .flush()
        .context("flushing output")?;
    info!(event = "library_loaded", paths = session.summary.records.len());
    Ok(session.summary)
}
