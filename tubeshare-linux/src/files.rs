//! Track file downloads: each requested id is a deferred transfer that binds a file-transfer
//! session once the provider's offer arrives, then streams the file into the destination dir.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tubeshare_core::socket::{SocketTypeMap, LOCAL_SOCKET_TYPES};
use tubeshare_core::transport::{
    ChannelProxy, FileTransferProxy, FileTransferState, FileTransferStateReason,
};
use tubeshare_core::{
    Arrival, BridgeAddress, ChannelError, DeferredTransfer, FileInfo, FileTransferSession, Handle,
    ObjectPath, PendingReply, RegistryError, RequestedChannel, SchedulerEvent, SocketAccessControl,
    SocketAddressType, Transfer, TransferScheduler, TransferState, TransportError,
};

use crate::browser::expect_hello;
use crate::protocol::{hello, Message};
use crate::wire::{spawn_reader, spawn_writer};

/// Our end of every file channel.
const LOCAL_HANDLE: Handle = 1;
/// The provider; it initiates every file channel.
const PROVIDER_HANDLE: Handle = 2;

const READ_BUF: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub max_downloads: usize,
    pub dest: PathBuf,
}

/// Track ids per outcome, plus the bytes written for completed files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchSummary {
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub cancelled: Vec<String>,
    pub bytes: u64,
}

/// File channel as seen through the bridge: closing it tells the provider to drop the offer.
pub struct OfferProxy {
    id: String,
    address: Vec<u8>,
    outbound: mpsc::UnboundedSender<Message>,
}

impl ChannelProxy for OfferProxy {
    fn close(&self) -> Result<(), TransportError> {
        self.outbound
            .send(Message::CloseFile {
                id: self.id.clone(),
            })
            .map_err(|_| TransportError::Disconnected)
    }
}

impl FileTransferProxy for OfferProxy {
    fn available_socket_types(&self) -> Result<SocketTypeMap, TransportError> {
        Ok(SocketTypeMap::from([(
            SocketAddressType::Unix,
            vec![SocketAccessControl::Localhost],
        )]))
    }

    fn provide_file(
        &self,
        _address_type: SocketAddressType,
        _access: SocketAccessControl,
    ) -> PendingReply<Vec<u8>> {
        PendingReply::ready(Err(TransportError::Unsupported))
    }

    fn accept_file(
        &self,
        address_type: SocketAddressType,
        _access: SocketAccessControl,
        offset: u64,
    ) -> Result<Vec<u8>, TransportError> {
        if address_type != SocketAddressType::Unix {
            return Err(TransportError::Unsupported);
        }
        if offset != 0 {
            return Err(TransportError::call("AcceptFile", "resume is not offered"));
        }
        Ok(self.address.clone())
    }
}

type FileDownload = DeferredTransfer<String, FileTransferSession<OfferProxy>>;

/// Reported by a receive task.
#[derive(Debug)]
pub enum StreamEvent {
    Opened,
    /// Bytes written so far.
    Progress(u64),
    Done(std::io::Result<u64>),
}

struct Receiver {
    task: JoinHandle<()>,
    target: PathBuf,
}

impl Receiver {
    fn abort(self) {
        self.task.abort();
        let _ = std::fs::remove_file(&self.target);
    }
}

/// Where an offered file lands: its bare file name under `dest`, or the id when the name is unusable.
fn target_path(dest: &Path, filename: &str, id: &str) -> PathBuf {
    let name = Path::new(filename)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty() && n != "." && n != "..")
        .unwrap_or_else(|| id.to_string());
    dest.join(name)
}

async fn receive(
    id: String,
    address: PathBuf,
    target: PathBuf,
    events: mpsc::UnboundedSender<(String, StreamEvent)>,
) {
    let result: std::io::Result<u64> = async {
        let mut stream = UnixStream::connect(&address).await?;
        let _ = events.send((id.clone(), StreamEvent::Opened));
        let mut file = tokio::fs::File::create(&target).await?;
        let mut buf = vec![0u8; READ_BUF];
        let mut total = 0u64;
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n]).await?;
            total += n as u64;
            let _ = events.send((id.clone(), StreamEvent::Progress(total)));
        }
        file.flush().await?;
        Ok(total)
    }
    .await;
    let _ = events.send((id, StreamEvent::Done(result)));
}

/// Download state for one provider connection. Outbound messages go through `outbound`;
/// receive tasks report through the channel returned by `new`.
pub struct Downloads {
    scheduler: TransferScheduler<FileDownload>,
    outbound: mpsc::UnboundedSender<Message>,
    streams: mpsc::UnboundedSender<(String, StreamEvent)>,
    receivers: HashMap<String, Receiver>,
    dest: PathBuf,
    summary: FetchSummary,
}

impl Downloads {
    pub fn new(
        outbound: mpsc::UnboundedSender<Message>,
        dest: PathBuf,
        max_downloads: usize,
    ) -> (Self, mpsc::UnboundedReceiver<(String, StreamEvent)>) {
        let (streams, rx) = mpsc::unbounded_channel();
        let d = Self {
            scheduler: TransferScheduler::new(max_downloads),
            outbound,
            streams,
            receivers: HashMap::new(),
            dest,
            summary: FetchSummary::default(),
        };
        (d, rx)
    }

    /// Queue a track id; `GetFile` goes out once a slot is free.
    pub fn queue(&mut self, id: String) -> Result<(), RegistryError> {
        self.scheduler.queue(FileDownload::new(id.clone(), 0))?;
        let events = self.scheduler.mark_ready(&id);
        self.on_scheduler(events);
        Ok(())
    }

    /// Cancel one download. Before the offer arrives the cancel is deferred to it.
    pub fn cancel(&mut self, id: &str) {
        if let Some(r) = self.receivers.remove(id) {
            r.abort();
        }
        let key = id.to_string();
        let events = self.scheduler.cancel(&key);
        if events
            .iter()
            .any(|e| matches!(e, SchedulerEvent::Finished(k, TransferState::Cancelled) if *k == key))
        {
            self.summary.cancelled.push(key);
        }
        self.on_scheduler(events);
    }

    pub fn cancel_all(&mut self) {
        for id in self.scheduler.registry().keys() {
            self.cancel(&id);
        }
    }

    /// Nothing queued or running.
    pub fn is_idle(&self) -> bool {
        self.scheduler.registry().is_empty()
    }

    pub fn take_summary(&mut self) -> FetchSummary {
        std::mem::take(&mut self.summary)
    }

    pub fn on_message(&mut self, msg: Message) {
        match msg {
            Message::FileOffered {
                id,
                filename,
                content_type,
                size,
                address,
            } => {
                let info = FileInfo {
                    filename,
                    content_type,
                    size,
                };
                self.on_offer(id, info, address);
            }
            Message::Error { path, message } => {
                warn!(event = "provider_error", id = %path, message = %message);
                self.fail(&path);
            }
            other => warn!(event = "unexpected_message", message = ?other),
        }
    }

    fn on_offer(&mut self, id: String, info: FileInfo, address: Vec<u8>) {
        let proxy = OfferProxy {
            id: id.clone(),
            address,
            outbound: self.outbound.clone(),
        };
        let session = RequestedChannel::new(
            proxy,
            ObjectPath::new(format!("/file/{}", id)),
            LOCAL_HANDLE,
            PROVIDER_HANDLE,
            PROVIDER_HANDLE,
        )
        .and_then(|channel| FileTransferSession::new(channel, info, LOCAL_SOCKET_TYPES));
        let session = match session {
            Ok(s) => s,
            Err(e) => {
                warn!(event = "offer_rejected", id = %id, error = %e);
                let _ = self.outbound.send(Message::CloseFile { id: id.clone() });
                self.fail(&id);
                return;
            }
        };
        let size = session.info().size;
        self.scheduler.expect(&id, size);
        match self.scheduler.registry().resource_arrived(&id, session) {
            Arrival::Bound => self.open(&id),
            Arrival::CancelledOnArrival => info!(event = "offer_cancelled_on_arrival", id = %id),
            Arrival::Unknown(mut session) => {
                warn!(event = "unknown_offer", id = %id);
                session.close();
            }
        }
    }

    /// Accept the bound session and start streaming it to disk.
    fn open(&mut self, id: &str) {
        let key = id.to_string();
        let accepted = self
            .scheduler
            .registry()
            .with(&key, |t| -> Result<(PathBuf, String), ChannelError> {
                let session = t.resource_mut().ok_or(ChannelError::Closed)?;
                if let Some(event) = session.process()? {
                    debug!(event = "file_channel", id = %key, channel_event = ?event);
                }
                let filename = session.info().filename.clone();
                match session.accept(0)? {
                    BridgeAddress::Unix(path) => Ok((path.clone(), filename)),
                    _ => Err(ChannelError::NoSupportedSocketType),
                }
            })
            .unwrap_or(Err(ChannelError::Closed));
        match accepted {
            Ok((address, filename)) => {
                let target = target_path(&self.dest, &filename, id);
                debug!(event = "file_receiving", id, target = %target.display());
                let task = tokio::spawn(receive(
                    key.clone(),
                    address,
                    target.clone(),
                    self.streams.clone(),
                ));
                self.receivers.insert(key, Receiver { task, target });
            }
            Err(e) => {
                warn!(event = "file_accept_failed", id, error = %e);
                self.fail(id);
            }
        }
    }

    pub fn on_stream(&mut self, id: String, event: StreamEvent) {
        match event {
            StreamEvent::Opened => {
                let events = self.scheduler.registry().with(&id, |t| {
                    t.resource_mut().map(|s| {
                        s.on_state_changed(FileTransferState::Open, FileTransferStateReason::Requested)
                    })
                });
                debug!(event = "file_open", id = %id, channel_events = ?events.flatten());
            }
            StreamEvent::Progress(total) => {
                let delta = self
                    .scheduler
                    .registry()
                    .with(&id, |t| {
                        if let Some(s) = t.resource_mut() {
                            s.on_transferred_bytes(total);
                        }
                        t.progress(total)
                    })
                    .unwrap_or(0);
                self.scheduler.progress(delta);
            }
            StreamEvent::Done(Ok(written)) => {
                let expected = self.scheduler.registry().with(&id, |t| t.bytes_expected());
                if expected != Some(written) {
                    warn!(event = "file_size_mismatch", id = %id, ?expected, written);
                    self.fail(&id);
                    return;
                }
                self.receivers.remove(&id);
                self.scheduler.registry().with(&id, |t| {
                    if let Some(s) = t.resource_mut() {
                        s.on_state_changed(FileTransferState::Completed, FileTransferStateReason::None);
                    }
                });
                info!(event = "file_downloaded", id = %id, bytes = written);
                self.summary.completed.push(id.clone());
                self.summary.bytes += written;
                let events = self.scheduler.finish(&id, TransferState::Completed);
                self.on_scheduler(events);
            }
            StreamEvent::Done(Err(e)) => {
                warn!(event = "file_stream_failed", id = %id, error = %e);
                self.fail(&id);
            }
        }
    }

    fn fail(&mut self, id: &str) {
        let key = id.to_string();
        if !self.scheduler.registry().contains(&key) {
            return;
        }
        if let Some(r) = self.receivers.remove(id) {
            r.abort();
        }
        self.scheduler.registry().with(&key, |t| {
            if let Some(s) = t.resource_mut() {
                s.on_state_changed(FileTransferState::Cancelled, FileTransferStateReason::LocalError);
            }
        });
        self.summary.failed.push(key.clone());
        let events = self.scheduler.finish(&key, TransferState::Failed);
        self.on_scheduler(events);
    }

    fn on_scheduler(&mut self, events: Vec<SchedulerEvent<String>>) {
        for event in events {
            match event {
                SchedulerEvent::Start(id) => {
                    if self.outbound.send(Message::GetFile { id: id.clone() }).is_err() {
                        warn!(event = "request_dropped", id = %id);
                    }
                }
                SchedulerEvent::Finished(id, state) => debug!(event = "download_finished", id = %id, ?state),
                SchedulerEvent::Completed => debug!(event = "downloads_completed"),
            }
        }
    }
}

impl Drop for Downloads {
    fn drop(&mut self) {
        for (_, r) in self.receivers.drain() {
            r.abort();
        }
    }
}

/// Fetch the files behind `ids` over `stream` into `opts.dest`.
pub async fn download<S>(stream: S, ids: Vec<String>, opts: FetchOptions) -> anyhow::Result<FetchSummary>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    tokio::fs::create_dir_all(&opts.dest)
        .await
        .with_context(|| format!("creating {}", opts.dest.display()))?;
    let (reader, writer) = tokio::io::split(stream);
    let (mut inbound, reader_task) = spawn_reader(reader);
    let (outbound, writer_task) = spawn_writer(writer);
    outbound.send(hello()).context("provider writer closed")?;
    expect_hello(&mut inbound).await?;

    let (mut downloads, mut streams) = Downloads::new(outbound, opts.dest, opts.max_downloads);
    for id in ids {
        downloads.queue(id)?;
    }
    while !downloads.is_idle() {
        tokio::select! {
            msg = inbound.recv() => match msg {
                Some(Ok(msg)) => downloads.on_message(msg),
                Some(Err(e)) => return Err(e).context("reading from provider"),
                None => {
                    downloads.cancel_all();
                    bail!("provider closed before the downloads finished");
                }
            },
            Some((id, event)) = streams.recv() => downloads.on_stream(id, event),
        }
    }

    let summary = downloads.take_summary();
    drop(downloads);
    writer_task
        .await
        .context("provider writer task")?
        .context("writing to provider")?;
    reader_task.abort();
    info!(
        event = "files_fetched",
        completed = summary.completed.len(),
        failed = summary.failed.len(),
        cancelled = summary.cancelled.len(),
        bytes = summary.bytes
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::handle_connection;
    use crate::provider::tests::{library_with_file, provider, scratch_dir};

    fn downloads(name: &str) -> (Downloads, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (d, _streams) = Downloads::new(tx, scratch_dir(name), 1);
        (d, rx)
    }

    fn offer(id: &str, address: &str) -> Message {
        Message::FileOffered {
            id: id.into(),
            filename: "a.ogg".into(),
            content_type: "audio/ogg".into(),
            size: 4,
            address: address.as_bytes().to_vec(),
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(m) = rx.try_recv() {
            out.push(m);
        }
        out
    }

    #[test]
    fn target_path_keeps_bare_name() {
        let dest = Path::new("/dl");
        assert_eq!(target_path(dest, "song.ogg", "7"), PathBuf::from("/dl/song.ogg"));
        assert_eq!(target_path(dest, "../../etc/passwd", "7"), PathBuf::from("/dl/passwd"));
        assert_eq!(target_path(dest, "..", "7"), PathBuf::from("/dl/7"));
        assert_eq!(target_path(dest, "", "7"), PathBuf::from("/dl/7"));
    }

    #[test]
    fn queue_requests_up_to_limit() {
        let (mut d, mut rx) = downloads("limit");
        d.queue("1".into()).unwrap();
        d.queue("2".into()).unwrap();
        assert_eq!(drain(&mut rx), vec![Message::GetFile { id: "1".into() }]);
        assert!(d.queue("1".into()).is_err());

        d.on_message(Message::Error {
            path: "1".into(),
            message: "no track 1".into(),
        });
        assert_eq!(drain(&mut rx), vec![Message::GetFile { id: "2".into() }]);
        assert_eq!(d.take_summary().failed, vec!["1".to_string()]);
    }

    #[test]
    fn cancel_before_offer_closes_late_offer() {
        let (mut d, mut rx) = downloads("early-cancel");
        d.queue("7".into()).unwrap();
        assert_eq!(drain(&mut rx), vec![Message::GetFile { id: "7".into() }]);

        d.cancel("7");
        assert!(d.is_idle());
        assert!(d.scheduler.registry().is_cancel_pending(&"7".to_string()));
        assert!(drain(&mut rx).is_empty());

        d.on_message(offer("7", "/tmp/nowhere.sock"));
        assert_eq!(drain(&mut rx), vec![Message::CloseFile { id: "7".into() }]);
        assert!(!d.scheduler.registry().is_cancel_pending(&"7".to_string()));
        assert!(d.receivers.is_empty());
        assert_eq!(d.take_summary().cancelled, vec!["7".to_string()]);
    }

    #[test]
    fn unknown_offer_is_closed() {
        let (mut d, mut rx) = downloads("unknown-offer");
        d.on_message(offer("9", "/tmp/nowhere.sock"));
        assert_eq!(drain(&mut rx), vec![Message::CloseFile { id: "9".into() }]);
        assert!(d.is_idle());
    }

    #[test]
    fn empty_offer_fails_transfer() {
        let (mut d, mut rx) = downloads("empty-offer");
        d.queue("7".into()).unwrap();
        drain(&mut rx);
        d.on_message(Message::FileOffered {
            id: "7".into(),
            filename: "a.ogg".into(),
            content_type: "audio/ogg".into(),
            size: 0,
            address: b"/tmp/nowhere.sock".to_vec(),
        });
        assert_eq!(drain(&mut rx), vec![Message::CloseFile { id: "7".into() }]);
        assert!(d.is_idle());
        assert_eq!(d.take_summary().failed, vec!["7".to_string()]);
    }

    #[tokio::test]
    async fn short_stream_fails_and_removes_partial_file() {
        let dir = scratch_dir("short-stream");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (mut d, _streams) = Downloads::new(tx, dir.clone(), 1);
        d.queue("7".into()).unwrap();
        d.on_message(offer("7", "/tmp/nowhere.sock"));
        drain(&mut rx);
        std::fs::write(dir.join("a.ogg"), b"ab").unwrap();
        d.on_stream("7".into(), StreamEvent::Progress(2));
        d.on_stream("7".into(), StreamEvent::Done(Ok(2)));
        assert_eq!(drain(&mut rx), vec![Message::CloseFile { id: "7".into() }]);
        assert!(d.is_idle());
        assert!(!dir.join("a.ogg").exists());
        assert_eq!(d.take_summary().failed, vec!["7".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn downloads_track_file_end_to_end() {
        let (server, client) = UnixStream::pair().unwrap();
        let p = provider(library_with_file("fetch", b"0123456789"), "fetch");
        let served = tokio::spawn(async move { handle_connection(server, &p).await });

        let dest = scratch_dir("fetch").join("dest");
        let opts = FetchOptions {
            max_downloads: 2,
            dest: dest.clone(),
        };
        let summary = download(client, vec!["7".into(), "1".into()], opts).await.unwrap();
        assert_eq!(summary.completed, vec!["7".to_string()]);
        assert_eq!(summary.failed, vec!["1".to_string()]);
        assert_eq!(summary.bytes, 10);
        assert_eq!(std::fs::read(dest.join("song.ogg")).unwrap(), b"0123456789");
        served.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn provider_hangup_is_an_error() {
        let (server, client) = UnixStream::pair().unwrap();
        tokio::spawn(async move {
            let (mut r, mut w) = tokio::io::split(server);
            let _hello = crate::wire::read_message(&mut r).await;
            crate::wire::write_message(&mut w, &hello()).await.unwrap();
            let _get = crate::wire::read_message(&mut r).await;
        });
        let opts = FetchOptions {
            max_downloads: 1,
            dest: scratch_dir("fetch-hangup"),
        };
        let err = download(client, vec!["0".into()], opts).await.unwrap_err();
        assert!(err.to_string().contains("provider closed"));
    }
}
