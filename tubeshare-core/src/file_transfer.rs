//! Single-file byte-stream transfer over a requested channel.

use tracing::{debug, info, warn};

use crate::channel::{ChannelError, ChannelEvent, RequestedChannel};
use crate::socket::{negotiate_socket_type, BridgeAddress, SocketAccessControl, SocketAddressType};
use crate::transfer::TransferResource;
use crate::transport::{FileTransferProxy, FileTransferState, FileTransferStateReason, PendingReply};

/// Metadata declared with the offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub filename: String,
    pub content_type: String,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileTransferStatus {
    NotOffered,
    /// Provided or accepted, waiting for Open.
    Pending,
    Open,
    Completed,
    Cancelled,
    Closed,
}

impl FileTransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Closed)
    }
}

pub struct FileTransferSession<P: FileTransferProxy> {
    channel: RequestedChannel<P>,
    info: FileInfo,
    socket_type: SocketAddressType,
    status: FileTransferStatus,
    reason: FileTransferStateReason,
    pending: Option<PendingReply<Vec<u8>>>,
    address: Option<BridgeAddress>,
    initial_offset: u64,
    transferred: u64,
}

impl<P: FileTransferProxy> FileTransferSession<P> {
    pub fn new(
        channel: RequestedChannel<P>,
        info: FileInfo,
        local: &[SocketAddressType],
    ) -> Result<Self, ChannelError> {
        if info.size == 0 {
            return Err(ChannelError::EmptyFile);
        }
        let remote = channel.proxy().available_socket_types()?;
        let socket_type =
            negotiate_socket_type(local, &remote).ok_or(ChannelError::NoSupportedSocketType)?;
        Ok(Self {
            channel,
            info,
            socket_type,
            status: FileTransferStatus::NotOffered,
            reason: FileTransferStateReason::None,
            pending: None,
            address: None,
            initial_offset: 0,
            transferred: 0,
        })
    }

    /// Initiator provides at once; responder raises `TransferOffered`.
    pub fn process(&mut self) -> Result<Option<ChannelEvent>, ChannelError> {
        if self.channel.is_initiator() {
            self.provide()?;
            Ok(None)
        } else {
            Ok(Some(ChannelEvent::TransferOffered))
        }
    }

    /// Start the provide call without waiting; the address is collected at Open.
    pub fn provide(&mut self) -> Result<(), ChannelError> {
        self.check(true)?;
        self.pending = Some(
            self.channel
                .proxy()
                .provide_file(self.socket_type, SocketAccessControl::Localhost),
        );
        self.status = FileTransferStatus::Pending;
        debug!(event = "file_provide_started", filename = %self.info.filename, size = self.info.size);
        Ok(())
    }

    /// Accept the incoming stream starting at `offset`; the bridge address is returned at once.
    pub fn accept(&mut self, offset: u64) -> Result<&BridgeAddress, ChannelError> {
        self.check(false)?;
        let raw = self.channel.proxy().accept_file(
            self.socket_type,
            SocketAccessControl::Localhost,
            offset,
        )?;
        let addr = BridgeAddress::from_bytes(self.socket_type, &raw)?;
        info!(event = "file_accepted", filename = %self.info.filename, address = %addr);
        self.status = FileTransferStatus::Pending;
        Ok(self.address.insert(addr))
    }

    pub fn reject(&mut self) -> Result<Option<ChannelEvent>, ChannelError> {
        if self.channel.is_initiator() {
            return Err(ChannelError::WrongRole("responder"));
        }
        Ok(self.close())
    }

    /// Transport state notification. At Open the provide reply is collected; a failed reply closes
    /// the transfer, an outstanding one holds `Ready` back until `on_provide_reply`.
    pub fn on_state_changed(
        &mut self,
        state: FileTransferState,
        reason: FileTransferStateReason,
    ) -> Vec<ChannelEvent> {
        debug!(event = "file_state", filename = %self.info.filename, ?state, ?reason);
        if self.status.is_terminal() {
            return Vec::new();
        }
        self.reason = reason;
        match state {
            FileTransferState::Open => {
                self.status = FileTransferStatus::Open;
                self.collect_provided()
            }
            FileTransferState::Completed | FileTransferState::Cancelled => {
                let events = self.close().into_iter().collect();
                self.status = if state == FileTransferState::Completed {
                    FileTransferStatus::Completed
                } else {
                    FileTransferStatus::Cancelled
                };
                events
            }
            _ => Vec::new(),
        }
    }

    /// The provide call returned. Before Open the reply stays buffered for Open to collect.
    pub fn on_provide_reply(&mut self) -> Vec<ChannelEvent> {
        if self.status != FileTransferStatus::Open {
            return Vec::new();
        }
        self.collect_provided()
    }

    fn collect_provided(&mut self) -> Vec<ChannelEvent> {
        if let Some(pending) = &self.pending {
            let Some(reply) = pending.try_take() else {
                debug!(event = "file_provide_outstanding", filename = %self.info.filename);
                return Vec::new();
            };
            self.pending = None;
            let resolved = reply
                .map_err(ChannelError::from)
                .and_then(|raw| Ok(BridgeAddress::from_bytes(self.socket_type, &raw)?));
            match resolved {
                Ok(addr) => self.address = Some(addr),
                Err(e) => {
                    warn!(event = "file_provide_failed", filename = %self.info.filename, error = %e);
                    return self.close().into_iter().collect();
                }
            }
        }
        self.channel.mark_ready().into_iter().collect()
    }

    /// Transferred-bytes notification. Returns the delta since the last one.
    pub fn on_transferred_bytes(&mut self, count: u64) -> u64 {
        let delta = count.saturating_sub(self.transferred);
        self.transferred = self.transferred.max(count);
        delta
    }

    pub fn on_initial_offset(&mut self, offset: u64) {
        self.initial_offset = offset;
    }

    /// Transport reported the channel gone.
    pub fn on_closed(&mut self) -> Option<ChannelEvent> {
        if !self.status.is_terminal() {
            self.status = FileTransferStatus::Closed;
        }
        self.channel.mark_closed()
    }

    /// Best-effort close. Transport errors are logged, never returned.
    pub fn close(&mut self) -> Option<ChannelEvent> {
        if !self.status.is_terminal() {
            self.status = FileTransferStatus::Closed;
        }
        self.pending = None;
        self.channel.close()
    }

    fn check(&self, initiator: bool) -> Result<(), ChannelError> {
        if self.status != FileTransferStatus::NotOffered || self.channel.is_closed() {
            return Err(ChannelError::Closed);
        }
        if self.channel.is_initiator() != initiator {
            return Err(ChannelError::WrongRole(if initiator { "initiator" } else { "responder" }));
        }
        Ok(())
    }

    pub fn info(&self) -> &FileInfo {
        &self.info
    }

    pub fn status(&self) -> FileTransferStatus {
        self.status
    }

    pub fn reason(&self) -> FileTransferStateReason {
        self.reason
    }

    pub fn socket_type(&self) -> SocketAddressType {
        self.socket_type
    }

    pub fn address(&self) -> Option<&BridgeAddress> {
        self.address.as_ref()
    }

    pub fn transferred_bytes(&self) -> u64 {
        self.transferred
    }

    pub fn initial_offset(&self) -> u64 {
        self.initial_offset
    }

    pub fn channel(&self) -> &RequestedChannel<P> {
        &self.channel
    }
}

impl<P: FileTransferProxy> TransferResource for FileTransferSession<P> {
    fn cancel(&mut self) {
        if let Some(event) = self.close() {
            debug!(event = "file_transfer_cancelled", filename = %self.info.filename, ?event);
        }
    }
}
