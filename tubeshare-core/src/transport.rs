//! Transport boundary: connection and channel proxies the host implements over its RPC layer.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::mpsc;

use serde::{Deserialize, Serialize};

use crate::socket::{BridgeAddress, SocketAccessControl, SocketAddressType, SocketTypeMap};

/// Contact handle on a connection. 0 is never a valid target.
pub type Handle = u32;

pub const IFACE_CHANNEL: &str = "org.freedesktop.Telepathy.Channel";
pub const IFACE_DBUS_TUBE: &str = "org.freedesktop.Telepathy.Channel.Type.DBusTube";
pub const IFACE_STREAM_TUBE: &str = "org.freedesktop.Telepathy.Channel.Type.StreamTube";
pub const IFACE_FILE_TRANSFER: &str = "org.freedesktop.Telepathy.Channel.Type.FileTransfer";

/// Transport object reference of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectPath(String);

impl ObjectPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelType {
    DBusTube,
    StreamTube,
    FileTransfer,
    Other(String),
}

impl ChannelType {
    pub fn interface(&self) -> &str {
        match self {
            Self::DBusTube => IFACE_DBUS_TUBE,
            Self::StreamTube => IFACE_STREAM_TUBE,
            Self::FileTransfer => IFACE_FILE_TRANSFER,
            Self::Other(name) => name,
        }
    }

    pub fn from_interface(name: &str) -> Self {
        match name {
            IFACE_DBUS_TUBE => Self::DBusTube,
            IFACE_STREAM_TUBE => Self::StreamTube,
            IFACE_FILE_TRANSFER => Self::FileTransfer,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.interface())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandleType {
    None = 0,
    Contact = 1,
    Room = 2,
}

/// Property bag for a channel-creation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    pub channel_type: ChannelType,
    pub target_handle_type: HandleType,
    pub target_handle: Handle,
    /// Extra string properties, e.g. the tube service name or file metadata.
    pub properties: BTreeMap<String, String>,
}

/// One channel as carried by the "new channels" notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelDetails {
    pub path: ObjectPath,
    pub channel_type: ChannelType,
    pub target_handle_type: HandleType,
    pub target_handle: Handle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Notification {
    NewChannels,
    ChannelClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("operation not supported by the connection")]
    Unsupported,
    #[error("rejected by remote")]
    Rejected,
    #[error("transport disconnected")]
    Disconnected,
    #[error("{method} failed: {message}")]
    Call { method: String, message: String },
}

impl TransportError {
    pub fn call(method: &str, message: impl Into<String>) -> Self {
        Self::Call {
            method: method.to_string(),
            message: message.into(),
        }
    }
}

/// Sending half of a [`PendingReply`], held by the transport until the call returns.
#[derive(Debug)]
pub struct ReplySender<T>(mpsc::Sender<Result<T, TransportError>>);

impl<T> ReplySender<T> {
    /// Deliver the reply. Returns false if the receiver was already dropped.
    pub fn send(self, reply: Result<T, TransportError>) -> bool {
        self.0.send(reply).is_ok()
    }
}

/// Reply of an asynchronous transport call, collected later without blocking.
#[derive(Debug)]
pub struct PendingReply<T> {
    rx: mpsc::Receiver<Result<T, TransportError>>,
}

impl<T> PendingReply<T> {
    pub fn channel() -> (ReplySender<T>, Self) {
        let (tx, rx) = mpsc::channel();
        (ReplySender(tx), Self { rx })
    }

    /// Reply that is already available.
    pub fn ready(reply: Result<T, TransportError>) -> Self {
        let (tx, rx) = Self::channel();
        tx.send(reply);
        rx
    }

    /// Non-blocking poll. `None` while the call is outstanding; a dropped sender yields `Disconnected`.
    pub fn try_take(&self) -> Option<Result<T, TransportError>> {
        match self.rx.try_recv() {
            Ok(reply) => Some(reply),
            Err(mpsc::TryRecvError::Empty) => None,
            Err(mpsc::TryRecvError::Disconnected) => Some(Err(TransportError::Disconnected)),
        }
    }
}

/// Connection-level calls. Notifications are delivered by the host calling into the endpoints.
pub trait Connection {
    fn self_handle(&self) -> Handle;
    /// Whether the connection's request interface can create channels of this type.
    fn supports(&self, channel_type: &ChannelType) -> bool;
    fn ensure_channel(&self, request: &ChannelRequest) -> Result<ObjectPath, TransportError>;
    fn initiator_handle(&self, path: &ObjectPath) -> Result<Handle, TransportError>;
    fn close_channel(&self, path: &ObjectPath) -> Result<(), TransportError>;
    fn subscribe(&self, notification: Notification) -> Result<SubscriptionId, TransportError>;
    fn unsubscribe(&self, id: SubscriptionId) -> Result<(), TransportError>;
}

pub trait ChannelProxy {
    fn close(&self) -> Result<(), TransportError>;
}

pub trait DBusTubeProxy: ChannelProxy {
    /// Offer the tube; returns the private bus address.
    fn offer(&self, parameters: &BTreeMap<String, String>) -> Result<String, TransportError>;
    fn accept(&self) -> Result<String, TransportError>;
}

pub trait StreamTubeProxy: ChannelProxy {
    fn supported_socket_types(&self) -> Result<SocketTypeMap, TransportError>;
    /// Offer the tube, bridging remote connections to our server socket at `address`.
    fn offer(
        &self,
        address: &BridgeAddress,
        access: SocketAccessControl,
        parameters: &BTreeMap<String, String>,
    ) -> Result<(), TransportError>;
    /// Accept the tube; returns the raw local address to connect to.
    fn accept(
        &self,
        address_type: SocketAddressType,
        access: SocketAccessControl,
    ) -> Result<Vec<u8>, TransportError>;
}

pub trait FileTransferProxy: ChannelProxy {
    fn available_socket_types(&self) -> Result<SocketTypeMap, TransportError>;
    /// Start providing the file. Returns at once; the address arrives with the reply.
    fn provide_file(
        &self,
        address_type: SocketAddressType,
        access: SocketAccessControl,
    ) -> PendingReply<Vec<u8>>;
    fn accept_file(
        &self,
        address_type: SocketAddressType,
        access: SocketAccessControl,
        offset: u64,
    ) -> Result<Vec<u8>, TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TubeChannelState {
    LocalPending = 0,
    RemotePending = 1,
    Open = 2,
    NotOffered = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileTransferState {
    None = 0,
    Pending = 1,
    Accepted = 2,
    Open = 3,
    Completed = 4,
    Cancelled = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileTransferStateReason {
    None = 0,
    Requested = 1,
    LocalStopped = 2,
    RemoteStopped = 3,
    LocalError = 4,
    RemoteError = 5,
}
