//! Channel endpoints: lifecycle of one negotiated channel to a peer handle.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::transport::{
    ChannelDetails, ChannelProxy, ChannelRequest, ChannelType, Connection, Handle, HandleType,
    Notification, ObjectPath, SubscriptionId, TransportError,
};

/// Notifications raised by channels and the sessions built on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    Ready,
    Closed,
    TubeOffered,
    TransferOffered,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("feature not supported by peer")]
    Unsupported,
    #[error("feature not supported by peer (no supported socket type)")]
    NoSupportedSocketType,
    #[error("invalid target handle {0}")]
    InvalidTarget(Handle),
    #[error("operation requires the {0} side of the channel")]
    WrongRole(&'static str),
    #[error("channel is closed")]
    Closed,
    #[error("endpoint is already bound to a channel")]
    AlreadyBound,
    #[error("no server address to offer")]
    NoServerAddress,
    #[error("file size must be greater than zero")]
    EmptyFile,
    #[error("bad bridge address: {0}")]
    Address(#[from] crate::socket::AddressError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Latch that lets a notification fire once.
#[derive(Debug, Default)]
pub(crate) struct Once(bool);

impl Once {
    /// True the first time only.
    pub(crate) fn fire(&mut self) -> bool {
        !std::mem::replace(&mut self.0, true)
    }

    pub(crate) fn fired(&self) -> bool {
        self.0
    }
}

fn validate_target(target: Handle, self_handle: Handle) -> Result<(), ChannelError> {
    if target == 0 || target == self_handle {
        return Err(ChannelError::InvalidTarget(target));
    }
    Ok(())
}

/// Channel of one type to one peer, requested locally or bound from an inbound announcement.
pub struct ChannelEndpoint<C: Connection> {
    conn: Arc<C>,
    channel_type: ChannelType,
    target: Handle,
    initiator: Option<Handle>,
    path: Option<ObjectPath>,
    subscriptions: Vec<SubscriptionId>,
    ready: Once,
    closed: Once,
}

impl<C: Connection> ChannelEndpoint<C> {
    /// Validates the target and subscribes to new-channel and channel-closed notifications.
    pub fn new(conn: Arc<C>, channel_type: ChannelType, target: Handle) -> Result<Self, ChannelError> {
        validate_target(target, conn.self_handle())?;
        let mut subscriptions = Vec::with_capacity(2);
        for n in [Notification::NewChannels, Notification::ChannelClosed] {
            subscriptions.push(conn.subscribe(n)?);
        }
        Ok(Self {
            conn,
            channel_type,
            target,
            initiator: None,
            path: None,
            subscriptions,
            ready: Once::default(),
            closed: Once::default(),
        })
    }

    /// Ask the connection for the channel. Extra properties ride along in the request.
    pub fn request(
        &mut self,
        properties: impl IntoIterator<Item = (String, String)>,
    ) -> Result<&ObjectPath, ChannelError> {
        if self.closed.fired() {
            return Err(ChannelError::Closed);
        }
        if self.path.is_some() {
            return Err(ChannelError::AlreadyBound);
        }
        if !self.conn.supports(&self.channel_type) {
            return Err(ChannelError::Unsupported);
        }
        let req = ChannelRequest {
            channel_type: self.channel_type.clone(),
            target_handle_type: HandleType::Contact,
            target_handle: self.target,
            properties: properties.into_iter().collect(),
        };
        let path = match self.conn.ensure_channel(&req) {
            Ok(p) => p,
            Err(TransportError::Unsupported) => return Err(ChannelError::Unsupported),
            Err(e) => return Err(e.into()),
        };
        debug!(event = "channel_requested", channel_type = %self.channel_type, target = self.target, path = %path);
        self.initiator = Some(self.conn.self_handle());
        Ok(self.path.insert(path))
    }

    /// Bind to the first announced channel matching our type and peer. Returns true if bound by this call.
    pub fn on_new_channels(&mut self, channels: &[ChannelDetails]) -> bool {
        if self.path.is_some() || self.closed.fired() {
            return false;
        }
        for details in channels {
            if details.channel_type != self.channel_type
                || details.target_handle_type != HandleType::Contact
            {
                continue;
            }
            let initiator = match self.conn.initiator_handle(&details.path) {
                Ok(h) => h,
                Err(e) => {
                    warn!(event = "initiator_lookup_failed", path = %details.path, error = %e);
                    continue;
                }
            };
            if details.target_handle != self.target && initiator != self.target {
                continue;
            }
            info!(event = "channel_bound", channel_type = %self.channel_type, path = %details.path, initiator);
            self.initiator = Some(initiator);
            self.path = Some(details.path.clone());
            return true;
        }
        false
    }

    pub fn on_channel_closed(&mut self, path: &ObjectPath) -> Option<ChannelEvent> {
        if self.path.as_ref() != Some(path) {
            return None;
        }
        self.path = None;
        self.closed.fire().then_some(ChannelEvent::Closed)
    }

    /// Fire `Ready` once the owning session finds the channel usable.
    pub fn mark_ready(&mut self) -> Option<ChannelEvent> {
        if self.path.is_none() {
            return None;
        }
        self.ready.fire().then_some(ChannelEvent::Ready)
    }

    /// Best-effort close. Transport errors are logged, never returned.
    pub fn close(&mut self) -> Option<ChannelEvent> {
        let path = self.path.take()?;
        if let Err(e) = self.conn.close_channel(&path) {
            debug!(event = "close_ignored", path = %path, error = %e);
        }
        self.closed.fire().then_some(ChannelEvent::Closed)
    }

    /// Drop notification subscriptions, then close.
    pub fn dispose(&mut self) -> Option<ChannelEvent> {
        for id in self.subscriptions.drain(..) {
            if let Err(e) = self.conn.unsubscribe(id) {
                debug!(event = "unsubscribe_ignored", error = %e);
            }
        }
        self.close()
    }

    pub fn channel_type(&self) -> &ChannelType {
        &self.channel_type
    }

    pub fn target_handle(&self) -> Handle {
        self.target
    }

    pub fn initiator_handle(&self) -> Option<Handle> {
        self.initiator
    }

    pub fn object_path(&self) -> Option<&ObjectPath> {
        self.path.as_ref()
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator == Some(self.conn.self_handle())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.fired()
    }
}

impl<C: Connection> Drop for ChannelEndpoint<C> {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Channel handed back by the transport as an object reference; handles are fixed at construction.
pub struct RequestedChannel<P: ChannelProxy> {
    proxy: P,
    path: ObjectPath,
    self_handle: Handle,
    initiator: Handle,
    target: Handle,
    ready: Once,
    closed: Once,
}

impl<P: ChannelProxy> RequestedChannel<P> {
    pub fn new(
        proxy: P,
        path: ObjectPath,
        self_handle: Handle,
        initiator: Handle,
        target: Handle,
    ) -> Result<Self, ChannelError> {
        validate_target(target, self_handle)?;
        if initiator == 0 {
            return Err(ChannelError::InvalidTarget(initiator));
        }
        Ok(Self {
            proxy,
            path,
            self_handle,
            initiator,
            target,
            ready: Once::default(),
            closed: Once::default(),
        })
    }

    /// Build from an announced channel, reading the initiator from the connection.
    pub fn from_details<C: Connection>(
        proxy: P,
        conn: &C,
        details: &ChannelDetails,
    ) -> Result<Self, ChannelError> {
        let initiator = conn.initiator_handle(&details.path)?;
        Self::new(
            proxy,
            details.path.clone(),
            conn.self_handle(),
            initiator,
            details.target_handle,
        )
    }

    pub fn proxy(&self) -> &P {
        &self.proxy
    }

    pub fn object_path(&self) -> &ObjectPath {
        &self.path
    }

    pub fn initiator_handle(&self) -> Handle {
        self.initiator
    }

    pub fn target_handle(&self) -> Handle {
        self.target
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator == self.self_handle
    }

    pub fn is_closed(&self) -> bool {
        self.closed.fired()
    }

    pub fn mark_ready(&mut self) -> Option<ChannelEvent> {
        if self.closed.fired() {
            return None;
        }
        self.ready.fire().then_some(ChannelEvent::Ready)
    }

    /// Transport reported the channel gone.
    pub fn mark_closed(&mut self) -> Option<ChannelEvent> {
        self.closed.fire().then_some(ChannelEvent::Closed)
    }

    /// Best-effort close. Transport errors are logged, never returned.
    pub fn close(&mut self) -> Option<ChannelEvent> {
        if self.closed.fired() {
            return None;
        }
        if let Err(e) = self.proxy.close() {
            debug!(event = "close_ignored", path = %self.path, error = %e);
        }
        self.mark_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeConnection, FakeProxy, PEER, SELF};

    fn details(path: &str, ct: ChannelType, target: Handle) -> ChannelDetails {
        ChannelDetails {
            path: ObjectPath::new(path),
            channel_type: ct,
            target_handle_type: HandleType::Contact,
            target_handle: target,
        }
    }

    #[test]
    fn new_rejects_zero_and_self_target() {
        let conn = Arc::new(FakeConnection::new());
        assert!(matches!(
            ChannelEndpoint::new(conn.clone(), ChannelType::StreamTube, 0),
            Err(ChannelError::InvalidTarget(0))
        ));
        assert!(matches!(
            ChannelEndpoint::new(conn, ChannelType::StreamTube, SELF),
            Err(ChannelError::InvalidTarget(SELF))
        ));
    }

    #[test]
    fn new_subscribes_and_dispose_unsubscribes() {
        let conn = Arc::new(FakeConnection::new());
        let mut ep = ChannelEndpoint::new(conn.clone(), ChannelType::StreamTube, PEER).unwrap();
        assert_eq!(conn.subscriptions(), 2);
        ep.dispose();
        assert_eq!(conn.subscriptions(), 0);
    }

    #[test]
    fn request_unsupported_type() {
        let conn = Arc::new(FakeConnection::new());
        let mut ep =
            ChannelEndpoint::new(conn, ChannelType::Other("x.Unknown".into()), PEER).unwrap();
        assert_eq!(ep.request([]).unwrap_err(), ChannelError::Unsupported);
        assert!(ep.object_path().is_none());
    }

    #[test]
    fn request_records_path_and_initiator() {
        let conn = Arc::new(FakeConnection::new());
        let mut ep = ChannelEndpoint::new(conn.clone(), ChannelType::StreamTube, PEER).unwrap();
        let path = ep
            .request([("service".to_string(), "library".to_string())])
            .unwrap()
            .clone();
        assert!(ep.is_initiator());
        let req = conn.last_request().unwrap();
        assert_eq!(req.target_handle, PEER);
        assert_eq!(req.properties.get("service").map(String::as_str), Some("library"));
        assert_eq!(ep.object_path(), Some(&path));
    }

    #[test]
    fn second_request_keeps_bound_channel() {
        let conn = Arc::new(FakeConnection::new());
        let mut ep = ChannelEndpoint::new(conn.clone(), ChannelType::FileTransfer, PEER).unwrap();
        let path = ep.request(Vec::new()).unwrap().clone();
        assert_eq!(ep.request(Vec::new()).unwrap_err(), ChannelError::AlreadyBound);
        assert_eq!(ep.object_path(), Some(&path));
        assert_eq!(conn.close_calls(), 0);
    }

    #[test]
    fn binds_first_match_only() {
        let conn = Arc::new(FakeConnection::new());
        conn.set_initiator("/c/1", PEER);
        conn.set_initiator("/c/2", PEER);
        let mut ep = ChannelEndpoint::new(conn, ChannelType::StreamTube, PEER).unwrap();
        let batch = [
            details("/c/0", ChannelType::FileTransfer, PEER),
            details("/c/1", ChannelType::StreamTube, PEER),
            details("/c/2", ChannelType::StreamTube, PEER),
        ];
        assert!(ep.on_new_channels(&batch));
        assert_eq!(ep.object_path().map(ObjectPath::as_str), Some("/c/1"));
        assert!(!ep.on_new_channels(&[details("/c/3", ChannelType::StreamTube, PEER)]));
        assert_eq!(ep.object_path().map(ObjectPath::as_str), Some("/c/1"));
        assert!(!ep.is_initiator());
    }

    #[test]
    fn binds_on_initiator_match() {
        let conn = Arc::new(FakeConnection::new());
        conn.set_initiator("/c/9", PEER);
        let mut ep = ChannelEndpoint::new(conn, ChannelType::DBusTube, PEER).unwrap();
        assert!(ep.on_new_channels(&[details("/c/9", ChannelType::DBusTube, 77)]));
        assert_eq!(ep.initiator_handle(), Some(PEER));
    }

    #[test]
    fn skips_channel_whose_initiator_cannot_be_read() {
        let conn = Arc::new(FakeConnection::new());
        let mut ep = ChannelEndpoint::new(conn, ChannelType::DBusTube, PEER).unwrap();
        assert!(!ep.on_new_channels(&[details("/c/unknown", ChannelType::DBusTube, 77)]));
    }

    #[test]
    fn close_is_idempotent_and_swallows_errors() {
        let conn = Arc::new(FakeConnection::new());
        conn.fail_close(true);
        let mut ep = ChannelEndpoint::new(conn.clone(), ChannelType::StreamTube, PEER).unwrap();
        ep.request([]).unwrap();
        assert_eq!(ep.close(), Some(ChannelEvent::Closed));
        assert_eq!(ep.close(), None);
        assert_eq!(ep.dispose(), None);
        assert_eq!(conn.close_calls(), 1);
        assert!(ep.is_closed());
    }

    #[test]
    fn transport_closed_then_close_fires_once() {
        let conn = Arc::new(FakeConnection::new());
        let mut ep = ChannelEndpoint::new(conn.clone(), ChannelType::StreamTube, PEER).unwrap();
        let path = ep.request([]).unwrap().clone();
        assert_eq!(ep.on_channel_closed(&ObjectPath::new("/other")), None);
        assert_eq!(ep.on_channel_closed(&path), Some(ChannelEvent::Closed));
        assert_eq!(ep.close(), None);
        assert_eq!(ep.on_channel_closed(&path), None);
        assert_eq!(conn.close_calls(), 0);
    }

    #[test]
    fn closed_endpoint_ignores_announcements() {
        let conn = Arc::new(FakeConnection::new());
        conn.set_initiator("/c/1", PEER);
        let mut ep = ChannelEndpoint::new(conn, ChannelType::StreamTube, PEER).unwrap();
        ep.request([]).unwrap();
        ep.close();
        assert!(!ep.on_new_channels(&[details("/c/1", ChannelType::StreamTube, PEER)]));
    }

    #[test]
    fn ready_fires_once_and_only_when_bound() {
        let conn = Arc::new(FakeConnection::new());
        let mut ep = ChannelEndpoint::new(conn, ChannelType::StreamTube, PEER).unwrap();
        assert_eq!(ep.mark_ready(), None);
        ep.request([]).unwrap();
        assert_eq!(ep.mark_ready(), Some(ChannelEvent::Ready));
        assert_eq!(ep.mark_ready(), None);
    }

    #[test]
    fn drop_disposes() {
        let conn = Arc::new(FakeConnection::new());
        {
            let mut ep = ChannelEndpoint::new(conn.clone(), ChannelType::StreamTube, PEER).unwrap();
            ep.request([]).unwrap();
        }
        assert_eq!(conn.subscriptions(), 0);
        assert_eq!(conn.close_calls(), 1);
    }

    #[test]
    fn requested_channel_roles_and_close() {
        let proxy = FakeProxy::new();
        let mut ch =
            RequestedChannel::new(proxy.clone(), ObjectPath::new("/t/1"), SELF, PEER, PEER).unwrap();
        assert!(!ch.is_initiator());
        proxy.fail_close(true);
        assert_eq!(ch.close(), Some(ChannelEvent::Closed));
        assert_eq!(ch.close(), None);
        assert_eq!(ch.mark_closed(), None);
        assert_eq!(ch.mark_ready(), None);
        assert_eq!(proxy.close_calls(), 1);
    }

    #[test]
    fn requested_channel_validates_handles() {
        let p = FakeProxy::new();
        assert!(RequestedChannel::new(p.clone(), ObjectPath::new("/t"), SELF, SELF, 0).is_err());
        assert!(RequestedChannel::new(p.clone(), ObjectPath::new("/t"), SELF, SELF, SELF).is_err());
        assert!(RequestedChannel::new(p, ObjectPath::new("/t"), SELF, 0, PEER).is_err());
    }

    #[test]
    fn requested_channel_from_details() {
        let conn = FakeConnection::new();
        conn.set_initiator("/t/2", SELF);
        let ch = RequestedChannel::from_details(
            FakeProxy::new(),
            &conn,
            &details("/t/2", ChannelType::FileTransfer, PEER),
        )
        .unwrap();
        assert!(ch.is_initiator());
        assert_eq!(ch.target_handle(), PEER);
    }
}
