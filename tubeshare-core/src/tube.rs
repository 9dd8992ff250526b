//! Tube sessions: private message-bus tubes and bridged stream-socket tubes.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::channel::{ChannelError, ChannelEvent, RequestedChannel};
use crate::socket::{negotiate_socket_type, BridgeAddress, SocketAccessControl, SocketAddressType};
use crate::transport::{ChannelProxy, DBusTubeProxy, StreamTubeProxy, TubeChannelState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TubeStatus {
    NotOffered,
    /// Offered or accepted, waiting for the transport to open the tube.
    Pending,
    Open,
    Closed,
}

/// Common surface of both tube flavors.
pub trait Tube {
    type Address;

    fn service(&self) -> &str;
    fn address(&self) -> Option<&Self::Address>;
    fn status(&self) -> TubeStatus;
    fn is_initiator(&self) -> bool;

    /// Initiator offers at once; responder raises `TubeOffered` for the application.
    fn process(&mut self) -> Result<Option<ChannelEvent>, ChannelError> {
        if self.is_initiator() {
            self.offer()?;
            Ok(None)
        } else {
            Ok(Some(ChannelEvent::TubeOffered))
        }
    }

    fn offer(&mut self) -> Result<(), ChannelError>;
    fn accept(&mut self) -> Result<(), ChannelError>;
    fn on_state_changed(&mut self, state: TubeChannelState) -> Option<ChannelEvent>;
    fn on_closed(&mut self) -> Option<ChannelEvent>;
    fn close(&mut self) -> Option<ChannelEvent>;

    /// Application refuses an offered tube.
    fn reject(&mut self) -> Result<Option<ChannelEvent>, ChannelError> {
        if self.is_initiator() {
            return Err(ChannelError::WrongRole("responder"));
        }
        Ok(self.close())
    }
}

/// Shared state machine behind both flavors.
struct TubeCore<P: ChannelProxy> {
    channel: RequestedChannel<P>,
    service: String,
    status: TubeStatus,
}

impl<P: ChannelProxy> TubeCore<P> {
    fn check(&self, initiator: bool) -> Result<(), ChannelError> {
        if self.status == TubeStatus::Closed || self.channel.is_closed() {
            return Err(ChannelError::Closed);
        }
        if self.channel.is_initiator() != initiator {
            return Err(ChannelError::WrongRole(if initiator { "initiator" } else { "responder" }));
        }
        Ok(())
    }

    fn on_state_changed(&mut self, state: TubeChannelState) -> Option<ChannelEvent> {
        debug!(event = "tube_state", service = %self.service, ?state);
        if state != TubeChannelState::Open || self.status == TubeStatus::Closed {
            return None;
        }
        self.status = TubeStatus::Open;
        self.channel.mark_ready()
    }

    fn on_closed(&mut self) -> Option<ChannelEvent> {
        self.status = TubeStatus::Closed;
        self.channel.mark_closed()
    }

    fn close(&mut self) -> Option<ChannelEvent> {
        self.status = TubeStatus::Closed;
        self.channel.close()
    }
}

/// Tube carrying a private D-Bus connection between the peers.
pub struct DBusTube<P: DBusTubeProxy> {
    core: TubeCore<P>,
    parameters: BTreeMap<String, String>,
    bus_address: Option<String>,
}

impl<P: DBusTubeProxy> DBusTube<P> {
    pub fn new(channel: RequestedChannel<P>, service: impl Into<String>) -> Self {
        Self {
            core: TubeCore {
                channel,
                service: service.into(),
                status: TubeStatus::NotOffered,
            },
            parameters: BTreeMap::new(),
            bus_address: None,
        }
    }

    pub fn with_parameters(mut self, parameters: BTreeMap<String, String>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn channel(&self) -> &RequestedChannel<P> {
        &self.core.channel
    }
}

impl<P: DBusTubeProxy> Tube for DBusTube<P> {
    type Address = String;

    fn service(&self) -> &str {
        &self.core.service
    }

    fn address(&self) -> Option<&String> {
        self.bus_address.as_ref()
    }

    fn status(&self) -> TubeStatus {
        self.core.status
    }

    fn is_initiator(&self) -> bool {
        self.core.channel.is_initiator()
    }

    fn offer(&mut self) -> Result<(), ChannelError> {
        self.core.check(true)?;
        let addr = self.core.channel.proxy().offer(&self.parameters)?;
        info!(event = "tube_offered", service = %self.core.service, address = %addr);
        self.bus_address = Some(addr);
        self.core.status = TubeStatus::Pending;
        Ok(())
    }

    fn accept(&mut self) -> Result<(), ChannelError> {
        self.core.check(false)?;
        let addr = self.core.channel.proxy().accept()?;
        info!(event = "tube_accepted", service = %self.core.service, address = %addr);
        self.bus_address = Some(addr);
        self.core.status = TubeStatus::Pending;
        Ok(())
    }

    fn on_state_changed(&mut self, state: TubeChannelState) -> Option<ChannelEvent> {
        self.core.on_state_changed(state)
    }

    fn on_closed(&mut self) -> Option<ChannelEvent> {
        self.core.on_closed()
    }

    fn close(&mut self) -> Option<ChannelEvent> {
        self.core.close()
    }
}

/// Tube bridging a local stream socket to the peer.
pub struct StreamTube<P: StreamTubeProxy> {
    core: TubeCore<P>,
    socket_type: SocketAddressType,
    parameters: BTreeMap<String, String>,
    server_address: Option<BridgeAddress>,
    address: Option<BridgeAddress>,
}

impl<P: StreamTubeProxy> StreamTube<P> {
    /// Fails with `NoSupportedSocketType` when no family in `local` is usable by the remote.
    pub fn new(
        channel: RequestedChannel<P>,
        service: impl Into<String>,
        local: &[SocketAddressType],
    ) -> Result<Self, ChannelError> {
        let remote = channel.proxy().supported_socket_types()?;
        let socket_type =
            negotiate_socket_type(local, &remote).ok_or(ChannelError::NoSupportedSocketType)?;
        Ok(Self {
            core: TubeCore {
                channel,
                service: service.into(),
                status: TubeStatus::NotOffered,
            },
            socket_type,
            parameters: BTreeMap::new(),
            server_address: None,
            address: None,
        })
    }

    /// Local server socket that remote connections are bridged to when we offer.
    pub fn with_server_address(mut self, address: BridgeAddress) -> Self {
        self.server_address = Some(address);
        self
    }

    pub fn with_parameters(mut self, parameters: BTreeMap<String, String>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn socket_type(&self) -> SocketAddressType {
        self.socket_type
    }

    pub fn channel(&self) -> &RequestedChannel<P> {
        &self.core.channel
    }
}

impl<P: StreamTubeProxy> Tube for StreamTube<P> {
    type Address = BridgeAddress;

    fn service(&self) -> &str {
        &self.core.service
    }

    fn address(&self) -> Option<&BridgeAddress> {
        self.address.as_ref()
    }

    fn status(&self) -> TubeStatus {
        self.core.status
    }

    fn is_initiator(&self) -> bool {
        self.core.channel.is_initiator()
    }

    fn offer(&mut self) -> Result<(), ChannelError> {
        self.core.check(true)?;
        let server = self.server_address.clone().ok_or(ChannelError::NoServerAddress)?;
        self.core
            .channel
            .proxy()
            .offer(&server, SocketAccessControl::Localhost, &self.parameters)?;
        info!(event = "tube_offered", service = %self.core.service, address = %server);
        self.address = Some(server);
        self.core.status = TubeStatus::Pending;
        Ok(())
    }

    fn accept(&mut self) -> Result<(), ChannelError> {
        self.core.check(false)?;
        let raw = self
            .core
            .channel
            .proxy()
            .accept(self.socket_type, SocketAccessControl::Localhost)?;
        let addr = BridgeAddress::from_bytes(self.socket_type, &raw)?;
        info!(event = "tube_accepted", service = %self.core.service, address = %addr);
        self.address = Some(addr);
        self.core.status = TubeStatus::Pending;
        Ok(())
    }

    fn on_state_changed(&mut self, state: TubeChannelState) -> Option<ChannelEvent> {
        self.core.on_state_changed(state)
    }

    fn on_closed(&mut self) -> Option<ChannelEvent> {
        self.core.on_closed()
    }

    fn close(&mut self) -> Option<ChannelEvent> {
        self.core.close()
    }
}
