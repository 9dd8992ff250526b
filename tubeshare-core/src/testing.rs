//! In-memory connection and channel proxies for unit tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::socket::{BridgeAddress, SocketAccessControl, SocketAddressType, SocketTypeMap};
use crate::transport::{
    ChannelProxy, ChannelRequest, ChannelType, Connection, DBusTubeProxy, FileTransferProxy,
    Handle, Notification, ObjectPath, PendingReply, ReplySender, StreamTubeProxy,
    SubscriptionId, TransportError,
};

pub const SELF: Handle = 1;
pub const PEER: Handle = 2;

pub const ACCEPT_ADDRESS: &[u8] = b"/tmp/tubeshare-test/accept.sock";
pub const BUS_ADDRESS: &str = "unix:path=/tmp/tubeshare-test/bus";

#[derive(Default)]
struct ConnState {
    next_id: u64,
    active: HashSet<u64>,
    initiators: HashMap<String, Handle>,
    requests: Vec<ChannelRequest>,
    close_calls: usize,
    fail_close: bool,
    fail_unsubscribe: bool,
}

pub struct FakeConnection {
    state: Mutex<ConnState>,
}

impl FakeConnection {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ConnState::default()),
        }
    }

    pub fn set_initiator(&self, path: &str, handle: Handle) {
        self.state.lock().unwrap().initiators.insert(path.to_string(), handle);
    }

    pub fn fail_close(&self, fail: bool) {
        let mut s = self.state.lock().unwrap();
        s.fail_close = fail;
        s.fail_unsubscribe = fail;
    }

    pub fn subscriptions(&self) -> usize {
        self.state.lock().unwrap().active.len()
    }

    pub fn close_calls(&self) -> usize {
        self.state.lock().unwrap().close_calls
    }

    pub fn last_request(&self) -> Option<ChannelRequest> {
        self.state.lock().unwrap().requests.last().cloned()
    }
}

impl Connection for FakeConnection {
    fn self_handle(&self) -> Handle {
        SELF
    }

    fn supports(&self, channel_type: &ChannelType) -> bool {
        !matches!(channel_type, ChannelType::Other(_))
    }

    fn ensure_channel(&self, request: &ChannelRequest) -> Result<ObjectPath, TransportError> {
        let mut s = self.state.lock().unwrap();
        s.requests.push(request.clone());
        Ok(ObjectPath::new(format!("/conn/channel/{}", s.requests.len())))
    }

    fn initiator_handle(&self, path: &ObjectPath) -> Result<Handle, TransportError> {
        self.state
            .lock()
            .unwrap()
            .initiators
            .get(path.as_str())
            .copied()
            .ok_or_else(|| TransportError::call("Get", "no such channel"))
    }

    fn close_channel(&self, _path: &ObjectPath) -> Result<(), TransportError> {
        let mut s = self.state.lock().unwrap();
        s.close_calls += 1;
        if s.fail_close {
            return Err(TransportError::Disconnected);
        }
        Ok(())
    }

    fn subscribe(&self, _n: Notification) -> Result<SubscriptionId, TransportError> {
        let mut s = self.state.lock().unwrap();
        s.next_id += 1;
        let id = s.next_id;
        s.active.insert(id);
        Ok(SubscriptionId(id))
    }

    fn unsubscribe(&self, id: SubscriptionId) -> Result<(), TransportError> {
        let mut s = self.state.lock().unwrap();
        s.active.remove(&id.0);
        if s.fail_unsubscribe {
            return Err(TransportError::Disconnected);
        }
        Ok(())
    }
}

struct ProxyState {
    socket_types: SocketTypeMap,
    close_calls: usize,
    fail_close: bool,
    reject: bool,
    offered: Vec<BridgeAddress>,
    accept_calls: usize,
    accept_offset: Option<u64>,
    provide_reply: Option<ReplySender<Vec<u8>>>,
}

/// One proxy implementing every channel interface; clones share state.
#[derive(Clone)]
pub struct FakeProxy {
    state: Arc<Mutex<ProxyState>>,
}

pub fn localhost_types(types: &[SocketAddressType]) -> SocketTypeMap {
    types
        .iter()
        .map(|t| (*t, vec![SocketAccessControl::Localhost]))
        .collect()
}

impl FakeProxy {
    pub fn new() -> Self {
        Self::with_socket_types(localhost_types(&[
            SocketAddressType::Unix,
            SocketAddressType::Ipv4,
        ]))
    }

    pub fn with_socket_types(socket_types: SocketTypeMap) -> Self {
        Self {
            state: Arc::new(Mutex::new(ProxyState {
                socket_types,
                close_calls: 0,
                fail_close: false,
                reject: false,
                offered: Vec::new(),
                accept_calls: 0,
                accept_offset: None,
                provide_reply: None,
            })),
        }
    }

    pub fn fail_close(&self, fail: bool) {
        self.state.lock().unwrap().fail_close = fail;
    }

    pub fn reject(&self, reject: bool) {
        self.state.lock().unwrap().reject = reject;
    }

    pub fn close_calls(&self) -> usize {
        self.state.lock().unwrap().close_calls
    }

    pub fn accept_calls(&self) -> usize {
        self.state.lock().unwrap().accept_calls
    }

    pub fn accept_offset(&self) -> Option<u64> {
        self.state.lock().unwrap().accept_offset
    }

    pub fn offered(&self) -> Vec<BridgeAddress> {
        self.state.lock().unwrap().offered.clone()
    }

    /// Complete an outstanding provide call. False if none was made.
    pub fn complete_provide(&self, reply: Result<Vec<u8>, TransportError>) -> bool {
        match self.state.lock().unwrap().provide_reply.take() {
            Some(tx) => tx.send(reply),
            None => false,
        }
    }

    fn check_reject(&self) -> Result<(), TransportError> {
        if self.state.lock().unwrap().reject {
            return Err(TransportError::Rejected);
        }
        Ok(())
    }
}

impl ChannelProxy for FakeProxy {
    fn close(&self) -> Result<(), TransportError> {
        let mut s = self.state.lock().unwrap();
        s.close_calls += 1;
        if s.fail_close {
            return Err(TransportError::call("Close", "channel already gone"));
        }
        Ok(())
    }
}

impl DBusTubeProxy for FakeProxy {
    fn offer(&self, _parameters: &BTreeMap<String, String>) -> Result<String, TransportError> {
        self.check_reject()?;
        Ok(BUS_ADDRESS.to_string())
    }

    fn accept(&self) -> Result<String, TransportError> {
        self.check_reject()?;
        self.state.lock().unwrap().accept_calls += 1;
        Ok(BUS_ADDRESS.to_string())
    }
}

impl StreamTubeProxy for FakeProxy {
    fn supported_socket_types(&self) -> Result<SocketTypeMap, TransportError> {
        Ok(self.state.lock().unwrap().socket_types.clone())
    }

    fn offer(
        &self,
        address: &BridgeAddress,
        _access: SocketAccessControl,
        _parameters: &BTreeMap<String, String>,
    ) -> Result<(), TransportError> {
        self.check_reject()?;
        self.state.lock().unwrap().offered.push(address.clone());
        Ok(())
    }

    fn accept(
        &self,
        _address_type: SocketAddressType,
        _access: SocketAccessControl,
    ) -> Result<Vec<u8>, TransportError> {
        self.check_reject()?;
        self.state.lock().unwrap().accept_calls += 1;
        Ok(ACCEPT_ADDRESS.to_vec())
    }
}

impl FileTransferProxy for FakeProxy {
    fn available_socket_types(&self) -> Result<SocketTypeMap, TransportError> {
        Ok(self.state.lock().unwrap().socket_types.clone())
    }

    fn provide_file(
        &self,
        _address_type: SocketAddressType,
        _access: SocketAccessControl,
    ) -> PendingReply<Vec<u8>> {
        let (tx, reply) = PendingReply::channel();
        self.state.lock().unwrap().provide_reply = Some(tx);
        reply
    }

    fn accept_file(
        &self,
        _address_type: SocketAddressType,
        _access: SocketAccessControl,
        offset: u64,
    ) -> Result<Vec<u8>, TransportError> {
        self.check_reject()?;
        let mut s = self.state.lock().unwrap();
        s.accept_calls += 1;
        s.accept_offset = Some(offset);
        Ok(ACCEPT_ADDRESS.to_vec())
    }
}
