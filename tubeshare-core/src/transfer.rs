//! Transfers and deferred cancellation of transfers whose transport resource may not exist yet.

use std::fmt::Debug;
use std::hash::Hash;

use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferState {
    Queued,
    Ready,
    InProgress,
    Completed,
    Cancelled,
    Failed,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

/// A unit of work tracked by a registry.
pub trait Transfer {
    type Key: Clone + Eq + Hash + Debug;

    fn key(&self) -> &Self::Key;
    fn state(&self) -> TransferState;
    fn set_state(&mut self, state: TransferState);
    fn cancel(&mut self);

    /// Cancellation was requested before the transport resource existed.
    fn cancel_pending(&self) -> bool {
        false
    }

    /// Release anything still held. Called when a stale entry is replaced.
    fn dispose(&mut self) {}

    fn bytes_expected(&self) -> u64 {
        0
    }

    /// Size learned after queueing, e.g. from the resource.
    fn set_bytes_expected(&mut self, _bytes: u64) {}

    fn bytes_transferred(&self) -> u64 {
        0
    }
}

/// Transport object backing a transfer, e.g. a file-transfer session.
pub trait TransferResource {
    /// Best-effort; never fails.
    fn cancel(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelState {
    Active,
    /// Cancel requested with no resource yet; the resource is cancelled when it arrives.
    PendingCancel,
    Cancelled,
}

#[derive(Debug, PartialEq, Eq)]
pub enum BindOutcome {
    Bound,
    /// Cancellation came first; the resource was cancelled on arrival.
    CancelledOnArrival,
}

/// Transfer bound, possibly late, to a transport resource.
pub struct DeferredTransfer<K, R> {
    key: K,
    state: TransferState,
    cancel: CancelState,
    resource: Option<R>,
    bytes_expected: u64,
    bytes_transferred: u64,
}

impl<K, R> DeferredTransfer<K, R>
where
    K: Clone + Eq + Hash + Debug,
    R: TransferResource,
{
    pub fn new(key: K, bytes_expected: u64) -> Self {
        Self {
            key,
            state: TransferState::Queued,
            cancel: CancelState::Active,
            resource: None,
            bytes_expected,
            bytes_transferred: 0,
        }
    }

    /// Attach the transport resource. Cancels it at once if cancellation was already requested.
    pub fn bind(&mut self, mut resource: R) -> BindOutcome {
        match self.cancel {
            CancelState::Active => {
                self.resource = Some(resource);
                BindOutcome::Bound
            }
            CancelState::PendingCancel | CancelState::Cancelled => {
                debug!(event = "late_resource_cancelled", key = ?self.key);
                resource.cancel();
                self.cancel = CancelState::Cancelled;
                BindOutcome::CancelledOnArrival
            }
        }
    }

    /// Record progress. Returns the delta added.
    pub fn progress(&mut self, transferred: u64) -> u64 {
        let delta = transferred.saturating_sub(self.bytes_transferred);
        self.bytes_transferred = self.bytes_transferred.max(transferred);
        delta
    }

    pub fn cancel_state(&self) -> CancelState {
        self.cancel
    }

    pub fn resource(&self) -> Option<&R> {
        self.resource.as_ref()
    }

    pub fn resource_mut(&mut self) -> Option<&mut R> {
        self.resource.as_mut()
    }
}

impl<K, R> Transfer for DeferredTransfer<K, R>
where
    K: Clone + Eq + Hash + Debug,
    R: TransferResource,
{
    type Key = K;

    fn key(&self) -> &K {
        &self.key
    }

    fn state(&self) -> TransferState {
        self.state
    }

    fn set_state(&mut self, state: TransferState) {
        self.state = state;
    }

    /// No-op on finished transfers. Without a resource the cancel is deferred.
    fn cancel(&mut self) {
        if self.state.is_terminal() && self.state != TransferState::Cancelled {
            return;
        }
        self.state = TransferState::Cancelled;
        match (self.cancel, self.resource.as_mut()) {
            (CancelState::Cancelled, _) => {}
            (_, Some(r)) => {
                r.cancel();
                self.cancel = CancelState::Cancelled;
            }
            (_, None) => self.cancel = CancelState::PendingCancel,
        }
    }

    fn cancel_pending(&self) -> bool {
        self.cancel == CancelState::PendingCancel
    }

    fn dispose(&mut self) {
        if let Some(mut r) = self.resource.take() {
            if self.cancel != CancelState::Cancelled && !self.state.is_terminal() {
                r.cancel();
            }
        }
        if self.cancel == CancelState::PendingCancel {
            self.cancel = CancelState::Cancelled;
        }
    }

    fn bytes_expected(&self) -> u64 {
        self.bytes_expected
    }

    fn set_bytes_expected(&mut self, bytes: u64) {
        self.bytes_expected = bytes;
    }

    fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }
}
