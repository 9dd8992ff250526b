//! Keyed transfer registry with a side table for cancellations that outran their resource.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use crate::transfer::{BindOutcome, DeferredTransfer, Transfer, TransferResource, TransferState};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("a live transfer is already registered for {0}")]
    Duplicate(String),
}

/// Where a late-arriving resource went.
#[derive(Debug, PartialEq, Eq)]
pub enum Arrival<R> {
    Bound,
    /// The transfer was cancelled first; the resource was cancelled and the stale entry dropped.
    CancelledOnArrival,
    /// No transfer knows the key; the resource is handed back.
    Unknown(R),
}

struct Inner<T: Transfer> {
    active: Vec<T>,
    cancelled: HashMap<T::Key, T>,
}

impl<T: Transfer> Inner<T> {
    fn position(&self, key: &T::Key) -> Option<usize> {
        self.active.iter().position(|t| t.key() == key)
    }

    /// Take a terminal transfer out of the active set. Deferred cancels go to the side table.
    fn retire(&mut self, pos: usize) -> Option<T> {
        let t = self.active.remove(pos);
        if t.cancel_pending() {
            debug!(event = "cancel_deferred", key = ?t.key());
            self.cancelled.insert(t.key().clone(), t);
            None
        } else {
            Some(t)
        }
    }

    fn install(&mut self, transfer: T) -> Result<(), RegistryError> {
        let key = transfer.key().clone();
        if self.position(&key).is_some() {
            return Err(RegistryError::Duplicate(format!("{:?}", key)));
        }
        if let Some(mut stale) = self.cancelled.remove(&key) {
            info!(event = "stale_transfer_disposed", key = ?key);
            stale.dispose();
        }
        self.active.push(transfer);
        Ok(())
    }
}

/// Registry of transfers, at most one live transfer per key, kept in queue order.
pub struct TransferRegistry<T: Transfer> {
    inner: Mutex<Inner<T>>,
}

impl<T: Transfer> TransferRegistry<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                active: Vec::new(),
                cancelled: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install a transfer in whatever state it carries. See `queue` for stale entries.
    pub fn add(&self, transfer: T) -> Result<(), RegistryError> {
        self.lock().install(transfer)
    }

    pub fn remove(&self, key: &T::Key) -> Option<T> {
        let mut inner = self.lock();
        let pos = inner.position(key)?;
        Some(inner.active.remove(pos))
    }

    /// Install a transfer as Queued. A stale deferred-cancel entry under the same key is disposed first;
    /// a live one is an error.
    pub fn queue(&self, mut transfer: T) -> Result<(), RegistryError> {
        transfer.set_state(TransferState::Queued);
        self.lock().install(transfer)
    }

    /// Cancel the live transfer under `key` and take it out of the active set.
    /// Returns the removed transfer unless its cancel was deferred.
    pub fn cancel(&self, key: &T::Key) -> Option<T> {
        let mut inner = self.lock();
        let pos = inner.position(key)?;
        inner.active[pos].cancel();
        inner.retire(pos)
    }

    /// Remove every terminal transfer. Deferred cancels move to the side table; the rest are returned.
    pub fn cleanup(&self) -> Vec<T> {
        let mut inner = self.lock();
        let mut out = Vec::new();
        let mut i = 0;
        while i < inner.active.len() {
            if inner.active[i].state().is_terminal() {
                out.extend(inner.retire(i));
            } else {
                i += 1;
            }
        }
        out
    }

    /// Run `f` on the live transfer under `key`.
    pub fn with<R>(&self, key: &T::Key, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut inner = self.lock();
        let pos = inner.position(key)?;
        Some(f(&mut inner.active[pos]))
    }

    pub fn state(&self, key: &T::Key) -> Option<TransferState> {
        self.with(key, |t| t.state())
    }

    pub fn is_cancel_pending(&self, key: &T::Key) -> bool {
        self.lock().cancelled.contains_key(key)
    }

    pub fn contains(&self, key: &T::Key) -> bool {
        self.lock().position(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<T::Key> {
        self.lock().active.iter().map(|t| t.key().clone()).collect()
    }

    /// Transfers in `Queued`, under the registry lock for as long as the view lives.
    pub fn queued(&self) -> Filtered<'_, T> {
        Filtered {
            guard: self.lock(),
            state: TransferState::Queued,
        }
    }

    /// Transfers in `Ready`, under the registry lock for as long as the view lives.
    pub fn ready(&self) -> Filtered<'_, T> {
        Filtered {
            guard: self.lock(),
            state: TransferState::Ready,
        }
    }
}

impl<T: Transfer> Default for TransferRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, R> TransferRegistry<DeferredTransfer<K, R>>
where
    K: Clone + Eq + Hash + Debug,
    R: TransferResource,
{
    /// Route a transport resource that materialized for `key`.
    pub fn resource_arrived(&self, key: &K, resource: R) -> Arrival<R> {
        let mut inner = self.lock();
        if let Some(pos) = inner.position(key) {
            return match inner.active[pos].bind(resource) {
                BindOutcome::Bound => Arrival::Bound,
                BindOutcome::CancelledOnArrival => Arrival::CancelledOnArrival,
            };
        }
        match inner.cancelled.remove(key) {
            Some(mut stale) => {
                stale.bind(resource);
                stale.dispose();
                info!(event = "late_resource_cancelled", key = ?key);
                Arrival::CancelledOnArrival
            }
            None => Arrival::Unknown(resource),
        }
    }
}

/// Lock-holding view over transfers in one state. `iter` may be called repeatedly.
pub struct Filtered<'a, T: Transfer> {
    guard: MutexGuard<'a, Inner<T>>,
    state: TransferState,
}

impl<'a, T: Transfer> Filtered<'a, T> {
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        let state = self.state;
        self.guard.active.iter().filter(move |t| t.state() == state)
    }

    pub fn keys(&self) -> Vec<T::Key> {
        self.iter().map(|t| t.key().clone()).collect()
    }

    pub fn first(&self) -> Option<&T> {
        self.iter().next()
    }

    pub fn count(&self) -> usize {
        self.iter().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::tests::FakeResource;
    use crate::transfer::CancelState;

    type Dt = DeferredTransfer<String, FakeResource>;

    fn t(key: &str) -> Dt {
        DeferredTransfer::new(key.to_string(), 100)
    }

    #[test]
    fn queue_rejects_live_duplicate() {
        let reg = TransferRegistry::new();
        reg.queue(t("a")).unwrap();
        assert_eq!(
            reg.queue(t("a")).unwrap_err(),
            RegistryError::Duplicate("\"a\"".into())
        );
        assert_eq!(reg.len(), 1);
        assert!(reg.add(t("a")).is_err());
    }

    #[test]
    fn deferred_cancel_then_requeue() {
        let reg = TransferRegistry::new();
        reg.queue(t("k")).unwrap();
        assert!(reg.cancel(&"k".to_string()).is_none());
        assert!(!reg.contains(&"k".to_string()));
        assert!(reg.is_cancel_pending(&"k".to_string()));

        reg.queue(t("k")).unwrap();
        assert!(!reg.is_cancel_pending(&"k".to_string()));
        assert_eq!(reg.state(&"k".to_string()), Some(TransferState::Queued));
        let res = FakeResource::default();
        assert_eq!(reg.resource_arrived(&"k".to_string(), res.clone()), Arrival::Bound);
        assert_eq!(res.cancels(), 0);
    }

    #[test]
    fn add_disposes_stale_deferred_cancel() {
        let reg: TransferRegistry<Dt> = TransferRegistry::new();
        reg.queue(t("k")).unwrap();
        reg.cancel(&"k".to_string());
        assert!(reg.is_cancel_pending(&"k".to_string()));

        reg.add(t("k")).unwrap();
        assert!(!reg.is_cancel_pending(&"k".to_string()));
        assert!(reg.contains(&"k".to_string()));
        let res = FakeResource::default();
        assert_eq!(reg.resource_arrived(&"k".to_string(), res.clone()), Arrival::Bound);
        assert_eq!(res.cancels(), 0);
    }

    #[test]
    fn late_resource_for_cancelled_transfer_is_cancelled() {
        let reg: TransferRegistry<Dt> = TransferRegistry::new();
        reg.queue(t("k")).unwrap();
        reg.cancel(&"k".to_string());
        let res = FakeResource::default();
        assert_eq!(
            reg.resource_arrived(&"k".to_string(), res.clone()),
            Arrival::CancelledOnArrival
        );
        assert_eq!(res.cancels(), 1);
        assert!(!reg.is_cancel_pending(&"k".to_string()));
    }

    #[test]
    fn unknown_resource_is_handed_back() {
        let reg: TransferRegistry<Dt> = TransferRegistry::new();
        let res = FakeResource::default();
        assert!(matches!(
            reg.resource_arrived(&"nope".to_string(), res.clone()),
            Arrival::Unknown(_)
        ));
        assert_eq!(res.cancels(), 0);
    }

    #[test]
    fn cancel_with_resource_is_removed_outright() {
        let reg: TransferRegistry<Dt> = TransferRegistry::new();
        reg.queue(t("k")).unwrap();
        let res = FakeResource::default();
        reg.resource_arrived(&"k".to_string(), res.clone());
        let removed = reg.cancel(&"k".to_string()).unwrap();
        assert_eq!(removed.cancel_state(), CancelState::Cancelled);
        assert_eq!(res.cancels(), 1);
        assert!(!reg.is_cancel_pending(&"k".to_string()));
    }

    #[test]
    fn cleanup_moves_pending_and_returns_finished() {
        let reg: TransferRegistry<Dt> = TransferRegistry::new();
        for k in ["a", "b", "c"] {
            reg.queue(t(k)).unwrap();
        }
        reg.with(&"a".to_string(), |x| x.set_state(TransferState::Completed));
        reg.with(&"b".to_string(), |x| x.cancel());
        let done = reg.cleanup();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].key(), "a");
        assert!(reg.is_cancel_pending(&"b".to_string()));
        assert_eq!(reg.keys(), vec!["c".to_string()]);
    }

    #[test]
    fn filtered_views_are_restartable() {
        let reg: TransferRegistry<Dt> = TransferRegistry::new();
        for k in ["a", "b", "c"] {
            reg.queue(t(k)).unwrap();
        }
        reg.with(&"b".to_string(), |x| x.set_state(TransferState::Ready));
        {
            let q = reg.queued();
            assert_eq!(q.keys(), vec!["a".to_string(), "c".to_string()]);
            assert_eq!(q.count(), 2);
            assert_eq!(q.first().map(|x| x.key().as_str()), Some("a"));
        }
        assert_eq!(reg.ready().keys(), vec!["b".to_string()]);
        assert!(reg.remove(&"b".to_string()).is_some());
        assert_eq!(reg.ready().count(), 0);
    }
}
