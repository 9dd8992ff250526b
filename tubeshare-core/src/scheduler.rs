//! Transfer scheduler: starts ready transfers up to a concurrency limit and keeps aggregate counters.

use tracing::{debug, info};

use crate::registry::{RegistryError, TransferRegistry};
use crate::transfer::{Transfer, TransferState};

/// Default number of transfers running at once.
pub const DEFAULT_MAX_CONCURRENT: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent<K> {
    /// Host should begin moving bytes for this transfer.
    Start(K),
    Finished(K, TransferState),
    /// Nothing queued or running.
    Completed,
}

/// Aggregate counters across everything queued since the last completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub total: usize,
    pub in_progress: usize,
    pub bytes_expected: u64,
    pub bytes_transferred: u64,
}

pub struct TransferScheduler<T: Transfer> {
    registry: TransferRegistry<T>,
    max_concurrent: usize,
    stats: SchedulerStats,
}

impl<T: Transfer> TransferScheduler<T> {
    /// `max_concurrent` 0 uses the default.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            registry: TransferRegistry::new(),
            max_concurrent: if max_concurrent == 0 {
                DEFAULT_MAX_CONCURRENT
            } else {
                max_concurrent
            },
            stats: SchedulerStats::default(),
        }
    }

    pub fn registry(&self) -> &TransferRegistry<T> {
        &self.registry
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }

    pub fn queue(&mut self, transfer: T) -> Result<(), RegistryError> {
        let expected = transfer.bytes_expected();
        let key = transfer.key().clone();
        self.registry.queue(transfer)?;
        self.stats.total += 1;
        self.stats.bytes_expected += expected;
        debug!(event = "transfer_queued", key = ?key, total = self.stats.total);
        Ok(())
    }

    /// Transfer's resource is usable; start it if a slot is free.
    pub fn mark_ready(&mut self, key: &T::Key) -> Vec<SchedulerEvent<T::Key>> {
        let changed = self
            .registry
            .with(key, |t| {
                if t.state() == TransferState::Queued {
                    t.set_state(TransferState::Ready);
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false);
        if !changed {
            return Vec::new();
        }
        self.start_ready()
    }

    /// Start Ready transfers in queue order while slots are free.
    pub fn start_ready(&mut self) -> Vec<SchedulerEvent<T::Key>> {
        let mut events = Vec::new();
        while self.stats.in_progress < self.max_concurrent {
            let Some(key) = self.registry.ready().first().map(|t| t.key().clone()) else {
                break;
            };
            self.registry
                .with(&key, |t| t.set_state(TransferState::InProgress));
            self.stats.in_progress += 1;
            info!(event = "transfer_started", key = ?key, in_progress = self.stats.in_progress);
            events.push(SchedulerEvent::Start(key));
        }
        events
    }

    /// Replace a transfer's expected size in the aggregate once it is known.
    pub fn expect(&mut self, key: &T::Key, bytes: u64) {
        let Some(prev) = self.registry.with(key, |t| {
            let prev = t.bytes_expected();
            t.set_bytes_expected(bytes);
            prev
        }) else {
            return;
        };
        self.stats.bytes_expected = self.stats.bytes_expected.saturating_sub(prev).saturating_add(bytes);
    }

    /// Add `delta` bytes to the aggregate.
    pub fn progress(&mut self, delta: u64) {
        self.stats.bytes_transferred += delta;
    }

    /// Transfer ended as `Completed` or `Failed`.
    pub fn finish(&mut self, key: &T::Key, state: TransferState) -> Vec<SchedulerEvent<T::Key>> {
        let Some((was, expected, moved)) = self.registry.with(key, |t| {
            let was = t.state();
            t.set_state(state);
            (was, t.bytes_expected(), t.bytes_transferred())
        }) else {
            return Vec::new();
        };
        if state != TransferState::Completed {
            self.subtract(key, expected, moved);
        }
        for t in self.registry.cleanup() {
            debug!(event = "transfer_retired", key = ?t.key(), state = ?t.state());
        }
        self.retire(key.clone(), was, state, true)
    }

    /// Cancel one transfer. A transfer that never moved bytes does not free a slot for new starts.
    pub fn cancel(&mut self, key: &T::Key) -> Vec<SchedulerEvent<T::Key>> {
        let Some((was, expected, moved)) = self
            .registry
            .with(key, |t| (t.state(), t.bytes_expected(), t.bytes_transferred()))
        else {
            return Vec::new();
        };
        if was.is_terminal() {
            return Vec::new();
        }
        self.registry.cancel(key);
        self.subtract(key, expected, moved);
        self.retire(key.clone(), was, TransferState::Cancelled, moved > 0)
    }

    pub fn cancel_all(&mut self) -> Vec<SchedulerEvent<T::Key>> {
        let mut events = Vec::new();
        for key in self.registry.keys() {
            events.extend(self.cancel(&key));
        }
        events
    }

    /// Drop a failed or cancelled transfer's share from the aggregate.
    fn subtract(&mut self, key: &T::Key, expected: u64, moved: u64) {
        if expected == 0 && moved == 0 {
            return;
        }
        debug!(event = "transfer_bytes_discounted", key = ?key, expected, moved);
        self.stats.bytes_expected = self.stats.bytes_expected.saturating_sub(expected);
        self.stats.bytes_transferred = self.stats.bytes_transferred.saturating_sub(moved);
    }

    fn retire(
        &mut self,
        key: T::Key,
        was: TransferState,
        state: TransferState,
        restart: bool,
    ) -> Vec<SchedulerEvent<T::Key>> {
        let mut events = vec![SchedulerEvent::Finished(key, state)];
        if was == TransferState::InProgress {
            self.stats.in_progress = self.stats.in_progress.saturating_sub(1);
        }
        self.stats.total = self.stats.total.saturating_sub(1);
        if restart {
            events.extend(self.start_ready());
        }
        if self.stats.total == 0 && self.stats.in_progress == 0 {
            info!(event = "transfers_completed");
            self.stats = SchedulerStats::default();
            events.push(SchedulerEvent::Completed);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::tests::FakeResource;
    use crate::transfer::DeferredTransfer;

    type Dt = DeferredTransfer<u32, FakeResource>;

    fn sched_with(n: u32) -> TransferScheduler<Dt> {
        let mut s = TransferScheduler::new(2);
        for k in 1..=n {
            s.queue(DeferredTransfer::new(k, 100)).unwrap();
        }
        s
    }

    #[test]
    fn starts_up_to_limit_in_order() {
        let mut s = sched_with(3);
        assert_eq!(s.mark_ready(&1), vec![SchedulerEvent::Start(1)]);
        assert_eq!(s.mark_ready(&2), vec![SchedulerEvent::Start(2)]);
        assert!(s.mark_ready(&3).is_empty());
        assert_eq!(s.stats().in_progress, 2);
        assert_eq!(s.stats().bytes_expected, 300);

        assert_eq!(
            s.finish(&1, TransferState::Completed),
            vec![SchedulerEvent::Finished(1, TransferState::Completed), SchedulerEvent::Start(3)]
        );
        assert_eq!(s.registry().state(&3), Some(TransferState::InProgress));
        assert!(!s.registry().contains(&1));
    }

    #[test]
    fn completed_when_everything_done() {
        let mut s = sched_with(1);
        s.mark_ready(&1);
        s.progress(100);
        assert_eq!(
            s.finish(&1, TransferState::Completed),
            vec![SchedulerEvent::Finished(1, TransferState::Completed), SchedulerEvent::Completed]
        );
        assert_eq!(s.stats(), SchedulerStats::default());
    }

    #[test]
    fn mark_ready_twice_is_noop() {
        let mut s = sched_with(1);
        s.mark_ready(&1);
        assert!(s.mark_ready(&1).is_empty());
        assert!(s.mark_ready(&99).is_empty());
    }

    #[test]
    fn cancel_without_bytes_does_not_start_next() {
        let mut s = TransferScheduler::<Dt>::new(1);
        s.queue(DeferredTransfer::new(1, 100)).unwrap();
        s.queue(DeferredTransfer::new(2, 100)).unwrap();
        s.mark_ready(&1);
        s.mark_ready(&2);
        assert_eq!(s.cancel(&1), vec![SchedulerEvent::Finished(1, TransferState::Cancelled)]);
        assert_eq!(s.stats().in_progress, 0);
        assert_eq!(s.start_ready(), vec![SchedulerEvent::Start(2)]);
    }

    #[test]
    fn cancel_with_bytes_restarts_and_discounts() {
        let mut s = TransferScheduler::<Dt>::new(1);
        s.queue(DeferredTransfer::new(1, 100)).unwrap();
        s.queue(DeferredTransfer::new(2, 100)).unwrap();
        s.mark_ready(&1);
        s.mark_ready(&2);
        let delta = s.registry().with(&1, |t| t.progress(40)).unwrap();
        s.progress(delta);
        assert_eq!(
            s.cancel(&1),
            vec![SchedulerEvent::Finished(1, TransferState::Cancelled), SchedulerEvent::Start(2)]
        );
        assert_eq!(s.stats().bytes_transferred, 0);
        assert!(s.registry().is_cancel_pending(&1));
    }

    #[test]
    fn failed_transfer_discounts_bytes() {
        let mut s = sched_with(2);
        s.mark_ready(&1);
        s.mark_ready(&2);
        let d1 = s.registry().with(&1, |t| t.progress(30)).unwrap();
        let d2 = s.registry().with(&2, |t| t.progress(50)).unwrap();
        s.progress(d1 + d2);
        assert_eq!(s.stats().bytes_expected, 200);
        s.finish(&1, TransferState::Failed);
        assert_eq!(s.stats().bytes_transferred, 50);
        assert_eq!(s.stats().bytes_expected, 100);
        assert_eq!(s.stats().total, 1);
    }

    #[test]
    fn late_size_replaces_expected() {
        let mut s = TransferScheduler::new(1);
        s.queue(Dt::new(1, 0)).unwrap();
        s.queue(Dt::new(2, 0)).unwrap();
        s.expect(&1, 4096);
        s.expect(&1, 2048);
        s.expect(&9, 100);
        assert_eq!(s.stats().bytes_expected, 2048);
        s.finish(&1, TransferState::Failed);
        assert_eq!(s.stats().bytes_expected, 0);
    }

    #[test]
    fn cancelled_transfer_discounts_expected_bytes() {
        let mut s = sched_with(2);
        s.mark_ready(&1);
        s.cancel(&2);
        assert_eq!(s.stats().bytes_expected, 100);
        assert_eq!(s.stats().bytes_transferred, 0);
    }

    #[test]
    fn cancel_all_reports_completed_once() {
        let mut s = sched_with(3);
        s.mark_ready(&1);
        let events = s.cancel_all();
        assert_eq!(
            events.iter().filter(|e| **e == SchedulerEvent::Completed).count(),
            1
        );
        assert_eq!(events.last(), Some(&SchedulerEvent::Completed));
        assert!(s.registry().is_empty());
    }
}
