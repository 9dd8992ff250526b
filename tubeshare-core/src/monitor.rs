//! Aggregate completion tracking over many keyed chunked downloads.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::chunk::ChunkDelivery;
use crate::download::{ChunkedDownload, DownloadId, Progress, SequenceError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent<K> {
    DownloadFinished(K),
    AllFinished,
    AllProcessed,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MonitorError {
    #[error("cannot add while monitoring")]
    Monitoring,
    #[error("download {0} already registered")]
    DuplicateKey(String),
    #[error("no download registered for {0}")]
    UnknownKey(String),
    #[error(transparent)]
    Sequence(#[from] SequenceError),
}

struct Entry<K, A> {
    key: K,
    download: ChunkedDownload,
    associated: Option<A>,
}

struct Inner<K, A> {
    entries: Vec<Entry<K, A>>,
    index: HashMap<K, usize>,
    active: bool,
    all_finished_fired: bool,
    all_processed_fired: bool,
}

impl<K: Clone + Eq + Hash + Debug, A> Inner<K, A> {
    fn entry_mut(&mut self, key: &K) -> Result<&mut Entry<K, A>, MonitorError> {
        match self.index.get(key) {
            Some(&i) => Ok(&mut self.entries[i]),
            None => Err(MonitorError::UnknownKey(format!("{:?}", key))),
        }
    }

    /// Aggregate signals, each at most once per session and only while active.
    fn aggregate(&mut self, events: &mut Vec<MonitorEvent<K>>) {
        if !self.active {
            return;
        }
        if !self.all_finished_fired && self.entries.iter().all(|e| e.download.is_finished()) {
            self.all_finished_fired = true;
            info!(event = "all_finished", downloads = self.entries.len());
            events.push(MonitorEvent::AllFinished);
        }
        if !self.all_processed_fired && self.entries.iter().all(|e| e.download.is_processed()) {
            self.all_processed_fired = true;
            info!(event = "all_processed", downloads = self.entries.len());
            events.push(MonitorEvent::AllProcessed);
        }
    }
}

/// Keyed collection of downloads with an optional associated object per download.
pub struct DownloadMonitor<K, A = ()> {
    inner: Mutex<Inner<K, A>>,
}

impl<K: Clone + Eq + Hash + Debug, A> DownloadMonitor<K, A> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: Vec::new(),
                index: HashMap::new(),
                active: false,
                all_finished_fired: false,
                all_processed_fired: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K, A>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a download. Rejected once monitoring has started.
    pub fn add(&self, key: K, download: ChunkedDownload) -> Result<DownloadId, MonitorError> {
        let mut inner = self.lock();
        if inner.active {
            return Err(MonitorError::Monitoring);
        }
        if inner.index.contains_key(&key) {
            return Err(MonitorError::DuplicateKey(format!("{:?}", key)));
        }
        let id = download.id();
        let pos = inner.entries.len();
        inner.index.insert(key.clone(), pos);
        inner.entries.push(Entry {
            key,
            download,
            associated: None,
        });
        Ok(id)
    }

    /// Begin monitoring. Reports `AllFinished` at once when everything is already done.
    pub fn start(&self) -> Vec<MonitorEvent<K>> {
        let mut inner = self.lock();
        let mut events = Vec::new();
        if inner.active {
            return events;
        }
        inner.active = true;
        debug!(event = "monitor_started", downloads = inner.entries.len());
        inner.aggregate(&mut events);
        events
    }

    /// Apply a chunk to the download under `key`.
    pub fn update(
        &self,
        key: &K,
        timestamp: u64,
        sequence: u64,
        units: u64,
    ) -> Result<Vec<MonitorEvent<K>>, MonitorError> {
        self.apply(key, |d| d.update(timestamp, sequence, units))
    }

    fn apply(
        &self,
        key: &K,
        f: impl FnOnce(&mut ChunkedDownload) -> Result<Progress, SequenceError>,
    ) -> Result<Vec<MonitorEvent<K>>, MonitorError> {
        let mut inner = self.lock();
        let entry = inner.entry_mut(key)?;
        let progress = f(&mut entry.download).map_err(|e| {
            warn!(event = "sequence_error", key = ?key, error = %e);
            e
        })?;
        let mut events = Vec::new();
        if let Progress::Finished { received } = progress {
            debug!(event = "download_finished", key = ?key, received);
            events.push(MonitorEvent::DownloadFinished(key.clone()));
            inner.aggregate(&mut events);
        }
        Ok(events)
    }

    /// Consumer finished its work on a download.
    pub fn mark_processed(&self, key: &K) -> Result<Vec<MonitorEvent<K>>, MonitorError> {
        let mut inner = self.lock();
        let entry = inner.entry_mut(key)?;
        let mut events = Vec::new();
        if entry.download.mark_processed() {
            inner.aggregate(&mut events);
        }
        Ok(events)
    }

    /// Drop all downloads and associations; monitoring stops. In-flight state is abandoned.
    pub fn reset(&self) {
        let mut inner = self.lock();
        if !inner.entries.is_empty() {
            debug!(event = "monitor_reset", downloads = inner.entries.len());
        }
        inner.entries.clear();
        inner.index.clear();
        inner.active = false;
        inner.all_finished_fired = false;
        inner.all_processed_fired = false;
    }

    /// Attach a collaborator to a download. Returns the one it replaces.
    pub fn associate(&self, key: &K, object: A) -> Result<Option<A>, MonitorError> {
        let mut inner = self.lock();
        Ok(inner.entry_mut(key)?.associated.replace(object))
    }

    pub fn take_associated(&self, key: &K) -> Option<A> {
        let mut inner = self.lock();
        inner.entry_mut(key).ok()?.associated.take()
    }

    pub fn key_of(&self, id: DownloadId) -> Option<K> {
        self.lock()
            .entries
            .iter()
            .find(|e| e.download.id() == id)
            .map(|e| e.key.clone())
    }

    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    pub fn is_finished(&self, key: &K) -> Option<bool> {
        let inner = self.lock();
        inner.index.get(key).map(|&i| inner.entries[i].download.is_finished())
    }

    pub fn is_all_finished(&self) -> bool {
        self.lock().entries.iter().all(|e| e.download.is_finished())
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of one download.
    pub fn download(&self, key: &K) -> Option<ChunkedDownload> {
        let inner = self.lock();
        inner.index.get(key).map(|&i| inner.entries[i].download.clone())
    }
}

impl<K: Clone + Eq + Hash + Debug, A: Clone> DownloadMonitor<K, A> {
    pub fn associated(&self, key: &K) -> Option<A> {
        let inner = self.lock();
        let &i = inner.index.get(key)?;
        inner.entries[i].associated.clone()
    }

    pub fn associated_by_id(&self, id: DownloadId) -> Option<A> {
        self.lock()
            .entries
            .iter()
            .find(|e| e.download.id() == id)
            .and_then(|e| e.associated.clone())
    }
}

impl<A> DownloadMonitor<String, A> {
    /// Route a chunk delivery by its path; the first chunk seeds the expected total.
    pub fn deliver<P>(&self, chunk: &ChunkDelivery<P>) -> Result<Vec<MonitorEvent<String>>, MonitorError> {
        let units = chunk.units();
        self.apply(&chunk.path, |d| {
            d.update_with_total(chunk.timestamp, chunk.sequence, chunk.total, units)
        })
    }
}

impl<K: Clone + Eq + Hash + Debug, A> Default for DownloadMonitor<K, A> {
    fn default() -> Self {
        Self::new()
    }
}
