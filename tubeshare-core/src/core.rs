//! Host-driven API: LibraryCore sequences a library browse over an open tube.
//! The host passes events in and carries out the returned actions.

use std::marker::PhantomData;

use tracing::{info, warn};

use crate::chunk::{ChunkDelivery, DEFAULT_CHUNK_LENGTH};
use crate::download::ChunkedDownload;
use crate::monitor::{DownloadMonitor, MonitorEvent};

/// Provider path of the library metadata.
pub const LIBRARY_PATH: &str = "/library";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowseState {
    Unloaded,
    /// Tube requested, waiting for it to open.
    Waiting,
    LoadingMetadata,
    LoadedMetadata,
    LoadingPlaylists,
    Loaded,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum BrowseError {
    #[error("tube closed before the library was downloaded")]
    ClosedBeforeDownloaded,
    #[error("error while loading the library")]
    ErrorDuringLoad,
    #[error("error while loading playlists")]
    ErrorDuringPlaylistLoad,
}

/// What the host should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowseAction<P> {
    RequestTube,
    FetchChunks { path: String, chunk_length: usize },
    /// Hand the payload to the worker context; report back with `on_processed` once the download is done.
    ProcessPayload { path: String, sequence: u64, payload: Vec<P> },
    DownloadFinished { path: String },
    ListPlaylists,
    StateChanged(BrowseState),
    Failed(BrowseError),
}

pub struct LibraryCore<P> {
    state: BrowseState,
    monitor: DownloadMonitor<String>,
    chunk_length: usize,
    _payload: PhantomData<fn() -> P>,
}

impl<P> LibraryCore<P> {
    /// `chunk_length` 0 uses the default.
    pub fn new(chunk_length: usize) -> Self {
        Self {
            state: BrowseState::Unloaded,
            monitor: DownloadMonitor::new(),
            chunk_length: if chunk_length == 0 {
                DEFAULT_CHUNK_LENGTH
            } else {
                chunk_length
            },
            _payload: PhantomData,
        }
    }

    pub fn state(&self) -> BrowseState {
        self.state
    }

    pub fn chunk_length(&self) -> usize {
        self.chunk_length
    }

    fn set_state(&mut self, state: BrowseState, actions: &mut Vec<BrowseAction<P>>) {
        if self.state != state {
            info!(event = "browse_state", from = ?self.state, to = ?state);
            self.state = state;
            actions.push(BrowseAction::StateChanged(state));
        }
    }

    /// Start browsing. Without an open tube the host is asked for one.
    pub fn browse(&mut self, tube_open: bool) -> Vec<BrowseAction<P>> {
        if self.state != BrowseState::Unloaded {
            return Vec::new();
        }
        if tube_open {
            return self.load_library(LIBRARY_PATH);
        }
        let mut actions = vec![BrowseAction::RequestTube];
        self.set_state(BrowseState::Waiting, &mut actions);
        actions
    }

    /// Requested tube is open.
    pub fn on_tube_ready(&mut self) -> Vec<BrowseAction<P>> {
        if self.state != BrowseState::Waiting {
            return Vec::new();
        }
        self.load_library(LIBRARY_PATH)
    }

    pub fn load_library(&mut self, path: &str) -> Vec<BrowseAction<P>> {
        let mut actions = Vec::new();
        self.begin(&[path.to_string()], &mut actions);
        self.set_state(BrowseState::LoadingMetadata, &mut actions);
        actions
    }

    /// Fetch playlists once the library is processed. No playlists means done.
    pub fn load_playlists(&mut self, paths: &[String]) -> Vec<BrowseAction<P>> {
        let mut actions = Vec::new();
        if self.state != BrowseState::LoadedMetadata {
            warn!(event = "playlists_out_of_order", state = ?self.state);
            return actions;
        }
        if paths.is_empty() {
            self.monitor.reset();
            self.set_state(BrowseState::Loaded, &mut actions);
            return actions;
        }
        self.begin(paths, &mut actions);
        self.set_state(BrowseState::LoadingPlaylists, &mut actions);
        actions
    }

    fn begin(&mut self, paths: &[String], actions: &mut Vec<BrowseAction<P>>) {
        self.monitor.reset();
        for path in paths {
            if let Err(e) = self.monitor.add(path.clone(), ChunkedDownload::new()) {
                warn!(event = "duplicate_download", path = %path, error = %e);
                continue;
            }
            actions.push(BrowseAction::FetchChunks {
                path: path.clone(),
                chunk_length: self.chunk_length,
            });
        }
        self.monitor.start();
    }

    /// A chunk arrived over the tube.
    pub fn on_chunk(&mut self, chunk: ChunkDelivery<P>) -> Vec<BrowseAction<P>> {
        let mut actions = Vec::new();
        let loading = match self.state {
            BrowseState::LoadingMetadata => BrowseError::ErrorDuringLoad,
            BrowseState::LoadingPlaylists => BrowseError::ErrorDuringPlaylistLoad,
            _ => {
                warn!(event = "unexpected_chunk", path = %chunk.path, state = ?self.state);
                return actions;
            }
        };
        let events = match self.monitor.deliver(&chunk) {
            Ok(events) => events,
            Err(e) => {
                warn!(event = "browse_failed", path = %chunk.path, error = %e);
                self.monitor.reset();
                self.set_state(BrowseState::Unloaded, &mut actions);
                actions.push(BrowseAction::Failed(loading));
                return actions;
            }
        };
        actions.push(BrowseAction::ProcessPayload {
            path: chunk.path,
            sequence: chunk.sequence,
            payload: chunk.payload,
        });
        for event in events {
            match event {
                MonitorEvent::DownloadFinished(path) => {
                    actions.push(BrowseAction::DownloadFinished { path })
                }
                MonitorEvent::AllFinished if self.state == BrowseState::LoadingMetadata => {
                    self.set_state(BrowseState::LoadedMetadata, &mut actions)
                }
                _ => {}
            }
        }
        actions
    }

    /// Consumer finished processing the download under `path`.
    pub fn on_processed(&mut self, path: &str) -> Vec<BrowseAction<P>> {
        let mut actions = Vec::new();
        let events = match self.monitor.mark_processed(&path.to_string()) {
            Ok(events) => events,
            Err(e) => {
                warn!(event = "processed_unknown", path = %path, error = %e);
                return actions;
            }
        };
        if !events.contains(&MonitorEvent::AllProcessed) {
            return actions;
        }
        match self.state {
            BrowseState::LoadedMetadata => actions.push(BrowseAction::ListPlaylists),
            BrowseState::LoadingPlaylists => {
                self.monitor.reset();
                self.set_state(BrowseState::Loaded, &mut actions);
            }
            _ => {}
        }
        actions
    }

    /// Tube went away. Anything in flight is abandoned.
    pub fn on_tube_closed(&mut self, self_initiated: bool) -> Vec<BrowseAction<P>> {
        let mut actions = Vec::new();
        let done = matches!(self.state, BrowseState::Loaded | BrowseState::Unloaded);
        self.monitor.reset();
        self.set_state(BrowseState::Unloaded, &mut actions);
        if self_initiated && !done {
            actions.push(BrowseAction::Failed(BrowseError::ClosedBeforeDownloaded));
        }
        actions
    }
}

impl<P> Default for LibraryCore<P> {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_LENGTH)
    }
}
