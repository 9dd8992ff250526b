//! Tube and file-transfer negotiation with chunked download reassembly for peer library sharing.
//! Host-driven: no I/O; host passes transport notifications and receives events and actions.

pub mod channel;
pub mod chunk;
pub mod core;
pub mod download;
pub mod executor;
pub mod file_transfer;
pub mod monitor;
pub mod registry;
pub mod scheduler;
pub mod socket;
pub mod transfer;
pub mod transport;
pub mod tube;

#[cfg(test)]
pub(crate) mod testing;

pub use channel::{ChannelEndpoint, ChannelError, ChannelEvent, RequestedChannel};
pub use chunk::{split_into_chunks, ChunkDelivery, DEFAULT_CHUNK_LENGTH};
pub use core::{BrowseAction, BrowseError, BrowseState, LibraryCore, LIBRARY_PATH};
pub use download::{ChunkedDownload, DownloadId, Progress, SequenceError};
pub use executor::{Contexts, Executor, Job, PayloadQueue, QueuedExecutor};
pub use file_transfer::{FileInfo, FileTransferSession, FileTransferStatus};
pub use monitor::{DownloadMonitor, MonitorError, MonitorEvent};
pub use registry::{Arrival, RegistryError, TransferRegistry};
pub use scheduler::{SchedulerEvent, SchedulerStats, TransferScheduler, DEFAULT_MAX_CONCURRENT};
pub use socket::{negotiate_socket_type, BridgeAddress, SocketAccessControl, SocketAddressType};
pub use transfer::{DeferredTransfer, Transfer, TransferResource, TransferState};
pub use transport::{Connection, Handle, ObjectPath, PendingReply, TransportError};
pub use tube::{DBusTube, StreamTube, Tube, TubeStatus};
