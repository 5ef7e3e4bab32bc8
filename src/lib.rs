//! The Freshet receiver ingestion & tracking core.
//!
//! Long-lived receivers run on worker nodes, continuously ingest external
//! data, chop it into blocks on a fixed cadence, persist each block into the
//! cluster block store, and report block metadata to the receiver tracker on
//! the coordinator. The batch generator queries the tracker at each batch
//! boundary to bind all blocks reported in the previous window to the next
//! batch.
//!
//! Worker side: [`block::BlockGenerator`], [`block::ReceivedBlockHandler`] and
//! [`receiver::ReceiverSupervisor`]. Coordinator side: [`tracker::ReceiverTracker`]
//! and its durable bookkeeping in [`tracker::ReceivedBlockTracker`].

pub mod block;
pub mod config;
#[cfg(test)]
mod config_test;
pub mod error;
#[cfg(test)]
mod fixtures;
pub mod models;
pub mod receiver;
pub mod rpc;
#[cfg(test)]
mod rpc_test;
pub mod store;
pub mod tracker;
pub mod utils;
pub mod wal;
#[cfg(test)]
mod wal_test;

pub use crate::config::Config;
pub use crate::error::{IngestError, ShutdownError, ShutdownResult};
pub use crate::models::{ReceivedBlock, ReceivedBlockInfo, StorageLevel, StreamBlockId, StreamId};
pub use crate::receiver::{Receiver, ReceiverContext, ReceiverSupervisor, ReceiverTask, SupervisorCmd};
pub use crate::store::{BlockStore, MemoryBlockStore};
pub use crate::tracker::{
    LocalTaskLauncher, ReceiverEvent, ReceiverInfo, ReceiverInputStream, ReceiverTracker, TaskLauncher, TrackerMsg,
};
pub use crate::wal::WalStore;
