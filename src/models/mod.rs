//! Core data models.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;

mod tracker;
mod tracker_ext;

pub use tracker::*;

/// A dense non-negative integer identifying an input stream.
///
/// The set of valid ids is fixed at tracker start.
pub type StreamId = u32;

/// The identifier of one received block, unique within the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamBlockId {
    /// The input stream which produced the block.
    pub stream_id: StreamId,
    /// A monotonically increasing sequence number within the stream.
    pub unique_id: u64,
}

impl fmt::Display for StreamBlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "input-{}-{}", self.stream_id, self.unique_id)
    }
}

/// A shared monotonic source of block ids for one stream.
///
/// The block generator and the supervisor's pre-batched push paths draw from
/// the same sequence so that ids never collide within a receiver.
#[derive(Clone, Default)]
pub struct BlockIdSequence(Arc<AtomicU64>);

impl BlockIdSequence {
    /// Mint the next block id for the given stream.
    pub fn next(&self, stream_id: StreamId) -> StreamBlockId {
        StreamBlockId {
            stream_id,
            unique_id: self.0.fetch_add(1, Ordering::Relaxed),
        }
    }
}

/// The durability level requested for stored blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StorageLevel {
    /// The replication factor, always at least 1.
    pub replication: u32,
}

impl Default for StorageLevel {
    fn default() -> Self {
        Self { replication: 1 }
    }
}

/// A chunk of records handed to a block handler for storage.
pub enum ReceivedBlock {
    /// An in-memory buffer of individual records.
    Records(Vec<Bytes>),
    /// A one-shot iterator of records.
    Iter(Box<dyn Iterator<Item = Bytes> + Send>),
    /// Pre-serialized record bytes.
    Bytes(Bytes),
}

impl ReceivedBlock {
    /// The number of records in this block, or `-1` when unknown.
    pub fn num_records(&self) -> i64 {
        match self {
            Self::Records(records) => records.len() as i64,
            Self::Iter(_) | Self::Bytes(_) => -1,
        }
    }

    /// Serialize this block's records into the framed form used for storage.
    pub fn into_bytes(self) -> Bytes {
        match self {
            Self::Records(records) => crate::utils::encode_records(records.iter()),
            Self::Iter(iter) => {
                let records: Vec<Bytes> = iter.collect();
                crate::utils::encode_records(records.iter())
            }
            Self::Bytes(bytes) => bytes,
        }
    }
}

impl fmt::Debug for ReceivedBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Records(records) => f.debug_tuple("Records").field(&records.len()).finish(),
            Self::Iter(_) => f.debug_tuple("Iter").finish(),
            Self::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
        }
    }
}
