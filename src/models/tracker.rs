///////////////////////////////////////////////////////////////////////////////
// Components /////////////////////////////////////////////////////////////////

/// The locator of a WAL record, sufficient to rehydrate its contents from
/// durable storage.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WalRecordHandle {
    /// The start timestamp of the segment holding the record, unix millis.
    #[prost(int64, tag = "1")]
    pub segment_start_ms: i64,
    /// The sequence number of the segment holding the record.
    #[prost(uint64, tag = "2")]
    pub segment_seq: u64,
    /// The byte offset of the record frame within its segment.
    #[prost(uint64, tag = "3")]
    pub offset: u64,
    /// The length of the record payload in bytes.
    #[prost(uint32, tag = "4")]
    pub len: u32,
}

/// The storage locator produced by a block handler.
///
/// A populated `wal_handle` marks the block as recoverable purely from durable
/// storage should the block store lose its replicas.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BlockStoreResult {
    /// The stream component of the block id.
    #[prost(uint32, tag = "1")]
    pub stream_id: u32,
    /// The sequence component of the block id.
    #[prost(uint64, tag = "2")]
    pub unique_id: u64,
    /// The replication factor the block was stored with.
    #[prost(uint32, tag = "3")]
    pub replication: u32,
    /// The WAL locator of the block's serialized records, when write-ahead
    /// logging was used.
    #[prost(message, optional, tag = "4")]
    pub wal_handle: ::core::option::Option<WalRecordHandle>,
}

/// Metadata describing one block reported by a receiver.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReceivedBlockInfo {
    /// The input stream which produced the block.
    #[prost(uint32, tag = "1")]
    pub stream_id: u32,
    /// The number of records in the block, or `-1` when unknown.
    #[prost(int64, tag = "2")]
    pub num_records: i64,
    /// The storage locator of the block.
    #[prost(message, optional, tag = "3")]
    pub result: ::core::option::Option<BlockStoreResult>,
}

///////////////////////////////////////////////////////////////////////////////
// Tracker Event Log //////////////////////////////////////////////////////////

/// The blocks bound to one stream within a batch allocation.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamAllocation {
    /// The allocated stream.
    #[prost(uint32, tag = "1")]
    pub stream_id: u32,
    /// The stream's blocks in tracker arrival order.
    #[prost(message, repeated, tag = "2")]
    pub blocks: ::prost::alloc::vec::Vec<ReceivedBlockInfo>,
}

/// The full mapping committed by one batch allocation.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BatchAllocation {
    /// The logical batch boundary time, unix millis.
    #[prost(int64, tag = "1")]
    pub batch_time: i64,
    /// Per-stream allocations, one entry per declared input stream.
    #[prost(message, repeated, tag = "2")]
    pub streams: ::prost::alloc::vec::Vec<StreamAllocation>,
}

/// A record of the tracker's event log.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TrackerEvent {
    #[prost(oneof = "tracker_event::Event", tags = "1, 2, 3")]
    pub event: ::core::option::Option<tracker_event::Event>,
}
/// Nested message and enum types in `TrackerEvent`.
pub mod tracker_event {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Event {
        /// A receiver reported a new block.
        #[prost(message, tag = "1")]
        BlockAdded(super::ReceivedBlockInfo),
        /// The tracker bound all unallocated blocks to a batch.
        #[prost(message, tag = "2")]
        BatchAllocated(super::BatchAllocation),
        /// Batches older than the carried threshold were cleaned up.
        #[prost(int64, tag = "3")]
        BatchCleanedUp(i64),
    }
}
