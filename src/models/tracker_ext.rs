use super::tracker::{BlockStoreResult, ReceivedBlockInfo, WalRecordHandle};
use super::{StorageLevel, StreamBlockId};

impl BlockStoreResult {
    /// Build a locator for a block stored directly in the block store.
    pub fn direct(block_id: StreamBlockId, level: StorageLevel) -> Self {
        Self {
            stream_id: block_id.stream_id,
            unique_id: block_id.unique_id,
            replication: level.replication,
            wal_handle: None,
        }
    }

    /// Build a locator for a block stored in both the block store and the WAL.
    pub fn wal(block_id: StreamBlockId, level: StorageLevel, handle: WalRecordHandle) -> Self {
        Self {
            stream_id: block_id.stream_id,
            unique_id: block_id.unique_id,
            replication: level.replication,
            wal_handle: Some(handle),
        }
    }

    /// The id of the stored block.
    pub fn block_id(&self) -> StreamBlockId {
        StreamBlockId {
            stream_id: self.stream_id,
            unique_id: self.unique_id,
        }
    }
}

impl ReceivedBlockInfo {
    /// Create a new instance.
    pub fn new(stream_id: u32, num_records: i64, result: BlockStoreResult) -> Self {
        Self {
            stream_id,
            num_records,
            result: Some(result),
        }
    }

    /// The id of the block this metadata describes, if a store result is present.
    pub fn block_id(&self) -> Option<StreamBlockId> {
        self.result.as_ref().map(BlockStoreResult::block_id)
    }

    #[cfg(test)]
    pub fn new_test(stream_id: u32, unique_id: u64, num_records: i64) -> Self {
        Self::new(
            stream_id,
            num_records,
            BlockStoreResult::direct(StreamBlockId { stream_id, unique_id }, StorageLevel::default()),
        )
    }
}
