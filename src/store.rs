//! Block store seam.
//!
//! The cluster block store is an external collaborator: a key to bytes map
//! with replication. The trait below is the surface this crate relies on;
//! [`MemoryBlockStore`] implements it in-process for local mode and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::IngestError;
use crate::models::{StorageLevel, StreamBlockId};

/// A cluster-wide replicated key to bytes map for block contents.
#[async_trait]
pub trait BlockStore: Send + Sync + 'static {
    /// Insert the given block bytes at the requested storage level.
    async fn put(&self, block_id: StreamBlockId, data: Bytes, level: StorageLevel) -> Result<(), IngestError>;

    /// Fetch the bytes of the given block, if present.
    async fn get(&self, block_id: StreamBlockId) -> Option<Bytes>;

    /// Drop the given block.
    async fn remove(&self, block_id: StreamBlockId);
}

/// An in-process block store used in local mode and tests.
pub struct MemoryBlockStore {
    blocks: Mutex<HashMap<StreamBlockId, Bytes>>,
    live_replicas: AtomicU32,
    fail_puts: AtomicBool,
}

impl MemoryBlockStore {
    /// Create a new instance.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            blocks: Mutex::new(HashMap::new()),
            live_replicas: AtomicU32::new(1),
            fail_puts: AtomicBool::new(false),
        })
    }

    /// Override the number of live replicas the store can satisfy.
    pub fn set_live_replicas(&self, replicas: u32) {
        self.live_replicas.store(replicas, Ordering::SeqCst);
    }

    /// Force all subsequent puts to fail, for durability fault injection.
    pub fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    /// The number of blocks currently held.
    pub fn len(&self) -> usize {
        self.lock_blocks().len()
    }

    /// Whether the store holds no blocks.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_blocks(&self) -> std::sync::MutexGuard<'_, HashMap<StreamBlockId, Bytes>> {
        // Poisoning only happens if an insert panicked, which leaves the map intact.
        self.blocks.lock().unwrap_or_else(|err| err.into_inner())
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    async fn put(&self, block_id: StreamBlockId, data: Bytes, level: StorageLevel) -> Result<(), IngestError> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(IngestError::StoreUnavailable(format!("put of block {} refused", block_id)));
        }
        let live = self.live_replicas.load(Ordering::SeqCst);
        if live < level.replication {
            return Err(IngestError::StoreUnavailable(format!(
                "replication {} requested for block {} but only {} replicas live",
                level.replication, block_id, live
            )));
        }
        self.lock_blocks().insert(block_id, data);
        Ok(())
    }

    async fn get(&self, block_id: StreamBlockId) -> Option<Bytes> {
        self.lock_blocks().get(&block_id).cloned()
    }

    async fn remove(&self, block_id: StreamBlockId) {
        self.lock_blocks().remove(&block_id);
    }
}
