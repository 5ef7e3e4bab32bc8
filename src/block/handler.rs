//! Received block handlers.
//!
//! A handler persists one block and returns the locator a receiver reports to
//! the tracker. Two variants, selected at supervisor construction: direct
//! insertion into the block store, or a concurrent write-ahead-log append plus
//! store insertion where both legs must succeed.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;

use crate::config::Config;
use crate::error::IngestError;
use crate::models::{BlockStoreResult, ReceivedBlock, StorageLevel, StreamBlockId, StreamId};
use crate::store::BlockStore;
use crate::wal::WalStore;

/// Delay before the single retry of a failed block store insert.
const STORE_RETRY_DELAY: Duration = Duration::from_millis(50);

/// A strategy for persisting received blocks.
#[async_trait]
pub trait ReceivedBlockHandler: Send + Sync + 'static {
    /// Persist the given block, returning its storage locator.
    async fn store_block(&self, block_id: StreamBlockId, block: ReceivedBlock) -> Result<BlockStoreResult, IngestError>;

    /// Drop stored block data older than the given threshold, best-effort.
    async fn cleanup_old_blocks(&self, threshold_ms: i64);
}

/// Build the handler variant selected by the `wal_enable` config.
pub async fn new_block_handler(
    config: &Config, stream_id: StreamId, store: Arc<dyn BlockStore>, level: StorageLevel,
) -> Result<Arc<dyn ReceivedBlockHandler>> {
    if !config.wal_enable {
        return Ok(Arc::new(DirectBlockHandler::new(store, level)));
    }
    let checkpoint_dir = config
        .checkpoint_dir
        .as_deref()
        .context("checkpoint_dir is required when wal_enable is set")?;
    let wal_dir = PathBuf::from(checkpoint_dir).join(format!("receiver-{}", stream_id));
    let wal = WalStore::open(wal_dir, config.wal_rotation_ms).await?;
    Ok(Arc::new(WalBlockHandler::new(store, wal, level)))
}

/// Stores blocks directly in the block store.
pub struct DirectBlockHandler {
    store: Arc<dyn BlockStore>,
    level: StorageLevel,
}

impl DirectBlockHandler {
    /// Create a new instance.
    pub fn new(store: Arc<dyn BlockStore>, level: StorageLevel) -> Self {
        Self { store, level }
    }
}

#[async_trait]
impl ReceivedBlockHandler for DirectBlockHandler {
    async fn store_block(&self, block_id: StreamBlockId, block: ReceivedBlock) -> Result<BlockStoreResult, IngestError> {
        let data = block.into_bytes();
        put_with_retry(self.store.as_ref(), block_id, data, self.level).await?;
        Ok(BlockStoreResult::direct(block_id, self.level))
    }

    async fn cleanup_old_blocks(&self, _threshold_ms: i64) {
        // The block store expires blocks independently.
    }
}

/// Appends a block's serialized records to the WAL and inserts them into the
/// block store concurrently, waiting for both.
pub struct WalBlockHandler {
    store: Arc<dyn BlockStore>,
    wal: Arc<WalStore>,
    level: StorageLevel,
}

impl WalBlockHandler {
    /// Create a new instance.
    pub fn new(store: Arc<dyn BlockStore>, wal: Arc<WalStore>, level: StorageLevel) -> Self {
        Self { store, wal, level }
    }

    /// The WAL backing this handler.
    pub fn wal(&self) -> &Arc<WalStore> {
        &self.wal
    }
}

#[async_trait]
impl ReceivedBlockHandler for WalBlockHandler {
    async fn store_block(&self, block_id: StreamBlockId, block: ReceivedBlock) -> Result<BlockStoreResult, IngestError> {
        // Serialize once; both legs consume the same bytes.
        let data = block.into_bytes();
        let wal_append = async {
            self.wal
                .append(data.clone())
                .await
                .map_err(|err| IngestError::StoreUnavailable(format!("wal append of block {} failed: {}", block_id, err)))
        };
        let store_insert = put_with_retry(self.store.as_ref(), block_id, data.clone(), self.level);
        let (handle, _) = tokio::try_join!(wal_append, store_insert)?;
        Ok(BlockStoreResult::wal(block_id, self.level, handle))
    }

    async fn cleanup_old_blocks(&self, threshold_ms: i64) {
        if let Err(err) = self.wal.clean(threshold_ms, false).await {
            tracing::warn!(error = ?err, threshold_ms, "error cleaning old block wal segments");
        }
    }
}

async fn put_with_retry(store: &dyn BlockStore, block_id: StreamBlockId, data: Bytes, level: StorageLevel) -> Result<(), IngestError> {
    let first_err = match store.put(block_id, data.clone(), level).await {
        Ok(()) => return Ok(()),
        Err(err) => err,
    };
    tracing::warn!(error = %first_err, block_id = %block_id, "block store insert failed, retrying once");
    tokio::time::sleep(STORE_RETRY_DELAY).await;
    store.put(block_id, data, level).await
}
