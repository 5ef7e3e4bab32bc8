use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;

use crate::block::{new_block_handler, DirectBlockHandler, ReceivedBlockHandler, WalBlockHandler};
use crate::config::Config;
use crate::error::IngestError;
use crate::fixtures;
use crate::models::{ReceivedBlock, StorageLevel, StreamBlockId};
use crate::store::{BlockStore, MemoryBlockStore};
use crate::utils;
use crate::wal::WalStore;

fn block_id(unique_id: u64) -> StreamBlockId {
    StreamBlockId { stream_id: 0, unique_id }
}

#[tokio::test]
async fn direct_handler_stores_and_returns_locator() -> Result<()> {
    let store = MemoryBlockStore::new();
    let handler = DirectBlockHandler::new(store.clone() as Arc<dyn BlockStore>, StorageLevel::default());

    let records = fixtures::random_records(5);
    let result = handler.store_block(block_id(0), ReceivedBlock::Records(records.clone())).await?;

    assert_eq!(result.block_id(), block_id(0));
    assert!(result.wal_handle.is_none(), "direct storage must not carry a wal handle");
    let stored = store.get(block_id(0)).await.context("block missing from store")?;
    assert_eq!(utils::decode_records(&stored)?, records);
    Ok(())
}

#[tokio::test]
async fn direct_handler_fails_when_replication_unsatisfied() -> Result<()> {
    let store = MemoryBlockStore::new();
    store.set_live_replicas(1);
    let handler = DirectBlockHandler::new(store.clone() as Arc<dyn BlockStore>, StorageLevel { replication: 2 });

    let res = handler.store_block(block_id(0), ReceivedBlock::Records(fixtures::random_records(2))).await;
    assert!(matches!(res, Err(IngestError::StoreUnavailable(_))), "expected StoreUnavailable");
    assert!(store.is_empty());
    Ok(())
}

#[tokio::test]
async fn wal_handler_returns_rehydratable_handle() -> Result<()> {
    let tmpdir = tempfile::tempdir_in("/tmp").context("error creating tmp dir in /tmp")?;
    let store = MemoryBlockStore::new();
    let wal = WalStore::open(tmpdir.path(), 60_000).await?;
    let handler = WalBlockHandler::new(store.clone() as Arc<dyn BlockStore>, wal.clone(), StorageLevel::default());

    let records = fixtures::random_records(8);
    let result = handler.store_block(block_id(3), ReceivedBlock::Records(records.clone())).await?;

    let handle = result.wal_handle.clone().context("expected a wal handle")?;
    let from_wal = wal.read(handle).await?;
    assert_eq!(utils::decode_records(&from_wal)?, records, "wal contents must rehydrate the block");
    let from_store = store.get(block_id(3)).await.context("block missing from store")?;
    assert_eq!(from_store, from_wal, "store and wal must hold the same serialized block");
    Ok(())
}

#[tokio::test]
async fn wal_handler_fails_when_the_store_leg_fails() -> Result<()> {
    let tmpdir = tempfile::tempdir_in("/tmp").context("error creating tmp dir in /tmp")?;
    let store = MemoryBlockStore::new();
    store.set_fail_puts(true);
    let wal = WalStore::open(tmpdir.path(), 60_000).await?;
    let handler = WalBlockHandler::new(store.clone() as Arc<dyn BlockStore>, wal, StorageLevel::default());

    let res = handler.store_block(block_id(0), ReceivedBlock::Records(fixtures::random_records(2))).await;
    assert!(matches!(res, Err(IngestError::StoreUnavailable(_))), "expected StoreUnavailable");
    assert!(store.is_empty());
    Ok(())
}

#[tokio::test]
async fn iterator_and_byte_blocks_report_unknown_counts() -> Result<()> {
    let records = fixtures::random_records(4);
    let iter_block = ReceivedBlock::Iter(Box::new(records.clone().into_iter()));
    assert_eq!(iter_block.num_records(), -1);
    let bytes_block = ReceivedBlock::Bytes(Bytes::from_static(b"opaque"));
    assert_eq!(bytes_block.num_records(), -1);
    assert_eq!(ReceivedBlock::Records(records.clone()).num_records(), 4);

    // An iterator block still serializes to the framed record form.
    let store = MemoryBlockStore::new();
    let handler = DirectBlockHandler::new(store.clone() as Arc<dyn BlockStore>, StorageLevel::default());
    handler.store_block(block_id(9), iter_block).await?;
    let stored = store.get(block_id(9)).await.context("block missing from store")?;
    assert_eq!(utils::decode_records(&stored)?, records);
    Ok(())
}

#[tokio::test]
async fn handler_variant_follows_config() -> Result<()> {
    let (config, _tmpdir) = Config::new_test(false)?;
    let store = MemoryBlockStore::new();
    let handler = new_block_handler(&config, 0, store.clone() as Arc<dyn BlockStore>, StorageLevel::default()).await?;
    let result = handler.store_block(block_id(0), ReceivedBlock::Records(fixtures::random_records(1))).await?;
    assert!(result.wal_handle.is_none());

    let (config, _tmpdir) = Config::new_test(true)?;
    let handler = new_block_handler(&config, 0, store.clone() as Arc<dyn BlockStore>, StorageLevel::default()).await?;
    let result = handler.store_block(block_id(1), ReceivedBlock::Records(fixtures::random_records(1))).await?;
    assert!(result.wal_handle.is_some());
    Ok(())
}
