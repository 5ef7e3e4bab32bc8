use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use rand::prelude::*;

use crate::config::Config;
use crate::receiver::{Receiver, ReceiverContext};
use crate::rpc::Registry;
use crate::store::{BlockStore, MemoryBlockStore};
use crate::tracker::{LocalTaskLauncher, ReceiverInputStream, ReceiverTracker, TrackerMsg};

/// Generate a batch of random records.
pub fn random_records(count: usize) -> Vec<Bytes> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|_| {
            let len = rng.gen_range(8..64);
            let mut buf = vec![0u8; len];
            rng.fill_bytes(&mut buf);
            Bytes::from(buf)
        })
        .collect()
}

/// A receiver which pushes a fixed set of records, then idles until stopped.
pub struct StaticReceiver {
    pub records: Vec<Bytes>,
}

#[async_trait]
impl Receiver for StaticReceiver {
    async fn run(&mut self, ctx: ReceiverContext) -> Result<()> {
        for record in self.records.drain(..) {
            ctx.push_single(record).await?;
        }
        let mut stopped = ctx.stop_signal();
        while !*stopped.borrow() {
            if stopped.changed().await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

/// Build a tracker over the given input streams with an in-process launcher
/// and block store.
pub async fn new_test_tracker(
    config: Arc<Config>, streams: Vec<ReceiverInputStream>, skip_receiver_launch: bool,
) -> Result<(Arc<ReceiverTracker>, Arc<MemoryBlockStore>, Registry<TrackerMsg>)> {
    let registry = Registry::new();
    let store = MemoryBlockStore::new();
    let tracker = ReceiverTracker::new(
        config,
        streams,
        registry.clone(),
        store.clone() as Arc<dyn BlockStore>,
        Arc::new(LocalTaskLauncher),
        skip_receiver_launch,
    )
    .await?;
    Ok((Arc::new(tracker), store, registry))
}
