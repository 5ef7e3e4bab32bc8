//! Received block tracker.
//!
//! The authoritative log of block arrivals, batch allocations and cleanups on
//! the coordinator. Every mutation is appended to the event log first (when
//! enabled) and only then applied in memory, so replaying the log on
//! construction reaches the same state regardless of where the previous
//! incarnation died.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;

use crate::models::{tracker_event, BatchAllocation, ReceivedBlockInfo, StreamAllocation, StreamId, TrackerEvent};
use crate::utils;
use crate::wal::WalStore;

pub(crate) const METRIC_TRACKER_BLOCKS_ADDED: &str = "freshet_ingest_tracker_blocks_added";
pub(crate) const METRIC_TRACKER_BATCHES_ALLOCATED: &str = "freshet_ingest_tracker_batches_allocated";

/// The coordinator-side bookkeeper of reported blocks and batch allocations.
pub struct ReceivedBlockTracker {
    stream_ids: Vec<StreamId>,
    wal: Option<Arc<WalStore>>,
    state: Mutex<TrackerState>,
}

#[derive(Default)]
struct TrackerState {
    /// Reported blocks not yet bound to any batch, in arrival order per stream.
    unallocated: HashMap<StreamId, VecDeque<ReceivedBlockInfo>>,
    /// Committed batch allocations by batch time.
    allocated: HashMap<i64, HashMap<StreamId, Vec<ReceivedBlockInfo>>>,
    /// The largest batch time allocated so far.
    last_allocated_batch_time: Option<i64>,
}

impl ReceivedBlockTracker {
    /// Create a new instance, replaying any event log left behind by a
    /// previous incarnation.
    pub async fn new(stream_ids: Vec<StreamId>, wal: Option<Arc<WalStore>>) -> Result<Self> {
        metrics::register_counter!(METRIC_TRACKER_BLOCKS_ADDED, metrics::Unit::Count, "blocks recorded by the receiver tracker");
        metrics::register_counter!(METRIC_TRACKER_BATCHES_ALLOCATED, metrics::Unit::Count, "batches allocated by the receiver tracker");
        let mut state = TrackerState::default();
        if let Some(wal) = &wal {
            let records = wal.read_all().await.context("error recovering tracker event log")?;
            let count = records.len();
            for record in &records {
                let event: TrackerEvent = utils::decode_model(record).context("error decoding tracker event record")?;
                state.replay(event)?;
            }
            if count > 0 {
                tracing::info!(events = count, "recovered receiver tracker state from write-ahead log");
            }
        }
        Ok(Self {
            stream_ids,
            wal,
            state: Mutex::new(state),
        })
    }

    /// Record a newly reported block.
    ///
    /// Returns `false` when the durable append failed, in which case the block
    /// is not tracked and the caller's ack should reflect the failure.
    pub async fn add_block(&self, info: ReceivedBlockInfo) -> bool {
        let mut state = self.state.lock().await;
        let event = TrackerEvent {
            event: Some(tracker_event::Event::BlockAdded(info.clone())),
        };
        if !self.write_to_log(&event).await {
            return false;
        }
        let stream_id = info.stream_id;
        state.unallocated.entry(stream_id).or_default().push_back(info);
        metrics::counter!(METRIC_TRACKER_BLOCKS_ADDED, 1);
        tracing::debug!(stream_id, "block added to unallocated queue");
        true
    }

    /// Bind every unallocated block to the given batch.
    ///
    /// A batch time at or below the last allocated one is a no-op: replay after
    /// recovery and clock regressions must not re-allocate blocks.
    pub async fn allocate_blocks_to_batch(&self, batch_time: i64) {
        let mut state = self.state.lock().await;
        let can_allocate = state.last_allocated_batch_time.map_or(true, |last| batch_time > last);
        if !can_allocate {
            tracing::warn!(
                batch_time,
                last_allocated = ?state.last_allocated_batch_time,
                "batch already allocated, skipping re-allocation"
            );
            return;
        }
        let mut streams = Vec::with_capacity(self.stream_ids.len());
        for &stream_id in &self.stream_ids {
            let blocks = state
                .unallocated
                .get_mut(&stream_id)
                .map(|queue| queue.drain(..).collect())
                .unwrap_or_default();
            streams.push(StreamAllocation { stream_id, blocks });
        }
        let allocation = BatchAllocation { batch_time, streams };
        let event = TrackerEvent {
            event: Some(tracker_event::Event::BatchAllocated(allocation.clone())),
        };
        if !self.write_to_log(&event).await {
            // Refill the queues in arrival order so a later batch picks the
            // blocks up again.
            for alloc in allocation.streams {
                let queue = state.unallocated.entry(alloc.stream_id).or_default();
                for info in alloc.blocks.into_iter().rev() {
                    queue.push_front(info);
                }
            }
            tracing::warn!(batch_time, "error writing batch allocation to event log, batch not allocated");
            return;
        }
        state.publish_allocation(allocation);
        metrics::counter!(METRIC_TRACKER_BATCHES_ALLOCATED, 1);
        tracing::debug!(batch_time, "blocks allocated to batch");
    }

    /// The committed mapping for the given batch, or an empty map.
    pub async fn get_blocks_of_batch(&self, batch_time: i64) -> HashMap<StreamId, Vec<ReceivedBlockInfo>> {
        let state = self.state.lock().await;
        state.allocated.get(&batch_time).cloned().unwrap_or_default()
    }

    /// The committed block sequence for one stream of the given batch.
    pub async fn get_blocks_of_batch_and_stream(&self, batch_time: i64, stream_id: StreamId) -> Vec<ReceivedBlockInfo> {
        let state = self.state.lock().await;
        state
            .allocated
            .get(&batch_time)
            .and_then(|streams| streams.get(&stream_id))
            .cloned()
            .unwrap_or_default()
    }

    /// Whether any stream has reported blocks not yet bound to a batch.
    pub async fn has_unallocated_blocks(&self) -> bool {
        let state = self.state.lock().await;
        state.unallocated.values().any(|queue| !queue.is_empty())
    }

    /// Drop batch metadata older than the given threshold and prune the event log.
    pub async fn cleanup_old_batches(&self, threshold_ms: i64, wait_for_completion: bool) {
        let mut state = self.state.lock().await;
        let old: Vec<i64> = state.allocated.keys().copied().filter(|&time| time < threshold_ms).collect();
        if !old.is_empty() {
            tracing::info!(batches = ?old, "deleting old batch metadata");
        }
        state.allocated.retain(|&time, _| time >= threshold_ms);
        let event = TrackerEvent {
            event: Some(tracker_event::Event::BatchCleanedUp(threshold_ms)),
        };
        if !self.write_to_log(&event).await {
            tracing::warn!(threshold_ms, "error writing batch cleanup to event log");
        }
        if let Some(wal) = &self.wal {
            if let Err(err) = wal.clean(threshold_ms, wait_for_completion).await {
                tracing::warn!(error = ?err, threshold_ms, "error pruning tracker event log segments");
            }
        }
    }

    /// Stop the tracker.
    pub async fn stop(&self) {
        tracing::debug!("received block tracker stopped");
    }

    /// Append the given event to the log, if one is configured.
    async fn write_to_log(&self, event: &TrackerEvent) -> bool {
        let wal = match &self.wal {
            Some(wal) => wal,
            None => return true,
        };
        let data = match utils::encode_model(event) {
            Ok(data) => data,
            Err(err) => {
                tracing::error!(error = ?err, "error encoding tracker event for event log");
                return false;
            }
        };
        match wal.append(data.into()).await {
            Ok(_handle) => true,
            Err(err) => {
                tracing::warn!(error = ?err, "error appending tracker event to event log");
                false
            }
        }
    }
}

impl TrackerState {
    /// Apply one recovered event. Replayed in log order, this is a fixed point
    /// of the uninterrupted execution.
    fn replay(&mut self, event: TrackerEvent) -> Result<()> {
        match event.event {
            Some(tracker_event::Event::BlockAdded(info)) => {
                self.unallocated.entry(info.stream_id).or_default().push_back(info);
            }
            Some(tracker_event::Event::BatchAllocated(allocation)) => {
                // The allocation drained every queue when it was first written.
                self.unallocated.values_mut().for_each(VecDeque::clear);
                self.publish_allocation(allocation);
            }
            Some(tracker_event::Event::BatchCleanedUp(threshold_ms)) => {
                self.allocated.retain(|&time, _| time >= threshold_ms);
            }
            None => anyhow::bail!("empty tracker event record in event log"),
        }
        Ok(())
    }

    fn publish_allocation(&mut self, allocation: BatchAllocation) {
        let streams: HashMap<StreamId, Vec<ReceivedBlockInfo>> = allocation
            .streams
            .into_iter()
            .map(|alloc| (alloc.stream_id, alloc.blocks))
            .collect();
        self.allocated.insert(allocation.batch_time, streams);
        self.last_allocated_batch_time = Some(allocation.batch_time);
    }
}
