//! Block generator.
//!
//! Transforms an unbounded record stream into blocks cut on a fixed cadence.
//! Internally a two-stage pipeline: a timer task swaps the building buffer and
//! enqueues the cut block onto a bounded handoff queue, and a consumer task
//! pulls blocks off the queue and drives the listener's push callback. The
//! buffer lock is held across the handoff send, so producers calling
//! [`BlockGenerator::add_data`] block while the queue is full.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::IngestError;
use crate::models::{BlockIdSequence, StreamBlockId, StreamId};

pub(crate) const METRIC_RECORDS_RECEIVED: &str = "freshet_ingest_records_received";
pub(crate) const METRIC_BLOCKS_GENERATED: &str = "freshet_ingest_blocks_generated";
pub(crate) const METRIC_BLOCKS_PUSHED: &str = "freshet_ingest_blocks_pushed";

/// Lifecycle states of a block generator.
///
/// `stop` walks the stopped states in order: reject new data, flush the
/// partial buffer, stop the timer, drain the queue, stop the consumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GeneratorState {
    Initialized,
    Active,
    StoppedAddingData,
    StoppedGeneratingBlocks,
    StoppedAll,
}

/// Callbacks driven by a block generator's pipeline.
#[async_trait]
pub trait BlockGeneratorListener: Send + Sync + 'static {
    /// A new block was cut from the record buffer.
    fn on_generate_block(&self, block_id: StreamBlockId);

    /// A block was pulled off the handoff queue and is ready to be stored
    /// and reported. Invoked sequentially, one block at a time.
    async fn on_push_block(&self, block_id: StreamBlockId, records: Vec<Bytes>);

    /// The generator hit an internal error.
    fn on_error(&self, message: &str);
}

/// A cut block traveling the handoff queue.
struct Block {
    id: StreamBlockId,
    records: Vec<Bytes>,
}

struct Shared {
    state: GeneratorState,
    buffer: Vec<Bytes>,
    queue_tx: Option<mpsc::Sender<Block>>,
}

struct RunningTasks {
    stop_timer: watch::Sender<bool>,
    timer: JoinHandle<()>,
    consumer: JoinHandle<()>,
}

/// Buffers individual records and cuts them into blocks on a fixed interval.
pub struct BlockGenerator {
    stream_id: StreamId,
    config: Arc<Config>,
    listener: Arc<dyn BlockGeneratorListener>,
    ids: BlockIdSequence,
    shared: Arc<Mutex<Shared>>,
    queue_depth: Arc<AtomicUsize>,
    tasks: std::sync::Mutex<Option<RunningTasks>>,
}

impl BlockGenerator {
    /// Create a new instance.
    pub fn new(stream_id: StreamId, config: Arc<Config>, listener: Arc<dyn BlockGeneratorListener>, ids: BlockIdSequence) -> Self {
        metrics::register_counter!(METRIC_RECORDS_RECEIVED, metrics::Unit::Count, "records appended to the block generator buffer");
        metrics::register_counter!(METRIC_BLOCKS_GENERATED, metrics::Unit::Count, "blocks cut from the record buffer");
        metrics::register_counter!(METRIC_BLOCKS_PUSHED, metrics::Unit::Count, "blocks handed off for storage");
        Self {
            stream_id,
            config,
            listener,
            ids,
            shared: Arc::new(Mutex::new(Shared {
                state: GeneratorState::Initialized,
                buffer: vec![],
                queue_tx: None,
            })),
            queue_depth: Arc::new(AtomicUsize::new(0)),
            tasks: std::sync::Mutex::new(None),
        }
    }

    /// Start the timer & consumer pipeline.
    pub async fn start(&self) -> Result<(), IngestError> {
        let queue_rx = {
            let mut shared = self.shared.lock().await;
            if shared.state != GeneratorState::Initialized {
                return Err(IngestError::AlreadyStarted("block generator"));
            }
            let (queue_tx, queue_rx) = mpsc::channel(self.config.block_queue_size);
            shared.queue_tx = Some(queue_tx);
            shared.state = GeneratorState::Active;
            queue_rx
        };

        let (stop_timer, stop_rx) = watch::channel(false);
        let timer = tokio::spawn(Self::run_timer(
            self.shared.clone(),
            self.ids.clone(),
            self.stream_id,
            self.listener.clone(),
            self.queue_depth.clone(),
            self.config.block_interval(),
            stop_rx,
        ));
        let consumer = tokio::spawn(Self::run_consumer(queue_rx, self.listener.clone(), self.queue_depth.clone()));
        let mut tasks = self.lock_tasks();
        *tasks = Some(RunningTasks { stop_timer, timer, consumer });

        tracing::debug!(stream_id = self.stream_id, "block generator has started");
        Ok(())
    }

    /// Append a record to the current building buffer.
    ///
    /// Blocks while the handoff queue is full: the timer task holds the buffer
    /// lock across its enqueue, so producers wait on the lock.
    pub async fn add_data(&self, record: Bytes) -> Result<(), IngestError> {
        let mut shared = self.shared.lock().await;
        if shared.state != GeneratorState::Active {
            return Err(IngestError::NotStarted("block generator"));
        }
        shared.buffer.push(record);
        metrics::counter!(METRIC_RECORDS_RECEIVED, 1);
        Ok(())
    }

    /// Stop the generator, draining all buffered data first.
    pub async fn stop(&self) -> Result<(), IngestError> {
        // Reject any new data.
        {
            let mut shared = self.shared.lock().await;
            if shared.state != GeneratorState::Active {
                return Err(IngestError::NotStarted("block generator"));
            }
            shared.state = GeneratorState::StoppedAddingData;
        }
        tracing::debug!(stream_id = self.stream_id, "block generator is draining");

        // Flush whatever partial buffer remains as a final block.
        Self::cut_block(
            &self.shared,
            &self.ids,
            self.stream_id,
            self.listener.as_ref(),
            &self.queue_depth,
            true,
        )
        .await;

        let tasks = self.lock_tasks().take();
        if let Some(tasks) = tasks {
            // Stop the timer.
            let _ = tasks.stop_timer.send(true);
            if let Err(err) = tasks.timer.await {
                tracing::error!(error = ?err, "error joining block generator timer task");
            }
            // Close the handoff queue; the consumer drains it and exits.
            {
                let mut shared = self.shared.lock().await;
                shared.queue_tx = None;
                shared.state = GeneratorState::StoppedGeneratingBlocks;
            }
            if let Err(err) = tasks.consumer.await {
                tracing::error!(error = ?err, "error joining block generator consumer task");
            }
        }

        let mut shared = self.shared.lock().await;
        shared.state = GeneratorState::StoppedAll;
        tracing::debug!(stream_id = self.stream_id, "block generator has stopped");
        Ok(())
    }

    /// The generator's current lifecycle state.
    pub async fn state(&self) -> GeneratorState {
        self.shared.lock().await.state
    }

    /// The number of blocks sitting in the handoff queue.
    ///
    /// Advisory only: a receiver may sample this to self-throttle its source.
    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::SeqCst)
    }

    async fn run_timer(
        shared: Arc<Mutex<Shared>>, ids: BlockIdSequence, stream_id: StreamId, listener: Arc<dyn BlockGeneratorListener>,
        queue_depth: Arc<AtomicUsize>, period: std::time::Duration, mut stop_rx: watch::Receiver<bool>,
    ) {
        // The first cut happens one full interval after start.
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = interval.tick() => Self::cut_block(&shared, &ids, stream_id, listener.as_ref(), &queue_depth, false).await,
                _ = stop_rx.changed() => break,
            }
        }
    }

    /// Atomically swap the building buffer for a fresh one and enqueue the old
    /// buffer as a new block, if non-empty.
    async fn cut_block(
        shared: &Mutex<Shared>, ids: &BlockIdSequence, stream_id: StreamId, listener: &dyn BlockGeneratorListener,
        queue_depth: &AtomicUsize, flush: bool,
    ) {
        let mut guard = shared.lock().await;
        let expected = if flush {
            GeneratorState::StoppedAddingData
        } else {
            GeneratorState::Active
        };
        if guard.state != expected || guard.buffer.is_empty() {
            return;
        }
        let records = std::mem::take(&mut guard.buffer);
        let block_id = ids.next(stream_id);
        listener.on_generate_block(block_id);
        metrics::counter!(METRIC_BLOCKS_GENERATED, 1);
        let queue_tx = match guard.queue_tx.clone() {
            Some(queue_tx) => queue_tx,
            None => return,
        };
        if queue_tx.send(Block { id: block_id, records }).await.is_err() {
            listener.on_error(&format!("block {} dropped, handoff queue closed during shutdown", block_id));
            return;
        }
        queue_depth.fetch_add(1, Ordering::SeqCst);
    }

    async fn run_consumer(mut queue_rx: mpsc::Receiver<Block>, listener: Arc<dyn BlockGeneratorListener>, queue_depth: Arc<AtomicUsize>) {
        while let Some(block) = queue_rx.recv().await {
            queue_depth.fetch_sub(1, Ordering::SeqCst);
            listener.on_push_block(block.id, block.records).await;
            metrics::counter!(METRIC_BLOCKS_PUSHED, 1);
        }
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Option<RunningTasks>> {
        self.tasks.lock().unwrap_or_else(|err| err.into_inner())
    }
}
