//! Receiver supervisor.
//!
//! Hosts one receiver on a worker: owns its block generator and block handler,
//! stores and reports every block synchronously, and consumes coordinator
//! commands from its own endpoint. A block is reported to the tracker only
//! after its storage completed, which yields at-least-once delivery, and
//! exactly-once on recovery when the write-ahead log is enabled.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::block::{new_block_handler, BlockGenerator, BlockGeneratorListener, ReceivedBlockHandler};
use crate::config::Config;
use crate::error::IngestError;
use crate::models::{BlockIdSequence, ReceivedBlock, ReceivedBlockInfo, StreamBlockId, StreamId};
use crate::receiver::{ReceiverTask, SupervisorCmd};
use crate::rpc::{self, Client, Registry};
use crate::store::BlockStore;
use crate::tracker::TrackerMsg;

/// How long a stopping supervisor waits for its receiver task to exit
/// cooperatively before aborting it.
const RECEIVER_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle states of a receiver supervisor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SupervisorState {
    Initialized,
    Started,
    ReceiverStarted,
    Stopping,
    Stopped,
}

/// The worker-side host of one receiver.
pub struct ReceiverSupervisor {
    config: Arc<Config>,
    task: ReceiverTask,
    host: String,
    store: Arc<dyn BlockStore>,
    registry: Registry<TrackerMsg>,
    state_tx: watch::Sender<SupervisorState>,
}

struct SupervisorInner {
    config: Arc<Config>,
    stream_id: StreamId,
    handler: Arc<dyn ReceivedBlockHandler>,
    tracker: Client<TrackerMsg>,
    ids: BlockIdSequence,
    stop_tx: watch::Sender<bool>,
    stop_reason: std::sync::Mutex<Option<(String, String)>>,
}

impl ReceiverSupervisor {
    /// Create a new instance.
    pub fn new(config: Arc<Config>, task: ReceiverTask, host: String, store: Arc<dyn BlockStore>, registry: Registry<TrackerMsg>) -> Self {
        let (state_tx, _) = watch::channel(SupervisorState::Initialized);
        Self {
            config,
            task,
            host,
            store,
            registry,
            state_tx,
        }
    }

    /// A signal tracking the supervisor's lifecycle state.
    pub fn state_signal(&self) -> watch::Receiver<SupervisorState> {
        self.state_tx.subscribe()
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    /// Run the supervisor until its receiver is stopped and deregistered.
    pub async fn run(self) -> Result<()> {
        let stream_id = self.task.stream_id;
        let name = self.task.name.clone();
        tracing::debug!(stream_id, "receiver supervisor for {} is starting", name);
        let mut receiver = self.task.receiver;

        // Bring up storage: the block handler variant is selected by config,
        // the generator feeds it through the supervisor's listener.
        let level = receiver.storage_level();
        let handler = new_block_handler(&self.config, stream_id, self.store.clone(), level).await?;
        let tracker = Client::new(self.registry.clone(), self.config.tracker_addr());
        let (stop_tx, stop_rx) = watch::channel(false);
        let inner = Arc::new(SupervisorInner {
            config: self.config.clone(),
            stream_id,
            handler,
            tracker,
            ids: BlockIdSequence::default(),
            stop_tx,
            stop_reason: std::sync::Mutex::new(None),
        });
        let listener = Arc::new(GeneratorListener { inner: inner.clone() });
        let generator = Arc::new(BlockGenerator::new(stream_id, self.config.clone(), listener, inner.ids.clone()));
        generator.start().await?;
        let _ = self.state_tx.send(SupervisorState::Started);

        // Register with the tracker; an endpoint ref for coordinator commands
        // travels inside the registration.
        let (endpoint_ref, mut endpoint) = rpc::channel::<SupervisorCmd>(format!("{}/receiver-{}-{}", self.host, stream_id, Uuid::new_v4()));
        let host = self.host.clone();
        let registered = inner
            .tracker
            .ask(
                move |tx| TrackerMsg::RegisterReceiver {
                    stream_id,
                    name: name.clone(),
                    host: host.clone(),
                    endpoint: endpoint_ref.clone(),
                    tx,
                },
                self.config.ask_timeout(),
            )
            .await?;
        if !registered {
            generator.stop().await?;
            return Err(IngestError::UnknownStreamId(stream_id).into());
        }
        let _ = self.state_tx.send(SupervisorState::ReceiverStarted);
        tracing::info!(stream_id, "receiver registered with tracker");

        // Run the receiver itself; producer errors are reported, not fatal.
        let ctx = ReceiverContext {
            inner: inner.clone(),
            generator: generator.clone(),
            stopped: stop_rx.clone(),
        };
        let producer_inner = inner.clone();
        let mut producer = tokio::spawn(async move {
            if let Err(err) = receiver.run(ctx).await {
                tracing::error!(error = ?err, "receiver produced an error");
                producer_inner.report_error("receiver error", &format!("{:?}", err)).await;
            }
        });

        // Command loop.
        let mut stop_signal = stop_rx.clone();
        loop {
            tokio::select! {
                cmd = endpoint.rx.recv() => match cmd {
                    Some(SupervisorCmd::StopReceiver) => inner.request_stop("Stopped by driver", None),
                    Some(SupervisorCmd::CleanupOldBlocks { threshold_ms }) => inner.handler.cleanup_old_blocks(threshold_ms).await,
                    None => inner.request_stop("Command endpoint closed", None),
                },
                _ = stop_signal.changed() => break,
            }
        }
        let _ = self.state_tx.send(SupervisorState::Stopping);
        tracing::debug!(stream_id, "receiver supervisor is stopping");

        // Let the receiver wind down, then drain the generator so every
        // buffered record is stored & reported before deregistration.
        match tokio::time::timeout(RECEIVER_JOIN_TIMEOUT, &mut producer).await {
            Ok(Ok(())) => (),
            Ok(Err(err)) => tracing::error!(error = ?err, "error joining receiver task"),
            Err(_) => {
                tracing::warn!(stream_id, "receiver ignored the stop signal, aborting its task");
                producer.abort();
            }
        }
        generator.stop().await?;

        let (message, error) = inner.take_stop_reason();
        let res = inner
            .tracker
            .ask(
                move |tx| TrackerMsg::DeregisterReceiver {
                    stream_id,
                    message: message.clone(),
                    error: error.clone(),
                    tx,
                },
                self.config.ask_timeout(),
            )
            .await;
        match res {
            Ok(_) => tracing::info!(stream_id, "receiver deregistered from tracker"),
            // Shutdown always completes; a lost deregistration is only a warning.
            Err(err) => tracing::warn!(error = %err, stream_id, "error deregistering receiver during shutdown"),
        }
        let _ = self.state_tx.send(SupervisorState::Stopped);
        tracing::debug!(stream_id, "receiver supervisor has stopped");
        Ok(())
    }
}

impl SupervisorInner {
    /// Store the given block, then report its metadata to the tracker.
    ///
    /// The store must complete before the report is sent; the report ack is
    /// awaited within the configured ask timeout.
    async fn push_and_report_block(&self, block: ReceivedBlock, block_id: Option<StreamBlockId>) -> Result<(), IngestError> {
        let block_id = block_id.unwrap_or_else(|| self.ids.next(self.stream_id));
        let num_records = block.num_records();
        let result = self.handler.store_block(block_id, block).await?;
        let info = ReceivedBlockInfo::new(self.stream_id, num_records, result);
        let ok = self
            .tracker
            .ask(move |tx| TrackerMsg::AddBlock { info: info.clone(), tx }, self.config.ask_timeout())
            .await?;
        if !ok {
            return Err(IngestError::TrackerUnavailable(format!("tracker rejected report of block {}", block_id)));
        }
        tracing::debug!(block_id = %block_id, num_records, "block stored & reported");
        Ok(())
    }

    async fn report_error(&self, message: &str, error: &str) {
        let msg = TrackerMsg::ReportError {
            stream_id: self.stream_id,
            message: message.to_string(),
            error: error.to_string(),
        };
        if let Err(err) = self.tracker.tell(msg).await {
            tracing::warn!(error = %err, "error forwarding receiver error to tracker");
        }
    }

    fn request_stop(&self, message: &str, error: Option<String>) {
        {
            let mut reason = self.stop_reason.lock().unwrap_or_else(|err| err.into_inner());
            if reason.is_none() {
                *reason = Some((message.to_string(), error.unwrap_or_default()));
            }
        }
        let _ = self.stop_tx.send(true);
    }

    fn take_stop_reason(&self) -> (String, String) {
        self.stop_reason
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .take()
            .unwrap_or_else(|| ("Stopped".to_string(), String::new()))
    }
}

/// The generator listener wiring block pushes into store-and-report.
struct GeneratorListener {
    inner: Arc<SupervisorInner>,
}

#[async_trait]
impl BlockGeneratorListener for GeneratorListener {
    fn on_generate_block(&self, _block_id: StreamBlockId) {}

    async fn on_push_block(&self, block_id: StreamBlockId, records: Vec<Bytes>) {
        if let Err(err) = self.inner.push_and_report_block(ReceivedBlock::Records(records), Some(block_id)).await {
            // The block may remain stored but unreported; the tracker's own
            // log stays authoritative for what was reported.
            tracing::error!(error = %err, block_id = %block_id, "error storing & reporting block");
            self.inner
                .report_error(&format!("error storing & reporting block {}", block_id), &err.to_string())
                .await;
        }
    }

    fn on_error(&self, message: &str) {
        tracing::error!(%message, "block generator error");
        let inner = self.inner.clone();
        let message = message.to_string();
        tokio::spawn(async move { inner.report_error(&message, "").await });
    }
}

/// The handle through which receiver implementations push data and signal
/// their supervisor.
#[derive(Clone)]
pub struct ReceiverContext {
    inner: Arc<SupervisorInner>,
    generator: Arc<BlockGenerator>,
    stopped: watch::Receiver<bool>,
}

impl ReceiverContext {
    /// Enqueue a single record into the block generator.
    pub async fn push_single(&self, record: Bytes) -> Result<(), IngestError> {
        self.generator.add_data(record).await
    }

    /// Store and report a pre-batched buffer of records, bypassing the generator.
    pub async fn push_records(&self, records: Vec<Bytes>, block_id: Option<StreamBlockId>) -> Result<(), IngestError> {
        self.inner.push_and_report_block(ReceivedBlock::Records(records), block_id).await
    }

    /// Store and report a pre-batched iterator of records, bypassing the generator.
    pub async fn push_iter(
        &self, records: Box<dyn Iterator<Item = Bytes> + Send>, block_id: Option<StreamBlockId>,
    ) -> Result<(), IngestError> {
        self.inner.push_and_report_block(ReceivedBlock::Iter(records), block_id).await
    }

    /// Store and report pre-serialized record bytes, bypassing the generator.
    pub async fn push_bytes(&self, bytes: Bytes, block_id: Option<StreamBlockId>) -> Result<(), IngestError> {
        self.inner.push_and_report_block(ReceivedBlock::Bytes(bytes), block_id).await
    }

    /// Forward an error to the tracker without stopping the receiver.
    pub async fn report_error(&self, message: &str, error: &str) {
        self.inner.report_error(message, error).await
    }

    /// Initiate an orderly shutdown of the supervisor.
    pub fn stop(&self, message: &str, error: Option<String>) {
        self.inner.request_stop(message, error)
    }

    /// Whether a stop has been requested.
    pub fn is_stopped(&self) -> bool {
        *self.stopped.borrow()
    }

    /// A watch over the stop flag, for receivers driving their own select loops.
    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stopped.clone()
    }

    /// The current depth of the generator's handoff queue.
    ///
    /// Advisory back-pressure signal: a receiver may sample this to throttle
    /// its source.
    pub fn queue_depth(&self) -> usize {
        self.generator.queue_depth()
    }
}
