//! Receiver tracker.
//!
//! The coordinator-side front end: a registry of live receivers, an endpoint
//! serializing their RPCs one message at a time, the launcher which ships one
//! long task per receiver to the scheduler, and the batch-time allocation API
//! driven by the batch generator.

mod blocks;
mod launcher;
#[cfg(test)]
mod mod_test;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use futures::stream::StreamExt;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};

use crate::config::Config;
use crate::error::IngestError;
use crate::models::{ReceivedBlockInfo, StreamId};
use crate::receiver::{Receiver, ReceiverSupervisor, ReceiverTask, SupervisorCmd};
use crate::rpc::{EndpointRef, Registry};
use crate::store::BlockStore;
use crate::wal::WalStore;

pub use blocks::ReceivedBlockTracker;
pub use launcher::{LocalTaskLauncher, RunReceiverFn, TaskLauncher};

/// How long tracker shutdown waits for the receiver job to settle.
const LAUNCHER_JOIN_TIMEOUT: Duration = Duration::from_secs(10);
/// The poll cadence of a graceful shutdown.
const GRACEFUL_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Capacity of the listener event bus; lagging subscribers lose events.
const EVENT_BUS_CAPACITY: usize = 256;

/// Wire messages handled by the tracker endpoint.
pub enum TrackerMsg {
    /// A receiver supervisor announcing itself.
    RegisterReceiver {
        stream_id: StreamId,
        /// The receiver's type name, for diagnostics.
        name: String,
        /// The worker host the receiver runs on.
        host: String,
        /// The supervisor's command endpoint.
        endpoint: EndpointRef<SupervisorCmd>,
        tx: oneshot::Sender<bool>,
    },
    /// A receiver reporting a stored block.
    AddBlock { info: ReceivedBlockInfo, tx: oneshot::Sender<bool> },
    /// A receiver forwarding a non-fatal error.
    ReportError { stream_id: StreamId, message: String, error: String },
    /// A receiver supervisor signing off.
    DeregisterReceiver {
        stream_id: StreamId,
        message: String,
        error: String,
        tx: oneshot::Sender<bool>,
    },
}

/// Tracking info for one receiver instance.
///
/// `endpoint == None && !active` marks a receiver which deregistered but whose
/// info is retained for reporting.
#[derive(Clone, Debug)]
pub struct ReceiverInfo {
    pub stream_id: StreamId,
    pub name: String,
    pub endpoint: Option<EndpointRef<SupervisorCmd>>,
    pub active: bool,
    pub host: String,
    pub last_error_message: String,
    pub last_error: String,
}

/// Notifications fanned out to listener-bus subscribers, best-effort.
#[derive(Clone, Debug)]
pub enum ReceiverEvent {
    Started(Arc<ReceiverInfo>),
    Error(Arc<ReceiverInfo>),
    Stopped(Arc<ReceiverInfo>),
}

/// A declared input stream: a stream id plus the factory for its receiver.
pub struct ReceiverInputStream {
    stream_id: StreamId,
    name: String,
    factory: Box<dyn Fn() -> Box<dyn Receiver> + Send + Sync>,
}

impl ReceiverInputStream {
    /// Create a new instance.
    pub fn new(
        stream_id: StreamId, name: impl Into<String>, factory: impl Fn() -> Box<dyn Receiver> + Send + Sync + 'static,
    ) -> Self {
        Self {
            stream_id,
            name: name.into(),
            factory: Box::new(factory),
        }
    }

    /// The id of this input stream.
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Instantiate this stream's receiver and wrap it as a launchable task.
    fn make_receiver_task(&self) -> ReceiverTask {
        let receiver = (self.factory)();
        ReceiverTask {
            stream_id: self.stream_id,
            name: self.name.clone(),
            preferred_host: receiver.preferred_location(),
            receiver,
        }
    }
}

/// A map of receiver tracking info, snapshotted by copy.
type ReceiverInfoMap = Arc<ArcSwap<HashMap<StreamId, Arc<ReceiverInfo>>>>;

/// The coordinator-side receiver registry and batch allocation front end.
pub struct ReceiverTracker {
    config: Arc<Config>,
    registry: Registry<TrackerMsg>,
    input_streams: Arc<Vec<ReceiverInputStream>>,
    stream_ids: Arc<HashSet<StreamId>>,
    /// Receivers with a live registration.
    active: ReceiverInfoMap,
    /// Last known info per stream, retained after deregistration for diagnostics.
    last_known: ReceiverInfoMap,
    block_tracker: Arc<ReceivedBlockTracker>,
    events_tx: broadcast::Sender<ReceiverEvent>,
    launcher: Arc<dyn TaskLauncher>,
    store: Arc<dyn BlockStore>,
    /// Whether the receiver job is currently submitted.
    running: Arc<AtomicBool>,
    started: AtomicBool,
    skip_receiver_launch: bool,
    shutdown_tx: broadcast::Sender<()>,
    endpoint_handle: std::sync::Mutex<Option<JoinHandle<Result<()>>>>,
    launcher_handle: std::sync::Mutex<Option<JoinHandle<Result<()>>>>,
}

impl ReceiverTracker {
    /// Create a new instance, recovering block bookkeeping from the event log
    /// when write-ahead logging is enabled.
    pub async fn new(
        config: Arc<Config>, input_streams: Vec<ReceiverInputStream>, registry: Registry<TrackerMsg>, store: Arc<dyn BlockStore>,
        launcher: Arc<dyn TaskLauncher>, skip_receiver_launch: bool,
    ) -> Result<Self> {
        let wal = if config.wal_enable {
            let checkpoint_dir = config
                .checkpoint_dir
                .as_deref()
                .context("checkpoint_dir is required when wal_enable is set")?;
            Some(WalStore::open(PathBuf::from(checkpoint_dir).join("tracker"), config.wal_rotation_ms).await?)
        } else {
            None
        };
        let stream_ids: Vec<StreamId> = input_streams.iter().map(|stream| stream.stream_id).collect();
        let block_tracker = Arc::new(ReceivedBlockTracker::new(stream_ids.clone(), wal).await?);
        let (events_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            config,
            registry,
            input_streams: Arc::new(input_streams),
            stream_ids: Arc::new(stream_ids.into_iter().collect()),
            active: Default::default(),
            last_known: Default::default(),
            block_tracker,
            events_tx,
            launcher,
            store,
            running: Arc::new(AtomicBool::new(false)),
            started: AtomicBool::new(false),
            skip_receiver_launch,
            shutdown_tx,
            endpoint_handle: std::sync::Mutex::new(None),
            launcher_handle: std::sync::Mutex::new(None),
        })
    }

    /// Start the tracker endpoint and launch all receivers.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(IngestError::AlreadyStarted("receiver tracker").into());
        }
        if self.input_streams.is_empty() {
            return Ok(());
        }
        let endpoint = self.registry.register(&self.config.tracker_addr());
        let endpoint_actor = TrackerEndpoint {
            stream_ids: self.stream_ids.clone(),
            active: self.active.clone(),
            last_known: self.last_known.clone(),
            block_tracker: self.block_tracker.clone(),
            events_tx: self.events_tx.clone(),
            msgs_rx: ReceiverStream::new(endpoint.rx),
            shutdown_rx: BroadcastStream::new(self.shutdown_tx.subscribe()),
        };
        *lock_handle(&self.endpoint_handle) = Some(endpoint_actor.spawn());
        if !self.skip_receiver_launch {
            *lock_handle(&self.launcher_handle) = Some(self.spawn_launcher());
        }
        tracing::info!(streams = self.input_streams.len(), "receiver tracker started");
        Ok(())
    }

    /// Stop the tracker.
    ///
    /// When `graceful`, waits for every receiver to deregister and the
    /// receiver job to settle before tearing down the endpoint.
    pub async fn stop(&self, graceful: bool) -> Result<()> {
        tracing::debug!("receiver tracker is stopping");
        self.stop_receivers().await;

        let launcher_handle = lock_handle(&self.launcher_handle).take();
        if let Some(handle) = launcher_handle {
            match tokio::time::timeout(LAUNCHER_JOIN_TIMEOUT, handle).await {
                Ok(Ok(Ok(()))) => (),
                Ok(Ok(Err(err))) => tracing::warn!(error = ?err, "receiver job finished with error"),
                Ok(Err(err)) => tracing::warn!(error = ?err, "error joining receiver launcher"),
                Err(_) => tracing::warn!("timeout joining receiver launcher"),
            }
        }
        if graceful {
            while !self.active.load().is_empty() || self.running.load(Ordering::SeqCst) {
                tokio::time::sleep(GRACEFUL_POLL_INTERVAL).await;
            }
            tracing::debug!("all receivers have deregistered");
        }

        let _res = self.shutdown_tx.send(());
        self.registry.deregister(&self.config.tracker_addr());
        let endpoint_handle = lock_handle(&self.endpoint_handle).take();
        if let Some(handle) = endpoint_handle {
            if let Err(err) = handle.await {
                tracing::error!(error = ?err, "error joining tracker endpoint");
            }
        }
        self.block_tracker.stop().await;
        tracing::info!("receiver tracker stopped");
        Ok(())
    }

    /// Bind all unallocated blocks to the given batch.
    pub async fn allocate_blocks_to_batch(&self, batch_time: i64) {
        self.block_tracker.allocate_blocks_to_batch(batch_time).await
    }

    /// The committed mapping for the given batch, or an empty map.
    pub async fn get_blocks_of_batch(&self, batch_time: i64) -> HashMap<StreamId, Vec<ReceivedBlockInfo>> {
        self.block_tracker.get_blocks_of_batch(batch_time).await
    }

    /// The committed block sequence for one stream of the given batch.
    pub async fn get_blocks_of_batch_and_stream(&self, batch_time: i64, stream_id: StreamId) -> Vec<ReceivedBlockInfo> {
        self.block_tracker.get_blocks_of_batch_and_stream(batch_time, stream_id).await
    }

    /// Whether any stream has reported blocks not yet bound to a batch.
    pub async fn has_unallocated_blocks(&self) -> bool {
        self.block_tracker.has_unallocated_blocks().await
    }

    /// Clean up batch metadata older than the threshold and tell every live
    /// receiver to drop its stored blocks from before that point.
    pub async fn cleanup_old_blocks_and_batches(&self, threshold_ms: i64) {
        self.block_tracker.cleanup_old_batches(threshold_ms, false).await;
        // The block store seam makes no self-expiry promise, so the cleanup
        // broadcast goes out regardless of the WAL setting.
        let snapshot = self.active.load_full();
        for info in snapshot.values() {
            if let Some(endpoint) = &info.endpoint {
                if let Err(err) = endpoint.tell(SupervisorCmd::CleanupOldBlocks { threshold_ms }).await {
                    tracing::warn!(error = %err, stream_id = info.stream_id, "error sending cleanup to receiver");
                }
            }
        }
    }

    /// Subscribe to receiver lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ReceiverEvent> {
        self.events_tx.subscribe()
    }

    /// A snapshot of all receivers with a live registration.
    pub fn receiver_info(&self) -> HashMap<StreamId, Arc<ReceiverInfo>> {
        self.active.load().as_ref().clone()
    }

    /// A snapshot of the last known info per stream, including deregistered
    /// receivers retained for diagnostics.
    pub fn last_known_receiver_info(&self) -> HashMap<StreamId, Arc<ReceiverInfo>> {
        self.last_known.load().as_ref().clone()
    }

    /// Fire-and-forget a stop command to every live receiver.
    async fn stop_receivers(&self) {
        let snapshot = self.active.load_full();
        for info in snapshot.values() {
            if let Some(endpoint) = &info.endpoint {
                if let Err(err) = endpoint.tell(SupervisorCmd::StopReceiver).await {
                    tracing::warn!(error = %err, stream_id = info.stream_id, "error sending stop to receiver");
                }
            }
        }
        if !snapshot.is_empty() {
            tracing::info!(receivers = snapshot.len(), "sent stop signal to all receivers");
        }
    }

    /// Instantiate every receiver and submit the long-running receiver job.
    fn spawn_launcher(&self) -> JoinHandle<Result<()>> {
        let input_streams = self.input_streams.clone();
        let launcher = self.launcher.clone();
        let running = self.running.clone();
        let config = self.config.clone();
        let store = self.store.clone();
        let registry = self.registry.clone();
        tokio::spawn(async move {
            let tasks: Vec<ReceiverTask> = input_streams.iter().map(ReceiverInputStream::make_receiver_task).collect();
            if tasks.iter().all(|task| task.preferred_host.is_some()) {
                tracing::debug!("all receivers declare a preferred host, submitting a placement-constrained job");
            } else {
                tracing::debug!(receivers = tasks.len(), "distributing receivers round-robin across workers");
            }
            let run: RunReceiverFn = Arc::new(move |task: ReceiverTask| {
                let host = task.preferred_host.clone().unwrap_or_else(|| config.coordinator_host.clone());
                let supervisor = ReceiverSupervisor::new(config.clone(), task, host, store.clone(), registry.clone());
                Box::pin(supervisor.run())
            });
            running.store(true, Ordering::SeqCst);
            let res = async {
                if !launcher.is_local() {
                    launcher.await_live_workers(tasks.len()).await?;
                }
                launcher.run_job(tasks, run).await
            }
            .await;
            running.store(false, Ordering::SeqCst);
            if let Err(err) = &res {
                tracing::error!(error = ?err, "error running receiver job");
            }
            res
        })
    }
}

/// The endpoint actor serializing tracker RPC handling.
struct TrackerEndpoint {
    stream_ids: Arc<HashSet<StreamId>>,
    active: ReceiverInfoMap,
    last_known: ReceiverInfoMap,
    block_tracker: Arc<ReceivedBlockTracker>,
    events_tx: broadcast::Sender<ReceiverEvent>,
    msgs_rx: ReceiverStream<TrackerMsg>,
    shutdown_rx: BroadcastStream<()>,
}

impl TrackerEndpoint {
    fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!("tracker endpoint has started");
        loop {
            tokio::select! {
                Some(msg) = self.msgs_rx.next() => self.handle_msg(msg).await,
                _ = self.shutdown_rx.next() => break,
            }
        }
        tracing::debug!("tracker endpoint has shutdown");
        Ok(())
    }

    /// Handle one tracker message.
    #[tracing::instrument(level = "trace", skip(self, msg))]
    async fn handle_msg(&mut self, msg: TrackerMsg) {
        match msg {
            TrackerMsg::RegisterReceiver {
                stream_id,
                name,
                host,
                endpoint,
                tx,
            } => {
                let _res = tx.send(self.handle_register(stream_id, name, host, endpoint));
            }
            TrackerMsg::AddBlock { info, tx } => {
                let ok = self.block_tracker.add_block(info).await;
                let _res = tx.send(ok);
            }
            TrackerMsg::ReportError { stream_id, message, error } => self.handle_report_error(stream_id, message, error),
            TrackerMsg::DeregisterReceiver {
                stream_id,
                message,
                error,
                tx,
            } => {
                let _res = tx.send(self.handle_deregister(stream_id, message, error));
            }
        }
    }

    fn handle_register(&mut self, stream_id: StreamId, name: String, host: String, endpoint: EndpointRef<SupervisorCmd>) -> bool {
        if !self.stream_ids.contains(&stream_id) {
            tracing::error!(stream_id, "rejecting registration for unknown input stream");
            return false;
        }
        // A stream may only register over an inactive predecessor.
        if self.active.load().get(&stream_id).map_or(false, |info| info.active) {
            tracing::error!(stream_id, "rejecting registration, receiver already active for stream");
            return false;
        }
        let info = Arc::new(ReceiverInfo {
            stream_id,
            name,
            endpoint: Some(endpoint),
            active: true,
            host,
            last_error_message: String::new(),
            last_error: String::new(),
        });
        insert_info(&self.active, info.clone());
        insert_info(&self.last_known, info.clone());
        let _res = self.events_tx.send(ReceiverEvent::Started(info));
        tracing::info!(stream_id, "receiver registered");
        true
    }

    fn handle_report_error(&mut self, stream_id: StreamId, message: String, error: String) {
        let current = self
            .active
            .load()
            .get(&stream_id)
            .cloned()
            .or_else(|| self.last_known.load().get(&stream_id).cloned());
        let current = match current {
            Some(current) => current,
            None => {
                tracing::warn!(stream_id, "error report for unknown receiver");
                return;
            }
        };
        tracing::warn!(stream_id, %message, %error, "receiver reported an error");
        let mut updated = (*current).clone();
        updated.last_error_message = message;
        updated.last_error = error;
        let updated = Arc::new(updated);
        if updated.active {
            insert_info(&self.active, updated.clone());
        }
        insert_info(&self.last_known, updated.clone());
        let _res = self.events_tx.send(ReceiverEvent::Error(updated));
    }

    fn handle_deregister(&mut self, stream_id: StreamId, message: String, error: String) -> bool {
        let base = remove_info(&self.active, stream_id).or_else(|| self.last_known.load().get(&stream_id).cloned());
        let base = match base {
            Some(base) => base,
            None => {
                tracing::warn!(stream_id, "deregistration for unknown receiver");
                return true;
            }
        };
        let mut info = (*base).clone();
        info.active = false;
        info.endpoint = None;
        info.last_error_message = message;
        info.last_error = error;
        let info = Arc::new(info);
        insert_info(&self.last_known, info.clone());
        let _res = self.events_tx.send(ReceiverEvent::Stopped(info));
        tracing::info!(stream_id, "receiver deregistered");
        true
    }
}

fn insert_info(map: &ReceiverInfoMap, info: Arc<ReceiverInfo>) {
    let orig = map.load_full();
    let mut updated = orig.as_ref().clone();
    updated.insert(info.stream_id, info);
    map.store(Arc::new(updated));
}

fn remove_info(map: &ReceiverInfoMap, stream_id: StreamId) -> Option<Arc<ReceiverInfo>> {
    let orig = map.load_full();
    let mut updated = orig.as_ref().clone();
    let removed = updated.remove(&stream_id);
    if removed.is_some() {
        map.store(Arc::new(updated));
    }
    removed
}

fn lock_handle(handle: &std::sync::Mutex<Option<JoinHandle<Result<()>>>>) -> std::sync::MutexGuard<'_, Option<JoinHandle<Result<()>>>> {
    handle.lock().unwrap_or_else(|err| err.into_inner())
}
