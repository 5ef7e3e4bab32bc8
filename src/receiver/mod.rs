//! Receiver seam & worker-side supervisor.

mod supervisor;

use async_trait::async_trait;

use crate::models::{StorageLevel, StreamId};

pub use supervisor::{ReceiverContext, ReceiverSupervisor, SupervisorState};

/// Commands sent from the coordinator to a receiver supervisor.
#[derive(Debug)]
pub enum SupervisorCmd {
    /// Stop the hosted receiver and shut the supervisor down.
    StopReceiver,
    /// Drop stored block data older than the carried threshold.
    CleanupOldBlocks {
        /// Unix millis; blocks persisted before this point are expendable.
        threshold_ms: i64,
    },
}

/// User code which reads from an external source and emits records.
///
/// A receiver runs as one long-lived task hosted by a [`ReceiverSupervisor`].
/// Implementations push data through the given [`ReceiverContext`] and are
/// expected to poll its stop signal; a receiver which ignores the signal is
/// eventually aborted by its supervisor.
#[async_trait]
pub trait Receiver: Send + 'static {
    /// The durability level requested for this receiver's blocks.
    fn storage_level(&self) -> StorageLevel {
        StorageLevel::default()
    }

    /// The worker host this receiver prefers to run on.
    fn preferred_location(&self) -> Option<String> {
        None
    }

    /// Run the receiver until its source is exhausted or the context signals
    /// stop. A returned error is reported to the tracker without stopping the
    /// supervisor.
    async fn run(&mut self, ctx: ReceiverContext) -> anyhow::Result<()>;
}

/// A unit of work handed to the task launcher: one receiver to host.
pub struct ReceiverTask {
    /// The input stream the receiver feeds.
    pub stream_id: StreamId,
    /// The receiver's display name, used as its registered type name.
    pub name: String,
    /// The worker host the receiver prefers, if any.
    pub preferred_host: Option<String>,
    /// The receiver instance itself.
    pub receiver: Box<dyn Receiver>,
}
