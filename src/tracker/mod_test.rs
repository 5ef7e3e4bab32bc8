use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::broadcast::error::TryRecvError;

use crate::config::Config;
use crate::fixtures::{self, StaticReceiver};
use crate::models::ReceivedBlockInfo;
use crate::receiver::SupervisorCmd;
use crate::rpc::{self, Endpoint, Registry};
use crate::tracker::{ReceiverEvent, ReceiverInputStream, ReceiverTracker, TrackerMsg};

const ASK_TIMEOUT: Duration = Duration::from_secs(1);

fn static_stream(stream_id: u32, records: usize) -> ReceiverInputStream {
    ReceiverInputStream::new(stream_id, "StaticReceiver", move || {
        Box::new(StaticReceiver {
            records: fixtures::random_records(records),
        })
    })
}

/// Streams which are declared but never launched (tests drive RPCs by hand).
fn idle_streams(stream_ids: &[u32]) -> Vec<ReceiverInputStream> {
    stream_ids.iter().map(|&stream_id| static_stream(stream_id, 0)).collect()
}

/// Register a hand-rolled receiver endpoint for the given stream.
async fn register(
    registry: &Registry<TrackerMsg>, config: &Config, stream_id: u32,
) -> Result<(bool, Endpoint<SupervisorCmd>)> {
    let (endpoint_ref, endpoint) = rpc::channel(format!("test/receiver-{}", stream_id));
    let tracker_ref = registry.resolve(&config.tracker_addr())?;
    let registered = tracker_ref
        .ask(
            move |tx| TrackerMsg::RegisterReceiver {
                stream_id,
                name: "TestReceiver".into(),
                host: "localhost".into(),
                endpoint: endpoint_ref.clone(),
                tx,
            },
            ASK_TIMEOUT,
        )
        .await?;
    Ok((registered, endpoint))
}

async fn wait_for_registrations(tracker: &ReceiverTracker, count: usize) -> Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tracker.receiver_info().len() < count {
        if tokio::time::Instant::now() > deadline {
            bail!("timeout awaiting {} receiver registrations", count);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

#[tokio::test]
async fn unknown_stream_registration_is_rejected() -> Result<()> {
    let (config, _tmpdir) = Config::new_test(false)?;
    let (tracker, _store, registry) = fixtures::new_test_tracker(config.clone(), idle_streams(&[0, 1]), true).await?;
    tracker.start().await?;
    let mut events = tracker.subscribe();

    let (registered, _endpoint) = register(&registry, &config, 2).await?;
    assert!(!registered, "registration outside the declared stream set must be refused");
    assert!(tracker.receiver_info().is_empty());
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)), "no lifecycle event may be published");

    tracker.stop(false).await?;
    Ok(())
}

#[tokio::test]
async fn register_report_deregister_flow() -> Result<()> {
    let (config, _tmpdir) = Config::new_test(false)?;
    let (tracker, _store, registry) = fixtures::new_test_tracker(config.clone(), idle_streams(&[0]), true).await?;
    tracker.start().await?;
    let mut events = tracker.subscribe();
    let tracker_ref = registry.resolve(&config.tracker_addr())?;

    // Register.
    let (registered, _endpoint) = register(&registry, &config, 0).await?;
    assert!(registered);
    let event = tokio::time::timeout(ASK_TIMEOUT, events.recv()).await??;
    assert!(matches!(event, ReceiverEvent::Started(ref info) if info.stream_id == 0 && info.active));
    assert_eq!(tracker.receiver_info().len(), 1);

    // A second registration for the same stream is refused while active.
    let (registered_again, _endpoint2) = register(&registry, &config, 0).await?;
    assert!(!registered_again, "an active registration must not be replaced");

    // Report a block.
    let info = ReceivedBlockInfo::new_test(0, 0, 25);
    let info_for_ask = info.clone();
    let acked = tracker_ref
        .ask(move |tx| TrackerMsg::AddBlock { info: info_for_ask.clone(), tx }, ASK_TIMEOUT)
        .await?;
    assert!(acked);
    tracker.allocate_blocks_to_batch(100).await;
    assert_eq!(tracker.get_blocks_of_batch_and_stream(100, 0).await, vec![info]);

    // Report an error; the info is updated and the event published.
    tracker_ref
        .tell(TrackerMsg::ReportError {
            stream_id: 0,
            message: "source hiccup".into(),
            error: "io".into(),
        })
        .await?;
    let event = tokio::time::timeout(ASK_TIMEOUT, events.recv()).await??;
    match event {
        ReceiverEvent::Error(info) => {
            assert_eq!(info.last_error_message, "source hiccup");
            assert_eq!(info.last_error, "io");
        }
        other => bail!("expected ReceiverError event, got {:?}", other),
    }

    // Deregister: removed from the active index, retained as last known.
    let acked = tracker_ref
        .ask(
            move |tx| TrackerMsg::DeregisterReceiver {
                stream_id: 0,
                message: "done".into(),
                error: String::new(),
                tx,
            },
            ASK_TIMEOUT,
        )
        .await?;
    assert!(acked);
    let event = tokio::time::timeout(ASK_TIMEOUT, events.recv()).await??;
    assert!(matches!(event, ReceiverEvent::Stopped(ref info) if !info.active && info.endpoint.is_none()));
    assert!(tracker.receiver_info().is_empty());
    let last_known = tracker.last_known_receiver_info();
    let retained = last_known.get(&0).context("last known info missing")?;
    assert!(!retained.active);
    assert_eq!(retained.last_error_message, "done");

    // With the predecessor inactive, the stream may register again.
    let (registered, _endpoint3) = register(&registry, &config, 0).await?;
    assert!(registered, "re-registration over an inactive predecessor must succeed");

    tracker.stop(false).await?;
    Ok(())
}

#[tokio::test]
async fn cleanup_is_broadcast_to_live_receivers() -> Result<()> {
    let (config, _tmpdir) = Config::new_test(false)?;
    let (tracker, _store, registry) = fixtures::new_test_tracker(config.clone(), idle_streams(&[0]), true).await?;
    tracker.start().await?;

    let (registered, mut endpoint) = register(&registry, &config, 0).await?;
    assert!(registered);
    wait_for_registrations(&tracker, 1).await?;

    tracker.cleanup_old_blocks_and_batches(12_345).await;
    let cmd = tokio::time::timeout(ASK_TIMEOUT, endpoint.rx.recv())
        .await?
        .context("command endpoint closed")?;
    assert!(
        matches!(cmd, SupervisorCmd::CleanupOldBlocks { threshold_ms: 12_345 }),
        "expected a cleanup command, got {:?}",
        cmd
    );

    tracker.stop(false).await?;
    Ok(())
}

#[tokio::test]
async fn graceful_stop_drains_and_deregisters_all_receivers() -> Result<()> {
    let (config, _tmpdir) = Config::new_test(false)?;
    let streams = vec![static_stream(0, 5), static_stream(1, 5)];
    let (tracker, store, _registry) = fixtures::new_test_tracker(config.clone(), streams, false).await?;
    tracker.start().await?;
    wait_for_registrations(&tracker, 2).await?;

    tracker.stop(true).await?;
    assert!(tracker.receiver_info().is_empty(), "all receivers must be deregistered");

    // Every pushed record was stored & reported and lands in exactly one batch.
    tracker.allocate_blocks_to_batch(100).await;
    let batch = tracker.get_blocks_of_batch(100).await;
    let reported: i64 = batch.values().flatten().map(|info| info.num_records).sum();
    assert_eq!(reported, 10, "expected all 10 records to be reported in the batch");
    let blocks: usize = batch.values().map(Vec::len).sum();
    assert_eq!(store.len(), blocks, "every reported block must be present in the store");
    assert!(!tracker.has_unallocated_blocks().await);
    Ok(())
}

#[tokio::test]
async fn tracker_with_no_input_streams_is_a_noop() -> Result<()> {
    let (config, _tmpdir) = Config::new_test(false)?;
    let (tracker, _store, registry) = fixtures::new_test_tracker(config.clone(), vec![], false).await?;
    tracker.start().await?;
    // No endpoint comes up.
    assert!(registry.resolve(&config.tracker_addr()).is_err());
    tracker.stop(false).await?;
    Ok(())
}
