use std::time::Duration;

use anyhow::Result;
use tokio::sync::oneshot;

use crate::error::IngestError;
use crate::rpc::{self, Client, Registry};

enum TestMsg {
    Ping { val: u64, tx: oneshot::Sender<u64> },
}

const ADDR: &str = "localhost:7077/test";

#[tokio::test]
async fn ask_round_trip() -> Result<()> {
    let registry: Registry<TestMsg> = Registry::new();
    let mut endpoint = registry.register(ADDR);
    tokio::spawn(async move {
        while let Some(TestMsg::Ping { val, tx }) = endpoint.rx.recv().await {
            let _res = tx.send(val + 1);
        }
    });

    let endpoint_ref = registry.resolve(ADDR)?;
    let reply = endpoint_ref.ask(|tx| TestMsg::Ping { val: 41, tx }, Duration::from_secs(1)).await?;
    assert_eq!(reply, 42);
    Ok(())
}

#[tokio::test]
async fn ask_timeout_maps_to_tracker_unavailable() -> Result<()> {
    let registry: Registry<TestMsg> = Registry::new();
    let mut endpoint = registry.register(ADDR);
    tokio::spawn(async move {
        // Hold requests open without replying.
        let mut held = vec![];
        while let Some(msg) = endpoint.rx.recv().await {
            held.push(msg);
        }
    });

    let endpoint_ref = registry.resolve(ADDR)?;
    let res = endpoint_ref.ask(|tx| TestMsg::Ping { val: 0, tx }, Duration::from_millis(50)).await;
    match res {
        Err(IngestError::TrackerUnavailable(_)) => Ok(()),
        other => panic!("expected TrackerUnavailable got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn resolve_unknown_endpoint_fails() {
    let registry: Registry<TestMsg> = Registry::new();
    assert!(matches!(registry.resolve("localhost:7077/missing"), Err(IngestError::TrackerUnavailable(_))));
}

#[tokio::test]
async fn deregistered_endpoint_no_longer_resolves() -> Result<()> {
    let registry: Registry<TestMsg> = Registry::new();
    let _endpoint = registry.register(ADDR);
    registry.resolve(ADDR)?;
    registry.deregister(ADDR);
    assert!(registry.resolve(ADDR).is_err());
    Ok(())
}

#[tokio::test]
async fn client_re_resolves_a_replaced_endpoint() -> Result<()> {
    let registry: Registry<TestMsg> = Registry::new();
    let client = Client::new(registry.clone(), ADDR.to_string());

    // First incarnation answers exactly one request, then dies.
    let mut endpoint = registry.register(ADDR);
    tokio::spawn(async move {
        if let Some(TestMsg::Ping { val, tx }) = endpoint.rx.recv().await {
            let _res = tx.send(val);
        }
    });
    let reply = client.ask(|tx| TestMsg::Ping { val: 1, tx }, Duration::from_secs(1)).await?;
    assert_eq!(reply, 1);
    // Let the first incarnation wind down and drop its receiving half.
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Replace the endpoint under the same name; the client's cached ref is
    // now dead and must be re-resolved transparently.
    let mut endpoint = registry.register(ADDR);
    tokio::spawn(async move {
        while let Some(TestMsg::Ping { val, tx }) = endpoint.rx.recv().await {
            let _res = tx.send(val * 2);
        }
    });
    let reply = client.ask(|tx| TestMsg::Ping { val: 2, tx }, Duration::from_secs(1)).await?;
    assert_eq!(reply, 4);
    Ok(())
}

#[tokio::test]
async fn unregistered_channel_pairs_are_connected() -> Result<()> {
    let (endpoint_ref, mut endpoint) = rpc::channel::<TestMsg>("worker/receiver-0".to_string());
    tokio::spawn(async move {
        while let Some(TestMsg::Ping { val, tx }) = endpoint.rx.recv().await {
            let _res = tx.send(val);
        }
    });
    let reply = endpoint_ref.ask(|tx| TestMsg::Ping { val: 7, tx }, Duration::from_secs(1)).await?;
    assert_eq!(reply, 7);
    Ok(())
}
