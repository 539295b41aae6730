mod common;

use std::time::Duration;

use common::MockRelay;
use relaysync::{
    relay::RelayMessage, Event, Filter, LocalSigner, RelayPool, Signer, UnsignedEvent, WsRelayPool,
};

async fn note(signer: &LocalSigner, content: &str) -> Event {
    signer
        .sign_event(UnsignedEvent::new(1, content))
        .await
        .unwrap()
}

#[tokio::test]
async fn publish_then_list_round_trips_through_relay() {
    let relay = MockRelay::spawn().await;
    let pool = WsRelayPool::new(None).with_timeout(Duration::from_secs(2));
    let signer = LocalSigner::generate();
    let ev = note(&signer, "hello relay").await;

    let report = pool.publish(&ev, &[relay.url.clone()]).await.unwrap();
    assert_eq!(report.sent, vec![relay.url.clone()]);
    assert_eq!(relay.wait_for(1).await, vec![ev.clone()]);

    let listed = pool
        .list(
            &[Filter::new().kinds([1]).authors([signer.public_key()])],
            &[relay.url.clone()],
        )
        .await
        .unwrap();
    assert_eq!(listed, vec![ev]);
}

#[tokio::test]
async fn list_merges_relays_and_tolerates_partial_failure() {
    let a = MockRelay::spawn().await;
    let b = MockRelay::spawn().await;
    let signer = LocalSigner::generate();
    let shared = note(&signer, "on both").await;
    let only_b = note(&signer, "only on b").await;
    a.seed(shared.clone());
    b.seed(shared.clone());
    b.seed(only_b.clone());

    let pool = WsRelayPool::new(None).with_timeout(Duration::from_secs(2));
    let mut listed = pool
        .list(
            &[Filter::new().kinds([1])],
            &[a.url.clone(), b.url.clone(), "ws://127.0.0.1:9".into()],
        )
        .await
        .unwrap();
    listed.sort_by(|x, y| x.content.cmp(&y.content));
    assert_eq!(listed, vec![shared, only_b]);
}

#[tokio::test]
async fn missing_eose_yields_partial_results_after_timeout() {
    let relay = MockRelay::spawn_without_eose().await;
    let signer = LocalSigner::generate();
    let ev = note(&signer, "slow relay").await;
    relay.seed(ev.clone());

    let pool = WsRelayPool::new(None).with_timeout(Duration::from_millis(300));
    let listed = pool
        .list(&[Filter::new()], &[relay.url.clone()])
        .await
        .unwrap();
    assert_eq!(listed, vec![ev]);
}

#[tokio::test]
async fn subscribe_streams_stored_events_then_eose() {
    let relay = MockRelay::spawn().await;
    let signer = LocalSigner::generate();
    let ev = note(&signer, "streamed").await;
    relay.seed(ev.clone());

    let pool = WsRelayPool::new(None).with_timeout(Duration::from_secs(2));
    let mut rx = pool.subscribe(&relay.url, &[Filter::new()]).await.unwrap();
    match rx.recv().await {
        Some(RelayMessage::Event { event, .. }) => assert_eq!(event, ev),
        other => panic!("expected event, got {other:?}"),
    }
    assert!(matches!(rx.recv().await, Some(RelayMessage::Eose(_))));
}

#[tokio::test]
async fn dropping_receiver_closes_subscription_on_silent_relay() {
    let relay = MockRelay::spawn().await;
    let pool = WsRelayPool::new(None).with_timeout(Duration::from_secs(2));
    let mut rx = pool.subscribe(&relay.url, &[Filter::new()]).await.unwrap();
    assert!(matches!(rx.recv().await, Some(RelayMessage::Eose(_))));
    assert_eq!(relay.closes.load(std::sync::atomic::Ordering::SeqCst), 0);

    drop(rx);
    assert_eq!(relay.wait_for_close().await, 1);
}
