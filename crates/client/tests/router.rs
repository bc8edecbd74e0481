//! Integration tests for `SubscriptionRouter`.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{next_server, quiet_config, MockConnector, ENDPOINT};
use jobsync_client::events::ConnectionStatus;
use jobsync_client::messages::{EventTag, ServerMessage};
use jobsync_client::router::{Subscription, SubscriptionRouter};
use serde_json::json;
use tokio::sync::mpsc;

/// Handler that forwards the job id of every message it sees.
fn forward(tx: mpsc::UnboundedSender<String>) -> impl Fn(&ServerMessage) + Send + Sync + 'static {
    move |message| {
        let _ = tx.send(message.job_id().unwrap_or_default().to_string());
    }
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
    tokio::time::timeout(Duration::from_secs(60), rx.recv())
        .await
        .expect("handler was not called")
        .expect("handler channel closed")
}

// ---------------------------------------------------------------------------
// Test: first subscription opens the endpoint and receives its tag
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn first_subscription_connects_and_dispatches() {
    let (connector, mut servers) = MockConnector::accepting();
    let router = SubscriptionRouter::new(quiet_config(), connector.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();

    let _sub = router.subscribe(ENDPOINT, EventTag::Progress, forward(tx));
    assert_eq!(router.endpoint_count(), 1);

    let server = next_server(&mut servers).await;
    server.send_json(json!({ "event": "completed", "jobId": "ignored" }));
    server.send_json(json!({ "event": "progress", "jobId": "job_1", "progress": 5 }));

    assert_eq!(recv(&mut rx).await, "job_1");
    assert_eq!(connector.attempts(), 1);
}

// ---------------------------------------------------------------------------
// Test: handlers on one endpoint share one connection
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn subscriptions_share_a_connection_per_endpoint() {
    let (connector, _servers) = MockConnector::accepting();
    let router = SubscriptionRouter::new(quiet_config(), connector.clone());

    let _a = router.subscribe(ENDPOINT, EventTag::Progress, |_| {});
    let _b = router.subscribe(ENDPOINT, EventTag::Completed, |_| {});
    let _c = router.subscribe("ws://other.test/ws", EventTag::Progress, |_| {});

    common::eventually(|| connector.attempts() == 2).await;
    assert_eq!(router.endpoint_count(), 2);
    assert_eq!(router.handler_count(ENDPOINT), 2);
}

// ---------------------------------------------------------------------------
// Test: messages reach handlers in arrival order across tags
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn dispatch_follows_arrival_order() {
    let (connector, mut servers) = MockConnector::accepting();
    let router = SubscriptionRouter::new(quiet_config(), connector);
    let (tx, mut rx) = mpsc::unbounded_channel();

    // Registered in the opposite order to arrival.
    let _completed = router.subscribe(ENDPOINT, EventTag::Completed, forward(tx.clone()));
    let _progress = router.subscribe(ENDPOINT, EventTag::Progress, forward(tx));

    let server = next_server(&mut servers).await;
    server.send_json(json!({ "event": "progress", "jobId": "first", "progress": 50 }));
    server.send_json(json!({ "event": "job.succeeded", "jobId": "second" }));
    server.send_json(json!({ "event": "progress", "jobId": "third", "progress": 60 }));

    assert_eq!(recv(&mut rx).await, "first");
    assert_eq!(recv(&mut rx).await, "second");
    assert_eq!(recv(&mut rx).await, "third");
}

// ---------------------------------------------------------------------------
// Test: unsubscribe stops delivery and is idempotent
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn unsubscribed_handler_is_not_called() {
    let (connector, mut servers) = MockConnector::accepting();
    let router = SubscriptionRouter::new(quiet_config(), connector);
    let (gone_tx, mut gone_rx) = mpsc::unbounded_channel();
    let (kept_tx, mut kept_rx) = mpsc::unbounded_channel();

    let gone = router.subscribe(ENDPOINT, EventTag::Progress, forward(gone_tx));
    let _kept = router.subscribe(ENDPOINT, EventTag::Progress, forward(kept_tx));
    let server = next_server(&mut servers).await;

    gone.unsubscribe();
    gone.unsubscribe();
    assert!(!gone.is_active());
    assert_eq!(router.handler_count(ENDPOINT), 1);

    server.send_json(json!({ "event": "progress", "jobId": "job_1", "progress": 1 }));
    assert_eq!(recv(&mut kept_rx).await, "job_1");
    assert!(gone_rx.try_recv().is_err());
}

// ---------------------------------------------------------------------------
// Test: a handler unsubscribed by an earlier handler mid-dispatch is skipped
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn unsubscribe_during_dispatch_skips_in_flight_message() {
    let (connector, mut servers) = MockConnector::accepting();
    let router = SubscriptionRouter::new(quiet_config(), connector);
    let victim_slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
    let (victim_tx, mut victim_rx) = mpsc::unbounded_channel();
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();

    let slot = Arc::clone(&victim_slot);
    let _killer = router.subscribe(ENDPOINT, EventTag::Progress, move |_| {
        if let Some(victim) = slot.lock().unwrap().take() {
            victim.unsubscribe();
        }
    });
    let victim = router.subscribe(ENDPOINT, EventTag::Progress, forward(victim_tx));
    *victim_slot.lock().unwrap() = Some(victim);
    let _witness = router.subscribe(ENDPOINT, EventTag::Progress, forward(done_tx));

    let server = next_server(&mut servers).await;
    server.send_json(json!({ "event": "progress", "jobId": "job_1", "progress": 1 }));

    assert_eq!(recv(&mut done_rx).await, "job_1");
    assert!(victim_rx.try_recv().is_err());
    assert_eq!(router.handler_count(ENDPOINT), 2);
}

// ---------------------------------------------------------------------------
// Test: a panicking handler does not block the others
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn panicking_handler_is_isolated() {
    let (connector, mut servers) = MockConnector::accepting();
    let router = SubscriptionRouter::new(quiet_config(), connector);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let _bad = router.subscribe(ENDPOINT, EventTag::Progress, |_| panic!("handler bug"));
    let _good = router.subscribe(ENDPOINT, EventTag::Progress, forward(tx));

    let server = next_server(&mut servers).await;
    server.send_json(json!({ "event": "progress", "jobId": "a", "progress": 1 }));
    server.send_json(json!({ "event": "progress", "jobId": "b", "progress": 2 }));

    assert_eq!(recv(&mut rx).await, "a");
    assert_eq!(recv(&mut rx).await, "b");
}

// ---------------------------------------------------------------------------
// Test: the last unsubscribe tears the endpoint's connection down
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn last_unsubscribe_closes_connection() {
    let (connector, mut servers) = MockConnector::accepting();
    let router = SubscriptionRouter::new(quiet_config(), connector.clone());

    let first = router.subscribe(ENDPOINT, EventTag::Progress, |_| {});
    let second = router.subscribe(ENDPOINT, EventTag::Failed, |_| {});
    let mut server = next_server(&mut servers).await;

    let connection = router.connection(ENDPOINT).expect("endpoint is open");
    let mut status = connection.watch_status();
    status
        .wait_for(|s| *s == ConnectionStatus::Connected)
        .await
        .unwrap();

    drop(first);
    assert_eq!(router.endpoint_count(), 1);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(connection.status(), ConnectionStatus::Connected);

    drop(second);
    assert_eq!(router.endpoint_count(), 0);
    assert!(router.connection(ENDPOINT).is_none());

    status
        .wait_for(|s| *s == ConnectionStatus::Disconnected)
        .await
        .unwrap();
    assert!(server.recv_json().await.is_none());

    // A new subscription opens a fresh connection.
    let _again = router.subscribe(ENDPOINT, EventTag::Progress, |_| {});
    let _server = next_server(&mut servers).await;
    assert_eq!(connector.attempts(), 2);
}
