//! End-to-end failure-path tests.
//!
//! - A store append failure degrades a broadcast to local-only delivery and
//!   surfaces the error to the caller; the stream stays usable afterwards.
//! - `flags.local` broadcasts never touch the store and never reach peers.
//! - Losing the collection terminally surfaces a stream-gone event.
//!
//! Heartbeats are slowed to minutes here so injected append failures are
//! consumed by the operation under test, not by background traffic.

use relay_bus::protocol::BroadcastOptions;
use relay_bus::{AdapterConfig, AdapterEvent, PublishError, RelayAdapter};
use relay_test_utils::{MemoryStream, MockHost, init_tracing, wait_until};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Harness helpers (duplicated per suite to keep each file self-contained).
// ---------------------------------------------------------------------------

struct Instance {
    adapter: RelayAdapter,
    host: Arc<MockHost>,
}

async fn start_instance(store: &Arc<MemoryStream>, nsp: &str, uid: &str) -> Instance {
    init_tracing();
    let host = Arc::new(MockHost::new());
    let cfg = AdapterConfig {
        uid: Some(uid.to_owned()),
        requests_timeout: Duration::from_secs(2),
        heartbeat_interval: Duration::from_secs(60),
        heartbeat_timeout: Duration::from_secs(120),
        ..Default::default()
    };
    let adapter = RelayAdapter::new(
        Arc::clone(store) as Arc<dyn relay_bus::EventStream>,
        Arc::clone(&host) as Arc<dyn relay_bus::Host>,
        nsp,
        cfg,
    )
        .expect("valid adapter config");
    adapter.init().await;
    Instance { adapter, host }
}

fn broadcast_docs(store: &MemoryStream) -> usize {
    store
        .documents()
        .iter()
        .filter(|doc| doc["type"] == "broadcast")
        .count()
}

// ---------------------------------------------------------------------------
// Test: append failure falls back to local delivery.
// ---------------------------------------------------------------------------

/// Scenario: the store rejects the append for a non-local broadcast.
/// Local sockets still receive the packet; the caller sees the publish
/// error; no record reaches the remote instance.
#[tokio::test]
async fn append_failure_still_delivers_locally_and_surfaces_the_error() {
    let store = MemoryStream::shared(128);
    let a = start_instance(&store, "/", "uid-a").await;
    let b = start_instance(&store, "/", "uid-b").await;

    a.host.connect("a1");
    b.host.connect("b1");

    // Exhaust every bounded publish attempt.
    store.fail_next_appends(3);
    let err = a
        .adapter
        .broadcast(json!({"ev": "degraded"}), BroadcastOptions::default())
        .await
        .expect_err("append failure must surface");
    assert!(matches!(err, PublishError::Failed { attempts: 3, .. }));

    // Local delivery happened anyway, without an offset to stamp.
    let sent = a.host.sent_to("a1");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].offset, None);

    // Nothing made it into the stream or across to B.
    assert_eq!(broadcast_docs(&store), 0);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(b.host.sent_to("b1").is_empty());

    // The stream is healthy again afterwards.
    a.adapter
        .broadcast(json!({"ev": "recovered"}), BroadcastOptions::default())
        .await
        .expect("healthy broadcast");
    assert_eq!(broadcast_docs(&store), 1);
    let b_host = Arc::clone(&b.host);
    assert!(wait_until(Duration::from_secs(2), move || b_host.sent_to("b1").len() == 1).await);

    a.adapter.close().await;
    b.adapter.close().await;
}

// ---------------------------------------------------------------------------
// Test: local-flag broadcasts stay local.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn local_flag_causes_no_insert_and_no_remote_delivery() {
    let store = MemoryStream::shared(128);
    let a = start_instance(&store, "/", "uid-a").await;
    let b = start_instance(&store, "/", "uid-b").await;

    a.host.connect("a1");
    b.host.connect("b1");

    let mut opts = BroadcastOptions::default();
    opts.flags.local = true;
    let offset = a
        .adapter
        .broadcast(json!({"ev": "whisper"}), opts)
        .await
        .expect("local broadcast");

    assert_eq!(offset, None);
    assert_eq!(a.host.sent_to("a1").len(), 1);
    assert_eq!(broadcast_docs(&store), 0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(b.host.sent_to("b1").is_empty());

    a.adapter.close().await;
    b.adapter.close().await;
}

// ---------------------------------------------------------------------------
// Test: losing the collection is fatal and surfaced.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn losing_the_collection_surfaces_a_stream_gone_event() {
    let store = MemoryStream::shared(128);
    let a = start_instance(&store, "/", "uid-a").await;
    let mut events = a.adapter.subscribe_events();

    store.set_gone();

    let event = tokio::time::timeout(Duration::from_secs(3), events.recv())
        .await
        .expect("event must arrive before the timeout")
        .expect("event channel open");
    let AdapterEvent::StreamGone { reason } = event;
    assert!(reason.contains("dropped"), "unexpected reason: {reason}");

    a.adapter.close().await;
}
