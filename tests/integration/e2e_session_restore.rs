//! End-to-end session restore tests.
//!
//! - Reconnect on the same instance within the grace window keeps the
//!   session id and replays nothing when nothing was missed.
//! - Unknown private ids and unparsable offsets refuse recovery.
//! - The grace window destroys sessions that reconnect too late.
//!
//! Instances share one in-memory capped collection; each has its own mock
//! host framework.

use relay_bus::protocol::BroadcastOptions;
use relay_bus::{AdapterConfig, Host, RecoveryError, RelayAdapter};
use relay_test_utils::{MemoryStream, MockHost, init_tracing, wait_until_async};
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
    start_instance_with(store, nsp, uid, |_| {}).await
}

async fn start_instance_with(
    store: &Arc<MemoryStream>,
    nsp: &str,
    uid: &str,
    tweak: impl FnOnce(&mut AdapterConfig),
) -> Instance {
    init_tracing();
    let host = Arc::new(MockHost::new());
    let mut cfg = AdapterConfig {
        uid: Some(uid.to_owned()),
        requests_timeout: Duration::from_secs(2),
        heartbeat_interval: Duration::from_millis(50),
        heartbeat_timeout: Duration::from_millis(400),
        ..Default::default()
    };
    tweak(&mut cfg);
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

async fn await_cluster(instances: &[&Instance], size: usize) {
    for instance in instances {
        let adapter = &instance.adapter;
        let formed = wait_until_async(Duration::from_secs(2), || async {
            adapter.server_count().await >= size
        })
        .await;
        assert!(formed, "cluster did not reach size {size} in time");
    }
}

// ---------------------------------------------------------------------------
// Test: restore on the same instance, nothing missed.
// ---------------------------------------------------------------------------

/// Scenario:
/// 1. Three instances share the stream; a client connects to A.
/// 2. The client receives one broadcast carrying offset X.
/// 3. The transport drops abruptly; the session is persisted.
/// 4. The client reconnects to A with (pid, X) inside the grace window.
/// 5. Expect: same session id, no replayed packets, live delivery resumes.
#[tokio::test]
async fn restore_on_same_instance_keeps_sid_and_replays_nothing() {
    let store = MemoryStream::shared(128);
    let a = start_instance(&store, "/", "uid-a").await;
    let b = start_instance(&store, "/", "uid-b").await;
    let c = start_instance(&store, "/", "uid-c").await;
    await_cluster(&[&a, &b, &c], 3).await;

    a.host.connect("c1");
    a.adapter.register_session("c1", "pid-1").await;

    a.adapter
        .broadcast(json!({"ev": "welcome"}), BroadcastOptions::default())
        .await
        .expect("fan-out broadcast");
    let sent = a.host.sent_to("c1");
    assert_eq!(sent.len(), 1);
    let offset = sent[0].offset.expect("stamped offset");

    // Abrupt disconnect: snapshot the session, then the host drops the socket.
    a.adapter.persist_session("c1").await.expect("persist");
    a.host.disconnect("c1", false);

    let restored = a
        .adapter
        .restore_session("pid-1", &offset.to_string())
        .await
        .expect("recovery succeeds");
    assert_eq!(restored.sid, "c1");
    assert_eq!(restored.pid, "pid-1");
    // Nothing was broadcast while disconnected, so nothing is replayed.
    assert_eq!(a.host.sent_to("c1").len(), 1);

    // Live delivery resumes with advancing offsets.
    a.adapter
        .broadcast(json!({"ev": "after"}), BroadcastOptions::default())
        .await
        .expect("fan-out broadcast");
    let sent = a.host.sent_to("c1");
    assert_eq!(sent.len(), 2);
    assert!(sent[1].offset.expect("offset") > offset);

    a.adapter.close().await;
    b.adapter.close().await;
    c.adapter.close().await;
}

// ---------------------------------------------------------------------------
// Test: recovery refusals.
// ---------------------------------------------------------------------------

/// An invented private id is refused; the client proceeds as new.
#[tokio::test]
async fn unknown_pid_refuses_recovery() {
    let store = MemoryStream::shared(128);
    let a = start_instance(&store, "/", "uid-a").await;

    a.host.connect("c1");
    a.adapter.register_session("c1", "pid-real").await;

    let err = a
        .adapter
        .restore_session("abc", "1")
        .await
        .expect_err("unknown pid must refuse");
    assert!(matches!(err, RecoveryError::SessionUnknown));

    a.adapter.close().await;
}

/// An offset that does not parse as a stream id is refused outright.
#[tokio::test]
async fn unparsable_offset_refuses_recovery() {
    let store = MemoryStream::shared(128);
    let a = start_instance(&store, "/", "uid-a").await;

    a.host.connect("c1");
    a.adapter.register_session("c1", "pid-1").await;
    a.adapter.persist_session("c1").await.expect("persist");

    let err = a
        .adapter
        .restore_session("pid-1", "abc")
        .await
        .expect_err("garbage offset must refuse");
    assert!(matches!(err, RecoveryError::OffsetInvalid));

    a.adapter.close().await;
}

// ---------------------------------------------------------------------------
// Test: grace expiry destroys the session.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn session_past_the_grace_window_is_destroyed() {
    let store = MemoryStream::shared(128);
    let a = start_instance_with(&store, "/", "uid-a", |cfg| {
        cfg.max_disconnection_duration = Duration::from_millis(100);
    })
    .await;

    a.host.connect("c1");
    a.adapter.register_session("c1", "pid-1").await;
    a.adapter
        .broadcast(json!({"ev": 0}), BroadcastOptions::default())
        .await
        .expect("broadcast");
    let offset = a.host.sent_to("c1")[0].offset.expect("offset");

    a.adapter.persist_session("c1").await.expect("persist");
    a.host.disconnect("c1", false);

    tokio::time::sleep(Duration::from_millis(300)).await;

    let err = a
        .adapter
        .restore_session("pid-1", &offset.to_string())
        .await
        .expect_err("expired session must refuse");
    assert!(matches!(err, RecoveryError::SessionUnknown));

    a.adapter.close().await;
}
