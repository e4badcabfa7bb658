//! End-to-end cluster RPC tests.
//!
//! Requests and responses ride the same capped stream as broadcasts.
//! Covered here: socket enumeration across peers, room union, targeted
//! join/leave/disconnect, socket fetch, server-side emit (with and without
//! acks), broadcast-with-ack aggregation, and deadline behavior when a peer
//! stops answering.

use relay_bus::protocol::{BroadcastOptions, TargetOptions};
use relay_bus::{AdapterConfig, RelayAdapter};
use relay_test_utils::{MemoryStream, MockHost, init_tracing, wait_until, wait_until_async};
use serde_json::{Value, json};
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
        heartbeat_interval: Duration::from_millis(50),
        heartbeat_timeout: Duration::from_millis(400),
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

fn rooms(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| (*n).to_owned()).collect()
}

// ---------------------------------------------------------------------------
// Test: SOCKETS union across peers.
// ---------------------------------------------------------------------------

/// Instance A asks for room `r`; B and C report their members.  The result
/// is the full cluster union, and the peer responses on the wire carry only
/// remote sockets (A knows its own locally).
#[tokio::test]
async fn sockets_unions_room_members_across_the_cluster() {
    let store = MemoryStream::shared(256);
    let a = start_instance(&store, "/", "uid-a").await;
    let b = start_instance(&store, "/", "uid-b").await;
    let c = start_instance(&store, "/", "uid-c").await;
    await_cluster(&[&a, &b, &c], 3).await;

    a.host.connect("a1");
    a.host.join("a1", &rooms(&["r"]));
    b.host.connect("b1");
    b.host.join("b1", &rooms(&["r"]));
    b.host.connect("b2");
    b.host.join("b2", &rooms(&["r"]));
    c.host.connect("c1");
    c.host.join("c1", &rooms(&["r"]));
    // A socket outside the room never shows up.
    c.host.connect("c2");

    let members = a.adapter.sockets(rooms(&["r"])).await.expect("sockets");
    let members: Vec<String> = members.into_iter().collect();
    assert_eq!(members, vec!["a1", "b1", "b2", "c1"]);

    // Peer responses exclude the originator's own sockets.
    for doc in store.documents() {
        if doc["type"] == "response" {
            let reported = doc["data"]["data"]["sockets"]
                .as_array()
                .cloned()
                .unwrap_or_default();
            assert!(
                !reported.contains(&json!("a1")),
                "peers must not report the originator's sockets"
            );
        }
    }

    a.adapter.close().await;
    b.adapter.close().await;
    c.adapter.close().await;
}

// ---------------------------------------------------------------------------
// Test: room-name union.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn all_rooms_unions_room_names_across_the_cluster() {
    let store = MemoryStream::shared(256);
    let a = start_instance(&store, "/", "uid-a").await;
    let b = start_instance(&store, "/", "uid-b").await;
    await_cluster(&[&a, &b], 2).await;

    a.host.connect("a1");
    a.host.join("a1", &rooms(&["alpha"]));
    b.host.connect("b1");
    b.host.join("b1", &rooms(&["beta"]));

    let all = a.adapter.all_rooms().await.expect("all_rooms");
    assert!(all.contains("alpha"));
    assert!(all.contains("beta"));
    // Sid rooms are rooms too.
    assert!(all.contains("a1"));
    assert!(all.contains("b1"));

    a.adapter.close().await;
    b.adapter.close().await;
}

// ---------------------------------------------------------------------------
// Test: targeted join / leave / disconnect reach the owning instance.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn remote_join_leave_and_disconnect_act_on_the_owning_instance() {
    let store = MemoryStream::shared(256);
    let a = start_instance(&store, "/", "uid-a").await;
    let b = start_instance(&store, "/", "uid-b").await;
    await_cluster(&[&a, &b], 2).await;

    b.host.connect("b1");

    a.adapter.remote_join("b1", "war-room").await.expect("join");
    let b_host = Arc::clone(&b.host);
    assert!(
        wait_until(Duration::from_secs(2), move || {
            b_host
                .rooms_of("b1")
                .is_some_and(|rooms| rooms.contains("war-room"))
        })
        .await,
        "remote join did not land"
    );

    a.adapter
        .remote_leave("b1", "war-room")
        .await
        .expect("leave");
    let b_host = Arc::clone(&b.host);
    assert!(
        wait_until(Duration::from_secs(2), move || {
            b_host
                .rooms_of("b1")
                .is_some_and(|rooms| !rooms.contains("war-room"))
        })
        .await,
        "remote leave did not land"
    );

    a.adapter
        .remote_disconnect("b1", true)
        .await
        .expect("disconnect");
    let b_host = Arc::clone(&b.host);
    assert!(
        wait_until(Duration::from_secs(2), move || !b_host.is_connected("b1")).await,
        "remote disconnect did not land"
    );
    assert_eq!(b.host.disconnect_log(), vec![("b1".to_owned(), true)]);

    a.adapter.close().await;
    b.adapter.close().await;
}

// ---------------------------------------------------------------------------
// Test: fetch serialized socket views cluster-wide.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fetch_sockets_merges_local_and_remote_views() {
    let store = MemoryStream::shared(256);
    let a = start_instance(&store, "/", "uid-a").await;
    let b = start_instance(&store, "/", "uid-b").await;
    await_cluster(&[&a, &b], 2).await;

    a.host.connect("a1");
    b.host.connect("b1");
    b.host.join("b1", &rooms(&["vip"]));

    let views = a
        .adapter
        .fetch_sockets(TargetOptions::default())
        .await
        .expect("fetch");
    let mut ids: Vec<&str> = views.iter().map(|view| view.id.as_str()).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec!["a1", "b1"]);

    let b1 = views.iter().find(|view| view.id == "b1").expect("b1 view");
    assert!(b1.rooms.contains(&"vip".to_owned()));

    a.adapter.close().await;
    b.adapter.close().await;
}

// ---------------------------------------------------------------------------
// Test: server-side emit, fire-and-forget and acknowledged.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn server_side_emit_reaches_peers_but_never_the_originator() {
    let store = MemoryStream::shared(256);
    let a = start_instance(&store, "/", "uid-a").await;
    let b = start_instance(&store, "/", "uid-b").await;
    let c = start_instance(&store, "/", "uid-c").await;
    await_cluster(&[&a, &b, &c], 3).await;

    a.adapter
        .server_side_emit(vec![json!("config-changed"), json!({"version": 2})])
        .await
        .expect("emit");

    let b_host = Arc::clone(&b.host);
    assert!(wait_until(Duration::from_secs(2), move || b_host.emits().len() == 1).await);
    let c_host = Arc::clone(&c.host);
    assert!(wait_until(Duration::from_secs(2), move || c_host.emits().len() == 1).await);
    assert_eq!(b.host.emits()[0][0], json!("config-changed"));
    // Namespace-level emits never come back to the instance that sent them.
    assert!(a.host.emits().is_empty());

    a.adapter.close().await;
    b.adapter.close().await;
    c.adapter.close().await;
}

#[tokio::test]
async fn server_side_emit_with_ack_collects_one_reply_per_peer() {
    let store = MemoryStream::shared(256);
    let a = start_instance(&store, "/", "uid-a").await;
    let b = start_instance(&store, "/", "uid-b").await;
    let c = start_instance(&store, "/", "uid-c").await;
    await_cluster(&[&a, &b, &c], 3).await;

    b.host.set_emit_reply(json!("from-b"));
    c.host.set_emit_reply(json!("from-c"));

    let mut replies = a
        .adapter
        .server_side_emit_with_ack(vec![json!("ping")])
        .await
        .expect("emit with ack");
    replies.sort_by_key(|reply| reply.to_string());
    assert_eq!(replies, vec![json!("from-b"), json!("from-c")]);

    a.adapter.close().await;
    b.adapter.close().await;
    c.adapter.close().await;
}

// ---------------------------------------------------------------------------
// Test: broadcast-with-ack aggregates clients across the cluster.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn broadcast_with_ack_aggregates_client_acks_cluster_wide() {
    let store = MemoryStream::shared(256);
    let a = start_instance(&store, "/", "uid-a").await;
    let b = start_instance(&store, "/", "uid-b").await;
    let c = start_instance(&store, "/", "uid-c").await;
    await_cluster(&[&a, &b, &c], 3).await;

    a.host.connect("a1");
    a.host.set_ack_reply("a1", json!("ack-a1"));
    b.host.connect("b1");
    b.host.set_ack_reply("b1", json!("ack-b1"));
    b.host.connect("b2");
    b.host.set_ack_reply("b2", json!("ack-b2"));
    // C has no sockets; it still answers with a zero-client aggregate.

    let result = a
        .adapter
        .broadcast_with_ack(
            json!({"ev": "sync"}),
            BroadcastOptions::default(),
            Some(Duration::from_secs(3)),
        )
        .await
        .expect("broadcast with ack");

    assert_eq!(result.client_count, 3);
    assert!(!result.partial);
    let mut acks: Vec<String> = result
        .acks
        .iter()
        .filter_map(Value::as_str)
        .map(ToOwned::to_owned)
        .collect();
    acks.sort_unstable();
    assert_eq!(acks, vec!["ack-a1", "ack-b1", "ack-b2"]);

    a.adapter.close().await;
    b.adapter.close().await;
    c.adapter.close().await;
}

// ---------------------------------------------------------------------------
// Test: a silent peer cannot hang a request.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn requests_settle_with_partials_when_a_peer_goes_silent() {
    let store = MemoryStream::shared(256);
    let a = start_instance(&store, "/", "uid-a").await;
    let b = start_instance(&store, "/", "uid-b").await;
    let d = start_instance(&store, "/", "uid-d").await;
    await_cluster(&[&a, &b, &d], 3).await;

    b.host.connect("b1");
    b.host.join("b1", &rooms(&["r"]));

    // D stops participating: its listener and heartbeat go away, but A
    // still counts it alive until the liveness window lapses.
    d.adapter.close().await;

    let members = tokio::time::timeout(
        Duration::from_secs(5),
        a.adapter.sockets(rooms(&["r"])),
    )
    .await
    .expect("request must settle within its deadline")
    .expect("sockets");

    assert!(members.contains("b1"));

    a.adapter.close().await;
    b.adapter.close().await;
}
