//! RPC coordinator: matches request records to the response and ack records
//! peers write back, under a deadline.
//!
//! One pending entry per in-flight request, keyed by `requestId`.  A request
//! settles when every awaited peer has contributed, when its deadline fires
//! (partial result), or when enough peers are declared dead that nothing
//! more can arrive.  Settlement never rejects; callers always get whatever
//! was collected.
//!
//! Peer liveness comes from heartbeat records on the same stream.  Any
//! record from a peer refreshes its presence, so a chatty peer is never
//! declared dead between heartbeats.

use relay_protocol::AckFrame;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Aggregated outcome of one cluster request.
#[derive(Debug, Default)]
pub struct RpcOutcome {
    /// One entry per peer response, in arrival order.
    pub responses: Vec<Value>,
    /// Client acks collected from `ack` records (broadcast-with-ack).
    pub acks: Vec<Value>,
    /// Total clients targeted across responding peers.
    pub client_count: u64,
    /// True when the deadline fired or the cluster shrank before every
    /// awaited peer contributed.
    pub partial: bool,
}

struct Pending {
    kind: &'static str,
    awaiting: HashSet<String>,
    responses: Vec<Value>,
    acks: Vec<Value>,
    client_count: u64,
    resolve: oneshot::Sender<RpcOutcome>,
    deadline: tokio::task::JoinHandle<()>,
}

impl Pending {
    fn settle(self, partial: bool) {
        self.deadline.abort();
        let _ = self.resolve.send(RpcOutcome {
            responses: self.responses,
            acks: self.acks,
            client_count: self.client_count,
            partial,
        });
    }
}

pub(crate) struct RpcCoordinator {
    pending: Arc<Mutex<HashMap<String, Pending>>>,
    presence: Mutex<HashMap<String, Instant>>,
    heartbeat_timeout: Duration,
}

impl RpcCoordinator {
    pub(crate) fn new(heartbeat_timeout: Duration) -> Self {
        RpcCoordinator {
            pending: Arc::new(Mutex::new(HashMap::new())),
            presence: Mutex::new(HashMap::new()),
            heartbeat_timeout,
        }
    }

    /// Register a pending request awaiting one contribution from each of
    /// `peers`, and arm its deadline.  With no live peers the returned
    /// receiver is already resolved (empty, complete).
    pub(crate) async fn register(
        &self,
        request_id: String,
        kind: &'static str,
        peers: HashSet<String>,
        deadline: Duration,
    ) -> oneshot::Receiver<RpcOutcome> {
        let (tx, rx) = oneshot::channel();
        if peers.is_empty() {
            let _ = tx.send(RpcOutcome::default());
            return rx;
        }

        let timer = {
            let pending = Arc::clone(&self.pending);
            let request_id = request_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                let mut table = pending.lock().await;
                if let Some(entry) = table.remove(&request_id) {
                    warn!(
                        request_id = %request_id,
                        kind = entry.kind,
                        received = entry.responses.len(),
                        missing = entry.awaiting.len(),
                        "request deadline expired, resolving with partial responses"
                    );
                    entry.settle(true);
                }
            })
        };

        self.pending.lock().await.insert(
            request_id,
            Pending {
                kind,
                awaiting: peers,
                responses: Vec::new(),
                acks: Vec::new(),
                client_count: 0,
                resolve: tx,
                deadline: timer,
            },
        );
        rx
    }

    /// Drop a registration whose request record never made it into the
    /// stream.
    pub(crate) async fn discard(&self, request_id: &str) {
        if let Some(entry) = self.pending.lock().await.remove(request_id) {
            entry.deadline.abort();
        }
    }

    /// Feed one peer response into its pending request.
    pub(crate) async fn on_response(&self, from: &str, request_id: &str, data: Value) {
        let mut table = self.pending.lock().await;
        let Some(entry) = table.get_mut(request_id) else {
            debug!(request_id, from, "response for unknown or settled request");
            return;
        };
        if !entry.awaiting.remove(from) {
            debug!(
                request_id,
                from, "dropping response from unexpected or duplicate responder"
            );
            return;
        }
        entry.responses.push(data);
        let done = entry.awaiting.is_empty();
        if done && let Some(entry) = table.remove(request_id) {
            entry.settle(false);
        }
    }

    /// Feed one peer's aggregated client acks into its pending request.
    pub(crate) async fn on_ack(&self, from: &str, frame: AckFrame) {
        let mut table = self.pending.lock().await;
        let Some(entry) = table.get_mut(&frame.request_id) else {
            debug!(request_id = %frame.request_id, from, "ack for unknown or settled request");
            return;
        };
        if !entry.awaiting.remove(from) {
            debug!(
                request_id = %frame.request_id,
                from, "dropping ack from unexpected or duplicate responder"
            );
            return;
        }
        entry.client_count += frame.client_count;
        entry.acks.extend(frame.acks);
        let done = entry.awaiting.is_empty();
        if done && let Some(entry) = table.remove(&frame.request_id) {
            entry.settle(false);
        }
    }

    /// Refresh a peer's liveness.
    pub(crate) async fn mark_presence(&self, uid: &str) {
        self.presence
            .lock()
            .await
            .insert(uid.to_owned(), Instant::now());
    }

    /// Peers with a heartbeat inside the liveness window.
    pub(crate) async fn alive_peers(&self) -> HashSet<String> {
        let presence = self.presence.lock().await;
        presence
            .iter()
            .filter(|(_, seen)| seen.elapsed() < self.heartbeat_timeout)
            .map(|(uid, _)| uid.clone())
            .collect()
    }

    /// Live cluster size, this instance included.
    pub(crate) async fn server_count(&self) -> usize {
        self.alive_peers().await.len() + 1
    }

    /// Drop peers that have gone silent and subtract their contribution
    /// from every pending request; requests left waiting on nothing settle
    /// with what arrived.  Returns the pruned uids.
    pub(crate) async fn prune_dead(&self) -> Vec<String> {
        let dead: Vec<String> = {
            let mut presence = self.presence.lock().await;
            let dead: Vec<String> = presence
                .iter()
                .filter(|(_, seen)| seen.elapsed() >= self.heartbeat_timeout)
                .map(|(uid, _)| uid.clone())
                .collect();
            for uid in &dead {
                presence.remove(uid);
            }
            dead
        };
        if dead.is_empty() {
            return dead;
        }

        let mut table = self.pending.lock().await;
        let request_ids: Vec<String> = table.keys().cloned().collect();
        for request_id in request_ids {
            let Some(entry) = table.get_mut(&request_id) else {
                continue;
            };
            let mut shrunk = false;
            for uid in &dead {
                shrunk |= entry.awaiting.remove(uid);
            }
            let drained = shrunk && entry.awaiting.is_empty();
            if drained && let Some(entry) = table.remove(&request_id) {
                warn!(
                    request_id = %request_id,
                    kind = entry.kind,
                    "cluster shrank mid-request, settling with collected responses"
                );
                entry.settle(true);
            }
        }
        dead
    }

    /// Settle everything still pending (shutdown path).
    pub(crate) async fn settle_all(&self) {
        let mut table = self.pending.lock().await;
        for (request_id, entry) in table.drain() {
            debug!(request_id = %request_id, "settling pending request at shutdown");
            entry.settle(true);
        }
    }
}
