//! The adapter facade: wiring, lifecycle, record dispatch, and the
//! host-facing operation surface.
//!
//! One `RelayAdapter` serves one namespace on one instance.  It is cheap to
//! clone (all state is shared) and all background work is torn down through
//! a shutdown watch.

use crate::config::{AdapterConfig, ConfigError, SessionStore};
use crate::delivery;
use crate::host::{Host, SocketView};
use crate::listener;
use crate::publisher::{PublishError, Publisher};
use crate::recovery::{RecoveryError, SessionRegistry};
use crate::rpc::{RpcCoordinator, RpcOutcome};
use crate::store::{EventStream, StoreError};
use chrono::Utc;
use futures_util::StreamExt;
use relay_protocol::{
    BroadcastOptions, EventRecord, RecordBody, RequestFrame, RequestOp, SessionRecord, StreamId,
    TargetOptions,
};
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tracing::{debug, info, warn};

/// Out-of-band notifications from the adapter's background tasks.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    /// The tail cursor could not be re-established: this instance no longer
    /// receives remote records.  The host decides whether to restart.
    StreamGone { reason: String },
}

/// Aggregate result of a broadcast-with-ack.
#[derive(Debug, Default)]
pub struct BroadcastAck {
    /// Clients targeted across the whole cluster.
    pub client_count: u64,
    pub acks: Vec<Value>,
    /// True when some acks were still outstanding at the deadline.
    pub partial: bool,
}

/// One namespace's distributed adapter.
#[derive(Clone)]
pub struct RelayAdapter {
    nsp: String,
    uid: String,
    cfg: AdapterConfig,
    store: Arc<dyn EventStream>,
    host: Arc<dyn Host>,
    publisher: Arc<Publisher>,
    rpc: Arc<RpcCoordinator>,
    sessions: Arc<SessionRegistry>,
    events: broadcast::Sender<AdapterEvent>,
    shutdown: Arc<watch::Sender<bool>>,
    tasks: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>>,
    started: Arc<AtomicBool>,
}

impl RelayAdapter {
    pub fn new(
        store: Arc<dyn EventStream>,
        host: Arc<dyn Host>,
        nsp: &str,
        cfg: AdapterConfig,
    ) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let uid = cfg
            .uid
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let publisher = Arc::new(Publisher::new(Arc::clone(&store), nsp, &uid, &cfg));
        let rpc = Arc::new(RpcCoordinator::new(cfg.heartbeat_timeout));
        let (events, _) = broadcast::channel(32);
        let (shutdown, _) = watch::channel(false);
        Ok(RelayAdapter {
            nsp: nsp.to_owned(),
            uid,
            cfg,
            store,
            host,
            publisher,
            rpc,
            sessions: Arc::new(SessionRegistry::default()),
            events,
            shutdown: Arc::new(shutdown),
            tasks: Arc::new(Mutex::new(Vec::new())),
            started: Arc::new(AtomicBool::new(false)),
        })
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Announce this instance and start the tail listener and heartbeat
    /// tasks.  Idempotent; a second call is a no-op.
    pub async fn init(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!(uid = %self.uid, "adapter already initialized");
            return;
        }
        if let Err(err) = self.publisher.publish_heartbeat().await {
            warn!(error = %err, "initial heartbeat publish failed");
        }
        let tail_task = tokio::spawn(listener::run(self.clone(), self.shutdown.subscribe()));
        let heartbeat_task = tokio::spawn(heartbeat_loop(self.clone(), self.shutdown.subscribe()));
        self.tasks.lock().await.extend([tail_task, heartbeat_task]);
        info!(uid = %self.uid, nsp = %self.nsp, "adapter initialized");
    }

    /// Stop background tasks (the in-flight record finishes; no new record
    /// is read) and settle outstanding requests with partial results.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            if let Err(err) = task.await
                && !err.is_cancelled()
            {
                warn!(error = %err, "adapter task ended abnormally");
            }
        }
        self.rpc.settle_all().await;
        info!(uid = %self.uid, nsp = %self.nsp, "adapter closed");
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn nsp(&self) -> &str {
        &self.nsp
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<AdapterEvent> {
        self.events.subscribe()
    }

    /// Live cluster size, this instance included.
    pub async fn server_count(&self) -> usize {
        self.rpc.server_count().await
    }

    /// Current end of the stream; what a freshly connected client should
    /// use as its initial replay cursor.
    pub async fn current_offset(&self) -> Result<Option<StreamId>, StoreError> {
        self.store.latest_id().await
    }

    pub(crate) fn config(&self) -> &AdapterConfig {
        &self.cfg
    }

    pub(crate) fn store(&self) -> &Arc<dyn EventStream> {
        &self.store
    }

    pub(crate) fn emit_stream_gone(&self, err: &StoreError) {
        warn!(uid = %self.uid, error = %err, "event stream lost");
        let _ = self.events.send(AdapterEvent::StreamGone {
            reason: err.to_string(),
        });
    }

    // -----------------------------------------------------------------------
    // Record dispatch (called by the listener, in stream order)
    // -----------------------------------------------------------------------

    pub(crate) async fn dispatch(&self, record: EventRecord) {
        if record.uid == self.uid {
            return;
        }
        if record.nsp != self.nsp {
            return;
        }
        // Presence is namespace-scoped: adapters of other namespaces never
        // answer this namespace's requests, so they must not count as
        // peers.  Any same-namespace record is proof of life, not just
        // heartbeats.
        self.rpc.mark_presence(&record.uid).await;
        match record.body {
            RecordBody::Broadcast(data) => {
                delivery::apply_broadcast(
                    self.host.as_ref(),
                    &self.sessions,
                    &data.packet,
                    &data.opts,
                    record.id,
                )
                .await;
            }
            RecordBody::Request(frame) => {
                // Acting on a request may insert a response; keep the
                // dispatch loop free of store round-trips.
                let adapter = self.clone();
                tokio::spawn(async move { adapter.handle_request(frame).await });
            }
            RecordBody::Response(frame) => {
                self.rpc
                    .on_response(&record.uid, &frame.request_id, frame.data)
                    .await;
            }
            RecordBody::Ack(frame) => self.rpc.on_ack(&record.uid, frame).await,
            RecordBody::ServerSideEmit(data) => {
                self.host.server_side_emit(&data.args);
            }
            RecordBody::Heartbeat => {}
            // Lookup rows; nothing to dispatch.
            RecordBody::Session(_) => {}
        }
    }

    async fn handle_request(&self, frame: RequestFrame) {
        let request_id = frame.request_id;
        let kind = frame.op.kind();
        let reply = match frame.op {
            RequestOp::Sockets { opts } => {
                let sids = delivery::select_targets(self.host.as_ref(), &opts.rooms, &opts.except);
                json!({ "sockets": sids })
            }
            RequestOp::AllRooms => json!({ "rooms": self.host.rooms() }),
            RequestOp::RemoteJoin { opts, rooms } => {
                let targets = delivery::select_targets(self.host.as_ref(), &opts.rooms, &opts.except);
                for sid in &targets {
                    self.host.add_all(sid, &rooms);
                }
                json!({ "updated": targets.len() })
            }
            RequestOp::RemoteLeave { opts, rooms } => {
                let targets = delivery::select_targets(self.host.as_ref(), &opts.rooms, &opts.except);
                for sid in &targets {
                    for room in &rooms {
                        self.host.del(sid, room);
                    }
                }
                json!({ "updated": targets.len() })
            }
            RequestOp::RemoteDisconnect { opts, close } => {
                let targets = delivery::select_targets(self.host.as_ref(), &opts.rooms, &opts.except);
                let mut disconnected = 0u64;
                for sid in &targets {
                    if self.host.disconnect(sid, close) {
                        disconnected += 1;
                    }
                }
                json!({ "disconnected": disconnected })
            }
            RequestOp::RemoteFetch { opts } => {
                match serde_json::to_value(self.host.fetch_sockets(&opts)) {
                    Ok(views) => json!({ "sockets": views }),
                    Err(err) => {
                        warn!(error = %err, "socket views failed to serialize");
                        json!({ "sockets": [] })
                    }
                }
            }
            RequestOp::ServerSideEmit { args } => {
                self.host.server_side_emit(&args).unwrap_or(Value::Null)
            }
            RequestOp::BroadcastWithAck { packet, opts } => {
                self.answer_broadcast_with_ack(&request_id, packet, opts)
                    .await;
                return;
            }
        };
        if let Err(err) = self.publisher.publish_response(&request_id, reply).await {
            warn!(request_id = %request_id, kind, error = %err, "response publish failed");
        }
    }

    async fn answer_broadcast_with_ack(
        &self,
        request_id: &str,
        packet: Value,
        opts: BroadcastOptions,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let expected = self.host.broadcast_with_ack(&packet, &opts, tx);
        let acks = collect_acks(rx, expected, self.cfg.requests_timeout).await;
        if let Err(err) = self.publisher.publish_ack(request_id, expected, acks).await {
            warn!(request_id = %request_id, error = %err, "ack aggregate publish failed");
        }
    }

    // -----------------------------------------------------------------------
    // Broadcast surface
    // -----------------------------------------------------------------------

    /// Publish one packet to every matching socket in the cluster (local
    /// delivery included).  Returns the assigned stream offset, or `None`
    /// for a `flags.local` broadcast that never left this instance.
    ///
    /// When the store append fails the packet is still applied locally and
    /// the error is surfaced: remote fan-out is best-effort.
    pub async fn broadcast(
        &self,
        packet: Value,
        mut opts: BroadcastOptions,
    ) -> Result<Option<StreamId>, PublishError> {
        opts.normalize();
        if opts.flags.local {
            delivery::apply_broadcast(self.host.as_ref(), &self.sessions, &packet, &opts, None)
                .await;
            return Ok(None);
        }
        match self.publisher.publish_broadcast(&packet, &opts).await {
            Ok(offset) => {
                delivery::apply_broadcast(
                    self.host.as_ref(),
                    &self.sessions,
                    &packet,
                    &opts,
                    Some(offset),
                )
                .await;
                Ok(Some(offset))
            }
            Err(err) => {
                warn!(error = %err, "fan-out append failed, delivering locally only");
                delivery::apply_broadcast(self.host.as_ref(), &self.sessions, &packet, &opts, None)
                    .await;
                Err(err)
            }
        }
    }

    /// Broadcast expecting one ack per targeted client, aggregated across
    /// the cluster under `deadline` (default `requests_timeout`).
    pub async fn broadcast_with_ack(
        &self,
        packet: Value,
        mut opts: BroadcastOptions,
        deadline: Option<Duration>,
    ) -> Result<BroadcastAck, PublishError> {
        opts.normalize();
        let deadline = deadline.unwrap_or(self.cfg.requests_timeout);
        let (tx, rx) = mpsc::unbounded_channel();
        let local_expected = self.host.broadcast_with_ack(&packet, &opts, tx);

        if opts.flags.local {
            let acks = collect_acks(rx, local_expected, deadline).await;
            let partial = (acks.len() as u64) < local_expected;
            return Ok(BroadcastAck {
                client_count: local_expected,
                acks,
                partial,
            });
        }

        let (remote, mut local_acks) = tokio::join!(
            self.send_request(
                RequestOp::BroadcastWithAck { packet, opts },
                Some(deadline),
            ),
            collect_acks(rx, local_expected, deadline),
        );
        let outcome = remote?;
        let partial = outcome.partial || (local_acks.len() as u64) < local_expected;
        let mut acks = Vec::with_capacity(local_acks.len() + outcome.acks.len());
        acks.append(&mut local_acks);
        acks.extend(outcome.acks);
        Ok(BroadcastAck {
            client_count: local_expected + outcome.client_count,
            acks,
            partial,
        })
    }

    // -----------------------------------------------------------------------
    // Cluster queries and targeted operations
    // -----------------------------------------------------------------------

    /// Socket ids matching the room filter, cluster-wide.
    pub async fn sockets(&self, rooms: Vec<String>) -> Result<BTreeSet<String>, PublishError> {
        let mut opts = TargetOptions {
            rooms,
            except: vec![],
        };
        opts.normalize();
        let mut all = delivery::select_targets(self.host.as_ref(), &opts.rooms, &opts.except);
        let outcome = self.send_request(RequestOp::Sockets { opts }, None).await?;
        for response in outcome.responses {
            if let Some(sids) = response.get("sockets").and_then(Value::as_array) {
                for sid in sids {
                    if let Some(sid) = sid.as_str() {
                        all.insert(sid.to_owned());
                    }
                }
            }
        }
        Ok(all)
    }

    /// Union of room names across the cluster.
    pub async fn all_rooms(&self) -> Result<BTreeSet<String>, PublishError> {
        let mut all = self.host.rooms();
        let outcome = self.send_request(RequestOp::AllRooms, None).await?;
        for response in outcome.responses {
            if let Some(rooms) = response.get("rooms").and_then(Value::as_array) {
                for room in rooms {
                    if let Some(room) = room.as_str() {
                        all.insert(room.to_owned());
                    }
                }
            }
        }
        Ok(all)
    }

    /// Join every matching socket (cluster-wide) to `rooms`.
    pub async fn add_sockets(
        &self,
        mut opts: TargetOptions,
        rooms: Vec<String>,
    ) -> Result<(), PublishError> {
        opts.normalize();
        for sid in delivery::select_targets(self.host.as_ref(), &opts.rooms, &opts.except) {
            self.host.add_all(&sid, &rooms);
        }
        self.send_request(RequestOp::RemoteJoin { opts, rooms }, None)
            .await?;
        Ok(())
    }

    /// Remove every matching socket (cluster-wide) from `rooms`.
    pub async fn del_sockets(
        &self,
        mut opts: TargetOptions,
        rooms: Vec<String>,
    ) -> Result<(), PublishError> {
        opts.normalize();
        for sid in delivery::select_targets(self.host.as_ref(), &opts.rooms, &opts.except) {
            for room in &rooms {
                self.host.del(&sid, room);
            }
        }
        self.send_request(RequestOp::RemoteLeave { opts, rooms }, None)
            .await?;
        Ok(())
    }

    /// Disconnect every matching socket, wherever it lives.
    pub async fn disconnect_sockets(
        &self,
        mut opts: TargetOptions,
        close: bool,
    ) -> Result<(), PublishError> {
        opts.normalize();
        for sid in delivery::select_targets(self.host.as_ref(), &opts.rooms, &opts.except) {
            self.host.disconnect(&sid, close);
        }
        self.send_request(RequestOp::RemoteDisconnect { opts, close }, None)
            .await?;
        Ok(())
    }

    pub async fn remote_join(&self, sid: &str, room: &str) -> Result<(), PublishError> {
        self.add_sockets(TargetOptions::single(sid), vec![room.to_owned()])
            .await
    }

    pub async fn remote_leave(&self, sid: &str, room: &str) -> Result<(), PublishError> {
        self.del_sockets(TargetOptions::single(sid), vec![room.to_owned()])
            .await
    }

    pub async fn remote_disconnect(&self, sid: &str, close: bool) -> Result<(), PublishError> {
        self.disconnect_sockets(TargetOptions::single(sid), close)
            .await
    }

    /// Serialized views of matching sockets, cluster-wide.
    pub async fn fetch_sockets(
        &self,
        mut opts: TargetOptions,
    ) -> Result<Vec<SocketView>, PublishError> {
        opts.normalize();
        let mut views = self.host.fetch_sockets(&opts);
        let outcome = self
            .send_request(RequestOp::RemoteFetch { opts }, None)
            .await?;
        for response in outcome.responses {
            match response.get("sockets") {
                Some(sockets) => match serde_json::from_value::<Vec<SocketView>>(sockets.clone()) {
                    Ok(remote) => views.extend(remote),
                    Err(err) => warn!(error = %err, "discarding malformed fetch response"),
                },
                None => warn!("discarding fetch response without sockets"),
            }
        }
        Ok(views)
    }

    /// Fire-and-forget emit to other instances' namespace-level listeners.
    pub async fn server_side_emit(&self, args: Vec<Value>) -> Result<(), PublishError> {
        self.publisher.publish_server_side_emit(args).await?;
        Ok(())
    }

    /// Emit to other instances' namespace-level listeners and collect one
    /// reply per peer.
    pub async fn server_side_emit_with_ack(
        &self,
        args: Vec<Value>,
    ) -> Result<Vec<Value>, PublishError> {
        let outcome = self
            .send_request(RequestOp::ServerSideEmit { args }, None)
            .await?;
        Ok(outcome.responses)
    }

    async fn send_request(
        &self,
        op: RequestOp,
        deadline: Option<Duration>,
    ) -> Result<RpcOutcome, PublishError> {
        let peers = self.rpc.alive_peers().await;
        if peers.is_empty() {
            debug!(kind = op.kind(), "no live peers, answering locally only");
            return Ok(RpcOutcome::default());
        }
        let request_id = uuid::Uuid::new_v4().to_string();
        let deadline = deadline.unwrap_or(self.cfg.requests_timeout);
        let rx = self
            .rpc
            .register(request_id.clone(), op.kind(), peers, deadline)
            .await;
        let frame = RequestFrame {
            request_id: request_id.clone(),
            op,
        };
        if let Err(err) = self.publisher.publish_request(&frame).await {
            self.rpc.discard(&request_id).await;
            return Err(err);
        }
        Ok(rx.await.unwrap_or_else(|_| RpcOutcome {
            responses: Vec::new(),
            acks: Vec::new(),
            client_count: 0,
            partial: true,
        }))
    }

    // -----------------------------------------------------------------------
    // Connection-state recovery
    // -----------------------------------------------------------------------

    /// Start tracking a connected socket that negotiated recovery.
    pub async fn register_session(&self, sid: &str, pid: &str) {
        self.sessions.register_live(sid, pid, None).await;
    }

    /// Forget a session on clean disconnect.
    pub async fn drop_session(&self, sid: &str) {
        self.sessions.drop_live(sid).await;
    }

    /// Snapshot a session on abrupt disconnect so the client can reclaim it
    /// within the grace window.  Call before the host tears down the
    /// socket's room membership.
    pub async fn persist_session(&self, sid: &str) -> Result<(), PublishError> {
        let Some(live) = self.sessions.take_live(sid).await else {
            debug!(sid, "no recoverable session to persist");
            return Ok(());
        };
        let rooms: Vec<String> = self
            .host
            .socket_rooms(sid)
            .map(|rooms| rooms.into_iter().collect())
            .unwrap_or_else(|| vec![sid.to_owned()]);
        let record = SessionRecord {
            sid: sid.to_owned(),
            pid: live.pid,
            nsp: self.nsp.clone(),
            rooms,
            last_offset: live.last_offset.unwrap_or_default(),
            disconnected_at: Utc::now(),
        };
        self.sessions.add_recoverable(record.clone()).await;
        if self.cfg.session_store == SessionStore::Collection {
            self.publisher.persist_session_row(&record).await?;
        }
        Ok(())
    }

    /// Restore a session from `(pid, offset)`: look it up (locally, then in
    /// the shared collection), validate the offset against retention,
    /// re-join the recorded rooms, replay missed broadcasts in stream
    /// order, and mark the session live again.
    pub async fn restore_session(
        &self,
        pid: &str,
        offset: &str,
    ) -> Result<SessionRecord, RecoveryError> {
        let offset: StreamId = offset.parse().map_err(|_| RecoveryError::OffsetInvalid)?;

        let session = match self.sessions.take_recoverable(pid).await {
            Some(session) => Some(session),
            None if self.cfg.session_store == SessionStore::Collection => {
                self.lookup_session_row(pid).await?
            }
            None => None,
        };
        let mut session = session.ok_or(RecoveryError::SessionUnknown)?;

        let grace = chrono::Duration::from_std(self.cfg.max_disconnection_duration)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        if Utc::now().signed_duration_since(session.disconnected_at) > grace {
            debug!(pid, sid = %session.sid, "session grace window elapsed");
            return Err(RecoveryError::SessionUnknown);
        }

        // The offset must still be inside the retention window, or missed
        // records may already be capped away.
        if let Some(oldest) = self.store.oldest_id().await?
            && offset < oldest
        {
            debug!(pid, %offset, %oldest, "offset fell out of the retention window");
            return Err(RecoveryError::OffsetInvalid);
        }

        // Re-join before replay so replayed packets land against the
        // correct membership.  The session does not go live yet: live
        // broadcasts for this socket are withheld until the replay cursor
        // drains, so the replayed sequence stays complete and in order.
        self.host.add_all(&session.sid, &session.rooms);
        let membership: BTreeSet<String> = session.rooms.iter().cloned().collect();
        self.sessions.begin_restore(&session.sid).await;

        let mut cursor = match self.store.broadcasts_after(&self.nsp, offset).await {
            Ok(cursor) => cursor,
            Err(err) => {
                self.abandon_restore(session, offset).await;
                return Err(RecoveryError::Store(err));
            }
        };
        let mut last = offset;
        let mut replayed = 0u64;
        while let Some(item) = cursor.next().await {
            let doc = match item {
                Ok(doc) => doc,
                Err(err) => {
                    self.abandon_restore(session, last).await;
                    return Err(RecoveryError::Store(err));
                }
            };
            let record = match relay_protocol::decode(doc) {
                Ok(record) => record,
                Err(err) => {
                    warn!(error = %err, "skipping undecodable record during replay");
                    continue;
                }
            };
            let (Some(id), RecordBody::Broadcast(data)) = (record.id, record.body) else {
                continue;
            };
            if id <= last || !delivery::matches_membership(&data.opts, &membership) {
                continue;
            }
            if let Err(err) = self
                .host
                .send(&session.sid, &data.packet, &data.opts.flags, Some(id))
            {
                warn!(sid = %session.sid, error = %err, "replay transmit failed");
                self.abandon_restore(session, last).await;
                return Err(RecoveryError::ReplayInterrupted(err.to_string()));
            }
            last = id;
            replayed += 1;
        }

        // Deliver whatever arrived while the cursor was draining, then go
        // live.  An empty drain flips the session live atomically, so no
        // record can slip between the withheld buffer and normal delivery.
        loop {
            let held = self
                .sessions
                .finish_restore(&session.sid, &session.pid, Some(last))
                .await;
            if held.is_empty() {
                break;
            }
            for broadcast in held {
                // The replay cursor may have covered the head of the buffer.
                if broadcast.offset.is_some_and(|id| id <= last) {
                    continue;
                }
                if let Err(err) = self.host.send(
                    &session.sid,
                    &broadcast.packet,
                    &broadcast.flags,
                    broadcast.offset,
                ) {
                    warn!(sid = %session.sid, error = %err, "post-replay transmit failed");
                    self.abandon_restore(session, last).await;
                    return Err(RecoveryError::ReplayInterrupted(err.to_string()));
                }
                if let Some(id) = broadcast.offset {
                    last = id;
                }
            }
        }

        session.last_offset = last;
        info!(sid = %session.sid, pid, replayed, offset = %last, "session restored");
        Ok(session)
    }

    /// Roll a half-restored session back to RECOVERABLE.  Keeps the
    /// original disconnect time (the grace window does not restart) and the
    /// furthest offset actually transmitted; withheld records with an
    /// offset are still in the collection and replay on the next reconnect.
    async fn abandon_restore(&self, mut session: SessionRecord, last: StreamId) {
        self.sessions.cancel_restore(&session.sid).await;
        session.last_offset = last;
        self.sessions.restash_recoverable(session).await;
    }

    async fn lookup_session_row(&self, pid: &str) -> Result<Option<SessionRecord>, RecoveryError> {
        let Some(doc) = self.store.find_session(pid).await? else {
            return Ok(None);
        };
        match relay_protocol::decode(doc) {
            Ok(EventRecord {
                body: RecordBody::Session(session),
                ..
            }) if session.nsp == self.nsp => Ok(Some(session)),
            Ok(_) => {
                warn!(pid, "session lookup returned a foreign row");
                Ok(None)
            }
            Err(err) => {
                warn!(pid, error = %err, "undecodable session row");
                Ok(None)
            }
        }
    }
}

/// Gather up to `expected` acks, stopping at the deadline or when the host
/// drops its senders.
async fn collect_acks(
    mut rx: mpsc::UnboundedReceiver<Value>,
    expected: u64,
    deadline: Duration,
) -> Vec<Value> {
    let mut acks = Vec::new();
    if expected == 0 {
        return acks;
    }
    let timeout = tokio::time::sleep(deadline);
    tokio::pin!(timeout);
    while (acks.len() as u64) < expected {
        tokio::select! {
            _ = &mut timeout => {
                debug!(collected = acks.len(), expected, "ack collection deadline expired");
                break;
            }
            ack = rx.recv() => match ack {
                Some(value) => acks.push(value),
                None => break,
            },
        }
    }
    acks
}

/// Periodic heartbeat: announce presence, prune silent peers, and expire
/// recoverable sessions past their grace window.
async fn heartbeat_loop(adapter: RelayAdapter, mut shutdown: watch::Receiver<bool>) {
    let interval = adapter.cfg.heartbeat_interval;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
            _ = ticker.tick() => {
                if let Err(err) = adapter.publisher.publish_heartbeat().await {
                    warn!(error = %err, "heartbeat publish failed");
                }
                let dead = adapter.rpc.prune_dead().await;
                if !dead.is_empty() {
                    info!(?dead, "peers pruned after heartbeat silence");
                }
                let grace = chrono::Duration::from_std(adapter.cfg.max_disconnection_duration)
                    .unwrap_or_else(|_| chrono::Duration::days(365));
                let expired = adapter
                    .sessions
                    .expire_disconnected_before(Utc::now() - grace)
                    .await;
                if expired > 0 {
                    debug!(expired, "recoverable sessions expired");
                }
            }
        }
    }
}
