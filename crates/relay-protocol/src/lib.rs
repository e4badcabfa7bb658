// relay-protocol: Event-collection record types and serialization.
//
// Every record in the shared capped collection is a self-describing JSON
// document discriminated by a top-level `type` field, with the kind-specific
// payload nested under `data`.  Wire field names are camelCase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Stream offsets
// ---------------------------------------------------------------------------

/// A monotone record id assigned by the store at append time.
///
/// Offsets are totally ordered across all writers and double as resume
/// cursors: tailing restarts after one, and session recovery replays every
/// broadcast past one.  Clients carry offsets as decimal strings.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct StreamId(pub u64);

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for StreamId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>().map(StreamId)
    }
}

// ---------------------------------------------------------------------------
// Broadcast routing
// ---------------------------------------------------------------------------

/// Delivery flags forwarded to the host framework's send primitive.
///
/// `local` additionally suppresses the store append entirely: the packet is
/// applied to local sockets only and never reaches other instances.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastFlags {
    #[serde(default, skip_serializing_if = "is_false")]
    pub local: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub broadcast: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub volatile: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub compress: bool,
}

impl BroadcastFlags {
    pub fn is_empty(&self) -> bool {
        !(self.local || self.broadcast || self.volatile || self.compress)
    }
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// Routing for one broadcast: target rooms, excluded rooms, and flags.
///
/// An empty `rooms` list targets every socket in the namespace.  A socket id
/// is itself a room name, so single-socket targeting is `rooms = [sid]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastOptions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rooms: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub except: Vec<String>,
    #[serde(default, skip_serializing_if = "BroadcastFlags::is_empty")]
    pub flags: BroadcastFlags,
}

impl BroadcastOptions {
    /// Target the named rooms with no exclusions and default flags.
    pub fn to_rooms<I, S>(rooms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut opts = BroadcastOptions {
            rooms: rooms.into_iter().map(Into::into).collect(),
            ..Default::default()
        };
        opts.normalize();
        opts
    }

    /// Sort and deduplicate the room lists so equality checks and diffing
    /// are deterministic regardless of caller ordering.
    pub fn normalize(&mut self) {
        self.rooms.sort_unstable();
        self.rooms.dedup();
        self.except.sort_unstable();
        self.except.dedup();
    }
}

/// A socket-selection filter for targeted operations (no flags).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetOptions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rooms: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub except: Vec<String>,
}

impl TargetOptions {
    /// Filter matching exactly one socket (a sid is a room).
    pub fn single(sid: &str) -> Self {
        TargetOptions {
            rooms: vec![sid.to_owned()],
            except: vec![],
        }
    }

    pub fn normalize(&mut self) {
        self.rooms.sort_unstable();
        self.rooms.dedup();
        self.except.sort_unstable();
        self.except.dedup();
    }
}

// ---------------------------------------------------------------------------
// Record bodies
// ---------------------------------------------------------------------------

/// Payload of a `broadcast` record.  The packet is an opaque, already-encoded
/// document owned by the host framework and is preserved losslessly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastData {
    pub packet: Value,
    #[serde(default)]
    pub opts: BroadcastOptions,
}

/// One RPC request, correlated to its responses by `requestId`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(flatten)]
    pub op: RequestOp,
}

/// The closed set of cluster operations carried by `request` records.
///
/// Join/leave/disconnect carry a target filter plus rooms; the single-socket
/// forms are the `opts.rooms = [sid]` special case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "requestType", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestOp {
    /// Enumerate matching socket ids on each peer.
    Sockets { opts: TargetOptions },
    /// Union of room names across the cluster.
    AllRooms,
    /// Join every matching socket to `rooms`.
    RemoteJoin { opts: TargetOptions, rooms: Vec<String> },
    /// Remove every matching socket from `rooms`.
    RemoteLeave { opts: TargetOptions, rooms: Vec<String> },
    /// Disconnect every matching socket.
    RemoteDisconnect { opts: TargetOptions, close: bool },
    /// Serialized views of matching sockets.
    RemoteFetch { opts: TargetOptions },
    /// Namespace-level emit expecting one response per peer.
    ServerSideEmit { args: Vec<Value> },
    /// Broadcast expecting client acks, aggregated per peer.
    BroadcastWithAck {
        packet: Value,
        #[serde(default)]
        opts: BroadcastOptions,
    },
}

impl RequestOp {
    /// Wire name of the operation, for logging and diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            RequestOp::Sockets { .. } => "SOCKETS",
            RequestOp::AllRooms => "ALL_ROOMS",
            RequestOp::RemoteJoin { .. } => "REMOTE_JOIN",
            RequestOp::RemoteLeave { .. } => "REMOTE_LEAVE",
            RequestOp::RemoteDisconnect { .. } => "REMOTE_DISCONNECT",
            RequestOp::RemoteFetch { .. } => "REMOTE_FETCH",
            RequestOp::ServerSideEmit { .. } => "SERVER_SIDE_EMIT",
            RequestOp::BroadcastWithAck { .. } => "BROADCAST_WITH_ACK",
        }
    }
}

/// One peer's answer to a request.  The shape of `data` depends on the
/// operation; the originator knows it from its pending-request table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(default)]
    pub data: Value,
}

/// One peer's aggregated client acks for a broadcast-with-ack request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckFrame {
    pub request_id: String,
    /// How many local clients the packet was delivered to on that peer.
    pub client_count: u64,
    #[serde(default)]
    pub acks: Vec<Value>,
}

/// Payload of a `server-side-emit` record: delivered to namespace-level
/// listeners on other instances, never to client sockets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSideEmitData {
    pub args: Vec<Value>,
}

/// A recoverable client session, persisted so a reconnecting client can be
/// re-attached to its rooms and replayed its missed broadcasts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// Session id from the host framework; survives recovery unchanged.
    pub sid: String,
    /// Private id: the opaque credential the client presents to reclaim
    /// this session.
    pub pid: String,
    pub nsp: String,
    /// Room membership at disconnect time, including the sid's own room.
    pub rooms: Vec<String>,
    /// Highest offset successfully transmitted to this session.
    pub last_offset: StreamId,
    pub disconnected_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Top-level record
// ---------------------------------------------------------------------------

/// Discriminated record body.
///
/// `heartbeat` records are presence beacons riding the same stream so that
/// ordering and retention behave identically to data records; `session` rows
/// are storage for recovery lookup and are never dispatched by listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum RecordBody {
    Broadcast(BroadcastData),
    Request(RequestFrame),
    Response(ResponseFrame),
    Ack(AckFrame),
    ServerSideEmit(ServerSideEmitData),
    Heartbeat,
    Session(SessionRecord),
}

impl RecordBody {
    pub fn kind(&self) -> &'static str {
        match self {
            RecordBody::Broadcast(_) => "broadcast",
            RecordBody::Request(_) => "request",
            RecordBody::Response(_) => "response",
            RecordBody::Ack(_) => "ack",
            RecordBody::ServerSideEmit(_) => "server-side-emit",
            RecordBody::Heartbeat => "heartbeat",
            RecordBody::Session(_) => "session",
        }
    }
}

/// One row in the capped event collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Assigned by the store at append; present on every record read back.
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<StreamId>,
    /// Wall-clock insert time, written only when the deployment prunes by
    /// TTL rather than by cap size.
    #[serde(rename = "createdAt", default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    pub nsp: String,
    /// Originating instance id.  Listeners never dispatch their own records.
    pub uid: String,
    #[serde(flatten)]
    pub body: RecordBody,
}

impl EventRecord {
    pub fn new(nsp: impl Into<String>, uid: impl Into<String>, body: RecordBody) -> Self {
        EventRecord {
            id: None,
            created_at: None,
            nsp: nsp.into(),
            uid: uid.into(),
            body,
        }
    }
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Decode failure for a stream document.
#[derive(Debug)]
pub enum CodecError {
    /// Unknown `type`, missing required fields, or a type mismatch.
    Malformed(String),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::Malformed(s) => write!(f, "malformed record: {}", s),
        }
    }
}

impl std::error::Error for CodecError {}

/// Serialize a record to the document form the store persists.
pub fn encode(record: &EventRecord) -> Result<Value, CodecError> {
    serde_json::to_value(record).map_err(|e| CodecError::Malformed(e.to_string()))
}

/// Deserialize a stream document.  Unknown kinds and missing fields fail
/// with [`CodecError::Malformed`]; readers skip such records and continue.
pub fn decode(doc: Value) -> Result<EventRecord, CodecError> {
    serde_json::from_value(doc).map_err(|e| CodecError::Malformed(e.to_string()))
}
