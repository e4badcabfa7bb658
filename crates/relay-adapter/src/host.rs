//! Host-framework seam.
//!
//! The socket framework hosting the adapter owns the sockets, the room
//! registry, and the per-connection transport.  The adapter drives it
//! through this trait: room mutation, local enumeration, and the send
//! primitive.  All methods are synchronous and non-blocking; transports
//! that apply backpressure queue internally.

use relay_protocol::{BroadcastFlags, BroadcastOptions, StreamId, TargetOptions};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// A per-socket send failure (e.g. closed transport).  Delivery swallows
/// these and continues with the remaining sockets.
#[derive(Debug)]
pub struct DeliveryError(pub String);

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "delivery failed: {}", self.0)
    }
}

impl std::error::Error for DeliveryError {}

/// Serialized view of one socket, as returned by fetch operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocketView {
    pub id: String,
    pub rooms: Vec<String>,
    /// Handshake/application data attached by the host.
    #[serde(default)]
    pub data: Value,
}

/// Sink for client acks collected during a broadcast-with-ack.  The host
/// sends each ack as it arrives and drops its senders when no more can come.
pub type AckSink = tokio::sync::mpsc::UnboundedSender<Value>;

/// Contract the hosting socket framework implements for one namespace.
pub trait Host: Send + Sync {
    /// Join a socket to each of `rooms` (creating rooms as needed).
    fn add_all(&self, sid: &str, rooms: &[String]);

    /// Remove a socket from one room.
    fn del(&self, sid: &str, room: &str);

    /// Remove a socket from every room.
    fn del_all(&self, sid: &str);

    /// Socket ids in the union of `rooms`; every socket in the namespace
    /// when `rooms` is empty.
    fn sockets(&self, rooms: &[String]) -> BTreeSet<String>;

    /// Rooms a socket is a member of, or `None` for an unknown socket.
    fn socket_rooms(&self, sid: &str) -> Option<BTreeSet<String>>;

    /// Every room name with at least one member.
    fn rooms(&self) -> BTreeSet<String>;

    /// Serialized views of sockets matching the filter.
    fn fetch_sockets(&self, opts: &TargetOptions) -> Vec<SocketView>;

    /// Hand one packet to a socket's transport.  `offset` is the stream id
    /// the packet was published under, when it has one, so the client can
    /// track its replay cursor.
    fn send(
        &self,
        sid: &str,
        packet: &Value,
        flags: &BroadcastFlags,
        offset: Option<StreamId>,
    ) -> Result<(), DeliveryError>;

    /// Disconnect a socket.  Returns whether the socket existed.
    fn disconnect(&self, sid: &str, close: bool) -> bool;

    /// Deliver a server-side emit to the namespace-level listeners.  A
    /// listener may produce an immediate reply value, which is sent back to
    /// the originating instance when the emit expects acknowledgements.
    fn server_side_emit(&self, args: &[Value]) -> Option<Value>;

    /// Send `packet` to every socket matching `opts`, streaming each client
    /// ack into `acks`.  Returns the number of sockets targeted.
    fn broadcast_with_ack(&self, packet: &Value, opts: &BroadcastOptions, acks: AckSink) -> u64;
}
