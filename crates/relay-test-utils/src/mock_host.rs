//! Mock host framework: an in-memory namespace with sockets, rooms, and a
//! capture log for everything the adapter asks it to do.

use relay_adapter::host::{AckSink, DeliveryError, Host, SocketView};
use relay_protocol::{BroadcastFlags, BroadcastOptions, StreamId, TargetOptions};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Mutex;

/// One packet handed to a socket's transport.
#[derive(Debug, Clone)]
pub struct SentPacket {
    pub packet: Value,
    pub flags: BroadcastFlags,
    pub offset: Option<StreamId>,
}

#[derive(Default)]
struct SocketState {
    rooms: BTreeSet<String>,
    data: Value,
}

#[derive(Default)]
struct HostState {
    sockets: BTreeMap<String, SocketState>,
    sent: HashMap<String, Vec<SentPacket>>,
    fail_send: HashSet<String>,
    emit_log: Vec<Vec<Value>>,
    emit_reply: Option<Value>,
    /// sid → value the "client" acks with during broadcast-with-ack.
    ack_replies: HashMap<String, Value>,
    disconnect_log: Vec<(String, bool)>,
}

#[derive(Default)]
pub struct MockHost {
    state: Mutex<HostState>,
}

impl MockHost {
    pub fn new() -> Self {
        MockHost::default()
    }

    /// Create a socket; like a real framework, it joins its own sid room.
    pub fn connect(&self, sid: &str) {
        let mut state = self.state.lock().unwrap();
        let socket = state.sockets.entry(sid.to_owned()).or_default();
        socket.rooms.insert(sid.to_owned());
    }

    pub fn join(&self, sid: &str, rooms: &[String]) {
        self.add_all(sid, rooms);
    }

    pub fn is_connected(&self, sid: &str) -> bool {
        self.state.lock().unwrap().sockets.contains_key(sid)
    }

    pub fn rooms_of(&self, sid: &str) -> Option<BTreeSet<String>> {
        self.socket_rooms(sid)
    }

    pub fn sent_to(&self, sid: &str) -> Vec<SentPacket> {
        self.state
            .lock()
            .unwrap()
            .sent
            .get(sid)
            .cloned()
            .unwrap_or_default()
    }

    /// Make every future send to `sid` fail (dead transport).
    pub fn fail_sends_to(&self, sid: &str) {
        self.state.lock().unwrap().fail_send.insert(sid.to_owned());
    }

    pub fn set_emit_reply(&self, reply: Value) {
        self.state.lock().unwrap().emit_reply = Some(reply);
    }

    pub fn emits(&self) -> Vec<Vec<Value>> {
        self.state.lock().unwrap().emit_log.clone()
    }

    /// Configure the ack a socket's client returns during
    /// broadcast-with-ack.  Sockets without one stay silent.
    pub fn set_ack_reply(&self, sid: &str, reply: Value) {
        self.state
            .lock()
            .unwrap()
            .ack_replies
            .insert(sid.to_owned(), reply);
    }

    pub fn disconnect_log(&self) -> Vec<(String, bool)> {
        self.state.lock().unwrap().disconnect_log.clone()
    }
}

fn select(state: &HostState, rooms: &[String], except: &[String]) -> BTreeSet<String> {
    let mut targets: BTreeSet<String> = if rooms.is_empty() {
        state.sockets.keys().cloned().collect()
    } else {
        state
            .sockets
            .iter()
            .filter(|(_, socket)| rooms.iter().any(|room| socket.rooms.contains(room)))
            .map(|(sid, _)| sid.clone())
            .collect()
    };
    if !except.is_empty() {
        targets.retain(|sid| {
            state.sockets.get(sid).is_none_or(|socket| {
                !except.iter().any(|room| socket.rooms.contains(room))
            })
        });
    }
    targets
}

impl Host for MockHost {
    fn add_all(&self, sid: &str, rooms: &[String]) {
        let mut state = self.state.lock().unwrap();
        let socket = state.sockets.entry(sid.to_owned()).or_default();
        socket.rooms.insert(sid.to_owned());
        for room in rooms {
            socket.rooms.insert(room.clone());
        }
    }

    fn del(&self, sid: &str, room: &str) {
        if let Some(socket) = self.state.lock().unwrap().sockets.get_mut(sid) {
            socket.rooms.remove(room);
        }
    }

    fn del_all(&self, sid: &str) {
        if let Some(socket) = self.state.lock().unwrap().sockets.get_mut(sid) {
            socket.rooms.clear();
        }
    }

    fn sockets(&self, rooms: &[String]) -> BTreeSet<String> {
        select(&self.state.lock().unwrap(), rooms, &[])
    }

    fn socket_rooms(&self, sid: &str) -> Option<BTreeSet<String>> {
        self.state
            .lock()
            .unwrap()
            .sockets
            .get(sid)
            .map(|socket| socket.rooms.clone())
    }

    fn rooms(&self) -> BTreeSet<String> {
        let state = self.state.lock().unwrap();
        state
            .sockets
            .values()
            .flat_map(|socket| socket.rooms.iter().cloned())
            .collect()
    }

    fn fetch_sockets(&self, opts: &TargetOptions) -> Vec<SocketView> {
        let state = self.state.lock().unwrap();
        select(&state, &opts.rooms, &opts.except)
            .into_iter()
            .filter_map(|sid| {
                state.sockets.get(&sid).map(|socket| SocketView {
                    id: sid.clone(),
                    rooms: socket.rooms.iter().cloned().collect(),
                    data: socket.data.clone(),
                })
            })
            .collect()
    }

    fn send(
        &self,
        sid: &str,
        packet: &Value,
        flags: &BroadcastFlags,
        offset: Option<StreamId>,
    ) -> Result<(), DeliveryError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_send.contains(sid) {
            return Err(DeliveryError("transport closed".to_owned()));
        }
        if !state.sockets.contains_key(sid) {
            return Err(DeliveryError(format!("unknown socket {sid}")));
        }
        state.sent.entry(sid.to_owned()).or_default().push(SentPacket {
            packet: packet.clone(),
            flags: flags.clone(),
            offset,
        });
        Ok(())
    }

    fn disconnect(&self, sid: &str, close: bool) -> bool {
        let mut state = self.state.lock().unwrap();
        let existed = state.sockets.remove(sid).is_some();
        if existed {
            state.disconnect_log.push((sid.to_owned(), close));
        }
        existed
    }

    fn server_side_emit(&self, args: &[Value]) -> Option<Value> {
        let mut state = self.state.lock().unwrap();
        state.emit_log.push(args.to_vec());
        state.emit_reply.clone()
    }

    fn broadcast_with_ack(&self, packet: &Value, opts: &BroadcastOptions, acks: AckSink) -> u64 {
        let mut state = self.state.lock().unwrap();
        let targets = select(&state, &opts.rooms, &opts.except);
        for sid in &targets {
            state.sent.entry(sid.clone()).or_default().push(SentPacket {
                packet: packet.clone(),
                flags: opts.flags.clone(),
                offset: None,
            });
            if let Some(reply) = state.ack_replies.get(sid) {
                let _ = acks.send(reply.clone());
            }
        }
        targets.len() as u64
    }
}
