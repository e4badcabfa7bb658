//! Local delivery: applying a broadcast to this instance's matching sockets.
//!
//! Candidate resolution happens against the host's room registry; a failed
//! send affects only that socket.  When the broadcast carries a stream
//! offset, each successful transmit advances the receiving session's replay
//! cursor.

use crate::host::Host;
use crate::recovery::SessionRegistry;
use relay_protocol::{BroadcastOptions, StreamId};
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::{trace, warn};

/// Socket ids in the union of `rooms` (all sockets when empty), minus any
/// socket in an `except` room.
pub(crate) fn select_targets(
    host: &dyn Host,
    rooms: &[String],
    except: &[String],
) -> BTreeSet<String> {
    let mut targets = host.sockets(rooms);
    if !except.is_empty() {
        let excluded = host.sockets(except);
        targets.retain(|sid| !excluded.contains(sid));
    }
    targets
}

/// Whether a broadcast routed `(rooms, except)` reaches a socket with the
/// given room membership.  Used during replay, where membership comes from
/// the recorded session rather than the live registry.
pub(crate) fn matches_membership(opts: &BroadcastOptions, membership: &BTreeSet<String>) -> bool {
    let targeted = opts.rooms.is_empty() || opts.rooms.iter().any(|room| membership.contains(room));
    let excluded = opts.except.iter().any(|room| membership.contains(room));
    targeted && !excluded
}

/// Send `packet` to every matching local socket.  Returns the number of
/// sockets the packet was handed to.
pub(crate) async fn apply_broadcast(
    host: &dyn Host,
    sessions: &SessionRegistry,
    packet: &Value,
    opts: &BroadcastOptions,
    offset: Option<StreamId>,
) -> u64 {
    let targets = select_targets(host, &opts.rooms, &opts.except);
    let mut delivered = 0;
    for sid in targets {
        // A socket mid-restore gets live traffic only after its replay
        // cursor drains, so the replayed sequence stays complete and
        // ordered.
        if sessions
            .hold_if_restoring(&sid, packet, &opts.flags, offset)
            .await
        {
            continue;
        }
        // A session replayed past this offset already has the packet.
        if let Some(offset) = offset
            && sessions.already_delivered(&sid, offset).await
        {
            continue;
        }
        match host.send(&sid, packet, &opts.flags, offset) {
            Ok(()) => {
                delivered += 1;
                if let Some(offset) = offset {
                    sessions.advance_offset(&sid, offset).await;
                }
            }
            Err(err) => {
                // One dead transport must not starve the rest.
                warn!(sid = %sid, error = %err, "dropping packet for socket");
            }
        }
    }
    trace!(
        delivered,
        rooms = opts.rooms.len(),
        except = opts.except.len(),
        "broadcast applied locally"
    );
    delivered
}
