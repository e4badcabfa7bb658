//! Session registry for connection-state recovery.
//!
//! A session is LIVE while its socket is connected, RECOVERABLE between an
//! abrupt disconnect and either a successful restore or grace expiry, and
//! gone otherwise.  The registry owns the in-memory side of that state
//! machine; the restore pipeline itself (lookup, offset validation, room
//! re-join, replay) lives on the adapter, which also consults the shared
//! collection when session rows are persisted there.

use crate::store::StoreError;
use chrono::{DateTime, Utc};
use relay_protocol::{BroadcastFlags, SessionRecord, StreamId};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

/// Recovery refusal or failure.
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    /// No session for the presented private id (never existed, expired, or
    /// held by an unreachable instance).  The client proceeds as a fresh
    /// connection.
    #[error("unknown session")]
    SessionUnknown,
    /// The presented offset does not parse as a stream id or is older than
    /// the oldest retained record.
    #[error("invalid offset")]
    OffsetInvalid,
    /// Replay stopped partway through; the session stays recoverable with
    /// its offset at the last delivered record, so a later reconnect
    /// resumes cleanly.
    #[error("replay interrupted: {0}")]
    ReplayInterrupted(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Book-keeping for one connected socket with recovery enabled.
#[derive(Debug, Clone)]
pub(crate) struct LiveSession {
    pub pid: String,
    /// Highest offset successfully transmitted to this socket.
    pub last_offset: Option<StreamId>,
}

/// A broadcast withheld from a socket while its session replay drains.
#[derive(Debug, Clone)]
pub(crate) struct HeldBroadcast {
    pub packet: Value,
    pub flags: BroadcastFlags,
    pub offset: Option<StreamId>,
}

#[derive(Default)]
pub(crate) struct SessionRegistry {
    /// sid → live session.
    live: Mutex<HashMap<String, LiveSession>>,
    /// pid → session snapshot awaiting reconnection.
    recoverable: Mutex<HashMap<String, SessionRecord>>,
    /// sid → broadcasts withheld while the session's replay is in flight.
    restoring: Mutex<HashMap<String, Vec<HeldBroadcast>>>,
}

impl SessionRegistry {
    /// Track a newly connected (or restored) socket.
    pub(crate) async fn register_live(&self, sid: &str, pid: &str, last_offset: Option<StreamId>) {
        self.live.lock().await.insert(
            sid.to_owned(),
            LiveSession {
                pid: pid.to_owned(),
                last_offset,
            },
        );
    }

    /// Advance a live session's offset after a successful transmit.
    /// Offsets only move forward; replayed duplicates never rewind one.
    pub(crate) async fn advance_offset(&self, sid: &str, offset: StreamId) {
        if let Some(session) = self.live.lock().await.get_mut(sid)
            && session.last_offset.is_none_or(|current| offset > current)
        {
            session.last_offset = Some(offset);
        }
    }

    /// Whether this offset was already transmitted to the session.  Guards
    /// against double delivery when a replay and the live dispatch loop
    /// cover the same record.
    pub(crate) async fn already_delivered(&self, sid: &str, offset: StreamId) -> bool {
        self.live
            .lock()
            .await
            .get(sid)
            .is_some_and(|session| session.last_offset.is_some_and(|last| last >= offset))
    }

    #[cfg(test)]
    pub(crate) async fn live_offset(&self, sid: &str) -> Option<Option<StreamId>> {
        self.live
            .lock()
            .await
            .get(sid)
            .map(|session| session.last_offset)
    }

    /// Mark a socket as mid-restore.  Live broadcasts for it are withheld
    /// until a [`SessionRegistry::finish_restore`] drain comes back empty,
    /// so the replay cursor delivers a complete, ordered prefix first.
    pub(crate) async fn begin_restore(&self, sid: &str) {
        self.restoring
            .lock()
            .await
            .insert(sid.to_owned(), Vec::new());
    }

    /// Withhold a live broadcast from a mid-restore socket.  Returns false
    /// when the socket is not restoring.
    pub(crate) async fn hold_if_restoring(
        &self,
        sid: &str,
        packet: &Value,
        flags: &BroadcastFlags,
        offset: Option<StreamId>,
    ) -> bool {
        let mut restoring = self.restoring.lock().await;
        let Some(held) = restoring.get_mut(sid) else {
            return false;
        };
        held.push(HeldBroadcast {
            packet: packet.clone(),
            flags: flags.clone(),
            offset,
        });
        true
    }

    /// Hand back the broadcasts withheld so far, or, when nothing is left,
    /// atomically end the restoring state and register the session live.
    /// Callers deliver the returned batch and ask again; an empty return
    /// means the session is live and no record can slip between the buffer
    /// and normal delivery.
    pub(crate) async fn finish_restore(
        &self,
        sid: &str,
        pid: &str,
        last_offset: Option<StreamId>,
    ) -> Vec<HeldBroadcast> {
        let mut restoring = self.restoring.lock().await;
        match restoring.get_mut(sid) {
            Some(held) if !held.is_empty() => std::mem::take(held),
            _ => {
                restoring.remove(sid);
                self.live.lock().await.insert(
                    sid.to_owned(),
                    LiveSession {
                        pid: pid.to_owned(),
                        last_offset,
                    },
                );
                Vec::new()
            }
        }
    }

    /// Abort a restore, discarding anything withheld.  Held records with an
    /// offset are still in the collection and replay on the next reconnect.
    pub(crate) async fn cancel_restore(&self, sid: &str) {
        self.restoring.lock().await.remove(sid);
    }

    /// Remove and return the live entry (abrupt disconnect path).
    pub(crate) async fn take_live(&self, sid: &str) -> Option<LiveSession> {
        self.live.lock().await.remove(sid)
    }

    /// Remove the live entry without keeping anything (clean disconnect).
    pub(crate) async fn drop_live(&self, sid: &str) {
        self.live.lock().await.remove(sid);
    }

    pub(crate) async fn add_recoverable(&self, record: SessionRecord) {
        self.recoverable
            .lock()
            .await
            .insert(record.pid.clone(), record);
    }

    /// Claim a recoverable session by private id.
    pub(crate) async fn take_recoverable(&self, pid: &str) -> Option<SessionRecord> {
        self.recoverable.lock().await.remove(pid)
    }

    /// Put a claimed session back (interrupted replay).
    pub(crate) async fn restash_recoverable(&self, record: SessionRecord) {
        self.recoverable
            .lock()
            .await
            .insert(record.pid.clone(), record);
    }

    /// Destroy recoverable sessions whose grace window ended before
    /// `cutoff`.  Returns how many were discarded.
    pub(crate) async fn expire_disconnected_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut recoverable = self.recoverable.lock().await;
        let before = recoverable.len();
        recoverable.retain(|pid, record| {
            let keep = record.disconnected_at >= cutoff;
            if !keep {
                debug!(pid = %pid, sid = %record.sid, "session grace window elapsed, discarding");
            }
            keep
        });
        before - recoverable.len()
    }
}
