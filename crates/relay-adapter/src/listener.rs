//! Stream listener: one resumable tail cursor per adapter.
//!
//! The cursor starts a little before the current end of the stream (overlap
//! margin) and the seen-id window swallows the duplicates that re-read
//! produces.  Transient cursor failures reopen from the last processed id
//! with bounded exponential backoff, forever; only an unrecoverable store
//! error stops the loop, surfaced as a stream-gone event.  Records are
//! dispatched strictly in id order.

use crate::adapter::RelayAdapter;
use crate::store::TailStart;
use futures_util::StreamExt;
use relay_protocol::StreamId;
use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Bounded window of recently dispatched ids.
pub(crate) struct SeenWindow {
    capacity: usize,
    order: VecDeque<StreamId>,
    members: HashSet<StreamId>,
}

impl SeenWindow {
    pub(crate) fn new(capacity: usize) -> Self {
        SeenWindow {
            capacity,
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
        }
    }

    /// Record an id; returns false when it was already in the window.
    pub(crate) fn insert(&mut self, id: StreamId) -> bool {
        if !self.members.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
        true
    }
}

/// Exponential backoff between a floor and a ceiling.
pub(crate) struct Backoff {
    floor: Duration,
    ceiling: Duration,
    next: Duration,
}

impl Backoff {
    pub(crate) fn new(floor: Duration, ceiling: Duration) -> Self {
        Backoff {
            floor,
            ceiling,
            next: floor,
        }
    }

    pub(crate) fn delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (delay * 2).min(self.ceiling);
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.next = self.floor;
    }
}

/// Tail the collection until shutdown or an unrecoverable store error.
pub(crate) async fn run(adapter: RelayAdapter, mut shutdown: watch::Receiver<bool>) {
    let mut start = TailStart::Latest {
        overlap: adapter.config().startup_overlap,
    };
    let mut seen = SeenWindow::new(512);
    let mut backoff = Backoff::new(Duration::from_millis(250), Duration::from_secs(8));

    'reopen: loop {
        if *shutdown.borrow() {
            return;
        }
        let mut cursor = match adapter.store().tail(start).await {
            Ok(cursor) => cursor,
            Err(err) if err.is_terminal() => {
                adapter.emit_stream_gone(&err);
                return;
            }
            Err(err) => {
                let delay = backoff.delay();
                warn!(error = %err, delay_ms = delay.as_millis() as u64, "tail cursor open failed, retrying");
                if wait_or_shutdown(&mut shutdown, delay).await {
                    return;
                }
                continue;
            }
        };

        loop {
            let item = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                    continue;
                }
                item = cursor.next() => item,
            };
            match item {
                None => {
                    let delay = backoff.delay();
                    debug!(delay_ms = delay.as_millis() as u64, "tail cursor ended, reopening");
                    if wait_or_shutdown(&mut shutdown, delay).await {
                        return;
                    }
                    continue 'reopen;
                }
                Some(Err(err)) if err.is_terminal() => {
                    adapter.emit_stream_gone(&err);
                    return;
                }
                Some(Err(err)) => {
                    let delay = backoff.delay();
                    warn!(error = %err, delay_ms = delay.as_millis() as u64, "tail cursor failed, reopening");
                    if wait_or_shutdown(&mut shutdown, delay).await {
                        return;
                    }
                    continue 'reopen;
                }
                Some(Ok(doc)) => {
                    backoff.reset();
                    match relay_protocol::decode(doc) {
                        Err(err) => {
                            // Foreign writers may run newer schemas; skip and move on.
                            warn!(error = %err, "skipping undecodable stream record");
                        }
                        Ok(record) => {
                            let Some(id) = record.id else {
                                warn!(kind = record.body.kind(), "skipping record with no id");
                                continue;
                            };
                            start = TailStart::After(id);
                            if !seen.insert(id) {
                                continue;
                            }
                            adapter.dispatch(record).await;
                        }
                    }
                }
            }
        }
    }
}

async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        biased;
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
        _ = tokio::time::sleep(delay) => false,
    }
}
