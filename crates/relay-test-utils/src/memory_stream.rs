//! In-memory capped event collection.
//!
//! Behaves like the production store contract: monotone ids assigned under
//! a single lock (so observation order equals id order across all writers),
//! a fixed retention cap, and a live tail that can resume from any id.
//! Sharing one `Arc<MemoryStream>` between several adapters simulates a
//! multi-instance cluster in one process.

use async_stream::stream;
use relay_adapter::store::{DocStream, EventStream, StoreError, TailStart};
use relay_protocol::StreamId;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::broadcast;

struct State {
    next_id: u64,
    records: VecDeque<Value>,
    live: broadcast::Sender<Value>,
}

pub struct MemoryStream {
    state: Mutex<State>,
    capacity: usize,
    /// Remaining appends to fail with a transient error.
    append_failures: AtomicU32,
    /// When set, every operation fails terminally (collection dropped).
    gone: AtomicBool,
}

impl MemoryStream {
    pub fn new(capacity: usize) -> Self {
        let (live, _) = broadcast::channel(1024);
        MemoryStream {
            state: Mutex::new(State {
                next_id: 1,
                records: VecDeque::new(),
                live,
            }),
            capacity,
            append_failures: AtomicU32::new(0),
            gone: AtomicBool::new(false),
        }
    }

    pub fn shared(capacity: usize) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::new(capacity))
    }

    /// Snapshot of the retained documents, oldest first.
    pub fn documents(&self) -> Vec<Value> {
        self.state.lock().unwrap().records.iter().cloned().collect()
    }

    /// Make the next `n` appends fail with a transient error.
    pub fn fail_next_appends(&self, n: u32) {
        self.append_failures.store(n, Ordering::SeqCst);
    }

    /// Simulate the collection disappearing: every operation from now on
    /// fails terminally, and open tails are severed so readers notice.
    pub fn set_gone(&self) {
        self.gone.store(true, Ordering::SeqCst);
        let (replacement, _) = broadcast::channel(1);
        // Dropping the old sender closes every subscribed tail.
        self.state.lock().unwrap().live = replacement;
    }

    fn check_gone(&self) -> Result<(), StoreError> {
        if self.gone.load(Ordering::SeqCst) {
            Err(StoreError::Gone("collection dropped".to_owned()))
        } else {
            Ok(())
        }
    }
}

fn doc_id(doc: &Value) -> Option<u64> {
    doc.get("_id").and_then(Value::as_u64)
}

#[async_trait::async_trait]
impl EventStream for MemoryStream {
    async fn append(&self, mut doc: Value) -> Result<StreamId, StoreError> {
        self.check_gone()?;
        if self
            .append_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Unavailable("injected append failure".to_owned()));
        }
        let Some(fields) = doc.as_object_mut() else {
            return Err(StoreError::Unavailable(
                "document must be an object".to_owned(),
            ));
        };

        // Id assignment, retention, and live publication happen under one
        // lock so every observer sees strict id order.
        let mut state = self.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        fields.insert("_id".to_owned(), json!(id));
        state.records.push_back(doc.clone());
        while state.records.len() > self.capacity {
            state.records.pop_front();
        }
        let _ = state.live.send(doc);
        Ok(StreamId(id))
    }

    async fn latest_id(&self) -> Result<Option<StreamId>, StoreError> {
        self.check_gone()?;
        let state = self.state.lock().unwrap();
        Ok(state.records.back().and_then(doc_id).map(StreamId))
    }

    async fn oldest_id(&self) -> Result<Option<StreamId>, StoreError> {
        self.check_gone()?;
        let state = self.state.lock().unwrap();
        Ok(state.records.front().and_then(doc_id).map(StreamId))
    }

    async fn tail(&self, start: TailStart) -> Result<DocStream, StoreError> {
        self.check_gone()?;
        // Snapshot the backlog and subscribe under the same lock, so a
        // concurrent append lands in exactly one of the two.
        let (backlog, mut rx) = {
            let state = self.state.lock().unwrap();
            let backlog: Vec<Value> = match start {
                TailStart::Latest { overlap } => {
                    let skip = state.records.len().saturating_sub(overlap);
                    state.records.iter().skip(skip).cloned().collect()
                }
                TailStart::After(after) => state
                    .records
                    .iter()
                    .filter(|doc| doc_id(doc).is_some_and(|id| id > after.0))
                    .cloned()
                    .collect(),
            };
            (backlog, state.live.subscribe())
        };

        let stream = stream! {
            for doc in backlog {
                yield Ok(doc);
            }
            loop {
                match rx.recv().await {
                    Ok(doc) => yield Ok(doc),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        yield Err(StoreError::Unavailable(format!("tail lagged by {n} records")));
                        return;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn find_session(&self, pid: &str) -> Result<Option<Value>, StoreError> {
        self.check_gone()?;
        let state = self.state.lock().unwrap();
        Ok(state
            .records
            .iter()
            .rev()
            .find(|doc| {
                doc.get("type").and_then(Value::as_str) == Some("session")
                    && doc
                        .get("data")
                        .and_then(|data| data.get("pid"))
                        .and_then(Value::as_str)
                        == Some(pid)
            })
            .cloned())
    }

    async fn broadcasts_after(
        &self,
        nsp: &str,
        after: StreamId,
    ) -> Result<DocStream, StoreError> {
        self.check_gone()?;
        let matching: Vec<Result<Value, StoreError>> = {
            let state = self.state.lock().unwrap();
            state
                .records
                .iter()
                .filter(|doc| {
                    doc_id(doc).is_some_and(|id| id > after.0)
                        && doc.get("type").and_then(Value::as_str) == Some("broadcast")
                        && doc.get("nsp").and_then(Value::as_str) == Some(nsp)
                })
                .cloned()
                .map(Ok)
                .collect()
        };
        Ok(Box::pin(futures_util::stream::iter(matching)))
    }
}
