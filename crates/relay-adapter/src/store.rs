//! Datastore seam: the shared capped event collection.
//!
//! The driver behind this trait must provide a capped (or TTL-pruned),
//! append-only collection whose `_id`s are assigned monotonically across all
//! writers, plus a resumable tail cursor.  The store is the sole arbiter of
//! record ordering; everything in the adapter leans on that.

use futures_util::stream::BoxStream;
use relay_protocol::StreamId;
use serde_json::Value;

/// Store failures, split by whether the operation can be retried.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Transient insert/read failure.  Publishers retry a bounded number of
    /// times; the tail listener retries without bound.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The cursor cannot be re-established (e.g. collection dropped).
    /// Surfaced to the host as a fatal stream-gone event.
    #[error("stream gone: {0}")]
    Gone(String),
}

impl StoreError {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StoreError::Gone(_))
    }
}

/// Where a tail cursor begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailStart {
    /// Start `overlap` records before the current end of the stream.  The
    /// overlap papers over ordering skew at the cap boundary; duplicate
    /// dispatch is prevented by the listener's seen-id window.
    Latest { overlap: usize },
    /// Resume strictly after an already-processed id.
    After(StreamId),
}

/// A cursor over stream documents in `_id` order.
pub type DocStream = BoxStream<'static, Result<Value, StoreError>>;

/// The capped event collection.
///
/// Documents cross this boundary in their wire form (`serde_json::Value`);
/// encoding and decoding live in `relay-protocol` so a malformed row written
/// by a foreign writer is a per-record skip, never a cursor failure.
#[async_trait::async_trait]
pub trait EventStream: Send + Sync {
    /// Append one document.  The store assigns and returns its monotone id.
    async fn append(&self, doc: Value) -> Result<StreamId, StoreError>;

    /// Greatest id currently in the collection.
    async fn latest_id(&self) -> Result<Option<StreamId>, StoreError>;

    /// Smallest id still retained (the replay horizon).
    async fn oldest_id(&self) -> Result<Option<StreamId>, StoreError>;

    /// Open a live, resumable cursor.  The stream yields documents in strict
    /// id order and stays open awaiting new appends; transient errors may be
    /// yielded inline and the caller reopens from its last processed id.
    async fn tail(&self, start: TailStart) -> Result<DocStream, StoreError>;

    /// Newest `session` document carrying this private id, if any.
    async fn find_session(&self, pid: &str) -> Result<Option<Value>, StoreError>;

    /// Finite ascending cursor over `broadcast` documents of `nsp` with an
    /// id strictly greater than `after`.
    async fn broadcasts_after(&self, nsp: &str, after: StreamId)
    -> Result<DocStream, StoreError>;
}
