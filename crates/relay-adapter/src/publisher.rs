//! Record publisher: every append into the shared collection goes through
//! here.
//!
//! Appends are best-effort with bounded retries; fan-out to other instances
//! is never awaited (they pick the record up from their own tail cursors).
//! The assigned id is returned to the caller so locally delivered copies can
//! stamp session offsets.

use crate::config::AdapterConfig;
use crate::store::{EventStream, StoreError};
use relay_protocol::{
    AckFrame, BroadcastData, BroadcastOptions, CodecError, EventRecord, RecordBody, RequestFrame,
    ResponseFrame, ServerSideEmitData, SessionRecord, StreamId,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// A record could not be written to the stream.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("publish failed after {attempts} attempt(s): {source}")]
    Failed {
        attempts: u32,
        #[source]
        source: StoreError,
    },
    #[error(transparent)]
    Encode(#[from] CodecError),
}

pub(crate) struct Publisher {
    store: Arc<dyn EventStream>,
    nsp: String,
    uid: String,
    add_created_at: bool,
    attempts: u32,
}

impl Publisher {
    pub(crate) fn new(store: Arc<dyn EventStream>, nsp: &str, uid: &str, cfg: &AdapterConfig) -> Self {
        Publisher {
            store,
            nsp: nsp.to_owned(),
            uid: uid.to_owned(),
            add_created_at: cfg.add_created_at_field,
            attempts: cfg.publish_attempts,
        }
    }

    /// Insert one broadcast record and return its assigned id.
    ///
    /// Callers handle `flags.local` themselves (a local broadcast never
    /// reaches the store).
    pub(crate) async fn publish_broadcast(
        &self,
        packet: &Value,
        opts: &BroadcastOptions,
    ) -> Result<StreamId, PublishError> {
        self.append(RecordBody::Broadcast(BroadcastData {
            packet: packet.clone(),
            opts: opts.clone(),
        }))
        .await
    }

    pub(crate) async fn publish_request(&self, frame: &RequestFrame) -> Result<StreamId, PublishError> {
        self.append(RecordBody::Request(frame.clone())).await
    }

    pub(crate) async fn publish_response(
        &self,
        request_id: &str,
        data: Value,
    ) -> Result<StreamId, PublishError> {
        self.append(RecordBody::Response(ResponseFrame {
            request_id: request_id.to_owned(),
            data,
        }))
        .await
    }

    pub(crate) async fn publish_ack(
        &self,
        request_id: &str,
        client_count: u64,
        acks: Vec<Value>,
    ) -> Result<StreamId, PublishError> {
        self.append(RecordBody::Ack(AckFrame {
            request_id: request_id.to_owned(),
            client_count,
            acks,
        }))
        .await
    }

    pub(crate) async fn publish_server_side_emit(
        &self,
        args: Vec<Value>,
    ) -> Result<StreamId, PublishError> {
        self.append(RecordBody::ServerSideEmit(ServerSideEmitData { args }))
            .await
    }

    pub(crate) async fn publish_heartbeat(&self) -> Result<StreamId, PublishError> {
        self.append(RecordBody::Heartbeat).await
    }

    pub(crate) async fn persist_session_row(
        &self,
        session: &SessionRecord,
    ) -> Result<StreamId, PublishError> {
        self.append(RecordBody::Session(session.clone())).await
    }

    async fn append(&self, body: RecordBody) -> Result<StreamId, PublishError> {
        let mut record = EventRecord::new(&self.nsp, &self.uid, body);
        if self.add_created_at {
            record.created_at = Some(chrono::Utc::now());
        }
        let doc = relay_protocol::encode(&record)?;

        let mut delay = Duration::from_millis(50);
        let mut last_err = StoreError::Unavailable("append not attempted".to_owned());
        for attempt in 1..=self.attempts {
            match self.store.append(doc.clone()).await {
                Ok(id) => return Ok(id),
                Err(err) if err.is_terminal() => {
                    return Err(PublishError::Failed {
                        attempts: attempt,
                        source: err,
                    });
                }
                Err(err) => {
                    warn!(
                        kind = record.body.kind(),
                        attempt,
                        error = %err,
                        "store append failed"
                    );
                    last_err = err;
                    if attempt < self.attempts {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }
        Err(PublishError::Failed {
            attempts: self.attempts,
            source: last_err,
        })
    }
}
