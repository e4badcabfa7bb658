// relay-adapter: distributed event-broadcast adapter over a shared capped
// event collection.
//
// One adapter per namespace per instance.  Instances federate through the
// collection alone: broadcasts, cluster requests, presence heartbeats, and
// recoverable session rows all ride the same ordered stream.

pub mod adapter;
pub mod config;
pub mod host;
pub mod publisher;
pub mod recovery;
pub mod rpc;
pub mod store;

mod delivery;
mod listener;

pub use adapter::{AdapterEvent, BroadcastAck, RelayAdapter};
pub use config::{AdapterConfig, ConfigError, SessionStore};
pub use host::{AckSink, DeliveryError, Host, SocketView};
pub use publisher::PublishError;
pub use recovery::RecoveryError;
pub use rpc::RpcOutcome;
pub use store::{DocStream, EventStream, StoreError, TailStart};
