// relay-bus: distributed event-broadcast adapter over a shared capped,
// time-ordered event collection.
//
// Any number of socket server instances pointed at the same collection
// behave as one logical fan-out bus: broadcasts published on one instance
// reach matching subscribers on every instance, cluster queries aggregate
// across peers, and clients reconnecting within the grace window are
// replayed the broadcasts they missed, in order.

pub use relay_adapter::{
    AckSink, AdapterConfig, AdapterEvent, BroadcastAck, ConfigError, DeliveryError, DocStream,
    EventStream, Host, PublishError, RecoveryError, RelayAdapter, RpcOutcome, SessionStore,
    SocketView, StoreError, TailStart,
};
pub use relay_protocol as protocol;
