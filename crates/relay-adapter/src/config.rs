//! Adapter configuration.
//!
//! All options are programmatic with documented defaults; the hosting
//! application decides where they come from.  `validate` runs at adapter
//! construction and rejects degenerate values early.

use std::time::Duration;

/// Where recoverable sessions are kept between disconnect and reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionStore {
    /// Persist a `session` row into the shared collection at disconnect
    /// time, so recovery works even if the owning instance dies.  Retention
    /// follows the collection's cap/TTL, matching event records.
    #[default]
    Collection,
    /// Keep sessions only in this instance's memory.  Cheaper, but a client
    /// can recover only through the instance it disconnected from.
    Memory,
}

/// Tunables for one adapter instance.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// Instance id override.  Default: a fresh UUIDv4 per adapter.
    pub uid: Option<String>,
    /// Default deadline for cluster requests.  Expiry resolves with the
    /// partial responses collected, never an error.
    pub requests_timeout: Duration,
    /// Cadence of presence heartbeats on the shared stream.
    pub heartbeat_interval: Duration,
    /// Silence after which a peer is considered gone and its pending
    /// contributions are dropped.
    pub heartbeat_timeout: Duration,
    /// Stamp `createdAt` on every written record, for deployments that
    /// prune the collection by TTL instead of cap size.
    pub add_created_at_field: bool,
    /// Grace window for session recovery after an abrupt disconnect.
    pub max_disconnection_duration: Duration,
    /// Session persistence mode.
    pub session_store: SessionStore,
    /// How many trailing records the tail cursor re-reads at startup to
    /// cover ordering skew at the end of the stream.
    pub startup_overlap: usize,
    /// Bounded store-append attempts before a publish fails.
    pub publish_attempts: u32,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        AdapterConfig {
            uid: None,
            requests_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(10),
            add_created_at_field: false,
            max_disconnection_duration: Duration::from_secs(120),
            session_store: SessionStore::default(),
            startup_overlap: 8,
            publish_attempts: 3,
        }
    }
}

impl AdapterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.requests_timeout.is_zero() {
            return Err(ConfigError::InvalidValue(
                "requests_timeout must be greater than zero".to_owned(),
            ));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "heartbeat_interval must be greater than zero".to_owned(),
            ));
        }
        if self.heartbeat_timeout <= self.heartbeat_interval {
            return Err(ConfigError::InvalidValue(
                "heartbeat_timeout must exceed heartbeat_interval".to_owned(),
            ));
        }
        if self.publish_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "publish_attempts must be at least 1".to_owned(),
            ));
        }
        if let Some(uid) = &self.uid
            && uid.is_empty()
        {
            return Err(ConfigError::InvalidValue("uid must not be empty".to_owned()));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(s) => write!(f, "invalid config value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}
