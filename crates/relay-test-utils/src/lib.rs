// relay-test-utils: shared test doubles for the adapter suite.
//
// Provides an in-memory capped event collection and a mock host framework,
// so multi-instance clusters can be simulated inside a single test process.

pub mod memory_stream;
pub mod mock_host;

pub use memory_stream::MemoryStream;
pub use mock_host::{MockHost, SentPacket};

use std::future::Future;
use std::time::Duration;

/// Initialize test logging once; later calls are no-ops.  Filtered through
/// `RUST_LOG` as usual.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Async-condition variant of [`wait_until`].
pub async fn wait_until_async<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
