//! Timeout defaults and helpers for connect and shutdown paths.

use std::future::Future;
use std::time::Duration;

use crate::error::{IpcError, Result};

/// Default time a client waits for an endpoint to accept
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay between connect probes while an endpoint is missing or busy
pub const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Time a server waits for connections to close on shutdown
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Run `future`, mapping an elapsed deadline to `on_timeout()`
pub async fn with_timeout_error<F, T, E>(future: F, duration: Duration, on_timeout: E) -> Result<T>
where
    F: Future<Output = Result<T>>,
    E: FnOnce() -> IpcError,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(on_timeout()),
    }
}
