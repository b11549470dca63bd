//! Timeout helpers and the default durations used across the crate.

use std::future::Future;
use std::time::Duration;

use crate::error::{ChannelError, Result};

/// Default connect/handshake timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default deadline for one request/response exchange
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Agent heartbeat period
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Delay between reconnect attempts
pub const RECONNECT_DELAY: Duration = Duration::from_secs(10);

/// How often a connection checks its identity's pending command
pub const COMMAND_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How long a shutting-down server waits for connections to drain
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Run `fut` with a deadline, mapping expiry to `ChannelError::Timeout`
pub async fn with_timeout<F, T>(fut: F, duration: Duration) -> Result<T>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, fut)
        .await
        .map_err(|_| ChannelError::Timeout)
}

/// Like [`with_timeout`] for futures that already return a `Result`
pub async fn with_timeout_error<F, T>(fut: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(ChannelError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires() {
        let slow = tokio::time::sleep(Duration::from_secs(5));
        let result = with_timeout(slow, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ChannelError::Timeout)));
    }

    #[tokio::test]
    async fn test_inner_error_preserved() {
        let failing = async { Err::<(), _>(ChannelError::ConnectionClosed) };
        let result = with_timeout_error(failing, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ChannelError::ConnectionClosed)));
    }
}
