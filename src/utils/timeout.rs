//! Async timeout wrappers and shared timeout constants.

use crate::error::{Result, UaError};
use std::future::Future;
use std::time::Duration;

/// Time allowed for the transport and secure-channel handshakes.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Run `fut` under a deadline, mapping expiry to [`UaError::Timeout`].
pub async fn with_timeout_error<F, T>(fut: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(UaError::Timeout),
    }
}
