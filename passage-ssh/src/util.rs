use std::future::Future;
use std::time::Duration;

use passage_common::PassageError;

/// Races a future against a deadline. The generic dial/resolve combinator
/// used across the engine.
pub async fn with_timeout<T, F>(future: F, duration: Duration) -> Result<T, PassageError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| PassageError::TimeoutExceeded)
}
