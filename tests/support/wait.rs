use std::future::Future;
use std::time::Duration;

use anyhow::{Context as _, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Polls `probe` until it yields a value or `timeout` elapses.
pub async fn wait_for<T, F, Fut>(what: &str, timeout: Duration, mut probe: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let poll = async {
        loop {
            if let Some(value) = probe().await.with_context(|| format!("poll {what}"))? {
                return Ok::<T, anyhow::Error>(value);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    };

    tokio::time::timeout(timeout, poll)
        .await
        .with_context(|| format!("timed out after {timeout:?} waiting for {what}"))?
}
