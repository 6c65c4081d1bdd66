//! Transaction start timestamps.

use std::sync::Arc;

use async_trait::async_trait;
use keel_common::{KeelError, Result, Timestamp};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Source of transaction start timestamps.
#[async_trait]
pub trait TimestampOracle: Send + Sync {
    async fn get_timestamp(&self) -> Result<Timestamp>;
}

/// Oracle over the local wall clock; the logical part breaks ties so that
/// handed out timestamps strictly increase.
#[derive(Debug, Default)]
pub struct LocalOracle {
    last: Mutex<Timestamp>,
}

impl LocalOracle {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TimestampOracle for LocalOracle {
    async fn get_timestamp(&self) -> Result<Timestamp> {
        let now = Timestamp::from_datetime(&chrono::Utc::now());
        let mut last = self.last.lock();
        let next = if now > *last {
            now
        } else {
            Timestamp(last.0 + 1)
        };
        *last = next;
        Ok(next)
    }
}

/// When the caller gets its transaction timestamp relative to the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampAcquisition {
    /// Requested while planning; await [`TxnFuture`] on the session.
    Concurrent,
    /// Nothing started; acquire after planning.
    Deferred,
}

/// In-flight timestamp request.
#[derive(Debug)]
pub struct TxnFuture {
    handle: JoinHandle<Result<Timestamp>>,
}

impl TxnFuture {
    /// Start a request on the current tokio runtime.
    pub fn spawn(oracle: Arc<dyn TimestampOracle>, cancel: CancellationToken) -> Self {
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => Err(KeelError::Cancelled),
                ts = oracle.get_timestamp() => ts,
            }
        });
        debug!(operator = "TxnFuture", "timestamp request started");
        Self { handle }
    }

    /// Cancel the request if it has not completed.
    pub fn abort(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub async fn wait(self) -> Result<Timestamp> {
        self.handle
            .await
            .map_err(|e| KeelError::Storage(format!("timestamp request failed: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;

    use super::{LocalOracle, TimestampOracle, TxnFuture};

    #[tokio::test]
    async fn local_oracle_is_strictly_increasing() {
        let oracle = LocalOracle::new();
        let mut prev = oracle.get_timestamp().await.unwrap();
        for _ in 0..100 {
            let ts = oracle.get_timestamp().await.unwrap();
            assert!(ts > prev);
            prev = ts;
        }
    }

    #[tokio::test]
    async fn spawned_request_resolves() {
        let fut = TxnFuture::spawn(Arc::new(LocalOracle::new()), CancellationToken::new());
        assert!(fut.wait().await.unwrap().physical_ms() > 0);
    }
}
