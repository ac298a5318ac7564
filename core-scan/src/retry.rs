//! Retry executor shared by every remote call of the pipeline.
//!
//! Every retried call goes through [`RetryExecutor::run`], parameterized by
//! the one [`RetryPolicy`] configured in [`crate::ScanConfig`]. Remote stores
//! are expected to issue each request once; [`RetryingRemoteStore`] adds the
//! retries for components that call the store directly.

use crate::ScanError;
use async_trait::async_trait;
use bridge_traits::error::{BridgeError, Result as BridgeResult};
use bridge_traits::http::RetryPolicy;
use bridge_traits::storage::{RemoteEntry, RemoteStore};
use serde_json::Value;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Errors that may clear up on their own
pub trait Retryable: Display {
    fn is_retryable(&self) -> bool;

    /// Server-provided wait before the next attempt
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl Retryable for BridgeError {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            BridgeError::RateLimited {
                retry_after_secs: Some(secs),
            } => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }
}

impl Retryable for ScanError {
    fn is_retryable(&self) -> bool {
        matches!(self, ScanError::Storage(e) if e.is_transient())
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            ScanError::Storage(e) => e.retry_after(),
            _ => None,
        }
    }
}

/// Outcome of a retried operation together with the attempts spent on it
#[derive(Debug)]
pub struct RetryOutcome<T, E = ScanError> {
    pub result: std::result::Result<T, E>,
    pub attempts: u32,
}

#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` until it succeeds, fails permanently, or attempts run out
    ///
    /// The closure receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut>(&self, name: &str, mut operation: F) -> RetryOutcome<T, E>
    where
        E: Retryable,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation = name, attempt, "Succeeded after retry");
                    }
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                    };
                }
                Err(e) if !e.is_retryable() || attempt >= max_attempts => {
                    warn!(operation = name, attempt, error = %e, "Giving up");
                    return RetryOutcome {
                        result: Err(e),
                        attempts: attempt,
                    };
                }
                Err(e) => {
                    let delay = self.policy.delay_for(attempt, e.retry_after());
                    debug!(
                        operation = name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

// ============================================================================
// Retrying Store
// ============================================================================

/// [`RemoteStore`] decorator retrying transient failures of every call
pub struct RetryingRemoteStore {
    inner: Arc<dyn RemoteStore>,
    retry: RetryExecutor,
}

impl RetryingRemoteStore {
    pub fn new(inner: Arc<dyn RemoteStore>, retry: RetryExecutor) -> Self {
        Self { inner, retry }
    }
}

#[async_trait]
impl RemoteStore for RetryingRemoteStore {
    async fn list(&self, path: &str) -> BridgeResult<Vec<RemoteEntry>> {
        self.retry.run("list", |_| self.inner.list(path)).await.result
    }

    async fn read_blob(&self, path: &str) -> BridgeResult<Option<Value>> {
        self.retry
            .run("read blob", |_| self.inner.read_blob(path))
            .await
            .result
    }

    async fn write_blob(&self, path: &str, value: &Value) -> BridgeResult<()> {
        self.retry
            .run("write blob", |_| self.inner.write_blob(path, value))
            .await
            .result
    }

    async fn delete(&self, path: &str) -> BridgeResult<()> {
        self.retry.run("delete", |_| self.inner.delete(path)).await.result
    }

    async fn read_document(&self, path: &str) -> BridgeResult<Option<String>> {
        self.retry
            .run("read document", |_| self.inner.read_document(path))
            .await
            .result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::default().with_base_delay(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let executor = RetryExecutor::new(fast_policy());
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let outcome = executor
            .run("flaky", move |_| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ScanError::Storage(BridgeError::OperationFailed("503".into())))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;

        assert_eq!(outcome.result.unwrap(), 7);
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let executor = RetryExecutor::new(fast_policy());

        let outcome: RetryOutcome<()> = executor
            .run("always failing", |attempt| async move {
                Err(ScanError::Storage(BridgeError::OperationFailed(format!(
                    "attempt {}",
                    attempt
                ))))
            })
            .await;

        assert_eq!(outcome.attempts, 3);
        assert!(matches!(
            outcome.result,
            Err(ScanError::Storage(BridgeError::OperationFailed(msg))) if msg == "attempt 3"
        ));
    }

    #[tokio::test]
    async fn test_non_storage_errors_are_not_retried() {
        let executor = RetryExecutor::new(fast_policy());

        let outcome: RetryOutcome<()> = executor
            .run("malformed", |_| async {
                Err(ScanError::Internal("bad payload".to_string()))
            })
            .await;

        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn test_retrying_store_is_the_only_retry_layer() {
        /// Counts calls; reads fail once, listings are always throttled
        #[derive(Default)]
        struct FlakyStore {
            calls: AtomicU32,
        }

        #[async_trait]
        impl RemoteStore for FlakyStore {
            async fn list(&self, _path: &str) -> BridgeResult<Vec<RemoteEntry>> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Err(BridgeError::RateLimited {
                    retry_after_secs: None,
                })
            }

            async fn read_blob(&self, _path: &str) -> BridgeResult<Option<Value>> {
                if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(BridgeError::OperationFailed("HTTP 503 error".into()));
                }
                Ok(Some(Value::Bool(true)))
            }

            async fn write_blob(&self, _path: &str, _value: &Value) -> BridgeResult<()> {
                Ok(())
            }

            async fn delete(&self, _path: &str) -> BridgeResult<()> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Err(BridgeError::NotFound("gone".into()))
            }

            async fn read_document(&self, _path: &str) -> BridgeResult<Option<String>> {
                Ok(None)
            }
        }

        let inner = Arc::new(FlakyStore::default());
        let store = RetryingRemoteStore::new(inner.clone(), RetryExecutor::new(fast_policy()));

        assert_eq!(store.read_blob("/a.json").await.unwrap(), Some(Value::Bool(true)));
        assert_eq!(inner.calls.swap(0, Ordering::SeqCst), 2);

        assert!(matches!(
            store.list("/").await,
            Err(BridgeError::RateLimited { .. })
        ));
        assert_eq!(inner.calls.swap(0, Ordering::SeqCst), 3);

        assert!(matches!(store.delete("/b.json").await, Err(BridgeError::NotFound(_))));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let executor = RetryExecutor::new(fast_policy());

        let outcome: RetryOutcome<()> = executor
            .run("missing", |_| async {
                Err(ScanError::Storage(BridgeError::NotFound("x".into())))
            })
            .await;

        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_hint_sets_delay() {
        let executor = RetryExecutor::new(RetryPolicy::default());
        let started = tokio::time::Instant::now();

        let outcome = executor
            .run("rate limited", |attempt| async move {
                if attempt == 1 {
                    Err(ScanError::Storage(BridgeError::RateLimited {
                        retry_after_secs: Some(2),
                    }))
                } else {
                    Ok(())
                }
            })
            .await;

        assert!(outcome.result.is_ok());
        assert!(started.elapsed() >= Duration::from_secs(2));
    }
}
