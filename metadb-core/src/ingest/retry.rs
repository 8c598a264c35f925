use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::IngestSection;
use crate::error::{IngestError, MetadbError};
use crate::store::MetadataStore;

/// Runs a unit of work inside one store transaction, restarting it from a
/// clean transaction when it fails with a transient error.
#[derive(Debug, Clone, Copy)]
pub struct TransactionRetry {
    /// Total attempts, including the first.
    limit: u32,
    backoff: Duration,
}

impl Default for TransactionRetry {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(50))
    }
}

impl TransactionRetry {
    pub fn new(limit: u32, backoff: Duration) -> Self {
        Self {
            limit: limit.max(1),
            backoff,
        }
    }

    pub fn from_config(ingest: &IngestSection) -> Self {
        Self::new(ingest.retry_limit, Duration::from_millis(ingest.retry_backoff_ms))
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Run `work` until it commits, fails permanently, or the attempt limit
    /// is reached. Returns the work's value and the number of attempts used.
    ///
    /// Every attempt gets a fresh transaction; a failed attempt is rolled back
    /// before the next one starts.
    pub async fn run<T, F, Fut>(
        &self,
        store: &dyn MetadataStore,
        label: &str,
        mut work: F,
    ) -> crate::error::Result<(T, u32)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = crate::error::Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match Self::attempt(store, &mut work).await {
                Ok(value) => return Ok((value, attempt)),
                Err(err) => err,
            };

            if !err.is_transient() {
                debug!(label, attempt, class = err.class().as_str(), "Not retrying");
                return Err(err);
            }
            if attempt >= self.limit {
                return Err(IngestError::RetriesExhausted {
                    attempts: attempt,
                    source: Box::new(err),
                }
                .into());
            }

            warn!(label, attempt, limit = self.limit, error = %err, "Transient failure, retrying");
            if !self.backoff.is_zero() {
                tokio::time::sleep(self.backoff * attempt).await;
            }
        }
    }

    async fn attempt<T, F, Fut>(store: &dyn MetadataStore, work: &mut F) -> crate::error::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = crate::error::Result<T>>,
    {
        store.begin_transaction().await?;
        let result = match work().await {
            Ok(value) => store.commit_transaction().await.map(|()| value),
            Err(err) => Err(err),
        };
        if let Err(err) = &result {
            rollback_quietly(store, err).await;
        }
        result
    }
}

async fn rollback_quietly(store: &dyn MetadataStore, cause: &MetadbError) {
    if let Err(rollback_err) = store.rollback_transaction().await {
        debug!(error = %rollback_err, cause = %cause, "Rollback failed");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::{FailureClass, StoreError};
    use crate::store::SqliteStore;
    use crate::types::NewPackage;

    fn transient() -> MetadbError {
        StoreError::Unavailable("reset".into()).into()
    }

    #[tokio::test]
    async fn succeeds_first_time() {
        let store = SqliteStore::in_memory().unwrap();
        let retry = TransactionRetry::new(3, Duration::ZERO);
        let db = &store;
        let (id, attempts) = retry
            .run(db, "p", || async move {
                db.upsert_package(&NewPackage::new("p", "mvn")).await
            })
            .await
            .unwrap();
        assert_eq!(attempts, 1);
        assert_eq!(store.get_package("p", "mvn").await.unwrap().unwrap().id, id);
    }

    #[tokio::test]
    async fn transient_failure_is_retried_from_scratch() {
        let store = SqliteStore::in_memory().unwrap();
        let calls = AtomicU32::new(0);
        let (db, counter) = (&store, &calls);
        let retry = TransactionRetry::new(3, Duration::ZERO);
        let (_, attempts) = retry
            .run(db, "p", || async move {
                db.upsert_package(&NewPackage::new("p", "mvn")).await?;
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(transient());
                }
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(attempts, 2);
        assert_eq!(store.stats().await.unwrap().packages, 1);
    }

    #[tokio::test]
    async fn gives_up_after_limit() {
        let store = SqliteStore::in_memory().unwrap();
        let calls = AtomicU32::new(0);
        let (db, counter) = (&store, &calls);
        let retry = TransactionRetry::new(3, Duration::ZERO);
        let err = retry
            .run(db, "p", || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                db.upsert_package(&NewPackage::new("p", "mvn")).await?;
                Err::<(), _>(transient())
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(
            err,
            MetadbError::Ingest(IngestError::RetriesExhausted { attempts: 3, .. })
        ));
        assert_eq!(store.stats().await.unwrap().packages, 0);
    }

    #[tokio::test]
    async fn fatal_failure_is_not_retried() {
        let store = SqliteStore::in_memory().unwrap();
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let retry = TransactionRetry::new(5, Duration::ZERO);
        let err = retry
            .run(&store, "p", || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(StoreError::MissingRow("x".into()).into())
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.class(), FailureClass::Fatal);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_grows_with_each_attempt() {
        let store = SqliteStore::in_memory().unwrap();
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let retry = TransactionRetry::new(3, Duration::from_millis(100));
        let started = tokio::time::Instant::now();
        let (_, attempts) = retry
            .run(&store, "p", || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    return Err(transient());
                }
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(attempts, 3);
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn no_sleep_after_the_last_attempt() {
        let store = SqliteStore::in_memory().unwrap();
        let retry = TransactionRetry::new(2, Duration::from_millis(100));
        let started = tokio::time::Instant::now();
        let err = retry
            .run(&store, "p", || async { Err::<(), _>(transient()) })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MetadbError::Ingest(IngestError::RetriesExhausted { attempts: 2, .. })
        ));
        assert_eq!(started.elapsed(), Duration::from_millis(100));
    }

    #[test]
    fn zero_limit_still_attempts_once() {
        assert_eq!(TransactionRetry::new(0, Duration::ZERO).limit(), 1);
    }
}
