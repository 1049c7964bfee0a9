//! Bounded-concurrency fan-out over remote operations.
//!
//! [`BatchExecutor::run`] settles every id: one failure never discards its
//! siblings. Ids are processed in batches; cancellation is only observed
//! between batches so in-flight work always drains. Failures are classified
//! through [`SyncError::kind`] and only the retryable ones are ever retried.

pub mod attachments;
pub mod retry;
pub mod throttle;

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{debug, error, info, warn};

use crate::errors::{FailureKind, SyncError};

pub use attachments::{run_nested, NestedJob, OwnerOutcome};
pub use retry::{with_retry, RetryPolicy};
pub use throttle::Throttle;

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cooperative cancellation flag shared between the caller and a run.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    flag: Arc<AtomicBool>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the run to stop at the next batch boundary.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Options and results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Maximum operations in flight.
    pub concurrency: usize,
    /// Ids per batch; cancellation and checkpoints happen between batches.
    pub batch_size: usize,
    /// Treat not-found as skipped rather than failed.
    pub skip_on_404: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            concurrency: 8,
            batch_size: 50,
            skip_on_404: true,
        }
    }
}

/// One id that did not complete.
#[derive(Debug)]
pub struct ItemFailure {
    pub id: String,
    pub error: SyncError,
}

impl ItemFailure {
    pub fn kind(&self) -> FailureKind {
        self.error.kind()
    }
}

/// Outcome of a whole run.
#[derive(Debug)]
pub struct BatchResult<T> {
    pub succeeded: Vec<(String, T)>,
    /// Not-found ids skipped under `skip_on_404`.
    pub skipped: Vec<String>,
    pub failed: Vec<ItemFailure>,
    /// The signal fired; `remaining` were never dispatched.
    pub cancelled: bool,
    pub remaining: Vec<String>,
    /// A fatal failure stopped the run after its batch.
    pub fatal: Option<ItemFailure>,
}

impl<T> Default for BatchResult<T> {
    fn default() -> Self {
        Self {
            succeeded: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
            cancelled: false,
            remaining: Vec::new(),
            fatal: None,
        }
    }
}

impl<T> BatchResult<T> {
    /// Ids that failed with a retryable error.
    pub fn retryable_ids(&self) -> Vec<String> {
        self.failed
            .iter()
            .filter(|f| f.kind() == FailureKind::Retryable)
            .map(|f| f.id.clone())
            .collect()
    }

    /// Whether the run stopped before settling every id.
    pub fn interrupted(&self) -> bool {
        self.cancelled || self.fatal.is_some()
    }
}

/// What one batch settled.
#[derive(Debug, Default, Clone)]
pub struct BatchProgress {
    /// Ids that succeeded or were skipped in this batch.
    pub settled: Vec<String>,
    /// Ids that failed in this batch.
    pub failed: Vec<String>,
}

/// Hooks invoked while a run progresses.
pub trait BatchObserver: Send + Sync {
    /// One id finished, successfully or not.
    fn on_item(&self, _id: &str, _ok: bool) {}

    /// A batch settled. An error here is treated as fatal.
    fn on_batch_complete(&self, _progress: &BatchProgress) -> Result<(), SyncError> {
        Ok(())
    }
}

/// Observer that ignores everything.
pub struct NoopObserver;

impl BatchObserver for NoopObserver {}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Runs operations over ids with bounded concurrency and shared throttling.
#[derive(Clone)]
pub struct BatchExecutor {
    throttle: Arc<Throttle>,
    signal: CancelSignal,
}

impl BatchExecutor {
    pub fn new(throttle: Arc<Throttle>, signal: CancelSignal) -> Self {
        Self { throttle, signal }
    }

    pub fn signal(&self) -> &CancelSignal {
        &self.signal
    }

    /// One pass over `ids`.
    pub async fn run<T, F, Fut>(
        &self,
        ids: Vec<String>,
        op: F,
        options: &BatchOptions,
        observer: &dyn BatchObserver,
    ) -> BatchResult<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let mut result = BatchResult::default();
        let concurrency = options.concurrency.max(1);
        let batch_size = options.batch_size.max(1);
        let op = &op;

        let mut pending = ids.into_iter();
        loop {
            let batch: Vec<String> = pending.by_ref().take(batch_size).collect();
            if batch.is_empty() {
                break;
            }
            if self.signal.is_cancelled() {
                info!(
                    remaining = batch.len() + pending.len(),
                    "cancellation requested, stopping at batch boundary"
                );
                result.cancelled = true;
                result.remaining = batch.into_iter().chain(pending.by_ref()).collect();
                break;
            }

            debug!(size = batch.len(), concurrency, "dispatching batch");
            let outcomes: Vec<(String, Result<T, SyncError>)> = stream::iter(batch)
                .map(|id| {
                    let throttle = &self.throttle;
                    async move {
                        throttle.wait().await;
                        let outcome = op(id.clone()).await;
                        observer.on_item(&id, outcome.is_ok());
                        (id, outcome)
                    }
                })
                .buffer_unordered(concurrency)
                .collect()
                .await;

            let mut progress = BatchProgress::default();
            for (id, outcome) in outcomes {
                match outcome {
                    Ok(value) => {
                        progress.settled.push(id.clone());
                        result.succeeded.push((id, value));
                    }
                    Err(err) => {
                        match err.kind() {
                            FailureKind::NotFound if options.skip_on_404 => {
                                debug!(id = %id, "not found, skipping");
                                progress.settled.push(id.clone());
                                result.skipped.push(id);
                            }
                            FailureKind::Fatal => {
                                error!(id = %id, error = %err, "fatal failure, stopping run");
                                progress.failed.push(id.clone());
                                if result.fatal.is_none() {
                                    result.fatal = Some(ItemFailure { id, error: err });
                                } else {
                                    result.failed.push(ItemFailure { id, error: err });
                                }
                            }
                            kind => {
                                warn!(id = %id, ?kind, error = %err, "item failed");
                                progress.failed.push(id.clone());
                                result.failed.push(ItemFailure { id, error: err });
                            }
                        }
                    }
                }
            }

            if let Err(err) = observer.on_batch_complete(&progress) {
                error!(error = %err, "batch observer failed");
                if result.fatal.is_none() {
                    result.fatal = Some(ItemFailure {
                        id: String::new(),
                        error: err,
                    });
                }
            }

            if result.fatal.is_some() {
                result.remaining = pending.by_ref().collect();
                break;
            }
        }

        result
    }

    /// [`run`](Self::run), then up to `policy.max_retries` passes over the
    /// retryable failures at `policy.retry_concurrency`, each after a
    /// jittered backoff.
    pub async fn run_with_retry<T, F, Fut>(
        &self,
        ids: Vec<String>,
        op: F,
        options: &BatchOptions,
        policy: &RetryPolicy,
        observer: &dyn BatchObserver,
    ) -> BatchResult<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let mut result = self.run(ids, &op, options, observer).await;

        for attempt in 0..policy.max_retries {
            if result.interrupted() {
                break;
            }
            let retry_ids = result.retryable_ids();
            if retry_ids.is_empty() {
                break;
            }

            let server_delay = result
                .failed
                .iter()
                .filter(|f| f.kind() == FailureKind::Retryable)
                .filter_map(|f| f.error.retry_after())
                .max();
            let delay = policy.delay_for(attempt, server_delay);
            info!(
                attempt = attempt + 1,
                count = retry_ids.len(),
                delay_ms = delay.as_millis() as u64,
                "retrying transient failures"
            );
            tokio::time::sleep(delay).await;

            let retrying: HashSet<&str> = retry_ids.iter().map(String::as_str).collect();
            let (kept, _): (Vec<ItemFailure>, Vec<ItemFailure>) = std::mem::take(&mut result.failed)
                .into_iter()
                .partition(|f| !retrying.contains(f.id.as_str()));
            result.failed = kept;

            let pass_options = BatchOptions {
                concurrency: policy.retry_concurrency.max(1),
                ..options.clone()
            };
            let pass = self.run(retry_ids, &op, &pass_options, observer).await;
            result.absorb(pass);
        }

        result
    }
}

impl<T> BatchResult<T> {
    fn absorb(&mut self, pass: BatchResult<T>) {
        self.succeeded.extend(pass.succeeded);
        self.skipped.extend(pass.skipped);
        self.failed.extend(pass.failed);
        self.cancelled |= pass.cancelled;
        self.remaining.extend(pass.remaining);
        if self.fatal.is_none() {
            self.fatal = pass.fatal;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{DatabaseError, RemoteError};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| i.to_string()).collect()
    }

    fn executor() -> BatchExecutor {
        BatchExecutor::new(Arc::new(Throttle::new()), CancelSignal::new())
    }

    fn transient() -> SyncError {
        RemoteError::TransientServer {
            status: 503,
            detail: "unavailable".into(),
        }
        .into()
    }

    #[derive(Default)]
    struct Recorder {
        batches: Mutex<Vec<BatchProgress>>,
        cancel_after_first: Option<CancelSignal>,
    }

    impl BatchObserver for Recorder {
        fn on_batch_complete(&self, progress: &BatchProgress) -> Result<(), SyncError> {
            self.batches.lock().unwrap().push(progress.clone());
            if let Some(signal) = &self.cancel_after_first {
                signal.cancel();
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let options = BatchOptions {
            concurrency: 4,
            batch_size: 10,
            skip_on_404: true,
        };
        let result = executor()
            .run(
                ids(30),
                |id| async move {
                    let n: usize = id.parse().unwrap();
                    match n % 10 {
                        3 => Err(RemoteError::NotFound { id }.into()),
                        7 => Err(RemoteError::Api {
                            status: 400,
                            body: "bad".into(),
                        }
                        .into()),
                        _ => Ok(n * 2),
                    }
                },
                &options,
                &NoopObserver,
            )
            .await;

        assert_eq!(result.succeeded.len(), 24);
        assert_eq!(result.skipped.len(), 3);
        assert_eq!(result.failed.len(), 3);
        assert!(!result.interrupted());
        assert!(result.failed.iter().all(|f| f.kind() == FailureKind::Terminal));
    }

    #[tokio::test]
    async fn test_not_found_counts_as_failure_without_skip() {
        let options = BatchOptions {
            skip_on_404: false,
            ..BatchOptions::default()
        };
        let result: BatchResult<()> = executor()
            .run(
                ids(2),
                |id| async move { Err(RemoteError::NotFound { id }.into()) },
                &options,
                &NoopObserver,
            )
            .await;
        assert!(result.skipped.is_empty());
        assert_eq!(result.failed.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        let in_flight = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let options = BatchOptions {
            concurrency: 3,
            batch_size: 100,
            skip_on_404: true,
        };
        let (in_flight, peak) = (&in_flight, &peak);
        let result = executor()
            .run(
                ids(20),
                |_| async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                },
                &options,
                &NoopObserver,
            )
            .await;
        assert_eq!(result.succeeded.len(), 20);
        assert_eq!(peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_observer_sees_every_batch() {
        let recorder = Recorder::default();
        let options = BatchOptions {
            concurrency: 2,
            batch_size: 4,
            skip_on_404: true,
        };
        executor()
            .run(ids(10), |_| async { Ok(()) }, &options, &recorder)
            .await;
        let batches = recorder.batches.lock().unwrap();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].settled.len(), 2);
    }

    #[tokio::test]
    async fn test_cancel_stops_at_batch_boundary() {
        let exec = executor();
        let recorder = Recorder {
            cancel_after_first: Some(exec.signal().clone()),
            ..Default::default()
        };
        let options = BatchOptions {
            concurrency: 2,
            batch_size: 5,
            skip_on_404: true,
        };
        let result = exec
            .run(ids(12), |_| async { Ok(()) }, &options, &recorder)
            .await;
        assert!(result.cancelled);
        assert_eq!(result.succeeded.len(), 5);
        assert_eq!(result.remaining.len(), 7);
        assert_eq!(result.remaining[0], "5");
    }

    #[tokio::test]
    async fn test_fatal_stops_after_batch() {
        let options = BatchOptions {
            concurrency: 2,
            batch_size: 4,
            skip_on_404: true,
        };
        let result = executor()
            .run(
                ids(12),
                |id| async move {
                    if id == "1" {
                        Err(DatabaseError::Corruption("bad page".into()).into())
                    } else {
                        Ok(())
                    }
                },
                &options,
                &NoopObserver,
            )
            .await;
        assert_eq!(result.fatal.as_ref().map(|f| f.id.as_str()), Some("1"));
        assert_eq!(result.succeeded.len(), 3);
        assert_eq!(result.remaining.len(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_only_retryable() {
        let calls: Mutex<Vec<String>> = Mutex::new(Vec::new());
        let policy = RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            retry_concurrency: 1,
        };
        let result = executor()
            .run_with_retry(
                ids(6),
                |id| {
                    let attempt = {
                        let mut calls = calls.lock().unwrap();
                        calls.push(id.clone());
                        calls.iter().filter(|c| **c == id).count()
                    };
                    async move {
                        match id.as_str() {
                            "0" => Err(RemoteError::NotFound { id }.into()),
                            "1" if attempt < 2 => Err(transient()),
                            "2" => Err(transient()),
                            "3" => Err(RemoteError::Forbidden { id }.into()),
                            _ => Ok(()),
                        }
                    }
                },
                &BatchOptions::default(),
                &policy,
                &NoopObserver,
            )
            .await;

        let calls = calls.lock().unwrap();
        let count = |id: &str| calls.iter().filter(|c| *c == id).count();
        assert_eq!(count("0"), 1, "skipped not-found is never retried");
        assert_eq!(count("1"), 2);
        assert_eq!(count("2"), 3);
        assert_eq!(count("3"), 1, "terminal failures are not retried");

        assert_eq!(result.succeeded.len(), 3);
        assert_eq!(result.skipped, vec!["0".to_string()]);
        let mut failed: Vec<&str> = result.failed.iter().map(|f| f.id.as_str()).collect();
        failed.sort();
        assert_eq!(failed, vec!["2", "3"]);
    }
}
