//! Two-level pool for per-item sub-resources.
//!
//! The outer level runs owners in parallel, the inner level runs each
//! owner's sub-resources in parallel. Results come back grouped by owner.

use std::future::Future;

use futures::stream::{self, StreamExt};

use crate::errors::SyncError;

/// Work for one owning item: `(key, payload)` pairs.
#[derive(Debug, Clone)]
pub struct NestedJob<A> {
    pub owner: String,
    pub items: Vec<(String, A)>,
}

/// Settled results for one owner.
#[derive(Debug)]
pub struct OwnerOutcome<T> {
    pub owner: String,
    pub succeeded: Vec<(String, T)>,
    pub failed: Vec<(String, SyncError)>,
}

impl<T> OwnerOutcome<T> {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Run `op(owner, payload)` for every sub-resource of every job, at most
/// `outer` owners and `inner` sub-resources per owner at a time.
pub async fn run_nested<A, T, F, Fut>(
    jobs: Vec<NestedJob<A>>,
    outer: usize,
    inner: usize,
    op: F,
) -> Vec<OwnerOutcome<T>>
where
    F: Fn(String, A) -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
{
    let op = &op;
    let inner = inner.max(1);
    stream::iter(jobs)
        .map(|job| async move {
            let owner = job.owner;
            let settled: Vec<(String, Result<T, SyncError>)> = stream::iter(job.items)
                .map(|(key, payload)| {
                    let owner = owner.clone();
                    async move {
                        let outcome = op(owner, payload).await;
                        (key, outcome)
                    }
                })
                .buffer_unordered(inner)
                .collect()
                .await;

            let mut outcome = OwnerOutcome {
                owner,
                succeeded: Vec::new(),
                failed: Vec::new(),
            };
            for (key, result) in settled {
                match result {
                    Ok(value) => outcome.succeeded.push((key, value)),
                    Err(err) => outcome.failed.push((key, err)),
                }
            }
            outcome
        })
        .buffer_unordered(outer.max(1))
        .collect()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::RemoteError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn jobs(owners: usize, per_owner: usize) -> Vec<NestedJob<usize>> {
        (0..owners)
            .map(|o| NestedJob {
                owner: format!("item-{o}"),
                items: (0..per_owner).map(|a| (format!("att-{o}-{a}"), a)).collect(),
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_nested_bounds() {
        let in_flight = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let (in_flight, peak) = (&in_flight, &peak);

        let outcomes = run_nested(jobs(6, 5), 3, 2, |_, n| async move {
            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(n)
        })
        .await;

        assert_eq!(outcomes.len(), 6);
        assert!(outcomes.iter().all(|o| o.succeeded.len() == 5 && o.is_clean()));
        assert_eq!(peak.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_failures_grouped_by_owner() {
        let outcomes = run_nested(jobs(2, 3), 2, 2, |owner, n| async move {
            if owner == "item-1" && n == 2 {
                Err(SyncError::from(RemoteError::NotFound { id: owner }))
            } else {
                Ok(())
            }
        })
        .await;

        let bad = outcomes.iter().find(|o| o.owner == "item-1").unwrap();
        assert_eq!(bad.succeeded.len(), 2);
        assert_eq!(bad.failed.len(), 1);
        assert_eq!(bad.failed[0].0, "att-1-2");
        let good = outcomes.iter().find(|o| o.owner == "item-0").unwrap();
        assert!(good.is_clean());
    }
}
