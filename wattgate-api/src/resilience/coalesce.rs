//! Request coalescing for concurrent identical operations.
//!
//! The first caller for a key starts the operation on its own task; callers
//! arriving while it runs await the same shared result. Once the operation
//! settles, the entry lingers for a short grace window to absorb
//! near-simultaneous callers and is then removed, so later calls run fresh.
//! Failures are shared exactly like successes and are never memoized beyond
//! the grace window.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use wattgate_core::{GatewayError, GatewayResult};

use crate::telemetry::metrics;

type SharedResult<T> = Shared<BoxFuture<'static, GatewayResult<T>>>;

struct InFlight<T> {
    /// Distinguishes this run from a later one under the same key.
    id: u64,
    future: SharedResult<T>,
}

/// Per-process coalescer, keyed by string.
pub struct RequestCoalescer<T>
where
    T: Clone + Send + Sync + 'static,
{
    name: &'static str,
    in_flight: Arc<DashMap<String, InFlight<T>>>,
    grace: Duration,
    next_id: AtomicU64,
}

impl<T> RequestCoalescer<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// `name` labels logs and metrics.
    pub fn new(name: &'static str, grace: Duration) -> Self {
        Self {
            name,
            in_flight: Arc::new(DashMap::new()),
            grace,
            next_id: AtomicU64::new(1),
        }
    }

    /// Run `operation` for `key`, or join the run already in flight.
    ///
    /// The operation executes on a spawned task, so it completes even if
    /// every caller stops waiting.
    pub async fn run<F, Fut>(&self, key: &str, operation: F) -> GatewayResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GatewayResult<T>> + Send + 'static,
    {
        let (future, joined) = match self.in_flight.entry(key.to_string()) {
            Entry::Occupied(existing) => (existing.get().future.clone(), true),
            Entry::Vacant(slot) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let future = self.start(operation);
                slot.insert(InFlight {
                    id,
                    future: future.clone(),
                });
                self.schedule_removal(key.to_string(), id, future.clone());
                (future, false)
            }
        };

        if joined {
            tracing::debug!(coalescer = self.name, key = %key, "joined in-flight operation");
            if let Some(m) = metrics() {
                m.record_coalesced(self.name);
            }
        }
        future.await
    }

    /// Drop a settled result for `key` so the next call runs fresh instead of
    /// reusing it for the rest of the grace window. A run still in progress is
    /// left alone and keeps absorbing callers.
    pub fn forget(&self, key: &str) -> bool {
        self.in_flight
            .remove_if(key, |_, entry| entry.future.peek().is_some())
            .is_some()
    }

    /// Number of keys currently tracked (running or inside their grace window).
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn start<F, Fut>(&self, operation: F) -> SharedResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GatewayResult<T>> + Send + 'static,
    {
        let name = self.name;
        let handle = tokio::spawn(operation());
        async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!(coalescer = name, error = %e, "coalesced operation aborted");
                    Err(GatewayError::unexpected(format!(
                        "{} operation did not complete",
                        name
                    )))
                }
            }
        }
        .boxed()
        .shared()
    }

    fn schedule_removal(&self, key: String, id: u64, settled: SharedResult<T>) {
        let in_flight = Arc::clone(&self.in_flight);
        let grace = self.grace;
        tokio::spawn(async move {
            let _ = settled.await;
            if !grace.is_zero() {
                tokio::time::sleep(grace).await;
            }
            in_flight.remove_if(&key, |_, entry| entry.id == id);
        });
    }
}

impl<T> std::fmt::Debug for RequestCoalescer<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCoalescer")
            .field("name", &self.name)
            .field("in_flight", &self.in_flight.len())
            .field("grace", &self.grace)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn coalescer() -> Arc<RequestCoalescer<u32>> {
        Arc::new(RequestCoalescer::new("test", Duration::from_millis(100)))
    }

    async fn run_counted(
        coalescer: Arc<RequestCoalescer<u32>>,
        calls: Arc<AtomicUsize>,
        result: GatewayResult<u32>,
    ) -> GatewayResult<u32> {
        coalescer
            .run("k", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                result
            })
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_execution() {
        let coalescer = coalescer();
        let calls = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| tokio::spawn(run_counted(coalescer.clone(), calls.clone(), Ok(42))))
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok(42));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_shared_too() {
        let coalescer = coalescer();
        let calls = Arc::new(AtomicUsize::new(0));
        let failure = Err(GatewayError::not_found("nothing"));

        let (a, b) = tokio::join!(
            run_counted(coalescer.clone(), calls.clone(), failure.clone()),
            run_counted(coalescer.clone(), calls.clone(), Ok(1)),
        );
        assert_eq!(a, failure);
        assert_eq!(b, failure);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_removed_after_grace_window() {
        let coalescer = coalescer();
        let calls = Arc::new(AtomicUsize::new(0));

        assert_eq!(run_counted(coalescer.clone(), calls.clone(), Ok(1)).await, Ok(1));
        // Inside the grace window the settled result is reused.
        assert_eq!(run_counted(coalescer.clone(), calls.clone(), Ok(2)).await, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(coalescer.in_flight(), 0);
        assert_eq!(run_counted(coalescer.clone(), calls.clone(), Ok(3)).await, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_keys_run_independently() {
        let coalescer = coalescer();
        let (a, b) = tokio::join!(
            coalescer.run("a", || async { Ok(1) }),
            coalescer.run("b", || async { Ok(2) }),
        );
        assert_eq!((a, b), (Ok(1), Ok(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_operation_becomes_error() {
        let coalescer = coalescer();
        let result = coalescer
            .run("boom", || async {
                if true {
                    panic!("operation exploded");
                }
                Ok(0)
            })
            .await;
        assert!(matches!(result, Err(GatewayError::Unexpected { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forget_drops_settled_result_only() {
        let coalescer = coalescer();
        let calls = Arc::new(AtomicUsize::new(0));

        let running = tokio::spawn(run_counted(coalescer.clone(), calls.clone(), Ok(1)));
        tokio::task::yield_now().await;
        assert!(!coalescer.forget("k"));
        assert_eq!(running.await.unwrap(), Ok(1));

        // Settled but still inside the grace window.
        assert!(coalescer.forget("k"));
        assert_eq!(coalescer.in_flight(), 0);
        assert_eq!(run_counted(coalescer.clone(), calls.clone(), Ok(2)).await, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
