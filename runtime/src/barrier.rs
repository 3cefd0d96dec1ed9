//! Deterministic-async-cleanup coordination.
//!
//! A [`CleanupBarrier`] lets many independent subscribers register
//! asynchronous cleanup work before a single coordinator awaits all of it
//! with a bounded timeout. Task failures are counted, never propagated, so
//! scope teardown always proceeds regardless of how many cleanup tasks
//! misbehave.
//!
//! # Ordering contract
//!
//! Registration must happen synchronously inside the subscriber's
//! notification handler, before any `await`: the coordinator closes the
//! barrier as soon as all synchronous notification delivery has occurred.
//! A late [`CleanupBarrier::add`] returns `false` (the work is dropped by
//! design) rather than panicking a shutdown path.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, join_all};

/// Result type produced by cleanup tasks.
pub type CleanupResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Result record returned by [`CleanupBarrier::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupOutcome {
    /// Whether every task finished before the timeout.
    pub completed: bool,
    /// Whether the timeout was hit.
    pub timed_out: bool,
    /// How many tasks failed (returned an error or panicked).
    pub failed: usize,
    /// Total number of registered tasks.
    pub task_count: usize,
}

impl CleanupOutcome {
    /// The outcome of a wait with nothing registered.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            completed: true,
            timed_out: false,
            failed: 0,
            task_count: 0,
        }
    }
}

/// Notification payload handed to scope-ending subscribers.
///
/// Subscribers that need cleanup-before-teardown call
/// [`CleanupBarrier::add`] on the carried barrier — synchronously, before
/// any `await` (see the module-level ordering contract).
#[derive(Clone)]
pub struct ScopeEnding {
    /// The barrier the coordinator will wait on.
    pub barrier: Arc<CleanupBarrier>,
}

struct BarrierState {
    closed: bool,
    tasks: Vec<BoxFuture<'static, CleanupResult>>,
}

/// Collects independently-registered cleanup futures for one bounded wait.
///
/// Created fresh per scope-ending operation and discarded after the wait.
pub struct CleanupBarrier {
    state: Mutex<BarrierState>,
}

impl CleanupBarrier {
    /// A fresh, open barrier.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BarrierState {
                closed: false,
                tasks: Vec::new(),
            }),
        }
    }

    /// Register a cleanup future.
    ///
    /// Returns `true` if the barrier accepted the task, `false` if the
    /// coordinator has already begun waiting. A `false` return is a caller
    /// bug (registration happened after the synchronous notification
    /// window) but is deliberately non-fatal.
    pub fn add<F>(&self, task: F) -> bool
    where
        F: Future<Output = CleanupResult> + Send + 'static,
    {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            tracing::warn!("Cleanup task registered after the barrier closed; dropping it");
            return false;
        }
        state.tasks.push(Box::pin(task));
        true
    }

    /// Whether the coordinator has begun waiting.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed
    }

    /// Close the barrier and await all registered tasks, bounded by
    /// `timeout`.
    ///
    /// Each task runs on its own spawned task: an error or panic in one is
    /// counted and isolated from the others. Tasks that exceed the timeout
    /// are not cancelled — the coordinator simply stops waiting and
    /// proceeds. This method never fails; everything is reported in the
    /// returned [`CleanupOutcome`].
    pub async fn wait(&self, timeout: Duration) -> CleanupOutcome {
        let tasks = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.closed = true;
            std::mem::take(&mut state.tasks)
        };

        let task_count = tasks.len();
        if task_count == 0 {
            return CleanupOutcome::empty();
        }

        let failures = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = tasks
            .into_iter()
            .map(|task| {
                let failures = Arc::clone(&failures);
                tokio::spawn(async move {
                    if let Err(error) = task.await {
                        failures.fetch_add(1, Ordering::SeqCst);
                        tracing::warn!(error = %error, "Cleanup task failed");
                    }
                })
            })
            .collect();

        let joined = tokio::time::timeout(timeout, join_all(handles)).await;

        match joined {
            Ok(results) => {
                // A JoinError means the task panicked; count it as a failure.
                let panicked = results.iter().filter(|r| r.is_err()).count();
                if panicked > 0 {
                    failures.fetch_add(panicked, Ordering::SeqCst);
                    tracing::warn!(panicked, "Cleanup tasks panicked");
                }
                let failed = failures.load(Ordering::SeqCst);
                CleanupOutcome {
                    completed: true,
                    timed_out: false,
                    failed,
                    task_count,
                }
            }
            Err(_) => {
                metrics::counter!("juice.cleanup.timeouts").increment(1);
                tracing::warn!(
                    task_count,
                    timeout_ms = timeout.as_millis(),
                    "Cleanup wait timed out; tasks continue in the background"
                );
                CleanupOutcome {
                    completed: false,
                    timed_out: true,
                    failed: failures.load(Ordering::SeqCst),
                    task_count,
                }
            }
        }
    }
}

impl Default for CleanupBarrier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn wait_with_zero_tasks_resolves_immediately() {
        let barrier = CleanupBarrier::new();

        let outcome = barrier.wait(Duration::from_millis(50)).await;

        assert_eq!(outcome, CleanupOutcome::empty());
        assert!(outcome.completed);
        assert_eq!(outcome.task_count, 0);
    }

    #[tokio::test]
    async fn add_after_wait_returns_false_without_panicking() {
        let barrier = CleanupBarrier::new();
        barrier.wait(Duration::from_millis(10)).await;

        let accepted = barrier.add(async { Ok(()) });

        assert!(!accepted);
        assert!(barrier.is_closed());
    }

    #[tokio::test]
    async fn failures_are_counted_not_propagated() {
        let barrier = CleanupBarrier::new();
        assert!(barrier.add(async { Ok(()) }));
        assert!(barrier.add(async { Err("first".into()) }));
        assert!(barrier.add(async { Err("second".into()) }));

        let outcome = barrier.wait(Duration::from_secs(1)).await;

        assert!(outcome.completed);
        assert!(!outcome.timed_out);
        assert_eq!(outcome.failed, 2);
        assert_eq!(outcome.task_count, 3);
    }

    #[tokio::test]
    async fn never_resolving_task_hits_the_timeout() {
        let barrier = CleanupBarrier::new();
        barrier.add(async {
            futures::future::pending::<()>().await;
            Ok(())
        });

        let start = Instant::now();
        let outcome = barrier.wait(Duration::from_millis(50)).await;
        let elapsed = start.elapsed();

        assert!(outcome.timed_out);
        assert!(!outcome.completed);
        assert_eq!(outcome.task_count, 1);
        assert!(elapsed >= Duration::from_millis(45), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(500), "elapsed {elapsed:?}");
    }

    #[tokio::test]
    #[allow(clippy::panic)]
    async fn panicking_task_is_counted_as_a_failure() {
        let barrier = CleanupBarrier::new();
        barrier.add(async {
            if true {
                panic!("cleanup blew up");
            }
            Ok(())
        });
        barrier.add(async { Ok(()) });

        let outcome = barrier.wait(Duration::from_secs(1)).await;

        assert!(outcome.completed);
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.task_count, 2);
    }

    #[tokio::test]
    async fn slow_tasks_keep_running_after_timeout() {
        let barrier = CleanupBarrier::new();
        let finished = Arc::new(AtomicUsize::new(0));
        let finished_clone = Arc::clone(&finished);

        barrier.add(async move {
            tokio::time::sleep(Duration::from_millis(80)).await;
            finished_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let outcome = barrier.wait(Duration::from_millis(10)).await;
        assert!(outcome.timed_out);
        assert_eq!(finished.load(Ordering::SeqCst), 0);

        // The spawned task was not cancelled by the timeout.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }
}
