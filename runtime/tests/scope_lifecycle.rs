//! Lifetime-resolver scenarios: leases, feature scopes, and deterministic
//! shutdown.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use juice_runtime::{
    BlocScope, FeatureScope, LeakKind, Lifecycle, ManagedBloc, ScopeError, ScopeKey,
};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Construction/teardown stand-in for a real bloc.
struct StubBloc {
    live: Arc<AtomicUsize>,
    close_delay: Duration,
}

#[async_trait]
impl ManagedBloc for StubBloc {
    async fn close(&self) {
        tokio::time::sleep(self.close_delay).await;
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Tracks how many instances the factory built, how many are live, and the
/// highest number ever live at once.
#[derive(Clone, Default)]
struct Counters {
    built: Arc<AtomicUsize>,
    live: Arc<AtomicUsize>,
    max_live: Arc<AtomicUsize>,
}

impl Counters {
    fn factory(&self, close_delay: Duration) -> impl Fn() -> StubBloc + Send + Sync + 'static {
        let built = Arc::clone(&self.built);
        let live = Arc::clone(&self.live);
        let max_live = Arc::clone(&self.max_live);
        move || {
            built.fetch_add(1, Ordering::SeqCst);
            let now_live = live.fetch_add(1, Ordering::SeqCst) + 1;
            max_live.fetch_max(now_live, Ordering::SeqCst);
            StubBloc {
                live: Arc::clone(&live),
                close_delay,
            }
        }
    }

    fn built(&self) -> usize {
        self.built.load(Ordering::SeqCst)
    }

    fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }
}

fn new_scope() -> BlocScope {
    // Capture engine logs in test output; later calls are a no-op.
    let _ = tracing_subscriber::fmt()
        .with_env_filter("juice_runtime=debug")
        .with_test_writer()
        .try_init();
    BlocScope::new()
}

async fn until_not_live<B: ManagedBloc>(scope: &BlocScope, key: ScopeKey) {
    for _ in 0..200 {
        if !scope.is_live::<B>(key.clone()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("instance never closed");
}

// ---------------------------------------------------------------------------
// Lease lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn last_lease_release_closes_and_next_lease_rebuilds() {
    let scope = new_scope();
    let counters = Counters::default();
    scope
        .register(
            Lifecycle::Leased,
            ScopeKey::Default,
            counters.factory(Duration::ZERO),
        )
        .unwrap();

    let first = scope.lease::<StubBloc>(ScopeKey::Default).await.unwrap();
    let second = scope.lease::<StubBloc>(ScopeKey::Default).await.unwrap();
    assert_eq!(scope.lease_count::<StubBloc>(ScopeKey::Default), Some(2));
    assert_eq!(counters.built(), 1);

    drop(second);
    assert_eq!(scope.lease_count::<StubBloc>(ScopeKey::Default), Some(1));
    assert!(scope.is_live::<StubBloc>(ScopeKey::Default));

    drop(first);
    until_not_live::<StubBloc>(&scope, ScopeKey::Default).await;
    assert_eq!(counters.live(), 0);

    // A later lease constructs a fresh instance; the cycle repeats.
    let third = scope.lease::<StubBloc>(ScopeKey::Default).await.unwrap();
    assert_eq!(counters.built(), 2);
    assert_eq!(scope.lease_count::<StubBloc>(ScopeKey::Default), Some(1));
    drop(third);
}

#[tokio::test]
async fn lease_release_is_idempotent() {
    let scope = new_scope();
    let counters = Counters::default();
    scope
        .register(
            Lifecycle::Leased,
            ScopeKey::Default,
            counters.factory(Duration::ZERO),
        )
        .unwrap();

    let holder = scope.lease::<StubBloc>(ScopeKey::Default).await.unwrap();
    let released_early = scope.lease::<StubBloc>(ScopeKey::Default).await.unwrap();

    released_early.release();
    released_early.release();
    drop(released_early);

    // Only one release was counted; `holder` still keeps it alive.
    assert_eq!(scope.lease_count::<StubBloc>(ScopeKey::Default), Some(1));
    assert!(scope.is_live::<StubBloc>(ScopeKey::Default));
    drop(holder);
}

#[tokio::test]
async fn lease_during_slow_close_awaits_it_and_never_overlaps() {
    let scope = new_scope();
    let counters = Counters::default();
    scope
        .register(
            Lifecycle::Leased,
            ScopeKey::Default,
            counters.factory(Duration::from_millis(50)),
        )
        .unwrap();

    let lease = scope.lease::<StubBloc>(ScopeKey::Default).await.unwrap();
    drop(lease); // starts a 50ms close

    // Re-leasing immediately must wait for the in-flight close to finish
    // before constructing; two instances are never live at once.
    let release = scope.lease::<StubBloc>(ScopeKey::Default).await.unwrap();

    assert_eq!(counters.built(), 2);
    assert_eq!(counters.live(), 1);
    drop(release);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_lease_cycles_never_overlap_instances() {
    let scope = new_scope();
    let counters = Counters::default();
    scope
        .register(
            Lifecycle::Leased,
            ScopeKey::Default,
            counters.factory(Duration::from_millis(1)),
        )
        .unwrap();

    let mut cycles = tokio::task::JoinSet::new();
    for _ in 0..16 {
        let scope = scope.clone();
        cycles.spawn(async move {
            for _ in 0..25 {
                let lease = scope.lease::<StubBloc>(ScopeKey::Default).await.unwrap();
                tokio::task::yield_now().await;
                drop(lease);
            }
        });
    }
    while let Some(cycle) = cycles.join_next().await {
        cycle.unwrap();
    }

    until_not_live::<StubBloc>(&scope, ScopeKey::Default).await;
    assert_eq!(counters.live(), 0);
    // However the lease/release/close sequences interleaved, construction
    // never ran while a prior instance was still closing.
    assert_eq!(counters.max_live(), 1);
    assert!(counters.built() >= 1);
}

#[cfg(debug_assertions)]
#[tokio::test]
#[should_panic(expected = "use lease()")]
async fn get_on_a_leased_identity_panics_in_debug() {
    let scope = new_scope();
    let counters = Counters::default();
    scope
        .register(
            Lifecycle::Leased,
            ScopeKey::Default,
            counters.factory(Duration::ZERO),
        )
        .unwrap();

    let _ = scope.get::<StubBloc>(ScopeKey::Default).await;
}

// ---------------------------------------------------------------------------
// Registration and resolution errors
// ---------------------------------------------------------------------------

#[tokio::test]
async fn resolving_an_unregistered_identity_errors() {
    let scope = new_scope();

    let result = scope.get::<StubBloc>(ScopeKey::Default).await;

    assert!(matches!(result, Err(ScopeError::NotRegistered { .. })));
}

#[tokio::test]
async fn duplicate_registration_is_a_conflict() {
    let scope = new_scope();
    let counters = Counters::default();

    scope
        .register(
            Lifecycle::Permanent,
            ScopeKey::Default,
            counters.factory(Duration::ZERO),
        )
        .unwrap();
    let result = scope.register(
        Lifecycle::Permanent,
        ScopeKey::Default,
        counters.factory(Duration::ZERO),
    );

    assert!(matches!(
        result,
        Err(ScopeError::RegistrationConflict { .. })
    ));
}

#[tokio::test]
async fn named_keys_isolate_instances() {
    let scope = new_scope();
    let counters = Counters::default();
    scope
        .register(
            Lifecycle::Permanent,
            ScopeKey::named("left"),
            counters.factory(Duration::ZERO),
        )
        .unwrap();
    scope
        .register(
            Lifecycle::Permanent,
            ScopeKey::named("right"),
            counters.factory(Duration::ZERO),
        )
        .unwrap();

    let _ = scope.get::<StubBloc>(ScopeKey::named("left")).await.unwrap();
    let _ = scope.get::<StubBloc>(ScopeKey::named("right")).await.unwrap();

    assert_eq!(counters.built(), 2);
}

// ---------------------------------------------------------------------------
// Explicit termination
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ending_a_permanent_identity_is_a_noop() {
    let scope = new_scope();
    let counters = Counters::default();
    scope
        .register(
            Lifecycle::Permanent,
            ScopeKey::Default,
            counters.factory(Duration::ZERO),
        )
        .unwrap();
    let _ = scope.get::<StubBloc>(ScopeKey::Default).await.unwrap();

    let ended = scope.end::<StubBloc>(ScopeKey::Default).await.unwrap();

    assert!(!ended);
    assert!(scope.is_live::<StubBloc>(ScopeKey::Default));
}

#[tokio::test]
async fn ending_a_feature_identity_closes_it() {
    let scope = new_scope();
    let counters = Counters::default();
    scope
        .register(
            Lifecycle::Feature,
            ScopeKey::Default,
            counters.factory(Duration::ZERO),
        )
        .unwrap();
    let _ = scope.get::<StubBloc>(ScopeKey::Default).await.unwrap();

    let ended = scope.end::<StubBloc>(ScopeKey::Default).await.unwrap();

    assert!(ended);
    assert!(!scope.is_live::<StubBloc>(ScopeKey::Default));
    assert_eq!(counters.live(), 0);
}

// ---------------------------------------------------------------------------
// Feature scopes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn feature_scope_end_closes_everything_and_is_idempotent() {
    let scope = new_scope();
    let feature = FeatureScope::new(&scope);
    let counters = Counters::default();
    feature
        .register(Lifecycle::Feature, counters.factory(Duration::ZERO))
        .unwrap();
    let _ = feature.get::<StubBloc>().await.unwrap();

    let first = feature.end(Duration::from_secs(1)).await;
    let second = feature.end(Duration::from_secs(1)).await;

    assert!(first.completed);
    assert_eq!(first.task_count, 1);
    assert_eq!(first, second);
    assert_eq!(counters.live(), 0);
}

#[tokio::test]
async fn ended_feature_scope_rejects_registration_and_resolution() {
    let scope = new_scope();
    let feature = FeatureScope::new(&scope);
    let counters = Counters::default();
    feature.end(Duration::from_secs(1)).await;

    let register = feature.register(Lifecycle::Feature, counters.factory(Duration::ZERO));
    assert!(matches!(register, Err(ScopeError::ScopeEnded)));

    let resolve = feature.get::<StubBloc>().await;
    assert!(matches!(resolve, Err(ScopeError::ScopeEnded)));
}

#[tokio::test]
async fn feature_scopes_do_not_see_each_other() {
    let scope = new_scope();
    let left = FeatureScope::new(&scope);
    let right = FeatureScope::new(&scope);
    let counters = Counters::default();

    left.register(Lifecycle::Feature, counters.factory(Duration::ZERO))
        .unwrap();
    right
        .register(Lifecycle::Feature, counters.factory(Duration::ZERO))
        .unwrap();
    let _ = left.get::<StubBloc>().await.unwrap();
    let _ = right.get::<StubBloc>().await.unwrap();

    left.end(Duration::from_secs(1)).await;

    assert!(!scope.is_live::<StubBloc>(left.key()));
    assert!(scope.is_live::<StubBloc>(right.key()));
}

// ---------------------------------------------------------------------------
// Whole-scope shutdown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn end_all_closes_everything_in_parallel() {
    let scope = new_scope();
    let counters = Counters::default();
    scope
        .register(
            Lifecycle::Permanent,
            ScopeKey::named("a"),
            counters.factory(Duration::from_millis(20)),
        )
        .unwrap();
    scope
        .register(
            Lifecycle::Permanent,
            ScopeKey::named("b"),
            counters.factory(Duration::from_millis(20)),
        )
        .unwrap();
    let _ = scope.get::<StubBloc>(ScopeKey::named("a")).await.unwrap();
    let _ = scope.get::<StubBloc>(ScopeKey::named("b")).await.unwrap();

    let report = scope.end_all(Duration::from_secs(1)).await;

    assert!(report.outcome.completed);
    assert_eq!(report.outcome.task_count, 2);
    assert!(report.leaks.is_empty());
    assert_eq!(counters.live(), 0);
}

#[tokio::test]
async fn end_all_reports_held_leases_and_unended_features() {
    let scope = new_scope();
    let counters = Counters::default();
    scope
        .register(
            Lifecycle::Leased,
            ScopeKey::named("held"),
            counters.factory(Duration::ZERO),
        )
        .unwrap();
    scope
        .register(
            Lifecycle::Feature,
            ScopeKey::named("flow"),
            counters.factory(Duration::ZERO),
        )
        .unwrap();

    let lease = scope.lease::<StubBloc>(ScopeKey::named("held")).await.unwrap();
    let _ = scope.get::<StubBloc>(ScopeKey::named("flow")).await.unwrap();
    // Simulate a caller that never releases.
    std::mem::forget(lease);

    let report = scope.end_all(Duration::from_secs(1)).await;

    assert_eq!(report.leaks.len(), 2);
    assert!(report.leaks.iter().any(|leak| {
        leak.identity.contains("held") && leak.kind == LeakKind::LeasedStillHeld { leases: 1 }
    }));
    assert!(
        report
            .leaks
            .iter()
            .any(|leak| leak.identity.contains("flow") && leak.kind == LeakKind::FeatureNotEnded)
    );
    // Leaked or not, everything was closed.
    assert_eq!(counters.live(), 0);
}

#[tokio::test]
async fn scope_ending_listeners_join_the_cleanup_barrier() {
    let scope = new_scope();
    let counters = Counters::default();
    scope
        .register(
            Lifecycle::Permanent,
            ScopeKey::Default,
            counters.factory(Duration::ZERO),
        )
        .unwrap();
    let _ = scope.get::<StubBloc>(ScopeKey::Default).await.unwrap();

    let flushed = Arc::new(AtomicUsize::new(0));
    let flushed_clone = Arc::clone(&flushed);
    scope.on_scope_ending(move |ending| {
        let flushed = Arc::clone(&flushed_clone);
        // Registration happens synchronously inside the callback.
        ending.barrier.add(async move {
            flushed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    });

    let report = scope.end_all(Duration::from_secs(1)).await;

    assert_eq!(flushed.load(Ordering::SeqCst), 1);
    // One bloc close plus one subscriber cleanup task.
    assert_eq!(report.outcome.task_count, 2);
}
