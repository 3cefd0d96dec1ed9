//! Bloc lifecycle and scope resolution.
//!
//! A [`BlocScope`] is a registry mapping `(type, scope key)` identities to
//! lazily constructed bloc instances, with three lifetime policies and a
//! reference-counting lease discipline:
//!
//! - [`Lifecycle::Permanent`]: lives until [`BlocScope::end_all`]; external
//!   end requests are a documented no-op.
//! - [`Lifecycle::Feature`]: terminated explicitly, usually in a batch via
//!   a [`FeatureScope`](crate::feature::FeatureScope).
//! - [`Lifecycle::Leased`]: reference-counted; the last released lease
//!   triggers asynchronous closure.
//!
//! The registry is an explicit, constructible object so tests can own one
//! per run; [`BlocScope::global`] exposes a process-wide default for the
//! application's composition boundary only.
//!
//! # The close-race guard
//!
//! Closing an identity stores a completion channel in its entry *before*
//! the close is awaited. Any `get`/`lease` that observes the channel awaits
//! that exact close — it never starts a second close and never constructs
//! an overlapping instance. Only when the awaited close resolves are the
//! instance and the channel cleared and the lease count reset.
//!
//! # Lock discipline
//!
//! The entry map lives behind a std `Mutex` that is never held across an
//! `await`. Entry lookup+construct is a single critical section, so
//! factories must be plain non-blocking constructors.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::watch;

use crate::barrier::{CleanupBarrier, CleanupOutcome, ScopeEnding};
use crate::error::ScopeError;

/// Lifetime policy chosen at registration time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    /// Lives for the whole process; external end requests are a no-op.
    Permanent,
    /// Terminated explicitly, typically as part of a feature scope.
    Feature,
    /// Reference-counted; closed when the last lease is released.
    Leased,
}

/// Identity of one feature scope. Equal only to itself.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct FeatureId(u64);

impl FeatureId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// The scope half of a bloc identity.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Default)]
pub enum ScopeKey {
    /// The process-global singleton marker (the default when omitted).
    #[default]
    Default,
    /// A caller-chosen name, equal by content.
    Named(Arc<str>),
    /// A feature-scope identity, equal only to itself.
    Feature(FeatureId),
}

impl ScopeKey {
    /// A named key.
    pub fn named(name: impl AsRef<str>) -> Self {
        Self::Named(Arc::from(name.as_ref()))
    }
}

/// `(type, scope key)` — the unit of lifetime management.
///
/// The same identity resolves to at most one live instance at a time.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct BlocIdentity {
    type_id: TypeId,
    type_name: &'static str,
    key: ScopeKey,
}

impl BlocIdentity {
    fn of<B: 'static>(key: ScopeKey) -> Self {
        Self {
            type_id: TypeId::of::<B>(),
            type_name: type_name::<B>(),
            key,
        }
    }

    /// The scope key half of this identity.
    pub const fn key(&self) -> &ScopeKey {
        &self.key
    }

    /// The bloc type name (for diagnostics).
    pub const fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl fmt::Debug for BlocIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:?}", self.type_name, self.key)
    }
}

/// A bloc the scope can close on the caller's behalf.
///
/// Implemented by `Bloc`; test doubles implement it directly.
#[async_trait]
pub trait ManagedBloc: Send + Sync + 'static {
    /// Drain and shut down this instance. Must be idempotent.
    async fn close(&self);
}

/// Type-erased live instance: one `Arc` for downcasting, one for closing.
#[derive(Clone)]
struct StoredBloc {
    any: Arc<dyn Any + Send + Sync>,
    handle: Arc<dyn ManagedBloc>,
}

impl StoredBloc {
    fn new<B: ManagedBloc>(bloc: Arc<B>) -> Self {
        Self {
            any: Arc::clone(&bloc) as Arc<dyn Any + Send + Sync>,
            handle: bloc,
        }
    }
}

struct Entry {
    factory: Box<dyn Fn() -> StoredBloc + Send + Sync>,
    lifecycle: Lifecycle,
    instance: Option<StoredBloc>,
    leases: u32,
    /// Present iff a close is in flight. Resolves to `true` on completion.
    closing: Option<watch::Receiver<bool>>,
}

struct ScopeInner {
    entries: Mutex<HashMap<BlocIdentity, Entry>>,
    listeners: Mutex<Vec<Box<dyn Fn(&ScopeEnding) + Send + Sync>>>,
}

/// A leak found during [`BlocScope::end_all`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeakReport {
    /// Diagnostic rendering of the leaking identity.
    pub identity: String,
    /// What discipline was violated.
    pub kind: LeakKind,
}

/// The kind of lifetime-discipline leak detected at shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeakKind {
    /// A leased identity reached shutdown with leases still held.
    LeasedStillHeld {
        /// Outstanding lease count.
        leases: u32,
    },
    /// A feature identity was still instantiated without an explicit end.
    FeatureNotEnded,
}

/// Result of [`BlocScope::end_all`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeShutdownReport {
    /// The cleanup-barrier outcome of the parallel close.
    pub outcome: CleanupOutcome,
    /// Lifetime-discipline violations found before closing.
    pub leaks: Vec<LeakReport>,
}

/// Process-wide (or per-test) registry of bloc lifetimes.
#[derive(Clone, Default)]
pub struct BlocScope {
    inner: Arc<ScopeInner>,
}

impl Default for ScopeInner {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
        }
    }
}

impl BlocScope {
    /// A fresh, empty scope.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide default scope.
    ///
    /// Reach for this only at the application's composition boundary;
    /// internal components take a [`BlocScope`] value.
    #[must_use]
    pub fn global() -> &'static Self {
        static GLOBAL: OnceLock<BlocScope> = OnceLock::new();
        GLOBAL.get_or_init(Self::new)
    }

    /// Register a factory for `(B, key)` with the given lifetime policy.
    ///
    /// # Errors
    ///
    /// Returns [`ScopeError::RegistrationConflict`] if the identity is
    /// already registered. Factories are opaque closures that cannot be
    /// compared, so every duplicate registration is treated as a conflict.
    pub fn register<B, F>(
        &self,
        lifecycle: Lifecycle,
        key: ScopeKey,
        factory: F,
    ) -> Result<(), ScopeError>
    where
        B: ManagedBloc,
        F: Fn() -> B + Send + Sync + 'static,
    {
        let identity = BlocIdentity::of::<B>(key);
        let mut entries = self
            .inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if entries.contains_key(&identity) {
            return Err(ScopeError::RegistrationConflict {
                identity: format!("{identity:?}"),
            });
        }

        tracing::debug!(identity = ?identity, lifecycle = ?lifecycle, "Registered bloc identity");
        entries.insert(
            identity,
            Entry {
                factory: Box::new(move || StoredBloc::new(Arc::new(factory()))),
                lifecycle,
                instance: None,
                leases: 0,
                closing: None,
            },
        );
        Ok(())
    }

    /// Resolve the live instance for `(B, key)`, constructing it lazily.
    ///
    /// Calling `get` on a [`Lifecycle::Leased`] identity bypasses reference
    /// counting and is a usage error: it panics in debug builds and is
    /// tolerated with a warning in release builds.
    ///
    /// # Errors
    ///
    /// [`ScopeError::NotRegistered`] if nothing is registered under the
    /// identity.
    ///
    /// # Panics
    ///
    /// In debug builds, when called on a `Leased` identity.
    pub async fn get<B: ManagedBloc>(&self, key: ScopeKey) -> Result<Arc<B>, ScopeError> {
        let identity = BlocIdentity::of::<B>(key);
        self.resolve::<B>(&identity, false).await
    }

    /// Acquire a reference-counted lease on `(B, key)`.
    ///
    /// If the identity is currently closing, awaits that exact close to
    /// completion first, then constructs a fresh instance. The returned
    /// [`Lease`] releases on drop; for `Leased` identities the last release
    /// triggers asynchronous closure.
    ///
    /// # Errors
    ///
    /// [`ScopeError::NotRegistered`] if nothing is registered under the
    /// identity.
    pub async fn lease<B: ManagedBloc>(&self, key: ScopeKey) -> Result<Lease<B>, ScopeError> {
        let identity = BlocIdentity::of::<B>(key);
        let bloc = self.resolve::<B>(&identity, true).await?;
        Ok(Lease {
            bloc,
            identity,
            scope: Arc::downgrade(&self.inner),
            released: AtomicBool::new(false),
        })
    }

    /// Explicitly terminate `(B, key)`.
    ///
    /// Returns `Ok(true)` if an instance was closed, `Ok(false)` if there
    /// was nothing live — including the documented no-op on
    /// [`Lifecycle::Permanent`] identities.
    ///
    /// # Errors
    ///
    /// [`ScopeError::NotRegistered`] if nothing is registered under the
    /// identity.
    pub async fn end<B: ManagedBloc>(&self, key: ScopeKey) -> Result<bool, ScopeError> {
        let identity = BlocIdentity::of::<B>(key);
        self.end_identity(&identity).await
    }

    /// Subscribe to scope-ending notifications.
    ///
    /// The callback runs synchronously while the coordinator assembles the
    /// cleanup barrier: any [`CleanupBarrier::add`] must happen inside the
    /// callback itself, before any `await`.
    pub fn on_scope_ending<F>(&self, listener: F)
    where
        F: Fn(&ScopeEnding) + Send + Sync + 'static,
    {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(listener));
    }

    /// Close every live entry in parallel, bounded by `timeout`, and report
    /// lifetime-discipline leaks found on the way out.
    pub async fn end_all(&self, timeout: Duration) -> ScopeShutdownReport {
        let (identities, leaks) = {
            let entries = self
                .inner
                .entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner);

            let mut leaks = Vec::new();
            for (identity, entry) in entries.iter() {
                if entry.instance.is_none() {
                    continue;
                }
                match entry.lifecycle {
                    Lifecycle::Leased if entry.leases > 0 => {
                        tracing::warn!(
                            identity = ?identity,
                            leases = entry.leases,
                            "Leased identity reached shutdown with leases still held"
                        );
                        leaks.push(LeakReport {
                            identity: format!("{identity:?}"),
                            kind: LeakKind::LeasedStillHeld {
                                leases: entry.leases,
                            },
                        });
                    }
                    Lifecycle::Feature => {
                        tracing::warn!(
                            identity = ?identity,
                            "Feature identity still instantiated at shutdown without an explicit end"
                        );
                        leaks.push(LeakReport {
                            identity: format!("{identity:?}"),
                            kind: LeakKind::FeatureNotEnded,
                        });
                    }
                    _ => {}
                }
            }

            (entries.keys().cloned().collect::<Vec<_>>(), leaks)
        };

        let outcome = self.end_batch(&identities, timeout, true).await;
        ScopeShutdownReport { outcome, leaks }
    }

    /// Terminate every identity registered under a feature key.
    pub(crate) async fn end_feature_key(
        &self,
        id: FeatureId,
        timeout: Duration,
    ) -> CleanupOutcome {
        let identities: Vec<BlocIdentity> = {
            let entries = self
                .inner
                .entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            entries
                .keys()
                .filter(|identity| identity.key == ScopeKey::Feature(id))
                .cloned()
                .collect()
        };

        self.end_batch(&identities, timeout, false).await
    }

    /// Current lease count for `(B, key)`, if registered.
    #[must_use]
    pub fn lease_count<B: ManagedBloc>(&self, key: ScopeKey) -> Option<u32> {
        let identity = BlocIdentity::of::<B>(key);
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&identity)
            .map(|entry| entry.leases)
    }

    /// Whether `(B, key)` currently has a live instance.
    #[must_use]
    pub fn is_live<B: ManagedBloc>(&self, key: ScopeKey) -> bool {
        let identity = BlocIdentity::of::<B>(key);
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&identity)
            .is_some_and(|entry| entry.instance.is_some())
    }

    async fn resolve<B: ManagedBloc>(
        &self,
        identity: &BlocIdentity,
        leasing: bool,
    ) -> Result<Arc<B>, ScopeError> {
        loop {
            // Await any in-flight close outside the lock, then re-inspect.
            if let Some(mut closing) = self.pending_close(identity)? {
                tracing::debug!(identity = ?identity, "Resolution awaiting in-flight close");
                while !*closing.borrow_and_update() {
                    if closing.changed().await.is_err() {
                        break;
                    }
                }
                continue;
            }

            let mut entries = self
                .inner
                .entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let Some(entry) = entries.get_mut(identity) else {
                return Err(ScopeError::NotRegistered {
                    identity: format!("{identity:?}"),
                });
            };
            if entry.closing.is_some() {
                // A close started between the two lock scopes; go around.
                drop(entries);
                continue;
            }

            if !leasing && entry.lifecycle == Lifecycle::Leased {
                discipline_violation(&format!(
                    "get() bypasses reference counting on leased identity {identity:?}; use lease()"
                ));
            }

            if entry.instance.is_none() {
                entry.instance = Some((entry.factory)());
                metrics::counter!("juice.scope.constructions").increment(1);
                tracing::debug!(identity = ?identity, "Constructed bloc instance");
            }
            if leasing {
                entry.leases += 1;
            }

            let Some(stored) = entry.instance.clone() else {
                // Unreachable: constructed above. Treated as a retry.
                drop(entries);
                continue;
            };
            drop(entries);

            return stored
                .any
                .downcast::<B>()
                .map_err(|_| ScopeError::TypeMismatch {
                    identity: format!("{identity:?}"),
                });
        }
    }

    fn pending_close(
        &self,
        identity: &BlocIdentity,
    ) -> Result<Option<watch::Receiver<bool>>, ScopeError> {
        let entries = self
            .inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        entries
            .get(identity)
            .map(|entry| entry.closing.clone())
            .ok_or_else(|| ScopeError::NotRegistered {
                identity: format!("{identity:?}"),
            })
    }

    async fn end_identity(&self, identity: &BlocIdentity) -> Result<bool, ScopeError> {
        enum Plan {
            Nothing,
            AwaitExisting(watch::Receiver<bool>),
            Run(BoxFuture<'static, ()>),
        }

        let plan = {
            let mut entries = self
                .inner
                .entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let Some(entry) = entries.get_mut(identity) else {
                return Err(ScopeError::NotRegistered {
                    identity: format!("{identity:?}"),
                });
            };

            if entry.lifecycle == Lifecycle::Permanent {
                tracing::debug!(identity = ?identity, "end() on a permanent identity is a no-op");
                return Ok(false);
            }

            if let Some(closing) = entry.closing.clone() {
                Plan::AwaitExisting(closing)
            } else if entry.instance.is_none() {
                Plan::Nothing
            } else {
                match Self::begin_close_locked(&self.inner, identity, entry) {
                    Some(close) => Plan::Run(close),
                    None => Plan::Nothing,
                }
            }
        };

        match plan {
            Plan::Nothing => Ok(false),
            Plan::AwaitExisting(mut closing) => {
                while !*closing.borrow_and_update() {
                    if closing.changed().await.is_err() {
                        break;
                    }
                }
                Ok(true)
            }
            Plan::Run(close) => {
                close.await;
                Ok(true)
            }
        }
    }

    /// Close `identities` in parallel through a fresh cleanup barrier.
    ///
    /// Scope-ending listeners are notified synchronously before the wait
    /// begins, per the barrier's ordering contract.
    async fn end_batch(
        &self,
        identities: &[BlocIdentity],
        timeout: Duration,
        include_permanent: bool,
    ) -> CleanupOutcome {
        let barrier = Arc::new(CleanupBarrier::new());

        let ending = ScopeEnding {
            barrier: Arc::clone(&barrier),
        };
        {
            let listeners = self
                .inner
                .listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for listener in listeners.iter() {
                listener(&ending);
            }
        }

        {
            let mut entries = self
                .inner
                .entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for identity in identities {
                let Some(entry) = entries.get_mut(identity) else {
                    continue;
                };
                if !include_permanent && entry.lifecycle == Lifecycle::Permanent {
                    continue;
                }

                if let Some(mut closing) = entry.closing.clone() {
                    barrier.add(async move {
                        while !*closing.borrow_and_update() {
                            if closing.changed().await.is_err() {
                                break;
                            }
                        }
                        Ok(())
                    });
                } else if entry.instance.is_some() {
                    if let Some(close) = Self::begin_close_locked(&self.inner, identity, entry) {
                        barrier.add(async move {
                            close.await;
                            Ok(())
                        });
                    }
                }
            }
        }

        barrier.wait(timeout).await
    }

    /// Start closing an entry. Must be called with the entry map locked.
    ///
    /// Sets the entry's completion channel before returning the close
    /// future, so every concurrent resolution observes the in-flight close.
    fn begin_close_locked(
        inner: &Arc<ScopeInner>,
        identity: &BlocIdentity,
        entry: &mut Entry,
    ) -> Option<BoxFuture<'static, ()>> {
        if entry.closing.is_some() {
            return None;
        }
        let stored = entry.instance.clone()?;

        let (tx, rx) = watch::channel(false);
        entry.closing = Some(rx);

        let inner = Arc::clone(inner);
        let identity = identity.clone();
        Some(Box::pin(async move {
            tracing::debug!(identity = ?identity, "Closing bloc instance");
            stored.handle.close().await;

            {
                let mut entries = inner.entries.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(entry) = entries.get_mut(&identity) {
                    entry.instance = None;
                    entry.closing = None;
                    entry.leases = 0;
                }
            }

            metrics::counter!("juice.scope.closes").increment(1);
            tracing::debug!(identity = ?identity, "Bloc instance closed");
            let _ = tx.send(true);
        }))
    }

    fn release(inner: &Arc<ScopeInner>, identity: &BlocIdentity) {
        let mut entries = inner.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = entries.get_mut(identity) else {
            return;
        };

        if entry.leases == 0 {
            // Clamp at zero; releasing more than acquired is a caller bug.
            discipline_violation(&format!(
                "lease released more times than acquired for {identity:?}"
            ));
            return;
        }
        entry.leases -= 1;
        tracing::trace!(identity = ?identity, leases = entry.leases, "Lease released");

        if entry.leases == 0
            && entry.lifecycle == Lifecycle::Leased
            && entry.instance.is_some()
            && entry.closing.is_none()
        {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    if let Some(close) = Self::begin_close_locked(inner, identity, entry) {
                        handle.spawn(close);
                    }
                }
                Err(_) => {
                    tracing::warn!(
                        identity = ?identity,
                        "Last lease released outside a tokio runtime; close deferred until the next resolution cycle"
                    );
                }
            }
        }
    }
}

/// A reference-counted hold on a scope-managed bloc.
///
/// Dereferences to the bloc. Releasing is idempotent and also happens on
/// drop. Acquire leases on resource-acquisition boundaries and release them
/// on teardown boundaries — never inside a per-frame callback, which would
/// thrash the count and trigger spurious teardown.
pub struct Lease<B: ManagedBloc> {
    bloc: Arc<B>,
    identity: BlocIdentity,
    scope: Weak<ScopeInner>,
    released: AtomicBool,
}

impl<B: ManagedBloc> Lease<B> {
    /// A clone of the held instance handle.
    ///
    /// The clone does not extend the lease; it must not outlive it.
    #[must_use]
    pub fn handle(&self) -> Arc<B> {
        Arc::clone(&self.bloc)
    }

    /// Release this lease. Idempotent: the second call is a no-op.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(inner) = self.scope.upgrade() {
            BlocScope::release(&inner, &self.identity);
        }
    }
}

impl<B: ManagedBloc> Deref for Lease<B> {
    type Target = B;

    fn deref(&self) -> &B {
        &self.bloc
    }
}

impl<B: ManagedBloc> Drop for Lease<B> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<B: ManagedBloc> fmt::Debug for Lease<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("identity", &self.identity)
            .field("released", &self.released.load(Ordering::Acquire))
            .finish()
    }
}

/// Fail fast on programmer mistakes in debug builds; degrade to a warning
/// in release builds, since crashing a live shutdown path is worse than a
/// leaked reference count.
#[allow(clippy::panic)] // intentional fail-fast in debug builds
pub(crate) fn discipline_violation(message: &str) {
    if cfg!(debug_assertions) {
        panic!("{message}");
    }
    tracing::warn!("{message}");
}
