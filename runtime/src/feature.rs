//! Feature scopes: batched lifetime management for one UI flow.
//!
//! A [`FeatureScope`] groups registrations under a unique
//! [`ScopeKey::Feature`] so the whole flow can be terminated with a single
//! bounded call. Ending is idempotent: the first call does the work and
//! records the outcome; later calls return the recorded outcome without
//! re-closing anything.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;

use crate::barrier::CleanupOutcome;
use crate::error::ScopeError;
use crate::scope::{BlocScope, FeatureId, Lease, Lifecycle, ManagedBloc, ScopeKey};

/// A handle over every bloc registered for one feature flow.
pub struct FeatureScope {
    id: FeatureId,
    scope: BlocScope,
    ended: AtomicBool,
    outcome: Mutex<Option<CleanupOutcome>>,
}

impl FeatureScope {
    /// Open a fresh feature scope backed by `scope`.
    #[must_use]
    pub fn new(scope: &BlocScope) -> Self {
        Self {
            id: FeatureId::next(),
            scope: scope.clone(),
            ended: AtomicBool::new(false),
            outcome: Mutex::new(None),
        }
    }

    /// This scope's unique identity.
    #[must_use]
    pub const fn id(&self) -> FeatureId {
        self.id
    }

    /// The scope key under which this feature's blocs are registered.
    #[must_use]
    pub const fn key(&self) -> ScopeKey {
        ScopeKey::Feature(self.id)
    }

    /// Whether [`FeatureScope::end`] has begun.
    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    /// Register a factory for `B` under this feature's key.
    ///
    /// # Errors
    ///
    /// [`ScopeError::ScopeEnded`] once the scope has ended, or any error
    /// from [`BlocScope::register`].
    pub fn register<B, F>(&self, lifecycle: Lifecycle, factory: F) -> Result<(), ScopeError>
    where
        B: ManagedBloc,
        F: Fn() -> B + Send + Sync + 'static,
    {
        if self.is_ended() {
            return Err(ScopeError::ScopeEnded);
        }
        self.scope.register::<B, F>(lifecycle, self.key(), factory)
    }

    /// Resolve `B` under this feature's key.
    ///
    /// # Errors
    ///
    /// [`ScopeError::ScopeEnded`] once the scope has ended, or any error
    /// from [`BlocScope::get`].
    pub async fn get<B: ManagedBloc>(&self) -> Result<Arc<B>, ScopeError> {
        if self.is_ended() {
            return Err(ScopeError::ScopeEnded);
        }
        self.scope.get::<B>(self.key()).await
    }

    /// Lease `B` under this feature's key.
    ///
    /// # Errors
    ///
    /// [`ScopeError::ScopeEnded`] once the scope has ended, or any error
    /// from [`BlocScope::lease`].
    pub async fn lease<B: ManagedBloc>(&self) -> Result<Lease<B>, ScopeError> {
        if self.is_ended() {
            return Err(ScopeError::ScopeEnded);
        }
        self.scope.lease::<B>(self.key()).await
    }

    /// Terminate every bloc registered under this feature's key, bounded by
    /// `timeout`.
    ///
    /// Idempotent: concurrent and repeat callers all receive the outcome of
    /// the single close that actually ran.
    pub async fn end(&self, timeout: Duration) -> CleanupOutcome {
        let mut recorded = self.outcome.lock().await;
        if let Some(outcome) = *recorded {
            return outcome;
        }

        self.ended.store(true, Ordering::Release);
        tracing::debug!(feature = ?self.id, "Ending feature scope");
        let outcome = self.scope.end_feature_key(self.id, timeout).await;
        *recorded = Some(outcome);
        outcome
    }
}

impl std::fmt::Debug for FeatureScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureScope")
            .field("id", &self.id)
            .field("ended", &self.is_ended())
            .finish_non_exhaustive()
    }
}
