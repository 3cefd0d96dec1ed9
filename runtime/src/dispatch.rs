//! Event dispatch pipeline: registry, dispatcher, and executor.
//!
//! The registry is the point of truth for which event kinds a bloc
//! understands: exactly one use-case builder per discriminant. The
//! dispatcher resolves an incoming event's kind to its builder and hands it
//! to the executor, which builds a fresh use case, runs it inside a traced
//! span, and reports failures through the configured error callback before
//! returning them to the composition root.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use futures::future::join_all;
use tracing::Instrument;

use juice_core::{Event, UseCaseBuilder, UseCaseContext, UseCaseError};

use crate::error::BlocError;

/// Callback invoked with every uncaught use-case error.
pub type ErrorCallback = Arc<dyn Fn(&UseCaseError) + Send + Sync>;

/// Callback invoked when an event has no registered handler.
pub type UnhandledCallback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Stores use-case builders keyed by the event discriminant each handles.
pub struct UseCaseRegistry<S, E>
where
    S: Clone + Send + Sync + 'static,
    E: Event,
{
    builders: RwLock<HashMap<E::Kind, Arc<dyn UseCaseBuilder<S, E>>>>,
}

impl<S, E> UseCaseRegistry<S, E>
where
    S: Clone + Send + Sync + 'static,
    E: Event,
{
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            builders: RwLock::new(HashMap::new()),
        }
    }

    /// Associate a builder with the discriminant it handles.
    ///
    /// # Errors
    ///
    /// Returns [`BlocError::DuplicateUseCase`] if a builder is already
    /// registered for the same discriminant.
    pub fn register(&self, builder: Arc<dyn UseCaseBuilder<S, E>>) -> Result<(), BlocError> {
        let kind = builder.kind();
        let mut builders = self
            .builders
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if builders.contains_key(&kind) {
            return Err(BlocError::DuplicateUseCase(format!("{kind:?}")));
        }
        builders.insert(kind, builder);
        Ok(())
    }

    /// Look up the builder for a discriminant.
    #[must_use]
    pub fn get(&self, kind: E::Kind) -> Option<Arc<dyn UseCaseBuilder<S, E>>> {
        self.builders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
    }

    /// Number of registered builders.
    #[must_use]
    pub fn len(&self) -> usize {
        self.builders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Await every builder's shutdown hook in parallel, then empty the
    /// registry.
    pub async fn close_all(&self) {
        let builders: Vec<_> = {
            let mut map = self
                .builders
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            map.drain().map(|(_, b)| b).collect()
        };

        join_all(builders.iter().map(|b| b.close())).await;
    }
}

impl<S, E> Default for UseCaseRegistry<S, E>
where
    S: Clone + Send + Sync + 'static,
    E: Event,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Routes every event to exactly one registered use case.
pub struct EventDispatcher<S, E>
where
    S: Clone + Send + Sync + 'static,
    E: Event,
{
    registry: UseCaseRegistry<S, E>,
    unhandled: Option<UnhandledCallback<E>>,
    on_error: Option<ErrorCallback>,
}

impl<S, E> EventDispatcher<S, E>
where
    S: Clone + Send + Sync + 'static,
    E: Event,
{
    /// Create a dispatcher over `registry`.
    ///
    /// `unhandled` is invoked instead of failing when an event has no
    /// handler; `on_error` is invoked with every uncaught use-case error
    /// (wrapped in a safety net so a misbehaving callback cannot break the
    /// dispatch loop).
    #[must_use]
    pub fn new(
        registry: UseCaseRegistry<S, E>,
        unhandled: Option<UnhandledCallback<E>>,
        on_error: Option<ErrorCallback>,
    ) -> Self {
        Self {
            registry,
            unhandled,
            on_error,
        }
    }

    /// The underlying registry.
    pub const fn registry(&self) -> &UseCaseRegistry<S, E> {
        &self.registry
    }

    /// Dispatch one event: resolve its handler by discriminant and execute.
    ///
    /// # Errors
    ///
    /// - [`BlocError::UnhandledEvent`] when no handler is registered and no
    ///   unhandled callback is configured.
    /// - [`BlocError::UseCase`] when the use case returns an error; the
    ///   error callback has already run by the time this returns.
    pub async fn dispatch(
        &self,
        event: E,
        ctx: Arc<dyn UseCaseContext<S, E>>,
    ) -> Result<(), BlocError> {
        let kind = event.kind();

        let Some(builder) = self.registry.get(kind) else {
            if let Some(unhandled) = &self.unhandled {
                tracing::debug!(event_kind = ?kind, "No handler registered, invoking unhandled callback");
                unhandled(&event);
                return Ok(());
            }
            tracing::warn!(event_kind = ?kind, "No handler registered for event");
            return Err(BlocError::UnhandledEvent(format!("{kind:?}")));
        };

        match self.execute(&*builder, ctx, event).await {
            Ok(()) => Ok(()),
            Err(error) => {
                self.report(&error);
                Err(BlocError::UseCase(error))
            }
        }
    }

    /// Await every builder's shutdown hook and empty the registry.
    pub async fn close_all(&self) {
        self.registry.close_all().await;
    }

    /// Build a fresh use case for `event` and run it inside a traced span.
    async fn execute(
        &self,
        builder: &dyn UseCaseBuilder<S, E>,
        ctx: Arc<dyn UseCaseContext<S, E>>,
        event: E,
    ) -> Result<(), UseCaseError> {
        let kind = event.kind();
        let use_case = builder.build();
        let use_case_name = std::any::type_name_of_val(&*use_case);

        let span = tracing::debug_span!(
            "use_case_execution",
            use_case = use_case_name,
            event_kind = ?kind,
        );

        metrics::counter!("juice.events.dispatched").increment(1);

        let start = Instant::now();
        let result = use_case.execute(ctx, event).instrument(span).await;
        metrics::histogram!("juice.use_case.duration_seconds").record(start.elapsed().as_secs_f64());

        if let Err(error) = &result {
            metrics::counter!("juice.use_case.failures").increment(1);
            tracing::error!(
                use_case = use_case_name,
                event_kind = ?kind,
                error = %error,
                "Use case failed"
            );
        }

        result
    }

    /// Invoke the configured error callback, guarded so a panicking
    /// callback cannot crash the dispatch loop.
    fn report(&self, error: &UseCaseError) {
        if let Some(on_error) = &self.on_error {
            let guarded = catch_unwind(AssertUnwindSafe(|| on_error(error)));
            if guarded.is_err() {
                tracing::warn!("Error callback panicked; continuing dispatch");
            }
        }
    }
}
