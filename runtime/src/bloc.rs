//! Bloc composition: one state stream, one dispatch pipeline, one
//! navigation registry, assembled behind a cheaply clonable handle.
//!
//! A [`Bloc`] owns a [`StatusEmitter`] for its state stream, an
//! [`EventDispatcher`] routing events to registered use cases, and an
//! [`AviatorManager`] for navigation intents. Use cases never see the bloc
//! itself — each dispatch hands them a context scoped to the triggering
//! event, so every emission automatically unions the event's rebuild-group
//! tags.
//!
//! Closing follows a three-phase protocol (`Open → Closing → Closed`):
//! exactly one caller performs the drain, concurrent callers await the
//! same completion, and every caller returns only once the bloc is fully
//! closed.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};

use juice_core::{Event, RebuildGroups, StreamStatus, UseCaseBuilder, UseCaseContext, UseCaseError};

use crate::aviator::{Aviator, AviatorManager};
use crate::dispatch::{ErrorCallback, EventDispatcher, UnhandledCallback, UseCaseRegistry};
use crate::emitter::StatusEmitter;
use crate::error::BlocError;
use crate::retry::{RetryPolicy, RetryingUseCaseBuilder};
use crate::scope::ManagedBloc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Closing,
    Closed,
}

struct BlocInner<S, E>
where
    S: Clone + Send + Sync + 'static,
    E: Event,
{
    name: String,
    emitter: StatusEmitter<S, E>,
    dispatcher: EventDispatcher<S, E>,
    aviators: AviatorManager,
    phase: watch::Sender<Phase>,
}

/// A unit of business logic: state stream + event pipeline + navigation.
///
/// Clones share the same underlying bloc.
pub struct Bloc<S, E>
where
    S: Clone + Send + Sync + 'static,
    E: Event,
{
    inner: Arc<BlocInner<S, E>>,
}

impl<S, E> Clone for Bloc<S, E>
where
    S: Clone + Send + Sync + 'static,
    E: Event,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S, E> Bloc<S, E>
where
    S: Clone + Send + Sync + 'static,
    E: Event,
{
    /// Start assembling a bloc with `initial_state`.
    #[must_use]
    pub fn builder(initial_state: S) -> BlocBuilder<S, E> {
        BlocBuilder::new(initial_state)
    }

    /// The configured diagnostic name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Route `event` to its registered use case and await the handler.
    ///
    /// An uncaught use-case error (other than
    /// [`UseCaseError::Cancelled`], whose `Canceling` status the retry
    /// loop already emitted) is converted into a terminal `Failure` status
    /// on the stream before being returned.
    ///
    /// # Errors
    ///
    /// - [`BlocError::Closed`] once closing has begun.
    /// - [`BlocError::UnhandledEvent`] when no handler is registered and no
    ///   unhandled callback is configured.
    /// - [`BlocError::UseCase`] when the handler fails.
    #[tracing::instrument(skip(self, event), fields(bloc = %self.inner.name))]
    pub async fn send(&self, event: E) -> Result<(), BlocError> {
        if *self.inner.phase.borrow() != Phase::Open {
            tracing::debug!("Event rejected, bloc is closed");
            return Err(BlocError::Closed);
        }

        let ctx: Arc<dyn UseCaseContext<S, E>> = Arc::new(ExecutionContext {
            inner: Arc::clone(&self.inner),
            event: event.clone(),
        });

        match self.inner.dispatcher.dispatch(event.clone(), ctx).await {
            Ok(()) => Ok(()),
            Err(BlocError::UseCase(error)) => {
                if error != UseCaseError::Cancelled {
                    let emitted = self.inner.emitter.emit_failure(
                        Some(&event),
                        None,
                        RebuildGroups::new(),
                        error.clone(),
                    );
                    if let Err(emit_error) = emitted {
                        tracing::debug!(
                            error = %emit_error,
                            "Failure status could not be emitted"
                        );
                    }
                }
                Err(BlocError::UseCase(error))
            }
            Err(other) => Err(other),
        }
    }

    /// Swap the state wholesale, bypassing the use-case pipeline.
    ///
    /// Emits a plain `Updating` status with no triggering event. Meant for
    /// state restoration and tests, not for business logic.
    ///
    /// # Errors
    ///
    /// [`BlocError::Closed`] once closing has begun; [`BlocError::Emit`] if
    /// `groups` violates the wildcard rule.
    pub fn replace_state(&self, new_state: S, groups: RebuildGroups) -> Result<(), BlocError> {
        if *self.inner.phase.borrow() != Phase::Open {
            return Err(BlocError::Closed);
        }
        self.inner
            .emitter
            .emit_update(None, Some(new_state), groups)
            .map_err(BlocError::from_emit)
    }

    /// The current state.
    #[must_use]
    pub fn state(&self) -> S {
        self.inner.emitter.state()
    }

    /// The state prior to the most recent emission.
    #[must_use]
    pub fn old_state(&self) -> S {
        self.inner.emitter.old_state()
    }

    /// Clone the most recent status envelope.
    #[must_use]
    pub fn current_status(&self) -> StreamStatus<S, E> {
        self.inner.emitter.current()
    }

    /// Subscribe to future status envelopes.
    ///
    /// After [`Bloc::close`], receivers drain any statuses already
    /// published and then observe
    /// [`broadcast::error::RecvError::Closed`].
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StreamStatus<S, E>> {
        self.inner.emitter.subscribe()
    }

    /// Register `aviator` under `name` (last-write-wins).
    pub fn register_aviator(&self, name: impl Into<String>, aviator: Arc<dyn Aviator>) {
        self.inner.aviators.register(name, aviator);
    }

    /// Whether closing has begun.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.inner.phase.borrow() != Phase::Open
    }

    /// Drain and shut down: use-case builders first, then aviators, then
    /// the state stream.
    ///
    /// Idempotent and race-safe: one caller drains, every concurrent and
    /// repeat caller awaits the same completion.
    #[tracing::instrument(skip(self), fields(bloc = %self.inner.name))]
    pub async fn close(&self) {
        let winner = self.inner.phase.send_if_modified(|phase| {
            if *phase == Phase::Open {
                *phase = Phase::Closing;
                true
            } else {
                false
            }
        });

        if !winner {
            let mut phase = self.inner.phase.subscribe();
            while *phase.borrow_and_update() != Phase::Closed {
                if phase.changed().await.is_err() {
                    break;
                }
            }
            return;
        }

        tracing::debug!("Closing bloc");
        self.inner.dispatcher.close_all().await;
        self.inner.aviators.close_all().await;
        self.inner.emitter.close();
        self.inner.phase.send_replace(Phase::Closed);
        metrics::counter!("juice.blocs.closed").increment(1);
        tracing::debug!("Bloc closed");
    }
}

#[async_trait]
impl<S, E> ManagedBloc for Bloc<S, E>
where
    S: Clone + Send + Sync + 'static,
    E: Event,
{
    async fn close(&self) {
        Self::close(self).await;
    }
}

impl<S, E> std::fmt::Debug for Bloc<S, E>
where
    S: Clone + Send + Sync + 'static,
    E: Event,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bloc")
            .field("name", &self.inner.name)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Per-dispatch context: the whole surface a use case may touch.
///
/// Holds the triggering event so every emission unions the event's own
/// rebuild-group tags.
struct ExecutionContext<S, E>
where
    S: Clone + Send + Sync + 'static,
    E: Event,
{
    inner: Arc<BlocInner<S, E>>,
    event: E,
}

impl<S, E> UseCaseContext<S, E> for ExecutionContext<S, E>
where
    S: Clone + Send + Sync + 'static,
    E: Event,
{
    fn state(&self) -> S {
        self.inner.emitter.state()
    }

    fn old_state(&self) -> S {
        self.inner.emitter.old_state()
    }

    fn emit_update(
        &self,
        new_state: Option<S>,
        groups: RebuildGroups,
    ) -> Result<(), juice_core::EmitError> {
        self.inner
            .emitter
            .emit_update(Some(&self.event), new_state, groups)
    }

    fn emit_waiting(
        &self,
        new_state: Option<S>,
        groups: RebuildGroups,
    ) -> Result<(), juice_core::EmitError> {
        self.inner
            .emitter
            .emit_waiting(Some(&self.event), new_state, groups)
    }

    fn emit_failure(
        &self,
        new_state: Option<S>,
        groups: RebuildGroups,
        error: UseCaseError,
    ) -> Result<(), juice_core::EmitError> {
        self.inner
            .emitter
            .emit_failure(Some(&self.event), new_state, groups, error)
    }

    fn emit_cancel(
        &self,
        new_state: Option<S>,
        groups: RebuildGroups,
    ) -> Result<(), juice_core::EmitError> {
        self.inner
            .emitter
            .emit_cancel(Some(&self.event), new_state, groups)
    }

    fn send(&self, event: E) {
        let bloc = Bloc {
            inner: Arc::clone(&self.inner),
        };
        tokio::spawn(async move {
            if let Err(error) = bloc.send(event).await {
                // The failure already surfaced on the stream; just trace it.
                tracing::debug!(error = %error, "Follow-up event failed");
            }
        });
    }

    fn navigate(&self, name: &str, args: serde_json::Value) {
        self.inner.aviators.navigate(name, args);
    }
}

/// Assembles a [`Bloc`]: initial state, use cases, aviators, callbacks.
pub struct BlocBuilder<S, E>
where
    S: Clone + Send + Sync + 'static,
    E: Event,
{
    name: String,
    initial_state: S,
    registry: UseCaseRegistry<S, E>,
    aviators: AviatorManager,
    unhandled: Option<UnhandledCallback<E>>,
    on_error: Option<ErrorCallback>,
}

impl<S, E> BlocBuilder<S, E>
where
    S: Clone + Send + Sync + 'static,
    E: Event,
{
    /// A builder seeded with `initial_state`.
    #[must_use]
    pub fn new(initial_state: S) -> Self {
        Self {
            name: std::any::type_name::<S>().to_owned(),
            initial_state,
            registry: UseCaseRegistry::new(),
            aviators: AviatorManager::new(),
            unhandled: None,
            on_error: None,
        }
    }

    /// Diagnostic name used in spans and logs.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Register a use-case builder for the discriminant it reports.
    ///
    /// # Errors
    ///
    /// [`BlocError::DuplicateUseCase`] if the discriminant already has a
    /// handler.
    pub fn with_use_case(
        self,
        builder: impl UseCaseBuilder<S, E> + 'static,
    ) -> Result<Self, BlocError> {
        self.registry.register(Arc::new(builder))?;
        Ok(self)
    }

    /// Register a use-case builder decorated with retry behavior.
    ///
    /// # Errors
    ///
    /// Same as [`BlocBuilder::with_use_case`].
    pub fn with_retrying_use_case(
        self,
        builder: impl UseCaseBuilder<S, E> + 'static,
        policy: RetryPolicy,
    ) -> Result<Self, BlocError> {
        let decorated = RetryingUseCaseBuilder::new(Arc::new(builder), policy);
        self.with_use_case(decorated)
    }

    /// Register an aviator under `name` (last-write-wins).
    #[must_use]
    pub fn with_aviator(self, name: impl Into<String>, aviator: Arc<dyn Aviator>) -> Self {
        self.aviators.register(name, aviator);
        self
    }

    /// Invoke `callback` instead of failing when an event has no handler.
    #[must_use]
    pub fn on_unhandled<F>(mut self, callback: F) -> Self
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.unhandled = Some(Arc::new(callback));
        self
    }

    /// Invoke `callback` with every uncaught use-case error.
    #[must_use]
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&UseCaseError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }

    /// Assemble the bloc.
    #[must_use]
    pub fn build(self) -> Bloc<S, E> {
        let (phase, _) = watch::channel(Phase::Open);
        Bloc {
            inner: Arc::new(BlocInner {
                name: self.name,
                emitter: StatusEmitter::new(self.initial_state),
                dispatcher: EventDispatcher::new(self.registry, self.unhandled, self.on_error),
                aviators: self.aviators,
                phase,
            }),
        }
    }
}
