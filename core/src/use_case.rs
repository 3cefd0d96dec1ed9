//! Use-case traits and the execution context surface.
//!
//! A use case is a single-purpose handler for one event discriminant. The
//! runtime builds a fresh instance per dispatched event and passes it an
//! immutable [`UseCaseContext`]: the entire surface a use case may use to
//! affect the system. Use cases never reach into registries directly.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::{EmitError, UseCaseError};
use crate::event::Event;
use crate::groups::RebuildGroups;

/// The execution surface handed to every use case.
///
/// State accessors re-fetch the current value on every call. Values read
/// before an `await` may be stale by the time the use case resumes —
/// always re-read after suspension points.
///
/// The four emit functions are the sole path by which a state transition
/// becomes observable. Each takes an optional replacement state (`None`
/// keeps the current state) and a set of rebuild-group tags that is
/// unioned with the triggering event's own tags.
pub trait UseCaseContext<S, E>: Send + Sync
where
    S: Clone + Send + Sync + 'static,
    E: Event,
{
    /// The current state (re-fetched on every call).
    fn state(&self) -> S;

    /// The state prior to the most recent emission.
    fn old_state(&self) -> S;

    /// Publish an `Updating` status.
    ///
    /// # Errors
    ///
    /// Returns [`EmitError::Closed`] after the bloc's stream has closed, or
    /// [`EmitError::Groups`] if the merged groups violate the wildcard rule.
    fn emit_update(&self, new_state: Option<S>, groups: RebuildGroups) -> Result<(), EmitError>;

    /// Publish a `Waiting` status.
    ///
    /// # Errors
    ///
    /// Same conditions as [`UseCaseContext::emit_update`].
    fn emit_waiting(&self, new_state: Option<S>, groups: RebuildGroups) -> Result<(), EmitError>;

    /// Publish a `Failure` status carrying `error`.
    ///
    /// # Errors
    ///
    /// Same conditions as [`UseCaseContext::emit_update`].
    fn emit_failure(
        &self,
        new_state: Option<S>,
        groups: RebuildGroups,
        error: UseCaseError,
    ) -> Result<(), EmitError>;

    /// Publish a `Canceling` status.
    ///
    /// # Errors
    ///
    /// Same conditions as [`UseCaseContext::emit_update`].
    fn emit_cancel(&self, new_state: Option<S>, groups: RebuildGroups) -> Result<(), EmitError>;

    /// Send a follow-up event through the owning bloc (fire-and-forget).
    ///
    /// Dispatch failures of the follow-up surface on the bloc's stream as
    /// `Failure` statuses, not here.
    fn send(&self, event: E);

    /// Dispatch a named navigation intent (fire-and-forget).
    ///
    /// A no-op if no aviator is registered under `name`.
    fn navigate(&self, name: &str, args: serde_json::Value);
}

/// A single-purpose handler for one event discriminant.
#[async_trait]
pub trait UseCase<S, E>: Send + Sync
where
    S: Clone + Send + Sync + 'static,
    E: Event,
{
    /// Handle one dispatched event.
    ///
    /// # Errors
    ///
    /// Business-logic failures are returned as [`UseCaseError`]; the
    /// composition root converts them into a `Failure` status.
    async fn execute(
        &self,
        ctx: Arc<dyn UseCaseContext<S, E>>,
        event: E,
    ) -> Result<(), UseCaseError>;
}

/// A factory for use cases, registered per event discriminant.
///
/// The builder outlives individual events: `build` is called once per
/// dispatched event, and `close` is awaited when the owning bloc shuts
/// down.
#[async_trait]
pub trait UseCaseBuilder<S, E>: Send + Sync
where
    S: Clone + Send + Sync + 'static,
    E: Event,
{
    /// The event discriminant this builder handles.
    fn kind(&self) -> E::Kind;

    /// Construct a fresh use case for one dispatched event.
    fn build(&self) -> Box<dyn UseCase<S, E>>;

    /// Shutdown hook awaited during bloc close. Default: no-op.
    async fn close(&self) {}
}

/// Future type produced by closure-backed use cases.
pub type UseCaseFuture = BoxFuture<'static, Result<(), UseCaseError>>;

/// Register a closure as the use case for `kind`.
///
/// Shorthand for trivial handlers that do not warrant a named type:
///
/// ```ignore
/// builder.with_use_case(use_case_fn(CounterEventKind::Increment, |ctx, _event| {
///     Box::pin(async move {
///         let next = ctx.state() + 1;
///         ctx.emit_update(Some(next), RebuildGroups::new())?;
///         Ok(())
///     })
/// }));
/// ```
pub fn use_case_fn<S, E, F>(kind: E::Kind, f: F) -> FnUseCaseBuilder<S, E, F>
where
    S: Clone + Send + Sync + 'static,
    E: Event,
    F: Fn(Arc<dyn UseCaseContext<S, E>>, E) -> UseCaseFuture + Send + Sync + 'static,
{
    FnUseCaseBuilder {
        kind,
        f: Arc::new(f),
        _marker: PhantomData,
    }
}

/// A [`UseCaseBuilder`] backed by a closure. Built by [`use_case_fn`].
pub struct FnUseCaseBuilder<S, E, F>
where
    E: Event,
{
    kind: E::Kind,
    f: Arc<F>,
    _marker: PhantomData<fn(S)>,
}

#[async_trait]
impl<S, E, F> UseCaseBuilder<S, E> for FnUseCaseBuilder<S, E, F>
where
    S: Clone + Send + Sync + 'static,
    E: Event,
    F: Fn(Arc<dyn UseCaseContext<S, E>>, E) -> UseCaseFuture + Send + Sync + 'static,
{
    fn kind(&self) -> E::Kind {
        self.kind
    }

    fn build(&self) -> Box<dyn UseCase<S, E>> {
        Box::new(FnUseCase {
            f: Arc::clone(&self.f),
            _marker: PhantomData,
        })
    }
}

struct FnUseCase<S, E, F> {
    f: Arc<F>,
    _marker: PhantomData<fn(S, E)>,
}

#[async_trait]
impl<S, E, F> UseCase<S, E> for FnUseCase<S, E, F>
where
    S: Clone + Send + Sync + 'static,
    E: Event,
    F: Fn(Arc<dyn UseCaseContext<S, E>>, E) -> UseCaseFuture + Send + Sync + 'static,
{
    async fn execute(
        &self,
        ctx: Arc<dyn UseCaseContext<S, E>>,
        event: E,
    ) -> Result<(), UseCaseError> {
        (self.f)(ctx, event).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Clone, Debug, PartialEq, Eq)]
    struct Echo(&'static str);

    impl Event for Echo {
        type Kind = ();

        fn kind(&self) {}
    }

    /// Records every emitted state instead of publishing it.
    #[derive(Default)]
    struct Recorder {
        states: Mutex<Vec<String>>,
    }

    impl UseCaseContext<String, Echo> for Recorder {
        fn state(&self) -> String {
            self.states.lock().unwrap().last().cloned().unwrap_or_default()
        }
        fn old_state(&self) -> String {
            String::new()
        }
        fn emit_update(
            &self,
            new_state: Option<String>,
            _groups: RebuildGroups,
        ) -> Result<(), EmitError> {
            if let Some(state) = new_state {
                self.states.lock().unwrap().push(state);
            }
            Ok(())
        }
        fn emit_waiting(
            &self,
            _new_state: Option<String>,
            _groups: RebuildGroups,
        ) -> Result<(), EmitError> {
            Ok(())
        }
        fn emit_failure(
            &self,
            _new_state: Option<String>,
            _groups: RebuildGroups,
            _error: UseCaseError,
        ) -> Result<(), EmitError> {
            Ok(())
        }
        fn emit_cancel(
            &self,
            _new_state: Option<String>,
            _groups: RebuildGroups,
        ) -> Result<(), EmitError> {
            Ok(())
        }
        fn send(&self, _event: Echo) {}
        fn navigate(&self, _name: &str, _args: serde_json::Value) {}
    }

    #[tokio::test]
    async fn closure_use_cases_build_fresh_and_execute() {
        let builder = use_case_fn((), |ctx: Arc<dyn UseCaseContext<String, Echo>>, event| {
            Box::pin(async move {
                ctx.emit_update(Some(event.0.to_owned()), RebuildGroups::new())?;
                Ok(())
            })
        });

        let recorder = Arc::new(Recorder::default());
        let ctx: Arc<dyn UseCaseContext<String, Echo>> = Arc::clone(&recorder) as _;

        builder.build().execute(Arc::clone(&ctx), Echo("one")).await.unwrap();
        builder.build().execute(ctx, Echo("two")).await.unwrap();

        let states = recorder.states.lock().unwrap();
        assert_eq!(states.as_slice(), &["one".to_owned(), "two".to_owned()]);
    }

    #[tokio::test]
    async fn emit_errors_convert_to_non_retryable() {
        struct ClosedContext;

        impl UseCaseContext<String, Echo> for ClosedContext {
            fn state(&self) -> String {
                String::new()
            }
            fn old_state(&self) -> String {
                String::new()
            }
            fn emit_update(
                &self,
                _new_state: Option<String>,
                _groups: RebuildGroups,
            ) -> Result<(), EmitError> {
                Err(EmitError::Closed)
            }
            fn emit_waiting(
                &self,
                _new_state: Option<String>,
                _groups: RebuildGroups,
            ) -> Result<(), EmitError> {
                Err(EmitError::Closed)
            }
            fn emit_failure(
                &self,
                _new_state: Option<String>,
                _groups: RebuildGroups,
                _error: UseCaseError,
            ) -> Result<(), EmitError> {
                Err(EmitError::Closed)
            }
            fn emit_cancel(
                &self,
                _new_state: Option<String>,
                _groups: RebuildGroups,
            ) -> Result<(), EmitError> {
                Err(EmitError::Closed)
            }
            fn send(&self, _event: Echo) {}
            fn navigate(&self, _name: &str, _args: serde_json::Value) {}
        }

        let builder = use_case_fn((), |ctx: Arc<dyn UseCaseContext<String, Echo>>, _event| {
            Box::pin(async move {
                ctx.emit_update(Some("ignored".to_owned()), RebuildGroups::new())?;
                Ok(())
            })
        });

        let result = builder
            .build()
            .execute(Arc::new(ClosedContext), Echo("x"))
            .await;

        assert!(matches!(result, Err(UseCaseError::NonRetryable(_))));
        assert!(!result.unwrap_err().is_retryable());
    }
}
