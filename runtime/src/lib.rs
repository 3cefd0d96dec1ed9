//! Juice runtime: the engine behind the `juice-core` abstractions.
//!
//! This crate assembles blocs (state stream + event pipeline + navigation),
//! manages their lifetimes through scopes and leases, and coordinates
//! deterministic asynchronous teardown.
//!
//! # Architecture
//!
//! - [`StateManager`]: a current-value slot plus a broadcast channel; the
//!   storage primitive under every bloc's status stream.
//! - [`StatusEmitter`]: wraps transitions in tagged status envelopes,
//!   validates rebuild groups, and tracks `old_state`.
//! - [`UseCaseRegistry`] / [`EventDispatcher`]: exactly one use-case
//!   builder per event discriminant; dispatch builds a fresh use case per
//!   event and runs it in a traced span.
//! - [`Bloc`] / [`BlocBuilder`]: the composition root handed to callers.
//! - [`AviatorManager`]: named navigation-intent callbacks.
//! - [`BlocScope`] / [`FeatureScope`] / [`Lease`]: lifetime policies with
//!   reference-counted leases and race-safe asynchronous closure.
//! - [`CleanupBarrier`]: bounded, failure-isolated parallel cleanup.
//! - [`RetryingUseCaseBuilder`]: retry decoration with pluggable backoff.
//!
//! # Example
//!
//! ```ignore
//! use juice_core::{RebuildGroups, use_case_fn};
//! use juice_runtime::Bloc;
//!
//! let bloc = Bloc::builder(0u32)
//!     .name("counter")
//!     .with_use_case(use_case_fn(CounterEventKind::Increment, |ctx, _event| {
//!         Box::pin(async move {
//!             let next = ctx.state() + 1;
//!             ctx.emit_update(Some(next), RebuildGroups::new())?;
//!             Ok(())
//!         })
//!     }))?
//!     .build();
//!
//! bloc.send(CounterEvent::Increment).await?;
//! assert_eq!(bloc.state(), 1);
//! bloc.close().await;
//! ```

pub mod aviator;
pub mod barrier;
pub mod bloc;
pub mod dispatch;
pub mod emitter;
pub mod feature;
pub mod retry;
pub mod scope;
pub mod state;

/// Runtime error taxonomy.
pub mod error {
    use juice_core::{EmitError, UseCaseError};

    /// Errors surfaced by the bloc pipeline.
    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum BlocError {
        /// A use-case builder is already registered for this discriminant.
        #[error("a use case is already registered for event kind {0}")]
        DuplicateUseCase(String),

        /// No use-case builder is registered for this discriminant.
        #[error("no use case registered for event kind {0}")]
        UnhandledEvent(String),

        /// The bloc has begun closing; no further events or emissions.
        #[error("bloc is closed")]
        Closed,

        /// The handler returned an error; a `Failure` status has already
        /// been emitted unless the error was a cancellation.
        #[error("use case failed: {0}")]
        UseCase(#[source] UseCaseError),

        /// An emission was rejected (group-rule violation).
        #[error("emission rejected: {0}")]
        Emit(#[source] EmitError),
    }

    impl BlocError {
        /// Map emission errors, folding stream closure into
        /// [`BlocError::Closed`].
        #[must_use]
        pub const fn from_emit(error: EmitError) -> Self {
            match error {
                EmitError::Closed => Self::Closed,
                other => Self::Emit(other),
            }
        }
    }

    /// Errors surfaced by scope registration and resolution.
    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum ScopeError {
        /// Nothing is registered under the requested identity.
        #[error("no bloc registered for {identity}")]
        NotRegistered {
            /// Diagnostic rendering of the identity.
            identity: String,
        },

        /// The identity already has a registration. Factories are opaque,
        /// so every duplicate registration is a conflict.
        #[error("conflicting registration for {identity}")]
        RegistrationConflict {
            /// Diagnostic rendering of the identity.
            identity: String,
        },

        /// The feature scope has already ended.
        #[error("feature scope has ended")]
        ScopeEnded,

        /// The stored instance is not of the requested type.
        #[error("stored bloc for {identity} has a different type")]
        TypeMismatch {
            /// Diagnostic rendering of the identity.
            identity: String,
        },
    }
}

pub use aviator::{Aviator, AviatorManager, aviator_fn};
pub use barrier::{CleanupBarrier, CleanupOutcome, CleanupResult, ScopeEnding};
pub use bloc::{Bloc, BlocBuilder};
pub use dispatch::{ErrorCallback, EventDispatcher, UnhandledCallback, UseCaseRegistry};
pub use emitter::StatusEmitter;
pub use error::{BlocError, ScopeError};
pub use feature::FeatureScope;
pub use retry::{
    BackoffStrategy, RetryObserver, RetryPolicy, RetryPredicate, RetryingUseCaseBuilder,
};
pub use scope::{
    BlocIdentity, BlocScope, FeatureId, LeakKind, LeakReport, Lease, Lifecycle, ManagedBloc,
    ScopeKey, ScopeShutdownReport,
};
pub use state::StateManager;
