//! Stream statuses: the tagged envelope wrapping every state transition.
//!
//! A status is produced once per emit call and is immutable. `old_state`
//! always equals the state held immediately prior to the emission; `event`
//! is the triggering event, absent for the initial status and for direct
//! state replacement.

use crate::error::UseCaseError;
use crate::event::Event;
use crate::groups::RebuildGroups;

/// A tagged state transition published on a bloc's stream.
///
/// The four variants mirror the emit functions on the use-case context:
/// `Updating` for committed changes, `Waiting` while asynchronous work is
/// in flight, `Failure` when a use case reported or threw an error, and
/// `Canceling` when cooperative cancellation stopped the work.
#[derive(Clone, Debug)]
pub enum StreamStatus<S, E>
where
    S: Clone,
    E: Event,
{
    /// A committed state change.
    Updating {
        /// The state after this transition.
        state: S,
        /// The state immediately prior to this emission.
        old_state: S,
        /// The triggering event, if any.
        event: Option<E>,
        /// Merged rebuild groups (event tags ∪ emit-time tags).
        groups: RebuildGroups,
    },

    /// Asynchronous work is in flight; observers may show progress.
    Waiting {
        /// The state after this transition.
        state: S,
        /// The state immediately prior to this emission.
        old_state: S,
        /// The triggering event, if any.
        event: Option<E>,
        /// Merged rebuild groups.
        groups: RebuildGroups,
    },

    /// A use case failed; the error rode along for observers.
    Failure {
        /// The state after this transition.
        state: S,
        /// The state immediately prior to this emission.
        old_state: S,
        /// The triggering event, if any.
        event: Option<E>,
        /// Merged rebuild groups.
        groups: RebuildGroups,
        /// The failure that produced this status.
        error: UseCaseError,
    },

    /// Cooperative cancellation stopped the triggering work.
    Canceling {
        /// The state after this transition.
        state: S,
        /// The state immediately prior to this emission.
        old_state: S,
        /// The triggering event, if any.
        event: Option<E>,
        /// Merged rebuild groups.
        groups: RebuildGroups,
    },
}

impl<S, E> StreamStatus<S, E>
where
    S: Clone,
    E: Event,
{
    /// The state carried by this status.
    pub const fn state(&self) -> &S {
        match self {
            Self::Updating { state, .. }
            | Self::Waiting { state, .. }
            | Self::Failure { state, .. }
            | Self::Canceling { state, .. } => state,
        }
    }

    /// The state held immediately prior to this emission.
    pub const fn old_state(&self) -> &S {
        match self {
            Self::Updating { old_state, .. }
            | Self::Waiting { old_state, .. }
            | Self::Failure { old_state, .. }
            | Self::Canceling { old_state, .. } => old_state,
        }
    }

    /// The triggering event, if any.
    pub const fn event(&self) -> Option<&E> {
        match self {
            Self::Updating { event, .. }
            | Self::Waiting { event, .. }
            | Self::Failure { event, .. }
            | Self::Canceling { event, .. } => event.as_ref(),
        }
    }

    /// The merged rebuild groups for this transition.
    pub const fn groups(&self) -> &RebuildGroups {
        match self {
            Self::Updating { groups, .. }
            | Self::Waiting { groups, .. }
            | Self::Failure { groups, .. }
            | Self::Canceling { groups, .. } => groups,
        }
    }

    /// The failure carried by a `Failure` status.
    pub const fn error(&self) -> Option<&UseCaseError> {
        match self {
            Self::Failure { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Whether this is an `Updating` status.
    #[must_use]
    pub const fn is_updating(&self) -> bool {
        matches!(self, Self::Updating { .. })
    }

    /// Whether this is a `Waiting` status.
    #[must_use]
    pub const fn is_waiting(&self) -> bool {
        matches!(self, Self::Waiting { .. })
    }

    /// Whether this is a `Failure` status.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Failure { .. })
    }

    /// Whether this is a `Canceling` status.
    #[must_use]
    pub const fn is_canceling(&self) -> bool {
        matches!(self, Self::Canceling { .. })
    }
}
