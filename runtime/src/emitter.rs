//! Status emission: the sole path by which a state transition becomes
//! observable.
//!
//! Every emit validates the wildcard-exclusivity rule, unions the supplied
//! rebuild groups with the triggering event's own tags, stamps the status
//! with the prior current state as `old_state`, and publishes it through
//! the [`StateManager`].

use tokio::sync::broadcast;

use juice_core::{EmitError, Event, RebuildGroups, StreamStatus, UseCaseError};

use crate::state::StateManager;

/// The status variant an emit produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusTag {
    Updating,
    Waiting,
    Failure,
    Canceling,
}

/// Wraps state transitions in tagged status envelopes and publishes them.
#[derive(Debug)]
pub struct StatusEmitter<S, E>
where
    S: Clone + Send + Sync + 'static,
    E: Event,
{
    statuses: StateManager<StreamStatus<S, E>>,
}

impl<S, E> StatusEmitter<S, E>
where
    S: Clone + Send + Sync + 'static,
    E: Event,
{
    /// Create an emitter seeded with an initial `Updating` status carrying
    /// `initial_state` (no event, no groups).
    #[must_use]
    pub fn new(initial_state: S) -> Self {
        let seed = StreamStatus::Updating {
            state: initial_state.clone(),
            old_state: initial_state,
            event: None,
            groups: RebuildGroups::new(),
        };
        Self {
            statuses: StateManager::new(seed),
        }
    }

    /// Publish an `Updating` status.
    ///
    /// # Errors
    ///
    /// [`EmitError::Closed`] after close; [`EmitError::Groups`] if the
    /// merged groups violate the wildcard rule.
    pub fn emit_update(
        &self,
        event: Option<&E>,
        new_state: Option<S>,
        groups: RebuildGroups,
    ) -> Result<(), EmitError> {
        self.emit(StatusTag::Updating, event, new_state, groups, None)
    }

    /// Publish a `Waiting` status.
    ///
    /// # Errors
    ///
    /// Same conditions as [`StatusEmitter::emit_update`].
    pub fn emit_waiting(
        &self,
        event: Option<&E>,
        new_state: Option<S>,
        groups: RebuildGroups,
    ) -> Result<(), EmitError> {
        self.emit(StatusTag::Waiting, event, new_state, groups, None)
    }

    /// Publish a `Failure` status carrying `error`.
    ///
    /// # Errors
    ///
    /// Same conditions as [`StatusEmitter::emit_update`].
    pub fn emit_failure(
        &self,
        event: Option<&E>,
        new_state: Option<S>,
        groups: RebuildGroups,
        error: UseCaseError,
    ) -> Result<(), EmitError> {
        self.emit(StatusTag::Failure, event, new_state, groups, Some(error))
    }

    /// Publish a `Canceling` status.
    ///
    /// # Errors
    ///
    /// Same conditions as [`StatusEmitter::emit_update`].
    pub fn emit_cancel(
        &self,
        event: Option<&E>,
        new_state: Option<S>,
        groups: RebuildGroups,
    ) -> Result<(), EmitError> {
        self.emit(StatusTag::Canceling, event, new_state, groups, None)
    }

    fn emit(
        &self,
        tag: StatusTag,
        event: Option<&E>,
        new_state: Option<S>,
        groups: RebuildGroups,
        error: Option<UseCaseError>,
    ) -> Result<(), EmitError> {
        // Closed wins over every other rejection: nothing about the
        // payload matters once the stream is sealed.
        if self.statuses.is_closed() {
            return Err(EmitError::Closed);
        }

        groups.validate()?;

        // Union with the triggering event's own tags; the merged set must
        // still honor the wildcard rule.
        let mut merged = event.map(Event::rebuild_groups).unwrap_or_default();
        merged.union(&groups);
        merged.validate()?;

        let prior = self.statuses.current();
        let old_state = prior.state().clone();
        let state = new_state.unwrap_or_else(|| old_state.clone());
        let event = event.cloned();

        let status = match tag {
            StatusTag::Updating => StreamStatus::Updating {
                state,
                old_state,
                event,
                groups: merged,
            },
            StatusTag::Waiting => StreamStatus::Waiting {
                state,
                old_state,
                event,
                groups: merged,
            },
            StatusTag::Failure => StreamStatus::Failure {
                state,
                old_state,
                event,
                groups: merged,
                error: error.unwrap_or_else(|| UseCaseError::failed("unspecified failure")),
            },
            StatusTag::Canceling => StreamStatus::Canceling {
                state,
                old_state,
                event,
                groups: merged,
            },
        };

        self.statuses.emit(status)
    }

    /// Clone the most recent status.
    #[must_use]
    pub fn current(&self) -> StreamStatus<S, E> {
        self.statuses.current()
    }

    /// The state carried by the most recent status.
    #[must_use]
    pub fn state(&self) -> S {
        self.statuses.current().state().clone()
    }

    /// The state prior to the most recent emission.
    #[must_use]
    pub fn old_state(&self) -> S {
        self.statuses.current().old_state().clone()
    }

    /// Subscribe to future statuses.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StreamStatus<S, E>> {
        self.statuses.subscribe()
    }

    /// Close the underlying state stream. Idempotent.
    pub fn close(&self) -> bool {
        self.statuses.close()
    }

    /// Whether the stream has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.statuses.is_closed()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[derive(Clone, Debug)]
    struct Tagged {
        groups: RebuildGroups,
    }

    impl Event for Tagged {
        type Kind = ();

        fn kind(&self) {}

        fn rebuild_groups(&self) -> RebuildGroups {
            self.groups.clone()
        }
    }

    fn emitter() -> StatusEmitter<u32, Tagged> {
        StatusEmitter::new(0)
    }

    #[test]
    fn initial_status_seeds_state_and_old_state() {
        let emitter = emitter();
        let status = emitter.current();

        assert!(status.is_updating());
        assert_eq!(*status.state(), 0);
        assert_eq!(*status.old_state(), 0);
        assert!(status.event().is_none());
    }

    #[test]
    fn old_state_tracks_prior_current() {
        let emitter = emitter();

        emitter.emit_update(None, Some(1), RebuildGroups::new()).unwrap();
        emitter.emit_update(None, Some(5), RebuildGroups::new()).unwrap();

        let status = emitter.current();
        assert_eq!(*status.state(), 5);
        assert_eq!(*status.old_state(), 1);
    }

    #[test]
    fn none_state_keeps_current() {
        let emitter = emitter();
        emitter.emit_update(None, Some(3), RebuildGroups::new()).unwrap();

        emitter.emit_waiting(None, None, RebuildGroups::new()).unwrap();

        let status = emitter.current();
        assert!(status.is_waiting());
        assert_eq!(*status.state(), 3);
        assert_eq!(*status.old_state(), 3);
    }

    #[test]
    fn groups_are_unioned_with_event_tags() {
        let emitter = emitter();
        let event = Tagged {
            groups: RebuildGroups::of(["header"]),
        };

        emitter
            .emit_update(Some(&event), Some(1), RebuildGroups::of(["footer"]))
            .unwrap();

        let status = emitter.current();
        assert!(status.groups().contains("header"));
        assert!(status.groups().contains("footer"));
        assert_eq!(status.groups().len(), 2);
    }

    #[test]
    fn wildcard_combined_with_named_is_rejected() {
        let emitter = emitter();
        let event = Tagged {
            groups: RebuildGroups::of(["header"]),
        };

        let result = emitter.emit_update(Some(&event), Some(1), RebuildGroups::wildcard());

        assert!(matches!(result, Err(EmitError::Groups(_))));
        // Nothing was published.
        assert_eq!(*emitter.current().state(), 0);
    }

    #[test]
    fn wildcard_alone_is_accepted() {
        let emitter = emitter();

        emitter
            .emit_update(None, Some(1), RebuildGroups::wildcard())
            .unwrap();

        assert!(emitter.current().groups().has_wildcard());
    }

    #[test]
    fn emit_after_close_fails() {
        let emitter = emitter();
        emitter.close();

        let result = emitter.emit_update(None, Some(1), RebuildGroups::new());
        assert_eq!(result, Err(EmitError::Closed));
    }

    #[test]
    fn closed_takes_precedence_over_group_validation() {
        let emitter = emitter();
        emitter.close();

        let mut groups = RebuildGroups::wildcard();
        groups.insert("header");
        let result = emitter.emit_update(None, Some(1), groups);

        assert_eq!(result, Err(EmitError::Closed));
    }

    #[test]
    fn failure_carries_error() {
        let emitter = emitter();

        emitter
            .emit_failure(
                None,
                None,
                RebuildGroups::new(),
                UseCaseError::failed("boom"),
            )
            .unwrap();

        let status = emitter.current();
        assert!(status.is_failure());
        assert_eq!(status.error(), Some(&UseCaseError::failed("boom")));
    }
}
