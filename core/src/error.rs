//! Shared error taxonomy for the event pipeline.
//!
//! Programmer mistakes (duplicate registrations, emitting into a closed
//! stream) surface synchronously and loudly; business-logic failures travel
//! as [`UseCaseError`] values and become `Failure` statuses on the stream,
//! never raw panics.

use thiserror::Error;

/// A failure produced by a use case's `execute`.
///
/// The retry decorator's default predicate retries [`UseCaseError::Failed`]
/// and gives up immediately on [`UseCaseError::NonRetryable`] and
/// [`UseCaseError::Cancelled`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UseCaseError {
    /// A retryable failure (transient by default).
    #[error("use case failed: {0}")]
    Failed(String),

    /// A failure that must not be retried.
    #[error("non-retryable failure: {0}")]
    NonRetryable(String),

    /// The triggering event's cancellation flag was set.
    #[error("cancelled by the triggering event")]
    Cancelled,
}

impl UseCaseError {
    /// A retryable failure with the given message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// A non-retryable failure with the given message.
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self::NonRetryable(message.into())
    }

    /// Whether the default retry predicate would retry this error.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// A rejected emit inside a use case is not worth retrying: the stream is
/// closed or the groups are malformed, and neither heals on its own.
impl From<EmitError> for UseCaseError {
    fn from(error: EmitError) -> Self {
        Self::NonRetryable(error.to_string())
    }
}

/// An emit rejected by the state manager or the group rules.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EmitError {
    /// The state stream has been closed; no further emission is possible.
    #[error("state stream is closed")]
    Closed,

    /// The supplied or merged rebuild groups violate the wildcard rule.
    #[error(transparent)]
    Groups(#[from] GroupRuleViolation),
}

/// The wildcard rebuild group was combined with named groups.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("wildcard rebuild group cannot be combined with named groups")]
pub struct GroupRuleViolation;
