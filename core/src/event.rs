//! Event model for bloc dispatch.
//!
//! Events are ordinary enums with an explicit discriminant: the
//! [`Event::Kind`] associated type. The dispatcher routes each event to the
//! one use case registered for its kind, so `Kind` values must be cheap to
//! copy, hash, and compare. No runtime reflection is involved.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::groups::RebuildGroups;

/// A discriminated input value accepted by a bloc.
///
/// Implementations are typically per-bloc enums. The [`Event::kind`] method
/// returns the explicit discriminant used for handler lookup.
///
/// # Rebuild groups
///
/// An event may carry a set of rebuild-group tags naming which observers
/// should react to the statuses it produces. The status emitter unions
/// these with any groups supplied at emit time; the union must still honor
/// the wildcard-exclusivity rule (see [`RebuildGroups::validate`]).
///
/// # Cancellation
///
/// Events that represent long-running or retryable work may expose a
/// [`CancelToken`]. Cancellation is cooperative: the retry loop and
/// long-running use cases poll the flag; nothing is preempted.
pub trait Event: Clone + fmt::Debug + Send + Sync + 'static {
    /// The explicit discriminant routing this event to its use case.
    type Kind: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static;

    /// The discriminant of this event value.
    fn kind(&self) -> Self::Kind;

    /// Rebuild-group tags carried by this event (empty by default).
    fn rebuild_groups(&self) -> RebuildGroups {
        RebuildGroups::new()
    }

    /// The cooperative cancellation flag, if this event carries one.
    fn cancellation(&self) -> Option<&CancelToken> {
        None
    }
}

/// A cooperative cancellation flag shared between an event's sender and the
/// machinery executing it.
///
/// Cloning is cheap; all clones observe the same flag. Setting the flag
/// never interrupts in-flight work — it only stops the retry loop before
/// the next attempt and is visible to any use case that polls it.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a token in the not-cancelled state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Whether the flag has been set.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}
