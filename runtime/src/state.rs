//! Single-slot state holder with change notification.
//!
//! The manager holds exactly one current value and broadcasts every
//! replacement to active subscribers. There is no buffering beyond the slot
//! and the in-flight notifications: late subscribers receive only future
//! emissions, and slow subscribers observe `Lagged` rather than stalling
//! the writer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use tokio::sync::broadcast;

use juice_core::EmitError;

const DEFAULT_CAPACITY: usize = 16;

/// Holds one current value of `T` and publishes replacements.
#[derive(Debug)]
pub struct StateManager<T>
where
    T: Clone + Send + 'static,
{
    current: RwLock<T>,
    /// Taken (dropped) on close so pending `recv()` calls observe
    /// end-of-stream.
    notifications: RwLock<Option<broadcast::Sender<T>>>,
    closed: AtomicBool,
}

impl<T> StateManager<T>
where
    T: Clone + Send + 'static,
{
    /// Create a manager holding `initial` with the default notification
    /// capacity.
    #[must_use]
    pub fn new(initial: T) -> Self {
        Self::with_capacity(initial, DEFAULT_CAPACITY)
    }

    /// Create a manager with a custom notification buffer capacity.
    ///
    /// Increase the capacity when many slow subscribers are expected.
    #[must_use]
    pub fn with_capacity(initial: T, capacity: usize) -> Self {
        let (notifications, _) = broadcast::channel(capacity);
        Self {
            current: RwLock::new(initial),
            notifications: RwLock::new(Some(notifications)),
            closed: AtomicBool::new(false),
        }
    }

    /// Replace the current value and notify all active subscribers.
    ///
    /// # Errors
    ///
    /// Returns [`EmitError::Closed`] once [`StateManager::close`] has been
    /// called.
    pub fn emit(&self, value: T) -> Result<(), EmitError> {
        if self.is_closed() {
            return Err(EmitError::Closed);
        }

        {
            let mut slot = self
                .current
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            *slot = value.clone();
        }

        let notifications = self
            .notifications
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        match notifications.as_ref() {
            Some(sender) => {
                // No active subscribers is not an error.
                let _ = sender.send(value);
                Ok(())
            }
            // Lost the race against close.
            None => Err(EmitError::Closed),
        }
    }

    /// Clone the current value.
    #[must_use]
    pub fn current(&self) -> T {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Subscribe to future emissions (no replay of the current value).
    ///
    /// After close, the returned receiver reports
    /// [`broadcast::error::RecvError::Closed`] immediately.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        let notifications = self
            .notifications
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        notifications.as_ref().map_or_else(
            || {
                let (sender, receiver) = broadcast::channel(1);
                drop(sender);
                receiver
            },
            broadcast::Sender::subscribe,
        )
    }

    /// Close the manager. Idempotent; returns `true` on the first call.
    ///
    /// Drops the notification sender: subscribers drain any buffered
    /// notifications and then observe a closed channel, even while the
    /// manager itself stays alive.
    pub fn close(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        if first {
            self.notifications
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
        }
        first
    }

    /// Whether [`StateManager::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
