//! Aviators: named, decoupled navigation-intent callbacks.
//!
//! Business logic dispatches an intent by name; whatever owns navigation
//! mechanics registers the callback. Registration is last-write-wins — a
//! deliberate decoupling choice so a screen can re-register its handler on
//! remount without ceremony.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;

/// A named navigation-intent callback.
#[async_trait]
pub trait Aviator: Send + Sync {
    /// Handle one navigation intent.
    async fn navigate(&self, args: Value);

    /// Shutdown hook awaited during [`AviatorManager::close_all`].
    /// Default: no-op.
    async fn close(&self) {}
}

/// Wrap a synchronous closure as an [`Aviator`].
pub fn aviator_fn<F>(f: F) -> Arc<dyn Aviator>
where
    F: Fn(Value) + Send + Sync + 'static,
{
    Arc::new(FnAviator { f })
}

struct FnAviator<F> {
    f: F,
}

#[async_trait]
impl<F> Aviator for FnAviator<F>
where
    F: Fn(Value) + Send + Sync + 'static,
{
    async fn navigate(&self, args: Value) {
        (self.f)(args);
    }
}

/// Named-callback registry for decoupled navigation-intent dispatch.
#[derive(Default)]
pub struct AviatorManager {
    routes: RwLock<HashMap<String, Arc<dyn Aviator>>>,
}

impl AviatorManager {
    /// An empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `aviator` under `name`, replacing any prior registration.
    pub fn register(&self, name: impl Into<String>, aviator: Arc<dyn Aviator>) {
        let name = name.into();
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        if routes.insert(name.clone(), aviator).is_some() {
            tracing::debug!(aviator = %name, "Replaced existing aviator registration");
        }
    }

    /// Whether an aviator is registered under `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Dispatch an intent without awaiting it (fire-and-forget).
    ///
    /// A no-op if nothing is registered under `name`. The callback runs on
    /// a spawned task, so a tokio runtime must be current.
    pub fn navigate(&self, name: &str, args: Value) {
        let Some(aviator) = self.lookup(name) else {
            tracing::debug!(aviator = %name, "No aviator registered, ignoring intent");
            return;
        };

        tokio::spawn(async move {
            aviator.navigate(args).await;
        });
    }

    /// Dispatch an intent and await its completion.
    ///
    /// A no-op if nothing is registered under `name`.
    pub async fn navigate_async(&self, name: &str, args: Value) {
        let Some(aviator) = self.lookup(name) else {
            tracing::debug!(aviator = %name, "No aviator registered, ignoring intent");
            return;
        };

        aviator.navigate(args).await;
    }

    /// Await every registered aviator's shutdown hook in parallel and empty
    /// the registry.
    pub async fn close_all(&self) {
        let aviators: Vec<_> = {
            let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
            routes.drain().map(|(_, a)| a).collect()
        };

        join_all(aviators.iter().map(|a| a.close())).await;
    }

    fn lookup(&self, name: &str) -> Option<Arc<dyn Aviator>> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting_aviator(counter: Arc<AtomicUsize>) -> Arc<dyn Aviator> {
        aviator_fn(move |_args| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn navigate_async_invokes_the_callback() {
        let manager = AviatorManager::new();
        let counter = Arc::new(AtomicUsize::new(0));
        manager.register("details", counting_aviator(Arc::clone(&counter)));

        manager.navigate_async("details", Value::Null).await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unregistered_intent_is_a_noop() {
        let manager = AviatorManager::new();
        manager.navigate("missing", Value::Null);
        manager.navigate_async("missing", Value::Null).await;
    }

    #[tokio::test]
    async fn registration_is_last_write_wins() {
        let manager = AviatorManager::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        manager.register("home", counting_aviator(Arc::clone(&first)));
        manager.register("home", counting_aviator(Arc::clone(&second)));

        manager.navigate_async("home", Value::Null).await;

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fire_and_forget_navigation_runs() {
        let manager = AviatorManager::new();
        let counter = Arc::new(AtomicUsize::new(0));
        manager.register("home", counting_aviator(Arc::clone(&counter)));

        manager.navigate("home", Value::Null);

        // The callback runs on a spawned task; poll briefly.
        for _ in 0..50 {
            if counter.load(Ordering::SeqCst) == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("fire-and-forget navigation never ran");
    }

    #[tokio::test]
    async fn close_all_awaits_shutdown_hooks_and_empties() {
        struct TrackingAviator {
            closed: Arc<AtomicUsize>,
        }

        #[async_trait]
        impl Aviator for TrackingAviator {
            async fn navigate(&self, _args: Value) {}

            async fn close(&self) {
                self.closed.fetch_add(1, Ordering::SeqCst);
            }
        }

        let manager = AviatorManager::new();
        let closed = Arc::new(AtomicUsize::new(0));
        manager.register(
            "a",
            Arc::new(TrackingAviator {
                closed: Arc::clone(&closed),
            }),
        );
        manager.register(
            "b",
            Arc::new(TrackingAviator {
                closed: Arc::clone(&closed),
            }),
        );

        manager.close_all().await;

        assert_eq!(closed.load(Ordering::SeqCst), 2);
        assert!(!manager.contains("a"));
    }
}
