//! Retry decoration for use cases with pluggable backoff.
//!
//! [`RetryingUseCaseBuilder`] wraps any [`UseCaseBuilder`] and re-executes
//! failed attempts according to a [`RetryPolicy`]. Each attempt runs on a
//! freshly built use case, so handlers stay single-shot. The event's
//! cancellation flag is checked before every attempt; a cancelled loop
//! emits a `Canceling` status and returns [`UseCaseError::Cancelled`].
//!
//! Exhaustion returns the final error unchanged — at the bloc level it
//! surfaces as a terminal `Failure` status like any other uncaught error.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use juice_core::{Event, RebuildGroups, UseCase, UseCaseBuilder, UseCaseContext, UseCaseError};

/// Decides whether a failed attempt should be retried.
pub type RetryPredicate = Arc<dyn Fn(&UseCaseError) -> bool + Send + Sync>;

/// Observes each scheduled retry: `(attempt, error, upcoming delay)`.
pub type RetryObserver = Arc<dyn Fn(u32, &UseCaseError, Duration) + Send + Sync>;

/// How long to wait before re-attempt number `attempt` (zero-indexed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// The same delay before every attempt.
    Fixed {
        /// Delay between attempts.
        delay: Duration,
    },
    /// `initial + increment * attempt`, clamped to `cap`.
    Linear {
        /// Delay before the first retry.
        initial: Duration,
        /// Added per subsequent retry.
        increment: Duration,
        /// Upper bound.
        cap: Duration,
    },
    /// `initial * multiplier^attempt`, clamped to `cap`, optionally
    /// randomized to 50–100% of the computed value.
    Exponential {
        /// Delay before the first retry.
        initial: Duration,
        /// Growth factor per retry.
        multiplier: u32,
        /// Upper bound; arithmetic overflow also clamps here.
        cap: Duration,
        /// Whether to randomize the computed delay.
        jitter: bool,
    },
}

impl BackoffStrategy {
    /// The default exponential curve: 1s doubling to a 30s cap, jittered.
    #[must_use]
    pub const fn default_exponential() -> Self {
        Self::Exponential {
            initial: Duration::from_secs(1),
            multiplier: 2,
            cap: Duration::from_secs(30),
            jitter: true,
        }
    }

    /// Delay before retry number `attempt` (zero-indexed).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => *delay,
            Self::Linear {
                initial,
                increment,
                cap,
            } => increment
                .checked_mul(attempt)
                .and_then(|grown| initial.checked_add(grown))
                .unwrap_or(*cap)
                .min(*cap),
            Self::Exponential {
                initial,
                multiplier,
                cap,
                jitter,
            } => {
                let mut delay = *initial;
                for _ in 0..attempt {
                    match delay.checked_mul(*multiplier) {
                        Some(next) if next < *cap => delay = next,
                        _ => {
                            delay = *cap;
                            break;
                        }
                    }
                }
                delay = delay.min(*cap);
                if *jitter {
                    let factor = rand::thread_rng().gen_range(0.5..=1.0);
                    delay.mul_f64(factor)
                } else {
                    delay
                }
            }
        }
    }
}

/// How many times to retry and how long to back off between attempts.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt; `3` means up to 4 executions.
    pub max_retries: u32,
    /// Delay curve between attempts.
    pub backoff: BackoffStrategy,
    on_retry: Option<RetryObserver>,
}

impl RetryPolicy {
    /// A policy with no observer.
    #[must_use]
    pub const fn new(max_retries: u32, backoff: BackoffStrategy) -> Self {
        Self {
            max_retries,
            backoff,
            on_retry: None,
        }
    }

    /// Override the retry count.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Override the backoff curve.
    #[must_use]
    pub const fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Observe each scheduled retry (attempt number, error, upcoming delay).
    #[must_use]
    pub fn on_retry<F>(mut self, observer: F) -> Self
    where
        F: Fn(u32, &UseCaseError, Duration) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(observer));
        self
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, BackoffStrategy::default_exponential())
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("backoff", &self.backoff)
            .field("on_retry", &self.on_retry.is_some())
            .finish()
    }
}

/// Wraps a [`UseCaseBuilder`] so every built use case retries per policy.
pub struct RetryingUseCaseBuilder<S, E>
where
    S: Clone + Send + Sync + 'static,
    E: Event,
{
    inner: Arc<dyn UseCaseBuilder<S, E>>,
    policy: RetryPolicy,
    retry_when: RetryPredicate,
}

impl<S, E> RetryingUseCaseBuilder<S, E>
where
    S: Clone + Send + Sync + 'static,
    E: Event,
{
    /// Decorate `inner` with `policy`. The default predicate retries
    /// everything [`UseCaseError::is_retryable`] allows.
    #[must_use]
    pub fn new(inner: Arc<dyn UseCaseBuilder<S, E>>, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            retry_when: Arc::new(UseCaseError::is_retryable),
        }
    }

    /// Replace the retry predicate.
    #[must_use]
    pub fn retry_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&UseCaseError) -> bool + Send + Sync + 'static,
    {
        self.retry_when = Arc::new(predicate);
        self
    }
}

#[async_trait]
impl<S, E> UseCaseBuilder<S, E> for RetryingUseCaseBuilder<S, E>
where
    S: Clone + Send + Sync + 'static,
    E: Event,
{
    fn kind(&self) -> E::Kind {
        self.inner.kind()
    }

    fn build(&self) -> Box<dyn UseCase<S, E>> {
        Box::new(RetryingUseCase {
            builder: Arc::clone(&self.inner),
            policy: self.policy.clone(),
            retry_when: Arc::clone(&self.retry_when),
        })
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

/// The retry loop: Executing → evaluate → backoff → Executing.
struct RetryingUseCase<S, E>
where
    S: Clone + Send + Sync + 'static,
    E: Event,
{
    builder: Arc<dyn UseCaseBuilder<S, E>>,
    policy: RetryPolicy,
    retry_when: RetryPredicate,
}

#[async_trait]
impl<S, E> UseCase<S, E> for RetryingUseCase<S, E>
where
    S: Clone + Send + Sync + 'static,
    E: Event,
{
    async fn execute(
        &self,
        ctx: Arc<dyn UseCaseContext<S, E>>,
        event: E,
    ) -> Result<(), UseCaseError> {
        let mut attempt: u32 = 0;

        loop {
            if event.cancellation().is_some_and(juice_core::CancelToken::is_cancelled) {
                tracing::debug!(attempt, "Retry loop observed cancellation");
                if let Err(error) = ctx.emit_cancel(None, RebuildGroups::new()) {
                    tracing::debug!(error = %error, "Canceling status could not be emitted");
                }
                return Err(UseCaseError::Cancelled);
            }

            let use_case = self.builder.build();
            match use_case.execute(Arc::clone(&ctx), event.clone()).await {
                Ok(()) => {
                    if attempt > 0 {
                        tracing::debug!(attempt, "Use case succeeded after retries");
                    }
                    return Ok(());
                }
                Err(error) => {
                    if !(self.retry_when)(&error) {
                        tracing::debug!(attempt, error = %error, "Error is not retryable");
                        return Err(error);
                    }
                    if attempt >= self.policy.max_retries {
                        metrics::counter!("juice.retry.exhausted").increment(1);
                        tracing::warn!(
                            attempts = attempt + 1,
                            error = %error,
                            "Retries exhausted"
                        );
                        return Err(error);
                    }

                    let delay = self.policy.backoff.delay_for(attempt);
                    metrics::counter!("juice.retry.attempts").increment(1);
                    tracing::debug!(
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %error,
                        "Retrying use case after backoff"
                    );
                    if let Some(on_retry) = &self.policy.on_retry {
                        on_retry(attempt, &error, delay);
                    }
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
