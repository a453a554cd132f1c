//! Retry with backoff for fallible async operations.
//!
//! Mostly used to make resource creation resilient: [`Retrying`] wraps any
//! [`Manage`] so `create` is retried before the pool sees a failure.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::pool::Manage;

/// Delay before each retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// Walk the list, then keep using the last entry.
    Steps(Vec<Duration>),
    /// `base * 2^retry`, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    /// Delay after the failed attempt numbered `retry` (0-based).
    pub fn delay(&self, retry: u32) -> Duration {
        match self {
            Backoff::Fixed(delay) => *delay,
            Backoff::Steps(steps) => {
                let index = (retry as usize).min(steps.len().saturating_sub(1));
                steps.get(index).copied().unwrap_or(Duration::ZERO)
            }
            Backoff::Exponential { base, max } => {
                let factor = 1u32 << retry.min(16);
                base.saturating_mul(factor).min(*max)
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Fixed(Duration::ZERO)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryConfig {
    /// Retries after the first attempt. `None` retries until success,
    /// cancellation or timeout.
    pub max_retries: Option<u32>,
    pub backoff: Backoff,
    /// Budget for the whole retry loop, measured from the first attempt.
    pub timeout: Option<Duration>,
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("retry limit reached after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: E,
    },

    #[error("timeout would be exceeded after {attempts} attempts ({elapsed:?} elapsed): {last}")]
    TimedOut {
        attempts: u32,
        elapsed: Duration,
        #[source]
        last: E,
    },

    #[error("retry cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },

    #[error("non-retryable error: {0}")]
    Rejected(#[source] E),
}

impl<E> RetryError<E> {
    /// The last error the operation returned, if there was one.
    pub fn into_last(self) -> Option<E> {
        match self {
            RetryError::Exhausted { last, .. } | RetryError::TimedOut { last, .. } => Some(last),
            RetryError::Rejected(last) => Some(last),
            RetryError::Cancelled { .. } => None,
        }
    }
}

/// Run `op` until it succeeds, retrying every error.
///
/// `op` receives the 0-based attempt number.
pub async fn retry<T, E, F, Fut>(
    config: &RetryConfig,
    cancel: Option<&CancellationToken>,
    op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    retry_if(config, cancel, op, |_| true).await
}

/// Like [`retry`], but errors for which `should_retry` returns false are
/// returned immediately as [`RetryError::Rejected`].
pub async fn retry_if<T, E, F, Fut, P>(
    config: &RetryConfig,
    cancel: Option<&CancellationToken>,
    mut op: F,
    mut should_retry: P,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: FnMut(&E) -> bool,
    E: fmt::Display,
{
    let started = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_some_and(|token| token.is_cancelled()) {
            return Err(RetryError::Cancelled { attempts: attempt });
        }

        let err = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        let attempts = attempt.saturating_add(1);

        if !should_retry(&err) {
            return Err(RetryError::Rejected(err));
        }
        if let Some(max) = config.max_retries
            && attempt >= max
        {
            return Err(RetryError::Exhausted {
                attempts,
                last: err,
            });
        }

        let wait = config.backoff.delay(attempt);
        let elapsed = started.elapsed();
        if let Some(timeout) = config.timeout
            && elapsed + wait > timeout
        {
            return Err(RetryError::TimedOut {
                attempts,
                elapsed,
                last: err,
            });
        }

        tracing::debug!(
            attempt = attempts,
            backoff_ms = wait.as_millis() as u64,
            error = %err,
            "Attempt failed, retrying"
        );

        match cancel {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => {
                        return Err(RetryError::Cancelled { attempts });
                    }
                    _ = tokio::time::sleep(wait) => {}
                }
            }
            None => tokio::time::sleep(wait).await,
        }
        attempt = attempts;
    }
}

/// [`Manage`] whose `create` is retried according to a [`RetryConfig`].
pub struct Retrying<M> {
    inner: M,
    config: RetryConfig,
}

impl<M> Retrying<M> {
    pub fn new(inner: M, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    pub fn inner(&self) -> &M {
        &self.inner
    }
}

#[async_trait]
impl<M: Manage> Manage for Retrying<M> {
    type Resource = M::Resource;
    type Error = RetryError<M::Error>;

    async fn create(&self) -> Result<Self::Resource, Self::Error> {
        let inner = &self.inner;
        retry(&self.config, None, move |_| inner.create()).await
    }

    async fn dispose(&self, resource: Self::Resource) -> Result<(), Self::Error> {
        self.inner
            .dispose(resource)
            .await
            .map_err(RetryError::Rejected)
    }
}
