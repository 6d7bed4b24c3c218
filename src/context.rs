//! Provides the cancellation and deadline scope passed into every cache operation.
//!
//! A [Context] combines a **CancellationToken** with an optional deadline. Contexts form a tree:
//! a child created via [Context::child], [Context::with_timeout] or [Context::with_deadline] is
//! cancelled along with its parent but can also be cancelled on its own. The deadline of a child
//! is never later than the one of its parent.
//!
//! Every suspension point of a cache operation (store I/O, backoff sleeps, waiting for a
//! coalesced fetch) is raced against [Context::done], so that a cancelled caller returns
//! immediately with [CacheError::Cancelled] or [CacheError::DeadlineExceeded].
//!
//! # Example
//!
//! ```
//! # use cacher::context::Context;
//! # use cacher::error::CacheError;
//! # use std::time::Duration;
//! # #[tokio::main]
//! # async fn main() {
//! let ctx = Context::background().with_timeout(Duration::from_millis(10));
//!
//! // A slow operation is abandoned once the deadline is reached...
//! let result = ctx.run(tokio::time::sleep(Duration::from_secs(10))).await;
//! assert_eq!(matches!(result, Err(CacheError::DeadlineExceeded)), true);
//! # }
//! ```
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{CacheError, CacheResult};

/// Carries the cancellation signal and deadline of a caller.
#[derive(Clone, Debug, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// Creates a root context which is never cancelled and has no deadline.
    pub fn background() -> Self {
        Context::default()
    }

    /// Creates a child context which can be cancelled independently of this one.
    pub fn child(&self) -> Self {
        Context {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Creates a child context which expires after the given timeout.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Creates a child context which expires at the given instant (or earlier, if this context
    /// already has an earlier deadline).
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        Context {
            token: self.token.child_token(),
            deadline: Some(match self.deadline {
                Some(current) if current < deadline => current,
                _ => deadline,
            }),
        }
    }

    /// Cancels this context and all of its children.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns the deadline of this context, if there is one.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns the time left until the deadline is reached.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Returns the reason why this context is done or **None** if it is still active.
    pub fn error(&self) -> Option<CacheError> {
        if self.token.is_cancelled() {
            Some(CacheError::Cancelled)
        } else if matches!(self.deadline, Some(deadline) if deadline <= Instant::now()) {
            Some(CacheError::DeadlineExceeded)
        } else {
            None
        }
    }

    /// Fails if this context has already been cancelled or its deadline has passed.
    pub fn check(&self) -> CacheResult<()> {
        match self.error() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Resolves once this context is cancelled or its deadline is reached.
    pub async fn done(&self) -> CacheError {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => CacheError::Cancelled,
                    _ = tokio::time::sleep_until(deadline) => CacheError::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                CacheError::Cancelled
            }
        }
    }

    /// Runs the given future unless this context is done first.
    ///
    /// Note that the future is dropped (and therefore abandoned) if the context finishes first.
    pub async fn run<F: Future>(&self, future: F) -> CacheResult<F::Output> {
        self.check()?;

        tokio::select! {
            biased;
            error = self.done() => Err(error),
            result = future => Ok(result),
        }
    }

    /// Sleeps for the given duration unless this context is done first.
    pub async fn sleep(&self, duration: Duration) -> CacheResult<()> {
        self.run(tokio::time::sleep(duration)).await
    }
}
