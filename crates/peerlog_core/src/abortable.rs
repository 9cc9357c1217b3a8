//! Cancellable, time-bounded stream wrapper.
//!
//! [`Abortable`] races every pull of an inner stream against a
//! [`CancellationToken`] and an optional deadline. The inner stream is never
//! dropped by the wrapper on abort; callers get it back through
//! [`Abortable::into_inner`] and can finish it however its protocol requires.
//!
//! ```rust
//! use futures_util::{stream, StreamExt};
//! use peerlog_core::abortable::{AbortError, Abortable};
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let token = CancellationToken::new();
//! let mut values = Abortable::new(stream::iter([1, 2, 3]), Some(token.clone()), None);
//!
//! assert_eq!(values.next().await, Some(Ok(1)));
//! token.cancel();
//! assert_eq!(values.next().await, Some(Err(AbortError::Cancelled)));
//! assert_eq!(values.next().await, None);
//! # }
//! ```

use futures_util::future::Future;
use futures_util::stream::{self, Stream};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, Sleep};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// Why an [`Abortable`] stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AbortError {
    /// The cancellation token fired.
    #[error("operation aborted")]
    Cancelled,
    /// The deadline elapsed.
    #[error("operation exceeded timeout of {0:?}")]
    Timeout(Duration),
}

struct Deadline {
    timeout: Duration,
    at: Instant,
    sleep: Pin<Box<Sleep>>,
}

/// A stream that fails with [`AbortError`] once its token fires or its
/// deadline passes.
///
/// - Cancellation is checked before the deadline, and both before the inner
///   stream, so an already fired token or an already elapsed timeout fails
///   the first pull.
/// - The error is yielded once and later pulls yield `None`, ending the
///   stream. [`Abortable::abort_error`] keeps the reason.
/// - Without a token or timeout it never fails on its own.
pub struct Abortable<S> {
    inner: S,
    token: Option<CancellationToken>,
    cancelled: Option<Pin<Box<WaitForCancellationFutureOwned>>>,
    deadline: Option<Deadline>,
    aborted: Option<AbortError>,
    done: bool,
}

impl<S> Abortable<S> {
    /// Wraps `inner`. The deadline, if any, starts counting now.
    pub fn new(inner: S, token: Option<CancellationToken>, timeout: Option<Duration>) -> Self {
        let cancelled = token.as_ref().map(|t| Box::pin(t.clone().cancelled_owned()));
        let deadline = timeout.map(|timeout| {
            let at = Instant::now() + timeout;
            Deadline {
                timeout,
                at,
                sleep: Box::pin(tokio::time::sleep_until(at)),
            }
        });

        Self {
            inner,
            token,
            cancelled,
            deadline,
            aborted: None,
            done: false,
        }
    }

    /// Wraps `inner` with the token and timeout of `options`.
    pub fn with_options(inner: S, options: &FetchOptions) -> Self {
        Self::new(inner, Some(options.cancel.clone()), options.timeout)
    }

    /// Returns the wrapped stream.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Returns the wrapped stream mutably.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Unwraps the inner stream.
    pub fn into_inner(self) -> S {
        self.inner
    }

    /// Returns true once the wrapper has yielded an error or the inner
    /// stream has ended.
    pub fn is_terminated(&self) -> bool {
        self.done
    }

    /// Why the wrapper stopped, if it was aborted.
    pub fn abort_error(&self) -> Option<AbortError> {
        self.aborted
    }

    fn poll_abort(&mut self, cx: &mut Context<'_>) -> Option<AbortError> {
        if self.token.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return Some(AbortError::Cancelled);
        }
        if let Some(cancelled) = self.cancelled.as_mut() {
            if cancelled.as_mut().poll(cx).is_ready() {
                return Some(AbortError::Cancelled);
            }
        }

        if let Some(deadline) = self.deadline.as_mut() {
            if Instant::now() >= deadline.at || deadline.sleep.as_mut().poll(cx).is_ready() {
                return Some(AbortError::Timeout(deadline.timeout));
            }
        }
        None
    }
}

impl<S: Stream + Unpin> Stream for Abortable<S> {
    type Item = Result<S::Item, AbortError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        if let Some(error) = this.poll_abort(cx) {
            this.aborted = Some(error);
            this.done = true;
            return Poll::Ready(Some(Err(error)));
        }

        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(item)) => Poll::Ready(Some(Ok(item))),
            Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S> std::fmt::Debug for Abortable<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Abortable")
            .field("token", &self.token.is_some())
            .field("timeout", &self.deadline.as_ref().map(|d| d.timeout))
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

/// Cancellation and timeout settings for remote fetches.
///
/// The timeout applies to each fetch separately.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Token that aborts every fetch sharing these options.
    pub cancel: CancellationToken,
    /// Per-fetch timeout.
    pub timeout: Option<Duration>,
}

impl FetchOptions {
    /// Creates options bound to `cancel`.
    pub fn new(cancel: CancellationToken, timeout: Option<Duration>) -> Self {
        Self { cancel, timeout }
    }

    /// Runs `fut` bounded by these options.
    ///
    /// The future is driven as a one-item [`Abortable`] stream, so it gets
    /// exactly the same cancel-first race as a streamed pull.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, AbortError>
    where
        F: Future,
    {
        use futures_util::StreamExt;

        let mut once = Abortable::with_options(stream::once(Box::pin(fut)), self);
        match once.next().await {
            Some(result) => result,
            // `Once` always yields exactly one item before ending.
            None => Err(AbortError::Cancelled),
        }
    }
}
