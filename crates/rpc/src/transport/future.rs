//! Handle for a single in-flight call.

use crate::error::{ConnectionError, Error, Result};
use crate::protocol::Response;
use parking_lot::Mutex;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{Instant, timeout_at};
use tracing::warn;

/// Why a call ended without a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// The deadline passed.
    Timeout,
    /// The link carrying the call went away.
    Disconnected,
    /// Writing the request failed.
    WriteFailed(String),
    /// The response arrived but could not be decoded.
    BadResponse(String),
    /// The owning client was closed.
    Shutdown,
    /// Cancelled by the caller.
    Explicit,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("timed out"),
            Self::Disconnected => f.write_str("connection lost"),
            Self::WriteFailed(cause) => write!(f, "write failed: {cause}"),
            Self::BadResponse(cause) => write!(f, "malformed response: {cause}"),
            Self::Shutdown => f.write_str("client shut down"),
            Self::Explicit => f.write_str("cancelled by caller"),
        }
    }
}

/// Observable state of a future.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutureState {
    /// Waiting for a response.
    Pending,
    /// A response arrived.
    Completed,
    /// Ended without a response.
    Cancelled,
}

/// Terminal outcome handed to listeners.
#[derive(Debug, Clone)]
pub enum Completion {
    /// A response arrived. It may still carry a remote error.
    Completed(Response),
    /// Ended without a response.
    Cancelled(CancelReason),
}

type Listener = Box<dyn FnOnce(&Completion) + Send>;

enum Slot {
    Pending(Vec<Listener>),
    Done(Completion),
}

struct Inner {
    request_id: u64,
    created_at: Instant,
    timeout: Duration,
    slot: Mutex<Slot>,
    notify: Notify,
}

/// Awaitable handle for a call. Cloning shares the same call.
///
/// A future moves from `Pending` to exactly one of `Completed` or
/// `Cancelled`, once.
#[derive(Clone)]
pub struct ResponseFuture {
    inner: Arc<Inner>,
}

impl ResponseFuture {
    /// New pending future whose deadline is `timeout` from now.
    #[must_use]
    pub fn new(request_id: u64, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                request_id,
                created_at: Instant::now(),
                timeout,
                slot: Mutex::new(Slot::Pending(Vec::new())),
                notify: Notify::new(),
            }),
        }
    }

    /// Id of the request this future waits on.
    #[must_use]
    pub fn request_id(&self) -> u64 {
        self.inner.request_id
    }

    /// When the call was registered.
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.inner.created_at
    }

    /// Timeout the call was registered with.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Instant after which the call counts as timed out.
    ///
    /// `None` when the timeout is too large to represent; such a call never
    /// expires on its own.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.created_at.checked_add(self.inner.timeout)
    }

    /// Whether the deadline has passed at `now`.
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline().is_some_and(|deadline| now >= deadline)
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> FutureState {
        match &*self.inner.slot.lock() {
            Slot::Pending(_) => FutureState::Pending,
            Slot::Done(Completion::Completed(_)) => FutureState::Completed,
            Slot::Done(Completion::Cancelled(_)) => FutureState::Cancelled,
        }
    }

    /// Whether the future reached a terminal state.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state() != FutureState::Pending
    }

    /// Whether the future ended without a response.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state() == FutureState::Cancelled
    }

    /// Whether a response arrived and carries no remote error.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(
            &*self.inner.slot.lock(),
            Slot::Done(Completion::Completed(response)) if response.is_ok()
        )
    }

    /// The terminal outcome, if reached.
    #[must_use]
    pub fn completion(&self) -> Option<Completion> {
        match &*self.inner.slot.lock() {
            Slot::Pending(_) => None,
            Slot::Done(completion) => Some(completion.clone()),
        }
    }

    /// Deliver a response. Returns `false` if the future was already terminal.
    pub fn complete(&self, response: Response) -> bool {
        self.finish(Completion::Completed(response))
    }

    /// Cancel the call. Idempotent; returns `false` if already terminal.
    pub fn cancel(&self) -> bool {
        self.cancel_with(CancelReason::Explicit)
    }

    /// Cancel the call with a specific reason.
    pub fn cancel_with(&self, reason: CancelReason) -> bool {
        self.finish(Completion::Cancelled(reason))
    }

    /// Run `listener` once the future is terminal.
    ///
    /// If it already is, the listener runs immediately on the calling thread.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: FnOnce(&Completion) + Send + 'static,
    {
        let completion = {
            let mut slot = self.inner.slot.lock();
            match &mut *slot {
                Slot::Pending(listeners) => {
                    listeners.push(Box::new(listener));
                    return;
                }
                Slot::Done(completion) => completion.clone(),
            }
        };
        self.run_listener(Box::new(listener), &completion);
    }

    /// Wait for the outcome, at most until the deadline.
    ///
    /// A response carrying a remote error is returned as `Ok`; inspect
    /// [`Response::error`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] when the deadline passes first, or the
    /// cancellation cause when the call ended without a response.
    pub async fn get(&self) -> Result<Response> {
        let deadline = self.deadline();
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(completion) = self.completion() {
                return self.outcome(completion);
            }

            let Some(deadline) = deadline else {
                notified.await;
                continue;
            };

            if timeout_at(deadline, notified).await.is_err() {
                self.cancel_with(CancelReason::Timeout);
                // A response may have won the race
                let completion = self
                    .completion()
                    .unwrap_or(Completion::Cancelled(CancelReason::Timeout));
                return self.outcome(completion);
            }
        }
    }

    fn outcome(&self, completion: Completion) -> Result<Response> {
        match completion {
            Completion::Completed(response) => Ok(response),
            Completion::Cancelled(CancelReason::Timeout) => Err(Error::Timeout(self.timeout())),
            Completion::Cancelled(CancelReason::Disconnected) => {
                Err(ConnectionError::Closed.into())
            }
            Completion::Cancelled(CancelReason::Shutdown) => {
                Err(ConnectionError::ShuttingDown.into())
            }
            Completion::Cancelled(reason) => Err(Error::Cancelled(reason)),
        }
    }

    fn finish(&self, completion: Completion) -> bool {
        let listeners = {
            let mut slot = self.inner.slot.lock();
            match &mut *slot {
                Slot::Done(_) => return false,
                Slot::Pending(listeners) => {
                    let listeners = std::mem::take(listeners);
                    *slot = Slot::Done(completion.clone());
                    listeners
                }
            }
        };

        self.inner.notify.notify_waiters();

        for listener in listeners {
            self.run_listener(listener, &completion);
        }
        true
    }

    fn run_listener(&self, listener: Listener, completion: &Completion) {
        if catch_unwind(AssertUnwindSafe(|| listener(completion))).is_err() {
            warn!(
                "Listener for request {} panicked; ignoring",
                self.inner.request_id
            );
        }
    }
}

impl fmt::Debug for ResponseFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseFuture")
            .field("request_id", &self.inner.request_id)
            .field("timeout", &self.inner.timeout)
            .field("state", &self.state())
            .finish()
    }
}
