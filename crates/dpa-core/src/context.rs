//! Per-request call context threaded into every backend call

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::error::{BackendError, BackendResult};
use crate::models::UserInfo;

/// Caller identity plus the cancellation and deadline of the inbound request.
///
/// Handlers create one per request and keep the guard from
/// [`RequestContext::cancel_on_drop`] alive for the lifetime of the handler
/// future, so a client disconnect (which drops that future) cancels every
/// call derived from the context.
#[derive(Debug, Clone)]
pub struct RequestContext {
    user: Option<UserInfo>,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl RequestContext {
    pub fn new(user: Option<UserInfo>) -> Self {
        Self {
            user,
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Context with no user, no deadline; used by background probes
    pub fn background() -> Self {
        Self::new(None)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Tie this context to a parent token (e.g. process shutdown)
    pub fn with_parent(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    pub fn user(&self) -> Option<&UserInfo> {
        self.user.as_ref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` when unbounded
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Derived context for a sub-call; cancelling the parent cancels it
    pub fn child(&self) -> Self {
        Self {
            user: self.user.clone(),
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
        }
    }

    /// Guard that cancels this context when dropped
    pub fn cancel_on_drop(&self) -> DropGuard {
        self.cancel.clone().drop_guard()
    }

    /// Drive `fut` to completion unless the context is cancelled or its
    /// deadline passes first.
    pub async fn run<F, T>(&self, fut: F) -> BackendResult<T>
    where
        F: Future<Output = BackendResult<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.cancel.cancelled() => Err(BackendError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => Err(BackendError::DeadlineExceeded),
                res = fut => res,
            },
            None => tokio::select! {
                _ = self.cancel.cancelled() => Err(BackendError::Cancelled),
                res = fut => res,
            },
        }
    }
}
