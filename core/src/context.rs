//! Shared deadline and cancellation for one export or import.
//!
//! Every network call made on behalf of an operation runs through
//! [`OperationContext::run`], so a single deadline bounds the registry,
//! signer and storage calls together.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{MirrorError, Result};

/// Deadline and cancellation token shared by all stages of an operation.
#[derive(Debug, Clone)]
pub struct OperationContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl OperationContext {
    /// A context without a deadline.
    pub fn unbounded() -> Self {
        Self {
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    /// A context expiring `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            cancel: CancellationToken::new(),
        }
    }

    /// A child sharing this deadline; cancelling the parent cancels the child.
    pub fn child(&self) -> Self {
        Self {
            deadline: self.deadline,
            cancel: self.cancel.child_token(),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Time left before the deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Fail fast if the operation is already over.
    pub fn check(&self, what: &str) -> Result<()> {
        if self.is_cancelled() {
            return Err(MirrorError::Cancelled(what.to_string()));
        }
        if matches!(self.remaining(), Some(left) if left.is_zero()) {
            return Err(MirrorError::TimeoutError(format!("{} exceeded deadline", what)));
        }
        Ok(())
    }

    /// Run `fut` until it completes, the deadline passes, or the context is cancelled.
    pub async fn run<F, T>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check(what)?;
        let deadline = self.deadline;
        let sleep = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            result = fut => result,
            _ = self.cancel.cancelled() => Err(MirrorError::Cancelled(what.to_string())),
            _ = sleep => Err(MirrorError::TimeoutError(format!("{} exceeded deadline", what))),
        }
    }
}

impl Default for OperationContext {
    fn default() -> Self {
        Self::unbounded()
    }
}
