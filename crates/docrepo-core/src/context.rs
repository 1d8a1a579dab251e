//! Execution context for store calls
//!
//! Every repository operation takes a [`Context`] that bounds how long the
//! call may run and lets another task abort it. A context carries an optional
//! deadline and any number of cancellation signals inherited from its parents.
//!
//! ```ignore
//! let ctx = Context::with_timeout(Duration::from_secs(2));
//! let (ctx, cancel) = ctx.with_cancel();
//! tokio::spawn(async move { shutdown.await; cancel.cancel(); });
//! let users = repo.find_many(&ctx, filter).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use futures_util::future::select_all;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{RepoError, RepoResult};

/// Deadline and cancellation scope for store calls
#[derive(Debug, Clone, Default)]
pub struct Context {
    deadline: Option<Instant>,
    signals: Vec<watch::Receiver<bool>>,
}

/// Cancels every context derived from the one it was created with
#[derive(Debug)]
pub struct CancelHandle {
    sender: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }
}

impl Context {
    /// A context that never expires and cannot be cancelled
    pub fn background() -> Self {
        Self::default()
    }

    /// A context that expires after `timeout`
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// A context that expires at `deadline`
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            signals: Vec::new(),
        }
    }

    /// A child context expiring after `timeout` or at the parent deadline,
    /// whichever comes first
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(parent) if parent < candidate => parent,
            _ => candidate,
        };
        Self {
            deadline: Some(deadline),
            signals: self.signals.clone(),
        }
    }

    /// A child context that can be cancelled independently of its parent
    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        let (sender, receiver) = watch::channel(false);
        let mut signals = self.signals.clone();
        signals.push(receiver);
        (
            Self {
                deadline: self.deadline,
                signals,
            },
            CancelHandle { sender },
        )
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` without one
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.signals.iter().any(|signal| *signal.borrow())
    }

    pub fn is_expired(&self) -> bool {
        self.deadline
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(false)
    }

    /// The reason this context is done, if it is
    pub fn err(&self) -> Option<RepoError> {
        if self.is_cancelled() {
            Some(RepoError::Cancelled)
        } else if self.is_expired() {
            Some(RepoError::DeadlineExceeded)
        } else {
            None
        }
    }

    /// Resolves once any inherited cancellation signal fires
    pub async fn cancelled(&self) {
        if self.signals.is_empty() {
            return std::future::pending().await;
        }

        let waits = self.signals.iter().cloned().map(|mut signal| {
            Box::pin(async move {
                loop {
                    if *signal.borrow_and_update() {
                        return;
                    }
                    // Handle dropped without cancelling: never fires
                    if signal.changed().await.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
            })
        });

        select_all(waits).await;
    }

    /// Run `operation` within this context
    ///
    /// The operation is dropped (aborting the in-flight call) as soon as the
    /// context is cancelled or its deadline passes.
    pub async fn run<T, F>(&self, operation: F) -> RepoResult<T>
    where
        F: Future<Output = RepoResult<T>>,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }

        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancelled() => Err(RepoError::Cancelled),
            _ = expired => Err(RepoError::DeadlineExceeded),
            result = operation => result,
        }
    }
}
