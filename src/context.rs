//! Request context: deadline and cancellation for a unit of work

use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::BankError;

/// Caller-side switch that cancels every context derived from it.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        // send_replace succeeds even with no receivers left
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Deadline and cancellation signal bound to one request.
///
/// The default context never expires.
#[derive(Debug, Clone, Default)]
pub struct TxContext {
    deadline: Option<Instant>,
    cancel: Option<watch::Receiver<bool>>,
}

impl TxContext {
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::default().deadline(Instant::now() + timeout)
    }

    /// A context plus the handle that cancels it.
    pub fn with_cancel() -> (CancelHandle, Self) {
        let (tx, rx) = watch::channel(false);
        let ctx = Self {
            deadline: None,
            cancel: Some(rx),
        };
        (CancelHandle { tx }, ctx)
    }

    /// Tighten the deadline. A later deadline than the current one is ignored.
    pub fn deadline(mut self, at: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) => current.min(at),
            None => at,
        });
        self
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Fail fast if the context is already done.
    pub fn check(&self) -> Result<(), BankError> {
        if let Some(rx) = &self.cancel
            && *rx.borrow()
        {
            return Err(BankError::Cancelled);
        }
        if let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            return Err(BankError::DeadlineExceeded);
        }
        Ok(())
    }

    /// Resolves with the reason once the context is done; pends forever for
    /// a background context.
    pub async fn done(&self) -> BankError {
        let deadline = async {
            match self.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        let cancelled = async {
            match self.cancel.clone() {
                Some(mut rx) => {
                    let handle_dropped = rx.wait_for(|cancelled| *cancelled).await.is_err();
                    // A dropped handle can never cancel.
                    if handle_dropped {
                        std::future::pending::<()>().await;
                    }
                }
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = cancelled => BankError::Cancelled,
            _ = deadline => BankError::DeadlineExceeded,
        }
    }
}
