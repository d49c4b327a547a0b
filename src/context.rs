//! Operation context
//!
//! Every inbound request and every outbound federation task carries an
//! `OpContext`: a cancellation token plus an optional deadline. Network and
//! store calls are wrapped in [`OpContext::run`] so that a cancelled or
//! overdue operation surfaces as `AppError::Cancelled` / `AppError::Timeout`
//! instead of hanging.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct OpContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl OpContext {
    /// Context with no deadline, cancelled only explicitly.
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Context that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Guard that cancels this context when dropped.
    pub fn drop_guard(&self) -> DropGuard {
        self.token.clone().drop_guard()
    }

    /// Fail fast if the context is already cancelled or past its deadline.
    pub fn check(&self, label: &'static str) -> Result<(), AppError> {
        if self.token.is_cancelled() {
            return Err(AppError::Cancelled(label));
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(AppError::Timeout(label));
        }
        Ok(())
    }

    /// Run `fut` until it completes, the context is cancelled, or the deadline passes.
    pub async fn run<T, F>(&self, label: &'static str, fut: F) -> Result<T, AppError>
    where
        F: Future<Output = Result<T, AppError>>,
    {
        self.check(label)?;

        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(AppError::Cancelled(label)),
            _ = deadline => Err(AppError::Timeout(label)),
            result = fut => result,
        }
    }
}

impl Default for OpContext {
    fn default() -> Self {
        Self::background()
    }
}
