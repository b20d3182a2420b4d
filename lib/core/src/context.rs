//! Caller-supplied deadline and cancellation for collaborator calls.
//!
//! Every call to the host platform or the extraction service goes through
//! [`CallContext::run`], which races the call against the per-call timeout and
//! the request's cancellation signal.

use crate::{Error, Result};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct CallContext {
    timeout: Duration,
    cancel: watch::Receiver<bool>,
}

/// Trips the cancellation signal of every [`CallContext`] cloned from its pair.
#[derive(Debug)]
pub struct CancelHandle {
    sender: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        // send_replace never fails, even with no receivers left
        self.sender.send_replace(true);
    }
}

impl CallContext {
    /// A context whose calls can be cancelled through the returned handle.
    pub fn new(timeout: Duration) -> (Self, CancelHandle) {
        let (sender, cancel) = watch::channel(false);
        (Self { timeout, cancel }, CancelHandle { sender })
    }

    /// A context that only enforces the timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new(timeout).0
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Fail with [`Error::Cancelled`] if the request has been cancelled.
    pub fn check(&self, operation: &str) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled(operation.to_string()));
        }
        Ok(())
    }

    /// Run one collaborator call under this context.
    pub async fn run<T, F>(&self, operation: &str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check(operation)?;

        let started = Instant::now();
        let mut cancel = self.cancel.clone();
        tokio::select! {
            outcome = tokio::time::timeout(self.timeout, call) => match outcome {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout {
                    operation: operation.to_string(),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                }),
            },
            _ = cancelled(&mut cancel) => Err(Error::Cancelled(operation.to_string())),
        }
    }
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            // handle dropped without cancelling; the call can only time out now
            std::future::pending::<()>().await;
        }
    }
}
