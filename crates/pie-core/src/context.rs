//! Cancellation contexts for blocking network operations.
//!
//! Every accept, connect and read in Pie can be abandoned by its caller. A
//! [`Context`] is a cheap cloneable view of a cancellation flag; the
//! matching [`CancelHandle`] flips it. Cancellation is reported as
//! [`Error::Canceled`](crate::Error::Canceled), distinct from deadlines and
//! from transport closure.

use crate::error::{Error, Result};
use std::future::Future;
use tokio::sync::watch;

/// Cancellation scope passed to blocking operations
#[derive(Debug, Clone, Default)]
pub struct Context {
    cancel: Option<watch::Receiver<bool>>,
}

/// Cancels every [`Context`] cloned from the one it was created with
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl Context {
    /// A context that is never cancelled
    #[must_use]
    pub fn background() -> Self {
        Self { cancel: None }
    }

    /// A cancellable context and its handle
    #[must_use]
    pub fn with_cancel() -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        (Self { cancel: Some(rx) }, CancelHandle { tx })
    }

    /// Returns true once the context has been cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolves when the context is cancelled
    ///
    /// Never resolves for [`Context::background`] or when the handle was
    /// dropped without cancelling.
    pub async fn cancelled(&self) {
        let Some(rx) = &self.cancel else {
            return std::future::pending().await;
        };
        let mut rx = rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Run `fut` unless the context is cancelled first
    ///
    /// # Errors
    ///
    /// Returns [`Error::Canceled`] when cancellation wins, otherwise the
    /// future's own result.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.is_cancelled() {
            return Err(Error::Canceled);
        }
        tokio::select! {
            biased;
            () = self.cancelled() => Err(Error::Canceled),
            res = fut => res,
        }
    }
}

impl CancelHandle {
    /// Cancel the associated contexts
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Returns true once [`CancelHandle::cancel`] has been called
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}
