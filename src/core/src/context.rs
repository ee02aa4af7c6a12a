//! Build context with cooperative cancellation.
//!
//! A build runs to its next suspension point (filesystem phase boundary,
//! subprocess wait, registry fetch) and then aborts with
//! [`BuildError::Canceled`] once the context has been canceled. Signalling
//! uses a `tokio::sync::watch` channel so that any number of cloned
//! contexts observe a single cancel.

use tokio::sync::watch;

use crate::error::{BuildError, Result};

/// Cancellation context threaded through a build.
///
/// Cloning is cheap; all clones observe the same cancel signal.
#[derive(Debug, Clone)]
pub struct BuildContext {
    cancel: Option<watch::Receiver<bool>>,
}

/// Handle used to cancel an associated [`BuildContext`].
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl BuildContext {
    /// A context that can never be canceled.
    pub fn background() -> Self {
        Self { cancel: None }
    }

    /// A cancelable context and the handle that cancels it.
    pub fn cancellable() -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        (Self { cancel: Some(rx) }, CancelHandle { tx })
    }

    /// Whether the context has been canceled.
    pub fn is_canceled(&self) -> bool {
        self.cancel.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Fail fast at a suspension point.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_canceled() {
            Err(BuildError::Canceled)
        } else {
            Ok(())
        }
    }

    /// Resolves when the context is canceled; pends forever otherwise.
    ///
    /// Intended for use in `tokio::select!` against an in-flight operation.
    pub async fn canceled(&self) {
        let Some(rx) = &self.cancel else {
            return std::future::pending().await;
        };
        let mut rx = rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
        // Sender dropped without canceling: this context can no longer
        // be canceled.
        std::future::pending().await
    }
}

impl CancelHandle {
    /// Cancel the associated context.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}
