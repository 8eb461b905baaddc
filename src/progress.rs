//! Progress reporting and cancellation for long-running operations.
//!
//! The bootstrap loop and the update pipeline run as background tasks that
//! publish human-readable progress strings and race every blocking step
//! against a cancel signal. The UI side holds the receiver and the guard;
//! the core holds clones of the sender and token.

use tokio::sync::{mpsc, watch};

// =============================================================================
// Progress
// =============================================================================

/// Sender half of a progress string channel.
#[derive(Debug, Clone)]
pub struct Progress {
    tx: Option<mpsc::UnboundedSender<String>>,
}

impl Progress {
    /// Creates a progress channel.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that drops every update, for callers without a UI.
    #[must_use]
    pub fn discard() -> Self {
        Self { tx: None }
    }

    /// Publishes one progress update. Never blocks; a gone receiver is
    /// treated like [`Self::discard`].
    pub fn update(&self, msg: impl Into<String>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(msg.into());
        }
    }
}

// =============================================================================
// Cancellation
// =============================================================================

/// Owner side of a cancellation signal.
#[derive(Debug)]
pub struct CancelGuard {
    tx: watch::Sender<bool>,
}

impl CancelGuard {
    /// Fires the signal. Every token observes it.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Observer side of a cancellation signal.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// Creates a guard/token pair.
    #[must_use]
    pub fn new() -> (CancelGuard, Self) {
        let (tx, rx) = watch::channel(false);
        (CancelGuard { tx }, Self { rx })
    }

    /// A token that can never fire, for non-interactive callers.
    #[must_use]
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Leaking the sender keeps the channel open forever.
        std::mem::forget(tx);
        Self { rx }
    }

    /// True once the guard has fired.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when the guard fires. If the guard is dropped without
    /// firing, this pends forever (the operation simply runs to
    /// completion).
    pub async fn canceled(&mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
