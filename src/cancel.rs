//! Cancellation signal shared by every task of a watcher or epoch process.
//!
//! A [`Canceller`] fires exactly once: either explicitly through
//! [`Canceller::cancel`] or implicitly when it is dropped. Every [`Done`]
//! observing it then resolves [`Done::cancelled`]. [`Done::scoped`] bounds a
//! single operation by both a timeout and the signal.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

/// Creates a fresh cancellation signal.
pub fn done_channel() -> (Canceller, Done) {
    let (tx, rx) = watch::channel(false);
    (Canceller { tx: Arc::new(tx) }, Done { rx })
}

/// Owning side of the signal. Dropping it cancels.
#[derive(Debug)]
pub struct Canceller {
    tx: Arc<watch::Sender<bool>>,
}

impl Canceller {
    /// Fires the signal.
    pub fn cancel(self) {
        self.tx.send_replace(true);
    }

    /// Returns another observer of this signal.
    pub fn done(&self) -> Done {
        Done {
            rx: self.tx.subscribe(),
        }
    }
}

impl Drop for Canceller {
    fn drop(&mut self) {
        self.tx.send_replace(true);
    }
}

/// Observing side of the signal.
#[derive(Debug, Clone)]
pub struct Done {
    rx: watch::Receiver<bool>,
}

/// Outcome of an operation run under [`Done::scoped`].
#[derive(Debug, PartialEq, Eq)]
pub enum Scoped<T> {
    Completed(T),
    TimedOut,
    Cancelled,
}

impl Done {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolves once the signal has fired.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Runs `fut` until it completes, `timeout` elapses, or the signal fires.
    ///
    /// Cancellation wins over completion when both are ready.
    pub async fn scoped<F: Future>(&self, timeout: Duration, fut: F) -> Scoped<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancelled() => Scoped::Cancelled,
            res = tokio::time::timeout(timeout, fut) => match res {
                Ok(value) => Scoped::Completed(value),
                Err(_) => Scoped::TimedOut,
            },
        }
    }

    /// Sends `value` unless the signal fires first.
    ///
    /// Returns `false` if cancelled or if the receiver is gone.
    pub async fn send<T>(&self, tx: &mpsc::Sender<T>, value: T) -> bool {
        tokio::select! {
            biased;
            _ = self.cancelled() => false,
            res = tx.send(value) => res.is_ok(),
        }
    }

    /// Derives a signal that fires when either its own canceller or `self` fires.
    ///
    /// Must be called from within a tokio runtime.
    pub fn child(&self) -> (Canceller, Done) {
        let (canceller, done) = done_channel();
        let parent = self.clone();
        let child = done.clone();
        let tx = Arc::clone(&canceller.tx);
        tokio::spawn(async move {
            tokio::select! {
                _ = parent.cancelled() => {
                    tx.send_replace(true);
                }
                _ = child.cancelled() => {}
            }
        });
        (canceller, done)
    }
}
