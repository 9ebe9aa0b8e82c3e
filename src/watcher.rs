//! Epoch boundary detection.
//!
//! The watcher reads the minimum epoch interval and the current epoch once,
//! emits that epoch, then alternates between sleeping until the earliest time
//! the next epoch may begin and polling the registry until the blockhash
//! changes. Any registry failure is fatal: it is reported once on the error
//! receiver and both receivers close.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::cancel::Done;
use crate::epoch::{Epoch, EpochRegistry};
use crate::error::DarknodeError;

/// Delay between registry polls once an epoch deadline has passed.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct EpochWatcher<R> {
    registry: Arc<R>,
    poll_interval: Duration,
}

impl<R: EpochRegistry + 'static> EpochWatcher<R> {
    pub fn new(registry: Arc<R>) -> Self {
        Self {
            registry,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// A zero interval polls in a tight loop that still yields to the runtime.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Spawns the watcher and returns its epoch and error receivers.
    pub fn run(self, done: Done) -> (mpsc::Receiver<Epoch>, mpsc::Receiver<DarknodeError>) {
        let (changes_tx, changes_rx) = mpsc::channel(1);
        let (errs_tx, errs_rx) = mpsc::channel(1);

        tokio::spawn(async move {
            if let Err(err) = self.watch(&done, &changes_tx).await {
                error!("epoch watcher stopped: {}", err);
                let _ = errs_tx.send(err).await;
            }
            debug!("epoch watcher closed");
        });

        (changes_rx, errs_rx)
    }

    async fn watch(&self, done: &Done, changes: &mpsc::Sender<Epoch>) -> Result<(), DarknodeError> {
        let interval = self.registry.minimum_epoch_interval().await.map_err(|e| {
            DarknodeError::Registry(format!("cannot get minimum epoch interval: {}", e))
        })?;
        let mut current = self
            .registry
            .current_epoch()
            .await
            .map_err(|e| DarknodeError::Registry(format!("cannot get current epoch: {}", e)))?;

        loop {
            if !done.send(changes, current.clone()).await {
                return Ok(());
            }
            info!(
                "epoch {} began ({})",
                current.ordinal,
                hex::encode(&current.blockhash[..8])
            );

            let deadline = current.next_deadline(interval)?;
            let delay = deadline
                .duration_since(SystemTime::now())
                .unwrap_or(Duration::ZERO);
            debug!("next epoch no earlier than {:?} from now", delay);
            tokio::select! {
                biased;
                _ = done.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }

            current = match self.next_epoch(done, &current).await? {
                Some(next) => next,
                None => return Ok(()),
            };
        }
    }

    /// Polls until the registry reports a different blockhash.
    ///
    /// Returns `None` when cancelled.
    async fn next_epoch(&self, done: &Done, current: &Epoch) -> Result<Option<Epoch>, DarknodeError> {
        loop {
            if done.is_cancelled() {
                return Ok(None);
            }
            let next = tokio::select! {
                biased;
                _ = done.cancelled() => return Ok(None),
                next = self.registry.current_epoch() => next.map_err(|e| {
                    DarknodeError::Registry(format!("cannot get next epoch: {}", e))
                })?,
            };
            if !next.same_blockhash(current) {
                return Ok(Some(next));
            }

            if self.poll_interval.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::select! {
                    biased;
                    _ = done.cancelled() => return Ok(None),
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }
    }
}

/// Runs an [`EpochWatcher`] with the default poll interval.
pub fn run_epoch_watcher<R: EpochRegistry + 'static>(
    done: Done,
    registry: Arc<R>,
) -> (mpsc::Receiver<Epoch>, mpsc::Receiver<DarknodeError>) {
    EpochWatcher::new(registry).run(done)
}
