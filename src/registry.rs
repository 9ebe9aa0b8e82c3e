//! In-process epoch registries.
//!
//! [`ClockRegistry`] derives epochs from the wall clock and is what the
//! simulation binary runs against. [`MemoryRegistry`] is driven by hand and
//! can be told to fail, which makes it the registry of choice for tests.

use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tracing::debug;

use crate::epoch::{Epoch, EpochRegistry};
use crate::error::DarknodeError;
use crate::identity::hash32;

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Registry whose epochs tick over every `interval` seconds since `genesis`.
#[derive(Debug, Clone)]
pub struct ClockRegistry {
    genesis: u64,
    interval: Duration,
}

impl ClockRegistry {
    pub fn new(genesis: u64, interval: Duration) -> Result<Self, DarknodeError> {
        if interval.as_secs() == 0 {
            return Err(DarknodeError::InvalidParameter(
                "epoch interval must be at least one second".to_string(),
            ));
        }
        Ok(Self { genesis, interval })
    }

    /// Epoch in force at unix time `now`.
    pub fn epoch_at(&self, now: u64) -> Epoch {
        let secs = self.interval.as_secs();
        let ordinal = now.saturating_sub(self.genesis) / secs;
        let timestamp = self.genesis + ordinal * secs;
        let blockhash = hash32(&[
            b"darknode/epoch",
            &self.genesis.to_be_bytes(),
            &ordinal.to_be_bytes(),
        ]);
        Epoch::new(blockhash, timestamp, ordinal)
    }
}

#[async_trait]
impl EpochRegistry for ClockRegistry {
    async fn current_epoch(&self) -> Result<Epoch, DarknodeError> {
        Ok(self.epoch_at(unix_now()))
    }

    async fn minimum_epoch_interval(&self) -> Result<Duration, DarknodeError> {
        Ok(self.interval)
    }
}

#[derive(Debug)]
struct MemoryRegistryState {
    epoch: Epoch,
    interval: Duration,
    fail_current: bool,
    fail_interval: bool,
    polls: u64,
}

/// Registry holding a single settable epoch.
#[derive(Debug)]
pub struct MemoryRegistry {
    state: Mutex<MemoryRegistryState>,
}

impl MemoryRegistry {
    pub fn new(epoch: Epoch, interval: Duration) -> Self {
        Self {
            state: Mutex::new(MemoryRegistryState {
                epoch,
                interval,
                fail_current: false,
                fail_interval: false,
                polls: 0,
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryRegistryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_epoch(&self, epoch: Epoch) {
        self.state().epoch = epoch;
    }

    /// Moves to a fresh epoch stamped with the current time and returns it.
    pub fn advance(&self) -> Epoch {
        let mut state = self.state();
        let next = Epoch::new(
            hash32(&[b"darknode/next", &state.epoch.blockhash]),
            unix_now(),
            state.epoch.ordinal + 1,
        );
        debug!("registry advanced to epoch {}", next.ordinal);
        state.epoch = next.clone();
        next
    }

    pub fn fail_current_epoch(&self, fail: bool) {
        self.state().fail_current = fail;
    }

    pub fn fail_minimum_interval(&self, fail: bool) {
        self.state().fail_interval = fail;
    }

    /// Number of `current_epoch` reads served so far.
    pub fn polls(&self) -> u64 {
        self.state().polls
    }
}

#[async_trait]
impl EpochRegistry for MemoryRegistry {
    async fn current_epoch(&self) -> Result<Epoch, DarknodeError> {
        let mut state = self.state();
        state.polls += 1;
        if state.fail_current {
            return Err(DarknodeError::Unavailable("registry unreachable".to_string()));
        }
        Ok(state.epoch.clone())
    }

    async fn minimum_epoch_interval(&self) -> Result<Duration, DarknodeError> {
        let state = self.state();
        if state.fail_interval {
            return Err(DarknodeError::Unavailable("registry unreachable".to_string()));
        }
        Ok(state.interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_registry_rejects_zero_interval() {
        assert!(ClockRegistry::new(0, Duration::from_millis(500)).is_err());
    }

    #[test]
    fn test_clock_registry_epochs() {
        let registry = ClockRegistry::new(1_000, Duration::from_secs(10)).unwrap();

        let first = registry.epoch_at(1_000);
        let same = registry.epoch_at(1_009);
        let next = registry.epoch_at(1_010);

        assert_eq!(first.ordinal, 0);
        assert_eq!(first.timestamp, 1_000);
        assert!(first.same_blockhash(&same));
        assert_eq!(next.ordinal, 1);
        assert_eq!(next.timestamp, 1_010);
        assert!(!first.same_blockhash(&next));
    }

    #[tokio::test]
    async fn test_memory_registry_advance_and_failures() {
        let registry = MemoryRegistry::new(Epoch::new([0u8; 32], 0, 0), Duration::from_secs(5));
        let first = registry.current_epoch().await.unwrap();
        let next = registry.advance();
        assert!(!first.same_blockhash(&next));
        assert_eq!(registry.current_epoch().await.unwrap(), next);
        assert_eq!(registry.polls(), 2);

        registry.fail_current_epoch(true);
        assert!(registry.current_epoch().await.is_err());
        registry.fail_minimum_interval(true);
        assert!(registry.minimum_epoch_interval().await.is_err());
    }
}
