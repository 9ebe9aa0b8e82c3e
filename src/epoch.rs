//! Epochs and the registry they are read from.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DarknodeError;

pub type Blockhash = [u8; 32];

/// A registry-defined time window during which one pool assignment is valid.
///
/// Two epochs are the same epoch iff their blockhashes are byte-equal; the
/// other fields never take part in change detection.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Epoch {
    pub blockhash: Blockhash,
    /// Unix seconds at which the epoch began.
    pub timestamp: u64,
    pub ordinal: u64,
}

impl Epoch {
    pub fn new(blockhash: Blockhash, timestamp: u64, ordinal: u64) -> Self {
        Self {
            blockhash,
            timestamp,
            ordinal,
        }
    }

    pub fn same_blockhash(&self, other: &Epoch) -> bool {
        self.blockhash == other.blockhash
    }

    /// Earliest wall-clock time at which the next epoch may begin.
    pub fn next_deadline(&self, interval: Duration) -> Result<SystemTime, DarknodeError> {
        let next = self.timestamp.checked_add(interval.as_secs()).ok_or_else(|| {
            DarknodeError::TimestampConversion(format!(
                "{} + {}s overflows",
                self.timestamp,
                interval.as_secs()
            ))
        })?;
        UNIX_EPOCH
            .checked_add(Duration::from_secs(next))
            .ok_or_else(|| {
                DarknodeError::TimestampConversion(format!("{} is not a valid unix time", next))
            })
    }
}

impl fmt::Debug for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Epoch")
            .field("ordinal", &self.ordinal)
            .field("blockhash", &hex::encode(&self.blockhash[..8]))
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

/// Source of truth for the current epoch.
#[async_trait]
pub trait EpochRegistry: Send + Sync {
    async fn current_epoch(&self) -> Result<Epoch, DarknodeError>;

    async fn minimum_epoch_interval(&self) -> Result<Duration, DarknodeError>;
}
