//! Pool resolution.
//!
//! Every epoch the registered darknodes are partitioned into pools. A node only
//! computes with the members of its own pool for the lifetime of the epoch.

use rayon::prelude::*;
use tracing::debug;

use crate::epoch::Epoch;
use crate::error::DarknodeError;
use crate::identity::{hash32, Address, NodeId};
use crate::threshold::threshold;

/// Ordered, immutable set of peer addresses for one epoch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pool {
    addresses: Vec<Address>,
}

impl Pool {
    pub fn new(addresses: Vec<Address>) -> Self {
        Self { addresses }
    }

    pub fn addresses(&self) -> &[Address] {
        &self.addresses
    }

    pub fn size(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.addresses.contains(address)
    }

    pub fn threshold(&self) -> usize {
        threshold(self.size())
    }
}

/// Maps a node to the pool it belongs to in a fixed epoch.
pub trait PoolResolver: Send + Sync {
    fn epoch(&self) -> &Epoch;

    fn pool(&self, id: &NodeId) -> Result<Pool, DarknodeError>;
}

/// Deterministic partition of the registered darknodes for one epoch.
///
/// Nodes are ranked by `blake2(blockhash || id)` and chunked into pools of
/// `pool_size`. A short trailing chunk is merged into the pool before it, so
/// every pool has at least `pool_size` members unless fewer nodes are
/// registered in total.
#[derive(Clone, Debug)]
pub struct DarkOcean {
    epoch: Epoch,
    pools: Vec<Pool>,
}

impl DarkOcean {
    pub fn new(epoch: Epoch, registered: &[NodeId], pool_size: usize) -> Result<Self, DarknodeError> {
        if pool_size == 0 {
            return Err(DarknodeError::InvalidParameter(
                "pool size must be positive".to_string(),
            ));
        }

        let mut ranked: Vec<([u8; 32], NodeId)> = registered
            .par_iter()
            .map(|id| (hash32(&[&epoch.blockhash, id.as_bytes()]), *id))
            .collect();
        ranked.par_sort_unstable();
        ranked.dedup_by(|a, b| a.1 == b.1);

        let mut pools: Vec<Pool> = ranked
            .chunks(pool_size)
            .map(|chunk| Pool::new(chunk.iter().map(|(_, id)| id.address()).collect()))
            .collect();
        if pools.len() > 1 && pools.last().map_or(false, |p| p.size() < pool_size) {
            if let Some(short) = pools.pop() {
                if let Some(last) = pools.last_mut() {
                    last.addresses.extend(short.addresses);
                }
            }
        }

        debug!(
            "epoch {}: {} nodes in {} pools",
            epoch.ordinal,
            ranked.len(),
            pools.len()
        );
        Ok(Self { epoch, pools })
    }

    pub fn pools(&self) -> &[Pool] {
        &self.pools
    }
}

impl PoolResolver for DarkOcean {
    fn epoch(&self) -> &Epoch {
        &self.epoch
    }

    fn pool(&self, id: &NodeId) -> Result<Pool, DarknodeError> {
        let address = id.address();
        self.pools
            .iter()
            .find(|pool| pool.contains(&address))
            .cloned()
            .ok_or_else(|| {
                DarknodeError::Pool(format!(
                    "node {} is not registered in epoch {}",
                    id, self.epoch.ordinal
                ))
            })
    }
}
