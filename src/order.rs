use std::fmt;

use ark_bls12_381::Fr;
use ark_std::rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::DarknodeError;
use crate::identity::hash32;
use crate::smpc::shamir;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrderId(pub [u8; 32]);

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..4]))
    }
}

impl fmt::Debug for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OrderId({})", hex::encode(&self.0[..8]))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Parity {
    Buy,
    Sell,
}

impl Parity {
    fn tag(self) -> u8 {
        match self {
            Parity::Buy => 0,
            Parity::Sell => 1,
        }
    }
}

/// A trader's order before it is secret-shared across a pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Order {
    pub id: OrderId,
    pub parity: Parity,
    pub price: u64,
    pub volume: u64,
}

impl Order {
    pub fn new(parity: Parity, price: u64, volume: u64, nonce: u64) -> Self {
        let id = OrderId(hash32(&[
            b"darknode/order",
            &[parity.tag()],
            &price.to_be_bytes(),
            &volume.to_be_bytes(),
            &nonce.to_be_bytes(),
        ]));
        Self {
            id,
            parity,
            price,
            volume,
        }
    }

    /// Shares price and volume across `n` parties with threshold `k`.
    ///
    /// Fragment `i` (1-indexed) belongs to the `i`-th member of the pool.
    pub fn split<R: RngCore>(
        &self,
        n: usize,
        k: usize,
        rng: &mut R,
    ) -> Result<Vec<OrderFragment>, DarknodeError> {
        let prices = shamir::split(Fr::from(self.price), n, k, rng)?;
        let volumes = shamir::split(Fr::from(self.volume), n, k, rng)?;
        Ok(prices
            .into_iter()
            .zip(volumes)
            .map(|(price, volume)| OrderFragment {
                order_id: self.id,
                parity: self.parity,
                index: price.index,
                price_share: price.value,
                volume_share: volume.value,
            })
            .collect())
    }
}

/// One party's share of an order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrderFragment {
    pub order_id: OrderId,
    pub parity: Parity,
    pub index: u64,
    pub price_share: Fr,
    pub volume_share: Fr,
}
