//! Delta fragments and reconstructed deltas.
//!
//! A delta fragment is one party's share of the difference between a buy
//! order and a sell order. Subtracting shares is linear, so each party can
//! compute its fragment locally; reconstructing the delta needs `k` fragments
//! from distinct parties.

use std::fmt;

use ark_bls12_381::Fr;
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};

use crate::error::DarknodeError;
use crate::identity::hash32;
use crate::order::{OrderFragment, OrderId, Parity};
use crate::smpc::shamir::{self, Share};

const HEADER_LENGTH: usize = 32 * 3 + 8;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeltaId(pub [u8; 32]);

impl DeltaId {
    pub fn for_orders(buy: &OrderId, sell: &OrderId) -> Self {
        Self(hash32(&[b"darknode/delta", &buy.0, &sell.0]))
    }
}

impl fmt::Display for DeltaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..4]))
    }
}

impl fmt::Debug for DeltaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeltaId({})", hex::encode(&self.0[..8]))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeltaFragment {
    pub delta_id: DeltaId,
    pub buy_order_id: OrderId,
    pub sell_order_id: OrderId,
    pub index: u64,
    pub price_share: Fr,
    pub volume_share: Fr,
}

impl DeltaFragment {
    /// Local share of `buy - sell` for two fragments held by the same party.
    pub fn from_orders(buy: &OrderFragment, sell: &OrderFragment) -> Result<Self, DarknodeError> {
        if buy.parity != Parity::Buy || sell.parity != Parity::Sell {
            return Err(DarknodeError::InvalidParameter(
                "delta needs one buy and one sell fragment".to_string(),
            ));
        }
        if buy.index != sell.index {
            return Err(DarknodeError::InvalidParameter(format!(
                "fragment indices differ ({} != {})",
                buy.index, sell.index
            )));
        }
        Ok(Self {
            delta_id: DeltaId::for_orders(&buy.order_id, &sell.order_id),
            buy_order_id: buy.order_id,
            sell_order_id: sell.order_id,
            index: buy.index,
            price_share: buy.price_share - sell.price_share,
            volume_share: buy.volume_share - sell.volume_share,
        })
    }

    /// Whether both fragments are shares of the same delta.
    pub fn is_compatible(&self, other: &DeltaFragment) -> bool {
        self.delta_id == other.delta_id
            && self.buy_order_id == other.buy_order_id
            && self.sell_order_id == other.sell_order_id
    }

    /// Binary encoding: the three ids, the index (big endian), then both
    /// shares in compressed canonical form.
    pub fn to_bytes(&self) -> Result<Vec<u8>, DarknodeError> {
        let mut bytes = Vec::with_capacity(HEADER_LENGTH + 2 * self.price_share.compressed_size());
        bytes.extend_from_slice(&self.delta_id.0);
        bytes.extend_from_slice(&self.buy_order_id.0);
        bytes.extend_from_slice(&self.sell_order_id.0);
        bytes.extend_from_slice(&self.index.to_be_bytes());
        self.price_share.serialize_compressed(&mut bytes)?;
        self.volume_share.serialize_compressed(&mut bytes)?;
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DarknodeError> {
        if bytes.len() < HEADER_LENGTH {
            return Err(DarknodeError::Serialization(format!(
                "delta fragment too short: {} bytes",
                bytes.len()
            )));
        }
        let id_at = |offset: usize| {
            let mut id = [0u8; 32];
            id.copy_from_slice(&bytes[offset..offset + 32]);
            id
        };
        let mut index = [0u8; 8];
        index.copy_from_slice(&bytes[96..HEADER_LENGTH]);

        let mut reader = &bytes[HEADER_LENGTH..];
        let price_share = Fr::deserialize_compressed(&mut reader)?;
        let volume_share = Fr::deserialize_compressed(&mut reader)?;
        if !reader.is_empty() {
            return Err(DarknodeError::Serialization(format!(
                "{} trailing bytes after delta fragment",
                reader.len()
            )));
        }

        Ok(Self {
            delta_id: DeltaId(id_at(0)),
            buy_order_id: OrderId(id_at(32)),
            sell_order_id: OrderId(id_at(64)),
            index: u64::from_be_bytes(index),
            price_share,
            volume_share,
        })
    }
}

/// Reconstructed difference between a buy order and a sell order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delta {
    pub id: DeltaId,
    pub buy_order_id: OrderId,
    pub sell_order_id: OrderId,
    pub price_delta: Fr,
    pub volume_delta: Fr,
}

impl Delta {
    /// Joins fragments from distinct parties. All fragments must share the
    /// same delta id and order ids.
    pub fn reconstruct(fragments: &[DeltaFragment]) -> Result<Self, DarknodeError> {
        let first = fragments.first().ok_or_else(|| {
            DarknodeError::InvalidParameter("no delta fragments to reconstruct".to_string())
        })?;
        if let Some(stray) = fragments.iter().find(|f| !first.is_compatible(f)) {
            return Err(DarknodeError::InvalidParameter(format!(
                "fragment for delta {} mixed into delta {}",
                stray.delta_id, first.delta_id
            )));
        }

        let prices: Vec<Share> = fragments
            .iter()
            .map(|f| Share {
                index: f.index,
                value: f.price_share,
            })
            .collect();
        let volumes: Vec<Share> = fragments
            .iter()
            .map(|f| Share {
                index: f.index,
                value: f.volume_share,
            })
            .collect();

        Ok(Self {
            id: first.delta_id,
            buy_order_id: first.buy_order_id,
            sell_order_id: first.sell_order_id,
            price_delta: shamir::join(&prices)?,
            volume_delta: shamir::join(&volumes)?,
        })
    }

    /// A delta is a match when the buy price is at least the sell price.
    pub fn is_match(&self) -> bool {
        shamir::is_non_negative(&self.price_delta)
    }

    pub fn price_delta_signed(&self) -> Option<i128> {
        shamir::to_signed(&self.price_delta)
    }

    pub fn volume_delta_signed(&self) -> Option<i128> {
        shamir::to_signed(&self.volume_delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::Order;
    use ark_std::test_rng;

    fn delta_fragments(buy_price: u64, sell_price: u64, n: usize, k: usize) -> Vec<DeltaFragment> {
        let mut rng = test_rng();
        let buy = Order::new(Parity::Buy, buy_price, 10, 0).split(n, k, &mut rng).unwrap();
        let sell = Order::new(Parity::Sell, sell_price, 4, 0).split(n, k, &mut rng).unwrap();
        buy.iter()
            .zip(&sell)
            .map(|(b, s)| DeltaFragment::from_orders(b, s).unwrap())
            .collect()
    }

    #[test]
    fn test_reconstruct_match() {
        let fragments = delta_fragments(1_200, 1_000, 4, 3);
        let delta = Delta::reconstruct(&fragments[1..]).unwrap();
        assert!(delta.is_match());
        assert_eq!(delta.price_delta_signed(), Some(200));
        assert_eq!(delta.volume_delta_signed(), Some(6));
        assert_eq!(delta.id, fragments[0].delta_id);
    }

    #[test]
    fn test_reconstruct_non_match() {
        let fragments = delta_fragments(900, 1_000, 4, 3);
        let delta = Delta::reconstruct(&fragments[..3]).unwrap();
        assert!(!delta.is_match());
        assert_eq!(delta.price_delta_signed(), Some(-100));
    }

    #[test]
    fn test_equal_prices_match() {
        let fragments = delta_fragments(1_000, 1_000, 3, 2);
        assert!(Delta::reconstruct(&fragments[..2]).unwrap().is_match());
    }

    #[test]
    fn test_from_orders_rejects_mismatched_inputs() {
        let mut rng = test_rng();
        let buy = Order::new(Parity::Buy, 1, 1, 0).split(3, 2, &mut rng).unwrap();
        let sell = Order::new(Parity::Sell, 1, 1, 0).split(3, 2, &mut rng).unwrap();
        assert!(DeltaFragment::from_orders(&buy[0], &sell[1]).is_err());
        assert!(DeltaFragment::from_orders(&sell[0], &buy[0]).is_err());
    }

    #[test]
    fn test_reconstruct_rejects_mixed_deltas() {
        let mut a = delta_fragments(5, 1, 3, 2);
        let b = delta_fragments(5, 2, 3, 2);
        a[1] = b[1].clone();
        assert!(Delta::reconstruct(&a[..2]).is_err());
    }

    #[test]
    fn test_bytes_decode_and_reject_garbage() {
        let fragment = delta_fragments(7, 3, 3, 2).remove(0);
        let bytes = fragment.to_bytes().unwrap();
        assert_eq!(DeltaFragment::from_bytes(&bytes).unwrap(), fragment);

        assert!(DeltaFragment::from_bytes(&bytes[..50]).is_err());
        assert!(DeltaFragment::from_bytes(&bytes[..bytes.len() - 1]).is_err());
        let mut padded = bytes.clone();
        padded.push(0);
        assert!(DeltaFragment::from_bytes(&padded).is_err());
    }
}
