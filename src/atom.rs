//! Cross-chain atomic swaps.
//!
//! A matched delta is settled by a pair of hash-time-locked contracts, one
//! per ledger. [`AtomContract`] is the interface every ledger binding
//! implements; [`MemoryAtomContract`] is an in-memory escrow with the same
//! state machine, used by the simulation and in tests.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::DarknodeError;
use crate::identity::hash32;
use crate::registry::unix_now;
use crate::smpc::Delta;

/// Ledgers a swap leg can live on. Testnets carry negative discriminants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum Ledger {
    Bitcoin = 1,
    Ethereum = 2,
    BitcoinTestnet = -1,
    EthereumRopsten = -2,
}

impl Ledger {
    pub fn is_testnet(self) -> bool {
        i64::from(self) < 0
    }
}

impl TryFrom<i64> for Ledger {
    type Error = DarknodeError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Ledger::Bitcoin),
            2 => Ok(Ledger::Ethereum),
            -1 => Ok(Ledger::BitcoinTestnet),
            -2 => Ok(Ledger::EthereumRopsten),
            other => Err(DarknodeError::InvalidLedger(other)),
        }
    }
}

impl From<Ledger> for i64 {
    fn from(ledger: Ledger) -> Self {
        ledger as i64
    }
}

/// One leg of an atomic swap.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Atom {
    pub ledger: Ledger,
    /// Ledger-specific contract data
    pub ledger_data: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Preimage of a swap's hash lock. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop, PartialEq, Eq)]
pub struct SwapSecret(Vec<u8>);

impl SwapSecret {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Secret derived from a node-local seed and the delta being settled.
    pub fn for_delta(seed: &[u8], delta: &Delta) -> Self {
        Self(hash32(&[b"darknode/secret", seed, &delta.id.0]).to_vec())
    }

    pub fn hash_lock(&self) -> [u8; 32] {
        hash32(&[&self.0])
    }
}

impl fmt::Debug for SwapSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SwapSecret([REDACTED])")
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapDetails {
    pub hash: [u8; 32],
    pub to: Vec<u8>,
    pub from: Vec<u8>,
    pub value: u128,
    /// Unix seconds after which the initiator may refund
    pub expiry: u64,
}

/// Hash-time-locked contract on one ledger.
#[async_trait]
pub trait AtomContract: Send + Sync {
    async fn initiate(
        &self,
        hash: [u8; 32],
        to: &[u8],
        from: &[u8],
        value: u128,
        expiry: u64,
    ) -> Result<(), DarknodeError>;

    async fn read(&self) -> Result<SwapDetails, DarknodeError>;

    /// Secret revealed by a redemption.
    async fn read_secret(&self) -> Result<SwapSecret, DarknodeError>;

    async fn redeem(&self, secret: &SwapSecret) -> Result<(), DarknodeError>;

    async fn refund(&self) -> Result<(), DarknodeError>;

    /// Serialized contract state, suitable for [`Atom::ledger_data`].
    async fn data(&self) -> Result<Vec<u8>, DarknodeError>;
}

#[derive(Debug, Clone)]
enum SwapState {
    Empty,
    Initiated(SwapDetails),
    Redeemed(SwapDetails, SwapSecret),
    Refunded(SwapDetails),
}

#[derive(Serialize)]
struct ContractData<'a> {
    ledger: Ledger,
    state: &'a str,
    details: Option<&'a SwapDetails>,
}

/// Source of the current unix time in seconds.
pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

/// In-memory escrow: Empty → Initiated → Redeemed | Refunded.
pub struct MemoryAtomContract {
    ledger: Ledger,
    state: Mutex<SwapState>,
    clock: Clock,
}

impl MemoryAtomContract {
    pub fn new(ledger: Ledger) -> Self {
        Self::with_clock(ledger, Arc::new(unix_now))
    }

    /// Uses `clock` (unix seconds) to evaluate expiry.
    pub fn with_clock(ledger: Ledger, clock: Clock) -> Self {
        Self {
            ledger,
            state: Mutex::new(SwapState::Empty),
            clock,
        }
    }

    pub fn ledger(&self) -> Ledger {
        self.ledger
    }

    pub async fn atom(&self, signature: Vec<u8>) -> Result<Atom, DarknodeError> {
        Ok(Atom {
            ledger: self.ledger,
            ledger_data: self.data().await?,
            signature,
        })
    }
}

#[async_trait]
impl AtomContract for MemoryAtomContract {
    async fn initiate(
        &self,
        hash: [u8; 32],
        to: &[u8],
        from: &[u8],
        value: u128,
        expiry: u64,
    ) -> Result<(), DarknodeError> {
        let mut state = self.state.lock().await;
        if !matches!(*state, SwapState::Empty) {
            return Err(DarknodeError::Swap("swap already initiated".to_string()));
        }
        if expiry <= (self.clock)() {
            return Err(DarknodeError::Swap("expiry is in the past".to_string()));
        }
        *state = SwapState::Initiated(SwapDetails {
            hash,
            to: to.to_vec(),
            from: from.to_vec(),
            value,
            expiry,
        });
        Ok(())
    }

    async fn read(&self) -> Result<SwapDetails, DarknodeError> {
        match &*self.state.lock().await {
            SwapState::Empty => Err(DarknodeError::Swap("swap not initiated".to_string())),
            SwapState::Initiated(details)
            | SwapState::Redeemed(details, _)
            | SwapState::Refunded(details) => Ok(details.clone()),
        }
    }

    async fn read_secret(&self) -> Result<SwapSecret, DarknodeError> {
        match &*self.state.lock().await {
            SwapState::Redeemed(_, secret) => Ok(secret.clone()),
            _ => Err(DarknodeError::Swap("swap not redeemed".to_string())),
        }
    }

    async fn redeem(&self, secret: &SwapSecret) -> Result<(), DarknodeError> {
        let mut state = self.state.lock().await;
        let details = match &*state {
            SwapState::Initiated(details) => details.clone(),
            _ => return Err(DarknodeError::Swap("swap is not open".to_string())),
        };
        if (self.clock)() >= details.expiry {
            return Err(DarknodeError::Swap("swap expired".to_string()));
        }
        if secret.hash_lock() != details.hash {
            return Err(DarknodeError::Swap("secret does not match hash lock".to_string()));
        }
        *state = SwapState::Redeemed(details, secret.clone());
        Ok(())
    }

    async fn refund(&self) -> Result<(), DarknodeError> {
        let mut state = self.state.lock().await;
        let details = match &*state {
            SwapState::Initiated(details) => details.clone(),
            _ => return Err(DarknodeError::Swap("swap is not open".to_string())),
        };
        if (self.clock)() < details.expiry {
            return Err(DarknodeError::Swap("swap has not expired".to_string()));
        }
        *state = SwapState::Refunded(details);
        Ok(())
    }

    async fn data(&self) -> Result<Vec<u8>, DarknodeError> {
        let state = self.state.lock().await;
        let (name, details) = match &*state {
            SwapState::Empty => ("empty", None),
            SwapState::Initiated(d) => ("initiated", Some(d)),
            SwapState::Redeemed(d, _) => ("redeemed", Some(d)),
            SwapState::Refunded(d) => ("refunded", Some(d)),
        };
        Ok(bincode::serialize(&ContractData {
            ledger: self.ledger,
            state: name,
            details,
        })?)
    }
}

/// Parameters both legs of a swap agree on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SwapTerms {
    pub hash: [u8; 32],
    pub value: u128,
    pub expiry: u64,
}

impl SwapTerms {
    /// Terms for settling `delta`, or `None` if it is not a match.
    pub fn from_delta(delta: &Delta, secret: &SwapSecret, value: u128, expiry: u64) -> Option<Self> {
        if !delta.is_match() {
            return None;
        }
        Some(Self {
            hash: secret.hash_lock(),
            value,
            expiry,
        })
    }
}
