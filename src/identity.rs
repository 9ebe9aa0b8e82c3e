use std::fmt;

use blake2::{Blake2b512, Digest};
use serde::{Deserialize, Serialize};

pub const ID_LENGTH: usize = 32;

/// Blake2b-512 over the concatenated parts, truncated to 32 bytes.
pub fn hash32(parts: &[&[u8]]) -> [u8; ID_LENGTH] {
    let mut hasher = Blake2b512::new();
    for part in parts {
        hasher.update(part);
    }
    let digest = hasher.finalize();
    let mut out = [0u8; ID_LENGTH];
    out.copy_from_slice(&digest[..ID_LENGTH]);
    out
}

/// Identity of a darknode on the registry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub [u8; ID_LENGTH]);

impl NodeId {
    pub fn from_seed(seed: &[u8]) -> Self {
        Self(hash32(&[b"darknode/id", seed]))
    }

    pub fn as_bytes(&self) -> &[u8; ID_LENGTH] {
        &self.0
    }

    pub fn address(&self) -> Address {
        Address::from(self)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..4]))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(&self.0[..8]))
    }
}

/// Network address of a peer, the lowercase hex rendering of its node id.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(String);

impl Address {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&NodeId> for Address {
    fn from(id: &NodeId) -> Self {
        Self(hex::encode(id.0))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = self.0.get(..8).unwrap_or(&self.0);
        write!(f, "{}", short)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.0)
    }
}
