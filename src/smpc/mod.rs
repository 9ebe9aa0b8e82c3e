//! Secure multi-party computation of order matches.
//!
//! - **shamir**: secret sharing over the BLS12-381 scalar field
//! - **delta**: delta fragments and reconstructed deltas
//! - **computer**: the engine traits and the reference engine

pub mod computer;
pub mod delta;
pub mod shamir;

pub use computer::{ComputerFactory, Computer, ShamirComputers, SmpcEngine};
pub use delta::{Delta, DeltaFragment, DeltaId};
