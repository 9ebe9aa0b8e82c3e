//! Darknode
//!
//! Epoch coordination for darknodes: peers that jointly compute confidential
//! order matches with threshold secret sharing and settle matches with
//! cross-chain atomic swaps.
//!
//! ## Overview
//!
//! Darknodes are registered on an external registry that defines epochs.
//! Every epoch the registered nodes are partitioned into pools. The nodes of a
//! pool hold Shamir shares of the orders routed to it and exchange delta
//! fragments until any `k` of `n` of them can reconstruct whether a buy order
//! and a sell order cross.
//!
//! ## Key Components
//!
//! - **Watcher**: detects epoch boundaries on the registry
//! - **Epoch process**: opens channels with the pool and drives the fragment
//!   exchange around the SMPC engine, tolerating slow and absent peers
//! - **Switcher**: routes order fragments to the process serving the current epoch
//! - **Atom**: hash-time-locked swap contracts used to settle matches
//!
//! ## Example
//!
//! ```rust
//! use ark_bls12_381::Fr;
//! use darknode::smpc::shamir;
//! use darknode::threshold::threshold;
//!
//! let mut rng = ark_std::test_rng();
//! let n = 4;
//! let k = threshold(n);
//! assert_eq!(k, 3);
//!
//! let shares = shamir::split(Fr::from(1_000u64), n, k, &mut rng).unwrap();
//! assert_eq!(shamir::join(&shares[1..]).unwrap(), Fr::from(1_000u64));
//! ```

pub mod atom;
pub mod cancel;
pub mod config;
pub mod epoch;
pub mod epoch_process;
pub mod error;
pub mod identity;
pub mod node;
pub mod order;
pub mod p2p;
pub mod pool;
pub mod registry;
pub mod smpc;
pub mod switcher;
pub mod threshold;
pub mod watcher;

pub use error::DarknodeError;
