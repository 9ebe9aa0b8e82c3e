//! Peer-to-peer channels between the darknodes of a pool
//!
//! Each darknode opens one duplex channel per pool member (itself included)
//! at the start of every epoch. Computations travel as tagged frames:
//!
//! ```text
//! ┌──────────┐  Computation  ┌──────────┐
//! │ darknode ├──────────────▶│ darknode │
//! │    A     │◀──────────────┤    B     │
//! └──────────┘  Computation  └──────────┘
//! ```
//!
//! - **messages**: the `Computation` enum and its length-prefixed framing
//! - **router**: the `Router` trait through which channels are opened
//! - **transport**: an in-process network implementing `Router`

pub mod messages;
pub mod router;
pub mod transport;

pub use messages::{Computation, MAX_MESSAGE_SIZE};
pub use router::{PeerChannel, Router};
pub use transport::{LocalNetwork, LocalRouter};
