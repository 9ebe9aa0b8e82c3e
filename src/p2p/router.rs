use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::epoch::Epoch;
use crate::error::DarknodeError;
use crate::identity::Address;
use crate::order::OrderFragment;
use crate::p2p::messages::Computation;

/// Receiving half of a duplex channel with one peer.
#[derive(Debug)]
pub struct PeerChannel {
    /// Computations sent by the peer, in the order it sent them.
    pub inbound: mpsc::Receiver<Computation>,
    /// Non-fatal transport errors for this peer.
    pub errors: mpsc::Receiver<DarknodeError>,
}

/// Establishes per-peer channels for an epoch.
#[async_trait]
pub trait Router: Send + Sync {
    /// Opens a duplex channel with `address`. The router drains `outbound`
    /// towards the peer until every sender of it is dropped.
    async fn compute(
        &self,
        epoch: &Epoch,
        address: &Address,
        outbound: mpsc::Receiver<Computation>,
    ) -> Result<PeerChannel, DarknodeError>;

    /// Order fragments addressed to this node for `epoch`.
    fn open_orders(&self, epoch: &Epoch) -> mpsc::Receiver<OrderFragment>;
}
