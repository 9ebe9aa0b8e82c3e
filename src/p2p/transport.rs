//! In-process transport connecting the darknodes of a simulation
//!
//! Every directed link `(epoch, from, to)` is a byte stream carrying
//! length-prefixed frames, so computations cross the same codec they would
//! on a socket. Order fragments are queued per `(epoch, address)` until the
//! node's epoch process opens them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::io::{AsyncRead, DuplexStream};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::messages::{read_frame_bytes, write_frame, Computation};
use super::router::{PeerChannel, Router};
use crate::epoch::{Blockhash, Epoch};
use crate::error::DarknodeError;
use crate::identity::Address;
use crate::order::OrderFragment;

/// Buffer size of each simulated byte stream
const STREAM_BUFFER: usize = 64 * 1024;

type LinkKey = (Blockhash, Address, Address);

/// Both ends of the inbound queue of one directed link. Each end is handed
/// out once: the sender to the writer's pump, the receiver to the reader.
struct LinkSlot {
    tx: Option<mpsc::Sender<Computation>>,
    rx: Option<mpsc::Receiver<Computation>>,
}

struct OrderQueue {
    tx: mpsc::Sender<OrderFragment>,
    rx: Option<mpsc::Receiver<OrderFragment>>,
}

#[derive(Default)]
struct NetworkState {
    links: HashMap<LinkKey, LinkSlot>,
    orders: HashMap<(Blockhash, Address), OrderQueue>,
}

/// Shared medium all [`LocalRouter`]s of a simulation attach to.
#[derive(Clone)]
pub struct LocalNetwork {
    state: Arc<Mutex<NetworkState>>,
    capacity: usize,
}

impl LocalNetwork {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(NetworkState::default())),
            capacity: capacity.max(1),
        }
    }

    fn state(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Router through which `address` reaches the rest of the network.
    pub fn router(&self, address: Address) -> LocalRouter {
        LocalRouter {
            address,
            network: self.clone(),
        }
    }

    /// Queues an order fragment for `address` in `epoch`.
    pub fn submit_order(
        &self,
        epoch: &Epoch,
        address: &Address,
        fragment: OrderFragment,
    ) -> Result<(), DarknodeError> {
        let mut state = self.state();
        let queue = state.order_queue(epoch.blockhash, address, self.capacity);
        queue
            .tx
            .try_send(fragment)
            .map_err(|e| DarknodeError::Router(format!("cannot queue order for {}: {}", address, e)))
    }

    /// Closes the order queue of `address` in `epoch`, letting its epoch
    /// process drain.
    pub fn close_orders(&self, epoch: &Epoch, address: &Address) {
        let mut state = self.state();
        if let Some(queue) = state.orders.remove(&(epoch.blockhash, address.clone())) {
            drop(queue);
        }
    }

    /// Drops queues and unclaimed links of every epoch except `epoch`.
    pub fn retain_epoch(&self, epoch: &Epoch) {
        let mut state = self.state();
        state.links.retain(|(hash, _, _), _| *hash == epoch.blockhash);
        state.orders.retain(|(hash, _), _| *hash == epoch.blockhash);
    }

    fn open_link(
        &self,
        epoch: &Epoch,
        from: &Address,
        to: &Address,
    ) -> Result<(mpsc::Sender<Computation>, mpsc::Receiver<Computation>), DarknodeError> {
        let mut state = self.state();
        let outgoing = (epoch.blockhash, from.clone(), to.clone());
        let incoming = (epoch.blockhash, to.clone(), from.clone());

        let claimed = state
            .link(outgoing.clone(), self.capacity)
            .tx
            .is_none()
            || state.link(incoming.clone(), self.capacity).rx.is_none();
        if claimed {
            return Err(DarknodeError::Router(format!(
                "channel {} -> {} already open in epoch {}",
                from, to, epoch.ordinal
            )));
        }

        let deliver = state
            .link(outgoing.clone(), self.capacity)
            .tx
            .take()
            .ok_or_else(|| DarknodeError::Router("link sender missing".to_string()))?;
        let inbound = state
            .link(incoming.clone(), self.capacity)
            .rx
            .take()
            .ok_or_else(|| DarknodeError::Router("link receiver missing".to_string()))?;
        state.release(&outgoing);
        state.release(&incoming);
        Ok((deliver, inbound))
    }
}

impl NetworkState {
    fn link(&mut self, key: LinkKey, capacity: usize) -> &mut LinkSlot {
        self.links.entry(key).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(capacity);
            LinkSlot {
                tx: Some(tx),
                rx: Some(rx),
            }
        })
    }

    fn release(&mut self, key: &LinkKey) {
        if let Some(slot) = self.links.get(key) {
            if slot.tx.is_none() && slot.rx.is_none() {
                self.links.remove(key);
            }
        }
    }

    fn order_queue(&mut self, hash: Blockhash, address: &Address, capacity: usize) -> &mut OrderQueue {
        self.orders
            .entry((hash, address.clone()))
            .or_insert_with(|| {
                let (tx, rx) = mpsc::channel(capacity.max(1024));
                OrderQueue { tx, rx: Some(rx) }
            })
    }
}

/// One node's attachment to a [`LocalNetwork`].
#[derive(Clone)]
pub struct LocalRouter {
    address: Address,
    network: LocalNetwork,
}

#[async_trait]
impl Router for LocalRouter {
    async fn compute(
        &self,
        epoch: &Epoch,
        address: &Address,
        outbound: mpsc::Receiver<Computation>,
    ) -> Result<PeerChannel, DarknodeError> {
        let (deliver, inbound) = self.network.open_link(epoch, &self.address, address)?;
        let (errors_tx, errors) = mpsc::channel(self.network.capacity);
        debug!("link {} -> {} opened", self.address, address);
        tokio::spawn(pump(outbound, deliver, errors_tx, address.clone()));
        Ok(PeerChannel { inbound, errors })
    }

    fn open_orders(&self, epoch: &Epoch) -> mpsc::Receiver<OrderFragment> {
        let mut state = self.network.state();
        let queue = state.order_queue(epoch.blockhash, &self.address, self.network.capacity);
        match queue.rx.take() {
            Some(rx) => rx,
            None => {
                warn!("orders for {} in epoch {} already open", self.address, epoch.ordinal);
                let (_, rx) = mpsc::channel(1);
                rx
            }
        }
    }
}

/// Moves computations from `outbound` to the peer's inbound queue through a
/// framed byte stream. Ends when `outbound` closes or the peer stops reading.
async fn pump(
    mut outbound: mpsc::Receiver<Computation>,
    deliver: mpsc::Sender<Computation>,
    errors: mpsc::Sender<DarknodeError>,
    peer: Address,
) {
    let (mut writer, reader): (DuplexStream, DuplexStream) = tokio::io::duplex(STREAM_BUFFER);

    let write_errors = errors.clone();
    let write_half = async move {
        while let Some(computation) = outbound.recv().await {
            if let Err(e) = write_frame(&mut writer, &computation).await {
                let _ = write_errors.try_send(e);
                break;
            }
        }
    };

    let read_half = deliver_frames(reader, deliver, errors, peer);

    tokio::join!(write_half, read_half);
}

/// Decodes frames from `reader` into `deliver`. A frame that does not decode
/// is reported and skipped; a broken stream ends the link.
async fn deliver_frames<R: AsyncRead + Unpin>(
    mut reader: R,
    deliver: mpsc::Sender<Computation>,
    errors: mpsc::Sender<DarknodeError>,
    peer: Address,
) {
    loop {
        let data = match read_frame_bytes(&mut reader).await {
            Ok(Some(data)) => data,
            Ok(None) => break,
            Err(e) => {
                let _ = errors.try_send(e);
                break;
            }
        };
        let computation = match Computation::from_bytes(&data) {
            Ok(computation) => computation,
            Err(e) => {
                warn!("skipping undecodable frame from {}: {}", peer, e);
                let _ = errors.try_send(e);
                continue;
            }
        };
        if deliver.send(computation).await.is_err() {
            let _ = errors.try_send(DarknodeError::Router(format!("{} stopped reading", peer)));
            break;
        }
    }
    trace!("link to {} drained", peer);
}
